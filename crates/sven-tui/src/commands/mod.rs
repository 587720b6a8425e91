// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash command system for the interactive TUI.
//!
//! Commands are invoked by typing `/command [args]` in the input box.
//! The system is designed to be extensible: built-in commands (help, clear,
//! model, export, status, debug, cost, quit) are registered at startup;
//! SKILL.md-based and subagent-based commands are discovered and registered
//! the same way.

pub mod builtin;
pub mod completion;
pub mod mcp;
pub mod parser;
pub mod registry;
pub mod skill;

pub use completion::{CompletionItem, CompletionManager};
pub use parser::{parse, ParsedCommand};
pub use registry::CommandRegistry;

use sven_config::{AgentMode, Config};
use std::path::PathBuf;
use std::sync::Arc;

// ── Context ───────────────────────────────────────────────────────────────────

/// Context passed to commands when generating completions and when executing.
///
/// Provides read-only access to configuration and current session state.
/// Does not include mutable app state — commands return effects via
/// [`CommandResult`] rather than mutating state directly.
#[allow(dead_code)]
pub struct CommandContext {
    pub config: Arc<Config>,
    /// Provider of the currently active model (e.g. `"openai"`).
    /// Available to commands that want to highlight the active model in completions.
    pub current_model_provider: String,
    /// Name of the currently active model (e.g. `"gpt-4o"`).
    /// Available to commands that want to highlight the active model in completions.
    pub current_model_name: String,
    /// Agent mode in effect for the next message.
    pub current_mode: AgentMode,
    /// Context-window usage percentage from the last completed turn.
    pub context_pct: u8,
    /// Prompt-cache hit rate from the last completed turn.
    pub cache_hit_pct: u8,
    /// Aggregated usage/status metadata from the most recently completed
    /// task, or `None` before the first turn finishes.
    pub last_metadata: Option<sven_core::TaskMetadata>,
    /// Path the conversation is currently auto-saved to, if any.
    pub history_path: Option<PathBuf>,
    /// `(name, description)` for every registered slash command, sorted by
    /// name.  Used by `/help` to render its listing without needing its own
    /// reference to the registry.
    pub available_commands: Vec<(String, String)>,
}

// ── Results ───────────────────────────────────────────────────────────────────

/// The effect(s) a command wants to produce when executed.
///
/// Commands do not mutate app state directly; they return this struct and the
/// app applies each effect.  This keeps commands stateless and testable.
#[derive(Debug, Default)]
pub struct CommandResult {
    /// Override the model for the next queued message (e.g. `"anthropic/claude-opus-4-6"`).
    pub model_override: Option<String>,

    /// Override the agent mode for the next queued message.
    pub mode_override: Option<AgentMode>,

    /// If set, the command wants to send this text as the user message.
    /// If `None` the command only updates overrides and sends nothing.
    pub message_to_send: Option<String>,

    /// If set, triggers an immediate side-effect in the app (e.g. quit).
    pub immediate_action: Option<ImmediateAction>,

    /// Operator-facing text to display in the chat pane as a
    /// [`crate::chat::segment::ChatSegment::Info`] entry.  Used by commands
    /// that report back to the user without sending anything to the model
    /// (`/help`, `/status`, `/debug`, `/cost`).
    pub output: Option<String>,
}

/// Side-effects that must be handled by the app immediately (before queuing).
#[derive(Debug)]
pub enum ImmediateAction {
    /// Terminate the event loop.
    Quit,
    /// Reset the chat view and the agent's session history.
    ClearChat,
    /// Write the current conversation to disk. `Some(path)` overrides the
    /// default export location.
    Export(Option<String>),
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// A slash command that can be invoked from the input box.
///
/// Implementations must be `Send + Sync` so they can be stored in the
/// registry behind an `Arc`.
pub trait SlashCommand: Send + Sync {
    /// The command keyword used after `/` (e.g. `"model"` for `/model`).
    fn name(&self) -> &str;

    /// One-line description shown in completion list and help.
    fn description(&self) -> &str;

    /// Metadata about expected arguments.
    ///
    /// Used for help text generation and future shell-completion export.
    /// Not called by the completion engine itself.
    #[allow(dead_code)]
    fn arguments(&self) -> Vec<CommandArgument> {
        vec![]
    }

    /// Generate completions for the argument at `arg_index` given `partial`
    /// text typed so far.
    ///
    /// `arg_index = 0` means the first argument after the command name.
    /// Implementations should return an empty vec when no completions apply.
    ///
    /// The default implementation returns an empty vec (no completions).
    fn complete(&self, arg_index: usize, partial: &str, ctx: &CommandContext) -> Vec<CompletionItem>;

    /// Execute the command with the given arguments.
    ///
    /// Returns a [`CommandResult`] describing the effects to apply. Takes the
    /// same read-only [`CommandContext`] as [`complete`](Self::complete) so
    /// commands that report back to the user (`/help`, `/status`, `/debug`,
    /// `/cost`) can do so without the app special-casing them.
    fn execute(&self, args: Vec<String>, ctx: &CommandContext) -> CommandResult;
}

// ── Argument metadata ─────────────────────────────────────────────────────────

/// Describes one argument expected by a slash command.
///
/// Returned by [`SlashCommand::arguments`] and used for help text generation,
/// argument count validation, and future shell-completion export.
/// Not all fields are used yet; they are part of the extension-ready API.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct CommandArgument {
    /// Short name shown in usage hint (e.g. `"model"`).
    pub name: &'static str,
    /// Brief description.
    pub description: &'static str,
    /// Whether the command requires this argument to be present.
    pub required: bool,
}

impl CommandArgument {
    #[allow(dead_code)]
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self { name, description, required: true }
    }

    #[allow(dead_code)]
    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self { name, description, required: false }
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Parse and execute a slash command typed by the user.
///
/// `text` must start with `/`; the first token is the command name, the rest
/// are its arguments (quoted substrings are kept together, matching
/// [`parser::tokenise`]). Returns `None` when `text` is not a slash command
/// at all, or when the command name is not registered — both cases fall
/// through to the plain-text send path in the caller.
pub fn dispatch_command(
    text: &str,
    registry: &CommandRegistry,
    ctx: &CommandContext,
) -> Option<(String, CommandResult)> {
    let body = text.strip_prefix('/')?;
    let tokens = parser::tokenise(body);
    let (name, args) = tokens.split_first()?;
    let cmd = registry.get(name)?;
    Some((name.clone(), cmd.execute(args.to_vec(), ctx)))
}

/// Build a minimal [`CommandContext`] for unit tests that only exercise
/// `execute`/`complete` and don't care about its exact contents.
#[cfg(test)]
pub(crate) fn test_context() -> CommandContext {
    CommandContext {
        config: Arc::new(Config::default()),
        current_model_provider: "openai".into(),
        current_model_name: "gpt-4o".into(),
        current_mode: AgentMode::Agent,
        context_pct: 0,
        cache_hit_pct: 0,
        last_metadata: None,
        history_path: None,
        available_commands: vec![],
    }
}
