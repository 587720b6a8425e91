// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
#![allow(dead_code)]
//! Slash commands backed by discovered skills and subagents.
//!
//! Two families of markdown file become slash commands through this module:
//! - `commands/*.md` (e.g. `.cursor/commands/`), parsed upstream into
//!   [`sven_runtime::SkillInfo`] — [`make_command_slash_commands`].
//! - `agents/*.md` subagent definitions, parsed upstream into
//!   [`sven_runtime::AgentInfo`] — [`make_agent_slash_commands`].
//!
//! In both cases `execute` just forwards the file's content (plus any typed
//! arguments) as the message to send; the agent does the actual work.

use std::path::Path;

use sven_runtime::{AgentInfo, SkillInfo};

use crate::commands::{
    CommandArgument, CommandContext, CommandResult, CompletionItem, SlashCommand,
};

/// A slash command backed by a discovered skill/command markdown file or a
/// subagent definition.
pub struct SkillCommand {
    pub name: String,
    pub description: String,
    /// Body injected into the user message when the command runs (the
    /// command/skill markdown content, or the subagent's instructions).
    pub content: String,
    /// Model to switch to for the duration of this command, if the source
    /// frontmatter named one (subagents only).
    pub model_override: Option<String>,
}

impl SlashCommand for SkillCommand {
    fn name(&self) -> &str { &self.name }

    fn description(&self) -> &str { &self.description }

    fn arguments(&self) -> Vec<CommandArgument> {
        vec![CommandArgument::optional("args", "Extra text appended after the command body")]
    }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, args: Vec<String>, _ctx: &CommandContext) -> CommandResult {
        let message = if args.is_empty() {
            self.content.clone()
        } else {
            format!("{}\n\n{}", self.content, args.join(" "))
        };
        CommandResult {
            message_to_send: Some(message),
            model_override: self.model_override.clone(),
            ..Default::default()
        }
    }
}

/// Turn discovered user commands into slash commands.
///
/// The command name mirrors [`SkillInfo::command`] (already derived from the
/// file's path relative to its commands root, per the Cursor convention).
pub fn make_command_slash_commands(commands: &[SkillInfo]) -> Vec<SkillCommand> {
    commands
        .iter()
        .map(|c| SkillCommand {
            name: c.command.clone(),
            description: c.description.clone(),
            content: c.content.clone(),
            model_override: None,
        })
        .collect()
}

/// Turn discovered subagents into slash commands that delegate to them.
///
/// The command name is the agent's name, lowercased, with hyphens preserved
/// (e.g. `security-auditor` -> `/security-auditor`). Frontmatter model
/// overrides are forwarded via [`CommandResult::model_override`].
pub fn make_agent_slash_commands(agents: &[AgentInfo]) -> Vec<SkillCommand> {
    agents
        .iter()
        .map(|a| SkillCommand {
            name: a.name.to_lowercase(),
            description: a.description.clone(),
            content: a.content.clone(),
            model_override: a.model.clone(),
        })
        .collect()
}

/// Scan `skills_dir` for skill commands.
///
/// **Currently returns an empty vec** (stub implementation) — skills are
/// auto-loaded into the agent's context directly rather than exposed as
/// slash commands; see the module-level docs for the two families that are.
pub async fn discover_skills(_skills_dir: &Path) -> Vec<SkillCommand> {
    vec![]
}
