// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reminder pipeline: a fixed set of context-injection checks run at the
//! top of every turn, before the model is called.
//!
//! Each reminder is a plain function over the current [`Session`] (plus
//! whatever small amount of external state it needs — the live todo list,
//! the project root). A reminder never mutates `session.messages` directly;
//! [`run_reminder_pipeline`] collects what each one returns and the caller
//! pushes the messages onto history in order, exactly like any other turn
//! input.
//!
//! Reminders are rendered as `<system-reminder>` blocks inside a `User`
//! message rather than a dedicated role, since the wire protocol this crate
//! targets (OpenAI/Anthropic/Gemini/Bedrock/Cohere, all via `ModelProvider`)
//! has no separate "developer" turn type.

use std::path::{Path, PathBuf};

use sven_model::{Message, MessageContent, Role};
use sven_tools::events::TodoItem;

use crate::session::Session;

/// Turns a reminder stays silent after firing once.
const REMINDER_COOLDOWN_TURNS: u32 = 3;
/// How many non-todo tool calls, walking backwards, before todo staleness fires.
const TODO_STALE_LOOKBACK: usize = 10;

/// Run the fixed reminder pipeline in order and return the messages to
/// append to history before the next model call.
///
/// `todos` is a snapshot of the live todo list (shared with `TodoWriteTool`);
/// `project_root` is the detected project root, used to resolve `@file`
/// mentions and project-local memory files.
pub fn run_reminder_pipeline(
    session: &mut Session,
    todos: &[TodoItem],
    project_root: Option<&Path>,
) -> Vec<Message> {
    let mut out = Vec::new();
    out.extend(empty_todo_reminder(session, todos));
    out.extend(todo_not_used_recently_reminder(session, todos));
    out.extend(memory_reminder(session, project_root));
    out.extend(last_path_memory_reminder(session, project_root));
    out.extend(file_changed_externally_reminder(session));
    out.extend(at_file_reader_reminder(session, project_root));
    out.extend(clipboard_image_reminder(session));
    out
}

fn reminder_message(body: impl Into<String>) -> Message {
    Message::user(format!("<system-reminder>\n{}\n</system-reminder>", body.into()))
}

fn todo_list_done_or_empty(todos: &[TodoItem]) -> bool {
    todos.is_empty() || todos.iter().all(|t| t.status == "completed")
}

fn format_todos_markdown(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "(no todos)".to_string();
    }
    todos
        .iter()
        .map(|t| format!("- [{}] {}", t.status, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fires when the todo list is empty or fully resolved, subject to a
/// 3-turn cooldown so it doesn't repeat every turn while the agent is
/// between tasks.
fn empty_todo_reminder(session: &mut Session, todos: &[TodoItem]) -> Option<Message> {
    if !todo_list_done_or_empty(todos) {
        return None;
    }
    if session.empty_todo_cooldown > 0 {
        session.empty_todo_cooldown -= 1;
        return None;
    }
    session.empty_todo_cooldown = REMINDER_COOLDOWN_TURNS;
    Some(reminder_message(
        "Your todo list is empty or fully completed. If there is remaining \
         multi-step work, call TodoWrite to plan it before continuing.",
    ))
}

/// Fires when at least `TODO_STALE_LOOKBACK` tool calls have happened since
/// the last `TodoWrite`, while the todo list is non-empty and not all done.
/// Same cooldown state machine as `empty_todo_reminder`, independent counter.
fn todo_not_used_recently_reminder(session: &mut Session, todos: &[TodoItem]) -> Option<Message> {
    if todo_list_done_or_empty(todos) {
        return None;
    }

    let mut count = 0usize;
    let mut used_recently = false;
    for msg in session.messages.iter().rev() {
        if let MessageContent::ToolCall { function, .. } = &msg.content {
            if function.name == "todo_write" {
                used_recently = true;
                break;
            }
            count += 1;
            if count >= TODO_STALE_LOOKBACK {
                break;
            }
        }
    }

    if used_recently || count < TODO_STALE_LOOKBACK {
        return None;
    }

    if session.todo_not_used_cooldown > 0 {
        session.todo_not_used_cooldown -= 1;
        return None;
    }
    session.todo_not_used_cooldown = REMINDER_COOLDOWN_TURNS;
    Some(reminder_message(format!(
        "You have not called TodoWrite in the last {} tool calls. Current todos:\n{}",
        TODO_STALE_LOOKBACK,
        format_todos_markdown(todos)
    )))
}

/// Standard memory file search order. Global files first, then project-local.
fn memory_file_candidates(project_root: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".claude").join("CLAUDE.md"));
        candidates.push(home.join(".codex").join("AGENTS.md"));
    }
    if let Some(root) = project_root {
        candidates.push(root.join("AGENTS.md"));
        candidates.push(root.join("AGENT.md"));
        candidates.push(root.join("CLAUDE.md"));
    }
    candidates
}

/// Loads each not-yet-loaded standard memory file, once per session.
fn memory_reminder(session: &mut Session, project_root: Option<&Path>) -> Option<Message> {
    let mut sections = Vec::new();
    for path in memory_file_candidates(project_root) {
        if session.loaded_memory.contains(&path) {
            continue;
        }
        session.loaded_memory.insert(path.clone());
        if let Ok(content) = std::fs::read_to_string(&path) {
            sections.push(format!("## {}\n{}", path.display(), content));
        }
    }
    if sections.is_empty() {
        return None;
    }
    Some(reminder_message(format!(
        "#claudeMd\n#important-instruction-reminders\n\n{}",
        sections.join("\n\n")
    )))
}

/// Extracts `file_path` arguments from Read/Edit/MultiEdit/Write tool calls
/// made since the last assistant text turn.
fn recent_referenced_paths(session: &Session) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for msg in session.messages.iter().rev() {
        match &msg.content {
            MessageContent::Text(_) if msg.role == Role::Assistant => break,
            MessageContent::ToolCall { function, .. } => {
                if !matches!(
                    function.name.as_str(),
                    "read" | "edit" | "multi_edit" | "write"
                ) {
                    continue;
                }
                if let Ok(args) = serde_json::from_str::<serde_json::Value>(&function.arguments) {
                    if let Some(p) = args.get("file_path").and_then(|v| v.as_str()) {
                        paths.push(PathBuf::from(p));
                    }
                }
            }
            _ => {}
        }
    }
    paths
}

/// Walks every directory level from `root` down to each referenced path's
/// parent, loading any not-yet-loaded `CLAUDE.md`/`AGENTS.md`/`AGENT.md`
/// found along the way.
fn last_path_memory_reminder(session: &mut Session, project_root: Option<&Path>) -> Option<Message> {
    let root = project_root?;
    let referenced = recent_referenced_paths(session);
    if referenced.is_empty() {
        return None;
    }

    let mut sections = Vec::new();
    for path in referenced {
        let Some(parent) = path.parent() else { continue };
        let Ok(rel) = parent.strip_prefix(root) else { continue };
        let mut dir = root.to_path_buf();
        for component in rel.components() {
            dir.push(component);
            for name in ["CLAUDE.md", "AGENTS.md", "AGENT.md"] {
                let candidate = dir.join(name);
                if session.loaded_memory.contains(&candidate) {
                    continue;
                }
                session.loaded_memory.insert(candidate.clone());
                if let Ok(content) = std::fs::read_to_string(&candidate) {
                    sections.push(format!("## {}\n{}", candidate.display(), content));
                }
            }
        }
    }

    if sections.is_empty() {
        return None;
    }
    Some(reminder_message(sections.join("\n\n")))
}

/// Re-reads any tracked file whose on-disk mtime has advanced since it was
/// last read or written this session.
fn file_changed_externally_reminder(session: &mut Session) -> Option<Message> {
    let mut sections = Vec::new();
    let tracked: Vec<PathBuf> = session.file_tracker.keys().cloned().collect();
    for path in tracked {
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let Ok(mtime) = meta.modified() else { continue };
        let stale = session
            .file_tracker
            .get(&path)
            .map(|tracked_mtime| mtime > *tracked_mtime)
            .unwrap_or(false);
        if !stale {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&path) {
            session.file_tracker.insert(path.clone(), mtime);
            sections.push(format!("## {} (changed on disk)\n{}", path.display(), content));
        }
    }
    if sections.is_empty() {
        return None;
    }
    Some(reminder_message(sections.join("\n\n")))
}

/// The text of the most recent user turn, used by `@file`-mention parsing
/// and clipboard-image detection. Returns `None` once a tool result has
/// already been appended after it (the mention is considered "consumed").
fn last_new_user_input(session: &Session) -> Option<&str> {
    for msg in session.messages.iter().rev() {
        match (&msg.role, &msg.content) {
            (Role::User, MessageContent::Text(t)) => return Some(t.as_str()),
            (Role::Tool, _) => return None,
            (_, MessageContent::ToolResult { .. }) => return None,
            _ => continue,
        }
    }
    None
}

fn at_mention_tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|tok| tok.strip_prefix('@'))
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.to_lowercase())
        .collect()
}

/// Reads (or lists) every `@path` mention in the last user turn.
fn at_file_reader_reminder(session: &mut Session, project_root: Option<&Path>) -> Option<Message> {
    let text = last_new_user_input(session)?.to_string();
    let tokens = at_mention_tokens(&text);
    if tokens.is_empty() {
        return None;
    }

    let base = project_root.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let mut sections = Vec::new();
    for tok in tokens {
        let path = base.join(&tok);
        if path.is_file() {
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    if let Ok(meta) = std::fs::metadata(&path) {
                        if let Ok(mtime) = meta.modified() {
                            session.file_tracker.insert(path.clone(), mtime);
                        }
                    }
                    sections.push(format!(
                        "Called the Read tool with the following input: {{\"file_path\": \"{}\"}}\n\
                         Result of calling the Read tool:\n{}",
                        path.display(),
                        content
                    ));
                }
                Err(e) => sections.push(format!(
                    "Called the Read tool with the following input: {{\"file_path\": \"{}\"}}\n\
                     Result of calling the Read tool: error: {e}",
                    path.display()
                )),
            }
        } else if path.is_dir() {
            let listing = std::fs::read_dir(&path)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            sections.push(format!(
                "Called the ListDirectory tool with the following input: {{\"path\": \"{}\"}}\n\
                 Result of calling the ListDirectory tool:\n{}",
                path.display(),
                listing
            ));
        }
    }

    if sections.is_empty() {
        return None;
    }
    Some(reminder_message(sections.join("\n\n")))
}

/// Detects a `[Image #N]` placeholder in the last user turn.
///
/// This crate has no clipboard-manifest collaborator (the manifest format
/// and its writer live outside this crate's Non-goals boundary), so this
/// always resolves to `None` once the placeholder check passes — there is
/// no manifest to resolve tags against. Kept as a named reminder stage so
/// the fixed pipeline order and shape match the rest of the pack, and so a
/// future manifest integration has a single place to plug into.
fn clipboard_image_reminder(session: &Session) -> Option<Message> {
    let text = last_new_user_input(session)?;
    if !text.contains("[Image #") {
        return None;
    }
    None
}
