// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;
use uuid::Uuid;

/// Identifies a session as belonging to a sub-agent spawned by a `task`
/// tool call, and carries the parameters it was spawned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentState {
    /// Operating mode the sub-agent was spawned in ("research", "plan", "agent").
    pub kind: String,
    /// Short human-readable description of the delegated task.
    pub description: String,
    /// The prompt the sub-agent was given.
    pub prompt: String,
}

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens the active model will produce in one turn.
    /// Subtracted from `max_tokens` when computing `input_budget()` so a
    /// full-length completion never overflows the context window.
    pub max_output_tokens: usize,
    /// Token cost of tool schemas + dynamic context, recomputed every turn
    /// by `estimate_schema_overhead` since neither is stored in `messages`.
    pub schema_overhead: usize,
    /// Running correction factor applied to the chars/4 token estimate,
    /// updated from the provider's actual reported `input_tokens` each turn.
    pub calibration_factor: f32,
    /// Total cache-read tokens reported by the provider across the session.
    pub cache_read_total: u32,
    /// Total cache-write tokens reported by the provider across the session.
    pub cache_write_total: u32,
    /// Cooldown counter for `empty_todo_reminder`. Non-persisted.
    pub empty_todo_cooldown: u32,
    /// Cooldown counter for `todo_not_used_recently_reminder`. Non-persisted.
    pub todo_not_used_cooldown: u32,
    /// Memory files (CLAUDE.md / AGENTS.md / AGENT.md) already loaded into
    /// history this session, so `memory_reminder` and `last_path_memory_reminder`
    /// never load the same file twice.
    pub loaded_memory: HashSet<PathBuf>,
    /// Mtime of every file read or written this session, used by
    /// `file_changed_externally_reminder` to detect out-of-band edits.
    pub file_tracker: HashMap<PathBuf, SystemTime>,
    /// `None` for a root session. `Some(..)` marks this as a sub-agent
    /// session spawned by a `task` tool call; such sessions are not
    /// enumerated in the resume session list but are linked from their
    /// parent.
    pub sub_agent_state: Option<SubAgentState>,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
            empty_todo_cooldown: 0,
            todo_not_used_cooldown: 0,
            loaded_memory: HashSet::new(),
            file_tracker: HashMap::new(),
            sub_agent_state: None,
        }
    }

    /// A session is root iff it has no `sub_agent_state`.
    pub fn is_root(&self) -> bool {
        self.sub_agent_state.is_none()
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Tokens available for the next request's input: the context window
    /// minus the room reserved for the model's own completion.  Zero when
    /// `max_tokens` has not been set (e.g. provider catalog lookup failed),
    /// which callers treat as "budget checks disabled".
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Record provider-reported cache statistics for one turn into the
    /// session-wide running totals.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read;
        self.cache_write_total += cache_write;
    }

    /// Update `calibration_factor` from one turn's actual vs. estimated input
    /// token count.  `calibration_factor = actual / estimated`, clamped to a
    /// sane range so a single noisy sample can't send future estimates wild.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let ratio = actual_input as f32 / estimated as f32;
        self.calibration_factor = ratio.clamp(0.25, 4.0);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
