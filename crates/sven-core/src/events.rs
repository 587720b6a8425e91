// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_config::AgentMode;
use sven_tools::{events::TodoItem, ToolCall};

/// Which compaction path produced a `ContextCompacted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// Rolling LLM summarization that preserves section structure.
    Structured,
    /// Rolling LLM summarization as a free-form narrative.
    Narrative,
    /// Old messages dropped without a model call (compaction prompt itself
    /// would have overflowed the budget).
    Emergency,
}

/// Aggregated usage/status metadata for one completed task (a user input and
/// every turn it took to answer it), merged across turns per the rules:
/// token counters sum, `context_usage_percent` is last-wins, first-token
/// latency is the minimum observed, throughput is a weighted average by each
/// turn's output-token count, and `model_name`/`response_id`/`provider`/
/// `status`/`error_reason` are all last-wins.
#[derive(Debug, Clone, Default)]
pub struct TaskMetadata {
    pub input_tokens: u64,
    pub cached_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Fraction (0.0–1.0) of the context window in use after the last turn.
    pub context_usage_percent: f32,
    /// Best (lowest) time-to-first-token observed across the task's turns,
    /// measured from the model request being issued to the first stream item
    /// other than the initial connection being opened.
    pub first_token_latency_ms: Option<u64>,
    /// Output tokens per second, weighted across turns by each turn's
    /// output-token count. `None` when no turn reported output tokens.
    pub throughput_tps: Option<f32>,
    pub model_name: String,
    pub provider: String,
    /// Opaque provider turn identifier, when one was reported (most native
    /// providers report this as part of stream completion; OpenAI-compatible
    /// gateways typically do not).
    pub response_id: Option<String>,
    pub status: TaskStatus,
    pub error_reason: Option<String>,
    pub task_duration_s: f32,
    pub turn_count: u32,
}

/// Final disposition of a task, mirrored 1:1 from the stop reason of its
/// last turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Completed,
    Length,
    ToolUse,
    Error,
    Aborted,
}

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// Loop round at which compaction fired (0 = proactive, pre-submit).
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        context_total: usize,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens across the whole session.
        cache_read_total: u32,
        /// Running total of cache-write tokens across the whole session.
        cache_write_total: u32,
        /// Context window size for the active model.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The current task was cancelled mid-stream; whatever text had already
    /// been produced is carried here and was committed to history as a
    /// partial assistant message.
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// Cross-turn aggregated usage/status metadata for the task that just
    /// finished, emitted once after the outer loop breaks (normal
    /// completion, retry exhaustion, or the tool-round ceiling wrap-up).
    /// Distinct from the per-turn `TokenUsage` event, which consumers use for
    /// live status-bar updates.
    ResponseMetadata(TaskMetadata),
}
