// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wraps a [`Tool`] with the read-before-write / externally-modified safety
//! gate, without requiring every file tool to carry its own tracker field.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::file_tracker::FileTracker;
use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};
use sven_config::AgentMode;

/// What a tracked tool does to the path it's given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackKind {
    /// Reads the file; marks it as seen so later mutations are allowed.
    Read,
    /// Mutates an existing file; gated unless the file was read first (or
    /// does not exist yet, e.g. `write` creating a brand-new file).
    Write,
}

/// Decorator that gates a file-mutating (or file-reading) tool through a
/// shared [`FileTracker`].  All [`Tool`] methods besides `execute` delegate
/// to the wrapped tool unchanged.
pub struct TrackedTool<T: Tool> {
    inner: T,
    tracker: Arc<FileTracker>,
    kind: TrackKind,
}

impl<T: Tool> TrackedTool<T> {
    /// Wrap a tool that reads a file at `args["path"]`; every successful
    /// read marks the path as tracked.
    pub fn read(inner: T, tracker: Arc<FileTracker>) -> Self {
        Self { inner, tracker, kind: TrackKind::Read }
    }

    /// Wrap a tool that mutates a file at `args["path"]`; the mutation is
    /// refused unless the file was tracked (read) first, or does not yet
    /// exist on disk (tool is creating it).  A successful mutation re-marks
    /// the path as tracked with its new mtime.
    pub fn write(inner: T, tracker: Arc<FileTracker>) -> Self {
        Self { inner, tracker, kind: TrackKind::Write }
    }
}

#[async_trait]
impl<T: Tool> Tool for TrackedTool<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn description(&self) -> &str {
        self.inner.description()
    }
    fn parameters_schema(&self) -> Value {
        self.inner.parameters_schema()
    }
    fn default_policy(&self) -> ApprovalPolicy {
        self.inner.default_policy()
    }
    fn modes(&self) -> &[AgentMode] {
        self.inner.modes()
    }
    fn output_category(&self) -> OutputCategory {
        self.inner.output_category()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = call.args.get("path").and_then(|v| v.as_str()).map(str::to_string);

        if self.kind == TrackKind::Write {
            if let Some(path) = &path {
                // A tool creating a brand-new file needs no prior read.
                if FileTracker::exists(path) {
                    if let Err(msg) = self.tracker.check_writable(path) {
                        return ToolOutput::err(&call.id, msg);
                    }
                }
            }
        }

        let output = self.inner.execute(call).await;

        if !output.is_error {
            if let Some(path) = &path {
                self.tracker.mark_read(path);
            }
        }

        output
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOutput;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeRead;
    #[async_trait]
    impl Tool for FakeRead {
        fn name(&self) -> &str { "fake_read" }
        fn description(&self) -> &str { "d" }
        fn parameters_schema(&self) -> Value { json!({}) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "read ok")
        }
    }

    struct FakeWrite;
    #[async_trait]
    impl Tool for FakeWrite {
        fn name(&self) -> &str { "fake_write" }
        fn description(&self) -> &str { "d" }
        fn parameters_schema(&self) -> Value { json!({}) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "write ok")
        }
    }

    fn tmp_path(name: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/sven_tracked_tool_test_{}_{n}_{name}", std::process::id())
    }

    #[tokio::test]
    async fn read_tool_marks_path_tracked() {
        let path = tmp_path("a.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = Arc::new(FileTracker::new());
        let t = TrackedTool::read(FakeRead, tracker.clone());
        let call = ToolCall { id: "1".into(), name: "fake_read".into(), args: json!({"path": path.clone()}) };
        let out = t.execute(&call).await;
        assert!(!out.is_error);
        assert!(!tracker.is_untracked(&path));
    }

    #[tokio::test]
    async fn write_tool_rejects_untracked_existing_file() {
        let path = tmp_path("b.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = Arc::new(FileTracker::new());
        let t = TrackedTool::write(FakeWrite, tracker);
        let call = ToolCall { id: "1".into(), name: "fake_write".into(), args: json!({"path": path}) };
        let out = t.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("has not been read"));
    }

    #[tokio::test]
    async fn write_tool_allows_new_file_creation() {
        let path = tmp_path("new.txt"); // does not exist yet
        let tracker = Arc::new(FileTracker::new());
        let t = TrackedTool::write(FakeWrite, tracker);
        let call = ToolCall { id: "1".into(), name: "fake_write".into(), args: json!({"path": path}) };
        let out = t.execute(&call).await;
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn write_tool_allows_after_prior_read() {
        let path = tmp_path("c.txt");
        std::fs::write(&path, "hi").unwrap();
        let tracker = Arc::new(FileTracker::new());
        tracker.mark_read(&path);
        let t = TrackedTool::write(FakeWrite, tracker);
        let call = ToolCall { id: "1".into(), name: "fake_write".into(), args: json!({"path": path}) };
        let out = t.execute(&call).await;
        assert!(!out.is_error);
    }
}
