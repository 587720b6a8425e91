// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Executor — a single-writer event loop that owns one [`Agent`] per
//! session, processes queued [`Operation`]s, and spawns a background task
//! per `UserInput` so that `Interrupt` submissions can be accepted while a
//! turn is inflight.
//!
//! Grounded on the agent task loop every frontend currently hand-rolls
//! (`sven-tui/src/agent.rs`'s `agent_task`, `sven-ci`'s headless runner) and
//! on `task_tool.rs`'s sub-agent spawn pattern (own `Agent`, own cancel
//! channel, stream events back to the caller). This module gives that
//! pattern one formal, reusable shape: an [`Operation`] sum type queued as
//! `{id, operation}` [`Submission`]s, and an [`Executor`] that drains the
//! queue and keys its agent instances and inflight tasks by session id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use sven_config::Config;
use sven_core::{Agent, AgentEvent};
use sven_model::ContentPart;

/// One pending or completed `UserInput` run, tracked so `Interrupt` can
/// cancel it and so the executor knows which sessions are busy.
struct ActiveTask {
    handle: JoinHandle<()>,
    session_id: String,
}

/// A sum type queued into the [`Executor`].
///
/// Mirrors the reference control surface: session lifecycle (`Init`), the
/// normal message flow (`UserInput`), interrupt propagation (`Interrupt`),
/// live model swaps (`ChangeModel`), and graceful shutdown (`End`).
#[derive(Debug)]
pub enum Operation {
    /// Mark a session ready. The agent for `session_id` must already have
    /// been registered via [`Executor::install_agent`] — replaying history
    /// onto the frontend's own view is the frontend's responsibility (it
    /// owns the on-disk session store), so `Init` itself has no side effect
    /// beyond the presence check below.
    Init { session_id: String },
    /// Submit a new user message for `session_id`.
    UserInput {
        session_id: String,
        text: String,
        images: Option<Vec<ContentPart>>,
    },
    /// Cancel the inflight task for `target_session_id`, or every inflight
    /// task when `None`.
    Interrupt { target_session_id: Option<String> },
    /// Swap the active model for `session_id`. History is preserved.
    ChangeModel { session_id: String, model_name: String },
    /// Stop [`Executor::run_loop`] after this submission is processed.
    End,
}

/// One `{id, operation}` pair enqueued into the executor's submission queue.
///
/// `id` is the unit the executor's `active_tasks` map and any external
/// completion tracking are keyed on.
#[derive(Debug)]
pub struct Submission {
    pub id: Uuid,
    pub operation: Operation,
}

impl Submission {
    pub fn new(operation: Operation) -> Self {
        Self { id: Uuid::new_v4(), operation }
    }
}

/// One [`AgentEvent`] tagged with the session it came from, the unit the
/// event bus (C7) forwards to the frontend.
#[derive(Debug, Clone)]
pub struct ExecutorEvent {
    pub session_id: String,
    pub event: AgentEvent,
}

struct AgentSlot {
    agent: Arc<Mutex<Agent>>,
    /// Set while a `UserInput` task is inflight for this session; taken
    /// (and sent on) by `Interrupt`.
    cancel: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Outer event loop. Single-threaded cooperative async: `run_loop` is the
/// sole writer of submission ordering, but each `UserInput` submission spawns
/// a `tokio::spawn`ed task that runs concurrently with the loop, so a later
/// `Interrupt` submission is not blocked behind an inflight turn.
pub struct Executor {
    config: Arc<Config>,
    agents: HashMap<String, AgentSlot>,
    active_tasks: HashMap<Uuid, ActiveTask>,
    events_tx: mpsc::Sender<ExecutorEvent>,
    submission_rx: mpsc::Receiver<Submission>,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        events_tx: mpsc::Sender<ExecutorEvent>,
        submission_rx: mpsc::Receiver<Submission>,
    ) -> Self {
        Self {
            config,
            agents: HashMap::new(),
            active_tasks: HashMap::new(),
            events_tx,
            submission_rx,
        }
    }

    /// Register (or replace) the agent bound to `session_id`.
    ///
    /// Frontends build the `Agent` themselves via [`crate::AgentBuilder`] —
    /// they keep control over which model/mode/tool profile a session
    /// starts with; from this call on, the executor owns the instance and
    /// is the only thing that locks it.
    pub fn install_agent(&mut self, session_id: impl Into<String>, agent: Agent) {
        self.agents.insert(
            session_id.into(),
            AgentSlot {
                agent: Arc::new(Mutex::new(agent)),
                cancel: Arc::new(Mutex::new(None)),
            },
        );
    }

    /// `true` once at least one `UserInput` submission is inflight for
    /// `session_id`.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.active_tasks.values().any(|t| t.session_id == session_id)
    }

    /// Drain the submission queue until an `End` operation is processed or
    /// the channel closes (all senders dropped).
    pub async fn run_loop(&mut self) {
        while let Some(submission) = self.submission_rx.recv().await {
            if self.handle_submission(submission).await {
                break;
            }
        }
    }

    /// Process one submission. Returns `true` when the loop should stop.
    async fn handle_submission(&mut self, submission: Submission) -> bool {
        match submission.operation {
            Operation::Init { session_id } => {
                if !self.agents.contains_key(&session_id) {
                    debug!(session_id, "Init for a session with no installed agent");
                }
                false
            }
            Operation::UserInput { session_id, text, images } => {
                self.spawn_user_input(submission.id, session_id, text, images);
                false
            }
            Operation::Interrupt { target_session_id } => {
                self.interrupt(target_session_id.as_deref()).await;
                false
            }
            Operation::ChangeModel { session_id, model_name } => {
                self.change_model(&session_id, &model_name).await;
                false
            }
            Operation::End => true,
        }
    }

    /// Spawn a background task that runs one turn for `session_id` and
    /// streams its events (tagged with `session_id`) onto `events_tx`.
    ///
    /// Unknown `session_id` (no agent installed) reports an `Error` event
    /// immediately rather than panicking — the executor never assumes the
    /// frontend called `install_agent` first.
    fn spawn_user_input(
        &mut self,
        submission_id: Uuid,
        session_id: String,
        text: String,
        images: Option<Vec<ContentPart>>,
    ) {
        let Some(slot) = self.agents.get(&session_id) else {
            let events_tx = self.events_tx.clone();
            let sid = session_id.clone();
            tokio::spawn(async move {
                let _ = events_tx
                    .send(ExecutorEvent {
                        session_id: sid,
                        event: AgentEvent::Error("no agent installed for session".into()),
                    })
                    .await;
            });
            return;
        };

        let agent = slot.agent.clone();
        let cancel_slot = slot.cancel.clone();
        let events_tx = self.events_tx.clone();
        let sid = session_id.clone();

        let handle = tokio::spawn(async move {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            *cancel_slot.lock().await = Some(cancel_tx);

            let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
            let forward_sid = sid.clone();
            let forward_tx = events_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if forward_tx
                        .send(ExecutorEvent { session_id: forward_sid.clone(), event })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });

            let mut guard = agent.lock().await;
            let result = if let Some(parts) = images {
                let mut content_parts = vec![ContentPart::Text { text: text.clone() }];
                content_parts.extend(parts);
                // `submit_with_parts` has no cancellable variant today; image
                // turns cannot be interrupted mid-stream. Plain-text turns
                // (the common path) go through `submit_with_cancel` below.
                let _ = cancel_rx;
                guard.submit_with_parts(content_parts, tx).await
            } else {
                guard.submit_with_cancel(&text, tx, cancel_rx).await
            };
            drop(guard);
            *cancel_slot.lock().await = None;

            let _ = forwarder.await;

            if let Err(e) = result {
                let _ = events_tx
                    .send(ExecutorEvent { session_id: sid, event: AgentEvent::Error(format!("{e:#}")) })
                    .await;
            }
        });

        self.active_tasks.insert(submission_id, ActiveTask { handle, session_id });
    }

    /// Cancel the inflight task(s) for `target_session_id`, or all inflight
    /// tasks when `None`. Removes the matching entries from `active_tasks`
    /// immediately; the task itself finishes asynchronously once its
    /// `Agent` observes the cancellation at its next await point and emits
    /// `AgentEvent::Aborted`.
    async fn interrupt(&mut self, target_session_id: Option<&str>) {
        let matching: Vec<Uuid> = self
            .active_tasks
            .iter()
            .filter(|(_, t)| match target_session_id {
                Some(sid) => t.session_id == sid,
                None => true,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in matching {
            if let Some(task) = self.active_tasks.remove(&id) {
                if let Some(slot) = self.agents.get(&task.session_id) {
                    if let Some(cancel_tx) = slot.cancel.lock().await.take() {
                        let _ = cancel_tx.send(());
                    }
                }
            }
        }
    }

    /// Swap the active model for `session_id`. Returns without effect if no
    /// agent is installed for that session.
    async fn change_model(&mut self, session_id: &str, model_name: &str) {
        let Some(slot) = self.agents.get(session_id) else {
            debug!(session_id, "ChangeModel for a session with no installed agent");
            return;
        };
        let resolved = sven_model::resolve_model_from_config(&self.config, model_name);
        match sven_model::from_config(&resolved) {
            Ok(model) => {
                slot.agent.lock().await.set_model(Arc::from(model));
            }
            Err(e) => {
                let _ = self
                    .events_tx
                    .send(ExecutorEvent {
                        session_id: session_id.to_string(),
                        event: AgentEvent::Error(format!("model init: {e}")),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    use sven_config::AgentMode;
    use sven_model::MockProvider;
    use sven_tools::events::TodoItem;

    use crate::agent::AgentBuilder;
    use crate::context::{RuntimeContext, ToolSetProfile};

    fn test_agent() -> Agent {
        let config = Arc::new(Config::default());
        let profile = ToolSetProfile::Full {
            question_tx: None,
            todos: Arc::new(TokioMutex::new(Vec::<TodoItem>::new())),
            task_depth: Arc::new(AtomicUsize::new(0)),
        };
        AgentBuilder::new(config)
            .with_runtime_context(RuntimeContext::empty())
            .build(AgentMode::Agent, Arc::new(MockProvider), profile)
    }

    fn new_executor() -> (Executor, mpsc::Sender<Submission>, mpsc::Receiver<ExecutorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (submission_tx, submission_rx) = mpsc::channel(64);
        let executor = Executor::new(Arc::new(Config::default()), events_tx, submission_rx);
        (executor, submission_tx, events_rx)
    }

    #[tokio::test]
    async fn user_input_runs_the_installed_agent_and_emits_tagged_events() {
        let (mut executor, submissions, mut events) = new_executor();
        executor.install_agent("s1", test_agent());

        tokio::spawn(async move { executor.run_loop().await });

        submissions
            .send(Submission::new(Operation::UserInput {
                session_id: "s1".into(),
                text: "hello".into(),
                images: None,
            }))
            .await
            .unwrap();

        let mut saw_turn_complete = false;
        for _ in 0..50 {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Some(ev)) => {
                    assert_eq!(ev.session_id, "s1");
                    if matches!(ev.event, AgentEvent::TurnComplete) {
                        saw_turn_complete = true;
                        break;
                    }
                }
                _ => break,
            }
        }
        assert!(saw_turn_complete, "expected a TurnComplete event tagged with the session id");
    }

    #[tokio::test]
    async fn user_input_for_unknown_session_reports_error_without_panicking() {
        let (mut executor, submissions, mut events) = new_executor();
        tokio::spawn(async move { executor.run_loop().await });

        submissions
            .send(Submission::new(Operation::UserInput {
                session_id: "missing".into(),
                text: "hello".into(),
                images: None,
            }))
            .await
            .unwrap();

        let ev = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("timed out waiting for error event")
            .expect("channel closed");
        assert_eq!(ev.session_id, "missing");
        assert!(matches!(ev.event, AgentEvent::Error(_)));
    }

    #[tokio::test]
    async fn end_operation_stops_the_run_loop() {
        let (mut executor, submissions, _events) = new_executor();
        submissions.send(Submission::new(Operation::End)).await.unwrap();

        tokio::time::timeout(Duration::from_millis(500), executor.run_loop())
            .await
            .expect("run_loop must return once End is processed");
    }

    #[tokio::test]
    async fn interrupt_with_no_inflight_tasks_is_a_no_op() {
        let (mut executor, _submissions, _events) = new_executor();
        executor.interrupt(Some("nobody-home")).await;
        assert!(!executor.is_busy("nobody-home"));
    }
}
