use sven_config::AgentMode;

/// A structured todo item managed by the todo_write tool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    /// One of: "pending", "in_progress", "completed"
    pub status: String,
    /// Present-continuous label shown while this item is active (e.g.
    /// "Running tests" for a todo whose `content` is "Run tests").
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active_form: Option<String>,
}

/// Events emitted by tools to communicate state changes back to the agent loop.
/// The agent translates these into `AgentEvent` variants for the UI.
#[derive(Debug)]
pub enum ToolEvent {
    TodoUpdate(Vec<TodoItem>),
    ModeChanged(AgentMode),
}
