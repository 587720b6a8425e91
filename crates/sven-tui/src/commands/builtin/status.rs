// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `/status` — summarize the active model, mode, and context usage.

use crate::commands::{
    CommandArgument, CommandContext, CommandResult, CompletionItem, SlashCommand,
};

pub struct StatusCommand;

impl SlashCommand for StatusCommand {
    fn name(&self) -> &str { "status" }

    fn description(&self) -> &str { "Show the active model, mode, and context usage" }

    fn arguments(&self) -> Vec<CommandArgument> { vec![] }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, _args: Vec<String>, ctx: &CommandContext) -> CommandResult {
        let mut out = format!(
            "Model: {}/{}\nMode: {:?}\nContext used: {}%\nCache hit rate: {}%\n",
            ctx.current_model_provider,
            ctx.current_model_name,
            ctx.current_mode,
            ctx.context_pct,
            ctx.cache_hit_pct,
        );
        if let Some(path) = &ctx.history_path {
            out.push_str(&format!("History: {}\n", path.display()));
        }
        if let Some(meta) = &ctx.last_metadata {
            out.push_str(&format!(
                "Last task: {} turn(s), {:.1}s, status {:?}\n",
                meta.turn_count, meta.task_duration_s, meta.status,
            ));
        }
        CommandResult { output: Some(out), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_context;

    #[test]
    fn execute_reports_model_and_mode() {
        let result = StatusCommand.execute(vec![], &test_context());
        let out = result.output.expect("status must produce output");
        assert!(out.contains("openai/gpt-4o"));
        assert!(out.contains("Agent"));
    }

    #[test]
    fn execute_includes_last_metadata_when_present() {
        let mut ctx = test_context();
        ctx.last_metadata = Some(sven_core::TaskMetadata {
            turn_count: 3,
            task_duration_s: 2.5,
            ..Default::default()
        });
        let result = StatusCommand.execute(vec![], &ctx);
        let out = result.output.unwrap();
        assert!(out.contains("3 turn(s)"));
    }

    #[test]
    fn execute_does_not_send_to_agent() {
        let result = StatusCommand.execute(vec![], &test_context());
        assert!(result.message_to_send.is_none());
    }
}
