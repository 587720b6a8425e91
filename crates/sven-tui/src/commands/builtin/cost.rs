// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `/cost` — report token usage for the most recently completed task.

use crate::commands::{
    CommandArgument, CommandContext, CommandResult, CompletionItem, SlashCommand,
};

pub struct CostCommand;

impl SlashCommand for CostCommand {
    fn name(&self) -> &str { "cost" }

    fn description(&self) -> &str { "Show token usage for the last completed task" }

    fn arguments(&self) -> Vec<CommandArgument> { vec![] }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, _args: Vec<String>, ctx: &CommandContext) -> CommandResult {
        let out = match &ctx.last_metadata {
            Some(meta) => format!(
                "Input: {} (cached: {})\nOutput: {}\nTotal: {}\nModel: {}/{}\n",
                meta.input_tokens, meta.cached_tokens, meta.output_tokens,
                meta.total_tokens, meta.provider, meta.model_name,
            ),
            None => "No completed task yet.\n".to_string(),
        };
        CommandResult { output: Some(out), ..Default::default() }
    }
}
