// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `/debug` — dump internal diagnostic state for bug reports.

use crate::commands::{
    CommandArgument, CommandContext, CommandResult, CompletionItem, SlashCommand,
};

pub struct DebugCommand;

impl SlashCommand for DebugCommand {
    fn name(&self) -> &str { "debug" }

    fn description(&self) -> &str { "Dump internal diagnostic state" }

    fn arguments(&self) -> Vec<CommandArgument> { vec![] }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, _args: Vec<String>, ctx: &CommandContext) -> CommandResult {
        let mut out = String::from("Debug info:\n");
        out.push_str(&format!("  config.model: {}/{}\n", ctx.config.model.provider, ctx.config.model.name));
        out.push_str(&format!("  current_model: {}/{}\n", ctx.current_model_provider, ctx.current_model_name));
        out.push_str(&format!("  current_mode: {:?}\n", ctx.current_mode));
        out.push_str(&format!("  context_pct: {}\n", ctx.context_pct));
        out.push_str(&format!("  cache_hit_pct: {}\n", ctx.cache_hit_pct));
        out.push_str(&format!(
            "  history_path: {}\n",
            ctx.history_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "none".into())
        ));
        if let Some(meta) = &ctx.last_metadata {
            out.push_str(&format!("  last_metadata: {meta:?}\n"));
        }
        CommandResult { output: Some(out), ..Default::default() }
    }
}
