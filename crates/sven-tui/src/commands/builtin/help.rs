// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `/help` — list every registered slash command.

use crate::commands::{
    CommandArgument, CommandContext, CommandResult, CompletionItem, SlashCommand,
};

pub struct HelpCommand;

impl SlashCommand for HelpCommand {
    fn name(&self) -> &str { "help" }

    fn description(&self) -> &str { "List available slash commands" }

    fn arguments(&self) -> Vec<CommandArgument> { vec![] }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, _args: Vec<String>, ctx: &CommandContext) -> CommandResult {
        let mut out = String::from("Available commands:\n");
        for (name, desc) in &ctx.available_commands {
            out.push_str(&format!("  /{name:<10} {desc}\n"));
        }
        CommandResult { output: Some(out), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_context;

    #[test]
    fn execute_lists_every_command_in_context() {
        let mut ctx = test_context();
        ctx.available_commands = vec![
            ("clear".into(), "Clear the chat history".into()),
            ("model".into(), "Switch model".into()),
        ];
        let result = HelpCommand.execute(vec![], &ctx);
        let out = result.output.expect("help must produce output");
        assert!(out.contains("/clear"));
        assert!(out.contains("/model"));
        assert!(out.contains("Switch model"));
    }

    #[test]
    fn execute_does_not_send_to_agent() {
        let result = HelpCommand.execute(vec![], &test_context());
        assert!(result.message_to_send.is_none());
        assert!(result.immediate_action.is_none());
    }
}
