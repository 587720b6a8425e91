// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `/clear` command — erase all chat segments and reset the conversation view.

use crate::commands::{
    CommandContext, CommandResult, CompletionItem, ImmediateAction, SlashCommand,
};

pub struct ClearCommand;

impl SlashCommand for ClearCommand {
    fn name(&self) -> &str { "clear" }

    fn description(&self) -> &str { "Clear the chat history" }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, _args: Vec<String>, _ctx: &CommandContext) -> CommandResult {
        CommandResult {
            immediate_action: Some(ImmediateAction::ClearChat),
            ..Default::default()
        }
    }
}
