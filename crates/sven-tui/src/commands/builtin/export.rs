// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `/export [path]` — write the current conversation to a JSONL file.
//!
//! The actual write happens in the app (it is the only place with access to
//! the live `chat_segments`); this command just resolves the optional
//! explicit path argument into an [`ImmediateAction::Export`].

use crate::commands::{
    CommandArgument, CommandContext, CommandResult, CompletionItem, ImmediateAction, SlashCommand,
};

pub struct ExportCommand;

impl SlashCommand for ExportCommand {
    fn name(&self) -> &str { "export" }

    fn description(&self) -> &str { "Export the conversation to a JSONL file" }

    fn arguments(&self) -> Vec<CommandArgument> {
        vec![CommandArgument::optional(
            "path",
            "Output file path (defaults to the auto-save location)",
        )]
    }

    fn complete(&self, _arg_index: usize, _partial: &str, _ctx: &CommandContext) -> Vec<CompletionItem> {
        vec![]
    }

    fn execute(&self, args: Vec<String>, _ctx: &CommandContext) -> CommandResult {
        let path = args.into_iter().next().filter(|s| !s.is_empty());
        CommandResult {
            immediate_action: Some(ImmediateAction::Export(path)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_context;

    #[test]
    fn execute_with_no_args_exports_to_default_path() {
        let result = ExportCommand.execute(vec![], &test_context());
        assert!(matches!(result.immediate_action, Some(ImmediateAction::Export(None))));
    }

    #[test]
    fn execute_with_path_arg_carries_it_through() {
        let result = ExportCommand.execute(vec!["/tmp/out.jsonl".into()], &test_context());
        match result.immediate_action {
            Some(ImmediateAction::Export(Some(path))) => assert_eq!(path, "/tmp/out.jsonl"),
            other => panic!("expected Export(Some(..)), got {other:?}"),
        }
    }
}
