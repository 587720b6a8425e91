// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! MCP-server prompt discovery for the slash command registry.
//!
//! **This module is a stub.**  `discover_mcp_prompts` currently returns an
//! empty list; it will be implemented when MCP client support is added.

use super::skill::SkillCommand;

/// Query all configured MCP servers for their `prompts/list` and turn each
/// result into a slash command.
///
/// **Currently returns an empty vec** (stub implementation).
pub async fn discover_mcp_prompts() -> Vec<SkillCommand> {
    // TODO: implement once an MCP client is wired into sven-runtime.
    vec![]
}
