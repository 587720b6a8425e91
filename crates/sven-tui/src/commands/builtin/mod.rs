// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Built-in slash commands shipped with sven.

pub mod clear;
pub mod cost;
pub mod debug;
pub mod export;
pub mod help;
pub mod model;
pub mod quit;
pub mod status;
