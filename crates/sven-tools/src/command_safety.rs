// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static safety checks for shell commands, applied before a command is ever
//! handed to a subprocess.
//!
//! This is a conservative allow-by-default / deny-by-pattern gate: it looks
//! only at the command's own top-level structure (splitting on `&&`, `||`,
//! `|`, `;`) and inspects a short list of commands (`rm`, `trash`, `git`,
//! `sed`, `awk`, `find`) that are common sources of irreversible damage. Every
//! other command is left to the approval-policy layer (see [`crate::policy`]).

use std::path::Path;

/// Outcome of [`is_safe_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    /// Present iff `is_safe == false`: a model-facing explanation.
    pub reason: Option<String>,
}

impl SafetyVerdict {
    fn ok() -> Self {
        Self { is_safe: true, reason: None }
    }
    fn reject(reason: impl Into<String>) -> Self {
        Self { is_safe: false, reason: Some(reason.into()) }
    }
}

/// Split `command` on shell-level separators (`&&`, `||`, `;`, `|`, `&`),
/// unwrapping a leading `bash -lc "…"` / `sh -c "…"` wrapper first.
///
/// This is a pragmatic tokenizer, not a full POSIX shell parser: it is
/// deliberately conservative, erring toward "ask the user" rather than
/// silently approving something it can't fully parse.
fn split_commands(command: &str) -> Vec<String> {
    let unwrapped = unwrap_shell_invocation(command);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = unwrapped.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '&' | '|' | ';' if !in_single && !in_double => {
                // Consume a doubled separator (&&, ||) as one token.
                if chars.peek() == Some(&c) {
                    chars.next();
                }
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Strip a `bash -lc "…"` / `sh -c '…'` wrapper, returning the inner command
/// string unchanged if no such wrapper is present.
fn unwrap_shell_invocation(command: &str) -> String {
    let trimmed = command.trim();
    for prefix in ["bash -lc ", "bash -c ", "sh -lc ", "sh -c "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let rest = rest.trim();
            if rest.len() >= 2 {
                let quote = rest.chars().next().unwrap();
                if (quote == '"' || quote == '\'') && rest.ends_with(quote) {
                    return rest[1..rest.len() - 1].to_string();
                }
            }
            return rest.to_string();
        }
    }
    trimmed.to_string()
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or("")
}

/// Check whether `command` (to be executed with cwd `cwd`) is safe to run.
///
/// Applies the per-subcommand rules from the sub-command safety matrix:
/// `rm`/`trash` (path-escape / glob / symlink checks), `git` (no remote
/// mutation), `sed` (no embedded substitution shelling out), `awk` (no
/// `system()`/pipe-to-external), `find` (no `-exec`/`-delete`/`-fprint*`).
/// Every other leading command is left to the caller's approval policy.
pub fn is_safe_command(command: &str, cwd: &Path) -> SafetyVerdict {
    for part in split_commands(command) {
        let verdict = check_single_command(&part, cwd);
        if !verdict.is_safe {
            return verdict;
        }
    }
    SafetyVerdict::ok()
}

fn check_single_command(cmd: &str, cwd: &Path) -> SafetyVerdict {
    let words: Vec<&str> = cmd.split_whitespace().collect();
    if words.is_empty() {
        return SafetyVerdict::ok();
    }
    match first_word(cmd) {
        "rm" | "trash" => check_rm(&words, cwd),
        "git" => check_git(&words),
        "sed" => check_sed(cmd, &words),
        "awk" => check_awk(cmd, &words),
        "find" => check_find(&words),
        _ => SafetyVerdict::ok(),
    }
}

// ── rm / trash ────────────────────────────────────────────────────────────────

fn check_rm(words: &[&str], cwd: &Path) -> SafetyVerdict {
    let flags_recursive = words.iter().skip(1).any(|w| {
        w.starts_with('-') && !w.starts_with("--") && (w.contains('r') || w.contains('R'))
            || *w == "--recursive"
    });

    for operand in words.iter().skip(1).filter(|w| !w.starts_with('-')) {
        if operand.starts_with('/') {
            return SafetyVerdict::reject("Absolute path not allowed in rm/trash");
        }
        if operand.starts_with('~') {
            return SafetyVerdict::reject("Tilde expansion not allowed in rm/trash");
        }
        if operand.contains('*') || operand.contains('?') || operand.contains('[') {
            return SafetyVerdict::reject("Glob wildcards not allowed in rm/trash");
        }
        if operand.ends_with('/') {
            return SafetyVerdict::reject("Trailing slash not allowed in rm/trash");
        }
        if operand.contains("..") {
            return SafetyVerdict::reject("Path escaping the working directory is not allowed");
        }

        let candidate = cwd.join(operand);
        if let Ok(resolved) = std::fs::canonicalize(&candidate) {
            if !resolved.starts_with(cwd) {
                return SafetyVerdict::reject(
                    "Resolved path escapes the working directory",
                );
            }
            if flags_recursive {
                if let Ok(meta) = std::fs::symlink_metadata(&resolved) {
                    if meta.file_type().is_symlink() {
                        return SafetyVerdict::reject(
                            "Recursive removal of a symlink is not allowed",
                        );
                    }
                }
            }
        }
    }
    SafetyVerdict::ok()
}

// ── git ───────────────────────────────────────────────────────────────────────

const GIT_SUBCOMMAND_ALLOWLIST: &[&str] = &[
    "add", "branch", "checkout", "commit", "config", "diff", "fetch", "init", "log", "merge",
    "mv", "rebase", "reset", "restore", "revert", "rm", "show", "stash", "status", "switch",
    "tag", "clone", "worktree",
];

const GIT_DENY_SUBCOMMANDS: &[&str] = &["push", "pull", "remote", "submodule"];

fn check_git(words: &[&str]) -> SafetyVerdict {
    let Some(subcommand) = words.iter().skip(1).find(|w| !w.starts_with('-')) else {
        return SafetyVerdict::ok();
    };
    if GIT_DENY_SUBCOMMANDS.contains(subcommand) {
        return SafetyVerdict::reject(format!(
            "git {subcommand} is a remote operation and is not allowed"
        ));
    }
    if !GIT_SUBCOMMAND_ALLOWLIST.contains(subcommand) {
        return SafetyVerdict::reject(format!(
            "git {subcommand} is not on the local-subcommand allowlist"
        ));
    }
    SafetyVerdict::ok()
}

// ── sed ───────────────────────────────────────────────────────────────────────

fn check_sed(full: &str, words: &[&str]) -> SafetyVerdict {
    if full.contains('`') || full.contains("$(") {
        return SafetyVerdict::reject("Command substitution is not allowed in sed");
    }
    // `sed -n 'Np'` or `sed -n 'M,Np'` (line printing) is always fine.
    if words.iter().any(|w| *w == "-n") {
        if let Some(script) = words.iter().find(|w| w.ends_with('p') && w.len() > 1) {
            let body = script.trim_matches(|c| c == '\'' || c == '"');
            let numeric = body.trim_end_matches('p');
            if numeric.chars().all(|c| c.is_ascii_digit() || c == ',') {
                return SafetyVerdict::ok();
            }
        }
    }
    // `s/…/…/` substitution with no embedded `;` is fine.
    if let Some(script) = words.iter().find(|w| w.trim_matches(|c| c == '\'' || c == '"').starts_with('s')) {
        let body = script.trim_matches(|c| c == '\'' || c == '"');
        if body.starts_with("s/") || body.starts_with("s|") {
            if !body.contains(';') {
                return SafetyVerdict::ok();
            }
            return SafetyVerdict::reject("sed substitution with embedded ';' is not allowed");
        }
    }
    SafetyVerdict::ok()
}

// ── awk ───────────────────────────────────────────────────────────────────────

fn check_awk(full: &str, words: &[&str]) -> SafetyVerdict {
    if words.iter().any(|w| *w == "-f") {
        return SafetyVerdict::reject("awk -f (external script file) is not allowed");
    }
    if full.contains("system(") {
        return SafetyVerdict::reject("awk system(...) is not allowed");
    }
    if full.contains('|') {
        return SafetyVerdict::reject("Piping awk to an external command is not allowed");
    }
    SafetyVerdict::ok()
}

// ── find ──────────────────────────────────────────────────────────────────────

const FIND_DENY_FLAGS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fls", "-fprint", "-fprintf", "-fprint0",
];

fn check_find(words: &[&str]) -> SafetyVerdict {
    for w in words {
        if FIND_DENY_FLAGS.contains(w) {
            return SafetyVerdict::reject(format!("find {w} is not allowed"));
        }
    }
    SafetyVerdict::ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
