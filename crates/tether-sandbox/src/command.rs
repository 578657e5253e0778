use regex::Regex;

use tether_core::{Result, TetherError};

/// Tokens that are never allowed to appear as a command name.
pub const DEFAULT_DENYLIST: &[&str] = &["mkfs", "dd", "shutdown", "reboot", "halt", "poweroff"];

// Wrappers that defer to the next token for the real command name.
const WRAPPERS: &[&str] = &["sudo", "doas", "env", "nohup", "time", "exec", "command"];

const FORK_BOMB: &str = ":(){:|:&};:";

pub(crate) fn build_denylist(extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect();
    for token in extra {
        let token = token.trim();
        if !token.is_empty() && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

pub(crate) fn build_patterns() -> Result<Vec<Regex>> {
    let sources = [
        // rm -rf (or -fr) with a root target: "/", "/*", "/bin", ...
        r"(?i)\brm\s+-[a-z]*r[a-z]*f[a-z]*\s+/",
        r"(?i)\brm\s+-[a-z]*f[a-z]*r[a-z]*\s+/",
        // Writing raw devices.
        r"(?i)\bdd\b.*\bof=/dev/",
    ];
    sources
        .iter()
        .map(|src| {
            Regex::new(src)
                .map_err(|e| TetherError::Config(format!("bad denylist pattern {src:?}: {e}")))
        })
        .collect()
}

/// Screen a raw command string. `cli_mode` relaxes the shell meta-character
/// checks for interactive callers that legitimately compose pipelines.
pub(crate) fn screen(
    cmd: &str,
    deny_tokens: &[String],
    deny_patterns: &[Regex],
    cli_mode: bool,
) -> Result<()> {
    let squashed: String = cmd.chars().filter(|c| !c.is_whitespace()).collect();
    if squashed.contains(FORK_BOMB) {
        return Err(denied(cmd, "fork bomb"));
    }

    // Only the command position of each pipeline segment is screened, so
    // "git init" passes while "sudo dd ..." does not.
    for segment in cmd.split(['|', ';', '&', '\n']) {
        for token in segment.split_whitespace() {
            if WRAPPERS.contains(&token) || token.contains('=') || token.starts_with('-') {
                continue;
            }
            let name = token.rsplit('/').next().unwrap_or(token);
            if deny_tokens.iter().any(|deny| deny == name) {
                return Err(denied(cmd, name));
            }
            break;
        }
    }

    for pattern in deny_patterns {
        if pattern.is_match(cmd) {
            return Err(denied(cmd, "destructive pattern"));
        }
    }

    if !cli_mode && (cmd.contains("$(") || cmd.contains('`')) {
        return Err(denied(cmd, "command substitution"));
    }
    Ok(())
}

fn denied(cmd: &str, what: &str) -> TetherError {
    TetherError::PermissionDenied(format!("command blocked ({what}): {cmd}"))
}
