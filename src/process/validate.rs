//! Command injection guard for locally spawned servers.
//!
//! Commands are executed directly (never through a shell), but descriptors
//! frequently come from pasted connection strings, so anything that would
//! change meaning under a shell is refused outright.

use std::path::Path;

use crate::{Error, Result};

/// Substrings rejected in commands and arguments.
///
/// `$(` precedes `(` so the reported pattern is the more specific one.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    ";", "&", "|", "`", "$(", "(", ")", "{", "}", "<", ">", "\n", "\r", "..",
];

/// Policy knobs for command validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandPolicy {
    /// Accept absolute executable paths (off by default)
    pub allow_absolute_paths: bool,
}

/// Validate a command and its arguments before spawning.
///
/// # Errors
///
/// Returns [`Error::UnsafeCommand`] naming the first offending pattern, or
/// [`Error::Config`] for an empty command.
pub fn validate_command(command: &str, args: &[String], policy: CommandPolicy) -> Result<()> {
    if command.trim().is_empty() {
        return Err(Error::Config("Empty command".to_string()));
    }

    check_value(command, "command")?;

    if !policy.allow_absolute_paths && is_absolute(command) {
        return Err(Error::UnsafeCommand(format!(
            "absolute command paths are not allowed: {command}"
        )));
    }

    for (index, arg) in args.iter().enumerate() {
        check_value(arg, &format!("argument {index}"))?;
    }

    Ok(())
}

fn check_value(value: &str, what: &str) -> Result<()> {
    if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| value.contains(**p)) {
        return Err(Error::UnsafeCommand(format!(
            "dangerous pattern {pattern:?} in {what}"
        )));
    }

    // NUL, ESC and friends; tab is harmless
    if let Some(c) = value.chars().find(|c| c.is_control() && *c != '\t') {
        return Err(Error::UnsafeCommand(format!(
            "dangerous pattern (control character U+{:04X}) in {what}",
            u32::from(c)
        )));
    }

    Ok(())
}

fn is_absolute(command: &str) -> bool {
    Path::new(command).is_absolute() || command.starts_with('/') || command.starts_with('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn accepts_plain_commands() {
        let policy = CommandPolicy::default();
        assert!(validate_command("npx", &args(&["-y", "@scope/server-x"]), policy).is_ok());
        assert!(validate_command("echo", &args(&["hi"]), policy).is_ok());
        assert!(validate_command("uvx", &args(&["mcp-server-time", "--tz=UTC"]), policy).is_ok());
    }

    #[test]
    fn rejects_every_dangerous_pattern_in_command_and_args() {
        let policy = CommandPolicy::default();
        for pattern in DANGEROUS_PATTERNS {
            let bad = format!("ls{pattern}x");
            let err = validate_command(&bad, &[], policy).unwrap_err();
            assert!(
                err.to_string().contains("dangerous pattern"),
                "command with {pattern:?}: {err}"
            );

            let err = validate_command("ls", &args(&["ok", &bad]), policy).unwrap_err();
            assert!(err.to_string().contains("argument 1"), "{err}");
        }
    }

    #[test]
    fn shell_injection_example() {
        let err = validate_command("ls; rm -rf /", &[], CommandPolicy::default()).unwrap_err();
        assert!(matches!(err, Error::UnsafeCommand(_)));
        assert!(err.to_string().contains("dangerous pattern \";\""));
    }

    #[test]
    fn subshell_reports_specific_pattern() {
        let err = validate_command("echo", &args(&["$(id)"]), CommandPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("\"$(\""), "{err}");
    }

    #[test]
    fn rejects_control_characters() {
        let err =
            validate_command("echo", &args(&["a\u{1b}[2J"]), CommandPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("control character"));
        assert!(validate_command("echo", &args(&["a\tb"]), CommandPolicy::default()).is_ok());
    }

    #[test]
    fn absolute_paths_depend_on_policy() {
        let strict = CommandPolicy::default();
        let err = validate_command("/bin/echo", &[], strict).unwrap_err();
        assert!(err.to_string().contains("absolute"));

        let relaxed = CommandPolicy {
            allow_absolute_paths: true,
        };
        assert!(validate_command("/bin/echo", &[], relaxed).is_ok());
    }

    #[test]
    fn empty_command_is_config_error() {
        let err = validate_command("  ", &[], CommandPolicy::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
