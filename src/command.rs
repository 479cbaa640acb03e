//! Command model: environment variables, commands and execution results.
//!
//! A [`Command`] is an ordered list of fragments, program first. Drivers
//! compose a *full command* by putting their own execution prefix (for
//! example `docker exec <id>`) in front of the caller's fragments; the
//! fragments themselves are never reordered, deduplicated or interpreted by
//! a shell.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Environment Variables
// =============================================================================

/// A single environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Creates a new environment variable.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parses `KEY=VALUE`. The value may itself contain `=`.
    pub fn parse(s: &str) -> Option<Self> {
        let (key, value) = s.split_once('=')?;
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key, value))
    }

    /// Returns `KEY=VALUE`.
    pub fn to_assignment(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// A program invocation: program name followed by its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Command(Vec<String>);

impl Command {
    /// Creates a command with just a program name.
    pub fn new(program: impl Into<String>) -> Self {
        Self(vec![program.into()])
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    /// Appends several arguments in order.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    /// Returns the program (first fragment), if any.
    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Returns the arguments after the program.
    pub fn arguments(&self) -> &[String] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// Returns all fragments in order.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Returns true if there is no program to run.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Composes `prefix` followed by this command's fragments.
    pub fn full_command(&self, prefix: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(prefix.len() + self.0.len());
        full.extend_from_slice(prefix);
        full.extend_from_slice(&self.0);
        full
    }

    /// Joins several commands' fragments into one invocation, in order.
    pub fn concat<'a>(commands: impl IntoIterator<Item = &'a Command>) -> Self {
        Self(
            commands
                .into_iter()
                .flat_map(|c| c.0.iter().cloned())
                .collect(),
        )
    }

    /// Consumes the command, returning its fragments.
    pub fn into_parts(self) -> Vec<String> {
        self.0
    }
}

impl From<Vec<String>> for Command {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

impl From<&[&str]> for Command {
    fn from(parts: &[&str]) -> Self {
        Self(parts.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Command {
    fn from(parts: [&str; N]) -> Self {
        Self(parts.iter().map(|s| s.to_string()).collect())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

// =============================================================================
// Execution Result
// =============================================================================

/// Outcome of a command that was dispatched and ran to completion.
///
/// A non-zero `exit_code` is a normal, assertable result. Failures to
/// dispatch the command at all are reported as `Err` by the driver instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code of the command, verbatim.
    pub exit_code: i32,
}

impl ExecResult {
    /// Builds a result from raw process output.
    pub fn from_output(stdout: &[u8], stderr: &[u8], exit_code: i32) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_code,
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Extracts an exit code from a finished process.
///
/// A process terminated by signal `n` reports `128 + n`, as shells do.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_parse() {
        assert_eq!(EnvVar::parse("FOO=bar"), Some(EnvVar::new("FOO", "bar")));
        assert_eq!(EnvVar::parse("A=b=c"), Some(EnvVar::new("A", "b=c")));
        assert_eq!(EnvVar::parse("EMPTY="), Some(EnvVar::new("EMPTY", "")));
        assert_eq!(EnvVar::parse("=value"), None);
        assert_eq!(EnvVar::parse("novalue"), None);
    }

    #[test]
    fn test_full_command_preserves_order() {
        let prefix = vec!["docker".to_string(), "exec".to_string(), "abc".to_string()];
        let cmd = Command::from(["echo", "b", "a", "b"]);
        assert_eq!(
            cmd.full_command(&prefix),
            vec!["docker", "exec", "abc", "echo", "b", "a", "b"]
        );
    }

    #[test]
    fn test_concat() {
        let a = Command::from(["sh", "-c"]);
        let b = Command::from(["echo hi"]);
        assert_eq!(Command::concat([&a, &b]).parts(), &["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_program_and_arguments() {
        let cmd = Command::new("ls").arg("-la").arg("/");
        assert_eq!(cmd.program(), Some("ls"));
        assert_eq!(cmd.arguments(), &["-la", "/"]);
        assert!(Command::default().arguments().is_empty());
        assert!(Command::default().program().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_of_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code_of(std::process::ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code_of(std::process::ExitStatus::from_raw(3 << 8)), 3);
    }
}
