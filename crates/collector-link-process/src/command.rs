//! Collector command line assembly.

use std::path::PathBuf;

use collector_link_core::LinkError;
use thiserror::Error;

use crate::resolve::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("collector command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("collector command is empty after parsing")]
    EmptyCommand,
    #[error("collector executable not found: {0}")]
    NotFound(String),
}

impl From<CommandBuildError> for LinkError {
    fn from(err: CommandBuildError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an executable path.
    ///
    /// # Errors
    /// Returns `CommandBuildError::NotFound` if the executable is not on `PATH`.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// `<executable> <base args> <operation args>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorCommand {
    /// Executable, possibly with leading arguments (`"velo --config x.yaml"`).
    pub base: String,
    /// Arguments passed on every invocation.
    pub base_args: Vec<String>,
}

impl CollectorCommand {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            base_args: Vec::new(),
        }
    }

    /// Append arguments passed on every invocation.
    #[must_use]
    pub fn base_args<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.base_args.extend(more.into_iter().map(Into::into));
        self
    }

    /// Build the command line for one operation.
    ///
    /// # Errors
    /// Returns error if the base command cannot be split or is empty.
    pub fn build(&self, operation_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.base_args.iter().cloned());
        parts.extend(operation_args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(CommandParts { program, args: parts })
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}
