//! Command building utilities.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shell::{get_shell_command, resolve_executable_path};

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command line cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Unknown template placeholder: {0}")]
    UnknownPlaceholder(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for constructing commands from an operator command line.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Command line as typed by the operator.
    pub base: String,
    /// Run through the platform shell instead of exec'ing directly.
    pub use_shell: bool,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            use_shell: false,
        }
    }

    /// Run the command line through the platform shell.
    #[must_use]
    pub const fn use_shell(mut self, use_shell: bool) -> Self {
        self.use_shell = use_shell;
        self
    }

    /// Build the command.
    ///
    /// # Errors
    /// Returns error if the command line is empty or cannot be split.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        if self.base.trim().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        if self.use_shell {
            let (shell, arg) = get_shell_command();
            return Ok(CommandParts::new(
                shell,
                vec![arg.to_string(), self.base.clone()],
            ));
        }

        let mut parts = split_command_line(&self.base)?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

/// Command line with `{name}` placeholders.
///
/// The template is split into arguments before substitution, so values
/// never introduce extra arguments regardless of their content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    /// Create a template.
    #[must_use]
    pub fn new<S: Into<String>>(template: S) -> Self {
        Self(template.into())
    }

    /// Raw template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute placeholders and split into command parts.
    ///
    /// # Errors
    /// Returns error if the template cannot be split, is empty, or names a
    /// placeholder absent from `vars`.
    pub fn render(&self, vars: &[(&str, &str)]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.0)?
            .into_iter()
            .map(|arg| substitute(&arg, vars))
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn substitute(arg: &str, vars: &[(&str, &str)]) -> Result<String, CommandBuildError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value = vars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| CommandBuildError::UnknownPlaceholder(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_splits_quoted_args() {
        let parts = CommandBuilder::new(r#"echo "hello world" again"#)
            .build()
            .unwrap();
        assert_eq!(parts.program, "echo");
        assert_eq!(parts.args, vec!["hello world", "again"]);
    }

    #[test]
    fn test_build_rejects_empty_and_unbalanced() {
        assert!(matches!(
            CommandBuilder::new("   ").build(),
            Err(CommandBuildError::EmptyCommand)
        ));
        assert!(matches!(
            CommandBuilder::new("echo \"open").build(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_build_with_shell_keeps_line_intact() {
        let parts = CommandBuilder::new("echo a | tr a b")
            .use_shell(true)
            .build()
            .unwrap();
        assert_eq!(parts.args, vec!["-c".to_string(), "echo a | tr a b".to_string()]);
    }

    #[test]
    fn test_template_substitutes_after_split() {
        let template = CommandTemplate::new("cc -o {output} {source}");
        let parts = template
            .render(&[("output", "/tmp/out dir/lib.so"), ("source", "a.c")])
            .unwrap();
        assert_eq!(parts.program, "cc");
        assert_eq!(parts.args, vec!["-o", "/tmp/out dir/lib.so", "a.c"]);
    }

    #[test]
    fn test_template_embedded_placeholder() {
        let template = CommandTemplate::new("patch --target={target}:{method}");
        let parts = template
            .render(&[("target", "Foo"), ("method", "bar")])
            .unwrap();
        assert_eq!(parts.args, vec!["--target=Foo:bar"]);
    }

    #[test]
    fn test_template_unknown_placeholder() {
        let template = CommandTemplate::new("run {missing}");
        assert!(matches!(
            template.render(&[]),
            Err(CommandBuildError::UnknownPlaceholder(name)) if name == "missing"
        ));
    }
}
