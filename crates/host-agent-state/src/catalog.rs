//! Command-backed application catalog.

use std::time::Duration;

use async_trait::async_trait;
use host_agent_core::traits::{AppCatalog, AppInfo, CatalogError};
use host_agent_executor::{CommandExecution, CommandExecutor, CommandTemplate, ExecutionState};

/// Prefix some package managers put before each listed name.
const PACKAGE_PREFIX: &str = "package:";

/// Lists and modifies applications through operator-configured commands.
///
/// The list command prints one application per line as `name [version]`.
/// The modify template sees `{package}` and `{modification}`.
pub struct CommandAppCatalog {
    runner: CommandExecutor,
    list: Option<String>,
    modify: Option<CommandTemplate>,
    timeout: Duration,
}

impl CommandAppCatalog {
    #[must_use]
    pub const fn new(runner: CommandExecutor, timeout: Duration) -> Self {
        Self {
            runner,
            list: None,
            modify: None,
            timeout,
        }
    }

    /// Command line printing installed applications.
    #[must_use]
    pub fn with_list(mut self, command_line: impl Into<String>) -> Self {
        self.list = Some(command_line.into());
        self
    }

    /// Template applying a modification to one application.
    #[must_use]
    pub fn with_modify(mut self, template: CommandTemplate) -> Self {
        self.modify = Some(template);
        self
    }
}

fn parse_line(line: &str) -> Option<AppInfo> {
    let line = line.trim();
    let line = line.strip_prefix(PACKAGE_PREFIX).unwrap_or(line).trim();
    if line.is_empty() {
        return None;
    }
    let (name, version) = match line.split_once(char::is_whitespace) {
        Some((name, version)) => (name, Some(version.trim().to_string())),
        None => (line, None),
    };
    Some(AppInfo {
        name: name.to_string(),
        version: version.filter(|v| !v.is_empty()),
    })
}

fn failure(execution: &CommandExecution) -> CatalogError {
    let reason = match execution.state {
        ExecutionState::Completed => {
            let stderr = execution.stderr.trim();
            if stderr.is_empty() {
                format!("exit code {}", execution.exit_code.unwrap_or_default())
            } else {
                stderr.to_string()
            }
        }
        _ => execution.error.clone().unwrap_or_else(|| "command did not complete".into()),
    };
    CatalogError::CommandFailed(reason)
}

fn succeeded(execution: &CommandExecution) -> bool {
    execution.state == ExecutionState::Completed && execution.exit_code == Some(0)
}

#[async_trait]
impl AppCatalog for CommandAppCatalog {
    async fn list(&self) -> Result<Vec<AppInfo>, CatalogError> {
        let Some(command_line) = &self.list else {
            tracing::debug!("no app list command configured");
            return Ok(Vec::new());
        };
        let execution = self.runner.run(command_line, self.timeout).await;
        if !succeeded(&execution) {
            return Err(failure(&execution));
        }
        let mut apps: Vec<AppInfo> = execution.stdout.lines().filter_map(parse_line).collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps.dedup_by(|a, b| a.name == b.name);
        Ok(apps)
    }

    async fn modify(&self, package: &str, modification: &str) -> Result<String, CatalogError> {
        let template = self
            .modify
            .as_ref()
            .ok_or_else(|| CatalogError::Unsupported("app modification is not configured".into()))?;
        let parts = template
            .render(&[("package", package), ("modification", modification)])
            .map_err(|e| CatalogError::CommandFailed(e.to_string()))?;
        let execution = self.runner.run_parts(parts, self.timeout).await;
        if !succeeded(&execution) {
            return Err(failure(&execution));
        }
        let message = execution.stdout.trim();
        Ok(if message.is_empty() {
            format!("{package} modified")
        } else {
            message.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use host_agent_executor::{DEFAULT_TIMEOUT, ExecutorConfig};

    use super::*;

    fn catalog() -> CommandAppCatalog {
        CommandAppCatalog::new(CommandExecutor::new(ExecutorConfig::default()), DEFAULT_TIMEOUT)
    }

    #[test]
    fn test_parse_line_variants() {
        assert_eq!(
            parse_line("package:com.example.app"),
            Some(AppInfo {
                name: "com.example.app".into(),
                version: None
            })
        );
        assert_eq!(
            parse_line("curl\t8.5.0-2"),
            Some(AppInfo {
                name: "curl".into(),
                version: Some("8.5.0-2".into())
            })
        );
        assert_eq!(parse_line("   "), None);
    }

    #[tokio::test]
    async fn test_unconfigured_catalog() {
        let catalog = catalog();
        assert!(catalog.list().await.unwrap().is_empty());
        assert!(matches!(
            catalog.modify("curl", "disable").await,
            Err(CatalogError::Unsupported(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_parses_command_output() {
        let catalog = catalog().with_list("printf 'zsh 5.9\\ncurl 8.5\\nzsh 5.9\\n'");
        let apps = catalog.list().await.unwrap();
        let names: Vec<_> = apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["curl", "zsh"]);
        assert_eq!(apps[0].version.as_deref(), Some("8.5"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_modify_reports_output_and_failure() {
        let echoing = catalog().with_modify(CommandTemplate::new("echo {modification} {package}"));
        assert_eq!(
            echoing.modify("curl", "hold").await.unwrap(),
            "hold curl"
        );

        let failing = catalog().with_modify(CommandTemplate::new(
            "sh -c 'echo no such package >&2; exit 1'",
        ));
        assert!(matches!(
            failing.modify("nope", "hold").await,
            Err(CatalogError::CommandFailed(msg)) if msg == "no such package"
        ));
    }
}
