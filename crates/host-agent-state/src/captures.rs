//! Built-in state captures.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use host_agent_core::traits::{AppCatalog, CaptureError, StateCapture};
use host_agent_executor::{CommandExecutor, ExecutionState};
use serde_json::Value;

/// Shared table of agent-managed host properties.
///
/// This is the restorable facet of host state: restoring a snapshot puts
/// the captured table back verbatim.
#[derive(Default)]
pub struct HostProperties {
    values: RwLock<BTreeMap<String, Value>>,
}

impl HostProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with facts about the running host.
    #[must_use]
    pub fn detect(agent_version: &str) -> Self {
        let properties = Self::new();
        properties.set("os", std::env::consts::OS.into());
        properties.set("arch", std::env::consts::ARCH.into());
        properties.set("family", std::env::consts::FAMILY.into());
        properties.set("hostname", hostname().into());
        properties.set("agentVersion", agent_version.into());
        properties
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Set a property, returning the previous value.
    pub fn set(&self, key: &str, value: Value) -> Option<Value> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value)
    }

    /// Copy of the whole table.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.read().clone()
    }

    /// Replace the whole table.
    pub fn replace(&self, values: BTreeMap<String, Value>) {
        *self.values.write().unwrap_or_else(PoisonError::into_inner) = values;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Best-effort host name lookup.
#[must_use]
pub fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| {
            std::fs::read_to_string(path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Captures [`HostProperties`] under the name `properties`.
pub struct PropertiesCapture {
    properties: Arc<HostProperties>,
}

impl PropertiesCapture {
    #[must_use]
    pub const fn new(properties: Arc<HostProperties>) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl StateCapture for PropertiesCapture {
    fn name(&self) -> &str {
        "properties"
    }

    async fn capture(&self) -> Result<Value, CaptureError> {
        Ok(Value::Object(self.properties.to_map().into_iter().collect()))
    }

    async fn restore(&self, captured: &Value) -> Result<(), CaptureError> {
        let Value::Object(map) = captured else {
            return Err(CaptureError::InvalidValue("properties must be an object".into()));
        };
        self.properties
            .replace(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        Ok(())
    }
}

/// Records the stdout lines of a command, e.g. the running services.
///
/// The facet is read-only: restore reports drift but changes nothing.
pub struct CommandCapture {
    name: String,
    command_line: String,
    runner: CommandExecutor,
    timeout: Duration,
}

impl CommandCapture {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        command_line: impl Into<String>,
        runner: CommandExecutor,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
            runner,
            timeout,
        }
    }
}

#[async_trait]
impl StateCapture for CommandCapture {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capture(&self) -> Result<Value, CaptureError> {
        let execution = self.runner.run(&self.command_line, self.timeout).await;
        match (execution.state, execution.exit_code) {
            (ExecutionState::Completed, Some(0)) => Ok(Value::Array(
                execution
                    .stdout
                    .lines()
                    .map(str::trim_end)
                    .filter(|l| !l.is_empty())
                    .map(|l| Value::String(l.to_string()))
                    .collect(),
            )),
            (ExecutionState::Completed, code) => Err(CaptureError::Failed(format!(
                "`{}` exited with code {}: {}",
                self.command_line,
                code.unwrap_or_default(),
                execution.stderr.trim()
            ))),
            _ => Err(CaptureError::Failed(format!(
                "`{}`: {}",
                self.command_line,
                execution.error.unwrap_or_default()
            ))),
        }
    }

    async fn restore(&self, captured: &Value) -> Result<(), CaptureError> {
        if !captured.is_array() {
            return Err(CaptureError::InvalidValue(format!(
                "{} must be a list of lines",
                self.name
            )));
        }
        log_drift(&self.name, captured, &self.capture().await?);
        Ok(())
    }
}

/// Captures the application catalog listing under `packages`.
///
/// Read-only like [`CommandCapture`].
pub struct CatalogCapture {
    catalog: Arc<dyn AppCatalog>,
}

impl CatalogCapture {
    #[must_use]
    pub fn new(catalog: Arc<dyn AppCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl StateCapture for CatalogCapture {
    fn name(&self) -> &str {
        "packages"
    }

    async fn capture(&self) -> Result<Value, CaptureError> {
        let apps = self
            .catalog
            .list()
            .await
            .map_err(|e| CaptureError::Failed(e.to_string()))?;
        serde_json::to_value(apps).map_err(|e| CaptureError::Failed(e.to_string()))
    }

    async fn restore(&self, captured: &Value) -> Result<(), CaptureError> {
        log_drift(self.name(), captured, &self.capture().await?);
        Ok(())
    }
}

fn log_drift(name: &str, captured: &Value, current: &Value) {
    if captured == current {
        tracing::debug!(capture = name, "no drift");
        return;
    }
    let count = |v: &Value| v.as_array().map_or(0, Vec::len);
    tracing::warn!(
        capture = name,
        captured = count(captured),
        current = count(current),
        "read-only capture drifted since snapshot; not restored"
    );
}

#[cfg(test)]
mod tests {
    use host_agent_core::traits::{AppInfo, CatalogError};
    use host_agent_executor::{DEFAULT_TIMEOUT, ExecutorConfig};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_properties_round_trip() {
        let properties = Arc::new(HostProperties::detect("0.1.0"));
        let capture = PropertiesCapture::new(Arc::clone(&properties));
        let before = capture.capture().await.unwrap();
        assert_eq!(before["agentVersion"], "0.1.0");

        properties.set("debug.enabled", json!(true));
        capture.restore(&before).await.unwrap();

        assert!(properties.get("debug.enabled").is_none());
        assert_eq!(capture.capture().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_properties_reject_non_object() {
        let capture = PropertiesCapture::new(Arc::new(HostProperties::new()));
        assert!(matches!(
            capture.restore(&json!([1, 2])).await,
            Err(CaptureError::InvalidValue(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_capture_lines_and_readonly_restore() {
        let runner = CommandExecutor::new(ExecutorConfig::default());
        let capture = CommandCapture::new("services", "printf 'sshd\\ncron\\n'", runner, DEFAULT_TIMEOUT);

        let captured = capture.capture().await.unwrap();
        assert_eq!(captured, json!(["sshd", "cron"]));
        // drift is logged, not an error
        capture.restore(&json!(["sshd"])).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_capture_failure() {
        let runner = CommandExecutor::new(ExecutorConfig::default());
        let capture = CommandCapture::new("services", "false", runner, DEFAULT_TIMEOUT);
        assert!(matches!(capture.capture().await, Err(CaptureError::Failed(_))));
    }

    struct FixedCatalog;

    #[async_trait]
    impl AppCatalog for FixedCatalog {
        async fn list(&self) -> Result<Vec<AppInfo>, CatalogError> {
            Ok(vec![AppInfo {
                name: "curl".into(),
                version: Some("8.5".into()),
            }])
        }

        async fn modify(&self, _: &str, _: &str) -> Result<String, CatalogError> {
            Err(CatalogError::Unsupported("fixed".into()))
        }
    }

    #[tokio::test]
    async fn test_catalog_capture() {
        let capture = CatalogCapture::new(Arc::new(FixedCatalog));
        assert_eq!(
            capture.capture().await.unwrap(),
            json!([{"name": "curl", "version": "8.5"}])
        );
    }
}
