//! Host system information probe.

use std::{sync::Arc, time::Duration};

use host_agent_core::EventHub;
use host_agent_state::HostProperties;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};

/// Snapshot of host facts reported by get-system-info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// Host name.
    pub device: String,
    /// Hardware model, or the CPU architecture when unknown.
    pub model: String,
    /// Operating system name and release.
    pub os_version: String,
    /// Kernel release.
    pub sdk_version: String,
    pub agent_version: String,
    /// Host uptime in milliseconds.
    pub uptime: u64,
    /// Physical memory in bytes.
    pub total_memory: u64,
    /// Available memory in bytes.
    pub free_memory: u64,
    /// Memory the agent may use in bytes (cgroup limit or physical memory).
    pub max_memory: u64,
}

/// Collects [`SystemInfo`] from `/proc` and `/etc`, falling back to what
/// the agent itself knows.
pub struct SystemProbe {
    properties: Arc<HostProperties>,
    agent_version: String,
    started: Instant,
}

impl SystemProbe {
    #[must_use]
    pub fn new(properties: Arc<HostProperties>, agent_version: impl Into<String>) -> Self {
        Self {
            properties,
            agent_version: agent_version.into(),
            started: Instant::now(),
        }
    }

    /// Gather current system information.
    pub async fn collect(&self) -> SystemInfo {
        let meminfo = read("/proc/meminfo").await.unwrap_or_default();
        let total_memory = meminfo_bytes(&meminfo, "MemTotal").unwrap_or_default();
        let free_memory = meminfo_bytes(&meminfo, "MemAvailable")
            .or_else(|| meminfo_bytes(&meminfo, "MemFree"))
            .unwrap_or_default();
        let max_memory = read("/sys/fs/cgroup/memory.max")
            .await
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map_or(total_memory, |limit| {
                if total_memory == 0 { limit } else { limit.min(total_memory) }
            });

        let uptime = read("/proc/uptime")
            .await
            .and_then(|s| parse_uptime_millis(&s))
            .unwrap_or_else(|| {
                u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
            });

        let os_version = read("/etc/os-release")
            .await
            .and_then(|s| os_release_name(&s))
            .unwrap_or_else(|| std::env::consts::OS.to_string());
        let sdk_version = read("/proc/sys/kernel/osrelease")
            .await
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let model = read("/sys/devices/virtual/dmi/id/product_name")
            .await
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());
        let device = self
            .properties
            .get("hostname")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(host_agent_state::captures::hostname);

        SystemInfo {
            device,
            model,
            os_version,
            sdk_version,
            agent_version: self.agent_version.clone(),
            uptime,
            total_memory,
            free_memory,
            max_memory,
        }
    }
}

/// Publish `system.info` every `interval` until the task is aborted.
pub fn spawn_heartbeat(
    probe: Arc<SystemProbe>,
    hub: Arc<EventHub>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let info = probe.collect().await;
            match serde_json::to_value(&info) {
                Ok(payload) => {
                    hub.emit("system.info", payload);
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode system info"),
            }
        }
    })
}

async fn read(path: &str) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

fn meminfo_bytes(meminfo: &str, key: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib.saturating_mul(1024))
    })
}

fn parse_uptime_millis(uptime: &str) -> Option<u64> {
    let secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((secs * 1000.0).round() as u64)
}

fn os_release_name(os_release: &str) -> Option<String> {
    let field = |key: &str| {
        os_release.lines().find_map(|line| {
            let value = line.strip_prefix(key)?.strip_prefix('=')?;
            Some(value.trim().trim_matches('"').to_string())
        })
    };
    field("PRETTY_NAME")
        .or_else(|| field("NAME"))
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use host_agent_core::Topic;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_meminfo_parsing() {
        let meminfo = "MemTotal:       16318412 kB\nMemFree:          512000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(meminfo_bytes(meminfo, "MemTotal"), Some(16_318_412 * 1024));
        assert_eq!(meminfo_bytes(meminfo, "MemAvailable"), Some(8_000_000 * 1024));
        assert_eq!(meminfo_bytes(meminfo, "SwapTotal"), None);
    }

    #[test]
    fn test_uptime_and_os_release() {
        assert_eq!(parse_uptime_millis("12345.67 54321.00\n"), Some(12_345_670));
        assert_eq!(parse_uptime_millis("garbage"), None);
        assert_eq!(
            os_release_name("NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n"),
            Some("Debian GNU/Linux 12 (bookworm)".to_string())
        );
    }

    #[tokio::test]
    async fn test_collect_reports_agent_facts() {
        let properties = Arc::new(HostProperties::detect("9.9.9"));
        properties.set("hostname", "test-host".into());
        let info = SystemProbe::new(properties, "9.9.9").collect().await;
        assert_eq!(info.device, "test-host");
        assert_eq!(info.agent_version, "9.9.9");
        assert!(info.free_memory <= info.total_memory || info.total_memory == 0);
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_system_monitors() {
        let hub = Arc::new(EventHub::new());
        let conn = Uuid::new_v4();
        let mut rx = hub.register(conn);
        hub.subscribe(conn, Topic::Component("system".into())).unwrap();

        let probe = Arc::new(SystemProbe::new(Arc::new(HostProperties::detect("1.0.0")), "1.0.0"));
        let task = spawn_heartbeat(probe, Arc::clone(&hub), Duration::from_millis(20));
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        task.abort();

        assert_eq!(event.event_type, "system.info");
        assert_eq!(event.payload["agentVersion"], "1.0.0");
    }
}
