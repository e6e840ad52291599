//! Bounded in-memory log history.
//!
//! [`LogBufferLayer`] plugs into a `tracing_subscriber` registry and keeps
//! the most recent formatted lines so operators can read them remotely.

use std::{
    collections::VecDeque,
    fmt::Write as _,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, layer::Context};

use crate::clock::now_millis;

/// Default history size limit (4 MB).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Default history line limit.
const HISTORY_LINES: usize = 10_000;

struct Inner {
    lines: VecDeque<String>,
    total_bytes: usize,
}

/// Ring buffer of formatted log lines.
pub struct LogBuffer {
    inner: Mutex<Inner>,
    max_lines: usize,
    max_bytes: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(HISTORY_LINES)
    }
}

impl LogBuffer {
    /// Create a buffer holding at most `max_lines` lines.
    #[must_use]
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(max_lines.min(1024)),
                total_bytes: 0,
            }),
            max_lines: max_lines.max(1),
            max_bytes: HISTORY_BYTES,
        }
    }

    /// Append a line, evicting the oldest ones past the limits.
    pub fn push(&self, line: String) {
        let bytes = line.len();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        while inner.lines.len() >= self.max_lines
            || (inner.total_bytes.saturating_add(bytes) > self.max_bytes && !inner.lines.is_empty())
        {
            if let Some(front) = inner.lines.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.len());
            }
        }
        inner.lines.push_back(line);
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// The last `count` lines matching `filter`, oldest first.
    ///
    /// Matching is a case-insensitive substring test; an empty filter or
    /// `*` matches every line.
    #[must_use]
    pub fn tail(&self, count: usize, filter: &str) -> Vec<String> {
        let needle = filter.trim().to_lowercase();
        let match_all = needle.is_empty() || needle == "*";

        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = inner
            .lines
            .iter()
            .rev()
            .filter(|line| match_all || line.to_lowercase().contains(&needle))
            .take(count)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Number of buffered lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `tracing` layer feeding a [`LogBuffer`].
#[derive(Clone)]
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    /// Create a layer writing into `buffer`.
    #[must_use]
    pub const fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut line = format!(
            "{} {:>5} {}: {}",
            now_millis(),
            metadata.level(),
            metadata.target(),
            visitor.message
        );
        if !visitor.fields.is_empty() {
            line.push(' ');
            line.push_str(&visitor.fields);
        }
        self.buffer.push(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.append_field(field, value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.append_field(field, &format!("{value:?}"));
        }
    }
}

impl LineVisitor {
    fn append_field(&mut self, field: &Field, value: &str) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value}", field.name());
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn test_tail_returns_latest_in_order() {
        let buffer = LogBuffer::new(100);
        for i in 0..10 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.tail(3, "*"), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let buffer = LogBuffer::new(100);
        buffer.push("INFO host_agent_state: snapshot created".into());
        buffer.push("INFO hyper: connection closed".into());
        assert_eq!(buffer.tail(100, "AGENT").len(), 1);
        assert_eq!(buffer.tail(100, "").len(), 2);
    }

    #[test]
    fn test_line_limit_evicts_oldest() {
        let buffer = LogBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.tail(10, ""), vec!["b", "c"]);
    }

    #[test]
    fn test_layer_records_events() {
        let buffer = Arc::new(LogBuffer::default());
        let subscriber =
            tracing_subscriber::registry().with(LogBufferLayer::new(Arc::clone(&buffer)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(snapshot_id = "manual_1", "snapshot created");
        });

        let lines = buffer.tail(10, "snapshot");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("snapshot created"));
        assert!(lines[0].contains("snapshot_id=manual_1"));
    }
}
