//! Structured log events for host integrations that want machine-parseable logs,
//! alongside plain `log` macro usage at the call sites that matter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl LogEvent {
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        LogEvent {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"timestamp":"{}","level":"{}","component":"{}","message":"{}"}}"#,
                self.timestamp.to_rfc3339(),
                self.level,
                self.component,
                self.message
            )
        })
    }

    pub fn to_text(&self) -> String {
        let mut output = format!(
            "[{}] {} {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.component,
            self.message
        );
        if let Some(context) = &self.context {
            write!(output, " context={context}").unwrap();
        }
        output
    }
}

/// Bounded in-memory log buffer, used where a host wants to pull recent events
/// (e.g. to attach to a `stats` control-message response) rather than scrape logs.
pub struct EventLog {
    events: Vec<LogEvent>,
    max_size: usize,
    min_level: LogLevel,
}

impl EventLog {
    pub fn new(max_size: usize, min_level: LogLevel) -> Self {
        EventLog {
            events: Vec::new(),
            max_size,
            min_level,
        }
    }

    pub fn log(&mut self, event: LogEvent) {
        if event.level >= self.min_level {
            self.events.push(event);
            if self.events.len() > self.max_size {
                self.events.remove(0);
            }
        }
    }

    pub fn get_events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn stats(&self) -> LogStats {
        let mut s = LogStats::default();
        for event in &self.events {
            s.total_events += 1;
            match event.level {
                LogLevel::Debug => s.debug_count += 1,
                LogLevel::Info => s.info_count += 1,
                LogLevel::Warn => s.warn_count += 1,
                LogLevel::Error => s.error_count += 1,
            }
        }
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub total_events: usize,
    pub debug_count: usize,
    pub info_count: usize,
    pub warn_count: usize,
    pub error_count: usize,
}
