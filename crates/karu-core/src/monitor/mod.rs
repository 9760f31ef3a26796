//! Monitor/log service
//!
//! A bounded ring buffer of human-readable log lines for the admin surface,
//! plus the monitor status snapshot. Every entry is mirrored to `tracing`.

use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum retained log lines.
pub const LOG_CAPACITY: usize = 100;

/// Log severity shown in the admin UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

/// Monitor status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_scan_found: usize,
    pub total_processed: usize,
}

/// The monitor/log service.
pub struct MonitorService {
    logs: Mutex<VecDeque<LogEntry>>,
    status: RwLock<MonitorStatus>,
}

impl Default for MonitorService {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorService {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
            status: RwLock::new(MonitorStatus::default()),
        }
    }

    /// Record a log line, newest first, capped at `LOG_CAPACITY`.
    pub fn add_log(&self, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            _ => tracing::info!("{}", message),
        }
        if let Ok(mut logs) = self.logs.lock() {
            logs.push_front(LogEntry {
                timestamp: Utc::now(),
                message,
                level,
            });
            while logs.len() > LOG_CAPACITY {
                logs.pop_back();
            }
        }
    }

    /// Snapshot of the retained lines, newest first.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs
            .lock()
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set_running(&self, running: bool) {
        if let Ok(mut status) = self.status.write() {
            status.running = running;
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.read().map(|s| s.running).unwrap_or(false)
    }

    /// Record the outcome of one scan pass.
    pub fn record_scan(&self, found: usize) {
        if let Ok(mut status) = self.status.write() {
            status.last_check = Some(Utc::now());
            status.last_scan_found = found;
            status.total_processed += found;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
