//! Health bookkeeping for one bridge instance.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::cache::CacheStats;
use crate::types::SupervisorState;

/// How many recent error messages a snapshot carries.
pub const RECENT_ERRORS: usize = 5;

/// Point-in-time view of the bridge, regenerated on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// Milliseconds since the bridge was created.
    pub uptime_ms: u64,
    pub state: SupervisorState,
    pub process_alive: bool,
    pub pid: Option<u32>,
    pub analyzer_version: Option<String>,
    pub crash_count: u64,
    pub restart_count: u64,
    pub pending_requests: usize,
    pub cache: CacheStats,
    /// Oldest first.
    pub recent_errors: Vec<String>,
}

#[derive(Default)]
struct Counters {
    crash_count: u64,
    restart_count: u64,
    analyzer_version: Option<String>,
    recent_errors: VecDeque<String>,
}

pub(crate) struct HealthMonitor {
    started: Instant,
    counters: Mutex<Counters>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn with_counters<T>(&self, f: impl FnOnce(&mut Counters) -> T) -> T {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut counters)
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_counters(|c| {
            if c.recent_errors.len() == RECENT_ERRORS {
                c.recent_errors.pop_front();
            }
            c.recent_errors.push_back(message);
        });
    }

    pub fn record_crash(&self, reason: &str) {
        self.with_counters(|c| c.crash_count += 1);
        self.record_error(format!("analyzer crashed: {reason}"));
    }

    pub fn record_restart(&self) {
        self.with_counters(|c| c.restart_count += 1);
    }

    pub fn set_version(&self, version: Option<String>) {
        self.with_counters(|c| c.analyzer_version = version);
    }

    pub fn crash_count(&self) -> u64 {
        self.with_counters(|c| c.crash_count)
    }

    pub fn snapshot(
        &self,
        state: SupervisorState,
        process_alive: bool,
        pid: Option<u32>,
        pending_requests: usize,
        cache: CacheStats,
    ) -> HealthStatus {
        let uptime_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.with_counters(|c| HealthStatus {
            uptime_ms,
            state,
            process_alive,
            pid,
            analyzer_version: c.analyzer_version.clone(),
            crash_count: c.crash_count,
            restart_count: c.restart_count,
            pending_requests,
            cache,
            recent_errors: c.recent_errors.iter().cloned().collect(),
        })
    }
}
