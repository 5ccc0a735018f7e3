//! Analyzer process supervision.
//!
//! At most one session is live at a time. The session slot is a mutex held
//! across the whole start (launch + readiness probe), so concurrent callers
//! queue behind the first and then share its session. Channel close is
//! watched per session; a close that `stop()` did not initiate is a crash.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::CompilationCache;
use crate::channel::{self, MessageHandler, ProtocolChannel, spawn_stderr_logger};
use crate::correlator::RequestCorrelator;
use crate::error::{BridgeError, ProtocolError};
use crate::health::HealthMonitor;
use crate::protocol::{self, Incoming, METHOD_GET_VERSION};
use crate::transport::{Launcher, Transport};
use crate::types::{AnalyzerConfig, RestartPolicy, SupervisorState};

/// How long crash handling waits for an exited child before killing it.
const REAP_WAIT: Duration = Duration::from_millis(200);

/// Routes frames from one session's stdout.
struct SessionInbound {
    correlator: Arc<RequestCorrelator>,
    health: Arc<HealthMonitor>,
}

impl MessageHandler for SessionInbound {
    async fn on_message(&self, frame: serde_json::Value) {
        match protocol::decode_incoming(&frame) {
            Ok(Incoming::Response(response)) => {
                self.correlator.resolve(response).await;
            }
            Ok(Incoming::Notification { method }) => {
                tracing::trace!(%method, "Ignoring analyzer notification");
            }
            Err(err) => {
                tracing::warn!(
                    excerpt = err.excerpt().unwrap_or_default(),
                    "Unroutable analyzer frame: {err}"
                );
                self.health.record_error(format!("protocol error: {err}"));
            }
        }
    }

    async fn on_malformed(&self, error: ProtocolError) {
        self.health.record_error(format!("protocol error: {error}"));
    }
}

/// One running analyzer with its channel and pending-request table.
pub(crate) struct Session {
    epoch: u64,
    channel: ProtocolChannel,
    correlator: Arc<RequestCorrelator>,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    /// Reader, writer and stderr tasks; aborted when the session is dropped.
    io_tasks: Vec<JoinHandle<()>>,
    request_timeout: Duration,
}

impl Session {
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        self.correlator
            .issue(&self.channel, method, params, self.request_timeout)
            .await
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn pending_count(&self) -> usize {
        self.correlator.pending_count().await
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    async fn shutdown(&self, grace: Duration) {
        self.channel.close().await;
        if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
            tracing::debug!(pid = self.pid, "Analyzer didn't exit in time, killing");
            self.kill().await;
        }
        self.channel.mark_closed("analyzer stopped");
    }

    async fn wait_exit(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.wait().await;
            return;
        }
        self.channel.wait_closed().await;
    }

    async fn kill(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
    }

    /// Collect the exit status of a process whose streams closed, killing it
    /// if it lingers.
    async fn reap(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match tokio::time::timeout(REAP_WAIT, child.wait()).await {
            Ok(Ok(status)) => Some(status.to_string()),
            Ok(Err(e)) => Some(format!("wait failed: {e}")),
            Err(_) => {
                let _ = child.kill().await;
                Some(String::from("killed after closing its streams"))
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.io_tasks {
            task.abort();
        }
    }
}

struct Slot {
    session: Option<Arc<Session>>,
    next_epoch: u64,
    /// Cleared by `stop()`; a scheduled restart only runs while set.
    wanted: bool,
    start_failures: u32,
    /// Until this instant, starts fail fast with the recorded error.
    retry_at: Option<(Instant, BridgeError)>,
    crashes: VecDeque<Instant>,
    /// A crash happened since the last successful start.
    recovering: bool,
}

pub(crate) struct ProcessSupervisor {
    config: AnalyzerConfig,
    policy: RestartPolicy,
    launcher: Launcher,
    cache: Arc<Mutex<CompilationCache>>,
    health: Arc<HealthMonitor>,
    slot: Mutex<Slot>,
    /// Copy of `slot.session` readable while a start holds the slot.
    live: std::sync::Mutex<Option<Arc<Session>>>,
    state: watch::Sender<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(
        config: AnalyzerConfig,
        policy: RestartPolicy,
        launcher: Launcher,
        cache: Arc<Mutex<CompilationCache>>,
        health: Arc<HealthMonitor>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Arc::new(Self {
            config,
            policy,
            launcher,
            cache,
            health,
            slot: Mutex::new(Slot {
                session: None,
                next_epoch: 1,
                wanted: false,
                start_failures: 0,
                retry_at: None,
                crashes: VecDeque::new(),
                recovering: false,
            }),
            live: std::sync::Mutex::new(None),
            state,
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn live_session(&self) -> Option<Arc<Session>> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The ready session, starting one if needed.
    ///
    /// Callers that arrive while a start is in flight wait for it and get
    /// the same session (or the same failure).
    pub async fn ensure_session(self: &Arc<Self>) -> Result<Arc<Session>, BridgeError> {
        let mut slot = self.slot.lock().await;
        slot.wanted = true;

        if let Some(session) = &slot.session
            && session.is_open()
        {
            return Ok(session.clone());
        }
        // Closed, but the exit watcher has not run yet.
        if let Some(session) = slot.session.take() {
            let reason = session.channel.close_reason().unwrap_or_default();
            self.crash_locked(&mut slot, session, reason).await;
        }

        self.start_locked(&mut slot).await
    }

    /// Stop the live session, if any. Pending requests fail with
    /// `ProcessTerminated` and the cache is cleared.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        slot.wanted = false;
        let Some(session) = slot.session.take() else {
            self.set_state(SupervisorState::Stopped);
            return;
        };
        self.install(&mut slot, None);

        self.set_state(SupervisorState::Stopping);
        tracing::info!(pid = session.pid, "Stopping analyzer");
        session.shutdown(self.config.stop_grace()).await;

        let failed = session
            .correlator
            .fail_all(BridgeError::terminated("analyzer stopped"))
            .await;
        self.cache.lock().await.clear();
        self.set_state(SupervisorState::Stopped);
        tracing::info!(pid = session.pid, failed, "Analyzer stopped");
    }

    fn install(&self, slot: &mut Slot, session: Option<Arc<Session>>) {
        slot.session.clone_from(&session);
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = previous.label(), to = state.label(), "Analyzer state changed");
        }
    }

    fn prune_crashes(&self, slot: &mut Slot, now: Instant) {
        let window = self.policy.window();
        while slot
            .crashes
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            slot.crashes.pop_front();
        }
    }

    fn restart_budget_exhausted(&self, slot: &Slot) -> bool {
        slot.crashes.len() > self.policy.max_restarts as usize
    }

    async fn start_locked(self: &Arc<Self>, slot: &mut Slot) -> Result<Arc<Session>, BridgeError> {
        let now = Instant::now();
        if let Some((at, err)) = &slot.retry_at
            && now < *at
        {
            return Err(err.clone());
        }
        self.prune_crashes(slot, now);
        if self.restart_budget_exhausted(slot) {
            return Err(BridgeError::startup(format!(
                "restart limit reached: {} crashes within {:?}",
                slot.crashes.len(),
                self.policy.window()
            )));
        }

        let epoch = slot.next_epoch;
        slot.next_epoch += 1;
        self.set_state(SupervisorState::Starting);

        match self.launch(epoch).await {
            Ok(session) => {
                slot.start_failures = 0;
                slot.retry_at = None;
                if std::mem::take(&mut slot.recovering) {
                    self.health.record_restart();
                }
                self.install(slot, Some(session.clone()));
                self.set_state(SupervisorState::Ready);
                tracing::info!(pid = session.pid, epoch, "Analyzer ready");
                Ok(session)
            }
            Err(err) => {
                let delay = self.policy.delay(slot.start_failures);
                slot.start_failures = slot.start_failures.saturating_add(1);
                slot.retry_at = Some((Instant::now() + delay, err.clone()));
                tracing::warn!("{err}; next start allowed in {delay:?}");
                self.health.record_error(err.to_string());
                self.set_state(SupervisorState::Stopped);
                Err(err)
            }
        }
    }

    async fn launch(self: &Arc<Self>, epoch: u64) -> Result<Arc<Session>, BridgeError> {
        let Transport {
            reader,
            writer,
            stderr,
            child,
        } = (self.launcher)().await?;
        let pid = child.as_ref().and_then(Child::id);

        let correlator = Arc::new(RequestCorrelator::new());
        let inbound = Arc::new(SessionInbound {
            correlator: correlator.clone(),
            health: self.health.clone(),
        });
        let (channel, mut io_tasks) = ProtocolChannel::spawn(reader, writer, inbound);
        if let Some(stderr) = stderr {
            io_tasks.push(spawn_stderr_logger(stderr, pid));
        }
        spawn_sweeper(
            correlator.clone(),
            channel.subscribe_closed(),
            self.config.sweep_interval(),
        );
        spawn_exit_watcher(Arc::downgrade(self), epoch, channel.subscribe_closed());

        let session = Arc::new(Session {
            epoch,
            channel,
            correlator,
            pid,
            child: Mutex::new(child),
            io_tasks,
            request_timeout: self.config.request_timeout(),
        });

        let probe = session.correlator.issue(
            &session.channel,
            METHOD_GET_VERSION,
            serde_json::json!({}),
            self.config.probe_timeout(),
        );
        let outcome = tokio::select! {
            outcome = probe => outcome,
            reason = session.channel.wait_closed() => Err(BridgeError::terminated(reason)),
        };

        match outcome {
            Ok(reply) => {
                let version = reply
                    .get("version")
                    .and_then(serde_json::Value::as_str)
                    .or_else(|| reply.as_str())
                    .map(String::from);
                tracing::debug!(pid, version = version.as_deref(), "Readiness probe answered");
                self.health.set_version(version);
            }
            Err(BridgeError::Remote { code, message }) => {
                // It answered, so it is up; it just has no version query.
                tracing::warn!("Analyzer rejected {METHOD_GET_VERSION} ({code}: {message})");
                self.health.set_version(None);
            }
            Err(err) => {
                session.kill().await;
                return Err(BridgeError::startup(format!("readiness probe failed: {err}")));
            }
        }
        Ok(session)
    }

    async fn handle_session_end(self: &Arc<Self>, epoch: u64, reason: String) {
        let mut slot = self.slot.lock().await;
        let is_current = slot.session.as_ref().is_some_and(|s| s.epoch == epoch);
        if !is_current {
            return;
        }
        if let Some(session) = slot.session.take() {
            self.crash_locked(&mut slot, session, reason).await;
        }
    }

    async fn crash_locked(self: &Arc<Self>, slot: &mut Slot, session: Arc<Session>, reason: String) {
        self.install(slot, None);
        let reason = match session.reap().await {
            Some(status) => format!("{reason} ({status})"),
            None => reason,
        };
        tracing::warn!(pid = session.pid, "Analyzer exited unexpectedly: {reason}");

        self.set_state(SupervisorState::Crashed);
        self.cache.lock().await.clear();
        self.health.record_crash(&reason);
        tracing::debug!(crashes = self.health.crash_count(), "Recorded analyzer crash");
        let failed = session
            .correlator
            .fail_all(BridgeError::terminated(reason))
            .await;
        self.set_state(SupervisorState::Stopped);
        tracing::debug!(failed, "Failed requests pending at crash");

        let now = Instant::now();
        slot.recovering = true;
        slot.crashes.push_back(now);
        self.prune_crashes(slot, now);

        if !slot.wanted {
            return;
        }
        if self.restart_budget_exhausted(slot) {
            let message = format!(
                "{} crashes within {:?}; automatic restarts paused",
                slot.crashes.len(),
                self.policy.window()
            );
            tracing::warn!("{message}");
            self.health.record_error(message);
            return;
        }

        let step = u32::try_from(slot.crashes.len().saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.policy.delay(step);
        tracing::info!(?delay, "Scheduling analyzer restart");
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.restart_after_crash().await;
            }
        });
    }

    async fn restart_after_crash(self: &Arc<Self>) {
        let mut slot = self.slot.lock().await;
        if !slot.wanted || slot.session.is_some() {
            return;
        }
        match self.start_locked(&mut slot).await {
            Ok(_) => tracing::info!("Analyzer restarted"),
            Err(err) => tracing::warn!("Automatic restart failed: {err}"),
        }
    }
}

fn spawn_sweeper(
    correlator: Arc<RequestCorrelator>,
    closed: watch::Receiver<Option<String>>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let closed = channel::wait_closed(closed);
        tokio::pin!(closed);
        loop {
            tokio::select! {
                _ = &mut closed => return,
                _ = ticker.tick() => {
                    correlator.timeout_sweep(Instant::now()).await;
                }
            }
        }
    })
}

fn spawn_exit_watcher(
    supervisor: Weak<ProcessSupervisor>,
    epoch: u64,
    closed: watch::Receiver<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = channel::wait_closed(closed).await;
        if let Some(supervisor) = supervisor.upgrade() {
            supervisor.handle_session_end(epoch, reason).await;
        }
    })
}
