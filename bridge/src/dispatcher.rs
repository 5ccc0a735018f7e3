//! Public entry point: analysis requests in, cached or fresh results out.

use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, watch};

use crate::analysis::{AnalysisResult, Document, Operation};
use crate::cache::{CacheStats, CompilationCache};
use crate::error::BridgeError;
use crate::health::{HealthMonitor, HealthStatus};
use crate::protocol::{self, METHOD_ANALYZE};
use crate::supervisor::ProcessSupervisor;
use crate::transport::{Launcher, process_launcher};
use crate::types::{BridgeConfig, SupervisorState};
use crate::validate::{self, AnalyzeOutcome};

/// One analyzer session with its own cache and health bookkeeping.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. The analyzer
/// is started lazily by the first [`Dispatcher::analyze`] unless
/// [`Dispatcher::start`] is called first.
pub struct Dispatcher {
    supervisor: Arc<ProcessSupervisor>,
    cache: Arc<Mutex<CompilationCache>>,
    health: Arc<HealthMonitor>,
}

impl Dispatcher {
    /// Dispatcher that spawns `config.analyzer.command`.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let launcher = process_launcher(&config.analyzer);
        Self::with_launcher(config, launcher)
    }

    /// Dispatcher whose sessions come from `launcher`.
    #[must_use]
    pub fn with_launcher(config: BridgeConfig, launcher: Launcher) -> Self {
        let cache = Arc::new(Mutex::new(CompilationCache::new(config.cache.max_entries)));
        let health = Arc::new(HealthMonitor::new());
        let supervisor = ProcessSupervisor::new(
            config.analyzer,
            config.restart,
            launcher,
            cache.clone(),
            health.clone(),
        );
        Self {
            supervisor,
            cache,
            health,
        }
    }

    /// Start the analyzer now instead of on first use.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.supervisor.ensure_session().await.map(|_| ())
    }

    /// Run `operations` on `document`.
    ///
    /// Operations already cached under the document's key are served from
    /// the cache; the rest go to the analyzer in a single `analyze` request.
    /// Per-operation failures are part of the result. `Err` means the bridge
    /// itself failed: the analyzer could not be started, timed out, died, or
    /// replied with something that is not an analysis.
    pub async fn analyze(
        &self,
        document: &Document,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Result<AnalysisResult, BridgeError> {
        let requested: BTreeSet<Operation> = operations.into_iter().collect();
        if requested.is_empty() {
            return Ok(AnalysisResult::new(
                BTreeMap::new(),
                BTreeMap::new(),
                BTreeSet::new(),
                true,
            ));
        }
        let key = document.key();

        let (cached, epoch) = {
            let mut cache = self.cache.lock().await;
            let cached = cache.get(&key).map(|entry| {
                let results: BTreeMap<Operation, serde_json::Value> = entry
                    .results
                    .iter()
                    .filter(|(op, _)| requested.contains(op))
                    .map(|(op, value)| (*op, value.clone()))
                    .collect();
                (results, entry.dependencies.clone())
            });
            (cached, cache.epoch())
        };
        let (mut results, cached_dependencies) = cached.unwrap_or_default();

        let missing: BTreeSet<Operation> = requested
            .iter()
            .filter(|op| !results.contains_key(op))
            .copied()
            .collect();
        if missing.is_empty() {
            tracing::trace!(path = %document.path().display(), "Served analysis from cache");
            return Ok(AnalysisResult::new(
                results,
                BTreeMap::new(),
                cached_dependencies,
                true,
            ));
        }

        let session = self.supervisor.ensure_session().await?;
        let generation = self.cache.lock().await.generation();
        let started = Instant::now();
        let params = protocol::analyze_params(document, &missing);

        let outcome = match session.request(METHOD_ANALYZE, params).await {
            Ok(reply) => validate::analyze_response(&reply, &missing).map_err(|err| {
                tracing::warn!(path = %document.path().display(), "Invalid analyze reply: {err}");
                self.health.record_error(format!("protocol error: {err}"));
                BridgeError::from(err)
            })?,
            Err(BridgeError::Remote { code, message }) => {
                tracing::debug!(code, "analyze answered with an error: {message}");
                AnalyzeOutcome::remote_error(&missing, code, &message)
            }
            Err(err) => {
                self.health.record_error(err.to_string());
                return Err(err);
            }
        };
        tracing::debug!(
            path = %document.path().display(),
            fingerprint = %document.fingerprint(),
            requested = missing.len(),
            succeeded = outcome.results.len(),
            elapsed = ?started.elapsed(),
            "Analyzed document"
        );

        let AnalyzeOutcome {
            results: fresh,
            failures,
            dependencies,
        } = outcome;

        if fresh.is_empty() {
            return Ok(AnalysisResult::new(
                results,
                failures,
                cached_dependencies,
                false,
            ));
        }

        {
            let mut cache = self.cache.lock().await;
            let stale_inputs = cache.invalidated_since(
                epoch,
                iter::once(document.path()).chain(dependencies.iter().map(PathBuf::as_path)),
            );
            if cache.generation() != generation {
                tracing::debug!(
                    path = %document.path().display(),
                    "Analyzer session ended mid-request; not caching"
                );
            } else if stale_inputs {
                tracing::debug!(
                    path = %document.path().display(),
                    "Inputs invalidated mid-request; not caching"
                );
            } else {
                let mut merged = cache
                    .peek(&key)
                    .map(|entry| entry.results.clone())
                    .unwrap_or_default();
                merged.extend(fresh.iter().map(|(op, value)| (*op, value.clone())));
                cache.put(key, merged, dependencies.clone());
            }
        }

        results.extend(fresh);
        Ok(AnalysisResult::new(results, failures, dependencies, false))
    }

    /// Drop cached results for `path` (and, with `transitive`, for everything
    /// that depends on it). Returns how many entries were removed.
    pub async fn invalidate(&self, path: &Path, transitive: bool) -> usize {
        self.cache.lock().await.invalidate(path, transitive)
    }

    /// Paths whose cached results depend on `path`, directly or transitively.
    pub async fn dependents_of(&self, path: &Path) -> BTreeSet<PathBuf> {
        self.cache.lock().await.dependents_of(path)
    }

    /// Files the cached results for `path` were compiled against.
    pub async fn dependencies_of(&self, path: &Path) -> BTreeSet<PathBuf> {
        self.cache.lock().await.dependencies_of(path)
    }

    pub async fn health(&self) -> HealthStatus {
        let session = self.supervisor.live_session();
        let (alive, pid, pending) = match &session {
            Some(session) => (
                session.is_open(),
                session.pid(),
                session.pending_count().await,
            ),
            None => (false, None, 0),
        };
        let cache = self.cache.lock().await.stats();
        self.health
            .snapshot(self.supervisor.state(), alive, pid, pending, cache)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    /// Watch supervisor state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.supervisor.subscribe()
    }

    /// Stop the analyzer. In-flight calls fail with `ProcessTerminated`; a
    /// later `analyze` starts a fresh process.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::analysis::FailureKind;
    use crate::fake::{FakeAnalyzer, Reply, success_for};
    use crate::types::{AnalyzerConfig, CacheConfig, RestartPolicy};

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            analyzer: AnalyzerConfig {
                request_timeout_ms: 2_000,
                probe_timeout_ms: 500,
                stop_grace_ms: 200,
                sweep_interval_ms: 20,
                ..AnalyzerConfig::default()
            },
            cache: CacheConfig { max_entries: 16 },
            restart: RestartPolicy {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                jitter: 0.0,
                ..RestartPolicy::default()
            },
        }
    }

    fn dispatcher(fake: &FakeAnalyzer) -> Dispatcher {
        Dispatcher::with_launcher(test_config(), fake.launcher())
    }

    fn doc(path: &str, version: i64) -> Document {
        Document::open(path, version, "int main() { return 0; }")
    }

    #[tokio::test]
    async fn test_open_document_versions_scenario() {
        let fake = FakeAnalyzer::cooperative();
        let bridge = dispatcher(&fake);

        let first = bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        assert!(!first.from_cache());
        assert!(first.get(Operation::Parse).is_some());
        assert_eq!(fake.requests("analyze").len(), 1);

        let second = bridge.analyze(&doc("a.pike", 2), [Operation::Parse]).await.unwrap();
        assert!(!second.from_cache());
        assert_eq!(fake.requests("analyze").len(), 2);

        let again = bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        assert!(again.from_cache());
        assert_eq!(again.get(Operation::Parse), first.get(Operation::Parse));
        assert_eq!(fake.requests("analyze").len(), 2);

        let stats = bridge.cache_stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_operations_share_one_round_trip() {
        let fake = FakeAnalyzer::cooperative();
        let bridge = dispatcher(&fake);

        let result = bridge
            .analyze(
                &doc("a.pike", 1),
                [Operation::Parse, Operation::Introspect, Operation::Diagnostics],
            )
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(result.results().len(), 3);

        let requests = fake.requests("analyze");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["filename"], "a.pike");
        assert_eq!(
            requests[0]["include"],
            json!(["parse", "introspect", "diagnostics"])
        );
    }

    #[tokio::test]
    async fn test_partial_hit_requests_only_missing_operations() {
        let fake = FakeAnalyzer::cooperative();
        let bridge = dispatcher(&fake);
        let document = doc("a.pike", 1);

        bridge.analyze(&document, [Operation::Parse]).await.unwrap();
        let result = bridge
            .analyze(&document, [Operation::Parse, Operation::Tokenize])
            .await
            .unwrap();
        assert!(!result.from_cache());
        assert!(result.get(Operation::Parse).is_some());
        assert!(result.get(Operation::Tokenize).is_some());

        let requests = fake.requests("analyze");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["include"], json!(["tokenize"]));

        // Both now come from the single merged entry.
        let cached = bridge
            .analyze(&document, [Operation::Tokenize, Operation::Parse])
            .await
            .unwrap();
        assert!(cached.from_cache());
        assert_eq!(bridge.cache_stats().await.size, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successful_results() {
        let fake = FakeAnalyzer::new(|_, _| {
            Reply::Result(json!({
                "result": { "parse": { "symbols": [{ "name": "main" }] } },
                "failures": { "introspect": { "message": "Compilation failed." } }
            }))
        });
        let bridge = dispatcher(&fake);
        let document = doc("a.pike", 1);

        let result = bridge
            .analyze(&document, [Operation::Parse, Operation::Introspect])
            .await
            .unwrap();
        assert_eq!(result.get(Operation::Parse).unwrap()["symbols"][0]["name"], "main");
        let failure = result.failure(Operation::Introspect).unwrap();
        assert_eq!(failure.kind(), &FailureKind::Reported);
        assert_eq!(failure.message(), "Compilation failed.");
        assert!(!result.is_complete());

        // Only the success was cached; the failed operation is asked again.
        let again = bridge
            .analyze(&document, [Operation::Parse, Operation::Introspect])
            .await
            .unwrap();
        assert!(!again.from_cache());
        let requests = fake.requests("analyze");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["include"], json!(["introspect"]));
    }

    #[tokio::test]
    async fn test_all_failed_is_not_cached() {
        let fake = FakeAnalyzer::new(|_, _| {
            Reply::Result(json!({ "failures": { "parse": "syntax error" } }))
        });
        let bridge = dispatcher(&fake);

        let result = bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        assert!(result.results().is_empty());
        assert_eq!(bridge.cache_stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_invalid_shape_becomes_failure() {
        let fake = FakeAnalyzer::new(|_, _| {
            Reply::Result(json!({
                "result": { "parse": 0, "tokenize": { "tokens": [] } }
            }))
        });
        let bridge = dispatcher(&fake);

        let result = bridge
            .analyze(&doc("a.pike", 1), [Operation::Parse, Operation::Tokenize])
            .await
            .unwrap();
        assert!(result.get(Operation::Tokenize).is_some());
        assert_eq!(
            result.failure(Operation::Parse).unwrap().kind(),
            &FailureKind::InvalidShape
        );
    }

    #[tokio::test]
    async fn test_bad_envelope_is_protocol_error() {
        let fake = FakeAnalyzer::new(|_, _| Reply::Result(json!(42)));
        let bridge = dispatcher(&fake);

        let err = bridge
            .analyze(&doc("a.pike", 1), [Operation::Parse])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        let health = bridge.health().await;
        assert!(health.recent_errors.iter().any(|e| e.starts_with("protocol error")));
    }

    #[tokio::test]
    async fn test_wire_error_fails_each_operation() {
        let fake = FakeAnalyzer::new(|_, _| Reply::Error {
            code: -32000,
            message: "analyzer exception".to_string(),
        });
        let bridge = dispatcher(&fake);

        let result = bridge
            .analyze(&doc("a.pike", 1), [Operation::Parse, Operation::Diagnostics])
            .await
            .unwrap();
        for op in [Operation::Parse, Operation::Diagnostics] {
            let failure = result.failure(op).unwrap();
            assert_eq!(failure.kind(), &FailureKind::Remote { code: -32000 });
        }
    }

    #[tokio::test]
    async fn test_dependencies_drive_transitive_invalidation() {
        let fake = FakeAnalyzer::new(|_, params| {
            let mut reply = success_for(params);
            match params["filename"].as_str() {
                Some("/w/main.pike") => reply["dependencies"] = json!(["/w/base.pike"]),
                Some("/w/base.pike") => reply["dependencies"] = json!(["/w/globals.h"]),
                _ => {}
            }
            Reply::Result(reply)
        });
        let bridge = dispatcher(&fake);

        let main = bridge
            .analyze(&doc("/w/main.pike", 1), [Operation::Parse])
            .await
            .unwrap();
        assert!(main.dependencies().contains(Path::new("/w/base.pike")));
        bridge.analyze(&doc("/w/base.pike", 1), [Operation::Parse]).await.unwrap();
        bridge.analyze(&doc("/w/other.pike", 1), [Operation::Parse]).await.unwrap();

        assert_eq!(
            bridge.dependencies_of(Path::new("/w/main.pike")).await,
            BTreeSet::from([PathBuf::from("/w/base.pike")])
        );
        let dependents = bridge.dependents_of(Path::new("/w/globals.h")).await;
        assert_eq!(
            dependents,
            BTreeSet::from([PathBuf::from("/w/base.pike"), PathBuf::from("/w/main.pike")])
        );

        assert_eq!(bridge.invalidate(Path::new("/w/globals.h"), true).await, 2);
        assert_eq!(bridge.invalidate(Path::new("/w/globals.h"), true).await, 0);
        assert_eq!(bridge.cache_stats().await.size, 1);

        let again = bridge.analyze(&doc("/w/main.pike", 1), [Operation::Parse]).await.unwrap();
        assert!(!again.from_cache());
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_their_own_results() {
        let fake = FakeAnalyzer::new(|_, params| {
            let name = params["filename"].as_str().unwrap_or_default().to_string();
            let n: u64 = name.trim_end_matches(".pike").trim_start_matches('f').parse().unwrap();
            // Later files answer sooner, so replies arrive out of order.
            Reply::Delayed(
                Duration::from_millis(80 - n * 10),
                json!({ "result": { "parse": { "symbols": [name] } } }),
            )
        });
        let bridge = Arc::new(dispatcher(&fake));
        bridge.start().await.unwrap();

        let mut calls = Vec::new();
        for n in 0..8 {
            let bridge = bridge.clone();
            calls.push(tokio::spawn(async move {
                let name = format!("f{n}.pike");
                let result = bridge.analyze(&doc(&name, 1), [Operation::Parse]).await.unwrap();
                (name, result)
            }));
        }
        for call in calls {
            let (name, result) = call.await.unwrap();
            assert_eq!(result.get(Operation::Parse).unwrap()["symbols"][0], name.as_str());
        }
        assert_eq!(fake.launches(), 1);
    }

    #[tokio::test]
    async fn test_crash_clears_cache_and_rejects_pending() {
        let silent = Arc::new(AtomicUsize::new(0));
        let fake = {
            let silent = silent.clone();
            FakeAnalyzer::new(move |_, params| {
                if silent.load(Ordering::SeqCst) > 0 {
                    Reply::Ignore
                } else {
                    Reply::Result(success_for(params))
                }
            })
        };
        let bridge = Arc::new(dispatcher(&fake));

        bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        bridge.analyze(&doc("b.pike", 1), [Operation::Parse]).await.unwrap();
        assert_eq!(bridge.cache_stats().await.size, 2);

        silent.store(1, Ordering::SeqCst);
        let mut pending = Vec::new();
        for name in ["c.pike", "d.pike", "e.pike"] {
            let bridge = bridge.clone();
            pending.push(tokio::spawn(async move {
                bridge.analyze(&doc(name, 1), [Operation::Parse]).await
            }));
        }
        while bridge.health().await.pending_requests < 3 {
            tokio::task::yield_now().await;
        }

        fake.crash();
        for call in pending {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::ProcessTerminated { .. }), "{err:?}");
        }
        assert_eq!(bridge.cache_stats().await.size, 0);
        let health = bridge.health().await;
        assert_eq!(health.crash_count, 1);
        assert!(health.recent_errors.iter().any(|e| e.contains("crashed")));
    }

    #[tokio::test]
    async fn test_analyzer_dying_mid_reply_rejects_the_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fake = {
            let calls = calls.clone();
            FakeAnalyzer::new(move |_, params| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::Result(success_for(params))
                } else {
                    Reply::Crash
                }
            })
        };
        let bridge = dispatcher(&fake);
        bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();

        let err = bridge
            .analyze(&doc("b.pike", 1), [Operation::Parse])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProcessTerminated { .. }), "{err:?}");

        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.health().await.crash_count == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(bridge.cache_stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_bridge_recovers_after_crash() {
        let fake = FakeAnalyzer::cooperative();
        let bridge = dispatcher(&fake);
        bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();

        fake.crash();
        let mut states = bridge.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == SupervisorState::Crashed || *s == SupervisorState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        let result = bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        assert!(!result.from_cache());
        assert_eq!(fake.launches(), 2);
    }

    #[tokio::test]
    async fn test_timeout_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fake = {
            let calls = calls.clone();
            FakeAnalyzer::new(move |_, params| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::Ignore
                } else {
                    Reply::Result(success_for(params))
                }
            })
        };
        let mut config = test_config();
        config.analyzer.request_timeout_ms = 100;
        let bridge = Dispatcher::with_launcher(config, fake.launcher());

        let err = bridge
            .analyze(&doc("a.pike", 1), [Operation::Parse])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert!(err.is_retryable());

        let result = bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        assert!(result.get(Operation::Parse).is_some());
        assert_eq!(fake.launches(), 1);
        assert_eq!(bridge.state(), SupervisorState::Ready);
    }

    #[tokio::test]
    async fn test_startup_failure_surfaces_once_with_backoff() {
        let fake = FakeAnalyzer::cooperative();
        fake.set_fail_launch(true);
        let mut config = test_config();
        config.restart.initial_delay_ms = 60_000;
        config.restart.max_delay_ms = 60_000;
        let bridge = Dispatcher::with_launcher(config, fake.launcher());

        for _ in 0..3 {
            let err = bridge
                .analyze(&doc("a.pike", 1), [Operation::Parse])
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::StartupFailure { .. }));
        }
        assert_eq!(fake.launches(), 1);
        assert_eq!(bridge.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_then_lazy_restart() {
        let fake = FakeAnalyzer::cooperative();
        let bridge = dispatcher(&fake);
        bridge.start().await.unwrap();
        let health = bridge.health().await;
        assert_eq!(health.state, SupervisorState::Ready);
        assert!(health.process_alive);
        bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();

        bridge.shutdown().await;
        assert_eq!(bridge.state(), SupervisorState::Stopped);
        assert_eq!(bridge.cache_stats().await.size, 0);
        assert!(!bridge.health().await.process_alive);

        bridge.analyze(&doc("a.pike", 1), [Operation::Parse]).await.unwrap();
        assert_eq!(fake.launches(), 2);
        assert_eq!(bridge.health().await.crash_count, 0);
    }

    #[tokio::test]
    async fn test_empty_operation_set_needs_no_analyzer() {
        let fake = FakeAnalyzer::cooperative();
        let bridge = dispatcher(&fake);
        let result = bridge.analyze(&doc("a.pike", 1), []).await.unwrap();
        assert!(result.results().is_empty());
        assert_eq!(fake.launches(), 0);

        let stats = bridge.cache_stats().await;
        assert_eq!((stats.hits, stats.misses), (0, 0));
    }

    #[tokio::test]
    async fn test_invalidation_during_compile_is_not_lost() {
        let fake = FakeAnalyzer::new(|_, params| {
            let mut reply = success_for(params);
            reply["dependencies"] = json!(["/w/base.pike"]);
            Reply::Delayed(Duration::from_millis(150), reply)
        });
        let bridge = Arc::new(dispatcher(&fake));

        let in_flight = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .analyze(&doc("/w/main.pike", 1), [Operation::Parse])
                    .await
            })
        };
        while bridge.health().await.pending_requests == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // base.pike changes while main.pike is still compiling against the old copy.
        assert_eq!(bridge.invalidate(Path::new("/w/base.pike"), true).await, 0);
        let first = in_flight.await.unwrap().unwrap();
        assert!(first.dependencies().contains(Path::new("/w/base.pike")));
        assert_eq!(bridge.cache_stats().await.size, 0);

        let second = bridge
            .analyze(&doc("/w/main.pike", 1), [Operation::Parse])
            .await
            .unwrap();
        assert!(!second.from_cache());
        assert_eq!(fake.requests("analyze").len(), 2);

        // With no invalidation in between, the fresh result is kept.
        let third = bridge
            .analyze(&doc("/w/main.pike", 1), [Operation::Parse])
            .await
            .unwrap();
        assert!(third.from_cache());
    }
}
