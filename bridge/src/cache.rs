//! Compilation cache: reuses analyzer results for unchanged sources.
//!
//! Entries are keyed by [`CacheKey`] (path + fingerprint) and bounded by
//! entry count with LRU eviction. Each path's dependency edges are the union
//! of the dependencies of that path's live entries, so an edge disappears
//! exactly when the last entry that reported it does.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::Serialize;

use crate::analysis::{CacheKey, Operation};
use crate::deps::DependencyGraph;

/// Hit/miss/eviction accounting. Counters only grow for the lifetime of the
/// cache, across session restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub results: BTreeMap<Operation, serde_json::Value>,
    pub dependencies: BTreeSet<PathBuf>,
    /// Approximate serialized size of `results`, for logs.
    pub size_hint: usize,
}

pub(crate) struct CompilationCache {
    entries: LruCache<CacheKey, CacheEntry>,
    by_path: HashMap<PathBuf, HashSet<CacheKey>>,
    graph: DependencyGraph,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
    /// Bumped by `clear()`; results computed under an older generation are
    /// never stored.
    generation: u64,
    /// Bumped by every `invalidate()`.
    epoch: u64,
    /// Epoch at which each path was last invalidated.
    invalidated_at: HashMap<PathBuf, u64>,
}

impl CompilationCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            by_path: HashMap::new(),
            graph: DependencyGraph::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            invalidations: 0,
            generation: 0,
            epoch: 0,
            invalidated_at: HashMap::new(),
        }
    }

    /// Look up `key`. A hit marks the entry most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up without touching recency or counters.
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    /// Insert or overwrite the entry for `key`, then rebuild the path's
    /// outgoing dependency edges.
    pub fn put(
        &mut self,
        key: CacheKey,
        results: BTreeMap<Operation, serde_json::Value>,
        dependencies: BTreeSet<PathBuf>,
    ) {
        let size_hint = results
            .values()
            .map(|v| serde_json::to_vec(v).map_or(0, |bytes| bytes.len()))
            .sum();
        let path = key.path.clone();
        let entry = CacheEntry {
            results,
            dependencies,
            size_hint,
        };

        if let Some((displaced, old)) = self.entries.push(key.clone(), entry)
            && displaced != key
        {
            self.evictions += 1;
            tracing::debug!(
                path = %displaced.path.display(),
                fingerprint = %displaced.fingerprint,
                bytes = old.size_hint,
                "Evicted least recently used cache entry"
            );
            self.unindex(&displaced);
            self.rebuild_edges(&displaced.path);
        }

        self.by_path.entry(path.clone()).or_default().insert(key);
        self.rebuild_edges(&path);
    }

    /// Remove every entry for `path`; with `transitive`, also every entry of
    /// every path that depends on it. Returns the number of entries removed.
    pub fn invalidate(&mut self, path: &Path, transitive: bool) -> usize {
        let mut targets = vec![path.to_path_buf()];
        if transitive {
            targets.extend(self.graph.dependents_of(path));
        }

        // Stamp targets even when nothing was cached: a compile may be in flight.
        self.epoch += 1;
        for target in &targets {
            self.invalidated_at.insert(target.clone(), self.epoch);
        }

        let removed: usize = targets.iter().map(|target| self.remove_path(target)).sum();
        if removed > 0 {
            self.invalidations += removed as u64;
            tracing::debug!(
                path = %path.display(),
                transitive,
                removed,
                edges = self.graph.edge_count(),
                "Invalidated cache entries"
            );
        }
        removed
    }

    /// Drop everything. Used when the analyzer session ends.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_path.clear();
        self.graph.clear_all();
        self.invalidated_at.clear();
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether any of `paths` was invalidated after `epoch` was read.
    pub fn invalidated_since<'a>(
        &self,
        epoch: u64,
        paths: impl IntoIterator<Item = &'a Path>,
    ) -> bool {
        paths
            .into_iter()
            .any(|path| self.invalidated_at.get(path).is_some_and(|at| *at > epoch))
    }

    pub fn dependents_of(&self, path: &Path) -> BTreeSet<PathBuf> {
        self.graph.dependents_of(path)
    }

    pub fn dependencies_of(&self, path: &Path) -> BTreeSet<PathBuf> {
        self.graph.dependencies_of(path)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            invalidations: self.invalidations,
            size: self.entries.len(),
            capacity: self.entries.cap().get(),
        }
    }

    fn remove_path(&mut self, path: &Path) -> usize {
        let removed = self.by_path.remove(path).map_or(0, |keys| {
            keys.iter()
                .filter(|key| self.entries.pop(*key).is_some())
                .count()
        });
        self.graph.clear(path);
        removed
    }

    fn unindex(&mut self, key: &CacheKey) {
        if let Some(keys) = self.by_path.get_mut(&key.path) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_path.remove(&key.path);
            }
        }
    }

    fn rebuild_edges(&mut self, path: &Path) {
        self.graph.clear(path);
        let Some(keys) = self.by_path.get(path) else {
            return;
        };
        for key in keys {
            if let Some(entry) = self.entries.peek(key) {
                for dep in &entry.dependencies {
                    self.graph.record_dependency(path, dep);
                }
            }
        }
    }
}
