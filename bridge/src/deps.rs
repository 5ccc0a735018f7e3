//! Cross-file dependency edges between compiled documents.
//!
//! An edge `(dependent, dependency)` means compiling `dependent` resolved
//! symbols from `dependency` (inherit, import, `#include`). Reverse edges are
//! kept alongside so "who must be recompiled if this file changes" is a walk
//! over `O(edges)`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    /// dependent → its dependencies
    forward: HashMap<PathBuf, HashSet<PathBuf>>,
    /// dependency → the paths that depend on it
    reverse: HashMap<PathBuf, HashSet<PathBuf>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent edge insertion. Self-edges carry no information and are dropped.
    pub fn record_dependency(&mut self, dependent: &Path, dependency: &Path) {
        if dependent == dependency {
            return;
        }
        self.forward
            .entry(dependent.to_path_buf())
            .or_default()
            .insert(dependency.to_path_buf());
        self.reverse
            .entry(dependency.to_path_buf())
            .or_default()
            .insert(dependent.to_path_buf());
    }

    /// Every path that depends on `path`, directly or transitively.
    ///
    /// `path` itself is never part of the result, even inside a cycle.
    pub fn dependents_of(&self, path: &Path) -> BTreeSet<PathBuf> {
        let mut visited: HashSet<&Path> = HashSet::new();
        visited.insert(path);
        let mut stack: Vec<&Path> = vec![path];
        let mut out = BTreeSet::new();

        while let Some(current) = stack.pop() {
            let Some(dependents) = self.reverse.get(current) else {
                continue;
            };
            for dependent in dependents {
                if visited.insert(dependent.as_path()) {
                    out.insert(dependent.clone());
                    stack.push(dependent.as_path());
                }
            }
        }
        out
    }

    /// Direct dependencies of `path`.
    pub fn dependencies_of(&self, path: &Path) -> BTreeSet<PathBuf> {
        self.forward
            .get(path)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all outgoing edges of `path`. Incoming edges stay: other files
    /// still depend on it.
    pub fn clear(&mut self, path: &Path) {
        let Some(deps) = self.forward.remove(path) else {
            return;
        };
        for dep in deps {
            if let Some(dependents) = self.reverse.get_mut(&dep) {
                dependents.remove(path);
                if dependents.is_empty() {
                    self.reverse.remove(&dep);
                }
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(HashSet::len).sum()
    }
}
