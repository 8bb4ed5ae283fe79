//! Process-wide specialization cache
//!
//! Maps a code body's identity to the guarded artifacts produced for it.
//! Artifact lists are append-only and kept in insertion order, and lookup
//! returns the first artifact whose full guard conjunction passes, so older
//! specializations always win ties over newer ones. There is no eviction;
//! in a long-lived process with unbounded distinct code objects the cache
//! grows without limit.
//!
//! A bounded LRU memo keyed by structural hash remembers recent link
//! failures, so repeatedly intercepting a body whose transform cannot link
//! skips straight to fallback without re-running the pipeline.

use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bytecode::{CodeBody, CodeId, LinkError};
use crate::frame::Frame;
use crate::guards::GuardedArtifact;

const ENV_LINK_MEMO_SIZE: &str = "DYNATRON_LINK_MEMO_SIZE";
const DEFAULT_LINK_MEMO_SIZE: usize = 4096;

static GLOBAL_CACHE: LazyLock<Arc<SpecializationCache>> =
    LazyLock::new(|| Arc::new(SpecializationCache::new()));

/// Cached disposition of one code identity
#[derive(Debug, Clone)]
enum CacheEntry {
    /// Permanently opted out; the callback is never consulted again
    Skip,
    /// Specializations in insertion order
    Artifacts(SmallVec<[Arc<GuardedArtifact>; 2]>),
}

/// Specialization cache, safe for concurrent use
pub struct SpecializationCache {
    entries: DashMap<CodeId, CacheEntry>,
    link_failures: Mutex<LruCache<u64, LinkError>>,
}

impl std::fmt::Debug for SpecializationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecializationCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Default for SpecializationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecializationCache {
    pub fn new() -> Self {
        let memo_size = std::env::var(ENV_LINK_MEMO_SIZE)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .and_then(NonZeroUsize::new)
            .unwrap_or_else(|| {
                NonZeroUsize::new(DEFAULT_LINK_MEMO_SIZE)
                    .unwrap_or(NonZeroUsize::MIN)
            });
        Self {
            entries: DashMap::new(),
            link_failures: Mutex::new(LruCache::new(memo_size)),
        }
    }

    /// Handle to the process-wide cache
    pub fn global() -> Arc<SpecializationCache> {
        GLOBAL_CACHE.clone()
    }

    /// Permanently mark a code identity as skipped
    ///
    /// Overrides any artifacts already recorded; later inserts are ignored.
    pub fn mark_skip(&self, id: CodeId) {
        debug!(target: "dynatron::cache", code = %id, "marked skip");
        self.entries.insert(id, CacheEntry::Skip);
    }

    /// Check for the skip sentinel
    pub fn is_skipped(&self, id: CodeId) -> bool {
        matches!(self.entries.get(&id).as_deref(), Some(CacheEntry::Skip))
    }

    /// Append a specialization for a code identity
    pub fn insert(&self, id: CodeId, artifact: GuardedArtifact) {
        let artifact = Arc::new(artifact);
        let mut entry = self
            .entries
            .entry(id)
            .or_insert_with(|| CacheEntry::Artifacts(SmallVec::new()));
        match entry.value_mut() {
            CacheEntry::Skip => {
                debug!(target: "dynatron::cache", code = %id, "insert ignored for skipped code");
            }
            CacheEntry::Artifacts(list) => {
                list.push(artifact);
                debug!(
                    target: "dynatron::cache",
                    code = %id,
                    entries = list.len(),
                    "specialization recorded"
                );
            }
        }
    }

    /// Number of artifacts recorded for a code identity
    pub fn entry_count(&self, id: CodeId) -> usize {
        match self.entries.get(&id).as_deref() {
            Some(CacheEntry::Artifacts(list)) => list.len(),
            _ => 0,
        }
    }

    /// Find the first artifact whose guards all pass for `frame`
    ///
    /// Guard evaluation runs against a snapshot of the artifact list, after
    /// the map lock is released; custom guards may run arbitrary reads.
    pub fn lookup(&self, frame: &Frame) -> Option<Arc<CodeBody>> {
        let id = frame.code().id();
        let snapshot: SmallVec<[Arc<GuardedArtifact>; 2]> =
            match self.entries.get(&id).as_deref() {
                Some(CacheEntry::Artifacts(list)) => list.clone(),
                _ => return None,
            };

        let view = frame.view();
        for artifact in &snapshot {
            if artifact.matches(&view) {
                trace!(
                    target: "dynatron::cache",
                    code = %id,
                    specialized = %artifact.code().id(),
                    "cache hit"
                );
                return Some(artifact.code().clone());
            }
        }
        trace!(target: "dynatron::cache", code = %id, "all guards failed");
        None
    }

    /// Remember that linking a body with this structural hash failed
    pub fn record_link_failure(&self, structural_hash: u64, error: LinkError) {
        self.link_failures.lock().put(structural_hash, error);
    }

    /// Look up a recently recorded link failure
    pub fn recent_link_failure(&self, structural_hash: u64) -> Option<LinkError> {
        self.link_failures.lock().get(&structural_hash).cloned()
    }
}
