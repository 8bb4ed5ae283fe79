//! Origin-based opt-out from interception
//!
//! Code whose source path starts with a registered prefix is never handed
//! to the hook callback. The machinery's own synthesized bodies carry the
//! [`INTERNAL_ORIGIN`] path and are always skipped, which keeps a callback
//! that itself runs generated code from re-entering the pipeline.
//!
//! The prefix set is fixed at construction. The process-wide set is seeded
//! from `DYNATRON_SKIP_PREFIXES`, a colon-separated list of path prefixes,
//! read once at first use.

use std::sync::{Arc, LazyLock};

use tracing::debug;

/// Source path given to internally synthesized code bodies
pub const INTERNAL_ORIGIN: &str = "<dynatron>";

const ENV_SKIP_PREFIXES: &str = "DYNATRON_SKIP_PREFIXES";

static GLOBAL_SKIP: LazyLock<Arc<SkipSet>> = LazyLock::new(|| Arc::new(SkipSet::from_env()));

/// A set of source-path prefixes excluded from interception
///
/// Immutable once built; registering prefixes happens only through
/// [`SkipSet::with_prefixes`] or the environment.
#[derive(Debug)]
pub struct SkipSet {
    prefixes: Vec<Box<str>>,
}

impl Default for SkipSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipSet {
    /// A set containing only the internal origin
    pub fn new() -> Self {
        Self::with_prefixes(std::iter::empty::<&str>())
    }

    /// Build a set from the given prefixes
    ///
    /// The internal origin is always included.
    pub fn with_prefixes<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Box<str>>,
    {
        let mut list: Vec<Box<str>> = vec![INTERNAL_ORIGIN.into()];
        list.extend(prefixes.into_iter().map(Into::into));
        Self { prefixes: list }
    }

    fn from_env() -> Self {
        match std::env::var(ENV_SKIP_PREFIXES) {
            Ok(raw) => {
                let set = Self::with_prefixes(raw.split(':').filter(|p| !p.is_empty()));
                debug!(
                    target: "dynatron::skipfiles",
                    prefixes = %raw,
                    "seeded skip prefixes from environment"
                );
                set
            }
            Err(_) => Self::new(),
        }
    }

    /// Handle to the process-wide skip set
    pub fn global() -> Arc<SkipSet> {
        GLOBAL_SKIP.clone()
    }

    /// Check whether a source path is excluded
    pub fn contains(&self, path: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_ref()))
    }
}
