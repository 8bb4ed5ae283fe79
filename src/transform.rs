//! Specialization pipeline
//!
//! The path from an intercepted frame to a guarded artifact: decode the
//! original body into an editable stream, hand the stream to a rewrite
//! function together with a read-only view of the frame, then relink the
//! result. The rewrite function returns the guards that justify its edit;
//! any failure abandons the attempt and the call falls back to the
//! original body.
//!
//! Link failures are memoized by the original body's structural hash, so a
//! hot call site whose rewrite cannot link stops paying for the pipeline
//! after the first attempt.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

#[cfg(debug_assertions)]
use crate::bytecode::debug_validate;
use crate::bytecode::{CompactEncoding, EditableStream, InstructionEncoding, LinkError};
use crate::cache::SpecializationCache;
use crate::frame::{Frame, FrameView};
use crate::guards::{Guard, GuardedArtifact};
use crate::hook::{HookCallback, HookDecision};
use crate::skipfiles::INTERNAL_ORIGIN;

/// Why a specialization attempt produced no artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The rewrite function declined this code
    Rejected(String),
    /// Decoding or relinking failed
    Link(LinkError),
    /// A previous attempt on an identical body already failed to link
    MemoizedFailure(LinkError),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rewrite rejected: {}", reason),
            Self::Link(err) => write!(f, "link failed: {}", err),
            Self::MemoizedFailure(err) => {
                write!(f, "link failed on a previous identical body: {}", err)
            }
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(_) => None,
            Self::Link(err) | Self::MemoizedFailure(err) => Some(err),
        }
    }
}

impl From<LinkError> for TransformError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

/// Rewrite function: edits the stream in place and returns the guards that
/// make the edit valid for future frames
pub type RewriteFn = Arc<
    dyn Fn(&mut EditableStream, &FrameView<'_>) -> Result<SmallVec<[Guard; 4]>, TransformError>
        + Send
        + Sync,
>;

/// Decode / rewrite / relink pipeline
#[derive(Clone)]
pub struct TransformPipeline {
    rewriter: RewriteFn,
    encoding: Arc<dyn InstructionEncoding>,
}

impl TransformPipeline {
    pub fn new(rewriter: RewriteFn) -> Self {
        Self { rewriter, encoding: Arc::new(CompactEncoding) }
    }

    /// Use a specific operand-width strategy when relinking
    pub fn with_encoding(mut self, encoding: Arc<dyn InstructionEncoding>) -> Self {
        self.encoding = encoding;
        self
    }

    /// Attempt to specialize `frame`'s code body
    ///
    /// `cache` supplies the link-failure memo; the artifact itself is not
    /// recorded here, that is the caller's decision.
    pub fn specialize(
        &self,
        frame: &Frame,
        cache: &SpecializationCache,
    ) -> Result<GuardedArtifact, TransformError> {
        let original = frame.code();
        let structural_hash = original.structural_hash();
        if let Some(err) = cache.recent_link_failure(structural_hash) {
            debug!(
                target: "dynatron::transform",
                code = %original.id(),
                "skipping pipeline, identical body failed to link recently"
            );
            return Err(TransformError::MemoizedFailure(err));
        }

        let mut stream = EditableStream::from_code(original)?;
        let rewrite_guards = (self.rewriter)(&mut stream, &frame.view())?;
        // Cheapest check first: every artifact implicitly guards on arity
        let mut guards: SmallVec<[Guard; 4]> = smallvec::smallvec![
            Guard::ArityEquals(original.arity())
        ];
        guards.extend(rewrite_guards);

        stream.set_name(format!("{}'", original.name()));
        stream.set_source_path(INTERNAL_ORIGIN);

        let linked = match stream.link(self.encoding.as_ref()) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    target: "dynatron::transform",
                    code = %original.id(),
                    error = %err,
                    "relink failed, falling back"
                );
                cache.record_link_failure(structural_hash, err.clone());
                return Err(TransformError::Link(err));
            }
        };

        #[cfg(debug_assertions)]
        debug_validate(original, &linked)?;

        debug!(
            target: "dynatron::transform",
            original = %original.id(),
            specialized = %linked.id(),
            guards = guards.len(),
            "specialization linked"
        );
        Ok(GuardedArtifact::new(guards, Arc::new(linked)))
    }

    /// Package this pipeline as a hook callback
    ///
    /// Success specializes; a rewrite rejection permanently skips the code;
    /// link failures pass, with the memo keeping retries cheap.
    pub fn into_hook(self, cache: Arc<SpecializationCache>) -> HookCallback {
        Arc::new(move |frame: &Frame, _cache_size: usize| {
            match self.specialize(frame, &cache) {
                Ok(artifact) => HookDecision::Specialize(artifact),
                Err(TransformError::Rejected(_)) => HookDecision::Skip,
                Err(_) => HookDecision::Pass,
            }
        })
    }
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("encoding", &self.encoding)
            .finish()
    }
}
