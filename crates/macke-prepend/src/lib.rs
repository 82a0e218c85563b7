//! Error prepending for MACKE's compositional analysis.
//!
//! Given the errors an earlier KLEE run found inside a function, this pass
//! wraps the function in a shadow that recognizes those error-triggering
//! inputs and terminates the program before the function is entered. A later
//! symbolic run of a caller then reports the propagated error at the call
//! site instead of exploring the already-known failing path again.
//!
//! The pass is split along the stages of synthesis:
//! - [`ParamBindings`] resolves which parameter each vector object describes.
//! - [`emit_size_check`] and [`emit_content_check`] build one vector's match
//!   condition.
//! - [`emit_check_chain`] links the per-vector checks in load order.
//! - [`build_shadow`] and [`prepend_errors`] assemble the shadow and swap it
//!   in for the target.

mod binding;
mod chain;
mod config;
mod error;
mod matcher;
mod runtime;
mod sampling;
mod shadow;
mod whitelist;

pub use binding::{BoundParam, ParamBindings, SkipReason};
pub use chain::{CheckBlocks, CheckConditions, emit_check_chain};
pub use config::{MATCH_EXIT_CODE, PrependConfig, SHADOW_PREFIX, shadow_name};
pub use error::{PrependError, SynthesisError};
pub use matcher::{SizeCheck, StorageLocation, emit_content_check, emit_size_check};
pub use runtime::{EXIT, OBJ_SIZE, RAND, RuntimeFunction, SRAND, TIME, declare_runtime};
pub use sampling::{
    AlwaysCheck, DEFAULT_SAMPLE_THRESHOLD, ExternalSampler, RAND_MAX, SamplingConfig,
    SamplingPolicy, WallClockSampler,
};
pub use shadow::{
    PrependReport, RedirectedSite, SkippedVector, build_shadow, partition_vectors, prepend_errors,
};
pub use whitelist::{EXEMPT_NAMES, EXEMPT_PREFIX, is_exempt};

use macke_ir::IrModule;

/// Validates `config`, loads its vectors from disk and prepends them to the
/// configured target.
pub fn run_prepend(module: &mut IrModule, config: &PrependConfig) -> Result<PrependReport, PrependError> {
    config.validate()?;
    let vectors = config.sources.load_vectors()?;
    tracing::debug!(vectors = vectors.len(), "loaded test vectors");
    prepend_errors(module, config, &vectors)
}
