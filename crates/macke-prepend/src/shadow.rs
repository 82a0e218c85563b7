//! Shadow function construction and the module-level pass.
//!
//! The shadow has the target's signature and becomes the only way the rest
//! of the module reaches the target:
//!
//! ```text
//! bb0 entry    sampling gate            -> bb1 | chain head
//! bb1 default  call target, return result
//! bb2 fail     exit(code); unreachable
//! bb3.. size/content pairs, one per admitted vector
//! ```

use std::path::PathBuf;

use macke_ir::{
    FunctionBuilder, IrAttribute, IrFunction, IrModule, IrType, IrUse, IrUseKind, verify_function,
};
use macke_ktest::TestVector;
use serde::Serialize;

use crate::binding::{ParamBindings, SkipReason};
use crate::chain::{CheckConditions, emit_check_chain};
use crate::config::{PrependConfig, shadow_name};
use crate::error::{PrependError, SynthesisError};
use crate::matcher::{emit_content_check, emit_size_check};
use crate::runtime::{EXIT, RuntimeFunction, declare_runtime};
use crate::sampling::SamplingPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedVector {
    pub source: PathBuf,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectedSite {
    pub function: String,
    pub block: u32,
    pub index: usize,
    /// `"call"` or `"reference"`.
    pub kind: &'static str,
}

impl From<IrUse> for RedirectedSite {
    fn from(site: IrUse) -> Self {
        Self {
            function: site.function,
            block: site.block.0,
            index: site.index,
            kind: match site.kind {
                IrUseKind::Call => "call",
                IrUseKind::Reference => "reference",
            },
        }
    }
}

/// What the pass did to the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrependReport {
    pub target: String,
    pub shadow: String,
    pub sampling: &'static str,
    pub exit_code: i32,
    /// Sources of the vectors that got a check, in chain order.
    pub admitted: Vec<PathBuf>,
    pub skipped: Vec<SkippedVector>,
    pub redirected: Vec<RedirectedSite>,
}

/// Splits `vectors` into the ones the target can replay and the rest, both
/// in load order.
pub fn partition_vectors<'v>(
    bindings: &ParamBindings,
    vectors: &'v [TestVector],
) -> (Vec<&'v TestVector>, Vec<SkippedVector>) {
    let mut admitted = Vec::new();
    let mut skipped = Vec::new();
    for vector in vectors {
        match bindings.admissibility(vector) {
            Ok(()) => admitted.push(vector),
            Err(reason) => {
                tracing::debug!(
                    source = %vector.source.display(),
                    ?reason,
                    "skipping vector"
                );
                skipped.push(SkippedVector {
                    source: vector.source.clone(),
                    reason,
                });
            }
        }
    }
    (admitted, skipped)
}

/// Builds the shadow of `target` checking `admitted` in order.
///
/// Every vector must already be admissible for `target`.
pub fn build_shadow(
    target: &IrFunction,
    admitted: &[&TestVector],
    policy: &dyn SamplingPolicy,
    exit_code: i32,
) -> Result<IrFunction, SynthesisError> {
    let mut builder = FunctionBuilder::new(
        shadow_name(&target.name),
        target.params.clone(),
        target.ret,
        target.linkage,
    );
    builder.add_attribute(IrAttribute::NoInline);
    builder.add_attribute(IrAttribute::OptimizeNone);

    let entry = builder.create_block();
    let default = builder.create_block();
    let fail = builder.create_block();

    let args = (0..target.params.len()).map(|index| builder.param(index)).collect();
    let result = builder.call(default, &target.name, args, target.ret);
    builder.ret(default, result);

    let code = builder.iconst(fail, IrType::I32, i64::from(exit_code));
    let _ = builder.call(fail, EXIT, vec![code], IrType::Void);
    builder.unreachable(fail);

    let bindings = ParamBindings::new(&target.params);
    let head = emit_check_chain(
        &mut builder,
        admitted,
        fail,
        default,
        |builder, vector, blocks| -> Result<CheckConditions, SynthesisError> {
            let size = emit_size_check(builder, blocks.size, &bindings, vector)?;
            let content_ok = emit_content_check(builder, blocks.content, &size);
            Ok(CheckConditions {
                size_ok: size.size_ok,
                content_ok,
            })
        },
    )?;

    policy.emit_gate(&mut builder, entry, default, head);
    Ok(builder.finish()?)
}

/// An admitted vector that fails to bind is fatal; IR construction errors are
/// returned like any other rejected module.
fn synthesized_or_abort(
    target: &str,
    result: Result<IrFunction, SynthesisError>,
) -> Result<IrFunction, PrependError> {
    match result {
        Ok(function) => Ok(function),
        Err(SynthesisError::Ir(err)) => Err(PrependError::Ir(err)),
        Err(err @ SynthesisError::UnboundObject { .. }) => {
            tracing::error!(target = %target, error = %err, "shadow synthesis failed");
            std::process::abort();
        }
    }
}

/// Prepends replay checks for `vectors` to `config.target`.
///
/// Works on a copy of `module` and only replaces it once the shadow is
/// built, verified and every use of the target has been redirected, so any
/// error leaves `module` exactly as it was.
pub fn prepend_errors(
    module: &mut IrModule,
    config: &PrependConfig,
    vectors: &[TestVector],
) -> Result<PrependReport, PrependError> {
    config.validate_options()?;

    let target = module
        .function(&config.target)
        .ok_or_else(|| PrependError::UnknownFunction {
            name: config.target.clone(),
        })?;
    if target.is_declaration() {
        return Err(PrependError::TargetIsDeclaration {
            name: config.target.clone(),
        });
    }
    let shadow = config.shadow_name();
    if module.function(&shadow).is_some() {
        return Err(PrependError::ShadowNameTaken { name: shadow });
    }

    let bindings = ParamBindings::new(&target.params);
    let (admitted, skipped) = partition_vectors(&bindings, vectors);
    let policy = config.sampling.policy();

    let mut staged = module.clone();
    let mut runtime = vec![RuntimeFunction::obj_size(), RuntimeFunction::exit()];
    runtime.extend(policy.runtime_functions());
    declare_runtime(&mut staged, &runtime)?;

    let shadow_fn = synthesized_or_abort(
        &config.target,
        build_shadow(target, &admitted, policy.as_ref(), config.exit_code),
    )?;

    if let Some(original) = staged.function_mut(&config.target) {
        original.add_attribute(IrAttribute::NoInline);
        original.add_attribute(IrAttribute::OptimizeNone);
    }
    staged.add_function(shadow_fn)?;
    let sites = staged.redirect_uses(&config.target, &shadow)?;
    if let Some(shadow_fn) = staged.function(&shadow) {
        verify_function(&staged, shadow_fn)?;
    }

    *module = staged;

    tracing::info!(
        target = %config.target,
        shadow = %shadow,
        admitted = admitted.len(),
        skipped = skipped.len(),
        redirected = sites.len(),
        "prepended error checks"
    );

    Ok(PrependReport {
        target: config.target.clone(),
        shadow,
        sampling: policy.name(),
        exit_code: config.exit_code,
        admitted: admitted.iter().map(|vector| vector.source.clone()).collect(),
        skipped,
        redirected: sites.into_iter().map(RedirectedSite::from).collect(),
    })
}
