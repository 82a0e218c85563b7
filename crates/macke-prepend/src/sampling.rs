//! Entry gate of the shadow: decides per call whether the vector checks run.

use macke_ir::{FunctionBuilder, IrBinaryOp, IrBlockId, IrCastOp, IrCompareOp, IrType};
use serde::{Deserialize, Serialize};

use crate::runtime::{RAND, RuntimeFunction, SRAND, TIME};

/// `RAND_MAX` of the C library the instrumented program links against.
pub const RAND_MAX: i64 = 2_147_483_647;

pub const DEFAULT_SAMPLE_THRESHOLD: f64 = 0.5;

/// Emits the code that ends the shadow's entry block.
///
/// Implementations terminate `entry` with a jump or branch to either
/// `default` (skip the checks) or `checked` (run the check chain).
pub trait SamplingPolicy {
    fn name(&self) -> &'static str;

    /// Functions the gate calls; declared before the shadow is added.
    fn runtime_functions(&self) -> Vec<RuntimeFunction>;

    fn emit_gate(
        &self,
        builder: &mut FunctionBuilder,
        entry: IrBlockId,
        default: IrBlockId,
        checked: IrBlockId,
    );
}

/// Reseeds `rand` from the wall clock on every call and skips the checks
/// when the drawn fraction of `RAND_MAX` exceeds `threshold`.
///
/// Reseeding touches process-wide libc state and is not thread safe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallClockSampler {
    pub threshold: f64,
}

impl Default for WallClockSampler {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SAMPLE_THRESHOLD,
        }
    }
}

impl SamplingPolicy for WallClockSampler {
    fn name(&self) -> &'static str {
        "wall-clock"
    }

    fn runtime_functions(&self) -> Vec<RuntimeFunction> {
        vec![
            RuntimeFunction::new(TIME, &[IrType::Ptr], IrType::I64),
            RuntimeFunction::new(SRAND, &[IrType::I32], IrType::Void),
            RuntimeFunction::new(RAND, &[], IrType::I32),
        ]
    }

    fn emit_gate(
        &self,
        builder: &mut FunctionBuilder,
        entry: IrBlockId,
        default: IrBlockId,
        checked: IrBlockId,
    ) {
        let null = builder.null(entry);
        let now = builder.call_value(entry, TIME, vec![null], IrType::I64);
        let seed = builder.cast(entry, IrCastOp::Trunc, now, IrType::I32);
        let _ = builder.call(entry, SRAND, vec![seed], IrType::Void);
        let drawn = builder.call_value(entry, RAND, vec![], IrType::I32);
        let drawn = builder.cast(entry, IrCastOp::UIToFP, drawn, IrType::F64);
        let rand_max = builder.fconst(entry, RAND_MAX as f64);
        let fraction = builder.binary(entry, IrBinaryOp::FDiv, drawn, rand_max);
        let threshold = builder.fconst(entry, self.threshold);
        let skip = builder.compare(entry, IrCompareOp::FOgt, fraction, threshold);
        builder.branch(entry, skip, default, checked);
    }
}

/// Runs the checks on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlwaysCheck;

impl SamplingPolicy for AlwaysCheck {
    fn name(&self) -> &'static str {
        "always"
    }

    fn runtime_functions(&self) -> Vec<RuntimeFunction> {
        Vec::new()
    }

    fn emit_gate(
        &self,
        builder: &mut FunctionBuilder,
        entry: IrBlockId,
        _default: IrBlockId,
        checked: IrBlockId,
    ) {
        builder.jump(entry, checked);
    }
}

/// Asks a link-time provided `double symbol(void)` for a fraction in
/// `[0, 1]` and skips the checks when it exceeds `threshold`. Per-thread or
/// deterministic sampling lives in that function.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSampler {
    pub symbol: String,
    pub threshold: f64,
}

impl SamplingPolicy for ExternalSampler {
    fn name(&self) -> &'static str {
        "external"
    }

    fn runtime_functions(&self) -> Vec<RuntimeFunction> {
        vec![RuntimeFunction::new(&self.symbol, &[], IrType::F64)]
    }

    fn emit_gate(
        &self,
        builder: &mut FunctionBuilder,
        entry: IrBlockId,
        default: IrBlockId,
        checked: IrBlockId,
    ) {
        let fraction = builder.call_value(entry, &self.symbol, vec![], IrType::F64);
        let threshold = builder.fconst(entry, self.threshold);
        let skip = builder.compare(entry, IrCompareOp::FOgt, fraction, threshold);
        builder.branch(entry, skip, default, checked);
    }
}

/// Serializable choice of sampling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SamplingConfig {
    WallClock { threshold: f64 },
    Always,
    External { symbol: String, threshold: f64 },
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig::WallClock {
            threshold: DEFAULT_SAMPLE_THRESHOLD,
        }
    }
}

impl SamplingConfig {
    pub fn threshold(&self) -> Option<f64> {
        match self {
            SamplingConfig::WallClock { threshold } | SamplingConfig::External { threshold, .. } => {
                Some(*threshold)
            }
            SamplingConfig::Always => None,
        }
    }

    pub fn policy(&self) -> Box<dyn SamplingPolicy> {
        match self {
            SamplingConfig::WallClock { threshold } => Box::new(WallClockSampler {
                threshold: *threshold,
            }),
            SamplingConfig::Always => Box::new(AlwaysCheck),
            SamplingConfig::External { symbol, threshold } => Box::new(ExternalSampler {
                symbol: symbol.clone(),
                threshold: *threshold,
            }),
        }
    }
}
