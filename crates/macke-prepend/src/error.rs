use std::path::PathBuf;

use macke_ir::IrError;
use macke_ktest::LoadError;

/// Rejected configuration or module. The module is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum PrependError {
    #[error("a target function is required (`--prepend-to-function`)")]
    MissingTarget,
    #[error(
        "at least one vector source is required (`--previous-klee-run-directory` or `--error-file-to-prepend`)"
    )]
    NoVectorSources,
    #[error("`{}` is not a valid directory", path.display())]
    InvalidRunDirectory { path: PathBuf },
    #[error("`{}` is not a valid .err file", path.display())]
    InvalidErrorFile { path: PathBuf },
    #[error("`{name}` is no function inside the module, prepending is not possible")]
    UnknownFunction { name: String },
    #[error("`{name}` is only declared; errors can only be prepended to a definition")]
    TargetIsDeclaration { name: String },
    #[error("shadow function name `{name}` is already taken")]
    ShadowNameTaken { name: String },
    #[error("sample threshold {threshold} is outside [0, 1]")]
    InvalidThreshold { threshold: f64 },
    #[error("sampler symbol `{symbol}` is not a valid function name")]
    InvalidSamplerSymbol { symbol: String },
    #[error("runtime function `{name}` is already declared with signature `{actual}`, need `{expected}`")]
    RuntimeDeclarationConflict {
        name: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Load(LoadError),
}

impl From<LoadError> for PrependError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NoSources => PrependError::NoVectorSources,
            LoadError::InvalidRunDirectory { path } => PrependError::InvalidRunDirectory { path },
            LoadError::InvalidErrorFile { path } => PrependError::InvalidErrorFile { path },
            other => PrependError::Load(other),
        }
    }
}

/// Shadow construction failed. `UnboundObject` means a vector that passed
/// admissibility names an object with no matching parameter, an internal
/// inconsistency and never a user error.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("ktest variable `{object}` not found in `{function}`")]
    UnboundObject { function: String, object: String },
    #[error(transparent)]
    Ir(#[from] IrError),
}
