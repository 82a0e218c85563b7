//! External functions the shadow calls.

use macke_ir::{IrError, IrModule, IrType};

use crate::error::PrependError;

pub const OBJ_SIZE: &str = "klee_get_obj_size";
pub const EXIT: &str = "exit";
pub const TIME: &str = "time";
pub const SRAND: &str = "srand";
pub const RAND: &str = "rand";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
}

impl RuntimeFunction {
    pub fn new(name: &str, params: &[IrType], ret: IrType) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
            ret,
        }
    }

    /// `size_t klee_get_obj_size(void *)` on a 64-bit target.
    pub fn obj_size() -> Self {
        Self::new(OBJ_SIZE, &[IrType::Ptr], IrType::I64)
    }

    pub fn exit() -> Self {
        Self::new(EXIT, &[IrType::I32], IrType::Void)
    }
}

/// Declares every function in `functions` unless the module already has it.
/// An existing function with a different signature is an error.
pub fn declare_runtime(module: &mut IrModule, functions: &[RuntimeFunction]) -> Result<(), PrependError> {
    for function in functions {
        module
            .get_or_insert_declaration(&function.name, &function.params, function.ret)
            .map_err(|err| match err {
                IrError::SignatureConflict {
                    name,
                    expected,
                    actual,
                } => PrependError::RuntimeDeclarationConflict {
                    name,
                    expected,
                    actual,
                },
                other => PrependError::Ir(other),
            })?;
    }
    Ok(())
}
