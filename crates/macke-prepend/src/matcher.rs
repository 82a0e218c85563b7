//! Match condition synthesis for one vector.
//!
//! A match is checked in two phases. The size block asks KLEE for the size
//! of the object behind every bound parameter and compares it with the
//! recorded length; only when all sizes agree does control reach the content
//! block, which compares the recorded bytes one at a time. Reading bytes is
//! therefore never attempted past the end of an object of the wrong size.

use macke_ir::{FunctionBuilder, IrBinaryOp, IrBlockId, IrCompareOp, IrType, IrValueId};
use macke_ktest::TestVector;

use crate::binding::ParamBindings;
use crate::error::SynthesisError;
use crate::runtime::OBJ_SIZE;

/// Where the bytes of one bound object can be read at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub object: String,
    pub pointer: IrValueId,
    /// `true` when the parameter was copied into a fresh stack slot because
    /// it is not itself a pointer.
    pub scratch: bool,
    pub expected: Vec<u8>,
}

/// Output of the size phase, consumed by the content phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeCheck {
    pub size_ok: IrValueId,
    pub locations: Vec<StorageLocation>,
}

/// Emits the size phase for `vector` into `block` and returns the `i1`
/// that holds when every object has its recorded size.
pub fn emit_size_check(
    builder: &mut FunctionBuilder,
    block: IrBlockId,
    bindings: &ParamBindings,
    vector: &TestVector,
) -> Result<SizeCheck, SynthesisError> {
    let function = builder.name().to_string();
    let bound = bindings.bind(&function, vector)?;

    let mut size_ok = builder.bool_const(block, true);
    let mut locations = Vec::with_capacity(bound.len());
    for (object, param) in bound {
        let (pointer, scratch) = if param.ty.is_pointer() {
            (param.value, false)
        } else {
            let slot = builder.alloca(block, param.ty);
            builder.store(block, param.value, slot);
            (slot, true)
        };

        let actual = builder.call_value(block, OBJ_SIZE, vec![pointer], IrType::I64);
        let expected = builder.iconst(block, IrType::I64, object.bytes.len() as i64);
        let same = builder.compare(block, IrCompareOp::Eq, actual, expected);
        size_ok = builder.binary(block, IrBinaryOp::And, size_ok, same);

        locations.push(StorageLocation {
            object: object.name.clone(),
            pointer,
            scratch,
            expected: object.bytes.clone(),
        });
    }

    Ok(SizeCheck { size_ok, locations })
}

/// Emits the byte-by-byte comparison into `block` and returns its `i1`.
pub fn emit_content_check(
    builder: &mut FunctionBuilder,
    block: IrBlockId,
    check: &SizeCheck,
) -> IrValueId {
    let mut content_ok = builder.bool_const(block, true);
    for location in &check.locations {
        for (offset, byte) in location.expected.iter().enumerate() {
            let address = builder.ptr_offset(block, location.pointer, offset as i64);
            let actual = builder.load(block, IrType::I8, address);
            let expected = builder.iconst(block, IrType::I8, i64::from(*byte));
            let same = builder.compare(block, IrCompareOp::Eq, actual, expected);
            content_ok = builder.binary(block, IrBinaryOp::And, content_ok, same);
        }
    }
    content_ok
}
