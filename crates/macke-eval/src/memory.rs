//! KLEE-style object memory.
//!
//! Every allocation is a separate object. A pointer names an object and a
//! byte offset into it, so the size of "the object a pointer points into" is
//! always known, which is what `klee_get_obj_size` reports.

use std::fmt;

use macke_ir::IrType;

use crate::EvalError;
use crate::value::{Value, sign_extend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// `None` for the null pointer.
    pub object: Option<ObjectId>,
    pub offset: i64,
}

impl Pointer {
    pub const NULL: Pointer = Pointer {
        object: None,
        offset: 0,
    };

    pub fn to_object(object: ObjectId) -> Self {
        Self {
            object: Some(object),
            offset: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.object.is_none() && self.offset == 0
    }

    pub fn offset_by(self, delta: i64) -> Self {
        Self {
            object: self.object,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object {
            None if self.offset == 0 => f.write_str("null"),
            None => write!(f, "null+{}", self.offset),
            Some(object) => write!(f, "obj{}+{}", object.0, self.offset),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryObject {
    bytes: Vec<u8>,
    live: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Memory {
    objects: Vec<MemoryObject>,
}

impl Memory {
    pub fn allocate(&mut self, bytes: Vec<u8>) -> Pointer {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(MemoryObject { bytes, live: true });
        Pointer::to_object(id)
    }

    pub fn free(&mut self, object: ObjectId) {
        if let Some(entry) = self.objects.get_mut(object.0 as usize) {
            entry.live = false;
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Size of the whole object `pointer` points into, ignoring its offset.
    pub fn object_size(&self, pointer: Pointer) -> Result<u64, EvalError> {
        Ok(self.object(pointer)?.bytes.len() as u64)
    }

    /// Current contents of the object `pointer` points into.
    pub fn object_bytes(&self, pointer: Pointer) -> Result<&[u8], EvalError> {
        Ok(&self.object(pointer)?.bytes)
    }

    pub fn load(&self, pointer: Pointer, ty: IrType) -> Result<Value, EvalError> {
        let bytes = self.slice(pointer, ty.byte_size())?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        let bits = u64::from_le_bytes(raw);
        match ty {
            IrType::I1 => Ok(Value::bool(bits & 1 != 0)),
            IrType::I8 | IrType::I32 | IrType::I64 => {
                Ok(Value::int(ty, sign_extend(bits, ty.bit_width())))
            }
            IrType::F64 => Ok(Value::Float(f64::from_bits(bits))),
            IrType::Ptr | IrType::Void => Err(EvalError::UnsupportedMemoryAccess {
                detail: format!("load of {ty} from {pointer}"),
            }),
        }
    }

    pub fn store(&mut self, pointer: Pointer, value: &Value) -> Result<(), EvalError> {
        let (bits, size) = match value {
            Value::Int { ty, bits } => (*bits, ty.byte_size()),
            Value::Float(float) => (float.to_bits(), IrType::F64.byte_size()),
            Value::Ptr(_) | Value::Function(_) => {
                return Err(EvalError::UnsupportedMemoryAccess {
                    detail: format!("store of `{value}` to {pointer}"),
                });
            }
        };
        let encoded = bits.to_le_bytes();
        let slot = self.slice_mut(pointer, size)?;
        slot.copy_from_slice(&encoded[..slot.len()]);
        Ok(())
    }

    fn object(&self, pointer: Pointer) -> Result<&MemoryObject, EvalError> {
        let id = pointer.object.ok_or(EvalError::NullDereference)?;
        let object = self
            .objects
            .get(id.0 as usize)
            .ok_or(EvalError::UseAfterFree { object: id.0 })?;
        if !object.live {
            return Err(EvalError::UseAfterFree { object: id.0 });
        }
        Ok(object)
    }

    fn range(pointer: Pointer, len: u64, object_len: usize) -> Result<(usize, usize), EvalError> {
        let out_of_bounds = || EvalError::OutOfBounds {
            pointer: pointer.to_string(),
            len,
            object_size: object_len as u64,
        };
        let start = usize::try_from(pointer.offset).map_err(|_| out_of_bounds())?;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= object_len)
            .ok_or_else(out_of_bounds)?;
        Ok((start, end))
    }

    fn slice(&self, pointer: Pointer, len: u64) -> Result<&[u8], EvalError> {
        let object = self.object(pointer)?;
        let (start, end) = Self::range(pointer, len, object.bytes.len())?;
        Ok(&object.bytes[start..end])
    }

    fn slice_mut(&mut self, pointer: Pointer, len: u64) -> Result<&mut [u8], EvalError> {
        let object_len = self.object(pointer)?.bytes.len();
        let (start, end) = Self::range(pointer, len, object_len)?;
        let id = pointer.object.ok_or(EvalError::NullDereference)?;
        let object = self
            .objects
            .get_mut(id.0 as usize)
            .ok_or(EvalError::UseAfterFree { object: id.0 })?;
        Ok(&mut object.bytes[start..end])
    }
}
