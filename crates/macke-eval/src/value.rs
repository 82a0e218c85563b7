use std::fmt;

use macke_ir::{IrLiteral, IrType};

use crate::memory::Pointer;

/// A runtime value.
///
/// Integers are kept as their raw bit pattern, truncated to the width of
/// their type, so `i8 -1` is stored as `0xff`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int { ty: IrType, bits: u64 },
    Float(f64),
    Ptr(Pointer),
    Function(String),
}

impl Value {
    pub fn int(ty: IrType, value: i64) -> Self {
        Value::Int {
            ty,
            bits: truncate(value as u64, ty.bit_width()),
        }
    }

    pub fn bool(value: bool) -> Self {
        Value::int(IrType::I1, i64::from(value))
    }

    pub fn i32(value: i32) -> Self {
        Value::int(IrType::I32, i64::from(value))
    }

    pub fn i64(value: i64) -> Self {
        Value::int(IrType::I64, value)
    }

    pub fn null() -> Self {
        Value::Ptr(Pointer::NULL)
    }

    pub fn from_literal(literal: &IrLiteral) -> Self {
        match literal {
            IrLiteral::Int { ty, value } => Value::int(*ty, *value),
            IrLiteral::Float { value } => Value::Float(*value),
            IrLiteral::Null => Value::null(),
        }
    }

    pub fn ty(&self) -> IrType {
        match self {
            Value::Int { ty, .. } => *ty,
            Value::Float(_) => IrType::F64,
            Value::Ptr(_) | Value::Function(_) => IrType::Ptr,
        }
    }

    /// Zero-extended integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int { bits, .. } => Some(*bits),
            _ => None,
        }
    }

    /// Sign-extended integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int { ty, bits } => Some(sign_extend(*bits, ty.bit_width())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Int {
                ty: IrType::I1,
                bits,
            } => Some(*bits != 0),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            Value::Ptr(pointer) => Some(*pointer),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int { ty, .. } => match self.as_i64() {
                Some(value) => write!(f, "{ty} {value}"),
                None => write!(f, "{ty} ?"),
            },
            Value::Float(value) => write!(f, "f64 {value}"),
            Value::Ptr(pointer) => write!(f, "ptr {pointer}"),
            Value::Function(name) => write!(f, "ptr @{name}"),
        }
    }
}

pub(crate) fn truncate(bits: u64, width: u32) -> u64 {
    if width >= 64 {
        bits
    } else {
        bits & ((1u64 << width) - 1)
    }
}

pub(crate) fn sign_extend(bits: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return bits as i64;
    }
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_truncated_to_their_width() {
        let byte = Value::int(IrType::I8, -1);
        assert_eq!(byte.as_u64(), Some(0xff));
        assert_eq!(byte.as_i64(), Some(-1));

        let flag = Value::int(IrType::I1, 3);
        assert_eq!(flag.as_bool(), Some(true));
        assert_eq!(flag.as_u64(), Some(1));
    }

    #[test]
    fn sign_extension_respects_width() {
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0xffff_ffff, 32), -1);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }

    #[test]
    fn display_uses_ir_spelling() {
        assert_eq!(Value::i32(-6).to_string(), "i32 -6");
        assert_eq!(Value::Float(0.5).to_string(), "f64 0.5");
        assert_eq!(Value::null().to_string(), "ptr null");
    }
}
