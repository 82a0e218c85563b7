//! Backend-neutral SSA IR for macke.
//!
//! The IR mirrors the parts of LLVM that instrumentation passes touch:
//! modules hold functions, functions hold basic blocks, and every block ends in
//! exactly one terminator. Pointers are opaque, so a byte pointer and an `i32`
//! pointer share the `Ptr` type and no bitcasts are needed between them.
//!
//! Function parameters always occupy value ids `0..params.len()`; instruction
//! results are numbered after them.

mod builder;
mod print;
mod verify;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use builder::FunctionBuilder;
pub use verify::{verify_function, verify_module};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IrValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IrBlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrType {
    Void,
    I1,
    I8,
    I32,
    I64,
    F64,
    Ptr,
}

impl IrType {
    /// Size of one value of this type in memory, as seen by an allocation.
    pub fn byte_size(self) -> u64 {
        match self {
            IrType::Void => 0,
            IrType::I1 | IrType::I8 => 1,
            IrType::I32 => 4,
            IrType::I64 | IrType::F64 | IrType::Ptr => 8,
        }
    }

    pub fn bit_width(self) -> u32 {
        match self {
            IrType::Void => 0,
            IrType::I1 => 1,
            IrType::I8 => 8,
            IrType::I32 => 32,
            IrType::I64 | IrType::F64 | IrType::Ptr => 64,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, IrType::I1 | IrType::I8 | IrType::I32 | IrType::I64)
    }

    pub fn is_pointer(self) -> bool {
        self == IrType::Ptr
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IrType::Void => "void",
            IrType::I1 => "i1",
            IrType::I8 => "i8",
            IrType::I32 => "i32",
            IrType::I64 => "i64",
            IrType::F64 => "f64",
            IrType::Ptr => "ptr",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrLinkage {
    External,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrAttribute {
    NoInline,
    OptimizeNone,
}

impl IrAttribute {
    pub fn as_str(self) -> &'static str {
        match self {
            IrAttribute::NoInline => "noinline",
            IrAttribute::OptimizeNone => "optnone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IrSignature {
    pub params: Vec<IrType>,
    pub ret: IrType,
}

impl fmt::Display for IrSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IrParam {
    /// Source-level argument name, when debug info provided one.
    #[serde(default)]
    pub name: Option<String>,
    pub ty: IrType,
}

impl IrParam {
    pub fn named(name: impl Into<String>, ty: IrType) -> Self {
        Self {
            name: Some(name.into()),
            ty,
        }
    }

    pub fn unnamed(ty: IrType) -> Self {
        Self { name: None, ty }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IrLiteral {
    Int { ty: IrType, value: i64 },
    Float { value: f64 },
    Null,
}

impl IrLiteral {
    pub fn bool(value: bool) -> Self {
        IrLiteral::Int {
            ty: IrType::I1,
            value: i64::from(value),
        }
    }

    pub fn ty(&self) -> IrType {
        match self {
            IrLiteral::Int { ty, .. } => *ty,
            IrLiteral::Float { .. } => IrType::F64,
            IrLiteral::Null => IrType::Ptr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrCastOp {
    Trunc,
    ZExt,
    SExt,
    UIToFP,
    Bitcast,
}

impl IrCastOp {
    pub fn as_str(self) -> &'static str {
        match self {
            IrCastOp::Trunc => "trunc",
            IrCastOp::ZExt => "zext",
            IrCastOp::SExt => "sext",
            IrCastOp::UIToFP => "uitofp",
            IrCastOp::Bitcast => "bitcast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrBinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    FDiv,
}

impl IrBinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            IrBinaryOp::Add => "add",
            IrBinaryOp::Sub => "sub",
            IrBinaryOp::Mul => "mul",
            IrBinaryOp::And => "and",
            IrBinaryOp::Or => "or",
            IrBinaryOp::Xor => "xor",
            IrBinaryOp::FDiv => "fdiv",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, IrBinaryOp::FDiv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrCompareOp {
    Eq,
    Ne,
    Ult,
    Slt,
    FOgt,
    FOlt,
}

impl IrCompareOp {
    pub fn as_str(self) -> &'static str {
        match self {
            IrCompareOp::Eq => "icmp eq",
            IrCompareOp::Ne => "icmp ne",
            IrCompareOp::Ult => "icmp ult",
            IrCompareOp::Slt => "icmp slt",
            IrCompareOp::FOgt => "fcmp ogt",
            IrCompareOp::FOlt => "fcmp olt",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, IrCompareOp::FOgt | IrCompareOp::FOlt)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IrInst {
    Const {
        dest: IrValueId,
        literal: IrLiteral,
    },
    Alloca {
        dest: IrValueId,
        ty: IrType,
    },
    Store {
        value: IrValueId,
        ptr: IrValueId,
    },
    Load {
        dest: IrValueId,
        ty: IrType,
        ptr: IrValueId,
    },
    /// Byte-granular address arithmetic (`getelementptr i8, ptr, offset`).
    PtrOffset {
        dest: IrValueId,
        base: IrValueId,
        offset: i64,
    },
    Cast {
        dest: IrValueId,
        op: IrCastOp,
        value: IrValueId,
        ty: IrType,
    },
    Binary {
        dest: IrValueId,
        op: IrBinaryOp,
        lhs: IrValueId,
        rhs: IrValueId,
    },
    Compare {
        dest: IrValueId,
        op: IrCompareOp,
        lhs: IrValueId,
        rhs: IrValueId,
    },
    Call {
        callee: String,
        args: Vec<IrValueId>,
        result: Option<IrValueId>,
    },
    FunctionRef {
        dest: IrValueId,
        function: String,
    },
}

impl IrInst {
    pub fn dest(&self) -> Option<IrValueId> {
        match self {
            IrInst::Const { dest, .. }
            | IrInst::Alloca { dest, .. }
            | IrInst::Load { dest, .. }
            | IrInst::PtrOffset { dest, .. }
            | IrInst::Cast { dest, .. }
            | IrInst::Binary { dest, .. }
            | IrInst::Compare { dest, .. }
            | IrInst::FunctionRef { dest, .. } => Some(*dest),
            IrInst::Call { result, .. } => *result,
            IrInst::Store { .. } => None,
        }
    }

    pub fn operands(&self) -> Vec<IrValueId> {
        match self {
            IrInst::Const { .. } | IrInst::Alloca { .. } | IrInst::FunctionRef { .. } => vec![],
            IrInst::Store { value, ptr } => vec![*value, *ptr],
            IrInst::Load { ptr, .. } => vec![*ptr],
            IrInst::PtrOffset { base, .. } => vec![*base],
            IrInst::Cast { value, .. } => vec![*value],
            IrInst::Binary { lhs, rhs, .. } | IrInst::Compare { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            IrInst::Call { args, .. } => args.clone(),
        }
    }

    /// Name of the function this instruction calls or takes the address of.
    pub fn referenced_function(&self) -> Option<&str> {
        match self {
            IrInst::Call { callee, .. } => Some(callee),
            IrInst::FunctionRef { function, .. } => Some(function),
            _ => None,
        }
    }

    pub fn is_memory_op(&self) -> bool {
        matches!(
            self,
            IrInst::Alloca { .. } | IrInst::Store { .. } | IrInst::Load { .. }
        )
    }

    fn retarget(&mut self, from: &str, to: &str) -> bool {
        match self {
            IrInst::Call { callee: name, .. } | IrInst::FunctionRef { function: name, .. }
                if name.as_str() == from =>
            {
                *name = to.to_string();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IrTerminator {
    Jump {
        target: IrBlockId,
    },
    Branch {
        condition: IrValueId,
        then_block: IrBlockId,
        else_block: IrBlockId,
    },
    Return {
        value: Option<IrValueId>,
    },
    Unreachable,
}

impl IrTerminator {
    pub fn successors(&self) -> Vec<IrBlockId> {
        match self {
            IrTerminator::Jump { target } => vec![*target],
            IrTerminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            IrTerminator::Return { .. } | IrTerminator::Unreachable => vec![],
        }
    }

    pub fn operands(&self) -> Vec<IrValueId> {
        match self {
            IrTerminator::Branch { condition, .. } => vec![*condition],
            IrTerminator::Return { value: Some(value) } => vec![*value],
            IrTerminator::Jump { .. }
            | IrTerminator::Return { value: None }
            | IrTerminator::Unreachable => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrBlock {
    pub id: IrBlockId,
    pub instructions: Vec<IrInst>,
    pub terminator: IrTerminator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<IrParam>,
    pub ret: IrType,
    pub linkage: IrLinkage,
    #[serde(default)]
    pub attributes: BTreeSet<IrAttribute>,
    #[serde(default = "entry_block_id")]
    pub entry: IrBlockId,
    /// Empty for declarations.
    #[serde(default)]
    pub blocks: Vec<IrBlock>,
}

fn entry_block_id() -> IrBlockId {
    IrBlockId(0)
}

impl IrFunction {
    pub fn declaration(name: impl Into<String>, params: Vec<IrType>, ret: IrType) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().map(IrParam::unnamed).collect(),
            ret,
            linkage: IrLinkage::External,
            attributes: BTreeSet::new(),
            entry: IrBlockId(0),
            blocks: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn signature(&self) -> IrSignature {
        IrSignature {
            params: self.params.iter().map(|param| param.ty).collect(),
            ret: self.ret,
        }
    }

    pub fn param_value(&self, index: usize) -> Option<IrValueId> {
        (index < self.params.len()).then(|| IrValueId(index as u32))
    }

    /// Blocks reachable from the entry, each after all of its dominators.
    pub fn reverse_postorder(&self) -> Vec<IrBlockId> {
        let mut visited = BTreeSet::new();
        let mut postorder = Vec::new();
        let mut stack = vec![(self.entry, false)];
        while let Some((id, finished)) = stack.pop() {
            if finished {
                postorder.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(block) = self.block(id) {
                for successor in block.terminator.successors().into_iter().rev() {
                    if !visited.contains(&successor) {
                        stack.push((successor, false));
                    }
                }
            }
        }
        postorder.reverse();
        postorder
    }

    pub fn block(&self, id: IrBlockId) -> Option<&IrBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub fn has_attribute(&self, attribute: IrAttribute) -> bool {
        self.attributes.contains(&attribute)
    }

    pub fn add_attribute(&mut self, attribute: IrAttribute) {
        self.attributes.insert(attribute);
    }

    /// Infers the type of every value defined in this function.
    ///
    /// Call results take the callee's return type from `module`.
    pub fn value_types(&self, module: &IrModule) -> Result<BTreeMap<IrValueId, IrType>, IrError> {
        let mut types: BTreeMap<IrValueId, IrType> = self
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| (IrValueId(index as u32), param.ty))
            .collect();

        // Binary results depend on operand types, which may be defined in a
        // block that appears later in `blocks`; iterate until nothing changes.
        let mut pending: Vec<&IrInst> = Vec::new();
        for inst in self.blocks.iter().flat_map(|block| block.instructions.iter()) {
            let ty = match inst {
                IrInst::Const { literal, .. } => Some(literal.ty()),
                IrInst::Alloca { .. } | IrInst::PtrOffset { .. } | IrInst::FunctionRef { .. } => {
                    Some(IrType::Ptr)
                }
                IrInst::Load { ty, .. } | IrInst::Cast { ty, .. } => Some(*ty),
                IrInst::Compare { .. } => Some(IrType::I1),
                IrInst::Binary { op, .. } if op.is_float() => Some(IrType::F64),
                IrInst::Binary { .. } => None,
                IrInst::Call { callee, result, .. } => match result {
                    Some(_) => {
                        let callee_fn =
                            module
                                .function(callee)
                                .ok_or_else(|| IrError::UnknownFunction {
                                    name: callee.clone(),
                                })?;
                        Some(callee_fn.ret)
                    }
                    None => continue,
                },
                IrInst::Store { .. } => continue,
            };
            match (inst.dest(), ty) {
                (Some(dest), Some(ty)) => {
                    if types.insert(dest, ty).is_some() {
                        return Err(IrError::DuplicateValue {
                            function: self.name.clone(),
                            value: dest.0,
                        });
                    }
                }
                _ => pending.push(inst),
            }
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut unresolved = Vec::new();
            for inst in pending {
                if let IrInst::Binary { dest, lhs, .. } = inst {
                    if let Some(ty) = types.get(lhs).copied() {
                        if types.insert(*dest, ty).is_some() {
                            return Err(IrError::DuplicateValue {
                                function: self.name.clone(),
                                value: dest.0,
                            });
                        }
                        continue;
                    }
                }
                unresolved.push(inst);
            }
            if unresolved.len() == before {
                let value = unresolved
                    .first()
                    .and_then(|inst| inst.operands().first().copied())
                    .map_or(0, |value| value.0);
                return Err(IrError::UndefinedValue {
                    function: self.name.clone(),
                    value,
                });
            }
            pending = unresolved;
        }

        Ok(types)
    }
}

/// Where a function is referenced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrUseKind {
    Call,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrUse {
    pub function: String,
    pub block: IrBlockId,
    pub index: usize,
    pub kind: IrUseKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IrModule {
    pub name: String,
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut IrFunction> {
        self.functions
            .iter_mut()
            .find(|function| function.name == name)
    }

    pub fn add_function(&mut self, function: IrFunction) -> Result<(), IrError> {
        if self.function(&function.name).is_some() {
            return Err(IrError::DuplicateFunction {
                name: function.name,
            });
        }
        self.functions.push(function);
        Ok(())
    }

    /// Declares an external function unless one with the same name exists.
    ///
    /// An existing function must have exactly the requested signature.
    pub fn get_or_insert_declaration(
        &mut self,
        name: &str,
        params: &[IrType],
        ret: IrType,
    ) -> Result<(), IrError> {
        let expected = IrSignature {
            params: params.to_vec(),
            ret,
        };
        if let Some(existing) = self.function(name) {
            let actual = existing.signature();
            if actual != expected {
                return Err(IrError::SignatureConflict {
                    name: name.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
            return Ok(());
        }
        self.functions
            .push(IrFunction::declaration(name, params.to_vec(), ret));
        Ok(())
    }

    /// Every call or address-taken reference to `name`, in module order.
    pub fn uses_of(&self, name: &str) -> Vec<IrUse> {
        let mut uses = Vec::new();
        for function in &self.functions {
            for block in &function.blocks {
                for (index, inst) in block.instructions.iter().enumerate() {
                    if inst.referenced_function() != Some(name) {
                        continue;
                    }
                    let kind = match inst {
                        IrInst::Call { .. } => IrUseKind::Call,
                        _ => IrUseKind::Reference,
                    };
                    uses.push(IrUse {
                        function: function.name.clone(),
                        block: block.id,
                        index,
                        kind,
                    });
                }
            }
        }
        uses
    }

    /// Rewrites every use of `from` to `to`, except uses inside `to` itself.
    ///
    /// Both functions must exist with identical signatures. The rewrite is
    /// all-or-nothing: preconditions are checked before anything changes, and
    /// on return the only references to `from` left in the module live in the
    /// body of `to`. Returns the rewritten sites.
    pub fn redirect_uses(&mut self, from: &str, to: &str) -> Result<Vec<IrUse>, IrError> {
        let from_sig = self
            .function(from)
            .ok_or_else(|| IrError::UnknownFunction {
                name: from.to_string(),
            })?
            .signature();
        let to_sig = self
            .function(to)
            .ok_or_else(|| IrError::UnknownFunction {
                name: to.to_string(),
            })?
            .signature();
        if from_sig != to_sig {
            return Err(IrError::SignatureConflict {
                name: to.to_string(),
                expected: from_sig.to_string(),
                actual: to_sig.to_string(),
            });
        }

        let sites: Vec<IrUse> = self
            .uses_of(from)
            .into_iter()
            .filter(|site| site.function != to)
            .collect();

        for function in self.functions.iter_mut().filter(|f| f.name != to) {
            for block in &mut function.blocks {
                for inst in &mut block.instructions {
                    inst.retarget(from, to);
                }
            }
        }

        let remaining = self
            .uses_of(from)
            .into_iter()
            .filter(|site| site.function != to)
            .count();
        if remaining != 0 {
            return Err(IrError::IncompleteRedirect {
                function: from.to_string(),
                remaining,
            });
        }

        Ok(sites)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("function `{name}` is already defined in the module")]
    DuplicateFunction { name: String },
    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("function `{name}` has signature `{actual}`, expected `{expected}`")]
    SignatureConflict {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("block bb{block} referenced in `{function}` does not exist")]
    UnknownBlock { function: String, block: u32 },
    #[error("block bb{block} in `{function}` has no terminator")]
    MissingTerminator { function: String, block: u32 },
    #[error("instruction appended to already terminated block bb{block} in `{function}`")]
    BlockAlreadyTerminated { function: String, block: u32 },
    #[error("value %{value} used in `{function}` is never defined")]
    UndefinedValue { function: String, value: u32 },
    #[error("value %{value} used in bb{block} of `{function}` is not defined on every path to the use")]
    NonDominatingUse {
        function: String,
        block: u32,
        value: u32,
    },
    #[error("value %{value} is defined more than once in `{function}`")]
    DuplicateValue { function: String, value: u32 },
    #[error("call from `{function}` to `{callee}` passes {actual} arguments, expected {expected}")]
    ArityMismatch {
        function: String,
        callee: String,
        expected: usize,
        actual: usize,
    },
    #[error("type error in `{function}`: {detail}")]
    TypeMismatch { function: String, detail: String },
    #[error("{remaining} reference(s) to `{function}` survived call-site redirection")]
    IncompleteRedirect { function: String, remaining: usize },
}
