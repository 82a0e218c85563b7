//! Reference interpreter for macke IR.
//!
//! Executes modules directly so instrumented code can be observed without a
//! native toolchain: `exit` ends execution with an [`Outcome::Exited`]
//! instead of terminating the test process, memory follows KLEE's object
//! model so `klee_get_obj_size` has its real meaning, and [`ExecStats`]
//! counts the loads, calls and block visits a run performed.

mod host;
mod memory;
mod value;

use std::collections::BTreeMap;

use macke_ir::{
    IrBinaryOp, IrBlockId, IrCastOp, IrCompareOp, IrFunction, IrInst, IrModule, IrTerminator,
    IrType, IrValueId,
};

pub use host::{Host, RAND_MAX, ScriptedHost};
pub use memory::{Memory, ObjectId, Pointer};
pub use value::Value;

pub const OBJ_SIZE_BUILTIN: &str = "klee_get_obj_size";
pub const EXIT_BUILTIN: &str = "exit";

const DEFAULT_STEP_LIMIT: u64 = 1_000_000;
const MAX_CALL_DEPTH: usize = 256;

/// How a top-level call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),
    Exited(i32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub instructions: u64,
    pub loads: u64,
    pub stores: u64,
    pub allocas: u64,
    pub calls: BTreeMap<String, u64>,
    pub block_visits: BTreeMap<(String, u32), u64>,
}

impl ExecStats {
    pub fn calls_to(&self, name: &str) -> u64 {
        self.calls.get(name).copied().unwrap_or(0)
    }

    pub fn visits(&self, function: &str, block: IrBlockId) -> u64 {
        self.block_visits
            .get(&(function.to_string(), block.0))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("no host implementation for external function `{name}`")]
    UnknownExternal { name: String },
    #[error("host call `{name}` failed: {detail}")]
    HostCall { name: String, detail: String },
    #[error("`{function}` called with {actual} arguments, expected {expected}")]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("block bb{block} does not exist in `{function}`")]
    UnknownBlock { function: String, block: u32 },
    #[error("value %{value} read before definition in `{function}`")]
    UndefinedValue { function: String, value: u32 },
    #[error("type error in `{function}`: {detail}")]
    TypeMismatch { function: String, detail: String },
    #[error("null pointer dereference")]
    NullDereference,
    #[error("access to freed object obj{object}")]
    UseAfterFree { object: u32 },
    #[error("{len}-byte access at {pointer} is outside its {object_size}-byte object")]
    OutOfBounds {
        pointer: String,
        len: u64,
        object_size: u64,
    },
    #[error("unsupported memory access: {detail}")]
    UnsupportedMemoryAccess { detail: String },
    #[error("reached `unreachable` in `{function}`")]
    Unreachable { function: String },
    #[error("execution exceeded {limit} steps")]
    StepLimit { limit: u64 },
    #[error("call depth exceeded {depth}")]
    CallDepth { depth: usize },
}

enum Completion {
    Return(Option<Value>),
    Exit(i32),
}

pub struct Interpreter<'m, H> {
    module: &'m IrModule,
    host: H,
    memory: Memory,
    stats: ExecStats,
    step_limit: u64,
    depth: usize,
}

impl<'m, H: Host> Interpreter<'m, H> {
    pub fn new(module: &'m IrModule, host: H) -> Self {
        Self {
            module,
            host,
            memory: Memory::default(),
            stats: ExecStats::default(),
            step_limit: DEFAULT_STEP_LIMIT,
            depth: 0,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Allocates a caller-owned object, e.g. the buffer behind a pointer
    /// argument.
    pub fn alloc_object(&mut self, bytes: Vec<u8>) -> Value {
        Value::Ptr(self.memory.allocate(bytes))
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn stats(&self) -> &ExecStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ExecStats::default();
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Outcome, EvalError> {
        self.depth = 0;
        match self.invoke(name, args)? {
            Completion::Return(value) => Ok(Outcome::Returned(value)),
            Completion::Exit(code) => {
                tracing::debug!(function = name, code, "program exited");
                Ok(Outcome::Exited(code))
            }
        }
    }

    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Completion, EvalError> {
        let module = self.module;
        let function = module
            .function(name)
            .ok_or_else(|| EvalError::UnknownFunction {
                name: name.to_string(),
            })?;
        if function.params.len() != args.len() {
            return Err(EvalError::ArityMismatch {
                function: name.to_string(),
                expected: function.params.len(),
                actual: args.len(),
            });
        }
        *self.stats.calls.entry(name.to_string()).or_default() += 1;

        if function.is_declaration() {
            return self.call_external(function, args);
        }

        if self.depth >= MAX_CALL_DEPTH {
            return Err(EvalError::CallDepth {
                depth: MAX_CALL_DEPTH,
            });
        }
        self.depth += 1;
        let mut frame = Frame::new(function, args);
        let result = self.run_frame(function, &mut frame);
        for object in frame.allocas {
            self.memory.free(object);
        }
        self.depth -= 1;
        result
    }

    fn call_external(&mut self, function: &IrFunction, args: &[Value]) -> Result<Completion, EvalError> {
        match function.name.as_str() {
            OBJ_SIZE_BUILTIN => {
                let pointer = args
                    .first()
                    .and_then(Value::as_pointer)
                    .ok_or_else(|| type_error(function, "argument is not a pointer"))?;
                let size = self.memory.object_size(pointer)?;
                Ok(Completion::Return(Some(Value::int(function.ret, size as i64))))
            }
            EXIT_BUILTIN => {
                let code = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| type_error(function, "exit code is not an integer"))?;
                Ok(Completion::Exit(code as i32))
            }
            name => {
                let result = self.host.call(name, args, function.ret)?;
                Ok(Completion::Return(result))
            }
        }
    }

    fn run_frame(&mut self, function: &IrFunction, frame: &mut Frame) -> Result<Completion, EvalError> {
        let mut current = function.entry;
        loop {
            let block = function
                .block(current)
                .ok_or_else(|| EvalError::UnknownBlock {
                    function: function.name.clone(),
                    block: current.0,
                })?;
            *self
                .stats
                .block_visits
                .entry((function.name.clone(), current.0))
                .or_default() += 1;

            for inst in &block.instructions {
                self.step()?;
                if let Some(code) = self.execute(function, frame, inst)? {
                    return Ok(Completion::Exit(code));
                }
            }

            self.step()?;
            match &block.terminator {
                IrTerminator::Jump { target } => current = *target,
                IrTerminator::Branch {
                    condition,
                    then_block,
                    else_block,
                } => {
                    let taken = frame
                        .get(function, *condition)?
                        .as_bool()
                        .ok_or_else(|| type_error(function, "branch condition is not i1"))?;
                    current = if taken { *then_block } else { *else_block };
                }
                IrTerminator::Return { value } => {
                    let value = value.map(|value| frame.get(function, value)).transpose()?;
                    return Ok(Completion::Return(value));
                }
                IrTerminator::Unreachable => {
                    return Err(EvalError::Unreachable {
                        function: function.name.clone(),
                    });
                }
            }
        }
    }

    fn step(&mut self) -> Result<(), EvalError> {
        self.stats.instructions += 1;
        if self.stats.instructions > self.step_limit {
            return Err(EvalError::StepLimit {
                limit: self.step_limit,
            });
        }
        Ok(())
    }

    /// Runs one instruction. Returns the exit code if the instruction ended
    /// the program.
    fn execute(
        &mut self,
        function: &IrFunction,
        frame: &mut Frame,
        inst: &IrInst,
    ) -> Result<Option<i32>, EvalError> {
        match inst {
            IrInst::Const { dest, literal } => frame.set(*dest, Value::from_literal(literal)),
            IrInst::Alloca { dest, ty } => {
                self.stats.allocas += 1;
                let pointer = self.memory.allocate(vec![0; ty.byte_size() as usize]);
                if let Some(object) = pointer.object {
                    frame.allocas.push(object);
                }
                frame.set(*dest, Value::Ptr(pointer));
            }
            IrInst::Store { value, ptr } => {
                self.stats.stores += 1;
                let value = frame.get(function, *value)?;
                let pointer = pointer_operand(function, frame, *ptr)?;
                self.memory.store(pointer, &value)?;
            }
            IrInst::Load { dest, ty, ptr } => {
                self.stats.loads += 1;
                let pointer = pointer_operand(function, frame, *ptr)?;
                frame.set(*dest, self.memory.load(pointer, *ty)?);
            }
            IrInst::PtrOffset { dest, base, offset } => {
                let pointer = pointer_operand(function, frame, *base)?;
                frame.set(*dest, Value::Ptr(pointer.offset_by(*offset)));
            }
            IrInst::Cast { dest, op, value, ty } => {
                let value = frame.get(function, *value)?;
                frame.set(*dest, cast(function, *op, &value, *ty)?);
            }
            IrInst::Binary { dest, op, lhs, rhs } => {
                let lhs = frame.get(function, *lhs)?;
                let rhs = frame.get(function, *rhs)?;
                frame.set(*dest, binary(function, *op, &lhs, &rhs)?);
            }
            IrInst::Compare { dest, op, lhs, rhs } => {
                let lhs = frame.get(function, *lhs)?;
                let rhs = frame.get(function, *rhs)?;
                frame.set(*dest, Value::bool(compare(function, *op, &lhs, &rhs)?));
            }
            IrInst::Call {
                callee,
                args,
                result,
            } => {
                let args = args
                    .iter()
                    .map(|arg| frame.get(function, *arg))
                    .collect::<Result<Vec<_>, _>>()?;
                match self.invoke(callee, &args)? {
                    Completion::Exit(code) => return Ok(Some(code)),
                    Completion::Return(value) => match (result, value) {
                        (Some(dest), Some(value)) => frame.set(*dest, value),
                        (None, _) => {}
                        (Some(_), None) => {
                            return Err(type_error(
                                function,
                                &format!("call to `{callee}` produced no value"),
                            ));
                        }
                    },
                }
            }
            IrInst::FunctionRef { dest, function: name } => {
                if self.module.function(name).is_none() {
                    return Err(EvalError::UnknownFunction { name: name.clone() });
                }
                frame.set(*dest, Value::Function(name.clone()));
            }
        }
        Ok(None)
    }
}

struct Frame {
    values: BTreeMap<IrValueId, Value>,
    allocas: Vec<ObjectId>,
}

impl Frame {
    fn new(function: &IrFunction, args: &[Value]) -> Self {
        let values = args
            .iter()
            .cloned()
            .enumerate()
            .take(function.params.len())
            .map(|(index, value)| (IrValueId(index as u32), value))
            .collect();
        Self {
            values,
            allocas: Vec::new(),
        }
    }

    fn get(&self, function: &IrFunction, value: IrValueId) -> Result<Value, EvalError> {
        self.values
            .get(&value)
            .cloned()
            .ok_or_else(|| EvalError::UndefinedValue {
                function: function.name.clone(),
                value: value.0,
            })
    }

    fn set(&mut self, value: IrValueId, contents: Value) {
        self.values.insert(value, contents);
    }
}

fn pointer_operand(
    function: &IrFunction,
    frame: &Frame,
    value: IrValueId,
) -> Result<Pointer, EvalError> {
    frame
        .get(function, value)?
        .as_pointer()
        .ok_or_else(|| type_error(function, &format!("%{} is not a pointer", value.0)))
}

fn type_error(function: &IrFunction, detail: &str) -> EvalError {
    EvalError::TypeMismatch {
        function: function.name.clone(),
        detail: detail.to_string(),
    }
}

fn cast(function: &IrFunction, op: IrCastOp, value: &Value, ty: IrType) -> Result<Value, EvalError> {
    let invalid = || {
        type_error(
            function,
            &format!("cannot {} `{value}` to {ty}", op.as_str()),
        )
    };
    match op {
        IrCastOp::Trunc | IrCastOp::ZExt if ty.is_integer() => {
            let bits = value.as_u64().ok_or_else(invalid)?;
            Ok(Value::int(ty, bits as i64))
        }
        IrCastOp::SExt if ty.is_integer() => {
            let signed = value.as_i64().ok_or_else(invalid)?;
            Ok(Value::int(ty, signed))
        }
        IrCastOp::UIToFP if ty == IrType::F64 => {
            let bits = value.as_u64().ok_or_else(invalid)?;
            Ok(Value::Float(bits as f64))
        }
        IrCastOp::Bitcast => match (value, ty) {
            (Value::Int { ty: IrType::I64, bits }, IrType::F64) => {
                Ok(Value::Float(f64::from_bits(*bits)))
            }
            (Value::Float(float), IrType::I64) => Ok(Value::int(IrType::I64, float.to_bits() as i64)),
            (Value::Ptr(_) | Value::Function(_), IrType::Ptr) => Ok(value.clone()),
            _ if value.ty() == ty => Ok(value.clone()),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

fn binary(
    function: &IrFunction,
    op: IrBinaryOp,
    lhs: &Value,
    rhs: &Value,
) -> Result<Value, EvalError> {
    if op.is_float() {
        return match (lhs.as_f64(), rhs.as_f64()) {
            (Some(lhs), Some(rhs)) => Ok(Value::Float(lhs / rhs)),
            _ => Err(type_error(function, "fdiv expects f64 operands")),
        };
    }
    let (Value::Int { ty, bits: a }, Value::Int { ty: rhs_ty, bits: b }) = (lhs, rhs) else {
        return Err(type_error(
            function,
            &format!("`{}` expects integer operands", op.as_str()),
        ));
    };
    if ty != rhs_ty {
        return Err(type_error(
            function,
            &format!("`{}` operands are {ty} and {rhs_ty}", op.as_str()),
        ));
    }
    let bits = match op {
        IrBinaryOp::Add => a.wrapping_add(*b),
        IrBinaryOp::Sub => a.wrapping_sub(*b),
        IrBinaryOp::Mul => a.wrapping_mul(*b),
        IrBinaryOp::And => a & b,
        IrBinaryOp::Or => a | b,
        IrBinaryOp::Xor => a ^ b,
        IrBinaryOp::FDiv => unreachable!("float ops return above"),
    };
    Ok(Value::int(*ty, bits as i64))
}

fn compare(
    function: &IrFunction,
    op: IrCompareOp,
    lhs: &Value,
    rhs: &Value,
) -> Result<bool, EvalError> {
    if op.is_float() {
        let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
            return Err(type_error(function, "fcmp expects f64 operands"));
        };
        // Ordered predicates are false when either side is NaN.
        return Ok(match op {
            IrCompareOp::FOgt => a > b,
            IrCompareOp::FOlt => a < b,
            _ => false,
        });
    }
    match (lhs, rhs) {
        (Value::Int { ty, .. }, Value::Int { ty: rhs_ty, .. }) if ty == rhs_ty => {
            let (a, b) = (lhs.as_u64(), rhs.as_u64());
            let (sa, sb) = (lhs.as_i64(), rhs.as_i64());
            Ok(match op {
                IrCompareOp::Eq => a == b,
                IrCompareOp::Ne => a != b,
                IrCompareOp::Ult => a < b,
                IrCompareOp::Slt => sa < sb,
                IrCompareOp::FOgt | IrCompareOp::FOlt => false,
            })
        }
        (Value::Ptr(_) | Value::Function(_), Value::Ptr(_) | Value::Function(_))
            if matches!(op, IrCompareOp::Eq | IrCompareOp::Ne) =>
        {
            Ok((lhs == rhs) == (op == IrCompareOp::Eq))
        }
        _ => Err(type_error(
            function,
            &format!("cannot `{}` `{lhs}` and `{rhs}`", op.as_str()),
        )),
    }
}
