//! Backend interface and Cranelift backend for macke IR.
//!
//! Instrumented modules are lowered to a relocatable object (AOT) for linking
//! against the KLEE runtime, or into executable memory (JIT) on the host. The
//! backend consumes a verified [`IrModule`] and reports per-function pass
//! stats alongside the emitted code.

use std::collections::BTreeMap;
use std::sync::Arc;

use cranelift::prelude::{
    AbiParam, Block, Configurable, FunctionBuilder, FunctionBuilderContext, InstBuilder,
    StackSlotData, StackSlotKind, Value, types,
};
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{Function, MemFlags, TrapCode};
use cranelift_codegen::{isa, settings};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use macke_ir::{
    IrBinaryOp, IrBlockId, IrCastOp, IrCompareOp, IrError, IrFunction, IrInst, IrLinkage,
    IrLiteral, IrModule, IrTerminator, IrType, IrValueId, verify_module,
};

/// KLEE intrinsic the size checks call.
pub const OBJ_SIZE_SYMBOL: &str = "klee_get_obj_size";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub target_triple: String,
    pub opt_level: OptimizationLevel,
    pub mode: CodegenMode,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            target_triple: "host".to_string(),
            opt_level: OptimizationLevel::Default,
            mode: CodegenMode::Jit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    None,
    Default,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenMode {
    Jit,
    Aot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendArtifact {
    /// Object file bytes in AOT mode; empty in JIT mode.
    pub object: Vec<u8>,
    pub stats: PassStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassStats {
    pub per_function: Vec<FunctionPassStats>,
}

impl PassStats {
    pub fn function(&self, name: &str) -> Option<&FunctionPassStats> {
        self.per_function.iter().find(|stats| stats.function == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionPassStats {
    pub function: String,
    pub block_count: usize,
    pub alloca_count: usize,
    pub load_count: usize,
    pub store_count: usize,
    pub call_count: usize,
    pub external_call_count: usize,
    pub obj_size_check_count: usize,
    pub branch_count: usize,
    pub trap_count: usize,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("target triple `{target}` is not yet supported by this backend")]
    UnsupportedTarget { target: String },
    #[error("unsupported IR type in Cranelift lowering: `{ty}`")]
    UnsupportedType { ty: String },
    #[error("unsupported IR operation in `{function}`: {detail}")]
    UnsupportedIr { function: String, detail: String },
    #[error("invalid IR value `%{value}` referenced in `{function}`")]
    InvalidIrValue { function: String, value: u32 },
    #[error("unknown function `{function}`")]
    UnknownFunction { function: String },
    #[error("module failed verification: {0}")]
    InvalidModule(#[from] IrError),
    #[error("Cranelift module error: {detail}")]
    Module { detail: String },
    #[error("Cranelift object emission failed: {detail}")]
    ObjectEmit { detail: String },
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn compile_module(
        &self,
        module: &IrModule,
        config: &BackendConfig,
    ) -> Result<BackendArtifact, CodegenError>;
}

#[derive(Debug, Default)]
pub struct CraneliftBackend;

impl Backend for CraneliftBackend {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile_module(
        &self,
        module: &IrModule,
        config: &BackendConfig,
    ) -> Result<BackendArtifact, CodegenError> {
        verify_module(module)?;

        let isa = build_isa(config)?;
        let stats = collect_pass_stats(module);
        tracing::debug!(
            module = %module.name,
            functions = stats.per_function.len(),
            mode = ?config.mode,
            "compiling module"
        );
        let object = match config.mode {
            CodegenMode::Jit => compile_with_jit(module, &isa)?,
            CodegenMode::Aot => compile_with_object(module, &isa)?,
        };

        Ok(BackendArtifact { object, stats })
    }
}

fn module_error(detail: impl std::fmt::Display) -> CodegenError {
    CodegenError::Module {
        detail: detail.to_string(),
    }
}

fn build_isa(config: &BackendConfig) -> Result<Arc<dyn isa::TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level_setting(config.opt_level))
        .map_err(module_error)?;
    if matches!(config.mode, CodegenMode::Aot) {
        flag_builder.set("is_pic", "true").map_err(module_error)?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(module_error)?;
    }

    if config.target_triple == "host" {
        let isa_builder = cranelift_native::builder().map_err(|detail| CodegenError::Module {
            detail: format!("host ISA not supported: {detail}"),
        })?;
        return isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(module_error);
    }

    Err(CodegenError::UnsupportedTarget {
        target: config.target_triple.clone(),
    })
}

fn opt_level_setting(level: OptimizationLevel) -> &'static str {
    match level {
        OptimizationLevel::None => "none",
        OptimizationLevel::Default => "speed",
        OptimizationLevel::Aggressive => "speed_and_size",
    }
}

/// Outside KLEE there is no object table; the stub reports size 0 so that
/// no size check matches in JIT-compiled code.
unsafe extern "C" fn obj_size_stub(_object: *const u8) -> u64 {
    0
}

fn register_jit_runtime_symbols(builder: &mut JITBuilder) {
    builder.symbol(OBJ_SIZE_SYMBOL, obj_size_stub as *const u8);
}

fn compile_with_jit(
    module: &IrModule,
    isa: &Arc<dyn isa::TargetIsa>,
) -> Result<Vec<u8>, CodegenError> {
    let mut builder = JITBuilder::with_isa(isa.clone(), cranelift_module::default_libcall_names());
    register_jit_runtime_symbols(&mut builder);
    let mut jit_module = JITModule::new(builder);
    let _ = compile_into_module(&mut jit_module, module)?;
    jit_module.finalize_definitions().map_err(module_error)?;

    // JIT mode emits executable memory, not an object file payload.
    Ok(Vec::new())
}

fn compile_with_object(
    module: &IrModule,
    isa: &Arc<dyn isa::TargetIsa>,
) -> Result<Vec<u8>, CodegenError> {
    let name = if module.name.is_empty() {
        "macke"
    } else {
        module.name.as_str()
    };
    let builder = ObjectBuilder::new(isa.clone(), name, cranelift_module::default_libcall_names())
        .map_err(module_error)?;
    let mut object_module = ObjectModule::new(builder);
    let _ = compile_into_module(&mut object_module, module)?;
    let product = object_module.finish();
    product.emit().map_err(|detail| CodegenError::ObjectEmit {
        detail: detail.to_string(),
    })
}

fn compile_into_module<M: Module>(
    module: &mut M,
    ir: &IrModule,
) -> Result<BTreeMap<String, FuncId>, CodegenError> {
    let mut func_ids: BTreeMap<String, FuncId> = BTreeMap::new();
    let mut signatures: BTreeMap<String, cranelift_codegen::ir::Signature> = BTreeMap::new();
    for function in &ir.functions {
        let signature = build_signature(module, function)?;
        let linkage = if function.is_declaration() {
            Linkage::Import
        } else {
            match function.linkage {
                IrLinkage::External => Linkage::Export,
                IrLinkage::Internal => Linkage::Local,
            }
        };
        let func_id = module
            .declare_function(&function.name, linkage, &signature)
            .map_err(module_error)?;
        func_ids.insert(function.name.clone(), func_id);
        signatures.insert(function.name.clone(), signature);
    }

    let mut builder_context = FunctionBuilderContext::new();
    for function in ir.functions.iter().filter(|function| !function.is_declaration()) {
        let mut context = module.make_context();
        context.func.signature = signatures.get(&function.name).cloned().ok_or_else(|| {
            CodegenError::UnknownFunction {
                function: function.name.clone(),
            }
        })?;

        let ctx = LowerCtx {
            function,
            func_ids: &func_ids,
            value_types: function.value_types(ir)?,
            pointer_type: module.target_config().pointer_type(),
        };
        lower_function(module, &mut context.func, &mut builder_context, &ctx)?;

        let func_id =
            *func_ids
                .get(&function.name)
                .ok_or_else(|| CodegenError::UnknownFunction {
                    function: function.name.clone(),
                })?;
        module
            .define_function(func_id, &mut context)
            .map_err(|detail| CodegenError::Module {
                detail: format!("{detail:?}"),
            })?;
        module.clear_context(&mut context);
    }

    Ok(func_ids)
}

fn build_signature<M: Module>(
    module: &M,
    function: &IrFunction,
) -> Result<cranelift_codegen::ir::Signature, CodegenError> {
    let pointer_type = module.target_config().pointer_type();
    let mut signature = module.make_signature();
    for param in &function.params {
        signature
            .params
            .push(AbiParam::new(clif_type(param.ty, pointer_type)?));
    }
    if function.ret != IrType::Void {
        signature
            .returns
            .push(AbiParam::new(clif_type(function.ret, pointer_type)?));
    }
    Ok(signature)
}

/// `i1` values live in `i8` registers holding 0 or 1.
fn clif_type(
    ty: IrType,
    pointer_type: cranelift::prelude::Type,
) -> Result<cranelift::prelude::Type, CodegenError> {
    match ty {
        IrType::I1 | IrType::I8 => Ok(types::I8),
        IrType::I32 => Ok(types::I32),
        IrType::I64 => Ok(types::I64),
        IrType::F64 => Ok(types::F64),
        IrType::Ptr => Ok(pointer_type),
        IrType::Void => Err(CodegenError::UnsupportedType {
            ty: ty.to_string(),
        }),
    }
}

struct LowerCtx<'a> {
    function: &'a IrFunction,
    func_ids: &'a BTreeMap<String, FuncId>,
    value_types: BTreeMap<IrValueId, IrType>,
    pointer_type: cranelift::prelude::Type,
}

impl LowerCtx<'_> {
    fn unsupported(&self, detail: impl Into<String>) -> CodegenError {
        CodegenError::UnsupportedIr {
            function: self.function.name.clone(),
            detail: detail.into(),
        }
    }

    fn type_of(&self, value: IrValueId) -> Result<IrType, CodegenError> {
        self.value_types
            .get(&value)
            .copied()
            .ok_or_else(|| CodegenError::InvalidIrValue {
                function: self.function.name.clone(),
                value: value.0,
            })
    }
}

fn lower_function<M: Module>(
    module: &mut M,
    func: &mut Function,
    builder_context: &mut FunctionBuilderContext,
    ctx: &LowerCtx<'_>,
) -> Result<(), CodegenError> {
    let function = ctx.function;
    let mut builder = FunctionBuilder::new(func, builder_context);

    // Unreachable blocks are dropped.
    let order = function.reverse_postorder();
    let mut block_map: BTreeMap<IrBlockId, Block> = BTreeMap::new();
    for id in &order {
        block_map.insert(*id, builder.create_block());
    }
    let entry_block = *block_map
        .get(&function.entry)
        .ok_or_else(|| ctx.unsupported("entry block missing"))?;
    builder.append_block_params_for_function_params(entry_block);

    let mut values: BTreeMap<IrValueId, Value> = BTreeMap::new();
    for id in &order {
        let block = function
            .block(*id)
            .ok_or_else(|| ctx.unsupported(format!("block {id} not found")))?;
        let clif_block = *block_map
            .get(id)
            .ok_or_else(|| ctx.unsupported(format!("missing Cranelift block for {id}")))?;
        builder.switch_to_block(clif_block);
        if *id == function.entry {
            for (index, value) in builder.block_params(clif_block).iter().copied().enumerate() {
                values.insert(IrValueId(index as u32), value);
            }
        }

        for inst in &block.instructions {
            lower_instruction(module, &mut builder, ctx, inst, &mut values)?;
        }
        lower_terminator(&mut builder, ctx, &block.terminator, &values, &block_map)?;
    }
    builder.seal_all_blocks();
    builder.finalize();
    Ok(())
}

fn lower_instruction<M: Module>(
    module: &mut M,
    builder: &mut FunctionBuilder,
    ctx: &LowerCtx<'_>,
    inst: &IrInst,
    values: &mut BTreeMap<IrValueId, Value>,
) -> Result<(), CodegenError> {
    let function_name = ctx.function.name.as_str();
    match inst {
        IrInst::Const { dest, literal } => {
            let value = lower_literal(builder, ctx, literal)?;
            values.insert(*dest, value);
        }
        IrInst::Alloca { dest, ty } => {
            let size = ty.byte_size() as u32;
            if size == 0 {
                return Err(ctx.unsupported(format!("alloca of `{ty}`")));
            }
            let align_shift = size.next_power_of_two().trailing_zeros().min(3) as u8;
            let slot = builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                size,
                align_shift,
            ));
            let addr = builder.ins().stack_addr(ctx.pointer_type, slot, 0);
            values.insert(*dest, addr);
        }
        IrInst::Store { value, ptr } => {
            let value = get_value(values, function_name, value)?;
            let ptr = get_value(values, function_name, ptr)?;
            builder.ins().store(MemFlags::new(), value, ptr, 0);
        }
        IrInst::Load { dest, ty, ptr } => {
            let ptr = get_value(values, function_name, ptr)?;
            let value = builder
                .ins()
                .load(clif_type(*ty, ctx.pointer_type)?, MemFlags::new(), ptr, 0);
            values.insert(*dest, value);
        }
        IrInst::PtrOffset { dest, base, offset } => {
            let base = get_value(values, function_name, base)?;
            let addr = builder.ins().iadd_imm(base, *offset);
            values.insert(*dest, addr);
        }
        IrInst::Cast {
            dest,
            op,
            value,
            ty,
        } => {
            let from = ctx.type_of(*value)?;
            let lowered = get_value(values, function_name, value)?;
            let result = lower_cast(builder, ctx, *op, lowered, from, *ty)?;
            values.insert(*dest, result);
        }
        IrInst::Binary { dest, op, lhs, rhs } => {
            let lhs = get_value(values, function_name, lhs)?;
            let rhs = get_value(values, function_name, rhs)?;
            let result = lower_binary(builder, function_name, *op, lhs, rhs)?;
            values.insert(*dest, result);
        }
        IrInst::Compare { dest, op, lhs, rhs } => {
            let lhs = get_value(values, function_name, lhs)?;
            let rhs = get_value(values, function_name, rhs)?;
            let result = match op {
                IrCompareOp::Eq => builder.ins().icmp(IntCC::Equal, lhs, rhs),
                IrCompareOp::Ne => builder.ins().icmp(IntCC::NotEqual, lhs, rhs),
                IrCompareOp::Ult => builder.ins().icmp(IntCC::UnsignedLessThan, lhs, rhs),
                IrCompareOp::Slt => builder.ins().icmp(IntCC::SignedLessThan, lhs, rhs),
                IrCompareOp::FOgt => builder.ins().fcmp(FloatCC::GreaterThan, lhs, rhs),
                IrCompareOp::FOlt => builder.ins().fcmp(FloatCC::LessThan, lhs, rhs),
            };
            values.insert(*dest, result);
        }
        IrInst::Call {
            callee,
            args,
            result,
        } => {
            let callee_id =
                *ctx.func_ids
                    .get(callee)
                    .ok_or_else(|| CodegenError::UnknownFunction {
                        function: callee.clone(),
                    })?;
            let mut lowered_args = Vec::with_capacity(args.len());
            for arg in args {
                lowered_args.push(get_value(values, function_name, arg)?);
            }
            let callee_ref = module.declare_func_in_func(callee_id, builder.func);
            let call = builder.ins().call(callee_ref, &lowered_args);
            if let Some(result) = result {
                let value = builder
                    .inst_results(call)
                    .first()
                    .copied()
                    .ok_or_else(|| {
                        ctx.unsupported(format!("result of void call to `{callee}` is used"))
                    })?;
                values.insert(*result, value);
            }
        }
        IrInst::FunctionRef { dest, function } => {
            let func_id =
                *ctx.func_ids
                    .get(function)
                    .ok_or_else(|| CodegenError::UnknownFunction {
                        function: function.clone(),
                    })?;
            let func_ref = module.declare_func_in_func(func_id, builder.func);
            let addr = builder.ins().func_addr(ctx.pointer_type, func_ref);
            values.insert(*dest, addr);
        }
    }
    Ok(())
}

/// Narrow integer immediates must be zero-extended to satisfy the verifier.
fn int_immediate(ty: IrType, value: i64) -> i64 {
    match ty.bit_width() {
        0 | 64.. => value,
        bits => value & ((1i64 << bits) - 1),
    }
}

fn lower_literal(
    builder: &mut FunctionBuilder,
    ctx: &LowerCtx<'_>,
    literal: &IrLiteral,
) -> Result<Value, CodegenError> {
    let value = match literal {
        IrLiteral::Int { ty, value } => builder
            .ins()
            .iconst(clif_type(*ty, ctx.pointer_type)?, int_immediate(*ty, *value)),
        IrLiteral::Float { value } => builder.ins().f64const(*value),
        IrLiteral::Null => builder.ins().iconst(ctx.pointer_type, 0),
    };
    Ok(value)
}

fn zero_extend(builder: &mut FunctionBuilder, value: Value, to: cranelift::prelude::Type) -> Value {
    if builder.func.dfg.value_type(value).bits() < to.bits() {
        builder.ins().uextend(to, value)
    } else {
        value
    }
}

fn lower_cast(
    builder: &mut FunctionBuilder,
    ctx: &LowerCtx<'_>,
    op: IrCastOp,
    value: Value,
    from: IrType,
    to: IrType,
) -> Result<Value, CodegenError> {
    let to_clif = clif_type(to, ctx.pointer_type)?;
    let from_clif = builder.func.dfg.value_type(value);
    let result = match op {
        IrCastOp::Trunc => {
            let narrowed = if from_clif.bits() > to_clif.bits() {
                builder.ins().ireduce(to_clif, value)
            } else {
                value
            };
            if to == IrType::I1 {
                builder.ins().band_imm(narrowed, 1)
            } else {
                narrowed
            }
        }
        IrCastOp::ZExt => zero_extend(builder, value, to_clif),
        // An `i1` true is all ones once sign-extended.
        IrCastOp::SExt if from == IrType::I1 => {
            let wide = zero_extend(builder, value, to_clif);
            builder.ins().ineg(wide)
        }
        IrCastOp::SExt => {
            if from_clif.bits() < to_clif.bits() {
                builder.ins().sextend(to_clif, value)
            } else {
                value
            }
        }
        IrCastOp::UIToFP => builder.ins().fcvt_from_uint(to_clif, value),
        IrCastOp::Bitcast => {
            if from_clif == to_clif {
                value
            } else if from_clif.bits() == to_clif.bits() {
                builder.ins().bitcast(to_clif, MemFlags::new(), value)
            } else {
                return Err(ctx.unsupported(format!("bitcast from `{from}` to `{to}`")));
            }
        }
    };
    Ok(result)
}

fn lower_binary(
    builder: &mut FunctionBuilder,
    function_name: &str,
    op: IrBinaryOp,
    lhs: Value,
    rhs: Value,
) -> Result<Value, CodegenError> {
    let lhs_ty = builder.func.dfg.value_type(lhs);
    let rhs_ty = builder.func.dfg.value_type(rhs);

    if lhs_ty != rhs_ty {
        return Err(CodegenError::UnsupportedIr {
            function: function_name.to_string(),
            detail: format!("binary operands have mismatched types `{lhs_ty}` and `{rhs_ty}`"),
        });
    }

    let value = match op {
        IrBinaryOp::Add if lhs_ty.is_int() => builder.ins().iadd(lhs, rhs),
        IrBinaryOp::Sub if lhs_ty.is_int() => builder.ins().isub(lhs, rhs),
        IrBinaryOp::Mul if lhs_ty.is_int() => builder.ins().imul(lhs, rhs),
        IrBinaryOp::And if lhs_ty.is_int() => builder.ins().band(lhs, rhs),
        IrBinaryOp::Or if lhs_ty.is_int() => builder.ins().bor(lhs, rhs),
        IrBinaryOp::Xor if lhs_ty.is_int() => builder.ins().bxor(lhs, rhs),
        IrBinaryOp::FDiv if lhs_ty.is_float() => builder.ins().fdiv(lhs, rhs),
        _ => {
            return Err(CodegenError::UnsupportedIr {
                function: function_name.to_string(),
                detail: format!(
                    "binary operation `{op:?}` unsupported for Cranelift type `{lhs_ty}`"
                ),
            });
        }
    };

    Ok(value)
}

fn lower_terminator(
    builder: &mut FunctionBuilder,
    ctx: &LowerCtx<'_>,
    terminator: &IrTerminator,
    values: &BTreeMap<IrValueId, Value>,
    block_map: &BTreeMap<IrBlockId, Block>,
) -> Result<(), CodegenError> {
    let function_name = ctx.function.name.as_str();
    let target = |id: &IrBlockId| {
        block_map
            .get(id)
            .copied()
            .ok_or_else(|| ctx.unsupported(format!("branch target {id} not found")))
    };
    match terminator {
        IrTerminator::Jump { target: id } => {
            let block = target(id)?;
            builder.ins().jump(block, &[]);
        }
        IrTerminator::Branch {
            condition,
            then_block,
            else_block,
        } => {
            let condition = get_value(values, function_name, condition)?;
            let then_clif = target(then_block)?;
            let else_clif = target(else_block)?;
            builder
                .ins()
                .brif(condition, then_clif, &[], else_clif, &[]);
        }
        IrTerminator::Return { value: Some(value) } => {
            let value = get_value(values, function_name, value)?;
            builder.ins().return_(&[value]);
        }
        IrTerminator::Return { value: None } => {
            builder.ins().return_(&[]);
        }
        IrTerminator::Unreachable => {
            builder.ins().trap(TrapCode::unwrap_user(1));
        }
    }
    Ok(())
}

fn get_value(
    values: &BTreeMap<IrValueId, Value>,
    function_name: &str,
    value_id: &IrValueId,
) -> Result<Value, CodegenError> {
    values
        .get(value_id)
        .copied()
        .ok_or_else(|| CodegenError::InvalidIrValue {
            function: function_name.to_string(),
            value: value_id.0,
        })
}

pub fn collect_pass_stats(module: &IrModule) -> PassStats {
    let per_function = module
        .functions
        .iter()
        .filter(|function| !function.is_declaration())
        .map(|function| collect_function_stats(module, function))
        .collect::<Vec<_>>();
    PassStats { per_function }
}

fn collect_function_stats(module: &IrModule, function: &IrFunction) -> FunctionPassStats {
    let mut stats = FunctionPassStats {
        function: function.name.clone(),
        block_count: function.blocks.len(),
        ..FunctionPassStats::default()
    };

    for block in &function.blocks {
        match block.terminator {
            IrTerminator::Branch { .. } => stats.branch_count += 1,
            IrTerminator::Unreachable => stats.trap_count += 1,
            IrTerminator::Jump { .. } | IrTerminator::Return { .. } => {}
        }
        for inst in &block.instructions {
            match inst {
                IrInst::Alloca { .. } => stats.alloca_count += 1,
                IrInst::Load { .. } => stats.load_count += 1,
                IrInst::Store { .. } => stats.store_count += 1,
                IrInst::Call { callee, .. } => {
                    stats.call_count += 1;
                    if module
                        .function(callee)
                        .is_some_and(IrFunction::is_declaration)
                    {
                        stats.external_call_count += 1;
                    }
                    if callee == OBJ_SIZE_SYMBOL {
                        stats.obj_size_check_count += 1;
                    }
                }
                IrInst::Const { .. }
                | IrInst::PtrOffset { .. }
                | IrInst::Cast { .. }
                | IrInst::Binary { .. }
                | IrInst::Compare { .. }
                | IrInst::FunctionRef { .. } => {}
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use macke_ir::{FunctionBuilder as IrBuilder, IrParam};
    use macke_ktest::{KTestObject, TestVector, VectorSources};
    use macke_prepend::{PrependConfig, SamplingConfig, prepend_errors};

    use super::*;

    /// `i32 add(i32 a, i32 b)` and `i32 main(i32 x)` calling `add(x, 100)`.
    fn sample_add_module() -> IrModule {
        let mut add = IrBuilder::new(
            "add",
            vec![IrParam::named("a", IrType::I32), IrParam::named("b", IrType::I32)],
            IrType::I32,
            IrLinkage::Internal,
        );
        let entry = add.create_block();
        let sum = add.binary(entry, IrBinaryOp::Add, add.param(0), add.param(1));
        add.ret(entry, Some(sum));

        let mut main = IrBuilder::new(
            "main",
            vec![IrParam::named("x", IrType::I32)],
            IrType::I32,
            IrLinkage::External,
        );
        let entry = main.create_block();
        let hundred = main.iconst(entry, IrType::I32, 100);
        let result = main.call_value(entry, "add", vec![main.param(0), hundred], IrType::I32);
        main.ret(entry, Some(result));

        IrModule {
            name: "add".to_string(),
            functions: vec![
                add.finish().expect("add builds"),
                main.finish().expect("main builds"),
            ],
        }
    }

    fn instrumented_module(sampling: SamplingConfig) -> IrModule {
        let mut module = sample_add_module();
        let config = PrependConfig::new("add", VectorSources::default()).with_sampling(sampling);
        let vector = TestVector::new(
            "test000001.ktest",
            vec![
                KTestObject {
                    name: "a".to_string(),
                    bytes: 1i32.to_le_bytes().to_vec(),
                },
                KTestObject {
                    name: "b".to_string(),
                    bytes: 2i32.to_le_bytes().to_vec(),
                },
            ],
        );
        prepend_errors(&mut module, &config, &[vector]).expect("prepend succeeds");
        module
    }

    fn jit_main(module: &IrModule) -> (JITModule, *const u8) {
        let isa = build_isa(&BackendConfig::default()).expect("host ISA should build");
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        register_jit_runtime_symbols(&mut builder);
        let mut jit_module = JITModule::new(builder);
        let func_ids = compile_into_module(&mut jit_module, module).expect("module compiles");
        jit_module
            .finalize_definitions()
            .expect("finalize definitions should succeed");
        let main_id = *func_ids.get("main").expect("main function id");
        let main_ptr = jit_module.get_finalized_function(main_id);
        (jit_module, main_ptr)
    }

    #[test]
    fn cranelift_backend_executes_jit_module() {
        let module = sample_add_module();
        let (_jit_module, main_ptr) = jit_main(&module);
        let main: unsafe extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(main_ptr) };
        assert_eq!(unsafe { main(5) }, 105);
    }

    #[test]
    fn instrumented_module_falls_through_to_original_outside_klee() {
        let module = instrumented_module(SamplingConfig::Always);
        let (_jit_module, main_ptr) = jit_main(&module);
        let main: unsafe extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(main_ptr) };
        assert_eq!(unsafe { main(1) }, 101);
        assert_eq!(unsafe { main(-7) }, 93);
    }

    #[test]
    fn cranelift_backend_emits_object_for_instrumented_module() {
        let module = instrumented_module(SamplingConfig::default());
        let config = BackendConfig {
            mode: CodegenMode::Aot,
            ..BackendConfig::default()
        };

        let artifact = CraneliftBackend
            .compile_module(&module, &config)
            .expect("AOT compilation should succeed");

        assert!(
            !artifact.object.is_empty(),
            "AOT mode should emit object bytes"
        );
        let shadow = artifact
            .stats
            .function("__macke_error_add")
            .expect("shadow stats");
        assert_eq!(shadow.obj_size_check_count, 2);
        assert_eq!(shadow.trap_count, 1);
        assert_eq!(shadow.alloca_count, 2);
        assert_eq!(shadow.load_count, 8);
    }

    #[test]
    fn cranelift_backend_compiles_wall_clock_gate_in_jit_mode() {
        let module = instrumented_module(SamplingConfig::default());
        let artifact = CraneliftBackend
            .compile_module(&module, &BackendConfig::default())
            .expect("JIT compilation should succeed");
        assert!(
            artifact.object.is_empty(),
            "JIT mode should not emit object bytes"
        );
    }

    #[test]
    fn cranelift_backend_rejects_unverified_module() {
        let mut module = sample_add_module();
        module.functions[1].blocks[0].instructions.clear();
        let err = CraneliftBackend
            .compile_module(&module, &BackendConfig::default())
            .expect_err("undefined values must be rejected");
        assert!(matches!(err, CodegenError::InvalidModule(_)));
    }

    #[test]
    fn cranelift_backend_rejects_foreign_targets() {
        let config = BackendConfig {
            target_triple: "riscv64gc-unknown-linux-gnu".to_string(),
            ..BackendConfig::default()
        };
        let err = CraneliftBackend
            .compile_module(&sample_add_module(), &config)
            .expect_err("only the host target is supported");
        assert_eq!(
            err,
            CodegenError::UnsupportedTarget {
                target: "riscv64gc-unknown-linux-gnu".to_string(),
            }
        );
    }

    #[test]
    fn unreachable_blocks_are_not_lowered() {
        let mut f = IrBuilder::new("f", vec![], IrType::I32, IrLinkage::External);
        let entry = f.create_block();
        let dead = f.create_block();
        let one = f.iconst(entry, IrType::I32, 1);
        f.ret(entry, Some(one));
        f.unreachable(dead);
        let function = f.finish().expect("f builds");
        assert_eq!(function.reverse_postorder(), vec![IrBlockId(0)]);
    }

    #[test]
    fn reverse_postorder_places_dominators_first() {
        let module = instrumented_module(SamplingConfig::Always);
        let shadow = module.function("__macke_error_add").expect("shadow");
        let order = shadow.reverse_postorder();
        let position = |id: u32| order.iter().position(|block| block.0 == id);
        assert_eq!(order.first(), Some(&IrBlockId(0)));
        assert!(position(3) < position(4));
        assert!(position(4) < position(2));
    }

    #[test]
    fn narrow_immediates_are_zero_extended() {
        assert_eq!(int_immediate(IrType::I32, -1), 0xffff_ffff);
        assert_eq!(int_immediate(IrType::I8, 0x1ff), 0xff);
        assert_eq!(int_immediate(IrType::I1, 3), 1);
        assert_eq!(int_immediate(IrType::I64, -1), -1);
    }
}
