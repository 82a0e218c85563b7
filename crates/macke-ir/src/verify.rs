//! Structural and type checks run before a module is handed to a backend or
//! written back to disk.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    IrBlockId, IrCastOp, IrError, IrFunction, IrInst, IrModule, IrTerminator, IrType, IrValueId,
};

pub fn verify_module(module: &IrModule) -> Result<(), IrError> {
    let mut names = BTreeSet::new();
    for function in &module.functions {
        if !names.insert(function.name.as_str()) {
            return Err(IrError::DuplicateFunction {
                name: function.name.clone(),
            });
        }
    }
    for function in module.functions.iter().filter(|f| !f.is_declaration()) {
        verify_function(module, function)?;
    }
    Ok(())
}

pub fn verify_function(module: &IrModule, function: &IrFunction) -> Result<(), IrError> {
    if function.is_declaration() {
        return Ok(());
    }

    let mut block_ids = BTreeSet::new();
    for block in &function.blocks {
        if !block_ids.insert(block.id) {
            return Err(type_error(function, format!("block {} defined twice", block.id)));
        }
    }
    if !block_ids.contains(&function.entry) {
        return Err(IrError::UnknownBlock {
            function: function.name.clone(),
            block: function.entry.0,
        });
    }

    let types = function.value_types(module)?;
    let type_of = |value: &crate::IrValueId| {
        types
            .get(value)
            .copied()
            .ok_or_else(|| IrError::UndefinedValue {
                function: function.name.clone(),
                value: value.0,
            })
    };

    for block in &function.blocks {
        for inst in &block.instructions {
            for operand in inst.operands() {
                type_of(&operand)?;
            }
            match inst {
                IrInst::Store { ptr, .. } | IrInst::Load { ptr, .. } => {
                    expect_type(function, type_of(ptr)?, IrType::Ptr, "memory access address")?;
                }
                IrInst::PtrOffset { base, .. } => {
                    expect_type(function, type_of(base)?, IrType::Ptr, "offset base")?;
                }
                IrInst::Binary { lhs, rhs, .. } | IrInst::Compare { lhs, rhs, .. } => {
                    let lhs_ty = type_of(lhs)?;
                    let rhs_ty = type_of(rhs)?;
                    if lhs_ty != rhs_ty {
                        return Err(type_error(
                            function,
                            format!("operands of `{inst}` have types {lhs_ty} and {rhs_ty}"),
                        ));
                    }
                    if op_is_float(inst) != (lhs_ty == IrType::F64) {
                        return Err(type_error(
                            function,
                            format!("`{inst}` does not accept {lhs_ty} operands"),
                        ));
                    }
                }
                IrInst::Call { callee, args, result } => {
                    let target =
                        module
                            .function(callee)
                            .ok_or_else(|| IrError::UnknownFunction {
                                name: callee.clone(),
                            })?;
                    if target.params.len() != args.len() {
                        return Err(IrError::ArityMismatch {
                            function: function.name.clone(),
                            callee: callee.clone(),
                            expected: target.params.len(),
                            actual: args.len(),
                        });
                    }
                    for (arg, param) in args.iter().zip(&target.params) {
                        expect_type(function, type_of(arg)?, param.ty, "call argument")?;
                    }
                    if result.is_some() == (target.ret == IrType::Void) {
                        return Err(type_error(
                            function,
                            format!("call to `{callee}` disagrees with its return type"),
                        ));
                    }
                }
                IrInst::FunctionRef { function: name, .. } => {
                    if module.function(name).is_none() {
                        return Err(IrError::UnknownFunction { name: name.clone() });
                    }
                }
                IrInst::Cast { op, value, ty, .. } => {
                    check_cast(function, *op, type_of(value)?, *ty)?;
                }
                IrInst::Const { .. } | IrInst::Alloca { .. } => {}
            }
        }

        for target in block.terminator.successors() {
            if !block_ids.contains(&target) {
                return Err(IrError::UnknownBlock {
                    function: function.name.clone(),
                    block: target.0,
                });
            }
        }
        match &block.terminator {
            IrTerminator::Branch { condition, .. } => {
                expect_type(function, type_of(condition)?, IrType::I1, "branch condition")?;
            }
            IrTerminator::Return { value: Some(value) } => {
                expect_type(function, type_of(value)?, function.ret, "return value")?;
            }
            IrTerminator::Return { value: None } => {
                if function.ret != IrType::Void {
                    return Err(type_error(
                        function,
                        format!("missing {} return value", function.ret),
                    ));
                }
            }
            IrTerminator::Jump { .. } | IrTerminator::Unreachable => {}
        }
    }

    verify_dominance(function)
}

fn check_cast(function: &IrFunction, op: IrCastOp, from: IrType, to: IrType) -> Result<(), IrError> {
    let valid = match op {
        IrCastOp::Trunc => from.is_integer() && to.is_integer() && to.bit_width() < from.bit_width(),
        IrCastOp::ZExt | IrCastOp::SExt => {
            from.is_integer() && to.is_integer() && to.bit_width() > from.bit_width()
        }
        IrCastOp::UIToFP => from.is_integer() && to == IrType::F64,
        IrCastOp::Bitcast => {
            from != IrType::Void && to != IrType::Void && from.bit_width() == to.bit_width()
        }
    };
    if valid {
        Ok(())
    } else {
        Err(type_error(function, format!("invalid cast `{}` from {from} to {to}", op.as_str())))
    }
}

/// Every use must be preceded by its definition on all paths from the entry.
///
/// Computes, per reachable block, the values defined on every path into it
/// (a forward must-analysis over the CFG), then walks each block in order.
/// Unreachable blocks are skipped.
fn verify_dominance(function: &IrFunction) -> Result<(), IrError> {
    let order = function.reverse_postorder();
    let mut predecessors: BTreeMap<IrBlockId, Vec<IrBlockId>> = BTreeMap::new();
    for id in &order {
        if let Some(block) = function.block(*id) {
            for successor in block.terminator.successors() {
                predecessors.entry(successor).or_default().push(*id);
            }
        }
    }

    let params: BTreeSet<IrValueId> = (0..function.params.len() as u32).map(IrValueId).collect();
    // A predecessor missing from `defined_out` has not been visited and is ignored.
    let mut defined_out: BTreeMap<IrBlockId, BTreeSet<IrValueId>> = BTreeMap::new();
    let defined_in = |id: IrBlockId, out: &BTreeMap<IrBlockId, BTreeSet<IrValueId>>| {
        if id == function.entry {
            return params.clone();
        }
        let mut known = predecessors
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|pred| out.get(pred));
        let Some(first) = known.next() else {
            return BTreeSet::new();
        };
        known.fold(first.clone(), |acc, set| acc.intersection(set).copied().collect())
    };

    let mut changed = true;
    while changed {
        changed = false;
        for id in &order {
            let Some(block) = function.block(*id) else {
                continue;
            };
            let mut defined = defined_in(*id, &defined_out);
            defined.extend(block.instructions.iter().filter_map(IrInst::dest));
            if defined_out.get(id) != Some(&defined) {
                defined_out.insert(*id, defined);
                changed = true;
            }
        }
    }

    for id in &order {
        let Some(block) = function.block(*id) else {
            continue;
        };
        let mut defined = defined_in(*id, &defined_out);
        let check = |value: IrValueId, defined: &BTreeSet<IrValueId>| {
            if defined.contains(&value) {
                Ok(())
            } else {
                Err(IrError::NonDominatingUse {
                    function: function.name.clone(),
                    block: id.0,
                    value: value.0,
                })
            }
        };
        for inst in &block.instructions {
            for operand in inst.operands() {
                check(operand, &defined)?;
            }
            defined.extend(inst.dest());
        }
        for operand in block.terminator.operands() {
            check(operand, &defined)?;
        }
    }
    Ok(())
}

fn op_is_float(inst: &IrInst) -> bool {
    match inst {
        IrInst::Binary { op, .. } => op.is_float(),
        IrInst::Compare { op, .. } => op.is_float(),
        _ => false,
    }
}

fn expect_type(
    function: &IrFunction,
    actual: IrType,
    expected: IrType,
    what: &str,
) -> Result<(), IrError> {
    if actual == expected {
        Ok(())
    } else {
        Err(type_error(
            function,
            format!("{what} has type {actual}, expected {expected}"),
        ))
    }
}

fn type_error(function: &IrFunction, detail: String) -> IrError {
    IrError::TypeMismatch {
        function: function.name.clone(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionBuilder, IrBinaryOp, IrLinkage, IrParam};

    fn module_with(function: IrFunction) -> IrModule {
        IrModule {
            name: "verify".to_string(),
            functions: vec![
                IrFunction::declaration("exit", vec![IrType::I32], IrType::Void),
                function,
            ],
        }
    }

    #[test]
    fn accepts_well_formed_function() {
        let mut builder = FunctionBuilder::new(
            "inc",
            vec![IrParam::named("x", IrType::I64)],
            IrType::I64,
            IrLinkage::External,
        );
        let entry = builder.create_block();
        let one = builder.iconst(entry, IrType::I64, 1);
        let sum = builder.binary(entry, IrBinaryOp::Add, builder.param(0), one);
        builder.ret(entry, Some(sum));
        let module = module_with(builder.finish().expect("inc builds"));
        assert_eq!(verify_module(&module), Ok(()));
    }

    #[test]
    fn rejects_non_boolean_branch_condition() {
        let mut builder = FunctionBuilder::new(
            "bad_branch",
            vec![IrParam::named("x", IrType::I32)],
            IrType::Void,
            IrLinkage::External,
        );
        let entry = builder.create_block();
        let exit = builder.create_block();
        builder.branch(entry, builder.param(0), exit, exit);
        builder.ret(exit, None);
        let module = module_with(builder.finish().expect("builds"));
        assert!(matches!(
            verify_module(&module),
            Err(IrError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_call_arity_mismatch() {
        let mut builder = FunctionBuilder::new("bad_call", vec![], IrType::Void, IrLinkage::External);
        let entry = builder.create_block();
        let _ = builder.call(entry, "exit", vec![], IrType::Void);
        builder.unreachable(entry);
        let module = module_with(builder.finish().expect("builds"));
        assert_eq!(
            verify_module(&module),
            Err(IrError::ArityMismatch {
                function: "bad_call".to_string(),
                callee: "exit".to_string(),
                expected: 1,
                actual: 0,
            })
        );
    }

    #[test]
    fn rejects_jump_to_missing_block() {
        let mut function = {
            let mut builder =
                FunctionBuilder::new("bad_jump", vec![], IrType::Void, IrLinkage::External);
            let entry = builder.create_block();
            builder.ret(entry, None);
            builder.finish().expect("builds")
        };
        function.blocks[0].terminator = IrTerminator::Jump {
            target: crate::IrBlockId(7),
        };
        let module = module_with(function);
        assert_eq!(
            verify_module(&module),
            Err(IrError::UnknownBlock {
                function: "bad_jump".to_string(),
                block: 7,
            })
        );
    }

    #[test]
    fn rejects_value_defined_on_one_branch_only() {
        let mut builder = FunctionBuilder::new(
            "join",
            vec![IrParam::named("c", IrType::I1)],
            IrType::I32,
            IrLinkage::External,
        );
        let entry = builder.create_block();
        let left = builder.create_block();
        let right = builder.create_block();
        let join = builder.create_block();
        builder.branch(entry, builder.param(0), left, right);
        let seven = builder.iconst(left, IrType::I32, 7);
        builder.jump(left, join);
        builder.jump(right, join);
        builder.ret(join, Some(seven));
        let module = module_with(builder.finish().expect("builds"));
        assert_eq!(
            verify_module(&module),
            Err(IrError::NonDominatingUse {
                function: "join".to_string(),
                block: join.0,
                value: seven.0,
            })
        );
    }

    #[test]
    fn accepts_value_defined_before_branch_and_loop() {
        let mut builder = FunctionBuilder::new(
            "looping",
            vec![IrParam::named("c", IrType::I1)],
            IrType::I32,
            IrLinkage::External,
        );
        let entry = builder.create_block();
        let header = builder.create_block();
        let body = builder.create_block();
        let exit = builder.create_block();
        let seven = builder.iconst(entry, IrType::I32, 7);
        builder.jump(entry, header);
        builder.branch(header, builder.param(0), body, exit);
        let _ = builder.binary(body, IrBinaryOp::Add, seven, seven);
        builder.jump(body, header);
        builder.ret(exit, Some(seven));
        let module = module_with(builder.finish().expect("builds"));
        assert_eq!(verify_module(&module), Ok(()));
    }

    #[test]
    fn rejects_use_before_definition_in_block() {
        let mut function = {
            let mut builder = FunctionBuilder::new("early", vec![], IrType::I32, IrLinkage::External);
            let entry = builder.create_block();
            let one = builder.iconst(entry, IrType::I32, 1);
            let two = builder.binary(entry, IrBinaryOp::Add, one, one);
            builder.ret(entry, Some(two));
            builder.finish().expect("builds")
        };
        function.blocks[0].instructions.swap(0, 1);
        let module = module_with(function);
        assert!(matches!(
            verify_module(&module),
            Err(IrError::NonDominatingUse { .. })
        ));
    }

    #[test]
    fn cast_direction_and_width_are_checked() {
        let cast_module = |op: IrCastOp, from: IrType, to: IrType| {
            let mut builder =
                FunctionBuilder::new("cast", vec![IrParam::named("x", from)], to, IrLinkage::External);
            let entry = builder.create_block();
            let result = builder.cast(entry, op, builder.param(0), to);
            builder.ret(entry, Some(result));
            module_with(builder.finish().expect("builds"))
        };

        assert_eq!(verify_module(&cast_module(IrCastOp::Trunc, IrType::I64, IrType::I32)), Ok(()));
        assert_eq!(verify_module(&cast_module(IrCastOp::ZExt, IrType::I8, IrType::I64)), Ok(()));
        assert_eq!(verify_module(&cast_module(IrCastOp::UIToFP, IrType::I32, IrType::F64)), Ok(()));
        assert_eq!(verify_module(&cast_module(IrCastOp::Bitcast, IrType::Ptr, IrType::I64)), Ok(()));

        for (op, from, to) in [
            (IrCastOp::Trunc, IrType::I32, IrType::I64),
            (IrCastOp::Trunc, IrType::I32, IrType::I32),
            (IrCastOp::ZExt, IrType::I64, IrType::I8),
            (IrCastOp::SExt, IrType::F64, IrType::I64),
            (IrCastOp::UIToFP, IrType::I32, IrType::I64),
            (IrCastOp::Bitcast, IrType::I32, IrType::I64),
        ] {
            assert!(
                matches!(
                    verify_module(&cast_module(op, from, to)),
                    Err(IrError::TypeMismatch { .. })
                ),
                "{op:?} from {from} to {to} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_duplicate_function_names() {
        let module = IrModule {
            name: "dups".to_string(),
            functions: vec![
                IrFunction::declaration("exit", vec![IrType::I32], IrType::Void),
                IrFunction::declaration("exit", vec![IrType::I32], IrType::Void),
            ],
        };
        assert_eq!(
            verify_module(&module),
            Err(IrError::DuplicateFunction {
                name: "exit".to_string(),
            })
        );
    }
}
