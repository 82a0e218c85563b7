use std::collections::BTreeSet;

use crate::{
    IrAttribute, IrBinaryOp, IrBlock, IrBlockId, IrCastOp, IrCompareOp, IrError, IrFunction,
    IrInst, IrLinkage, IrLiteral, IrParam, IrTerminator, IrType, IrValueId,
};

#[derive(Debug, Default)]
struct PendingBlock {
    instructions: Vec<IrInst>,
    terminator: Option<IrTerminator>,
}

/// Incremental construction of one [`IrFunction`].
///
/// Blocks are numbered in creation order and the first block created is the
/// entry. Every emitting method names the block it appends to, so several
/// blocks can be filled in an interleaved order. Misuse (unknown block,
/// appending after a terminator) is recorded and reported by
/// [`FunctionBuilder::finish`].
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    params: Vec<IrParam>,
    ret: IrType,
    linkage: IrLinkage,
    attributes: BTreeSet<IrAttribute>,
    blocks: Vec<PendingBlock>,
    next_value: u32,
    misuse: Option<IrError>,
}

impl FunctionBuilder {
    pub fn new(
        name: impl Into<String>,
        params: Vec<IrParam>,
        ret: IrType,
        linkage: IrLinkage,
    ) -> Self {
        let next_value = params.len() as u32;
        Self {
            name: name.into(),
            params,
            ret,
            linkage,
            attributes: BTreeSet::new(),
            blocks: Vec::new(),
            next_value,
            misuse: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[IrParam] {
        &self.params
    }

    pub fn ret_type(&self) -> IrType {
        self.ret
    }

    /// Value id of parameter `index`. Parameters are values `0..n`.
    pub fn param(&self, index: usize) -> IrValueId {
        IrValueId(index as u32)
    }

    pub fn add_attribute(&mut self, attribute: IrAttribute) {
        self.attributes.insert(attribute);
    }

    pub fn create_block(&mut self) -> IrBlockId {
        let id = IrBlockId(self.blocks.len() as u32);
        self.blocks.push(PendingBlock::default());
        id
    }

    pub fn iconst(&mut self, block: IrBlockId, ty: IrType, value: i64) -> IrValueId {
        self.constant(block, IrLiteral::Int { ty, value })
    }

    pub fn bool_const(&mut self, block: IrBlockId, value: bool) -> IrValueId {
        self.constant(block, IrLiteral::bool(value))
    }

    pub fn fconst(&mut self, block: IrBlockId, value: f64) -> IrValueId {
        self.constant(block, IrLiteral::Float { value })
    }

    pub fn null(&mut self, block: IrBlockId) -> IrValueId {
        self.constant(block, IrLiteral::Null)
    }

    fn constant(&mut self, block: IrBlockId, literal: IrLiteral) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::Const { dest, literal });
        dest
    }

    pub fn alloca(&mut self, block: IrBlockId, ty: IrType) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::Alloca { dest, ty });
        dest
    }

    pub fn store(&mut self, block: IrBlockId, value: IrValueId, ptr: IrValueId) {
        self.push(block, IrInst::Store { value, ptr });
    }

    pub fn load(&mut self, block: IrBlockId, ty: IrType, ptr: IrValueId) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::Load { dest, ty, ptr });
        dest
    }

    pub fn ptr_offset(&mut self, block: IrBlockId, base: IrValueId, offset: i64) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::PtrOffset { dest, base, offset });
        dest
    }

    pub fn cast(
        &mut self,
        block: IrBlockId,
        op: IrCastOp,
        value: IrValueId,
        ty: IrType,
    ) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::Cast { dest, op, value, ty });
        dest
    }

    pub fn binary(
        &mut self,
        block: IrBlockId,
        op: IrBinaryOp,
        lhs: IrValueId,
        rhs: IrValueId,
    ) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::Binary { dest, op, lhs, rhs });
        dest
    }

    pub fn compare(
        &mut self,
        block: IrBlockId,
        op: IrCompareOp,
        lhs: IrValueId,
        rhs: IrValueId,
    ) -> IrValueId {
        let dest = self.fresh_value();
        self.push(block, IrInst::Compare { dest, op, lhs, rhs });
        dest
    }

    /// Emits a call; a result value is allocated unless `ret` is `Void`.
    pub fn call(
        &mut self,
        block: IrBlockId,
        callee: &str,
        args: Vec<IrValueId>,
        ret: IrType,
    ) -> Option<IrValueId> {
        let result = (ret != IrType::Void).then(|| self.fresh_value());
        self.push(
            block,
            IrInst::Call {
                callee: callee.to_string(),
                args,
                result,
            },
        );
        result
    }

    /// Emits a call whose result is used. Calling a `Void` function this way
    /// is reported by [`FunctionBuilder::finish`].
    pub fn call_value(
        &mut self,
        block: IrBlockId,
        callee: &str,
        args: Vec<IrValueId>,
        ret: IrType,
    ) -> IrValueId {
        if ret == IrType::Void {
            let error = IrError::TypeMismatch {
                function: self.name.clone(),
                detail: format!("result of void call to `{callee}` is used"),
            };
            self.misuse.get_or_insert(error);
        }
        let result = self.fresh_value();
        self.push(
            block,
            IrInst::Call {
                callee: callee.to_string(),
                args,
                result: Some(result),
            },
        );
        result
    }

    pub fn function_ref(&mut self, block: IrBlockId, function: &str) -> IrValueId {
        let dest = self.fresh_value();
        self.push(
            block,
            IrInst::FunctionRef {
                dest,
                function: function.to_string(),
            },
        );
        dest
    }

    pub fn jump(&mut self, block: IrBlockId, target: IrBlockId) {
        self.terminate(block, IrTerminator::Jump { target });
    }

    pub fn branch(
        &mut self,
        block: IrBlockId,
        condition: IrValueId,
        then_block: IrBlockId,
        else_block: IrBlockId,
    ) {
        self.terminate(
            block,
            IrTerminator::Branch {
                condition,
                then_block,
                else_block,
            },
        );
    }

    pub fn ret(&mut self, block: IrBlockId, value: Option<IrValueId>) {
        self.terminate(block, IrTerminator::Return { value });
    }

    pub fn unreachable(&mut self, block: IrBlockId) {
        self.terminate(block, IrTerminator::Unreachable);
    }

    pub fn is_terminated(&self, block: IrBlockId) -> bool {
        self.blocks
            .get(block.0 as usize)
            .is_some_and(|pending| pending.terminator.is_some())
    }

    pub fn finish(self) -> Result<IrFunction, IrError> {
        if let Some(err) = self.misuse {
            return Err(err);
        }
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (index, pending) in self.blocks.into_iter().enumerate() {
            let terminator = pending.terminator.ok_or_else(|| IrError::MissingTerminator {
                function: self.name.clone(),
                block: index as u32,
            })?;
            blocks.push(IrBlock {
                id: IrBlockId(index as u32),
                instructions: pending.instructions,
                terminator,
            });
        }
        Ok(IrFunction {
            name: self.name,
            params: self.params,
            ret: self.ret,
            linkage: self.linkage,
            attributes: self.attributes,
            entry: IrBlockId(0),
            blocks,
        })
    }

    fn fresh_value(&mut self) -> IrValueId {
        let id = IrValueId(self.next_value);
        self.next_value += 1;
        id
    }

    fn open_block(&mut self, block: IrBlockId) -> Option<&mut PendingBlock> {
        let terminated = self
            .blocks
            .get(block.0 as usize)
            .map(|pending| pending.terminator.is_some());
        let error = match terminated {
            None => IrError::UnknownBlock {
                function: self.name.clone(),
                block: block.0,
            },
            Some(true) => IrError::BlockAlreadyTerminated {
                function: self.name.clone(),
                block: block.0,
            },
            Some(false) => return self.blocks.get_mut(block.0 as usize),
        };
        self.misuse.get_or_insert(error);
        None
    }

    fn push(&mut self, block: IrBlockId, inst: IrInst) {
        if let Some(pending) = self.open_block(block) {
            pending.instructions.push(inst);
        }
    }

    fn terminate(&mut self, block: IrBlockId, terminator: IrTerminator) {
        if let Some(pending) = self.open_block(block) {
            pending.terminator = Some(terminator);
        }
    }
}
