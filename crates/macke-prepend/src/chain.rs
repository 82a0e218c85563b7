//! Sequential guarded chain of check block pairs.

use macke_ir::{FunctionBuilder, IrBlockId, IrValueId};

/// The two blocks emitted for one element of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckBlocks {
    pub size: IrBlockId,
    pub content: IrBlockId,
}

/// Conditions computed by one element: `size_ok` in its size block,
/// `content_ok` in its content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckConditions {
    pub size_ok: IrValueId,
    pub content_ok: IrValueId,
}

/// Links one check pair per item into a first-match-wins chain.
///
/// For every item, `emit` fills the item's size and content blocks and
/// returns their conditions. The chain wires
///
/// ```text
/// size_i    --size_ok-->    content_i   else next
/// content_i --content_ok--> on_match    else next
/// ```
///
/// where `next` is the following item's size block, or `on_exhausted` after
/// the last item. All block pairs are created before any is filled, so block
/// ids follow item order. Returns the head of the chain, which is
/// `on_exhausted` itself when `items` is empty.
pub fn emit_check_chain<T, E>(
    builder: &mut FunctionBuilder,
    items: &[T],
    on_match: IrBlockId,
    on_exhausted: IrBlockId,
    mut emit: impl FnMut(&mut FunctionBuilder, &T, CheckBlocks) -> Result<CheckConditions, E>,
) -> Result<IrBlockId, E> {
    let pairs: Vec<CheckBlocks> = items
        .iter()
        .map(|_| CheckBlocks {
            size: builder.create_block(),
            content: builder.create_block(),
        })
        .collect();

    for (index, (item, blocks)) in items.iter().zip(&pairs).enumerate() {
        let next = pairs
            .get(index + 1)
            .map_or(on_exhausted, |following| following.size);
        let conditions = emit(builder, item, *blocks)?;
        builder.branch(blocks.size, conditions.size_ok, blocks.content, next);
        builder.branch(blocks.content, conditions.content_ok, on_match, next);
    }

    Ok(pairs.first().map_or(on_exhausted, |head| head.size))
}

#[cfg(test)]
mod tests {
    use macke_ir::{IrLinkage, IrTerminator, IrType};

    use super::*;

    fn chain_of(len: usize) -> (macke_ir::IrFunction, IrBlockId) {
        let mut builder = FunctionBuilder::new("chain", vec![], IrType::Void, IrLinkage::External);
        let entry = builder.create_block();
        let exhausted = builder.create_block();
        let matched = builder.create_block();
        let items: Vec<usize> = (0..len).collect();
        let head = emit_check_chain(
            &mut builder,
            &items,
            matched,
            exhausted,
            |builder, _, blocks| {
                Ok::<_, ()>(CheckConditions {
                    size_ok: builder.bool_const(blocks.size, true),
                    content_ok: builder.bool_const(blocks.content, false),
                })
            },
        )
        .expect("chain emits");
        builder.jump(entry, head);
        builder.ret(exhausted, None);
        builder.unreachable(matched);
        (builder.finish().expect("chain builds"), head)
    }

    fn branch_targets(function: &macke_ir::IrFunction, block: u32) -> (u32, u32) {
        match function.blocks[block as usize].terminator {
            IrTerminator::Branch {
                then_block,
                else_block,
                ..
            } => (then_block.0, else_block.0),
            ref other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn empty_chain_is_the_exhausted_block() {
        let (function, head) = chain_of(0);
        assert_eq!(head, IrBlockId(1));
        assert_eq!(function.blocks.len(), 3);
    }

    #[test]
    fn pairs_fall_through_in_order() {
        let (function, head) = chain_of(3);
        assert_eq!(head, IrBlockId(3));
        assert_eq!(function.blocks.len(), 9);

        assert_eq!(branch_targets(&function, 3), (4, 5));
        assert_eq!(branch_targets(&function, 4), (2, 5));
        assert_eq!(branch_targets(&function, 5), (6, 7));
        assert_eq!(branch_targets(&function, 6), (2, 7));
        assert_eq!(branch_targets(&function, 7), (8, 1));
        assert_eq!(branch_targets(&function, 8), (2, 1));
    }

    #[test]
    fn emit_error_stops_the_chain() {
        let mut builder = FunctionBuilder::new("chain", vec![], IrType::Void, IrLinkage::External);
        let matched = builder.create_block();
        let exhausted = builder.create_block();
        let mut seen = Vec::new();
        let result = emit_check_chain(
            &mut builder,
            &["a", "b", "c"],
            matched,
            exhausted,
            |builder, item, blocks| {
                seen.push(*item);
                if *item == "b" {
                    return Err("bad item");
                }
                Ok(CheckConditions {
                    size_ok: builder.bool_const(blocks.size, true),
                    content_ok: builder.bool_const(blocks.content, true),
                })
            },
        );
        assert_eq!(result, Err("bad item"));
        assert_eq!(seen, vec!["a", "b"]);
    }
}
