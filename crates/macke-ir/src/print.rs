//! Textual rendering of the IR, loosely modeled on LLVM assembly.

use std::fmt;

use crate::{
    IrBlock, IrFunction, IrInst, IrLinkage, IrLiteral, IrModule, IrTerminator, IrValueId,
};

impl fmt::Display for IrValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for crate::IrBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for IrLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrLiteral::Int { ty, value } => write!(f, "{ty} {value}"),
            IrLiteral::Float { value } => write!(f, "f64 {value:?}"),
            IrLiteral::Null => f.write_str("ptr null"),
        }
    }
}

impl fmt::Display for IrInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrInst::Const { dest, literal } => write!(f, "{dest} = const {literal}"),
            IrInst::Alloca { dest, ty } => write!(f, "{dest} = alloca {ty}"),
            IrInst::Store { value, ptr } => write!(f, "store {value}, {ptr}"),
            IrInst::Load { dest, ty, ptr } => write!(f, "{dest} = load {ty}, {ptr}"),
            IrInst::PtrOffset { dest, base, offset } => {
                write!(f, "{dest} = offset {base}, {offset}")
            }
            IrInst::Cast {
                dest,
                op,
                value,
                ty,
            } => write!(f, "{dest} = {} {value} to {ty}", op.as_str()),
            IrInst::Binary { dest, op, lhs, rhs } => {
                write!(f, "{dest} = {} {lhs}, {rhs}", op.as_str())
            }
            IrInst::Compare { dest, op, lhs, rhs } => {
                write!(f, "{dest} = {} {lhs}, {rhs}", op.as_str())
            }
            IrInst::Call {
                callee,
                args,
                result,
            } => {
                if let Some(result) = result {
                    write!(f, "{result} = ")?;
                }
                write!(f, "call @{callee}(")?;
                write_values(f, args)?;
                f.write_str(")")
            }
            IrInst::FunctionRef { dest, function } => write!(f, "{dest} = funcref @{function}"),
        }
    }
}

impl fmt::Display for IrTerminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrTerminator::Jump { target } => write!(f, "jump {target}"),
            IrTerminator::Branch {
                condition,
                then_block,
                else_block,
            } => write!(f, "br {condition}, {then_block}, {else_block}"),
            IrTerminator::Return { value: Some(value) } => write!(f, "ret {value}"),
            IrTerminator::Return { value: None } => f.write_str("ret void"),
            IrTerminator::Unreachable => f.write_str("unreachable"),
        }
    }
}

impl fmt::Display for IrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        for inst in &self.instructions {
            writeln!(f, "  {inst}")?;
        }
        writeln!(f, "  {}", self.terminator)
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_declaration() {
            write!(f, "declare {} @{}(", self.ret, self.name)?;
            for (index, param) in self.params.iter().enumerate() {
                if index > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", param.ty)?;
            }
            return writeln!(f, ")");
        }

        let linkage = match self.linkage {
            IrLinkage::External => "external",
            IrLinkage::Internal => "internal",
        };
        write!(f, "define {linkage} {} @{}(", self.ret, self.name)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            if let Some(name) = &param.name {
                write!(f, "{name}: ")?;
            }
            write!(f, "{} %{index}", param.ty)?;
        }
        f.write_str(")")?;
        for attribute in &self.attributes {
            write!(f, " {}", attribute.as_str())?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            write!(f, "{block}")?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for IrModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for function in &self.functions {
            writeln!(f)?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[IrValueId]) -> fmt::Result {
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use crate::{
        FunctionBuilder, IrAttribute, IrCompareOp, IrFunction, IrLinkage, IrModule, IrParam,
        IrType,
    };

    #[test]
    fn module_text_snapshot() {
        let mut builder = FunctionBuilder::new(
            "is_zero",
            vec![IrParam::named("x", IrType::I32)],
            IrType::I32,
            IrLinkage::External,
        );
        builder.add_attribute(IrAttribute::NoInline);
        let entry = builder.create_block();
        let yes = builder.create_block();
        let no = builder.create_block();
        let zero = builder.iconst(entry, IrType::I32, 0);
        let cond = builder.compare(entry, IrCompareOp::Eq, builder.param(0), zero);
        builder.branch(entry, cond, yes, no);
        let one = builder.iconst(yes, IrType::I32, 1);
        builder.ret(yes, Some(one));
        builder.ret(no, Some(zero));

        let mut module = IrModule::new("demo");
        module
            .add_function(IrFunction::declaration("exit", vec![IrType::I32], IrType::Void))
            .expect("declare exit");
        module
            .add_function(builder.finish().expect("is_zero builds"))
            .expect("add is_zero");

        assert_snapshot!(module.to_string(), @r"
        ; module demo

        declare void @exit(i32)

        define external i32 @is_zero(x: i32 %0) noinline {
        bb0:
          %1 = const i32 0
          %2 = icmp eq %0, %1
          br %2, bb1, bb2
        bb1:
          %3 = const i32 1
          ret %3
        bb2:
          ret %1
        }
        ");
    }
}
