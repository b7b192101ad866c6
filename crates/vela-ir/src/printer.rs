//! Textual IR dump
//!
//! Values are numbered lazily per module in the order they are first
//! printed, so two dumps of the same graph are identical.

use crate::module::Module;
use crate::value::{ValueId, ValueKind};
use std::collections::HashMap;
use std::fmt::{self, Write};

struct Printer<'a> {
    module: &'a Module,
    names: HashMap<ValueId, String>,
    next_value: usize,
    next_block: usize,
}

impl<'a> Printer<'a> {
    fn new(module: &'a Module) -> Self {
        Self {
            module,
            names: HashMap::new(),
            next_value: 0,
            next_block: 0,
        }
    }

    fn name(&mut self, value: ValueId) -> String {
        if let Some(name) = self.names.get(&value) {
            return name.clone();
        }
        let module = self.module;
        if !module.contains(value) {
            return format!("<dangling {:?}>", value);
        }
        let data = &module[value];
        let name = match &data.kind {
            ValueKind::Function(_) | ValueKind::GlobalVariable | ValueKind::GlobalAlloca => {
                format!("@{}", data.name)
            }
            ValueKind::Argument => format!("%{}", data.name),
            ValueKind::Block(_) => {
                self.next_block += 1;
                format!("bb{}", self.next_block - 1)
            }
            ValueKind::Marker => {
                self.next_block += 1;
                format!("^{}.{}", data.name, self.next_block - 1)
            }
            _ => {
                self.next_value += 1;
                if data.name.is_empty() {
                    format!("%{}", self.next_value - 1)
                } else {
                    format!("%{}.{}", data.name, self.next_value - 1)
                }
            }
        };
        self.names.insert(value, name.clone());
        name
    }

    fn head(&self, value: ValueId) -> String {
        let data = &self.module[value];
        match &data.kind {
            ValueKind::ConstInt(v) => format!("const {}", v),
            ValueKind::ConstFloat(v) => format!("const {:?}", v),
            ValueKind::ConstBool(v) => format!("const {}", v),
            ValueKind::ConstChar(v) => format!("const {:?}", v),
            ValueKind::ConstNull => "const null".to_string(),
            ValueKind::AccessField { field } => format!("field .{}", field),
            ValueKind::StructElementPtr { field } => format!("gep.struct .{}", field),
            ValueKind::Binary(op) => op.to_string(),
            ValueKind::Compare(op) => format!("cmp {}", op),
            ValueKind::DeviceIndex(index) => format!("device_index {}", index),
            kind => kind.mnemonic().to_string(),
        }
    }

    fn write_value(&mut self, out: &mut String, value: ValueId, indent: usize) -> fmt::Result {
        let pad = " ".repeat(indent);
        let module = self.module;
        let data = &module[value];

        if let ValueKind::Marker = data.kind {
            let name = self.name(value);
            return writeln!(out, "{}{}:", " ".repeat(indent.saturating_sub(2)), name);
        }
        if let ValueKind::Block(_) = data.kind {
            let name = self.name(value);
            writeln!(out, "{}{} {{", pad, name)?;
            for &inner in module.block_values(value) {
                self.write_value(out, inner, indent + 2)?;
            }
            return writeln!(out, "{}}}", pad);
        }

        write!(out, "{}", pad)?;
        if !module.types.is_void(data.ty) {
            let name = self.name(value);
            write!(out, "{} = ", name)?;
        }
        write!(out, "{}", self.head(value))?;

        let mut bodies = Vec::new();
        for (i, operand) in data.operand_slots().iter().enumerate() {
            write!(out, "{}", if i == 0 { " " } else { ", " })?;
            match operand {
                Some(operand) => {
                    let nested = module
                        .block_data(*operand)
                        .map(|block| block.function.is_none())
                        .unwrap_or(false);
                    if nested && module.parent(*operand).is_none() {
                        bodies.push(*operand);
                    }
                    let name = self.name(*operand);
                    write!(out, "{}", name)?;
                }
                None => write!(out, "<empty>")?,
            }
        }
        if !module.types.is_void(data.ty) && !data.kind.is_constant() {
            write!(out, " : {}", module.types.display(data.ty))?;
        }
        for (key, values) in data.annotations.iter() {
            if values.is_empty() {
                write!(out, " @{}", key)?;
            } else {
                write!(out, " @{}({})", key, values.join(", "))?;
            }
        }
        writeln!(out)?;

        for body in bodies {
            self.write_value(out, body, indent + 2)?;
        }
        Ok(())
    }

    fn write_function(&mut self, out: &mut String, function: ValueId) -> fmt::Result {
        let module = self.module;
        let ret = module
            .return_type(function)
            .map(|ty| module.types.display(ty).to_string())
            .unwrap_or_else(|_| "?".to_string());
        let keyword = if module.function_blocks(function).is_empty() {
            "declare"
        } else {
            "define"
        };
        let name = self.name(function);
        write!(out, "{} {} {}(", keyword, ret, name)?;
        for (i, &param) in module.params(function).iter().enumerate() {
            if i > 0 {
                write!(out, ", ")?;
            }
            let param_name = self.name(param);
            write!(out, "{} {}", module.types.display(module.ty(param)), param_name)?;
        }
        write!(out, ")")?;
        for (key, values) in module.annotations(function).iter() {
            if values.is_empty() {
                write!(out, " @{}", key)?;
            } else {
                write!(out, " @{}({})", key, values.join(", "))?;
            }
        }
        let blocks = module.function_blocks(function);
        if blocks.is_empty() {
            return writeln!(out);
        }
        writeln!(out, " {{")?;
        for &block in blocks {
            let name = self.name(block);
            writeln!(out, "{}:", name)?;
            for &value in module.block_values(block) {
                self.write_value(out, value, 2)?;
            }
        }
        writeln!(out, "}}")
    }
}

/// Renders one function
pub fn print_function(module: &Module, function: ValueId) -> String {
    let mut out = String::new();
    let _ = Printer::new(module).write_function(&mut out, function);
    out
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new(self);
        let mut out = String::new();

        writeln!(out, "; module {}", self.name)?;
        for &global in &self.globals {
            let name = printer.name(global);
            writeln!(
                out,
                "{} = {} {}",
                name,
                self.kind(global).mnemonic(),
                self.types.display(self.ty(global))
            )?;
        }
        for &function in &self.functions {
            writeln!(out)?;
            printer.write_function(&mut out, function)?;
        }
        for (target, sub) in &self.targets {
            writeln!(out)?;
            writeln!(out, "; target {}", target)?;
            for &function in &sub.functions {
                writeln!(out)?;
                printer.write_function(&mut out, function)?;
            }
        }
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::value::BinaryOp;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_print_simple_function() {
        let mut module = Module::new("demo");
        let i64_ty = module.types.i64();
        let f = module.create_function("add_one", &[("x", i64_ty)], i64_ty);
        let entry = module.append_function_block(f).unwrap();
        let x = module.params(f)[0];

        let mut builder = IrBuilder::at_end(&mut module, entry);
        let one = builder.const_int(1).unwrap();
        let sum = builder.binary(BinaryOp::Add, x, one).unwrap();
        builder.ret(sum).unwrap();

        let expected = "\
; module demo

define i64 @add_one(i64 %x) {
bb0:
  %0 = const 1
  %1 = add %x, %0 : i64
  ret %1
}
";
        assert_eq!(module.to_string(), expected);
    }

    #[test]
    fn test_print_nested_if() {
        let mut module = Module::new("demo");
        let void = module.types.void();
        let f = module.create_function("main", &[], void);
        let entry = module.append_function_block(f).unwrap();

        let mut builder = IrBuilder::at_end(&mut module, entry);
        let cond = builder.const_bool(true).unwrap();
        let (_, then_block, _) = builder.if_else(cond).unwrap();
        builder.ret_void().unwrap();
        IrBuilder::at_end(&mut module, then_block).const_int(7).unwrap();

        let text = print_function(&module, f);
        assert!(text.contains("if %0, bb1, bb2"));
        assert!(text.contains("    bb1 {\n      %1 = const 7\n    }"));
    }
}
