// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Source printer. Output re-parses to an equivalent tree.

use std::fmt::{self, Write};

use super::{BinOp, Block, Expr, ExprKind, Function, Program, Stmt, StmtKind, StructDef, UnaryOp};

const INDENT: &str = "    ";

fn precedence(e: &Expr) -> u8 {
    match &e.kind {
        ExprKind::Cond { .. } => 1,
        ExprKind::Binary { op, .. } => binop_precedence(*op),
        ExprKind::Unary { .. } => 7,
        ExprKind::Float(v) if *v < 0.0 => 7,
        ExprKind::Int(v) if *v < 0 => 7,
        _ => 8,
    }
}

fn binop_precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 2,
        BinOp::And => 3,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => 4,
        BinOp::Add | BinOp::Sub => 5,
        BinOp::Mul | BinOp::Div => 6,
    }
}

fn write_operand(out: &mut String, e: &Expr, min: u8) -> fmt::Result {
    if precedence(e) < min {
        out.push('(');
        write_expr(out, e)?;
        out.push(')');
        Ok(())
    } else {
        write_expr(out, e)
    }
}

fn write_float(out: &mut String, v: f64) -> fmt::Result {
    let text = format!("{:?}", v);
    if text.contains('.') || text.contains('e') || text.contains("inf") || text.contains("NaN") {
        out.push_str(&text);
    } else {
        write!(out, "{}.0", text)?;
    }
    Ok(())
}

fn write_expr(out: &mut String, e: &Expr) -> fmt::Result {
    match &e.kind {
        ExprKind::Float(v) => write_float(out, *v)?,
        ExprKind::Int(v) => write!(out, "{}", v)?,
        ExprKind::Bool(v) => write!(out, "{}", v)?,
        ExprKind::Var(name) => out.push_str(name),
        ExprKind::Tag(name) => write!(out, "tag<{}>", name)?,
        ExprKind::Index { base, index } => {
            write_operand(out, base, 8)?;
            out.push('[');
            write_expr(out, index)?;
            out.push(']');
        }
        ExprKind::Field { base, field } => {
            write_operand(out, base, 8)?;
            write!(out, ".{}", field)?;
        }
        ExprKind::Unary { op, operand } => {
            out.push(match op {
                UnaryOp::Neg => '-',
                UnaryOp::Not => '!',
            });
            write_operand(out, operand, 8)?;
        }
        ExprKind::Binary { op, left, right } => {
            let p = binop_precedence(*op);
            write_operand(out, left, p)?;
            write!(out, " {} ", op.symbol())?;
            write_operand(out, right, p + 1)?;
        }
        ExprKind::Call { callee, args } => {
            out.push_str(callee);
            out.push('(');
            write_list(out, args)?;
            out.push(')');
        }
        ExprKind::Cond {
            cond,
            then_expr,
            else_expr,
        } => {
            write_operand(out, cond, 2)?;
            out.push_str(" ? ");
            write_operand(out, then_expr, 2)?;
            out.push_str(" : ");
            write_expr(out, else_expr)?;
        }
        ExprKind::StructLit { name, fields } => {
            write!(out, "{} {{ ", name)?;
            for (i, (field, value)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write!(out, "{}: ", field)?;
                write_expr(out, value)?;
            }
            out.push_str(" }");
        }
        ExprKind::ArrayFill { value, len } => {
            out.push('[');
            write_expr(out, value)?;
            out.push_str("; ");
            write_expr(out, len)?;
            out.push(']');
        }
        ExprKind::ArrayLit(items) => {
            out.push('[');
            write_list(out, items)?;
            out.push(']');
        }
    }
    Ok(())
}

fn write_list(out: &mut String, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, item)?;
    }
    Ok(())
}

fn write_block(out: &mut String, block: &Block, depth: usize) -> fmt::Result {
    out.push_str("{\n");
    for stmt in &block.stmts {
        write_stmt(out, stmt, depth + 1)?;
    }
    out.push_str(&INDENT.repeat(depth));
    out.push('}');
    Ok(())
}

fn write_stmt(out: &mut String, stmt: &Stmt, depth: usize) -> fmt::Result {
    out.push_str(&INDENT.repeat(depth));
    match &stmt.kind {
        StmtKind::Let {
            name, ty, value, ..
        } => {
            write!(out, "let {}: {}", name, ty)?;
            if let Some(value) = value {
                out.push_str(" = ");
                write_expr(out, value)?;
            }
            out.push(';');
        }
        StmtKind::Assign { target, op, value } => {
            write_expr(out, target)?;
            write!(out, " {} ", op.symbol())?;
            write_expr(out, value)?;
            out.push(';');
        }
        StmtKind::Expr(e) => {
            write_expr(out, e)?;
            out.push(';');
        }
        StmtKind::If {
            cond,
            then_block,
            else_block,
        } => {
            out.push_str("if ");
            write_expr(out, cond)?;
            out.push(' ');
            write_block(out, then_block, depth)?;
            if let Some(else_block) = else_block {
                out.push_str(" else ");
                write_block(out, else_block, depth)?;
            }
        }
        StmtKind::While { cond, body } => {
            out.push_str("while ");
            write_expr(out, cond)?;
            out.push(' ');
            write_block(out, body, depth)?;
        }
        StmtKind::For {
            var,
            start,
            end,
            body,
            ..
        } => {
            write!(out, "for {} in ", var)?;
            write_operand(out, start, 5)?;
            out.push_str("..");
            write_operand(out, end, 5)?;
            out.push(' ');
            write_block(out, body, depth)?;
        }
        StmtKind::Return(value) => {
            out.push_str("return");
            if let Some(value) = value {
                out.push(' ');
                write_expr(out, value)?;
            }
            out.push(';');
        }
        StmtKind::Break => out.push_str("break;"),
        StmtKind::Continue => out.push_str("continue;"),
        StmtKind::Block(block) => write_block(out, block, depth)?,
    }
    out.push('\n');
    Ok(())
}

fn write_function(out: &mut String, func: &Function, depth: usize) -> fmt::Result {
    out.push_str(&INDENT.repeat(depth));
    if func.non_differentiable {
        out.push_str("#[non_differentiable]\n");
        out.push_str(&INDENT.repeat(depth));
    }
    write!(out, "fn {}(", func.name)?;
    for (i, p) in func.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write!(out, "{}: {}", p.name, p.ty)?;
    }
    out.push(')');
    if func.ret != super::Type::Void {
        write!(out, " -> {}", func.ret)?;
    }
    match &func.body {
        Some(body) => {
            out.push(' ');
            write_block(out, body, depth)?;
            out.push('\n');
        }
        None => out.push_str(";\n"),
    }
    Ok(())
}

/// Print a function, wrapped in `impl`/`mod` when it has an owner or namespace.
pub fn function_to_string(func: &Function) -> String {
    let mut out = String::new();
    let mut depth = 0;
    if let Some(ns) = &func.namespace {
        let _ = writeln!(out, "mod {} {{", ns);
        depth += 1;
    }
    if let Some(owner) = &func.owner {
        let _ = writeln!(out, "{}impl {} {{", INDENT.repeat(depth), owner);
        depth += 1;
    }
    let _ = write_function(&mut out, func, depth);
    while depth > 0 {
        depth -= 1;
        let _ = writeln!(out, "{}}}", INDENT.repeat(depth));
    }
    out
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_expr(&mut out, self)?;
        f.write_str(&out)
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_stmt(&mut out, self, 0)?;
        f.write_str(out.trim_end())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&function_to_string(self))
    }
}

impl fmt::Display for StructDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.non_differentiable {
            writeln!(f, "#[non_differentiable]")?;
        }
        write!(f, "struct {} {{ ", self.name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field.name, field.ty)?;
        }
        writeln!(f, " }}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.structs {
            write!(f, "{}", s)?;
        }
        for func in &self.functions {
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    #[test]
    fn parenthesizes_by_precedence() {
        let e = Expr::binary(
            BinOp::Mul,
            Expr::binary(BinOp::Add, Expr::var("a"), Expr::var("b")),
            Expr::var("c"),
        );
        assert_eq!(e.to_string(), "(a + b) * c");
        let e = Expr::binary(
            BinOp::Sub,
            Expr::var("a"),
            Expr::binary(BinOp::Sub, Expr::var("b"), Expr::var("c")),
        );
        assert_eq!(e.to_string(), "a - (b - c)");
    }

    #[test]
    fn floats_keep_a_decimal_point() {
        assert_eq!(Expr::float(2.0).to_string(), "2.0");
        assert_eq!(Expr::float(1.1102230246251565e-16).to_string(), "1.1102230246251565e-16");
    }
}
