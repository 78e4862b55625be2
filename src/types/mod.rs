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

//! Static type queries used by the differentiation passes.

use std::collections::HashMap;

use crate::ast::{BinOp, Block, Expr, ExprKind, Function, Program, StmtKind, Type, UnaryOp};
use crate::diff::DiffError;

/// Elementary functions with closed-form derivatives.
pub const BUILTINS: &[&str] = &[
    "sin", "cos", "tan", "exp", "log", "sqrt", "pow", "abs", "tanh",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name) || name == "len"
}

/// Intrinsics reserved for generated code.
pub fn is_intrinsic(name: &str) -> bool {
    name.starts_with("__")
}

/// Whether values of `ty` carry derivative information.
pub fn is_differentiable(program: &Program, ty: &Type) -> bool {
    match ty.deref() {
        Type::F64 => true,
        Type::Array(elem) => is_differentiable(program, elem),
        Type::Struct(name) => program
            .struct_def(name)
            .map(|s| {
                !s.non_differentiable && s.fields.iter().any(|f| is_differentiable(program, &f.ty))
            })
            .unwrap_or(false),
        _ => false,
    }
}

/// Zero of a scalar or struct type.
pub fn zero_of(program: &Program, ty: &Type) -> Option<Expr> {
    match ty.deref() {
        Type::F64 => Some(Expr::float(0.0)),
        Type::I64 => Some(Expr::int(0)),
        Type::Bool => Some(Expr::synthetic(ExprKind::Bool(false))),
        Type::Struct(name) => {
            let def = program.struct_def(name)?;
            let mut fields = Vec::with_capacity(def.fields.len());
            for f in &def.fields {
                fields.push((f.name.clone(), zero_of(program, &f.ty)?));
            }
            Some(Expr::synthetic(ExprKind::StructLit {
                name: name.clone(),
                fields,
            }))
        }
        _ => None,
    }
}

/// Variable types of one function body.
///
/// Names map to a single type per function: a declaration that shadows a
/// live variable, or that reuses a name with another type, is rejected so
/// that passes may hoist declarations freely.
#[derive(Debug, Clone)]
pub struct TypeEnv<'p> {
    program: &'p Program,
    function: String,
    vars: HashMap<String, Type>,
}

impl<'p> TypeEnv<'p> {
    pub fn for_function(program: &'p Program, func: &Function) -> Result<Self, DiffError> {
        let mut env = TypeEnv {
            program,
            function: func.qualified_name(),
            vars: HashMap::new(),
        };
        let mut live: Vec<Vec<String>> = vec![Vec::new()];
        for p in &func.params {
            env.vars.insert(p.name.clone(), p.ty.clone());
            live[0].push(p.name.clone());
        }
        if let Some(body) = &func.body {
            env.scan_block(body, &mut live)?;
        }
        Ok(env)
    }

    fn declare_scoped(
        &mut self,
        name: &str,
        ty: &Type,
        span: crate::ast::Span,
        live: &mut [Vec<String>],
    ) -> Result<(), DiffError> {
        if live.iter().any(|scope| scope.iter().any(|n| n == name)) {
            return Err(DiffError::unsupported(
                &self.function,
                format!("declaration of '{}' shadowing a live variable", name),
                span,
            ));
        }
        if let Some(prev) = self.vars.get(name) {
            if prev != ty {
                return Err(DiffError::unsupported(
                    &self.function,
                    format!("redeclaring '{}' as {} (previously {})", name, ty, prev),
                    span,
                ));
            }
        }
        self.vars.insert(name.to_string(), ty.clone());
        if let Some(scope) = live.last_mut() {
            scope.push(name.to_string());
        }
        Ok(())
    }

    fn scan_block(&mut self, block: &Block, live: &mut Vec<Vec<String>>) -> Result<(), DiffError> {
        live.push(Vec::new());
        for stmt in &block.stmts {
            match &stmt.kind {
                StmtKind::Let {
                    name,
                    name_span,
                    ty,
                    ..
                } => self.declare_scoped(name, ty, *name_span, live)?,
                StmtKind::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    self.scan_block(then_block, live)?;
                    if let Some(b) = else_block {
                        self.scan_block(b, live)?;
                    }
                }
                StmtKind::While { body, .. } => self.scan_block(body, live)?,
                StmtKind::For {
                    var, var_span, body, ..
                } => {
                    live.push(Vec::new());
                    self.declare_scoped(var, &Type::I64, *var_span, live)?;
                    self.scan_block(body, live)?;
                    live.pop();
                }
                StmtKind::Block(b) => self.scan_block(b, live)?,
                _ => {}
            }
        }
        live.pop();
        Ok(())
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// Register a variable introduced by a transformation.
    pub fn declare(&mut self, name: impl Into<String>, ty: Type) {
        self.vars.insert(name.into(), ty);
    }

    /// Declared type of a variable, references included.
    pub fn var(&self, name: &str) -> Option<&Type> {
        self.vars.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    /// Value type of an expression; references read through. Unknown
    /// expressions yield `Type::Void`.
    pub fn type_of(&self, e: &Expr) -> Type {
        match &e.kind {
            ExprKind::Float(_) => Type::F64,
            ExprKind::Int(_) => Type::I64,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Tag(name) => Type::Tag(name.clone()),
            ExprKind::Var(name) => self
                .vars
                .get(name)
                .map(|t| t.deref().clone())
                .unwrap_or(Type::Void),
            ExprKind::Index { base, .. } => match self.type_of(base) {
                Type::Array(elem) => *elem,
                _ => Type::Void,
            },
            ExprKind::Field { base, field } => match self.type_of(base) {
                Type::Struct(name) => self
                    .program
                    .struct_def(&name)
                    .and_then(|s| s.fields.iter().find(|f| &f.name == field))
                    .map(|f| f.ty.clone())
                    .unwrap_or(Type::Void),
                _ => Type::Void,
            },
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => self.type_of(operand),
                UnaryOp::Not => Type::Bool,
            },
            ExprKind::Binary { op, left, right } => {
                if op.is_arithmetic() {
                    let (l, r) = (self.type_of(left), self.type_of(right));
                    if l == Type::F64 || r == Type::F64 {
                        Type::F64
                    } else {
                        l
                    }
                } else {
                    Type::Bool
                }
            }
            ExprKind::Cond {
                then_expr,
                else_expr,
                ..
            } => {
                let (t, f) = (self.type_of(then_expr), self.type_of(else_expr));
                if t == Type::F64 || f == Type::F64 {
                    Type::F64
                } else {
                    t
                }
            }
            ExprKind::Call { callee, args } => self.call_type(callee, args),
            ExprKind::StructLit { name, .. } => Type::Struct(name.clone()),
            ExprKind::ArrayFill { value, .. } => Type::array_of(self.type_of(value)),
            ExprKind::ArrayLit(items) => {
                let elem = items
                    .iter()
                    .map(|i| self.type_of(i))
                    .find(|t| *t == Type::F64)
                    .or_else(|| items.first().map(|i| self.type_of(i)))
                    .unwrap_or(Type::F64);
                Type::array_of(elem)
            }
        }
    }

    fn call_type(&self, callee: &str, args: &[Expr]) -> Type {
        if callee == "len" {
            return Type::I64;
        }
        if BUILTINS.contains(&callee) {
            return Type::F64;
        }
        match callee {
            "__push" => return args.get(1).map(|a| self.type_of(a)).unwrap_or(Type::Void),
            "__pop" | "__push_mem" | "__pop_mem" | "__tape_store" | "__tape_ignore"
            | "__tape_restore" => return Type::Void,
            _ => {}
        }
        self.program
            .functions_named(callee)
            .find(|f| f.params.len() == args.len())
            .map(|f| f.ret.clone())
            .unwrap_or(Type::Void)
    }

    pub fn is_float(&self, e: &Expr) -> bool {
        self.type_of(e) == Type::F64
    }

    /// Whether the expression's value carries derivatives.
    pub fn is_active(&self, e: &Expr) -> bool {
        is_differentiable(self.program, &self.type_of(e))
    }

    pub fn struct_fields(&self, ty: &Type) -> Vec<(String, Type)> {
        ty.struct_name()
            .and_then(|n| self.program.struct_def(n))
            .map(|s| s.fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect())
            .unwrap_or_default()
    }
}

/// Operators whose local partials read operand values.
pub fn is_nonlinear(op: BinOp) -> bool {
    matches!(op, BinOp::Mul | BinOp::Div)
}
