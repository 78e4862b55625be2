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

//! Reverse-mode transformation.
//!
//! The body is first normalised: declarations are hoisted, compound and
//! struct assignments are split into scalar assignments and calls are
//! pulled out of expressions. The to-be-recorded analysis then runs on the
//! normalised body, and every statement is turned into a forward-sweep part
//! (the original statement plus taping) and a reverse-sweep part (popping
//! and adjoint accumulation). A block's reverse parts run in reverse order.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::analysis::{analyze, may_write_param, tbr::distinct_def_spans, TbrOptions, TbrResult};
use crate::ast::{
    AssignOp, BinOp, Block, Expr, ExprKind, Function, Param, Program, Span, Stmt, StmtKind, Type,
    UnaryOp,
};
use crate::types::{is_builtin, is_differentiable, is_intrinsic, zero_of, TypeEnv};

use super::builder::{DerivativeBuilder, Target};
use super::error_estimate::ErrorModel;
use super::exits::lower_exits;
use super::registry::{
    find_constructor_pullback, has_constructor_pullback, is_non_differentiable, resolve_call,
};
use super::request::{adjoint_type, differentiable_params, DiffMode, IndepVar};
use super::{rules, DiffError, NameGen};

/// Distinct parameters of `indeps`, in request order.
fn requested(indeps: &[IndepVar]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::new();
    for v in indeps {
        if !out.contains(&v.param) {
            out.push(v.param);
        }
    }
    out
}

/// Differentiable parameters a callee can write through.
fn writable_params(program: &Program, func: &Function) -> Vec<usize> {
    differentiable_params(program, func)
        .into_iter()
        .filter(|&i| func.params[i].ty.is_ref() || func.params[i].ty.is_array())
        .collect()
}

/// Declaration of the reverse-mode derivative `name` of `func`.
pub fn signature(
    program: &Program,
    func: &Function,
    mode: DiffMode,
    indeps: &[IndepVar],
    name: &str,
) -> Result<Function, DiffError> {
    let fname = func.qualified_name();
    let env = TypeEnv::for_function(program, func)?;
    let mut names = NameGen::new(env.names().cloned());
    let mut params = func.params.clone();
    let ret = match mode {
        DiffMode::Reverse | DiffMode::ErrorEstimation => {
            if !matches!(func.ret, Type::F64 | Type::Void) {
                return Err(DiffError::invalid(
                    &fname,
                    format!("{} mode needs an f64 or void return, found {}", mode, func.ret),
                ));
            }
            for i in requested(indeps) {
                let p = &func.params[i];
                params.push(Param::new(names.shadow(&p.name), adjoint_type(&p.ty)));
            }
            if mode == DiffMode::ErrorEstimation {
                params.push(Param::new(names.fresh("_final_error"), Type::ref_to(Type::F64)));
            }
            Type::Void
        }
        DiffMode::Pullback => {
            if is_differentiable(program, &func.ret) {
                params.push(Param::new(names.fresh("_d_y"), func.ret.clone()));
            }
            for i in differentiable_params(program, func) {
                let p = &func.params[i];
                params.push(Param::new(names.shadow(&p.name), adjoint_type(&p.ty)));
            }
            Type::Void
        }
        DiffMode::ReverseForwardPass => {
            for i in writable_params(program, func) {
                let p = &func.params[i];
                params.push(Param::new(names.shadow(&p.name), adjoint_type(&p.ty)));
            }
            func.ret.clone()
        }
        other => {
            return Err(DiffError::invalid(&fname, format!("{} is not a reverse mode", other)))
        }
    };
    Ok(Function {
        name: name.to_string(),
        owner: func.owner.clone(),
        namespace: None,
        params,
        ret,
        body: None,
        non_differentiable: false,
        span: func.span,
    })
}

/// Generate the body of a reverse-mode derivative.
pub fn derive(builder: &mut DerivativeBuilder, target: &Target<'_>) -> Result<Block, DiffError> {
    let func = target.func;
    let fname = func.qualified_name();
    if func.body.is_none() {
        return Err(DiffError::NoDefinition {
            function: fname,
            span: Some(func.span),
        });
    }
    let config = builder.config().clone();
    let original_env = TypeEnv::for_function(target.program, func)?;
    let mut names = NameGen::new(original_env.names().cloned());
    for p in &target.signature.params {
        names.reserve(&p.name);
    }
    let lowered = lower_exits(func, &mut names);
    let lowered_env = TypeEnv::for_function(target.program, &lowered)?;

    let mut normalized = Normalizer {
        program: target.program,
        env: &lowered_env,
        names: &mut names,
        fname: &fname,
        hoisted: Vec::new(),
        declared: HashSet::new(),
    }
    .run(&lowered)?;
    distinct_def_spans(&mut normalized);
    let env = TypeEnv::for_function(target.program, &normalized)?;

    let tbr = if config.enable_tbr {
        let options = TbrOptions {
            max_passes: config.max_tbr_passes,
            mark_assigned_useful: target.mode == DiffMode::ErrorEstimation,
        };
        let result = analyze(&normalized, &env, options)?;
        builder.note(&fname, format!("{} to-be-recorded location(s)", result.len()));
        result
    } else {
        builder.note(&fname, "recording every definition");
        TbrResult::record_all()
    };

    let tape = names.fresh("_tape");
    let mut rv = Reverse {
        builder,
        program: target.program,
        env,
        names,
        fname,
        mode: target.mode,
        tbr,
        tape,
        adjoints: HashMap::new(),
        temps: Vec::new(),
        seed: None,
        error: None,
        smart_tape: config.smart_tape && target.mode != DiffMode::ReverseForwardPass,
        sweep_back: target.mode != DiffMode::ReverseForwardPass,
        stored: HashSet::new(),
        caller_memory: HashSet::new(),
    };
    rv.build(target, &normalized)
}

/// Rewrites a body into the form the sweeps are generated from.
struct Normalizer<'n, 'p> {
    program: &'p Program,
    env: &'n TypeEnv<'p>,
    names: &'n mut NameGen,
    fname: &'n str,
    hoisted: Vec<Stmt>,
    declared: HashSet<String>,
}

fn user_call(e: &Expr) -> Option<(&str, &[Expr])> {
    match &e.kind {
        ExprKind::Call { callee, args } if !is_builtin(callee) && !is_intrinsic(callee) => {
            Some((callee.as_str(), args.as_slice()))
        }
        _ => None,
    }
}

fn has_user_call(e: &Expr) -> bool {
    let mut found = false;
    e.walk(&mut |sub| found |= user_call(sub).is_some());
    found
}

impl Normalizer<'_, '_> {
    fn unsupported(&self, what: impl Into<String>, span: Span) -> DiffError {
        DiffError::unsupported(self.fname, what, span)
    }

    fn run(mut self, func: &Function) -> Result<Function, DiffError> {
        let body = func.body.as_ref().ok_or_else(|| DiffError::NoDefinition {
            function: self.fname.to_string(),
            span: Some(func.span),
        })?;
        let stmts = self.block(&body.stmts, 0)?;
        let mut all = std::mem::take(&mut self.hoisted);
        all.extend(stmts);
        Ok(Function {
            body: Some(Block {
                stmts: all,
                span: body.span,
            }),
            ..func.clone()
        })
    }

    fn block(&mut self, stmts: &[Stmt], depth: usize) -> Result<Vec<Stmt>, DiffError> {
        let mut out = Vec::new();
        for (k, s) in stmts.iter().enumerate() {
            let last = depth == 0 && k + 1 == stmts.len();
            self.stmt(s, depth, last, &mut out)?;
        }
        Ok(out)
    }

    fn sub_block(&mut self, block: &Block, depth: usize) -> Result<Block, DiffError> {
        Ok(Block {
            stmts: self.block(&block.stmts, depth)?,
            span: block.span,
        })
    }

    /// Zero-initialised declaration at the top of the body.
    fn hoist_decl(&mut self, name: &str, ty: &Type, span: Span) -> Result<(), DiffError> {
        if !self.declared.insert(name.to_string()) {
            return Ok(());
        }
        let zero = zero_of(self.program, ty).ok_or_else(|| {
            self.unsupported(format!("declaration of '{}' with type {}", name, ty), span)
        })?;
        self.hoisted.push(Stmt::new(
            StmtKind::Let {
                name: name.to_string(),
                name_span: span,
                ty: ty.clone(),
                value: Some(zero),
            },
            span,
        ));
        Ok(())
    }

    fn stmt(
        &mut self,
        s: &Stmt,
        depth: usize,
        last: bool,
        out: &mut Vec<Stmt>,
    ) -> Result<(), DiffError> {
        match &s.kind {
            StmtKind::Let {
                name,
                name_span,
                ty,
                value,
            } => {
                if ty.is_array() {
                    if depth > 0 {
                        return Err(self.unsupported(
                            "array declaration inside a nested block",
                            *name_span,
                        ));
                    }
                    let value = match value {
                        Some(v) => Some(self.hoist_calls(v, out)?),
                        None => None,
                    };
                    self.declared.insert(name.clone());
                    out.push(Stmt::new(
                        StmtKind::Let {
                            name: name.clone(),
                            name_span: *name_span,
                            ty: ty.clone(),
                            value,
                        },
                        s.span,
                    ));
                    return Ok(());
                }
                self.hoist_decl(name, ty, *name_span)?;
                let target = Expr::new(ExprKind::Var(name.clone()), *name_span);
                match value {
                    Some(v) => self.assign(target, v.clone(), s.span, out)?,
                    None if depth > 0 => {
                        let zero = zero_of(self.program, ty).unwrap_or_else(|| Expr::float(0.0));
                        out.push(Stmt::new(
                            StmtKind::Assign {
                                target,
                                op: AssignOp::Set,
                                value: zero,
                            },
                            s.span,
                        ));
                    }
                    None => {}
                }
            }
            StmtKind::Assign { target, op, value } => {
                let value = match op.binop() {
                    Some(bin) => Expr::new(
                        ExprKind::Binary {
                            op: bin,
                            left: Box::new(target.clone()),
                            right: Box::new(value.clone()),
                        },
                        value.span,
                    ),
                    None => value.clone(),
                };
                let target = self.hoist_calls(target, out)?;
                self.assign(target, value, s.span, out)?;
            }
            StmtKind::Expr(e) => {
                let e = if user_call(e).is_some() {
                    self.hoist_args(e, out)?
                } else {
                    self.hoist_calls(e, out)?
                };
                out.push(Stmt::new(StmtKind::Expr(e), s.span));
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.hoist_calls(cond, out)?;
                let then_block = self.sub_block(then_block, depth + 1)?;
                let else_block = match else_block {
                    Some(b) => Some(self.sub_block(b, depth + 1)?),
                    None => None,
                };
                out.push(Stmt::new(
                    StmtKind::If {
                        cond,
                        then_block,
                        else_block,
                    },
                    s.span,
                ));
            }
            StmtKind::While { cond, body } => {
                if has_user_call(cond) {
                    return Err(self.unsupported("function call in a loop condition", cond.span));
                }
                let body = self.sub_block(body, depth + 1)?;
                out.push(Stmt::new(
                    StmtKind::While {
                        cond: cond.clone(),
                        body,
                    },
                    s.span,
                ));
            }
            StmtKind::For {
                var,
                var_span,
                start,
                end,
                body,
            } => {
                let start = self.hoist_calls(start, out)?;
                let end = self.hoist_calls(end, out)?;
                let body = self.sub_block(body, depth + 1)?;
                out.push(Stmt::new(
                    StmtKind::For {
                        var: var.clone(),
                        var_span: *var_span,
                        start,
                        end,
                        body,
                    },
                    s.span,
                ));
            }
            StmtKind::Return(value) => {
                if !last {
                    return Err(self.unsupported("early return", s.span));
                }
                let value = match value {
                    Some(v) => Some(self.hoist_calls(v, out)?),
                    None => None,
                };
                out.push(Stmt::new(StmtKind::Return(value), s.span));
            }
            StmtKind::Break => return Err(self.unsupported("break", s.span)),
            StmtKind::Continue => return Err(self.unsupported("continue", s.span)),
            StmtKind::Block(b) => {
                let b = self.sub_block(b, depth + 1)?;
                out.push(Stmt::new(StmtKind::Block(b), s.span));
            }
        }
        Ok(())
    }

    fn assign(
        &mut self,
        target: Expr,
        value: Expr,
        span: Span,
        out: &mut Vec<Stmt>,
    ) -> Result<(), DiffError> {
        let ty = self.env.type_of(&target);
        if ty.is_array() {
            return Err(self.unsupported("assignment of a whole array", target.span));
        }
        if user_call(&value).is_some() {
            let value = self.hoist_args(&value, out)?;
            out.push(Stmt::new(
                StmtKind::Assign {
                    target,
                    op: AssignOp::Set,
                    value,
                },
                span,
            ));
            return Ok(());
        }
        let value = self.hoist_calls(&value, out)?;
        let custom = match &value.kind {
            ExprKind::StructLit { name, .. } => has_constructor_pullback(self.program, name),
            _ => false,
        };
        if ty.struct_name().is_some() && !custom {
            return self.expand(&ty, target, value, span, out);
        }
        out.push(Stmt::new(
            StmtKind::Assign {
                target,
                op: AssignOp::Set,
                value,
            },
            span,
        ));
        Ok(())
    }

    /// Split a struct assignment into one assignment per field.
    fn expand(
        &mut self,
        ty: &Type,
        target: Expr,
        value: Expr,
        span: Span,
        out: &mut Vec<Stmt>,
    ) -> Result<(), DiffError> {
        let def = ty
            .struct_name()
            .and_then(|n| self.program.struct_def(n))
            .cloned()
            .ok_or_else(|| self.unsupported(format!("unknown type {}", ty), target.span))?;
        if let (ExprKind::StructLit { fields, .. }, Some(root)) = (&value.kind, target.root_var()) {
            if fields.iter().any(|(_, e)| e.mentions(root)) {
                return Err(
                    self.unsupported("struct literal that reads its own target", value.span)
                );
            }
        }
        for fd in &def.fields {
            let sub_target = Expr::new(
                ExprKind::Field {
                    base: Box::new(target.clone()),
                    field: fd.name.clone(),
                },
                target.span,
            );
            let sub_value = match &value.kind {
                ExprKind::StructLit { fields, .. } => fields
                    .iter()
                    .find(|(n, _)| n == &fd.name)
                    .map(|(_, e)| e.clone())
                    .or_else(|| zero_of(self.program, &fd.ty))
                    .ok_or_else(|| {
                        self.unsupported(format!("missing field '{}'", fd.name), value.span)
                    })?,
                _ if value.is_place() => Expr::field(value.clone(), fd.name.clone()),
                _ => return Err(self.unsupported("struct-valued expression", value.span)),
            };
            if fd.ty.struct_name().is_some() {
                self.expand(&fd.ty, sub_target, sub_value, span, out)?;
            } else if fd.ty.is_array() {
                return Err(self.unsupported("array field assignment", target.span));
            } else {
                out.push(Stmt::new(
                    StmtKind::Assign {
                        target: sub_target,
                        op: AssignOp::Set,
                        value: sub_value,
                    },
                    span,
                ));
            }
        }
        Ok(())
    }

    fn hoist_args(&mut self, call: &Expr, out: &mut Vec<Stmt>) -> Result<Expr, DiffError> {
        match &call.kind {
            ExprKind::Call { callee, args } => {
                let mut hoisted = Vec::with_capacity(args.len());
                for a in args {
                    hoisted.push(self.hoist_calls(a, out)?);
                }
                Ok(Expr::new(
                    ExprKind::Call {
                        callee: callee.clone(),
                        args: hoisted,
                    },
                    call.span,
                ))
            }
            _ => self.hoist_calls(call, out),
        }
    }

    /// Replace user calls inside `e` by temporaries assigned just before.
    fn hoist_calls(&mut self, e: &Expr, out: &mut Vec<Stmt>) -> Result<Expr, DiffError> {
        let rebuilt = |kind: ExprKind| Expr::new(kind, e.span);
        Ok(match &e.kind {
            ExprKind::Call { callee, args } if user_call(e).is_some() => {
                let call = self.hoist_args(e, out)?;
                let ret = resolve_call(self.program, self.fname, callee, args.len(), e.span)?
                    .ret
                    .clone();
                if ret == Type::Void {
                    let what = format!("void call to '{}' used as a value", callee);
                    return Err(self.unsupported(what, e.span));
                }
                let t = self.names.numbered("_t");
                self.hoist_decl(&t, &ret, Span::default())?;
                out.push(Stmt::assign(Expr::var(t.clone()), call));
                Expr::var(t)
            }
            ExprKind::Call { callee, args } => {
                let mut hoisted = Vec::with_capacity(args.len());
                for a in args {
                    hoisted.push(self.hoist_calls(a, out)?);
                }
                rebuilt(ExprKind::Call {
                    callee: callee.clone(),
                    args: hoisted,
                })
            }
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                if has_user_call(then_expr) || has_user_call(else_expr) {
                    return Err(self.unsupported(
                        "function call inside a conditional expression",
                        e.span,
                    ));
                }
                rebuilt(ExprKind::Cond {
                    cond: Box::new(self.hoist_calls(cond, out)?),
                    then_expr: then_expr.clone(),
                    else_expr: else_expr.clone(),
                })
            }
            ExprKind::Unary { op, operand } => rebuilt(ExprKind::Unary {
                op: *op,
                operand: Box::new(self.hoist_calls(operand, out)?),
            }),
            ExprKind::Binary { op, left, right } => rebuilt(ExprKind::Binary {
                op: *op,
                left: Box::new(self.hoist_calls(left, out)?),
                right: Box::new(self.hoist_calls(right, out)?),
            }),
            ExprKind::Index { base, index } => rebuilt(ExprKind::Index {
                base: Box::new(self.hoist_calls(base, out)?),
                index: Box::new(self.hoist_calls(index, out)?),
            }),
            ExprKind::Field { base, field } => rebuilt(ExprKind::Field {
                base: Box::new(self.hoist_calls(base, out)?),
                field: field.clone(),
            }),
            ExprKind::StructLit { name, fields } => {
                let mut hoisted = Vec::with_capacity(fields.len());
                for (f, v) in fields {
                    hoisted.push((f.clone(), self.hoist_calls(v, out)?));
                }
                rebuilt(ExprKind::StructLit {
                    name: name.clone(),
                    fields: hoisted,
                })
            }
            ExprKind::ArrayFill { value, len } => rebuilt(ExprKind::ArrayFill {
                value: Box::new(self.hoist_calls(value, out)?),
                len: Box::new(self.hoist_calls(len, out)?),
            }),
            ExprKind::ArrayLit(items) => {
                let mut hoisted = Vec::with_capacity(items.len());
                for item in items {
                    hoisted.push(self.hoist_calls(item, out)?);
                }
                rebuilt(ExprKind::ArrayLit(hoisted))
            }
            ExprKind::Float(_)
            | ExprKind::Int(_)
            | ExprKind::Bool(_)
            | ExprKind::Var(_)
            | ExprKind::Tag(_) => e.clone(),
        })
    }
}

/// Forward-sweep and reverse-sweep statements of one source statement.
type Sweeps = (Vec<Stmt>, Vec<Stmt>);

struct Reverse<'a, 'p> {
    builder: &'a mut DerivativeBuilder,
    program: &'p Program,
    env: TypeEnv<'p>,
    names: NameGen,
    fname: String,
    mode: DiffMode,
    tbr: TbrResult,
    tape: String,
    /// Variable -> adjoint variable.
    adjoints: HashMap<String, String>,
    /// Scratch variables declared at the top of the body.
    temps: Vec<Stmt>,
    seed: Option<Expr>,
    error: Option<(Rc<dyn ErrorModel>, String)>,
    smart_tape: bool,
    sweep_back: bool,
    /// Parameters checkpointed as a whole in the prologue.
    stored: HashSet<String>,
    /// Reference and array parameters, whose writes reach the caller.
    caller_memory: HashSet<String>,
}

impl<'a, 'p> Reverse<'a, 'p> {
    fn unsupported(&self, what: impl Into<String>, span: Span) -> DiffError {
        DiffError::unsupported(&self.fname, what, span)
    }

    fn tape_var(&self) -> Expr {
        Expr::var(self.tape.clone())
    }

    fn push(&self, e: Expr) -> Stmt {
        Stmt::expr(Expr::call("__push", vec![self.tape_var(), e]))
    }

    fn pop_into(&self, target: Expr) -> Stmt {
        Stmt::assign(target, Expr::call("__pop", vec![self.tape_var()]))
    }

    fn temp(&mut self, prefix: &str, ty: Type) -> String {
        let name = self.names.numbered(prefix);
        let zero = zero_of(self.program, &ty);
        self.env.declare(name.clone(), ty.clone());
        self.temps.push(Stmt::let_(name.clone(), ty, zero));
        name
    }

    fn zero(&self, ty: &Type) -> Expr {
        zero_of(self.program, ty).unwrap_or_else(|| Expr::float(0.0))
    }

    fn build(&mut self, target: &Target<'_>, normalized: &Function) -> Result<Block, DiffError> {
        let func = target.func;
        let n = func.params.len();
        let sig = &target.signature.params;
        let body = normalized.body.as_ref().map(|b| b.stmts.as_slice()).unwrap_or(&[]);

        for p in &func.params {
            if p.ty.is_ref() || p.ty.is_array() {
                self.caller_memory.insert(p.name.clone());
            }
        }
        match self.mode {
            DiffMode::Reverse | DiffMode::ErrorEstimation => {
                for (k, i) in requested(target.indeps).into_iter().enumerate() {
                    self.adjoints.insert(func.params[i].name.clone(), sig[n + k].name.clone());
                }
                if func.ret == Type::F64 {
                    self.seed = Some(Expr::float(1.0));
                }
                if let (Some(model), Some(last)) = (target.error_model.clone(), sig.last()) {
                    self.error = Some((model, last.name.clone()));
                }
            }
            DiffMode::Pullback => {
                let mut k = n;
                if is_differentiable(self.program, &func.ret) {
                    self.seed = Some(Expr::var(sig[k].name.clone()));
                    k += 1;
                }
                for i in differentiable_params(self.program, func) {
                    self.adjoints.insert(func.params[i].name.clone(), sig[k].name.clone());
                    k += 1;
                }
            }
            DiffMode::ReverseForwardPass => {
                for (k, i) in writable_params(self.program, func).into_iter().enumerate() {
                    self.adjoints.insert(func.params[i].name.clone(), sig[n + k].name.clone());
                }
            }
            other => {
                let reason = format!("{} is not a reverse mode", other);
                return Err(DiffError::invalid(&self.fname, reason));
            }
        }

        // Adjoints of the remaining parameters and of scalar locals.
        let mut decls = Vec::new();
        for p in &func.params {
            if !is_differentiable(self.program, &p.ty) || self.adjoints.contains_key(&p.name) {
                continue;
            }
            let adj = self.names.shadow(&p.name);
            let ty = p.ty.deref().clone();
            let init = if ty.is_array() {
                Expr::fill(Expr::float(0.0), Expr::call("len", vec![Expr::var(p.name.clone())]))
            } else {
                self.zero(&ty)
            };
            self.env.declare(adj.clone(), ty.clone());
            decls.push(Stmt::let_(adj.clone(), ty, Some(init)));
            self.adjoints.insert(p.name.clone(), adj);
        }
        for s in body {
            if let StmtKind::Let { name, ty, .. } = &s.kind {
                if !is_differentiable(self.program, ty) {
                    continue;
                }
                let adj = self.names.shadow(name);
                self.env.declare(adj.clone(), ty.clone());
                if !ty.is_array() {
                    decls.push(Stmt::let_(adj.clone(), ty.clone(), Some(self.zero(ty))));
                }
                self.adjoints.insert(name.clone(), adj);
            }
        }

        let mut prologue = Vec::new();
        if self.smart_tape {
            for name in self.call_written_params(body)? {
                let store = Expr::call("__tape_store", vec![Expr::var(name.clone())]);
                prologue.push(Stmt::expr(store));
                self.stored.insert(name);
            }
        }

        let (forward, reverse) = self.block(body)?;
        let mut stmts = vec![Stmt::let_(self.tape.clone(), Type::Tape, None)];
        stmts.extend(decls);
        stmts.append(&mut self.temps);
        stmts.extend(prologue);
        stmts.extend(forward);
        if self.sweep_back {
            stmts.extend(reverse);
            if self.smart_tape {
                stmts.push(Stmt::expr(Expr::call("__tape_restore", Vec::new())));
            }
            stmts.extend(self.input_error_terms(target));
        }
        Ok(Block::new(stmts))
    }

    /// Reference and array parameters some callee may write through.
    fn call_written_params(&self, body: &[Stmt]) -> Result<Vec<String>, DiffError> {
        let mut found: Vec<String> = Vec::new();
        let mut calls: Vec<(String, Vec<Expr>, Span)> = Vec::new();
        for s in body {
            s.walk(&mut |st| {
                let e = match &st.kind {
                    StmtKind::Assign { value, .. } => value,
                    StmtKind::Expr(e) => e,
                    _ => return,
                };
                if let Some((callee, args)) = user_call(e) {
                    calls.push((callee.to_string(), args.to_vec(), e.span));
                }
            });
        }
        for (callee, args, span) in calls {
            let f = resolve_call(self.program, &self.fname, &callee, args.len(), span)?;
            for (i, a) in args.iter().enumerate() {
                let Some(root) = a.root_var() else { continue };
                if self.caller_memory.contains(root)
                    && may_write_param(self.program, f, i)
                    && !found.iter().any(|r| r == root)
                {
                    found.push(root.to_string());
                }
            }
        }
        Ok(found)
    }

    fn input_error_terms(&mut self, target: &Target<'_>) -> Vec<Stmt> {
        let Some((model, total)) = self.error.clone() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for i in requested(target.indeps) {
            let p = &target.func.params[i];
            let Some(adj) = self.adjoints.get(&p.name).cloned() else { continue };
            match p.ty.deref() {
                Type::F64 => out.push(Stmt::accumulate(
                    Expr::var(total.clone()),
                    model.term(Expr::var(adj), Expr::var(p.name.clone())),
                )),
                Type::Array(_) => {
                    let i_var = self.names.fresh("_i");
                    let at = |name: &str| {
                        Expr::index(Expr::var(name.to_string()), Expr::var(i_var.clone()))
                    };
                    out.push(Stmt::for_(
                        i_var.clone(),
                        Expr::int(0),
                        Expr::call("len", vec![Expr::var(p.name.clone())]),
                        vec![Stmt::accumulate(
                            Expr::var(total.clone()),
                            model.term(at(&adj), at(&p.name)),
                        )],
                    ));
                }
                _ => {}
            }
        }
        out
    }

    fn adjoint_place(&self, e: &Expr) -> Option<Expr> {
        let root = e.root_var()?;
        let adj = self.adjoints.get(root)?;
        Some(e.with_root(adj))
    }

    fn is_active(&self, e: &Expr) -> bool {
        let mut active = false;
        e.walk(&mut |sub| {
            if let ExprKind::Var(v) = &sub.kind {
                active |= self.adjoints.contains_key(v);
            }
        });
        active && is_differentiable(self.program, &self.env.type_of(e))
    }

    fn recorded(&self, span: Span) -> bool {
        self.tbr.is_recorded(span)
    }

    /// Checkpoint and tape a target about to be overwritten.
    fn save_target(&self, target: &Expr, out: &mut Vec<Stmt>) {
        if !self.sweep_back {
            return;
        }
        if self.smart_tape {
            if let Some(root) = target.root_var() {
                if self.caller_memory.contains(root) && !self.stored.contains(root) {
                    out.push(Stmt::expr(Expr::call("__tape_store", vec![target.clone()])));
                }
            }
        }
        if self.recorded(target.span) {
            out.push(self.push(target.clone()));
        }
    }

    fn error_term(&self, target: &Expr) -> Vec<Stmt> {
        let Some((model, total)) = &self.error else {
            return Vec::new();
        };
        if self.env.type_of(target) != Type::F64 {
            return Vec::new();
        }
        match self.adjoint_place(target) {
            Some(adj) => vec![Stmt::accumulate(
                Expr::var(total.clone()),
                model.term(adj, target.clone()),
            )],
            None => Vec::new(),
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Sweeps, DiffError> {
        let mut forward = Vec::new();
        let mut parts = Vec::with_capacity(stmts.len());
        for s in stmts {
            let (f, r) = self.stmt(s)?;
            forward.extend(f);
            parts.push(r);
        }
        let reverse = parts.into_iter().rev().flatten().collect();
        Ok((forward, reverse))
    }

    fn stmt(&mut self, s: &Stmt) -> Result<Sweeps, DiffError> {
        let mut fwd = Vec::new();
        let mut rev = Vec::new();
        match &s.kind {
            StmtKind::Let { name, ty, value, .. } => {
                fwd.push(s.clone());
                if !ty.is_array() {
                    return Ok((fwd, rev));
                }
                let Some(adj) = self.adjoints.get(name).cloned() else {
                    return Ok((fwd, rev));
                };
                let len = Expr::call("len", vec![Expr::var(name.clone())]);
                let aliased = value.as_ref().filter(|v| v.is_place());
                let init = match aliased.and_then(|v| self.adjoint_place(v)) {
                    Some(place) => place,
                    None => Expr::fill(Expr::float(0.0), len.clone()),
                };
                fwd.push(Stmt::let_(adj.clone(), ty.clone(), Some(init)));
                if self.smart_tape && aliased.is_none() {
                    let ignore = Expr::call("__tape_ignore", vec![Expr::var(name.clone())]);
                    fwd.push(Stmt::expr(ignore));
                }
                match value.as_ref().map(|v| &v.kind) {
                    Some(ExprKind::ArrayLit(items)) => {
                        for (k, item) in items.iter().enumerate() {
                            let seed = Expr::index(Expr::var(adj.clone()), Expr::int(k as i64));
                            rev.extend(self.rev_expr(item, seed)?);
                        }
                    }
                    Some(ExprKind::ArrayFill { value, .. }) if self.is_active(value) => {
                        let i_var = self.names.fresh("_i");
                        let seed = Expr::index(Expr::var(adj), Expr::var(i_var.clone()));
                        let body = self.rev_expr(value, seed)?;
                        rev.push(Stmt::for_(i_var, Expr::int(0), len, body));
                    }
                    _ => {}
                }
            }
            StmtKind::Assign { target, value, .. } => {
                if let Some((callee, args)) = user_call(value) {
                    return self.call(Some(target), s.span, value.span, callee, args);
                }
                self.save_target(target, &mut fwd);
                fwd.push(s.clone());
                rev.extend(self.error_term(target));
                if self.recorded(target.span) {
                    rev.push(self.pop_into(target.clone()));
                }
                let ty = self.env.type_of(target);
                if is_differentiable(self.program, &ty) {
                    if let Some(adj) = self.adjoint_place(target) {
                        if self.is_active(value) {
                            let r = self.temp("_r", ty.clone());
                            rev.push(Stmt::assign(Expr::var(r.clone()), adj.clone()));
                            rev.push(Stmt::assign(adj, self.zero(&ty)));
                            rev.extend(self.rev_expr(value, Expr::var(r))?);
                        } else {
                            rev.push(Stmt::assign(adj, self.zero(&ty)));
                        }
                    }
                }
            }
            StmtKind::Expr(e) => {
                if let Some((callee, args)) = user_call(e) {
                    return self.call(None, s.span, e.span, callee, args);
                }
                fwd.push(s.clone());
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let (then_f, then_r) = self.block(&then_block.stmts)?;
                let (else_f, else_r) = match else_block {
                    Some(b) => {
                        let (f, r) = self.block(&b.stmts)?;
                        (Some(f), Some(r))
                    }
                    None => (None, None),
                };
                let needs_replay =
                    !then_r.is_empty() || else_r.as_ref().map_or(false, |r| !r.is_empty());
                if !needs_replay || !self.sweep_back {
                    fwd.push(Stmt::new(
                        StmtKind::If {
                            cond: cond.clone(),
                            then_block: Block::new(then_f),
                            else_block: else_f.map(Block::new),
                        },
                        s.span,
                    ));
                    return Ok((fwd, rev));
                }
                let c = self.temp("_cond", Type::Bool);
                fwd.push(Stmt::assign(Expr::var(c.clone()), cond.clone()));
                fwd.push(Stmt::new(
                    StmtKind::If {
                        cond: Expr::var(c.clone()),
                        then_block: Block::new(then_f),
                        else_block: else_f.map(Block::new),
                    },
                    s.span,
                ));
                fwd.push(self.push(Expr::var(c.clone())));
                rev.push(self.pop_into(Expr::var(c.clone())));
                rev.push(Stmt::if_(Expr::var(c), then_r, else_r));
            }
            StmtKind::While { cond, body } => {
                let (body_f, body_r) = self.block(&body.stmts)?;
                if body_r.is_empty() || !self.sweep_back {
                    fwd.push(Stmt::new(
                        StmtKind::While {
                            cond: cond.clone(),
                            body: Block::new(body_f),
                        },
                        s.span,
                    ));
                    return Ok((fwd, rev));
                }
                let count = self.temp("_count", Type::I64);
                let mut body_f = body_f;
                body_f.push(self.increment(&count));
                fwd.push(Stmt::assign(Expr::var(count.clone()), Expr::int(0)));
                fwd.push(Stmt::new(
                    StmtKind::While {
                        cond: cond.clone(),
                        body: Block::new(body_f),
                    },
                    s.span,
                ));
                fwd.push(self.push(Expr::var(count.clone())));
                rev.extend(self.replay_loop(&count, Vec::new(), body_r));
            }
            StmtKind::For {
                var,
                var_span,
                start,
                end,
                body,
            } => {
                let (body_f, body_r) = self.block(&body.stmts)?;
                let rebuild = |body: Vec<Stmt>| {
                    Stmt::new(
                        StmtKind::For {
                            var: var.clone(),
                            var_span: *var_span,
                            start: start.clone(),
                            end: end.clone(),
                            body: Block::new(body),
                        },
                        s.span,
                    )
                };
                if body_r.is_empty() || !self.sweep_back {
                    fwd.push(rebuild(body_f));
                    return Ok((fwd, rev));
                }
                let count = self.temp("_count", Type::I64);
                let mut body_f = body_f;
                body_f.push(self.increment(&count));
                let mut head = Vec::new();
                if self.recorded(*var_span) {
                    body_f.push(self.push(Expr::var(var.clone())));
                    head.push(self.pop_into(Expr::var(var.clone())));
                }
                fwd.push(Stmt::assign(Expr::var(count.clone()), Expr::int(0)));
                fwd.push(rebuild(body_f));
                fwd.push(self.push(Expr::var(count.clone())));
                rev.extend(self.replay_loop(&count, head, body_r));
            }
            StmtKind::Return(value) => {
                if !self.sweep_back {
                    fwd.push(s.clone());
                    return Ok((fwd, rev));
                }
                if let (Some(e), Some(seed)) = (value, self.seed.clone()) {
                    rev.extend(self.rev_expr(e, seed)?);
                }
            }
            StmtKind::Break | StmtKind::Continue => {
                return Err(self.unsupported("loop exit", s.span));
            }
            StmtKind::Block(b) => {
                let (f, r) = self.block(&b.stmts)?;
                fwd.push(Stmt::new(StmtKind::Block(Block::new(f)), s.span));
                if !r.is_empty() {
                    rev.push(Stmt::new(StmtKind::Block(Block::new(r)), s.span));
                }
            }
        }
        Ok((fwd, rev))
    }

    /// Iteration counter increment appended to a forward loop body.
    fn increment(&self, count: &str) -> Stmt {
        let c = Expr::var(count.to_string());
        Stmt::assign(c.clone(), Expr::binary(BinOp::Add, c, Expr::int(1)))
    }

    /// Run the reverse body as many times as the forward loop ran.
    fn replay_loop(&self, count: &str, head: Vec<Stmt>, body_r: Vec<Stmt>) -> Vec<Stmt> {
        let c = Expr::var(count.to_string());
        let mut body = head;
        body.extend(body_r);
        body.push(Stmt::assign(c.clone(), Expr::binary(BinOp::Sub, c.clone(), Expr::int(1))));
        vec![
            self.pop_into(c.clone()),
            Stmt::while_(Expr::binary(BinOp::Gt, c, Expr::int(0)), body),
        ]
    }

    /// Adjoint argument for a reference or array parameter of a callee.
    fn adjoint_arg(&mut self, param: &Param, arg: &Expr, pre: &mut Vec<Stmt>) -> Expr {
        if let Some(place) = self.adjoint_place(arg) {
            return place;
        }
        let ty = param.ty.deref().clone();
        if ty.is_array() {
            let name = self.names.numbered("_d_t");
            pre.push(Stmt::let_(
                name.clone(),
                ty,
                Some(Expr::fill(Expr::float(0.0), Expr::call("len", vec![arg.clone()]))),
            ));
            return Expr::var(name);
        }
        let name = self.temp("_d_t", ty.clone());
        pre.push(Stmt::assign(Expr::var(name.clone()), self.zero(&ty)));
        Expr::var(name)
    }

    fn call(
        &mut self,
        target: Option<&Expr>,
        stmt_span: Span,
        span: Span,
        callee_name: &str,
        args: &[Expr],
    ) -> Result<Sweeps, DiffError> {
        let callee =
            resolve_call(self.program, &self.fname, callee_name, args.len(), span)?.clone();
        let diff = differentiable_params(self.program, &callee);
        let ret_active = is_differentiable(self.program, &callee.ret);
        let through = writable_params(self.program, &callee);
        let constant = is_non_differentiable(self.program, &callee)
            || diff.is_empty()
            || (!ret_active && through.is_empty());
        let written: Vec<usize> = (0..args.len())
            .filter(|&i| {
                let p = &callee.params[i];
                (p.ty.is_ref() || p.ty.is_array())
                    && args[i].is_place()
                    && may_write_param(self.program, &callee, i)
            })
            .collect();

        let mut fwd = Vec::new();
        let mut rev = Vec::new();
        // The pullback reads the arguments as they were before the call.
        let rounds = match (self.sweep_back, self.smart_tape) {
            (false, _) => 0,
            (true, true) => 1,
            (true, false) => 2,
        };
        for _ in 0..rounds {
            for &i in &written {
                let push = Expr::call("__push_mem", vec![self.tape_var(), args[i].clone()]);
                fwd.push(Stmt::expr(push));
            }
        }
        if let Some(t) = target {
            self.save_target(t, &mut fwd);
        }
        let forward_pass = !constant && through.iter().any(|i| written.contains(i));
        let call = if forward_pass {
            let name = self.builder.nested(&callee, DiffMode::ReverseForwardPass, span)?;
            let mut call_args = args.to_vec();
            for &i in &through {
                let a = self.adjoint_arg(&callee.params[i], &args[i], &mut fwd);
                call_args.push(a);
            }
            Expr::new(
                ExprKind::Call {
                    callee: name,
                    args: call_args,
                },
                span,
            )
        } else {
            Expr::new(
                ExprKind::Call {
                    callee: callee_name.to_string(),
                    args: args.to_vec(),
                },
                span,
            )
        };
        fwd.push(match target {
            Some(t) => Stmt::new(
                StmtKind::Assign {
                    target: t.clone(),
                    op: AssignOp::Set,
                    value: call,
                },
                stmt_span,
            ),
            None => Stmt::new(StmtKind::Expr(call), stmt_span),
        });
        if !self.sweep_back {
            return Ok((fwd, rev));
        }

        let mut seed = None;
        if let Some(t) = target {
            rev.extend(self.error_term(t));
            if self.recorded(t.span) {
                rev.push(self.pop_into(t.clone()));
            }
            if let Some(adj) = self.adjoint_place(t).filter(|_| ret_active) {
                let r = self.temp("_r", callee.ret.clone());
                rev.push(Stmt::assign(Expr::var(r.clone()), adj.clone()));
                rev.push(Stmt::assign(adj, self.zero(&callee.ret)));
                seed = Some(Expr::var(r));
            }
        }
        let pop_round = |rv: &Self, out: &mut Vec<Stmt>| {
            for &i in written.iter().rev() {
                out.push(Stmt::expr(Expr::call("__pop_mem", vec![rv.tape_var(), args[i].clone()])));
            }
        };
        pop_round(self, &mut rev);
        if !constant {
            let name = self.builder.nested(&callee, DiffMode::Pullback, span)?;
            let mut call_args = args.to_vec();
            if ret_active {
                call_args.push(seed.unwrap_or_else(|| self.zero(&callee.ret)));
            }
            let mut after = Vec::new();
            for &i in &diff {
                let p = &callee.params[i];
                let a = &args[i];
                if p.ty.is_ref() || p.ty.is_array() {
                    if !a.is_place() {
                        return Err(self.unsupported(
                            format!("non-place argument for parameter '{}'", p.name),
                            a.span,
                        ));
                    }
                    let adj = self.adjoint_arg(p, a, &mut rev);
                    call_args.push(adj);
                } else {
                    let r = self.temp("_r", p.ty.clone());
                    rev.push(Stmt::assign(Expr::var(r.clone()), self.zero(&p.ty)));
                    call_args.push(Expr::var(r.clone()));
                    after.extend(self.rev_expr(a, Expr::var(r))?);
                }
            }
            rev.push(Stmt::expr(Expr::new(
                ExprKind::Call {
                    callee: name,
                    args: call_args,
                },
                span,
            )));
            rev.extend(after);
        }
        if rounds == 2 {
            pop_round(self, &mut rev);
        }
        Ok((fwd, rev))
    }

    /// Statements accumulating `seed * d(e)/d(v)` into the adjoint of every
    /// variable `v` in `e`.
    fn rev_expr(&mut self, e: &Expr, seed: Expr) -> Result<Vec<Stmt>, DiffError> {
        let mut out = Vec::new();
        self.rev_into(e, seed, &mut out)?;
        Ok(out)
    }

    fn rev_into(&mut self, e: &Expr, seed: Expr, out: &mut Vec<Stmt>) -> Result<(), DiffError> {
        if seed.is_zero() {
            return Ok(());
        }
        match &e.kind {
            ExprKind::Float(_) | ExprKind::Int(_) | ExprKind::Bool(_) | ExprKind::Tag(_) => {}
            _ if e.is_place() => {
                let ty = self.env.type_of(e);
                if !is_differentiable(self.program, &ty) {
                    return Ok(());
                }
                let Some(adj) = self.adjoint_place(e) else {
                    return Ok(());
                };
                if ty.struct_name().is_some() {
                    for (field, fty) in self.env.struct_fields(&ty) {
                        if is_differentiable(self.program, &fty) {
                            self.rev_into(
                                &Expr::field(e.clone(), field.clone()),
                                Expr::field(seed.clone(), field),
                                out,
                            )?;
                        }
                    }
                } else if !ty.is_array() {
                    out.push(Stmt::accumulate(adj, seed));
                }
            }
            ExprKind::Field { base, field } => {
                if let ExprKind::StructLit { fields, .. } = &base.kind {
                    if let Some((_, v)) = fields.iter().find(|(n, _)| n == field) {
                        self.rev_into(v, seed, out)?;
                    }
                }
            }
            ExprKind::Unary { op, operand } => {
                if *op == UnaryOp::Neg {
                    self.rev_into(operand, Expr::neg(seed), out)?;
                }
            }
            ExprKind::Binary { op, left, right } => {
                if !self.env.is_float(e) {
                    return Ok(());
                }
                let (l, r) = (left.as_ref(), right.as_ref());
                match op {
                    BinOp::Add => {
                        self.rev_into(l, seed.clone(), out)?;
                        self.rev_into(r, seed, out)?;
                    }
                    BinOp::Sub => {
                        self.rev_into(l, seed.clone(), out)?;
                        self.rev_into(r, Expr::neg(seed), out)?;
                    }
                    BinOp::Mul => {
                        self.rev_into(l, Expr::mul(seed.clone(), r.clone()), out)?;
                        self.rev_into(r, Expr::mul(l.clone(), seed), out)?;
                    }
                    BinOp::Div => {
                        self.rev_into(l, Expr::div(seed.clone(), r.clone()), out)?;
                        if self.is_active(r) {
                            let d = Expr::neg(Expr::div(
                                Expr::mul(seed, l.clone()),
                                Expr::mul(r.clone(), r.clone()),
                            ));
                            self.rev_into(r, d, out)?;
                        }
                    }
                    _ => {}
                }
            }
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                let then_r = self.rev_expr(then_expr, seed.clone())?;
                let else_r = self.rev_expr(else_expr, seed)?;
                if !then_r.is_empty() || !else_r.is_empty() {
                    let else_r = if else_r.is_empty() { None } else { Some(else_r) };
                    out.push(Stmt::if_((**cond).clone(), then_r, else_r));
                }
            }
            ExprKind::Call { callee, args } => {
                if callee == "len" {
                    return Ok(());
                }
                if !is_builtin(callee) {
                    let what = format!("call to '{}' inside an expression", callee);
                    return Err(self.unsupported(what, e.span));
                }
                let partials = rules::partials(callee, args).ok_or_else(|| {
                    self.unsupported(format!("'{}' with {} arguments", callee, args.len()), e.span)
                })?;
                for (a, p) in args.iter().zip(partials) {
                    if self.is_active(a) {
                        self.rev_into(a, Expr::mul(seed.clone(), p), out)?;
                    }
                }
            }
            ExprKind::StructLit { name, fields } => {
                if let Some(custom) = find_constructor_pullback(self.program, &self.fname, name)? {
                    let custom = custom.name.clone();
                    return self.rev_constructor(&custom, name, fields, seed, e.span, out);
                }
                for (f, v) in fields {
                    if self.is_active(v) {
                        self.rev_into(v, Expr::field(seed.clone(), f.clone()), out)?;
                    }
                }
            }
            ExprKind::Var(_)
            | ExprKind::Index { .. }
            | ExprKind::ArrayFill { .. }
            | ExprKind::ArrayLit(_) => {}
        }
        Ok(())
    }

    /// Reverse a struct literal through the user's `constructor_pullback`.
    fn rev_constructor(
        &mut self,
        custom: &str,
        name: &str,
        fields: &[(String, Expr)],
        seed: Expr,
        span: Span,
        out: &mut Vec<Stmt>,
    ) -> Result<(), DiffError> {
        let def = self
            .program
            .struct_def(name)
            .cloned()
            .ok_or_else(|| self.unsupported(format!("unknown type {}", name), span))?;
        let seed = if seed.is_place() {
            seed
        } else {
            let r = self.temp("_r", Type::Struct(name.to_string()));
            out.push(Stmt::assign(Expr::var(r.clone()), seed));
            Expr::var(r)
        };
        let mut values = Vec::with_capacity(def.fields.len());
        for fd in &def.fields {
            let v = fields
                .iter()
                .find(|(n, _)| n == &fd.name)
                .map(|(_, e)| e.clone())
                .or_else(|| zero_of(self.program, &fd.ty))
                .ok_or_else(|| self.unsupported(format!("missing field '{}'", fd.name), span))?;
            values.push((fd.ty.clone(), v));
        }
        let mut args = vec![Expr::synthetic(ExprKind::Tag(name.to_string()))];
        args.extend(values.iter().map(|(_, v)| v.clone()));
        args.push(seed);
        let mut after = Vec::new();
        for (ty, v) in &values {
            if !is_differentiable(self.program, ty) {
                continue;
            }
            let d = self.temp("_r", ty.clone());
            out.push(Stmt::assign(Expr::var(d.clone()), self.zero(ty)));
            args.push(Expr::var(d.clone()));
            after.extend(self.rev_expr(v, Expr::var(d))?);
        }
        out.push(Stmt::new(StmtKind::Expr(Expr::call(custom, args)), span));
        out.extend(after);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::ast::print::function_to_string;
    use crate::config::EngineConfig;
    use crate::diff::{DerivativeBuilder, DiffError, DiffMode, DiffRequest};
    use crate::eval::{Machine, Value};
    use crate::parser;

    fn derive_with(src: &str, req: DiffRequest, config: EngineConfig) -> crate::ast::Program {
        let mut b = DerivativeBuilder::new(parser::parse(src).unwrap(), config);
        b.derive(&req).unwrap();
        b.into_program()
    }

    fn derive(src: &str, req: DiffRequest) -> crate::ast::Program {
        derive_with(src, req, EngineConfig::default())
    }

    #[test]
    fn gradient_of_product() {
        let p = derive(
            "fn f(x: f64, y: f64) -> f64 { return x * y + sin(x); }",
            DiffRequest::new("f", DiffMode::Reverse),
        );
        let mut m = Machine::new(&p);
        let (dx, dy) = (m.alloc_scalar(0.0), m.alloc_scalar(0.0));
        m.call("f_grad", &[Value::F64(2.0), Value::F64(3.0), dx.clone(), dy.clone()])
            .unwrap();
        assert_relative_eq!(m.read_scalar(&dx).unwrap(), 3.0 + 2.0_f64.cos(), epsilon = 1e-12);
        assert_relative_eq!(m.read_scalar(&dy).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn overwritten_values_are_taped() {
        let src = "fn f(x: f64) -> f64 { let y: f64 = x; for i in 0..3 { y = y * x; } return y; }";
        for enable_tbr in [true, false] {
            let config = EngineConfig {
                enable_tbr,
                ..EngineConfig::default()
            };
            let p = derive_with(src, DiffRequest::new("f", DiffMode::Reverse), config);
            let mut m = Machine::new(&p);
            let dx = m.alloc_scalar(0.0);
            m.call("f_grad", &[Value::F64(1.5), dx.clone()]).unwrap();
            assert_relative_eq!(m.read_scalar(&dx).unwrap(), 4.0 * 1.5_f64.powi(3), epsilon = 1e-9);
        }
    }

    #[test]
    fn branches_replay_their_condition() {
        let p = derive(
            "fn f(x: f64) -> f64 {
                let y: f64 = 0.0;
                if x > 1.0 { y = x * x; } else { y = 3.0 * x; }
                return y;
            }",
            DiffRequest::new("f", DiffMode::Reverse),
        );
        let mut m = Machine::new(&p);
        for (x, want) in [(2.0, 4.0), (0.5, 3.0)] {
            let dx = m.alloc_scalar(0.0);
            m.call("f_grad", &[Value::F64(x), dx.clone()]).unwrap();
            assert_relative_eq!(m.read_scalar(&dx).unwrap(), want, epsilon = 1e-12);
        }
    }

    #[test]
    fn array_writes_are_restored() {
        let p = derive(
            "fn f(a: [f64]) -> f64 { a[0] = a[0] * a[1]; return a[0]; }",
            DiffRequest::new("f", DiffMode::Reverse),
        );
        let mut m = Machine::new(&p);
        let a = m.alloc_array(&[2.0, 5.0]);
        let da = m.alloc_array(&[0.0, 0.0]);
        m.call("f_grad", &[a.clone(), da.clone()]).unwrap();
        assert_eq!(m.read_array(&da).unwrap(), vec![5.0, 2.0]);
        assert_eq!(m.read_array(&a).unwrap(), vec![2.0, 5.0]);
    }

    #[test]
    fn nested_calls_get_pullbacks() {
        let p = derive(
            "fn sq(x: f64) -> f64 { return x * x; } fn f(x: f64) -> f64 { return sq(x) * x; }",
            DiffRequest::new("f", DiffMode::Reverse),
        );
        assert!(p.functions_named("sq_pullback").next().is_some());
        let mut m = Machine::new(&p);
        let dx = m.alloc_scalar(0.0);
        m.call("f_grad", &[Value::F64(2.0), dx.clone()]).unwrap();
        assert_relative_eq!(m.read_scalar(&dx).unwrap(), 12.0, epsilon = 1e-12);
    }

    #[test]
    fn reference_outputs_are_seeded_by_the_caller() {
        let p = derive(
            "fn g(x: &f64) { x = x * x; } fn f(x: f64) -> f64 { let y: f64 = x; g(y); return y; }",
            DiffRequest::new("f", DiffMode::Reverse),
        );
        let mut m = Machine::new(&p);
        let dx = m.alloc_scalar(0.0);
        m.call("f_grad", &[Value::F64(3.0), dx.clone()]).unwrap();
        assert_relative_eq!(m.read_scalar(&dx).unwrap(), 6.0, epsilon = 1e-12);
    }

    #[test]
    fn early_return_replays_the_taken_branch() {
        let p = derive(
            "fn f(x: f64) -> f64 { if x > 0.0 { return x * x; } return 3.0 * x; }",
            DiffRequest::new("f", DiffMode::Reverse),
        );
        let mut m = Machine::new(&p);
        for (x, want) in [(2.0, 4.0), (-1.0, 3.0)] {
            let dx = m.alloc_scalar(0.0);
            m.call("f_grad", &[Value::F64(x), dx.clone()]).unwrap();
            assert_relative_eq!(m.read_scalar(&dx).unwrap(), want, epsilon = 1e-12);
        }
    }

    #[test]
    fn constructor_pullback_receives_field_values() {
        let src = "struct P { a: f64, b: f64 }
            fn f(x: f64, y: f64) -> f64 { let p: P = P { a: x, b: y }; return p.a * p.b; }
            mod custom_derivatives {
                fn constructor_pullback(t: tag<P>, a: f64, b: f64, dp: &P, da: &f64, db: &f64) {
                    da += 10.0 * dp.a;
                    db += 10.0 * dp.b;
                }
            }";
        let p = derive(src, DiffRequest::new("f", DiffMode::Reverse));
        let grad = function_to_string(p.functions_named("f_grad").next().unwrap());
        assert_eq!(grad.matches("constructor_pullback(").count(), 1, "{grad}");
        let mut m = Machine::new(&p);
        let (dx, dy) = (m.alloc_scalar(0.0), m.alloc_scalar(0.0));
        m.call("f_grad", &[Value::F64(2.0), Value::F64(3.0), dx.clone(), dy.clone()])
            .unwrap();
        assert_relative_eq!(m.read_scalar(&dx).unwrap(), 30.0, epsilon = 1e-12);
        assert_relative_eq!(m.read_scalar(&dy).unwrap(), 20.0, epsilon = 1e-12);
    }

    #[test]
    fn self_reading_struct_literal_is_rejected() {
        let mut b = DerivativeBuilder::new(
            parser::parse(
                "struct P { x: f64, y: f64 }
                fn f(a: f64) -> f64 {
                    let p: P = P { x: a, y: a };
                    p = P { x: p.y, y: p.x };
                    return p.x;
                }",
            )
            .unwrap(),
            EngineConfig::default(),
        );
        let err = b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap_err();
        assert!(matches!(
            err,
            DiffError::UnsupportedConstruct { ref construct, .. }
                if construct.contains("struct literal")
        ));
    }
}
