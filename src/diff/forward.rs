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

//! Forward-mode transformation.
//!
//! Every expression is rewritten into a value and a tangent computed side
//! by side. Scalar modes keep one tangent per variable (`_d_x`), vector
//! modes keep `_n` lanes per scalar (`_d_vector_x[_k]`, and
//! `_d_vector_a[i * _n + _k]` for array elements) and run each tangent
//! update inside a lane loop. User calls are hoisted into temporaries so
//! the value and the tangent share one evaluation.

use std::collections::HashMap;

use crate::ast::{
    AssignOp, BinOp, Block, Expr, ExprKind, Function, Param, Program, Span, Stmt, StmtKind, Type,
    UnaryOp,
};
use crate::types::{is_builtin, is_differentiable, is_intrinsic, zero_of, TypeEnv};

use super::builder::{DerivativeBuilder, Target};
use super::registry::{
    find_custom_derivative, is_non_differentiable, resolve_call, LookupContext,
    CONSTRUCTOR_PUSHFORWARD,
};
use super::request::{adjoint_type, differentiable_params, DiffMode, IndepVar, Selector};
use super::{iadd, imul, isub, rules, DiffError, NameGen};

/// Declaration of the forward-mode derivative `name` of `func`.
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
    let diff = differentiable_params(program, func);
    let mut params = func.params.clone();
    let ret = match mode {
        DiffMode::Forward => match &func.ret {
            Type::F64 | Type::Void => func.ret.clone(),
            other => {
                return Err(DiffError::invalid(
                    &fname,
                    format!("forward mode needs an f64 or void return, found {}", other),
                ))
            }
        },
        DiffMode::Pushforward => {
            for &i in &diff {
                let p = &func.params[i];
                params.push(Param::new(names.shadow(&p.name), p.ty.clone()));
            }
            if is_differentiable(program, &func.ret) {
                params.push(Param::new(names.fresh("_d_ret"), Type::ref_to(func.ret.clone())));
            }
            func.ret.clone()
        }
        DiffMode::VectorForward => {
            if func.ret != Type::F64 {
                return Err(DiffError::invalid(&fname, "vector forward mode needs an f64 return"));
            }
            let mut seen: Vec<usize> = Vec::new();
            for v in indeps {
                if seen.contains(&v.param) {
                    continue;
                }
                seen.push(v.param);
                let p = &func.params[v.param];
                params.push(Param::new(names.shadow(&p.name), adjoint_type(&p.ty)));
            }
            Type::Void
        }
        DiffMode::VectorPushforward => {
            if diff.iter().any(|&i| func.params[i].ty.struct_name().is_some())
                || func.ret.struct_name().is_some()
            {
                return Err(DiffError::unsupported(
                    &fname,
                    "struct values in vector mode",
                    func.span,
                ));
            }
            params.push(Param::new(names.fresh("_n"), Type::I64));
            for &i in &diff {
                let p = &func.params[i];
                params.push(Param::new(
                    names.fresh(&format!("_d_vector_{}", p.name)),
                    Type::array_of(Type::F64),
                ));
            }
            if func.ret == Type::F64 {
                params.push(Param::new(names.fresh("_d_vector_ret"), Type::array_of(Type::F64)));
            }
            func.ret.clone()
        }
        other => {
            return Err(DiffError::invalid(&fname, format!("{} is not a forward mode", other)))
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

/// Generate the body of a forward-mode derivative.
pub fn derive(builder: &mut DerivativeBuilder, target: &Target<'_>) -> Result<Block, DiffError> {
    let func = target.func;
    let fname = func.qualified_name();
    let body = func.body.as_ref().ok_or_else(|| DiffError::NoDefinition {
        function: fname.clone(),
        span: Some(func.span),
    })?;
    let env = TypeEnv::for_function(target.program, func)?;
    let mut names = NameGen::new(env.names().cloned());
    for p in &target.signature.params {
        names.reserve(&p.name);
    }
    let mut fw = Forward {
        builder,
        program: target.program,
        env,
        names,
        fname,
        mode: target.mode,
        shadows: HashMap::new(),
        lanes: None,
        ret_shadow: None,
        outputs: Vec::new(),
        elem_var: None,
    };
    let mut out = Vec::new();
    fw.prologue(target, &mut out)?;
    fw.stmts(&body.stmts, &mut out)?;
    Ok(Block::new(out))
}

/// Lane count and lane index of the vector modes.
struct Lanes {
    count: Expr,
    lane: String,
}

/// Where a vector-forward output reads its lanes from.
struct Output {
    target: String,
    is_array: bool,
    selector: Selector,
    offset: Expr,
    array: String,
}

struct Forward<'a, 'p> {
    builder: &'a mut DerivativeBuilder,
    program: &'p Program,
    env: TypeEnv<'p>,
    names: NameGen,
    fname: String,
    mode: DiffMode,
    /// Variable -> tangent variable.
    shadows: HashMap<String, String>,
    lanes: Option<Lanes>,
    ret_shadow: Option<String>,
    outputs: Vec<Output>,
    elem_var: Option<String>,
}

impl<'a, 'p> Forward<'a, 'p> {
    fn unsupported(&self, what: impl Into<String>, span: Span) -> DiffError {
        DiffError::unsupported(&self.fname, what, span)
    }

    fn elem_var(&mut self) -> String {
        if let Some(v) = &self.elem_var {
            return v.clone();
        }
        let v = self.names.fresh("_i");
        self.elem_var = Some(v.clone());
        v
    }

    fn lane(&self) -> Expr {
        match &self.lanes {
            Some(l) => Expr::var(l.lane.clone()),
            None => Expr::int(0),
        }
    }

    fn lane_count(&self) -> Expr {
        match &self.lanes {
            Some(l) => l.count.clone(),
            None => Expr::int(1),
        }
    }

    fn lane_loop(&self, body: Vec<Stmt>) -> Stmt {
        let lane = self.lanes.as_ref().map(|l| l.lane.clone()).unwrap_or_default();
        Stmt::for_(lane, Expr::int(0), self.lane_count(), body)
    }

    fn declare(&mut self, name: &str, ty: Type) {
        self.env.declare(name.to_string(), ty);
    }

    fn prologue(&mut self, target: &Target<'_>, out: &mut Vec<Stmt>) -> Result<(), DiffError> {
        let func = target.func;
        let n = func.params.len();
        let diff = differentiable_params(self.program, func);
        let sig = &target.signature.params;
        match self.mode {
            DiffMode::Forward => {
                let seed = target.indeps.first();
                for &i in &diff {
                    let p = &func.params[i];
                    let shadow = self.names.shadow(&p.name);
                    let ty = p.ty.deref().clone();
                    let seeded = seed.filter(|v| v.param == i);
                    match (&ty, seeded.map(|v| v.selector)) {
                        (Type::Array(_), selector) => {
                            let len = Expr::call("len", vec![Expr::var(p.name.clone())]);
                            let zeros = Expr::fill(Expr::float(0.0), len);
                            out.push(Stmt::let_(shadow.clone(), ty.clone(), Some(zeros)));
                            if let Some(Selector::Index(j)) = selector {
                                out.push(Stmt::assign(
                                    Expr::index(Expr::var(shadow.clone()), Expr::int(j)),
                                    Expr::float(1.0),
                                ));
                            }
                        }
                        (Type::F64, Some(_)) => {
                            out.push(Stmt::let_(shadow.clone(), ty.clone(), Some(Expr::float(1.0))))
                        }
                        _ => {
                            let zero = zero_of(self.program, &ty);
                            out.push(Stmt::let_(shadow.clone(), ty.clone(), zero))
                        }
                    }
                    self.declare(&shadow, ty);
                    self.shadows.insert(p.name.clone(), shadow);
                }
            }
            DiffMode::Pushforward => {
                for (k, &i) in diff.iter().enumerate() {
                    let shadow = &sig[n + k];
                    self.declare(&shadow.name, shadow.ty.clone());
                    self.shadows.insert(func.params[i].name.clone(), shadow.name.clone());
                }
                if let Some(r) = sig.get(n + diff.len()) {
                    self.ret_shadow = Some(r.name.clone());
                }
            }
            DiffMode::VectorPushforward => {
                let count = sig.get(n).map(|p| p.name.clone()).unwrap_or_default();
                let lane = self.names.fresh("_k");
                self.lanes = Some(Lanes {
                    count: Expr::var(count),
                    lane,
                });
                for (k, &i) in diff.iter().enumerate() {
                    let shadow = &sig[n + 1 + k];
                    self.declare(&shadow.name, shadow.ty.clone());
                    self.shadows.insert(func.params[i].name.clone(), shadow.name.clone());
                }
                if let Some(r) = sig.get(n + 1 + diff.len()) {
                    self.ret_shadow = Some(r.name.clone());
                }
            }
            DiffMode::VectorForward => self.vector_prologue(target, &diff, out)?,
            other => {
                let reason = format!("{} is not a forward mode", other);
                return Err(DiffError::invalid(&self.fname, reason));
            }
        }
        Ok(())
    }

    /// Lay the requested slots out along the lanes and seed them one-hot.
    fn vector_prologue(
        &mut self,
        target: &Target<'_>,
        diff: &[usize],
        out: &mut Vec<Stmt>,
    ) -> Result<(), DiffError> {
        let func = target.func;
        let n_var = self.names.fresh("_n");
        let lane = self.names.fresh("_k");
        let i_var = self.elem_var();
        let n = Expr::var(n_var.clone());
        let len_of = |name: &str| Expr::call("len", vec![Expr::var(name.to_string())]);

        let mut offsets: Vec<(usize, Expr)> = Vec::new();
        let mut total = Expr::int(0);
        for v in target.indeps {
            let p = &func.params[v.param];
            let count = match v.selector {
                Selector::Whole if p.ty.is_array() => len_of(&p.name),
                Selector::Whole | Selector::Index(_) => Expr::int(1),
                Selector::Range(a, b) => Expr::int(b - a),
            };
            offsets.push((v.param, total.clone()));
            total = iadd(total, count);
        }
        out.push(Stmt::let_(n_var.clone(), Type::I64, Some(total)));
        self.declare(&n_var, Type::I64);
        self.lanes = Some(Lanes {
            count: n.clone(),
            lane,
        });

        for &i in diff {
            let p = &func.params[i];
            let shadow = self.names.fresh(&format!("_d_vector_{}", p.name));
            let vec_ty = Type::array_of(Type::F64);
            if p.ty.struct_name().is_some() {
                return Err(self.unsupported("struct values in vector mode", func.span));
            }
            let size = if p.ty.is_array() {
                imul(len_of(&p.name), n.clone())
            } else {
                n.clone()
            };
            let zeros = Expr::fill(Expr::float(0.0), size);
            out.push(Stmt::let_(shadow.clone(), vec_ty.clone(), Some(zeros)));
            if let Some(v) = target.indeps.iter().find(|v| v.param == i) {
                let offset = offsets
                    .iter()
                    .find(|(p, _)| *p == i)
                    .map(|(_, o)| o.clone())
                    .unwrap_or_else(|| Expr::int(0));
                let slot = |elem: Expr, pos: Expr| {
                    Expr::index(Expr::var(shadow.clone()), iadd(imul(elem, n.clone()), pos))
                };
                let i_expr = Expr::var(i_var.clone());
                match v.selector {
                    Selector::Whole if p.ty.is_array() => out.push(Stmt::for_(
                        i_var.clone(),
                        Expr::int(0),
                        len_of(&p.name),
                        vec![Stmt::assign(
                            slot(i_expr.clone(), iadd(offset.clone(), i_expr.clone())),
                            Expr::float(1.0),
                        )],
                    )),
                    Selector::Whole => out.push(Stmt::assign(
                        Expr::index(Expr::var(shadow.clone()), offset.clone()),
                        Expr::float(1.0),
                    )),
                    Selector::Index(j) => out.push(Stmt::assign(
                        slot(Expr::int(j), offset.clone()),
                        Expr::float(1.0),
                    )),
                    Selector::Range(a, b) => out.push(Stmt::for_(
                        i_var.clone(),
                        Expr::int(a),
                        Expr::int(b),
                        vec![Stmt::assign(
                            slot(
                                i_expr.clone(),
                                iadd(offset.clone(), isub(i_expr.clone(), Expr::int(a))),
                            ),
                            Expr::float(1.0),
                        )],
                    )),
                }
                let k = target.indeps.iter().position(|w| w.param == i).unwrap_or_default();
                let output = &target.signature.params[func.params.len() + k];
                self.outputs.push(Output {
                    target: output.name.clone(),
                    is_array: p.ty.is_array(),
                    selector: v.selector,
                    offset,
                    array: p.name.clone(),
                });
            }
            self.declare(&shadow, vec_ty);
            self.shadows.insert(p.name.clone(), shadow);
        }

        let ret = self.names.fresh("_d_vector_ret");
        out.push(Stmt::let_(
            ret.clone(),
            Type::array_of(Type::F64),
            Some(Expr::fill(Expr::float(0.0), n)),
        ));
        self.declare(&ret, Type::array_of(Type::F64));
        self.ret_shadow = Some(ret);
        Ok(())
    }

    /// Copy the return lanes into the vector-forward outputs.
    fn output_stmts(&mut self) -> Vec<Stmt> {
        let Some(ret) = self.ret_shadow.clone() else {
            return Vec::new();
        };
        let i_var = self.elem_var();
        let i = Expr::var(i_var.clone());
        let lanes = |pos: Expr| Expr::index(Expr::var(ret.clone()), pos);
        let mut out = Vec::new();
        for o in &self.outputs {
            let dst = |idx: Expr| Expr::index(Expr::var(o.target.clone()), idx);
            match (o.is_array, o.selector) {
                (false, _) => {
                    out.push(Stmt::assign(Expr::var(o.target.clone()), lanes(o.offset.clone())))
                }
                (true, Selector::Whole) => out.push(Stmt::for_(
                    i_var.clone(),
                    Expr::int(0),
                    Expr::call("len", vec![Expr::var(o.array.clone())]),
                    vec![Stmt::assign(dst(i.clone()), lanes(iadd(o.offset.clone(), i.clone())))],
                )),
                (true, Selector::Index(j)) => {
                    out.push(Stmt::assign(dst(Expr::int(j)), lanes(o.offset.clone())))
                }
                (true, Selector::Range(a, b)) => out.push(Stmt::for_(
                    i_var.clone(),
                    Expr::int(a),
                    Expr::int(b),
                    vec![Stmt::assign(
                        dst(i.clone()),
                        lanes(iadd(o.offset.clone(), isub(i.clone(), Expr::int(a)))),
                    )],
                )),
            }
        }
        out
    }

    fn shadow_name(&mut self, var: &str) -> String {
        if let Some(s) = self.shadows.get(var) {
            return s.clone();
        }
        let s = if self.lanes.is_some() {
            self.names.fresh(&format!("_d_vector_{}", var))
        } else {
            self.names.shadow(var)
        };
        self.shadows.insert(var.to_string(), s.clone());
        s
    }

    /// Tangent of a place. In vector modes this is the lane-`_k` slot, or
    /// the lane array itself for a whole array.
    fn shadow_place(&self, place: &Expr) -> Result<Option<Expr>, DiffError> {
        let Some(root) = place.root_var() else {
            return Ok(None);
        };
        let Some(shadow) = self.shadows.get(root) else {
            return Ok(None);
        };
        if self.lanes.is_none() {
            return Ok(Some(place.with_root(shadow)));
        }
        match &place.kind {
            ExprKind::Var(_) if self.env.type_of(place).is_array() => {
                Ok(Some(Expr::var(shadow.clone())))
            }
            ExprKind::Var(_) => Ok(Some(Expr::index(Expr::var(shadow.clone()), self.lane()))),
            ExprKind::Index { base, index } if matches!(base.kind, ExprKind::Var(_)) => {
                Ok(Some(Expr::index(
                    Expr::var(shadow.clone()),
                    iadd(imul((**index).clone(), self.lane_count()), self.lane()),
                )))
            }
            _ => Err(self.unsupported(format!("'{}' in vector mode", place), place.span)),
        }
    }

    /// `place` with its index expressions rewritten.
    fn rewrite_place(&mut self, place: &Expr, pre: &mut Vec<Stmt>) -> Result<Expr, DiffError> {
        Ok(match &place.kind {
            ExprKind::Index { base, index } => Expr::new(
                ExprKind::Index {
                    base: Box::new(self.rewrite_place(base, pre)?),
                    index: Box::new(self.value(index, pre)?),
                },
                place.span,
            ),
            ExprKind::Field { base, field } => Expr::new(
                ExprKind::Field {
                    base: Box::new(self.rewrite_place(base, pre)?),
                    field: field.clone(),
                },
                place.span,
            ),
            _ => place.clone(),
        })
    }

    fn value(&mut self, e: &Expr, pre: &mut Vec<Stmt>) -> Result<Expr, DiffError> {
        Ok(self.visit(e, pre)?.0)
    }

    /// Zero tangent of the right shape for `ty`.
    fn zeroed(&self, d: Expr, ty: &Type) -> Expr {
        if d.is_zero() && ty.struct_name().is_some() {
            return zero_of(self.program, ty).unwrap_or(d);
        }
        d
    }

    /// Value and tangent of a scalar or struct expression.
    fn visit(&mut self, e: &Expr, pre: &mut Vec<Stmt>) -> Result<(Expr, Expr), DiffError> {
        let zero = Expr::float(0.0);
        Ok(match &e.kind {
            ExprKind::Float(_) | ExprKind::Int(_) | ExprKind::Bool(_) | ExprKind::Tag(_) => {
                (e.clone(), zero)
            }
            ExprKind::Var(_) | ExprKind::Index { .. } | ExprKind::Field { .. } if e.is_place() => {
                let v = self.rewrite_place(e, pre)?;
                let d = if self.env.is_active(&v) {
                    self.shadow_place(&v)?.unwrap_or(zero)
                } else {
                    zero
                };
                (v, d)
            }
            ExprKind::Field { base, field } => {
                let (bv, bd) = self.visit(base, pre)?;
                if self.lanes.is_some() && !bd.is_zero() {
                    return Err(self.unsupported("struct values in vector mode", e.span));
                }
                let d = if bd.is_zero() { zero } else { Expr::field(bd, field.clone()) };
                (Expr::field(bv, field.clone()), d)
            }
            ExprKind::Var(_) | ExprKind::Index { .. } => {
                return Err(self.unsupported("indexing a temporary array", e.span))
            }
            ExprKind::Unary { op, operand } => {
                let (v, d) = self.visit(operand, pre)?;
                match op {
                    UnaryOp::Neg => (Expr::neg(v), Expr::neg(d)),
                    UnaryOp::Not => (Expr::not(v), zero),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let (lv, ld) = self.visit(left, pre)?;
                let (rv, rd) = self.visit(right, pre)?;
                let d = match op {
                    BinOp::Add => Expr::add(ld, rd),
                    BinOp::Sub => Expr::sub(ld, rd),
                    BinOp::Mul => Expr::add(Expr::mul(ld, rv.clone()), Expr::mul(lv.clone(), rd)),
                    BinOp::Div if rd.is_zero() => Expr::div(ld, rv.clone()),
                    BinOp::Div => Expr::div(
                        Expr::sub(Expr::mul(ld, rv.clone()), Expr::mul(lv.clone(), rd)),
                        Expr::mul(rv.clone(), rv.clone()),
                    ),
                    _ => zero,
                };
                let primal = ExprKind::Binary {
                    op: *op,
                    left: Box::new(lv),
                    right: Box::new(rv),
                };
                (Expr::new(primal, e.span), d)
            }
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                if then_expr.contains_call() || else_expr.contains_call() {
                    let user_call = |x: &Expr| {
                        let mut found = false;
                        x.walk(&mut |s| {
                            if let ExprKind::Call { callee, .. } = &s.kind {
                                found |= !is_builtin(callee);
                            }
                        });
                        found
                    };
                    if user_call(then_expr) || user_call(else_expr) {
                        return Err(self.unsupported(
                            "function call inside a conditional expression",
                            e.span,
                        ));
                    }
                }
                let c = self.value(cond, pre)?;
                let (tv, td) = self.visit(then_expr, pre)?;
                let (ev, ed) = self.visit(else_expr, pre)?;
                let d = if td.is_zero() && ed.is_zero() {
                    zero
                } else {
                    Expr::cond(c.clone(), td, ed)
                };
                (Expr::cond(c, tv, ev), d)
            }
            ExprKind::Call { callee, args } => {
                if is_intrinsic(callee) {
                    return Err(self.unsupported(format!("intrinsic '{}'", callee), e.span));
                }
                if callee == "len" {
                    return Ok((e.clone(), zero));
                }
                if is_builtin(callee) {
                    let mut values = Vec::with_capacity(args.len());
                    let mut tangents = Vec::with_capacity(args.len());
                    for a in args {
                        let (v, d) = self.visit(a, pre)?;
                        values.push(v);
                        tangents.push(d);
                    }
                    let d = rules::pushforward(callee, &values, &tangents).ok_or_else(|| {
                        let what = format!("'{}' with {} arguments", callee, args.len());
                        self.unsupported(what, e.span)
                    })?;
                    (Expr::call(callee.clone(), values), d)
                } else {
                    self.user_call(e.span, callee, args, pre)?
                }
            }
            ExprKind::StructLit { name, fields } => self.struct_literal(e.span, name, fields, pre)?,
            ExprKind::ArrayFill { .. } | ExprKind::ArrayLit(_) => {
                return Err(
                    self.unsupported("array literal outside an array initialisation", e.span)
                )
            }
        })
    }

    /// Value, initial tangent and lane-filling statements of an array
    /// expression whose tangent is stored in `shadow`.
    fn array_value(
        &mut self,
        shadow: &Expr,
        value: &Expr,
        pre: &mut Vec<Stmt>,
    ) -> Result<(Expr, Expr, Vec<Stmt>), DiffError> {
        let mut extra = Vec::new();
        match &value.kind {
            _ if value.is_place() => {
                let v = self.rewrite_place(value, pre)?;
                let d = match self.shadow_place(&v)? {
                    Some(d) => d,
                    None => Expr::fill(
                        Expr::float(0.0),
                        imul(Expr::call("len", vec![v.clone()]), self.lane_count()),
                    ),
                };
                Ok((v, d, extra))
            }
            ExprKind::ArrayFill { value: item, len } => {
                let (v, d) = self.visit(item, pre)?;
                let n = self.value(len, pre)?;
                if self.lanes.is_none() {
                    return Ok((Expr::fill(v, n.clone()), Expr::fill(d, n), extra));
                }
                if !d.is_zero() {
                    let i_var = self.elem_var();
                    let slot = Expr::index(
                        shadow.clone(),
                        iadd(imul(Expr::var(i_var.clone()), self.lane_count()), self.lane()),
                    );
                    let body = vec![self.lane_loop(vec![Stmt::assign(slot, d)])];
                    extra.push(Stmt::for_(i_var, Expr::int(0), n.clone(), body));
                }
                let init = Expr::fill(Expr::float(0.0), imul(n.clone(), self.lane_count()));
                Ok((Expr::fill(v, n), init, extra))
            }
            ExprKind::ArrayLit(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut tangents = Vec::with_capacity(items.len());
                for item in items {
                    let (v, d) = self.visit(item, pre)?;
                    values.push(v);
                    tangents.push(d);
                }
                let init = if self.lanes.is_none() {
                    Expr::synthetic(ExprKind::ArrayLit(tangents))
                } else {
                    for (j, d) in tangents.into_iter().enumerate() {
                        if d.is_zero() {
                            continue;
                        }
                        let slot = Expr::index(
                            shadow.clone(),
                            iadd(imul(Expr::int(j as i64), self.lane_count()), self.lane()),
                        );
                        extra.push(self.lane_loop(vec![Stmt::assign(slot, d)]));
                    }
                    Expr::fill(
                        Expr::float(0.0),
                        imul(Expr::int(items.len() as i64), self.lane_count()),
                    )
                };
                Ok((Expr::synthetic(ExprKind::ArrayLit(values)), init, extra))
            }
            _ => Err(self.unsupported("array-valued expression", value.span)),
        }
    }

    fn temp(&mut self, ty: Type) -> (String, String) {
        let t = self.names.numbered("_t");
        let dt = if self.lanes.is_some() {
            self.names.numbered("_d_vector_t")
        } else {
            self.names.shadow(&t)
        };
        self.declare(&t, ty.clone());
        self.shadows.insert(t.clone(), dt.clone());
        (t, dt)
    }

    fn user_call(
        &mut self,
        span: Span,
        callee_name: &str,
        args: &[Expr],
        pre: &mut Vec<Stmt>,
    ) -> Result<(Expr, Expr), DiffError> {
        let zero = Expr::float(0.0);
        let callee =
            resolve_call(self.program, &self.fname, callee_name, args.len(), span)?.clone();
        let diff = differentiable_params(self.program, &callee);

        let mut values = Vec::with_capacity(args.len());
        let mut tangents = Vec::with_capacity(args.len());
        for (p, a) in callee.params.iter().zip(args) {
            if p.ty.is_ref() || p.ty.is_array() {
                if !a.is_place() {
                    if p.ty.is_ref() {
                        return Err(self.unsupported(
                            format!("non-place argument for reference parameter '{}'", p.name),
                            a.span,
                        ));
                    }
                    return Err(self.unsupported("array temporary as call argument", a.span));
                }
                let v = self.rewrite_place(a, pre)?;
                let d = if self.env.is_active(&v) {
                    self.shadow_place(&v)?.unwrap_or_else(|| zero.clone())
                } else {
                    zero.clone()
                };
                values.push(v);
                tangents.push(d);
            } else {
                let (v, d) = self.visit(a, pre)?;
                values.push(v);
                tangents.push(d);
            }
        }

        let ret_active = is_differentiable(self.program, &callee.ret);
        let writes_active = diff
            .iter()
            .any(|&i| callee.params[i].ty.is_ref() || callee.params[i].ty.is_array());
        if is_non_differentiable(self.program, &callee)
            || diff.is_empty()
            || (!ret_active && !writes_active)
        {
            return Ok((Expr::call(callee_name, values), zero));
        }

        let vector = self.lanes.is_some();
        let mode = if vector {
            DiffMode::VectorPushforward
        } else {
            DiffMode::Pushforward
        };
        let name = self.builder.nested(&callee, mode, span)?;
        let mut call_args = values.clone();
        if vector {
            call_args.push(self.lane_count());
        }
        for &i in &diff {
            let p = &callee.params[i];
            let a = &values[i];
            let d = tangents[i].clone();
            if !vector {
                let arg = if (p.ty.is_ref() || p.ty.is_array()) && !d.is_place() {
                    // Inactive argument: the callee still needs somewhere to write.
                    let dummy = self.names.numbered("_d_t");
                    let init = if p.ty.is_array() {
                        Some(Expr::fill(Expr::float(0.0), Expr::call("len", vec![a.clone()])))
                    } else {
                        zero_of(self.program, p.ty.deref())
                    };
                    pre.push(Stmt::let_(dummy.clone(), p.ty.deref().clone(), init));
                    Expr::var(dummy)
                } else {
                    self.zeroed(d, p.ty.deref())
                };
                call_args.push(arg);
                continue;
            }
            let lanes_of = |s: &Self, a: &Expr| -> Option<String> {
                match &a.kind {
                    ExprKind::Var(v) => s.shadows.get(v).cloned(),
                    _ => None,
                }
            };
            if p.ty.is_ref() || p.ty.is_array() {
                match lanes_of(self, a) {
                    Some(lanes) => call_args.push(Expr::var(lanes)),
                    None if a.is_place() && !matches!(a.kind, ExprKind::Var(_)) => {
                        return Err(self.unsupported(
                            "reference argument bound to an element in vector mode",
                            a.span,
                        ))
                    }
                    None => {
                        let tmp = self.names.numbered("_d_vector_t");
                        let size = if p.ty.is_array() {
                            imul(Expr::call("len", vec![a.clone()]), self.lane_count())
                        } else {
                            self.lane_count()
                        };
                        let zeros = Expr::fill(zero.clone(), size);
                        pre.push(Stmt::let_(tmp.clone(), Type::array_of(Type::F64), Some(zeros)));
                        call_args.push(Expr::var(tmp));
                    }
                }
            } else {
                let tmp = self.names.numbered("_d_vector_t");
                pre.push(Stmt::let_(
                    tmp.clone(),
                    Type::array_of(Type::F64),
                    Some(Expr::fill(zero.clone(), self.lane_count())),
                ));
                if !d.is_zero() {
                    let slot = Expr::index(Expr::var(tmp.clone()), self.lane());
                    pre.push(self.lane_loop(vec![Stmt::assign(slot, d)]));
                }
                self.declare(&tmp, Type::array_of(Type::F64));
                call_args.push(Expr::var(tmp));
            }
        }

        if callee.ret == Type::Void {
            pre.push(Stmt::expr(Expr::call(name, call_args)));
            return Ok((zero.clone(), zero));
        }
        if !ret_active {
            let t = self.names.numbered("_t");
            self.declare(&t, callee.ret.clone());
            pre.push(Stmt::let_(t.clone(), callee.ret.clone(), Some(Expr::call(name, call_args))));
            return Ok((Expr::var(t), zero));
        }
        let (t, dt) = self.temp(callee.ret.clone());
        let (dt_ty, dt_init, d) = if vector {
            (
                Type::array_of(Type::F64),
                Some(Expr::fill(zero, self.lane_count())),
                Expr::index(Expr::var(dt.clone()), self.lane()),
            )
        } else {
            (callee.ret.clone(), None, Expr::var(dt.clone()))
        };
        self.declare(&dt, dt_ty.clone());
        pre.push(Stmt::let_(dt.clone(), dt_ty, dt_init));
        call_args.push(Expr::var(dt));
        pre.push(Stmt::let_(t.clone(), callee.ret.clone(), Some(Expr::call(name, call_args))));
        Ok((Expr::var(t), d))
    }

    fn struct_literal(
        &mut self,
        span: Span,
        name: &str,
        fields: &[(String, Expr)],
        pre: &mut Vec<Stmt>,
    ) -> Result<(Expr, Expr), DiffError> {
        let ty = Type::Struct(name.to_string());
        let def = self
            .program
            .struct_def(name)
            .cloned()
            .ok_or_else(|| self.unsupported(format!("unknown struct '{}'", name), span))?;
        if !is_differentiable(self.program, &ty) {
            let mut values = Vec::with_capacity(fields.len());
            for (f, e) in fields {
                values.push((f.clone(), self.value(e, pre)?));
            }
            let lit = ExprKind::StructLit {
                name: name.to_string(),
                fields: values,
            };
            return Ok((Expr::synthetic(lit), Expr::float(0.0)));
        }
        if self.lanes.is_some() {
            return Err(self.unsupported("struct values in vector mode", span));
        }

        let mut values = Vec::with_capacity(def.fields.len());
        let mut tangents = Vec::new();
        for fd in &def.fields {
            let (v, d) = match fields.iter().find(|(n, _)| n == &fd.name) {
                Some((_, e)) => self.visit(e, pre)?,
                None => (
                    zero_of(self.program, &fd.ty).unwrap_or_else(|| Expr::float(0.0)),
                    Expr::float(0.0),
                ),
            };
            values.push((fd.name.clone(), v));
            if is_differentiable(self.program, &fd.ty) {
                tangents.push((fd.name.clone(), self.zeroed(d, &fd.ty), fd.ty.clone()));
            }
        }

        let mut expected = vec![Type::Tag(name.to_string())];
        expected.extend(def.fields.iter().map(|f| f.ty.clone()));
        expected.extend(tangents.iter().map(|(_, _, t)| t.clone()));
        expected.push(Type::ref_to(ty.clone()));
        let custom = find_custom_derivative(
            self.program,
            &self.fname,
            CONSTRUCTOR_PUSHFORWARD,
            &expected,
            LookupContext::Constructor(name),
        )?;
        if custom.is_some() {
            let (t, dt) = self.temp(ty.clone());
            self.declare(&dt, ty.clone());
            let mut args = vec![Expr::synthetic(ExprKind::Tag(name.to_string()))];
            args.extend(values.into_iter().map(|(_, v)| v));
            args.extend(tangents.into_iter().map(|(_, d, _)| d));
            args.push(Expr::var(dt.clone()));
            pre.push(Stmt::let_(dt.clone(), ty.clone(), None));
            pre.push(Stmt::let_(t.clone(), ty, Some(Expr::call(CONSTRUCTOR_PUSHFORWARD, args))));
            return Ok((Expr::var(t), Expr::var(dt)));
        }

        let value = Expr::synthetic(ExprKind::StructLit {
            name: name.to_string(),
            fields: values,
        });
        let tangent = if tangents.iter().all(|(_, d, _)| d.is_zero()) {
            Expr::float(0.0)
        } else {
            Expr::synthetic(ExprKind::StructLit {
                name: name.to_string(),
                fields: tangents.into_iter().map(|(f, d, _)| (f, d)).collect(),
            })
        };
        Ok((value, tangent))
    }

    fn block(&mut self, block: &Block) -> Result<Block, DiffError> {
        let mut out = Vec::new();
        self.stmts(&block.stmts, &mut out)?;
        Ok(Block {
            stmts: out,
            span: block.span,
        })
    }

    fn stmts(&mut self, stmts: &[Stmt], out: &mut Vec<Stmt>) -> Result<(), DiffError> {
        for s in stmts {
            self.stmt(s, out)?;
        }
        Ok(())
    }

    fn stmt(&mut self, s: &Stmt, out: &mut Vec<Stmt>) -> Result<(), DiffError> {
        match &s.kind {
            StmtKind::Let {
                name,
                name_span,
                ty,
                value,
            } => {
                let primal = |value: Option<Expr>| {
                    Stmt::new(
                        StmtKind::Let {
                            name: name.clone(),
                            name_span: *name_span,
                            ty: ty.clone(),
                            value,
                        },
                        s.span,
                    )
                };
                if !is_differentiable(self.program, ty) {
                    let v = match value {
                        Some(e) => Some(self.value(e, out)?),
                        None => None,
                    };
                    out.push(primal(v));
                    return Ok(());
                }
                let shadow = self.shadow_name(name);
                if ty.is_array() {
                    let shadow_ty = if self.lanes.is_some() {
                        Type::array_of(Type::F64)
                    } else {
                        ty.clone()
                    };
                    self.declare(&shadow, shadow_ty.clone());
                    match value {
                        None => {
                            out.push(Stmt::let_(shadow, shadow_ty, None));
                            out.push(primal(None));
                        }
                        Some(e) => {
                            let (v, init, extra) =
                                self.array_value(&Expr::var(shadow.clone()), e, out)?;
                            out.push(Stmt::let_(shadow, shadow_ty, Some(init)));
                            out.extend(extra);
                            out.push(primal(Some(v)));
                        }
                    }
                    return Ok(());
                }
                if self.lanes.is_some() {
                    if ty.struct_name().is_some() {
                        return Err(self.unsupported("struct values in vector mode", *name_span));
                    }
                    let lanes_ty = Type::array_of(Type::F64);
                    self.declare(&shadow, lanes_ty.clone());
                    let init = Expr::fill(Expr::float(0.0), self.lane_count());
                    let v = match value {
                        Some(e) => {
                            let (v, d) = self.visit(e, out)?;
                            out.push(Stmt::let_(shadow.clone(), lanes_ty, Some(init)));
                            if !d.is_zero() {
                                let slot = Expr::index(Expr::var(shadow), self.lane());
                                out.push(self.lane_loop(vec![Stmt::assign(slot, d)]));
                            }
                            Some(v)
                        }
                        None => {
                            out.push(Stmt::let_(shadow, lanes_ty, Some(init)));
                            None
                        }
                    };
                    out.push(primal(v));
                    return Ok(());
                }
                self.declare(&shadow, ty.clone());
                match value {
                    Some(e) => {
                        let (v, d) = self.visit(e, out)?;
                        out.push(Stmt::let_(shadow, ty.clone(), Some(self.zeroed(d, ty))));
                        out.push(primal(Some(v)));
                    }
                    None => {
                        out.push(Stmt::let_(shadow, ty.clone(), None));
                        out.push(primal(None));
                    }
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
                let primal = |target: Expr, value: Expr| {
                    Stmt::new(
                        StmtKind::Assign {
                            target,
                            op: AssignOp::Set,
                            value,
                        },
                        s.span,
                    )
                };
                let ty = self.env.type_of(target);
                let tv = self.rewrite_place(target, out)?;
                if !is_differentiable(self.program, &ty) {
                    let v = self.value(&value, out)?;
                    out.push(primal(tv, v));
                    return Ok(());
                }
                let shadow = self.shadow_place(&tv)?.ok_or_else(|| {
                    self.unsupported(format!("assignment to '{}'", target), target.span)
                })?;
                if ty.is_array() {
                    let (v, init, extra) = self.array_value(&shadow, &value, out)?;
                    out.push(Stmt::assign(shadow, init));
                    out.extend(extra);
                    out.push(primal(tv, v));
                    return Ok(());
                }
                let (v, d) = self.visit(&value, out)?;
                if self.lanes.is_some() {
                    out.push(self.lane_loop(vec![Stmt::assign(shadow, d)]));
                } else {
                    out.push(Stmt::assign(shadow, self.zeroed(d, &ty)));
                }
                out.push(primal(tv, v));
            }
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Call { callee, args } if !is_builtin(callee) && !is_intrinsic(callee) => {
                    let (v, _) = self.user_call(e.span, callee, args, out)?;
                    if matches!(v.kind, ExprKind::Call { .. }) {
                        out.push(Stmt::expr(v));
                    }
                }
                _ => {
                    let v = self.value(e, out)?;
                    out.push(Stmt::new(StmtKind::Expr(v), s.span));
                }
            },
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let then_block = self.block(then_block)?;
                let else_block = match else_block {
                    Some(b) => Some(self.block(b)?),
                    None => None,
                };
                out.push(Stmt::new(
                    StmtKind::If {
                        cond: cond.clone(),
                        then_block,
                        else_block,
                    },
                    s.span,
                ));
            }
            StmtKind::While { cond, body } => {
                let body = self.block(body)?;
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
                let body = self.block(body)?;
                out.push(Stmt::new(
                    StmtKind::For {
                        var: var.clone(),
                        var_span: *var_span,
                        start: start.clone(),
                        end: end.clone(),
                        body,
                    },
                    s.span,
                ));
            }
            StmtKind::Return(value) => self.ret(value.as_ref(), out)?,
            StmtKind::Break | StmtKind::Continue => out.push(s.clone()),
            StmtKind::Block(b) => {
                let b = self.block(b)?;
                out.push(Stmt::new(StmtKind::Block(b), s.span));
            }
        }
        Ok(())
    }

    fn ret(&mut self, value: Option<&Expr>, out: &mut Vec<Stmt>) -> Result<(), DiffError> {
        let Some(e) = value else {
            if self.mode == DiffMode::VectorForward {
                out.extend(self.output_stmts());
            }
            out.push(Stmt::ret(None));
            return Ok(());
        };
        let ty = self.env.type_of(e);
        let (v, d) = self.visit(e, out)?;
        match self.mode {
            DiffMode::Forward => out.push(Stmt::ret(Some(d))),
            DiffMode::Pushforward => {
                if let Some(r) = &self.ret_shadow {
                    out.push(Stmt::assign(Expr::var(r.clone()), self.zeroed(d, &ty)));
                }
                out.push(Stmt::ret(Some(v)));
            }
            DiffMode::VectorPushforward => {
                if let Some(r) = self.ret_shadow.clone() {
                    let slot = Expr::index(Expr::var(r), self.lane());
                    out.push(self.lane_loop(vec![Stmt::assign(slot, d)]));
                }
                out.push(Stmt::ret(Some(v)));
            }
            DiffMode::VectorForward => {
                if let Some(r) = self.ret_shadow.clone() {
                    let slot = Expr::index(Expr::var(r), self.lane());
                    out.push(self.lane_loop(vec![Stmt::assign(slot, d)]));
                }
                out.extend(self.output_stmts());
                out.push(Stmt::ret(None));
            }
            _ => out.push(Stmt::ret(Some(v))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::diff::{DerivativeBuilder, DiffMode, DiffRequest};
    use crate::eval::{Machine, Value};
    use crate::parser;

    fn derive(src: &str, req: DiffRequest) -> crate::ast::Program {
        let mut b = DerivativeBuilder::new(parser::parse(src).unwrap(), EngineConfig::default());
        b.derive(&req).unwrap();
        b.into_program()
    }

    #[test]
    fn product_rule_on_array_element() {
        let p = derive(
            "fn multiply(arr: [f64]) -> f64 { return arr[0] * arr[1]; }",
            DiffRequest::new("multiply", DiffMode::Forward).with_args("arr[1]").unwrap(),
        );
        let mut m = Machine::new(&p);
        let arr = m.alloc_array(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(m.call("multiply_darg0_1", &[arr]).unwrap(), Value::F64(1.0));
    }

    #[test]
    fn pushforward_returns_primal_and_writes_tangent() {
        let p = derive(
            "fn sq(x: f64) -> f64 { return x * x; }",
            DiffRequest::new("sq", DiffMode::Pushforward),
        );
        let f = p.functions_named("sq_pushforward").next().unwrap();
        assert_eq!(f.params.len(), 3);
        let mut m = Machine::new(&p);
        let ret = m.alloc_scalar(0.0);
        let v = m
            .call("sq_pushforward", &[Value::F64(3.0), Value::F64(1.0), ret.clone()])
            .unwrap();
        assert_eq!(v, Value::F64(9.0));
        assert_eq!(m.read_scalar(&ret).unwrap(), 6.0);
    }

    #[test]
    fn nested_calls_use_pushforwards() {
        let p = derive(
            "fn g(x: f64) -> f64 { return sin(x) * x; }
            fn f(x: f64) -> f64 { let y: f64 = g(x); return y * 2.0; }",
            DiffRequest::new("f", DiffMode::Forward),
        );
        assert!(p.functions_named("g_pushforward").next().is_some());
        let mut m = Machine::new(&p);
        let x: f64 = 0.7;
        let got = m.call("f_darg0", &[Value::F64(x)]).unwrap().as_f64().unwrap();
        let want = 2.0 * (x.cos() * x + x.sin());
        assert!((got - want).abs() < 1e-12);
    }

    #[test]
    fn vector_forward_fills_every_output() {
        let p = derive(
            "fn f(x: f64, y: f64) -> f64 { return x * x * y; }",
            DiffRequest::new("f", DiffMode::VectorForward),
        );
        let mut m = Machine::new(&p);
        let dx = m.alloc_scalar(0.0);
        let dy = m.alloc_scalar(0.0);
        m.call("f_dvec", &[Value::F64(2.0), Value::F64(3.0), dx.clone(), dy.clone()])
            .unwrap();
        assert_eq!(m.read_scalar(&dx).unwrap(), 12.0);
        assert_eq!(m.read_scalar(&dy).unwrap(), 4.0);
    }

    #[test]
    fn loops_and_break_are_kept() {
        let p = derive(
            "fn f(x: f64) -> f64 {
                let p: f64 = 1.0;
                for i in 0..10 { if i == 3 { break; } p = p * x; }
                return p;
            }",
            DiffRequest::new("f", DiffMode::Forward),
        );
        let mut m = Machine::new(&p);
        let got = m.call("f_darg0", &[Value::F64(2.0)]).unwrap();
        assert_eq!(got, Value::F64(12.0));
    }
}
