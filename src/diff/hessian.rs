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

//! Second derivatives built from first-order requests.
//!
//! Row `r` of the Hessian is the gradient of the forward derivative along
//! slot `r`. The diagonal differentiates that forward derivative forward a
//! second time.

use std::collections::HashMap;

use crate::ast::{Block, Expr, Function, Param, Program, Stmt, Type};
use crate::types::TypeEnv;

use super::builder::{DerivativeBuilder, Target};
use super::request::{DiffMode, DiffRequest, IndepSpec, IndepVar, Selector};
use super::{iadd, DiffError, NameGen};

/// One scalar independent: a scalar parameter or one array element.
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    param: usize,
    name: String,
    index: Option<i64>,
}

impl Slot {
    fn spec(&self) -> IndepSpec {
        IndepSpec {
            name: self.name.clone(),
            selector: self.index.map_or(Selector::Whole, Selector::Index),
        }
    }
}

fn slots(indeps: &[IndepVar]) -> Vec<Slot> {
    let mut out = Vec::new();
    for v in indeps {
        let mut push = |index| {
            out.push(Slot {
                param: v.param,
                name: v.name.clone(),
                index,
            })
        };
        match v.selector {
            Selector::Whole => push(None),
            Selector::Index(i) => push(Some(i)),
            Selector::Range(a, b) => (a..b).for_each(|i| push(Some(i))),
        }
    }
    out
}

pub fn signature(
    program: &Program,
    func: &Function,
    mode: DiffMode,
    _indeps: &[IndepVar],
    name: &str,
) -> Result<Function, DiffError> {
    let fname = func.qualified_name();
    if func.ret != Type::F64 {
        return Err(DiffError::invalid(
            &fname,
            format!("{} mode needs an f64 return, found {}", mode, func.ret),
        ));
    }
    let env = TypeEnv::for_function(program, func)?;
    let mut names = NameGen::new(env.names().cloned());
    let output = match mode {
        DiffMode::Hessian => names.fresh("hessianMatrix"),
        DiffMode::HessianDiagonal => names.fresh("diagonalHessianVector"),
        other => {
            return Err(DiffError::invalid(&fname, format!("{} is not a second-order mode", other)))
        }
    };
    let mut params = func.params.clone();
    params.push(Param::new(output, Type::array_of(Type::F64)));
    Ok(Function {
        name: name.to_string(),
        owner: func.owner.clone(),
        namespace: None,
        params,
        ret: Type::Void,
        body: None,
        non_differentiable: false,
        span: func.span,
    })
}

pub fn derive(builder: &mut DerivativeBuilder, target: &Target<'_>) -> Result<Block, DiffError> {
    let func = target.func;
    let fname = func.qualified_name();
    let arity = func.params.len();
    let output = target
        .signature
        .params
        .last()
        .map(|p| Expr::var(p.name.clone()))
        .ok_or_else(|| DiffError::invalid(&fname, "missing output parameter"))?;
    let slots = slots(target.indeps);
    let originals: Vec<Expr> = func.params.iter().map(|p| Expr::var(p.name.clone())).collect();

    let forward_along = |builder: &mut DerivativeBuilder, function: String, slot: &Slot| {
        builder.require(
            &DiffRequest::new(function, DiffMode::Forward)
                .with_arity(arity)
                .with_indeps(vec![slot.spec()]),
        )
    };

    if target.mode == DiffMode::HessianDiagonal {
        let mut stmts = Vec::with_capacity(slots.len());
        for (k, slot) in slots.iter().enumerate() {
            let first = forward_along(builder, fname.clone(), slot)?;
            let second = forward_along(builder, first, slot)?;
            stmts.push(Stmt::assign(
                Expr::index(output.clone(), Expr::int(k as i64)),
                Expr::call(second, originals.clone()),
            ));
        }
        builder.note(&fname, format!("{} diagonal entries", slots.len()));
        return Ok(Block::new(stmts));
    }

    let env = TypeEnv::for_function(target.program, func)?;
    let mut names = NameGen::new(env.names().cloned());
    for p in &target.signature.params {
        names.reserve(&p.name);
    }
    let i_var = names.fresh("_i");

    // Adjoint buffers, one per distinct parameter, in request order.
    let mut order: Vec<usize> = Vec::new();
    let mut adjoints: HashMap<usize, String> = HashMap::new();
    let mut stmts = Vec::new();
    for v in target.indeps {
        if adjoints.contains_key(&v.param) {
            continue;
        }
        let p = &func.params[v.param];
        let adj = names.shadow(&p.name);
        let init = if p.ty.is_array() {
            Expr::fill(Expr::float(0.0), Expr::call("len", vec![Expr::var(p.name.clone())]))
        } else {
            Expr::float(0.0)
        };
        stmts.push(Stmt::let_(adj.clone(), p.ty.deref().clone(), Some(init)));
        adjoints.insert(v.param, adj);
        order.push(v.param);
    }
    let specs: Vec<IndepSpec> = target
        .indeps
        .iter()
        .map(|v| IndepSpec {
            name: v.name.clone(),
            selector: v.selector,
        })
        .collect();
    let entry = |slot: &Slot| -> Expr {
        let adj = Expr::var(adjoints.get(&slot.param).cloned().unwrap_or_default());
        match slot.index {
            Some(i) => Expr::index(adj, Expr::int(i)),
            None => adj,
        }
    };

    let n = slots.len() as i64;
    for (r, slot) in slots.iter().enumerate() {
        let first = forward_along(builder, fname.clone(), slot)?;
        let grad = builder.require(
            &DiffRequest::new(first, DiffMode::Reverse)
                .with_arity(arity)
                .with_indeps(specs.clone())
                .with_order(2),
        )?;
        for &param in &order {
            let adj = Expr::var(adjoints.get(&param).cloned().unwrap_or_default());
            let p = &func.params[param];
            if p.ty.is_array() {
                stmts.push(Stmt::for_(
                    i_var.clone(),
                    Expr::int(0),
                    Expr::call("len", vec![Expr::var(p.name.clone())]),
                    vec![Stmt::assign(
                        Expr::index(adj, Expr::var(i_var.clone())),
                        Expr::float(0.0),
                    )],
                ));
            } else {
                stmts.push(Stmt::assign(adj, Expr::float(0.0)));
            }
        }
        let mut args = originals.clone();
        args.extend(order.iter().map(|p| Expr::var(adjoints.get(p).cloned().unwrap_or_default())));
        stmts.push(Stmt::expr(Expr::call(grad, args)));
        for (c, col) in slots.iter().enumerate() {
            let at = iadd(Expr::int(r as i64 * n), Expr::int(c as i64));
            stmts.push(Stmt::assign(Expr::index(output.clone(), at), entry(col)));
        }
    }
    builder.note(&fname, format!("{}x{} hessian", n, n));
    Ok(Block::new(stmts))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::config::EngineConfig;
    use crate::eval::{Machine, Value};
    use crate::parser;

    fn program(src: &str, req: DiffRequest) -> Program {
        let mut b = DerivativeBuilder::new(parser::parse(src).unwrap(), EngineConfig::default());
        b.derive(&req).unwrap();
        b.into_program()
    }

    #[test]
    fn ranges_expand_to_slots() {
        let v = IndepVar {
            param: 1,
            name: "a".into(),
            selector: Selector::Range(1, 3),
        };
        let s = slots(&[v]);
        assert_eq!(s.len(), 2);
        assert_eq!(s[1].index, Some(2));
        assert_eq!(s[0].spec().selector, Selector::Index(1));
    }

    #[test]
    fn scalar_hessian() {
        let p = program(
            "fn f(x: f64, y: f64) -> f64 { return x * x * y + y * y * y; }",
            DiffRequest::new("f", DiffMode::Hessian),
        );
        let mut m = Machine::new(&p);
        let h = m.alloc_array(&[0.0; 4]);
        m.call("f_hessian", &[Value::F64(2.0), Value::F64(3.0), h.clone()]).unwrap();
        let h = m.read_array(&h).unwrap();
        let want = [6.0, 4.0, 4.0, 18.0];
        for (got, want) in h.iter().zip(want) {
            assert_relative_eq!(*got, want, epsilon = 1e-9);
        }
    }

    #[test]
    fn diagonal_uses_second_forward_pass() {
        let p = program(
            "fn f(x: f64, y: f64) -> f64 { return x * x * x + x * y; }",
            DiffRequest::new("f", DiffMode::HessianDiagonal),
        );
        assert!(p.functions_named("f_darg0_darg0").next().is_some());
        let mut m = Machine::new(&p);
        let d = m.alloc_array(&[0.0; 2]);
        m.call("f_hessian_diagonal", &[Value::F64(2.0), Value::F64(5.0), d.clone()]).unwrap();
        assert_eq!(m.read_array(&d).unwrap(), vec![12.0, 0.0]);
    }

    #[test]
    fn array_independent_needs_a_range() {
        let mut b = DerivativeBuilder::new(
            parser::parse("fn f(a: [f64]) -> f64 { return a[0] * a[1]; }").unwrap(),
            EngineConfig::default(),
        );
        let err = b.derive(&DiffRequest::new("f", DiffMode::Hessian)).unwrap_err();
        assert!(matches!(err, DiffError::InvalidRequest { .. }));
        b.derive(&DiffRequest::new("f", DiffMode::Hessian).with_args("a[0:2]").unwrap())
            .unwrap();
    }
}
