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

//! Jacobian of a function writing its results into its last parameter.
//!
//! Column `c` is the tangent of the output array when input slot `c` is
//! seeded with one. Every column runs the pushforward once, with the
//! caller's memory checkpointed on the smart tape and restored afterwards.
//! A final primal call leaves the outputs in place.

use crate::ast::{BinOp, Block, Expr, Function, Param, Program, Stmt, Type};
use crate::types::{is_differentiable, zero_of, TypeEnv};

use super::builder::{DerivativeBuilder, Target};
use super::request::{differentiable_params, DiffMode, DiffRequest, IndepVar, Selector};
use super::{iadd, imul, DiffError, NameGen};

pub fn signature(
    program: &Program,
    func: &Function,
    _indeps: &[IndepVar],
    name: &str,
) -> Result<Function, DiffError> {
    let env = TypeEnv::for_function(program, func)?;
    let mut names = NameGen::new(env.names().cloned());
    let mut params = func.params.clone();
    params.push(Param::new(names.fresh("jacobianMatrix"), Type::array_of(Type::F64)));
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

fn len_of(name: &str) -> Expr {
    Expr::call("len", vec![Expr::var(name.to_string())])
}

pub fn derive(builder: &mut DerivativeBuilder, target: &Target<'_>) -> Result<Block, DiffError> {
    let func = target.func;
    let program = target.program;
    let fname = func.qualified_name();
    let matrix = target
        .signature
        .params
        .last()
        .map(|p| p.name.clone())
        .ok_or_else(|| DiffError::invalid(&fname, "missing jacobian output"))?;
    let output = func
        .params
        .last()
        .map(|p| p.name.clone())
        .ok_or_else(|| DiffError::invalid(&fname, "missing output array"))?;

    let pushforward = builder.require(
        &DiffRequest::new(fname.clone(), DiffMode::Pushforward).with_arity(func.params.len()),
    )?;

    let env = TypeEnv::for_function(program, func)?;
    let mut names = NameGen::new(env.names().cloned());
    for p in &target.signature.params {
        names.reserve(&p.name);
    }
    let rows = names.fresh("_rows");
    let cols = names.fresh("_cols");
    let col = names.fresh("_col");
    let i_var = names.fresh("_i");
    let j_var = names.fresh("_j");

    let mut stmts = Vec::new();
    let mut shadows: Vec<(String, Type, Expr)> = Vec::new();
    let mut call_args: Vec<Expr> = func.params.iter().map(|p| Expr::var(p.name.clone())).collect();
    for i in differentiable_params(program, func) {
        let p = &func.params[i];
        let shadow = names.shadow(&p.name);
        let ty = p.ty.deref().clone();
        let zero = if ty.is_array() {
            Expr::fill(Expr::float(0.0), len_of(&p.name))
        } else {
            zero_of(program, &ty).unwrap_or_else(|| Expr::float(0.0))
        };
        stmts.push(Stmt::let_(shadow.clone(), ty.clone(), Some(zero.clone())));
        call_args.push(Expr::var(shadow.clone()));
        shadows.push((shadow, ty, zero));
    }
    if is_differentiable(program, &func.ret) {
        let ret_shadow = names.fresh("_d_ret");
        let zero = zero_of(program, &func.ret).unwrap_or_else(|| Expr::float(0.0));
        stmts.push(Stmt::let_(ret_shadow.clone(), func.ret.clone(), Some(zero)));
        call_args.push(Expr::var(ret_shadow));
    }
    let shadow_of = |param: &str| -> String {
        let i = func.param(param).map(|(i, _)| i).unwrap_or_default();
        let k = differentiable_params(program, func)
            .iter()
            .position(|&d| d == i)
            .unwrap_or_default();
        shadows.get(k).map(|s| s.0.clone()).unwrap_or_default()
    };
    let out_shadow = shadow_of(&output);

    let mut width = Expr::int(0);
    for v in target.indeps {
        let slots = match v.selector {
            Selector::Whole if func.params[v.param].ty.is_array() => len_of(&v.name),
            Selector::Whole | Selector::Index(_) => Expr::int(1),
            Selector::Range(a, b) => Expr::int(b - a),
        };
        width = iadd(width, slots);
    }
    stmts.push(Stmt::let_(rows.clone(), Type::I64, Some(len_of(&output))));
    stmts.push(Stmt::let_(cols.clone(), Type::I64, Some(width)));
    stmts.push(Stmt::let_(col.clone(), Type::I64, Some(Expr::int(0))));

    let checkpoints: Vec<Stmt> = func
        .params
        .iter()
        .filter(|p| p.ty.is_ref() || p.ty.is_array())
        .map(|p| Stmt::expr(Expr::call("__tape_store", vec![Expr::var(p.name.clone())])))
        .collect();

    // Statements computing one column with `seed` set to one.
    let column = |seed: Expr| -> Vec<Stmt> {
        let mut body = Vec::new();
        for (name, ty, zero) in &shadows {
            if ty.is_array() {
                body.push(Stmt::for_(
                    i_var.clone(),
                    Expr::int(0),
                    Expr::call("len", vec![Expr::var(name.clone())]),
                    vec![Stmt::assign(
                        Expr::index(Expr::var(name.clone()), Expr::var(i_var.clone())),
                        Expr::float(0.0),
                    )],
                ));
            } else {
                body.push(Stmt::assign(Expr::var(name.clone()), zero.clone()));
            }
        }
        body.push(Stmt::assign(seed, Expr::float(1.0)));
        body.extend(checkpoints.iter().cloned());
        body.push(Stmt::expr(Expr::call(pushforward.clone(), call_args.clone())));
        let at = iadd(
            imul(Expr::var(i_var.clone()), Expr::var(cols.clone())),
            Expr::var(col.clone()),
        );
        body.push(Stmt::for_(
            i_var.clone(),
            Expr::int(0),
            Expr::var(rows.clone()),
            vec![Stmt::assign(
                Expr::index(Expr::var(matrix.clone()), at),
                Expr::index(Expr::var(out_shadow.clone()), Expr::var(i_var.clone())),
            )],
        ));
        body.push(Stmt::expr(Expr::call("__tape_restore", Vec::new())));
        let c = Expr::var(col.clone());
        body.push(Stmt::assign(c.clone(), Expr::binary(BinOp::Add, c, Expr::int(1))));
        body
    };

    for v in target.indeps {
        let shadow = Expr::var(shadow_of(&v.name));
        let element = |index: Expr| Expr::index(shadow.clone(), index);
        match v.selector {
            Selector::Whole if func.params[v.param].ty.is_array() => {
                stmts.push(Stmt::for_(
                    j_var.clone(),
                    Expr::int(0),
                    len_of(&v.name),
                    column(element(Expr::var(j_var.clone()))),
                ));
            }
            Selector::Whole => stmts.extend(column(shadow.clone())),
            Selector::Index(k) => stmts.extend(column(element(Expr::int(k)))),
            Selector::Range(a, b) => {
                stmts.push(Stmt::for_(
                    j_var.clone(),
                    Expr::int(a),
                    Expr::int(b),
                    column(element(Expr::var(j_var.clone()))),
                ));
            }
        }
    }
    // Leave the primal results in the output array.
    let primal: Vec<Expr> = func.params.iter().map(|p| Expr::var(p.name.clone())).collect();
    stmts.push(Stmt::expr(Expr::call(fname.clone(), primal)));
    builder.note(&fname, format!("jacobian of {} via {}", output, pushforward));
    Ok(Block::new(stmts))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::config::EngineConfig;
    use crate::eval::{Machine, Value};
    use crate::parser;

    const SRC: &str = "fn f(x: f64, y: f64, out: [f64]) { out[0] = x * y; out[1] = x + 3.0 * y; }";

    fn program(src: &str, req: DiffRequest) -> Program {
        let mut b = DerivativeBuilder::new(parser::parse(src).unwrap(), EngineConfig::default());
        b.derive(&req).unwrap();
        b.into_program()
    }

    #[test]
    fn matrix_is_row_major() {
        let p = program(SRC, DiffRequest::new("f", DiffMode::Jacobian));
        let mut m = Machine::new(&p);
        let out = m.alloc_array(&[0.0; 2]);
        let jac = m.alloc_array(&[0.0; 4]);
        m.call("f_jac", &[Value::F64(2.0), Value::F64(5.0), out.clone(), jac.clone()])
            .unwrap();
        let want = [5.0, 2.0, 1.0, 3.0];
        for (got, want) in m.read_array(&jac).unwrap().iter().zip(want) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
        assert_eq!(m.read_array(&out).unwrap(), vec![10.0, 17.0]);
    }

    #[test]
    fn array_inputs_are_restored_between_columns() {
        let p = program(
            "fn g(a: [f64], out: [f64]) {
                a[0] = a[0] * a[1];
                out[0] = a[0];
                out[1] = a[1] * a[1];
            }",
            DiffRequest::new("g", DiffMode::Jacobian),
        );
        let mut m = Machine::new(&p);
        let a = m.alloc_array(&[2.0, 3.0]);
        let out = m.alloc_array(&[0.0; 2]);
        let jac = m.alloc_array(&[0.0; 4]);
        m.call("g_jac", &[a.clone(), out.clone(), jac.clone()]).unwrap();
        assert_eq!(m.read_array(&jac).unwrap(), vec![3.0, 2.0, 0.0, 6.0]);
        assert_eq!(m.read_array(&out).unwrap(), vec![6.0, 9.0]);
    }

    #[test]
    fn output_must_be_an_array() {
        let mut b = DerivativeBuilder::new(
            parser::parse("fn h(x: f64) -> f64 { return x; }").unwrap(),
            EngineConfig::default(),
        );
        let err = b.derive(&DiffRequest::new("h", DiffMode::Jacobian)).unwrap_err();
        assert!(matches!(err, DiffError::InvalidRequest { .. }));
    }
}
