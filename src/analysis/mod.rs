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

//! Static analyses consumed by the reverse-mode transformation.

pub mod tbr;

use crate::ast::{ExprKind, Function, Program, StmtKind};

pub use tbr::{analyze, AccessPath, PathElem, TbrOptions, TbrResult, TbrStatus};

const MAX_EFFECT_DEPTH: usize = 8;

/// Whether `func` may write through its `index`-th parameter.
///
/// Only reference and array parameters can be written. Declaration-only
/// callees and call chains deeper than a small bound are assumed to write.
pub fn may_write_param(program: &Program, func: &Function, index: usize) -> bool {
    may_write(program, func, index, 0)
}

fn may_write(program: &Program, func: &Function, index: usize, depth: usize) -> bool {
    let Some(param) = func.params.get(index) else {
        return false;
    };
    if !(param.ty.is_ref() || param.ty.is_array()) {
        return false;
    }
    let Some(body) = &func.body else {
        return true;
    };
    if depth >= MAX_EFFECT_DEPTH {
        return true;
    }
    let name = param.name.as_str();
    let mut writes = false;
    body.walk(&mut |stmt| {
        if writes {
            return;
        }
        if let StmtKind::Assign { target, .. } = &stmt.kind {
            if target.root_var() == Some(name) {
                writes = true;
                return;
            }
        }
        for e in stmt.exprs() {
            e.walk(&mut |sub| {
                if let ExprKind::Call { callee, args } = &sub.kind {
                    for (i, arg) in args.iter().enumerate() {
                        if arg.root_var() != Some(name) || !arg.is_place() {
                            continue;
                        }
                        if callee.starts_with("__") {
                            if callee == "__pop_mem" {
                                writes = true;
                            }
                            continue;
                        }
                        let mut callees = program
                            .functions_named(callee)
                            .filter(|f| f.params.len() == args.len());
                        if let Some(target) = callees.next() {
                            if may_write(program, target, i, depth + 1) {
                                writes = true;
                            }
                        }
                    }
                }
            });
        }
    });
    writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[test]
    fn follows_calls_through_parameters() {
        let program = parser::parse(
            r#"
            fn scale(a: [f64], k: f64) { for i in 0..len(a) { a[i] = a[i] * k; } }
            fn wrapper(b: [f64], k: f64) { scale(b, k); }
            fn reader(c: [f64]) -> f64 { return c[0]; }
            fn opaque(d: &f64);
            "#,
        )
        .expect("parse");
        let f = |name: &str| program.functions_named(name).next().expect("function");
        assert!(may_write_param(&program, f("scale"), 0));
        assert!(!may_write_param(&program, f("scale"), 1));
        assert!(may_write_param(&program, f("wrapper"), 0));
        assert!(!may_write_param(&program, f("reader"), 0));
        assert!(may_write_param(&program, f("opaque"), 0));
    }
}
