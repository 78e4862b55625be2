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

//! Closed-form partial derivatives of the builtin elementary functions.

use crate::ast::{BinOp, Expr};

fn call1(name: &str, x: &Expr) -> Expr {
    Expr::call(name, vec![x.clone()])
}

/// Partial derivative of builtin `name` with respect to each argument,
/// expressed over the argument expressions. `None` for unknown builtins or
/// a wrong argument count.
pub fn partials(name: &str, args: &[Expr]) -> Option<Vec<Expr>> {
    let one = || Expr::float(1.0);
    let p = match (name, args) {
        ("sin", [x]) => vec![call1("cos", x)],
        ("cos", [x]) => vec![Expr::neg(call1("sin", x))],
        ("tan", [x]) => vec![Expr::div(
            one(),
            Expr::mul(call1("cos", x), call1("cos", x)),
        )],
        ("exp", [x]) => vec![call1("exp", x)],
        ("log", [x]) => vec![Expr::div(one(), x.clone())],
        ("sqrt", [x]) => vec![Expr::div(Expr::float(0.5), call1("sqrt", x))],
        ("tanh", [x]) => vec![Expr::sub(
            one(),
            Expr::mul(call1("tanh", x), call1("tanh", x)),
        )],
        ("abs", [x]) => vec![Expr::cond(
            Expr::binary(BinOp::Ge, x.clone(), Expr::float(0.0)),
            one(),
            Expr::float(-1.0),
        )],
        ("pow", [x, y]) => {
            let dx = Expr::mul(
                y.clone(),
                Expr::call("pow", vec![x.clone(), Expr::sub(y.clone(), one())]),
            );
            // d/dy x^y = x^y ln x, only defined for positive bases.
            let dy = Expr::cond(
                Expr::binary(BinOp::Gt, x.clone(), Expr::float(0.0)),
                Expr::mul(Expr::call("pow", vec![x.clone(), y.clone()]), call1("log", x)),
                Expr::float(0.0),
            );
            vec![dx, dy]
        }
        ("len", [_]) => vec![Expr::float(0.0)],
        _ => return None,
    };
    Some(p)
}

/// Directional derivative of `name(args)` given argument derivatives.
pub fn pushforward(name: &str, args: &[Expr], dargs: &[Expr]) -> Option<Expr> {
    let partials = partials(name, args)?;
    let mut total = Expr::float(0.0);
    for (p, d) in partials.into_iter().zip(dargs) {
        // Skipping zero tangents keeps `pow(x, 2.0)` free of `log(x)`.
        if d.is_zero() {
            continue;
        }
        total = Expr::add(total, Expr::mul(d.clone(), p));
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elementary_partials() {
        let x = Expr::var("x");
        let p = partials("sin", &[x.clone()]).unwrap();
        assert_eq!(p[0].to_string(), "cos(x)");
        let p = partials("log", &[x.clone()]).unwrap();
        assert_eq!(p[0].to_string(), "1.0 / x");
        assert!(partials("sin", &[]).is_none());
        assert!(partials("frobnicate", &[x]).is_none());
    }

    #[test]
    fn constant_exponent_drops_log_term() {
        let d = pushforward(
            "pow",
            &[Expr::var("x"), Expr::float(2.0)],
            &[Expr::var("_d_x"), Expr::float(0.0)],
        )
        .unwrap();
        let text = d.to_string();
        assert!(text.contains("pow(x, 2.0 - 1.0)"), "{}", text);
        assert!(!text.contains("log"), "{}", text);
    }
}
