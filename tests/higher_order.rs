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

use approx::assert_relative_eq;

use mindad::ast::Program;
use mindad::{differentiate_source, DiffMode, DiffRequest, EngineConfig, Machine, Value};

fn derive(src: &str, request: DiffRequest) -> Program {
    differentiate_source(src, &request, &EngineConfig::default())
        .expect("derive")
        .program
}

fn assert_all_close(got: &[f64], want: &[f64]) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want) {
        assert_relative_eq!(*g, *w, epsilon = 1e-9);
    }
}

#[test]
fn hessian_over_array_range_and_scalar() {
    let src = "fn f(a: [f64], x: f64) -> f64 { return a[0] * a[1] * x + x * x; }";
    let p = derive(
        src,
        DiffRequest::new("f", DiffMode::Hessian)
            .with_args("a[0:2], x")
            .unwrap(),
    );
    let mut m = Machine::new(&p);
    let a = m.alloc_array(&[2.0, 3.0]);
    let h = m.alloc_array(&[0.0; 9]);
    m.call("f_hessian", &[a.clone(), Value::F64(5.0), h.clone()])
        .unwrap();
    #[rustfmt::skip]
    let want = [
        0.0, 5.0, 3.0,
        5.0, 0.0, 2.0,
        3.0, 2.0, 2.0,
    ];
    assert_all_close(&m.read_array(&h).unwrap(), &want);
    assert_eq!(m.read_array(&a).unwrap(), vec![2.0, 3.0]);
}

#[test]
fn hessian_is_symmetric_through_nested_calls() {
    let src = "fn g(u: f64, v: f64) -> f64 { return sin(u) * exp(v); }
        fn f(x: f64, y: f64) -> f64 { let t: f64 = g(x * y, y); return t + x * x * x; }";
    let p = derive(src, DiffRequest::new("f", DiffMode::Hessian));
    let mut m = Machine::new(&p);
    let h = m.alloc_array(&[0.0; 4]);
    m.call("f_hessian", &[Value::F64(0.4), Value::F64(0.7), h.clone()])
        .unwrap();
    let h = m.read_array(&h).unwrap();
    assert_relative_eq!(h[1], h[2], epsilon = 1e-10);

    // f = sin(xy) e^y + x^3
    let (x, y) = (0.4_f64, 0.7_f64);
    let (s, c, e) = ((x * y).sin(), (x * y).cos(), y.exp());
    let hxx = -y * y * s * e + 6.0 * x;
    let hxy = (c - x * y * s) * e + y * c * e;
    let hyy = -x * x * s * e + 2.0 * x * c * e + s * e;
    assert_all_close(&h, &[hxx, hxy, hxy, hyy]);
}

#[test]
fn hessian_diagonal_over_array_elements() {
    let p = derive(
        "fn f(a: [f64]) -> f64 { return a[0] * a[0] * a[1]; }",
        DiffRequest::new("f", DiffMode::HessianDiagonal)
            .with_args("a[0:2]")
            .unwrap(),
    );
    let mut m = Machine::new(&p);
    let a = m.alloc_array(&[3.0, 4.0]);
    let d = m.alloc_array(&[0.0; 2]);
    m.call("f_hessian_diagonal", &[a, d.clone()]).unwrap();
    assert_all_close(&m.read_array(&d).unwrap(), &[8.0, 0.0]);
}

#[test]
fn jacobian_over_mixed_inputs() {
    let src = "fn g(x: f64, a: [f64], out: [f64]) {
        out[0] = x * a[0];
        out[1] = a[1] * a[1] + x;
    }";
    let p = derive(
        src,
        DiffRequest::new("g", DiffMode::Jacobian)
            .with_args("x, a[0:2]")
            .unwrap(),
    );
    let mut m = Machine::new(&p);
    let a = m.alloc_array(&[3.0, 4.0]);
    let out = m.alloc_array(&[0.0; 2]);
    let jac = m.alloc_array(&[0.0; 6]);
    m.call("g_jac", &[Value::F64(2.0), a.clone(), out.clone(), jac.clone()])
        .unwrap();
    #[rustfmt::skip]
    let want = [
        3.0, 2.0, 0.0,
        1.0, 0.0, 8.0,
    ];
    assert_all_close(&m.read_array(&jac).unwrap(), &want);
    assert_eq!(m.read_array(&out).unwrap(), vec![6.0, 18.0]);
    assert_eq!(m.read_array(&a).unwrap(), vec![3.0, 4.0]);
}

#[test]
fn jacobian_matches_finite_differences() {
    let src = "fn g(x: f64, y: f64, out: [f64]) {
        out[0] = sin(x) * y;
        out[1] = exp(x * y);
        out[2] = x / y;
    }";
    let p = derive(src, DiffRequest::new("g", DiffMode::Jacobian));
    let mut m = Machine::new(&p);
    let (x, y) = (0.3, 1.2);
    let out = m.alloc_array(&[0.0; 3]);
    let jac = m.alloc_array(&[0.0; 6]);
    m.call("g_jac", &[Value::F64(x), Value::F64(y), out, jac.clone()])
        .unwrap();
    let jac = m.read_array(&jac).unwrap();

    let h = 1e-6;
    let mut eval = |x: f64, y: f64| {
        let out = m.alloc_array(&[0.0; 3]);
        m.call("g", &[Value::F64(x), Value::F64(y), out.clone()]).unwrap();
        m.read_array(&out).unwrap()
    };
    let (xp, xm) = (eval(x + h, y), eval(x - h, y));
    let (yp, ym) = (eval(x, y + h), eval(x, y - h));
    for row in 0..3 {
        let dx = (xp[row] - xm[row]) / (2.0 * h);
        let dy = (yp[row] - ym[row]) / (2.0 * h);
        assert_relative_eq!(jac[row * 2], dx, epsilon = 1e-6);
        assert_relative_eq!(jac[row * 2 + 1], dy, epsilon = 1e-6);
    }
}
