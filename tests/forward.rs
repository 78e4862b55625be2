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

fn forward(func: &str, args: &str) -> DiffRequest {
    DiffRequest::new(func, DiffMode::Forward).with_args(args).unwrap()
}

fn scalar(m: &mut Machine<'_>, name: &str, args: &[f64]) -> f64 {
    let args: Vec<Value> = args.iter().map(|v| Value::F64(*v)).collect();
    m.call(name, &args).unwrap().as_f64().unwrap()
}

/// Central difference of `name` in argument `k`.
fn central_difference(m: &mut Machine<'_>, name: &str, args: &[f64], k: usize) -> f64 {
    let h = 1e-6;
    let mut hi = args.to_vec();
    let mut lo = args.to_vec();
    hi[k] += h;
    lo[k] -= h;
    (scalar(m, name, &hi) - scalar(m, name, &lo)) / (2.0 * h)
}

#[test]
fn array_element_product() {
    let p = derive(
        "fn multiply(arr: [f64]) -> f64 { return arr[0] * arr[1]; }",
        forward("multiply", "arr[1]"),
    );
    let mut m = Machine::new(&p);
    let arr = m.alloc_array(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    let got = m.call("multiply_darg0_1", &[arr]).unwrap();
    assert_eq!(format!("{:.2}", got.as_f64().unwrap()), "1.00");
}

#[test]
fn array_element_quotient() {
    let p = derive(
        "fn divide(arr: [f64]) -> f64 { return arr[0] / arr[1]; }",
        forward("divide", "arr[1]"),
    );
    let mut m = Machine::new(&p);
    let arr = m.alloc_array(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    let got = m.call("divide_darg0_1", &[arr]).unwrap().as_f64().unwrap();
    assert_eq!(format!("{:.2}", got), "-0.25");
}

#[test]
fn array_input_modified_in_place() {
    let src = "fn modifyArr(arr: [f64], x: f64) -> f64 {
        arr[3] *= x;
        for i in 0..5 { arr[i] /= 2.0; }
        return arr[3];
    }";
    let p = derive(src, forward("modifyArr", "x"));
    let mut m = Machine::new(&p);
    let arr = m.alloc_array(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    let got = m
        .call("modifyArr_darg1", &[arr.clone(), Value::F64(2.0)])
        .unwrap()
        .as_f64()
        .unwrap();
    assert_eq!(format!("{:.2}", got), "2.00");
    // The derivative runs the primal statements on the caller's array.
    assert_eq!(m.read_array(&arr).unwrap(), vec![0.5, 1.0, 1.5, 4.0, 2.5]);
}

#[test]
fn builtins_match_finite_differences() {
    let cases = [
        ("fn f(x: f64) -> f64 { return sin(x) * exp(x); }", 0.4),
        ("fn f(x: f64) -> f64 { return log(x) / sqrt(x); }", 1.7),
        ("fn f(x: f64) -> f64 { return tanh(x) - cos(x) * tan(x); }", 0.3),
        ("fn f(x: f64) -> f64 { return pow(x, 3.0) + pow(2.0, x); }", 1.1),
        ("fn f(x: f64) -> f64 { return abs(x - 2.0) * x; }", 0.5),
    ];
    for (src, x) in cases {
        let p = derive(src, DiffRequest::new("f", DiffMode::Forward));
        let mut m = Machine::new(&p);
        let got = scalar(&mut m, "f_darg0", &[x]);
        let want = central_difference(&mut m, "f", &[x], 0);
        assert_relative_eq!(got, want, epsilon = 1e-6, max_relative = 1e-6);
    }
}

#[test]
fn control_flow_matches_finite_differences() {
    let src = "fn f(x: f64, y: f64) -> f64 {
        let acc: f64 = 0.0;
        let k: i64 = 0;
        while k < 4 {
            if x > y { acc = acc + x * y; } else { acc = acc - y / x; }
            x = x * 0.9;
            k = k + 1;
        }
        return acc + (x > 1.0 ? x * x : y);
    }";
    for (arg, k) in [("x", 0), ("y", 1)] {
        let p = derive(src, forward("f", arg));
        let mut m = Machine::new(&p);
        let name = format!("f_darg{}", k);
        let got = scalar(&mut m, &name, &[1.3, 0.8]);
        let want = central_difference(&mut m, "f", &[1.3, 0.8], k);
        assert_relative_eq!(got, want, epsilon = 1e-6, max_relative = 1e-6);
    }
}

#[test]
fn struct_fields_carry_tangents() {
    let src = "struct P { a: f64, b: f64 }
        fn norm2(p: P) -> f64 { return p.a * p.a + p.b * p.b; }
        fn f(x: f64) -> f64 { let p: P = P { a: x, b: 3.0 * x }; return norm2(p); }";
    let p = derive(src, DiffRequest::new("f", DiffMode::Forward));
    let mut m = Machine::new(&p);
    // f(x) = 10 x^2
    assert_relative_eq!(scalar(&mut m, "f_darg0", &[1.5]), 30.0, epsilon = 1e-12);
}

#[test]
fn vector_pushforward_propagates_every_lane() {
    let src = "fn f(x: f64, y: f64) -> f64 { return x * y + sin(x); }";
    let p = derive(src, DiffRequest::new("f", DiffMode::VectorPushforward));
    let mut m = Machine::new(&p);
    let dx = m.alloc_array(&[1.0, 0.0]);
    let dy = m.alloc_array(&[0.0, 1.0]);
    let dret = m.alloc_array(&[0.0, 0.0]);
    let (x, y) = (0.5_f64, 2.0_f64);
    let v = m
        .call(
            "f_vector_pushforward",
            &[Value::F64(x), Value::F64(y), Value::I64(2), dx, dy, dret.clone()],
        )
        .unwrap()
        .as_f64()
        .unwrap();
    assert_relative_eq!(v, x * y + x.sin(), epsilon = 1e-12);
    let lanes = m.read_array(&dret).unwrap();
    assert_relative_eq!(lanes[0], y + x.cos(), epsilon = 1e-12);
    assert_relative_eq!(lanes[1], x, epsilon = 1e-12);
}

#[test]
fn custom_pushforward_replaces_generated_code() {
    let src = "fn g(x: f64) -> f64 { return x * x; }
        fn f(x: f64) -> f64 { return g(x) + x; }
        mod custom_derivatives {
            fn g_pushforward(x: f64, dx: f64, dret: &f64) -> f64 {
                dret = 100.0 * dx;
                return x * x;
            }
        }";
    let p = derive(src, DiffRequest::new("f", DiffMode::Forward));
    let generated = p.functions.iter().filter(|f| f.name == "g_pushforward").count();
    assert_eq!(generated, 1, "only the user-supplied pushforward exists");
    let mut m = Machine::new(&p);
    assert_relative_eq!(scalar(&mut m, "f_darg0", &[3.0]), 101.0, epsilon = 1e-12);
}

#[test]
fn custom_constructor_pushforward_is_used() {
    let src = "struct P { a: f64, b: f64 }
        fn f(x: f64) -> f64 { let p: P = P { a: x, b: 2.0 * x }; return p.a + p.b; }
        mod custom_derivatives {
            fn constructor_pushforward(t: tag<P>, a: f64, b: f64, da: f64, db: f64, dp: &P) -> P {
                dp.a = 10.0 * da;
                dp.b = 10.0 * db;
                return P { a: a, b: b };
            }
        }";
    let p = derive(src, DiffRequest::new("f", DiffMode::Forward));
    let mut m = Machine::new(&p);
    assert_relative_eq!(scalar(&mut m, "f_darg0", &[1.5]), 30.0, epsilon = 1e-12);
}
