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

use mindad::{
    differentiate_source, Derivation, DiffError, DiffMode, DiffRequest, EngineConfig, Machine,
    PipelineError, Value,
};

const PROGRAMS: &[&str] = &[
    "fn f(x: f64, y: f64) -> f64 { let t: f64 = x + y; x = 3.0; return t + x; }",
    "fn f(x: f64, y: f64) -> f64 { let t: f64 = x * y; x = sin(x); t = t * x; return t; }",
    "fn f(x: f64, y: f64) -> f64 {
        let p: f64 = 1.0;
        for i in 0..3 { p = p * x + y; y = y * y; }
        return p;
    }",
    "fn f(x: f64, y: f64) -> f64 {
        let s: f64 = 0.0;
        while s < 4.0 { if x > y { s = s + x * x; } else { s = s + y; } x = x * 0.5; }
        return s * y;
    }",
];

fn derivation(src: &str, enable_tbr: bool) -> Derivation {
    let config = EngineConfig {
        enable_tbr,
        ..EngineConfig::default()
    };
    differentiate_source(src, &DiffRequest::new("f", DiffMode::Reverse), &config).expect("derive")
}

fn gradient(d: &Derivation, x: f64, y: f64) -> (f64, f64) {
    let mut m = Machine::new(&d.program);
    let dx = m.alloc_scalar(0.0);
    let dy = m.alloc_scalar(0.0);
    m.call("f_grad", &[Value::F64(x), Value::F64(y), dx.clone(), dy.clone()])
        .unwrap();
    (m.read_scalar(&dx).unwrap(), m.read_scalar(&dy).unwrap())
}

fn pushes(d: &Derivation) -> usize {
    d.to_source().matches("__push(").count()
}

#[test]
fn analysis_never_changes_gradients() {
    for src in PROGRAMS {
        let with = derivation(src, true);
        let without = derivation(src, false);
        for (x, y) in [(1.5, 0.5), (0.3, 0.9), (2.0, 1.1)] {
            let a = gradient(&with, x, y);
            let b = gradient(&without, x, y);
            assert_relative_eq!(a.0, b.0, epsilon = 1e-12);
            assert_relative_eq!(a.1, b.1, epsilon = 1e-12);
        }
    }
}

#[test]
fn analysis_never_records_more() {
    for src in PROGRAMS {
        assert!(pushes(&derivation(src, true)) <= pushes(&derivation(src, false)), "{src}");
    }
}

#[test]
fn linear_overwrites_need_no_tape() {
    let with = derivation(PROGRAMS[0], true);
    let without = derivation(PROGRAMS[0], false);
    assert_eq!(pushes(&with), 0, "{}", with.to_source());
    assert!(pushes(&without) > 0);
}

#[test]
fn pass_cap_comes_from_configuration() {
    let src = "fn f(x: f64) -> f64 {
        let p: f64 = 1.0;
        let q: f64 = 1.0;
        while p < 10.0 { q = q * p; p = p * x; }
        return q;
    }";
    let config = EngineConfig::from_toml_str("[engine]\nmax_tbr_passes = 1\n").unwrap();
    let err = differentiate_source(src, &DiffRequest::new("f", DiffMode::Reverse), &config)
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Diff(DiffError::AnalysisDidNotConverge { passes: 1, .. })
    ));
}
