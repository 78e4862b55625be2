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

use mindad::diff::NodeState;
use mindad::{
    parse_source, DerivativeBuilder, DiffError, DiffMode, DiffRequest, EngineConfig, Machine,
    Value,
};

fn builder(src: &str) -> DerivativeBuilder {
    DerivativeBuilder::new(parse_source(src).unwrap(), EngineConfig::default())
}

const CHAIN: &str = "fn g(x: f64) -> f64 { return x * x; }
    fn h(x: f64) -> f64 { return g(x) * 3.0; }
    fn f(x: f64) -> f64 { return g(x) + h(x); }";

#[test]
fn repeated_requests_are_memoized() {
    let mut b = builder(CHAIN);
    let first = b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap();
    let count = b.program().functions.len();
    let second = b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap();
    assert_eq!(first, second);
    assert_eq!(b.program().functions.len(), count);
    // g is needed by both f and h but generated once.
    assert_eq!(b.program().functions_named("g_pullback").count(), 1);
}

#[test]
fn memo_hits_are_recorded_as_edges() {
    let mut b = builder(CHAIN);
    b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap();
    let graph = b.graph();
    assert!(graph.edges().iter().any(|e| e.already_derived));
    assert!(graph.nodes().iter().all(|n| n.state == NodeState::Derived));
    let text = graph.to_string();
    assert!(text.contains("f_grad"), "{text}");
    assert!(text.contains("(already derived)"), "{text}");
}

#[test]
fn order_does_not_split_the_memo() {
    let mut b = builder("fn f(x: f64, y: f64) -> f64 { return x * y; }");
    let one = b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap();
    let count = b.program().functions.len();
    let two = b
        .derive(&DiffRequest::new("f", DiffMode::Reverse).with_order(2))
        .unwrap();
    assert_eq!(one.name(), two.name());
    assert_eq!(b.program().functions.len(), count);
}

#[test]
fn recursive_functions_call_their_own_derivative() {
    let src = "fn pw(x: f64, n: i64) -> f64 {
        let r: f64 = 1.0;
        if n > 0 { r = x * pw(x, n - 1); }
        return r;
    }";
    let mut b = builder(src);
    b.derive(&DiffRequest::new("pw", DiffMode::Forward).with_args("x").unwrap())
        .unwrap();
    b.derive(&DiffRequest::new("pw", DiffMode::Reverse)).unwrap();
    let recursive = b
        .graph()
        .nodes()
        .iter()
        .enumerate()
        .filter(|(id, _)| b.graph().is_recursive(*id))
        .count();
    assert!(recursive >= 1);

    let p = b.into_program();
    let mut m = Machine::new(&p);
    let d = m
        .call("pw_darg0", &[Value::F64(1.5), Value::I64(4)])
        .unwrap()
        .as_f64()
        .unwrap();
    assert_relative_eq!(d, 4.0 * 1.5_f64.powi(3), epsilon = 1e-12);

    let dx = m.alloc_scalar(0.0);
    m.call("pw_grad", &[Value::F64(1.5), Value::I64(4), dx.clone()])
        .unwrap();
    assert_relative_eq!(m.read_scalar(&dx).unwrap(), 4.0 * 1.5_f64.powi(3), epsilon = 1e-12);
}

#[test]
fn failed_requests_roll_back() {
    let src = "fn h(x: f64) -> f64 { return x; }
        fn bad(x: f64) -> f64 { while h(x) < 1.0 { x = x + 1.0; } return x; }
        fn f(x: f64) -> f64 { let y: f64 = x * x; return bad(y) + y; }
        fn ok(x: f64) -> f64 { return x * x; }";
    let mut b = builder(src);
    let before = b.program().functions.len();
    let err = b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap_err();
    assert!(matches!(err, DiffError::UnsupportedConstruct { .. }), "{err}");
    assert_eq!(b.program().functions.len(), before);
    assert!(b.graph().nodes().iter().any(|n| n.state == NodeState::Failed));

    let result = b.derive(&DiffRequest::new("ok", DiffMode::Reverse)).unwrap();
    assert_eq!(result.name(), "ok_grad");
    assert_eq!(b.program().functions.len(), before + 1);
}

#[test]
fn non_differentiable_targets_are_refused() {
    let src = "#[non_differentiable] fn f(x: f64) -> f64 { return x; }
        #[non_differentiable] struct Counter { n: f64 }
        impl Counter { fn get(c: Counter) -> f64 { return c.n; } }";
    let mut b = builder(src);
    let err = b.derive(&DiffRequest::new("f", DiffMode::Forward)).unwrap_err();
    assert!(matches!(err, DiffError::NonDifferentiable { .. }));
    let err = b
        .derive(&DiffRequest::new("Counter::get", DiffMode::Reverse))
        .unwrap_err();
    assert!(matches!(err, DiffError::NonDifferentiableType { ref ty, .. } if ty == "Counter"));
}

#[test]
fn overloads_are_told_apart_by_arity() {
    let src = "fn f(x: f64) -> f64 { return x * x; }
        fn f(x: f64, y: f64) -> f64 { return x * y; }";
    let mut b = builder(src);
    let err = b.derive(&DiffRequest::new("f", DiffMode::Forward)).unwrap_err();
    assert!(matches!(err, DiffError::AmbiguousOverload { candidates: 2, .. }));
    let r = b
        .derive(&DiffRequest::new("f", DiffMode::Reverse).with_arity(2))
        .unwrap();
    assert_eq!(r.primary.params.len(), 4);
}

#[test]
fn declarations_can_be_requested_without_bodies() {
    let mut b = builder("fn ext(x: f64) -> f64;");
    let r = b
        .derive(&DiffRequest::new("ext", DiffMode::Pushforward).declaration_only())
        .unwrap();
    assert!(r.primary.is_declaration());
    let err = b.derive(&DiffRequest::new("ext", DiffMode::Reverse)).unwrap_err();
    assert!(matches!(err, DiffError::NoDefinition { .. }));
}

#[test]
fn verbose_notes_trace_the_request() {
    let config = EngineConfig {
        verbose: true,
        ..EngineConfig::default()
    };
    let mut b = DerivativeBuilder::new(parse_source(CHAIN).unwrap(), config);
    b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap();
    let notes: Vec<String> = b.take_notes().iter().map(|n| n.to_string()).collect();
    assert!(notes.iter().any(|n| n.contains("g_pullback already scheduled")), "{notes:?}");
    assert!(notes.iter().any(|n| n.starts_with("f: registered f_grad")), "{notes:?}");
    assert!(b.notes().is_empty());
}
