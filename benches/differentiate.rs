use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mindad::{
    differentiate_source, parse_source, DiffMode, DiffRequest, EngineConfig, Machine, Value,
};

/// Polynomial evaluated with a loop
const HORNER: &str = r#"
fn horner(c: [f64], x: f64) -> f64 {
    let acc: f64 = 0.0;
    for i in 0..len(c) {
        acc = acc * x + c[i];
    }
    return acc;
}
"#;

/// Chain of helper calls
const CHAIN: &str = r#"
fn sq(x: f64) -> f64 { return x * x; }
fn act(x: f64) -> f64 { return tanh(x) + 0.1 * x; }
fn layer(x: f64, w: f64, b: f64) -> f64 { let z: f64 = w * x + b; return act(z); }
fn net(x: f64, w1: f64, w2: f64, w3: f64) -> f64 {
    let h1: f64 = layer(x, w1, 0.5);
    let h2: f64 = layer(h1, w2, -0.25);
    let h3: f64 = layer(h2, w3, 0.125);
    return sq(h3);
}
"#;

/// Branchy loop with overwrites
const BRANCHY: &str = r#"
fn branchy(x: f64, y: f64) -> f64 {
    let s: f64 = 0.0;
    for i in 0..16 {
        if x > y { s = s + x * y; x = x * 0.75; } else { s = s - y / x; y = y * 0.5; }
    }
    return s;
}
"#;

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation");

    let cases = [
        ("horner", HORNER, "horner"),
        ("chain", CHAIN, "net"),
        ("branchy", BRANCHY, "branchy"),
    ];
    for (name, source, func) in cases {
        for mode in [DiffMode::Forward, DiffMode::Reverse] {
            let request = match mode {
                DiffMode::Forward => DiffRequest::new(func, mode).with_args("x").expect("args"),
                _ => DiffRequest::new(func, mode),
            };
            let id = BenchmarkId::new(mode.to_string(), name);
            group.bench_with_input(id, &request, |b, request| {
                b.iter(|| {
                    differentiate_source(black_box(source), request, &EngineConfig::default())
                        .expect("differentiation failed")
                });
            });
        }
    }

    group.finish();
}

fn bench_tbr(c: &mut Criterion) {
    let mut group = c.benchmark_group("tbr");

    for enable_tbr in [true, false] {
        let config = EngineConfig {
            enable_tbr,
            ..EngineConfig::default()
        };
        let label = if enable_tbr { "on" } else { "off" };
        group.bench_function(BenchmarkId::new("branchy_grad", label), |b| {
            b.iter(|| {
                differentiate_source(
                    black_box(BRANCHY),
                    &DiffRequest::new("branchy", DiffMode::Reverse),
                    &config,
                )
                .expect("differentiation failed")
            });
        });
    }

    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");

    let derivation = differentiate_source(
        CHAIN,
        &DiffRequest::new("net", DiffMode::Reverse),
        &EngineConfig::default(),
    )
    .expect("differentiation failed");
    group.bench_function("net_grad", |b| {
        b.iter(|| {
            let mut m = Machine::new(&derivation.program);
            let mut args = vec![
                Value::F64(0.3),
                Value::F64(0.8),
                Value::F64(-1.2),
                Value::F64(0.6),
            ];
            for _ in 0..4 {
                args.push(m.alloc_scalar(0.0));
            }
            m.call("net_grad", black_box(&args)).expect("run failed")
        });
    });

    let program = parse_source(CHAIN).expect("parse failed");
    group.bench_function("net_primal", |b| {
        b.iter(|| {
            let mut m = Machine::new(&program);
            let args = [Value::F64(0.3), Value::F64(0.8), Value::F64(-1.2), Value::F64(0.6)];
            m.call("net", black_box(&args)).expect("run failed")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_generation, bench_tbr, bench_execution);
criterion_main!(benches);
