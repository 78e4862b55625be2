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

#![cfg(feature = "cli")]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

const SRC: &str = "fn g(x: f64) -> f64 { return x * x; }
fn f(x: f64, y: f64) -> f64 { let t: f64 = g(x) * y; y = 2.0; return t + y; }
";

fn mindad(dir: &Path, src: &str, args: &[&str]) -> Output {
    let input = dir.join("kernel.mind");
    fs::write(&input, src).expect("write source");
    Command::new(env!("CARGO_BIN_EXE_mindad"))
        .arg(&input)
        .args(args)
        .output()
        .expect("spawn mindad")
}

#[test]
fn prints_generated_functions() {
    let dir = tempdir().expect("tempdir");
    let output = mindad(dir.path(), SRC, &["--func", "f"]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("fn f_grad("), "{stdout}");
    assert!(stdout.contains("fn g_pullback("), "{stdout}");
    assert!(output.stderr.is_empty());
}

#[test]
fn forward_mode_with_selected_argument() {
    let dir = tempdir().expect("tempdir");
    let output = mindad(
        dir.path(),
        SRC,
        &["--func", "f", "--mode", "forward", "--args", "y"],
    );
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("fn f_darg1("), "{stdout}");
    assert!(stdout.contains("fn g_pushforward("), "{stdout}");
}

#[test]
fn verbose_notes_and_graph() {
    let dir = tempdir().expect("tempdir");
    let output = mindad(dir.path(), SRC, &["--func", "f", "--verbose", "--emit-graph"]);
    assert!(output.status.success(), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.lines().any(|l| l.starts_with("note: f: registered f_grad")), "{stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("f_grad <- reverse of f"), "{stdout}");
    assert!(stdout.contains("f_grad -> g_pullback"), "{stdout}");
}

#[test]
fn configuration_file_disables_the_analysis() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("engine.toml");
    fs::write(&config, "[engine]\nenable_tbr = false\n").expect("write config");
    let config = config.to_string_lossy().into_owned();

    let plain = mindad(dir.path(), SRC, &["--func", "f"]);
    let taped = mindad(dir.path(), SRC, &["--func", "f", "--config", &config]);
    assert!(taped.status.success(), "{taped:?}");
    let count = |o: &Output| String::from_utf8_lossy(&o.stdout).matches("__push(").count();
    assert!(count(&taped) > count(&plain));
}

#[test]
fn invalid_configuration_is_reported() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("engine.toml");
    fs::write(&config, "[engine]\nmax_tbr_passes = 0\n").expect("write config");
    let output = mindad(
        dir.path(),
        SRC,
        &["--func", "f", "--config", &config.to_string_lossy()],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("max_tbr_passes"), "{stderr}");
}

#[test]
fn unknown_mode_fails() {
    let dir = tempdir().expect("tempdir");
    let output = mindad(dir.path(), SRC, &["--func", "f", "--mode", "sideways"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("error"), "{stderr}");
    assert!(stderr.contains("sideways"), "{stderr}");
}

#[test]
fn parse_errors_point_at_the_source() {
    let dir = tempdir().expect("tempdir");
    let output = mindad(dir.path(), "fn f(x: f64) -> f64 { return x +; }\n", &["--func", "f"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains('^'), "{stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn unsupported_constructs_name_the_function() {
    let dir = tempdir().expect("tempdir");
    let src = "fn g(x: f64) -> f64 { return x; }
fn f(x: f64) -> f64 { while g(x) < 3.0 { x = x * 2.0; } return x; }
";
    let output = mindad(dir.path(), src, &["--func", "f"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot differentiate 'f'"), "{stderr}");
    assert!(stderr.contains("loop condition"), "{stderr}");
}
