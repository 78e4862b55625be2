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

//! High-level entry points: parse a source file, check it, and derive one
//! request against it.

use crate::ast::{Function, Program};
use crate::config::{ConfigError, EngineConfig};
use crate::diagnostics::{self, Diagnostic};
use crate::diff::{DerivativeBuilder, DerivativeResult, DiffError, DiffRequest, Note, RequestGraph};
use crate::eval::EvalError;
use crate::lexer;
use crate::parser;

/// Errors surfaced by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Parsing failed with one or more diagnostics.
    #[error("parse error")]
    Parse(Vec<Diagnostic>),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Render the error against `src` the way the CLI prints it.
    pub fn render(&self, src: &str) -> String {
        match self {
            PipelineError::Parse(diags) => diags
                .iter()
                .map(|d| diagnostics::render(src, d))
                .collect::<Vec<_>>()
                .join("\n"),
            PipelineError::Diff(err) => diagnostics::render(src, &err.to_diagnostic(src)),
            other => format!("error: {}", other),
        }
    }
}

/// Artifacts produced by [`differentiate_source`].
#[derive(Debug, Clone)]
pub struct Derivation {
    /// The input program with every generated function appended.
    pub program: Program,
    pub result: DerivativeResult,
    /// Functions added to the program, nested derivatives included, in
    /// registration order.
    pub generated: Vec<Function>,
    pub graph: RequestGraph,
    pub notes: Vec<Note>,
}

impl Derivation {
    /// Generated functions in source syntax.
    pub fn to_source(&self) -> String {
        self.generated
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse user source. Identifiers starting with `_` are reserved for
/// generated code.
pub fn parse_source(src: &str) -> Result<Program, PipelineError> {
    let reserved: Vec<Diagnostic> = lexer::reserved_identifiers(src)
        .into_iter()
        .map(|(name, span)| {
            Diagnostic::new(
                src,
                format!("identifier '{}' is reserved for generated code", name),
                Some(span),
            )
        })
        .collect();
    if !reserved.is_empty() {
        return Err(PipelineError::Parse(reserved));
    }
    parser::parse_with_diagnostics(src).map_err(PipelineError::Parse)
}

/// Parse `src` and derive `request` against it.
pub fn differentiate_source(
    src: &str,
    request: &DiffRequest,
    config: &EngineConfig,
) -> Result<Derivation, PipelineError> {
    let program = parse_source(src)?;
    let original = program.functions.len();
    let mut builder = DerivativeBuilder::new(program, config.clone());
    let result = builder.derive(request)?;
    let notes = builder.take_notes();
    let graph = builder.graph().clone();
    let program = builder.into_program();
    let generated = program.functions[original..].to_vec();
    Ok(Derivation {
        program,
        result,
        generated,
        graph,
        notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffMode;

    #[test]
    fn reserved_names_are_rejected() {
        let err = parse_source("fn f(_x: f64) -> f64 { return _x; }").unwrap_err();
        match err {
            PipelineError::Parse(diags) => assert_eq!(diags.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn generated_functions_are_listed() {
        let src = "fn g(x: f64) -> f64 { return x * x; }\nfn f(x: f64) -> f64 { return g(x) + x; }";
        let d = differentiate_source(
            src,
            &DiffRequest::new("f", DiffMode::Reverse),
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(d.result.name(), "f_grad");
        let names: Vec<&str> = d.generated.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"f_grad"));
        assert!(names.contains(&"g_pullback"));
        assert!(d.to_source().contains("fn g_pullback("));
    }

    #[test]
    fn differentiation_errors_render_with_carets() {
        let src = concat!(
            "fn g(x: f64) -> f64 { return x; }\n",
            "fn f(x: f64) -> f64 {\n",
            "    while g(x) < 1.0 { x = x + 1.0; }\n",
            "    return x;\n",
            "}",
        );
        let err = differentiate_source(
            src,
            &DiffRequest::new("f", DiffMode::Reverse),
            &EngineConfig::default(),
        )
        .unwrap_err();
        let text = err.render(src);
        assert!(text.contains("loop condition"), "{text}");
        assert!(text.contains("line 3"), "{text}");
    }
}
