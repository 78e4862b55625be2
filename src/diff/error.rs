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

use crate::ast::Span;
use crate::diagnostics::Diagnostic;

/// Errors that abort a single differentiation request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    /// The target has no body and is neither generated nor a custom derivative.
    #[error("no definition found for '{function}'")]
    NoDefinition { function: String, span: Option<Span> },
    /// The function carries `#[non_differentiable]`.
    #[error("'{function}' is marked non-differentiable")]
    NonDifferentiable { function: String, span: Option<Span> },
    /// The method's enclosing struct carries `#[non_differentiable]`.
    #[error("'{function}' belongs to non-differentiable type '{ty}'")]
    NonDifferentiableType {
        function: String,
        ty: String,
        span: Option<Span>,
    },
    #[error("cannot differentiate '{function}': {construct} is not supported")]
    UnsupportedConstruct {
        function: String,
        construct: String,
        span: Option<Span>,
    },
    #[error("call to '{callee}' in '{function}' is ambiguous: {candidates} candidates match")]
    AmbiguousOverload {
        function: String,
        callee: String,
        candidates: usize,
        span: Option<Span>,
    },
    #[error("invalid differentiation request for '{function}': {reason}")]
    InvalidRequest {
        function: String,
        reason: String,
        span: Option<Span>,
    },
    #[error(
        "to-be-recorded analysis of '{function}' did not converge within {passes} passes per block"
    )]
    AnalysisDidNotConverge { function: String, passes: usize },
}

impl DiffError {
    pub fn unsupported(function: &str, construct: impl Into<String>, span: Span) -> Self {
        DiffError::UnsupportedConstruct {
            function: function.to_string(),
            construct: construct.into(),
            span: Some(span),
        }
    }

    pub fn invalid(function: &str, reason: impl Into<String>) -> Self {
        DiffError::InvalidRequest {
            function: function.to_string(),
            reason: reason.into(),
            span: None,
        }
    }

    /// Name of the function whose derivation failed.
    pub fn function(&self) -> &str {
        match self {
            DiffError::NoDefinition { function, .. }
            | DiffError::NonDifferentiable { function, .. }
            | DiffError::NonDifferentiableType { function, .. }
            | DiffError::UnsupportedConstruct { function, .. }
            | DiffError::AmbiguousOverload { function, .. }
            | DiffError::InvalidRequest { function, .. }
            | DiffError::AnalysisDidNotConverge { function, .. } => function,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            DiffError::NoDefinition { span, .. }
            | DiffError::NonDifferentiable { span, .. }
            | DiffError::NonDifferentiableType { span, .. }
            | DiffError::UnsupportedConstruct { span, .. }
            | DiffError::AmbiguousOverload { span, .. }
            | DiffError::InvalidRequest { span, .. } => *span,
            DiffError::AnalysisDidNotConverge { .. } => None,
        }
    }

    pub fn to_diagnostic(&self, src: &str) -> Diagnostic {
        Diagnostic::new(src, self.to_string(), self.span())
            .with_note(format!("while differentiating '{}'", self.function()))
    }
}
