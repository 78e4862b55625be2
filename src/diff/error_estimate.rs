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

//! Floating-point error models for error-estimation mode.

use std::fmt;
use std::rc::Rc;

use crate::ast::Expr;

/// Unit roundoff of `f64` (2^-53).
pub const F64_UNIT_ROUNDOFF: f64 = 1.1102230246251565e-16;

/// Contribution of one floating-point assignment to the total error.
pub trait ErrorModel: fmt::Debug {
    fn name(&self) -> &str;

    /// Error term for a value whose adjoint is `adjoint`.
    fn term(&self, adjoint: Expr, value: Expr) -> Expr;
}

/// First-order Taylor model: `|adjoint * value * eps|`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaylorApprox;

impl ErrorModel for TaylorApprox {
    fn name(&self) -> &str {
        "taylor"
    }

    fn term(&self, adjoint: Expr, value: Expr) -> Expr {
        let product = Expr::mul(Expr::mul(adjoint, value), Expr::float(F64_UNIT_ROUNDOFF));
        Expr::call("abs", vec![product])
    }
}

#[derive(Debug)]
struct Handler {
    function: String,
    model: Rc<dyn ErrorModel>,
}

/// Paired stacks of active estimation handlers and available models.
///
/// A model pushed by the user waits for the next request. When a request
/// starts without a waiting model the default one is pushed, and the
/// request's model is popped with its handler when it ends.
#[derive(Debug, Default)]
pub struct ErrorEstimationStack {
    handlers: Vec<Handler>,
    models: Vec<Rc<dyn ErrorModel>>,
}

impl ErrorEstimationStack {
    pub fn push_model(&mut self, model: Box<dyn ErrorModel>) {
        self.models.push(Rc::from(model));
    }

    /// Open a handler for `function` and return its model.
    pub fn begin(&mut self, function: &str) -> Rc<dyn ErrorModel> {
        if self.models.len() <= self.handlers.len() {
            self.models.push(Rc::new(TaylorApprox));
        }
        let model = Rc::clone(&self.models[self.models.len() - 1]);
        self.handlers.push(Handler {
            function: function.to_string(),
            model: Rc::clone(&model),
        });
        model
    }

    /// Close the innermost handler and drop its model.
    pub fn end(&mut self) -> Option<String> {
        let handler = self.handlers.pop()?;
        self.models.pop();
        Some(handler.function)
    }

    /// Model of the innermost active handler.
    pub fn current(&self) -> Option<Rc<dyn ErrorModel>> {
        self.handlers.last().map(|h| Rc::clone(&h.model))
    }

    pub fn depth(&self) -> usize {
        self.handlers.len()
    }

    /// Models waiting beyond the active handlers.
    pub fn waiting_models(&self) -> usize {
        self.models.len().saturating_sub(self.handlers.len())
    }
}
