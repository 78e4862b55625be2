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

//! Source-to-source differentiation.
//!
//! [`DerivativeBuilder`] schedules requests and owns the program the
//! generated functions are added to. The transformations live in
//! [`forward`], [`reverse`], [`hessian`] and [`jacobian`].

pub mod builder;
pub mod error;
pub mod error_estimate;
pub mod exits;
pub mod forward;
pub mod graph;
pub mod hessian;
pub mod jacobian;
pub mod registry;
pub mod request;
pub mod reverse;
pub mod rules;

use std::collections::HashSet;

use crate::ast::{BinOp, Expr, Function};

pub use builder::{DerivativeBuilder, Note};
pub use error::DiffError;
pub use error_estimate::{ErrorModel, TaylorApprox};
pub use graph::{NodeState, RequestEdge, RequestGraph, RequestNode};
pub use request::{DiffMode, DiffRequest, IndepSpec, IndepVar, Selector};

/// A generated derivative and its optional all-parameter overload.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeResult {
    pub primary: Function,
    pub overload: Option<Function>,
}

impl DerivativeResult {
    pub fn name(&self) -> String {
        self.primary.qualified_name()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        std::iter::once(&self.primary).chain(self.overload.iter())
    }
}

/// Generator of identifiers that do not collide with any name in use.
#[derive(Debug, Clone, Default)]
pub struct NameGen {
    used: HashSet<String>,
}

impl NameGen {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameGen {
            used: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reserve(&mut self, name: &str) {
        self.used.insert(name.to_string());
    }

    pub fn is_used(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    /// `base` when free, otherwise `base0`, `base1`, ...
    pub fn fresh(&mut self, base: &str) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        self.numbered(base)
    }

    /// Always suffixed: `prefix0`, `prefix1`, ...
    pub fn numbered(&mut self, prefix: &str) -> String {
        let mut i = 0usize;
        loop {
            let candidate = format!("{}{}", prefix, i);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Derivative companion of `var`, e.g. `_d_x`.
    pub fn shadow(&mut self, var: &str) -> String {
        self.fresh(&format!("_d_{}", var))
    }
}

/// Integer `a + b` for index arithmetic. Unlike [`Expr::add`] it never
/// produces a float literal.
pub(crate) fn iadd(a: Expr, b: Expr) -> Expr {
    if a.is_zero() {
        return b;
    }
    if b.is_zero() {
        return a;
    }
    Expr::binary(BinOp::Add, a, b)
}

pub(crate) fn isub(a: Expr, b: Expr) -> Expr {
    if b.is_zero() {
        return a;
    }
    Expr::binary(BinOp::Sub, a, b)
}

pub(crate) fn imul(a: Expr, b: Expr) -> Expr {
    if a.is_zero() || b.is_zero() {
        return Expr::int(0);
    }
    if a.is_one() {
        return b;
    }
    if b.is_one() {
        return a;
    }
    Expr::binary(BinOp::Mul, a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic_stays_integral() {
        assert_eq!(imul(Expr::int(0), Expr::var("n")), Expr::int(0));
        assert_eq!(iadd(Expr::int(0), Expr::var("k")).to_string(), "k");
        assert_eq!(
            iadd(imul(Expr::var("i"), Expr::var("_n")), Expr::var("_k")).to_string(),
            "i * _n + _k"
        );
    }

    #[test]
    fn fresh_names_avoid_collisions() {
        let mut names = NameGen::new(["x", "_d_x"]);
        assert_eq!(names.shadow("x"), "_d_x0");
        assert_eq!(names.shadow("_d_x"), "_d__d_x");
        assert_eq!(names.numbered("_t"), "_t0");
        assert_eq!(names.numbered("_t"), "_t1");
        assert_eq!(names.fresh("y"), "y");
        assert_eq!(names.fresh("y"), "y0");
    }
}
