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

//! Differentiation requests, independent-variable selection and naming.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::ast::{Function, Program, Type};
use crate::types::is_differentiable;

use super::DiffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Forward,
    Pushforward,
    VectorForward,
    VectorPushforward,
    Reverse,
    Pullback,
    ReverseForwardPass,
    Hessian,
    HessianDiagonal,
    Jacobian,
    ErrorEstimation,
}

impl DiffMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffMode::Forward => "forward",
            DiffMode::Pushforward => "pushforward",
            DiffMode::VectorForward => "vector",
            DiffMode::VectorPushforward => "vector_pushforward",
            DiffMode::Reverse => "reverse",
            DiffMode::Pullback => "pullback",
            DiffMode::ReverseForwardPass => "reverse_forw",
            DiffMode::Hessian => "hessian",
            DiffMode::HessianDiagonal => "hessian_diagonal",
            DiffMode::Jacobian => "jacobian",
            DiffMode::ErrorEstimation => "error",
        }
    }

    /// Modes whose independent set is always every differentiable parameter.
    pub fn covers_all_params(self) -> bool {
        matches!(
            self,
            DiffMode::Pushforward
                | DiffMode::VectorPushforward
                | DiffMode::Pullback
                | DiffMode::ReverseForwardPass
        )
    }
}

impl fmt::Display for DiffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiffMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "forward" | "diff" => DiffMode::Forward,
            "pushforward" => DiffMode::Pushforward,
            "vector" | "vector_forward" => DiffMode::VectorForward,
            "vector_pushforward" => DiffMode::VectorPushforward,
            "reverse" | "gradient" => DiffMode::Reverse,
            "pullback" => DiffMode::Pullback,
            "reverse_forw" => DiffMode::ReverseForwardPass,
            "hessian" => DiffMode::Hessian,
            "hessian_diagonal" => DiffMode::HessianDiagonal,
            "jacobian" => DiffMode::Jacobian,
            "error" | "error_estimation" => DiffMode::ErrorEstimation,
            other => return Err(format!("unknown differentiation mode '{}'", other)),
        })
    }
}

/// Part of a parameter selected as independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Selector {
    Whole,
    Index(i64),
    /// Half-open element range `[start, end)`.
    Range(i64, i64),
}

/// Independent variable as written in a request, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndepSpec {
    pub name: String,
    pub selector: Selector,
}

/// Independent variable resolved against the target's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IndepVar {
    pub param: usize,
    pub name: String,
    pub selector: Selector,
}

impl IndepVar {
    /// Scalar slots this variable contributes, if known statically.
    pub fn slot_count(&self) -> Option<usize> {
        match self.selector {
            Selector::Index(_) => Some(1),
            Selector::Range(a, b) => Some((b - a) as usize),
            Selector::Whole => None,
        }
    }
}

impl fmt::Display for IndepVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector {
            Selector::Whole => write!(f, "{}", self.name),
            Selector::Index(i) => write!(f, "{}[{}]", self.name, i),
            Selector::Range(a, b) => write!(f, "{}[{}:{}]", self.name, a, b),
        }
    }
}

/// Parse `"x, arr[1], arr[0:3]"`.
pub fn parse_indeps(text: &str) -> Result<Vec<IndepSpec>, String> {
    let mut out = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, selector) = match part.find('[') {
            None => (part, Selector::Whole),
            Some(open) => {
                let inner = part[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| format!("missing ']' in '{}'", part))?;
                let num = |s: &str| {
                    s.trim()
                        .parse::<i64>()
                        .map_err(|_| format!("'{}' is not an integer index", s.trim()))
                };
                let selector = match inner.split_once(':') {
                    Some((a, b)) => Selector::Range(num(a)?, num(b)?),
                    None => Selector::Index(num(inner)?),
                };
                (part[..open].trim(), selector)
            }
        };
        let valid = name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(format!("'{}' is not a parameter name", name));
        }
        out.push(IndepSpec {
            name: name.to_string(),
            selector,
        });
    }
    Ok(out)
}

/// A complete description of one differentiation task.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRequest {
    /// Qualified target name (`f` or `P::m`).
    pub function: String,
    /// Parameter count, to pick among overloads; `None` requires a unique name.
    pub arity: Option<usize>,
    pub mode: DiffMode,
    pub args: Vec<IndepSpec>,
    pub order: u32,
    pub declaration_only: bool,
    pub verbose: bool,
}

impl DiffRequest {
    pub fn new(function: impl Into<String>, mode: DiffMode) -> Self {
        DiffRequest {
            function: function.into(),
            arity: None,
            mode,
            args: Vec::new(),
            order: 1,
            declaration_only: false,
            verbose: false,
        }
    }

    /// Select independent variables from text such as `"x, arr[1]"`.
    pub fn with_args(mut self, args: &str) -> Result<Self, DiffError> {
        self.args =
            parse_indeps(args).map_err(|reason| DiffError::invalid(&self.function, reason))?;
        Ok(self)
    }

    pub fn with_indeps(mut self, args: Vec<IndepSpec>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn declaration_only(mut self) -> Self {
        self.declaration_only = true;
        self
    }
}

/// Memoisation identity of a request. The declaration-only flag is not part
/// of it, so a declaration and its later definition share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub function: String,
    pub arity: usize,
    pub mode: DiffMode,
    pub indeps: Vec<IndepVar>,
    pub order: u32,
}

/// Indices of the parameters whose values carry derivatives.
pub fn differentiable_params(program: &Program, func: &Function) -> Vec<usize> {
    func.params
        .iter()
        .enumerate()
        .filter(|(_, p)| is_differentiable(program, &p.ty))
        .map(|(i, _)| i)
        .collect()
}

/// Check the requested independents against `func` and resolve them.
pub fn resolve_indeps(
    program: &Program,
    func: &Function,
    mode: DiffMode,
    order: u32,
    specs: &[IndepSpec],
) -> Result<Vec<IndepVar>, DiffError> {
    let fname = func.qualified_name();
    if order == 0 {
        return Err(DiffError::invalid(&fname, "derivative order must be at least 1"));
    }
    let mut params = differentiable_params(program, func);
    if mode == DiffMode::Jacobian {
        let last = func.params.len().checked_sub(1);
        match last {
            Some(l) if func.params[l].ty.is_array() => params.retain(|&i| i != l),
            _ => {
                return Err(DiffError::invalid(
                    &fname,
                    "jacobian mode needs an output array as the last parameter",
                ))
            }
        }
    }
    if mode.covers_all_params() {
        return Ok(params
            .into_iter()
            .map(|i| IndepVar {
                param: i,
                name: func.params[i].name.clone(),
                selector: Selector::Whole,
            })
            .collect());
    }

    let mut out: Vec<IndepVar> = Vec::new();
    if specs.is_empty() {
        for i in params {
            out.push(IndepVar {
                param: i,
                name: func.params[i].name.clone(),
                selector: Selector::Whole,
            });
        }
    } else {
        for spec in specs {
            let (idx, param) = func.param(&spec.name).ok_or_else(|| {
                DiffError::invalid(&fname, format!("unknown parameter '{}'", spec.name))
            })?;
            if !is_differentiable(program, &param.ty) {
                return Err(DiffError::invalid(
                    &fname,
                    format!("parameter '{}' of type {} is not differentiable", spec.name, param.ty),
                ));
            }
            if mode == DiffMode::Jacobian && !params.contains(&idx) {
                return Err(DiffError::invalid(
                    &fname,
                    format!("'{}' is the jacobian output, not an input", spec.name),
                ));
            }
            match spec.selector {
                Selector::Whole => {}
                Selector::Index(i) if param.ty.is_array() && i >= 0 => {}
                Selector::Range(a, b) if param.ty.is_array() && 0 <= a && a < b => {}
                _ if !param.ty.is_array() => {
                    return Err(DiffError::invalid(
                        &fname,
                        format!("'{}' is a scalar and cannot be indexed", spec.name),
                    ))
                }
                _ => {
                    return Err(DiffError::invalid(
                        &fname,
                        format!("invalid element selection on '{}'", spec.name),
                    ))
                }
            }
            if out.iter().any(|v| v.param == idx) {
                return Err(DiffError::invalid(
                    &fname,
                    format!("parameter '{}' selected twice", spec.name),
                ));
            }
            out.push(IndepVar {
                param: idx,
                name: spec.name.clone(),
                selector: spec.selector,
            });
        }
    }

    match mode {
        DiffMode::Forward => {
            let single = out.len() == 1
                && match out[0].selector {
                    Selector::Whole => func.params[out[0].param].ty.is_float(),
                    Selector::Index(_) => true,
                    Selector::Range(..) => false,
                };
            if !single {
                return Err(DiffError::invalid(
                    &fname,
                    "forward mode needs exactly one scalar or array element",
                ));
            }
        }
        DiffMode::Hessian | DiffMode::HessianDiagonal => {
            for v in &out {
                let ty = &func.params[v.param].ty;
                let ok = match v.selector {
                    Selector::Whole => ty.is_float(),
                    Selector::Index(_) | Selector::Range(..) => ty.is_array(),
                };
                if !ok {
                    return Err(DiffError::invalid(
                        &fname,
                        format!("'{}' needs an element range such as {}[0:2]", v.name, v.name),
                    ));
                }
            }
        }
        DiffMode::VectorForward | DiffMode::Jacobian => {
            if out
                .iter()
                .any(|v| func.params[v.param].ty.struct_name().is_some())
            {
                return Err(DiffError::invalid(
                    &fname,
                    format!("{} mode does not support struct parameters", mode),
                ));
            }
        }
        _ => {}
    }
    if out.is_empty() && mode != DiffMode::ReverseForwardPass {
        return Err(DiffError::invalid(&fname, "no differentiable parameters"));
    }
    Ok(out)
}

/// Name of the derivative of `base` under `mode`.
pub fn derived_name(base: &str, mode: DiffMode, indeps: &[IndepVar], all: &[usize]) -> String {
    let covers_all = {
        let mut requested: Vec<usize> = indeps.iter().map(|v| v.param).collect();
        requested.sort_unstable();
        requested.dedup();
        requested == all
    };
    let subset = || {
        let mut idx: Vec<usize> = indeps.iter().map(|v| v.param).collect();
        idx.sort_unstable();
        idx.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("_")
    };
    match mode {
        DiffMode::Forward => match indeps.first() {
            Some(IndepVar {
                param,
                selector: Selector::Index(j),
                ..
            }) => format!("{}_darg{}_{}", base, param, j),
            Some(v) => format!("{}_darg{}", base, v.param),
            None => format!("{}_darg", base),
        },
        DiffMode::Pushforward => format!("{}_pushforward", base),
        DiffMode::VectorForward if covers_all => format!("{}_dvec", base),
        DiffMode::VectorForward => format!("{}_dvec_{}", base, subset()),
        DiffMode::VectorPushforward => format!("{}_vector_pushforward", base),
        DiffMode::Reverse if covers_all => format!("{}_grad", base),
        DiffMode::Reverse => format!("{}_grad_{}", base, subset()),
        DiffMode::Pullback => format!("{}_pullback", base),
        DiffMode::ReverseForwardPass => format!("{}_reverse_forw", base),
        DiffMode::Hessian => format!("{}_hessian", base),
        DiffMode::HessianDiagonal => format!("{}_hessian_diagonal", base),
        DiffMode::Jacobian => format!("{}_jac", base),
        DiffMode::ErrorEstimation if covers_all => format!("{}_grad_error", base),
        DiffMode::ErrorEstimation => format!("{}_grad_{}_error", base, subset()),
    }
}

/// Adjoint parameter type of a differentiable parameter.
pub fn adjoint_type(ty: &Type) -> Type {
    match ty.deref() {
        Type::Array(_) => ty.deref().clone(),
        other => Type::ref_to(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[test]
    fn parses_selectors() {
        let specs = parse_indeps("x, arr[1], arr2[0:3]").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].selector, Selector::Index(1));
        assert_eq!(specs[2].selector, Selector::Range(0, 3));
        assert!(parse_indeps("a[1").is_err());
        assert!(parse_indeps("3x").is_err());
        assert!(parse_indeps("").unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_selections() {
        let program =
            parser::parse("fn f(x: f64, n: i64, arr: [f64]) -> f64 { return x; }").unwrap();
        let f = &program.functions[0];
        let resolve = |mode, text: &str| {
            resolve_indeps(&program, f, mode, 1, &parse_indeps(text).unwrap())
        };
        assert!(resolve(DiffMode::Reverse, "z").is_err());
        assert!(resolve(DiffMode::Reverse, "n").is_err());
        assert!(resolve(DiffMode::Reverse, "x[1]").is_err());
        assert!(resolve(DiffMode::Forward, "arr").is_err());
        assert!(resolve(DiffMode::Forward, "x, arr[0]").is_err());
        assert!(resolve(DiffMode::Hessian, "x, arr").is_err());
        assert!(resolve(DiffMode::Forward, "arr[2]").is_ok());
        assert!(resolve_indeps(&program, f, DiffMode::Reverse, 0, &[]).is_err());
        let all = resolve(DiffMode::Reverse, "").unwrap();
        assert_eq!(all.iter().map(|v| v.param).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn names_follow_mode_and_subset() {
        let v = |param, selector| IndepVar {
            param,
            name: String::new(),
            selector,
        };
        let all = [0, 1];
        assert_eq!(
            derived_name("f", DiffMode::Forward, &[v(1, Selector::Index(3))], &all),
            "f_darg1_3"
        );
        assert_eq!(
            derived_name(
                "f",
                DiffMode::Reverse,
                &[v(0, Selector::Whole), v(1, Selector::Whole)],
                &all
            ),
            "f_grad"
        );
        assert_eq!(
            derived_name("f", DiffMode::Reverse, &[v(1, Selector::Whole)], &all),
            "f_grad_1"
        );
        assert_eq!(
            derived_name("f", DiffMode::VectorForward, &[v(0, Selector::Whole)], &all),
            "f_dvec_0"
        );
        assert_eq!(derived_name("m", DiffMode::Pullback, &[], &all), "m_pullback");
    }
}
