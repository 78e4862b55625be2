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

//! Lookup of user-supplied derivatives and call targets.

use crate::ast::{Function, Program, Span, Type};
use crate::types::is_differentiable;

use super::DiffError;

/// Module that holds user-supplied derivatives.
pub const CUSTOM_NAMESPACE: &str = "custom_derivatives";

/// Name of a user-supplied struct-literal pushforward.
pub const CONSTRUCTOR_PUSHFORWARD: &str = "constructor_pushforward";

/// Name of a user-supplied struct-literal pullback.
pub const CONSTRUCTOR_PULLBACK: &str = "constructor_pullback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupContext<'a> {
    FreeFunction,
    /// Method of the named struct.
    Member(&'a str),
    /// Constructor of the named struct; the first parameter is `tag<P>`.
    Constructor(&'a str),
}

/// Find the custom derivative `name` whose parameter types are exactly
/// `expected`. More than one match is an error.
pub fn find_custom_derivative<'p>(
    program: &'p Program,
    caller: &str,
    name: &str,
    expected: &[Type],
    context: LookupContext<'_>,
) -> Result<Option<&'p Function>, DiffError> {
    let matches: Vec<&Function> = program
        .functions
        .iter()
        .filter(|f| f.namespace.as_deref() == Some(CUSTOM_NAMESPACE) && f.name == name)
        .filter(|f| match context {
            LookupContext::FreeFunction => f.owner.is_none(),
            LookupContext::Member(owner) => f.owner.as_deref() == Some(owner),
            LookupContext::Constructor(ty) => {
                f.owner.is_none()
                    && matches!(f.params.first(), Some(p) if p.ty == Type::Tag(ty.to_string()))
            }
        })
        .filter(|f| f.param_types() == expected)
        .collect();
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        n => Err(DiffError::AmbiguousOverload {
            function: caller.to_string(),
            callee: name.to_string(),
            candidates: n,
            span: None,
        }),
    }
}

/// The `constructor_pullback` for struct `name`, if one is registered.
///
/// Its parameters are `tag<P>`, the field values in declaration order, the
/// adjoint `&P` of the constructed value and one `&T` adjoint per
/// differentiable field.
pub fn find_constructor_pullback<'p>(
    program: &'p Program,
    caller: &str,
    name: &str,
) -> Result<Option<&'p Function>, DiffError> {
    let Some(def) = program.struct_def(name) else {
        return Ok(None);
    };
    let mut expected = vec![Type::Tag(name.to_string())];
    expected.extend(def.fields.iter().map(|f| f.ty.clone()));
    expected.push(Type::ref_to(Type::Struct(name.to_string())));
    expected.extend(
        def.fields
            .iter()
            .filter(|f| is_differentiable(program, &f.ty))
            .map(|f| Type::ref_to(f.ty.clone())),
    );
    find_custom_derivative(
        program,
        caller,
        CONSTRUCTOR_PULLBACK,
        &expected,
        LookupContext::Constructor(name),
    )
}

/// Whether struct literals of `name` are reversed through a user pullback.
pub fn has_constructor_pullback(program: &Program, name: &str) -> bool {
    find_constructor_pullback(program, "", name).map_or(true, |f| f.is_some())
}

/// Context a custom derivative of `func` is looked up in.
pub fn context_of(func: &Function) -> LookupContext<'_> {
    match &func.owner {
        Some(owner) => LookupContext::Member(owner),
        None => LookupContext::FreeFunction,
    }
}

/// Whether a function, or the struct it belongs to, opts out of
/// differentiation.
pub fn is_non_differentiable(program: &Program, func: &Function) -> bool {
    func.non_differentiable
        || func
            .owner
            .as_deref()
            .and_then(|o| program.struct_def(o))
            .map(|s| s.non_differentiable)
            .unwrap_or(false)
}

/// Resolve a call inside `caller` to a unique function.
pub fn resolve_call<'p>(
    program: &'p Program,
    caller: &str,
    callee: &str,
    arity: usize,
    span: Span,
) -> Result<&'p Function, DiffError> {
    let candidates: Vec<&Function> = program
        .functions_named(callee)
        .filter(|f| f.params.len() == arity)
        .collect();
    match candidates.len() {
        0 => Err(DiffError::NoDefinition {
            function: callee.to_string(),
            span: Some(span),
        }),
        1 => Ok(candidates[0]),
        n => Err(DiffError::AmbiguousOverload {
            function: caller.to_string(),
            callee: callee.to_string(),
            candidates: n,
            span: Some(span),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    const SRC: &str = "
        struct P { x: f64 }
        fn g(x: f64) -> f64 { return x * x; }
        impl P { fn m(p: P) -> f64 { return p.x; } }
        mod custom_derivatives {
            fn g_pushforward(x: f64, dx: f64, dret: &f64) -> f64 {
                dret = 2.0 * x * dx;
                return x * x;
            }
            impl P { fn m_pullback(p: P, dy: f64, dp: &P) { dp.x += dy; } }
            fn constructor_pushforward(t: tag<P>, x: f64, dx: f64, dret: &P) -> P {
                dret.x = dx;
                return P { x: x };
            }
        }
    ";

    #[test]
    fn finds_by_exact_signature() {
        let program = parser::parse(SRC).unwrap();
        let sig = vec![Type::F64, Type::F64, Type::ref_to(Type::F64)];
        let free = LookupContext::FreeFunction;
        let found = find_custom_derivative(&program, "f", "g_pushforward", &sig, free).unwrap();
        assert!(found.is_some());
        let wrong = vec![Type::F64, Type::F64];
        let found = find_custom_derivative(&program, "f", "g_pushforward", &wrong, free).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn member_and_constructor_contexts() {
        let program = parser::parse(SRC).unwrap();
        let p = Type::Struct("P".into());
        let sig = vec![p.clone(), Type::F64, Type::ref_to(p.clone())];
        let member = LookupContext::Member("P");
        let m = find_custom_derivative(&program, "f", "m_pullback", &sig, member).unwrap();
        assert_eq!(m.map(|f| f.qualified_name()), Some("P::m_pullback".to_string()));
        let free = LookupContext::FreeFunction;
        let m = find_custom_derivative(&program, "f", "m_pullback", &sig, free).unwrap();
        assert!(m.is_none());
        let ctor = vec![Type::Tag("P".into()), Type::F64, Type::F64, Type::ref_to(p)];
        assert!(find_custom_derivative(
            &program,
            "f",
            CONSTRUCTOR_PUSHFORWARD,
            &ctor,
            LookupContext::Constructor("P")
        )
        .unwrap()
        .is_some());
    }

    #[test]
    fn constructor_pullback_takes_field_adjoints() {
        let program = parser::parse(
            "struct Q { a: f64, n: i64 }
            mod custom_derivatives {
                fn constructor_pullback(t: tag<Q>, a: f64, n: i64, dq: &Q, da: &f64) { da += dq.a; }
            }",
        )
        .unwrap();
        let found = find_constructor_pullback(&program, "f", "Q").unwrap();
        assert_eq!(found.map(|f| f.params.len()), Some(5));
        assert!(has_constructor_pullback(&program, "Q"));
        assert!(!has_constructor_pullback(&parser::parse(SRC).unwrap(), "P"));
    }

    #[test]
    fn duplicate_customs_are_ambiguous() {
        let program = parser::parse(
            "mod custom_derivatives {
                fn h_pullback(x: f64, d: f64, dx: &f64) {}
                fn h_pullback(y: f64, e: f64, dy: &f64) {}
            }",
        )
        .unwrap();
        let sig = vec![Type::F64, Type::F64, Type::ref_to(Type::F64)];
        let free = LookupContext::FreeFunction;
        let err = find_custom_derivative(&program, "f", "h_pullback", &sig, free).unwrap_err();
        assert!(matches!(err, DiffError::AmbiguousOverload { candidates: 2, .. }));
    }
}
