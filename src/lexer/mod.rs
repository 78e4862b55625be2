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

//! Token-level checks that run before parsing user source.

use logos::Logos;

use crate::ast::Span;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().to_string())]
    Number(String),

    #[regex(r"[-+*/=<>!&|.,;:?(){}\[\]#]")]
    Punct,
}

pub fn lex(input: &str) -> Vec<(Token, Span)> {
    Token::lexer(input)
        .spanned()
        .filter_map(|(tok, span)| tok.ok().map(|t| (t, Span::from(span))))
        .collect()
}

/// Identifiers starting with `_` belong to generated code; user source may
/// not declare or reference them.
pub fn reserved_identifiers(input: &str) -> Vec<(String, Span)> {
    lex(input)
        .into_iter()
        .filter_map(|(tok, span)| match tok {
            Token::Ident(name) if name.starts_with('_') => Some((name, span)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_reserved_names_outside_comments() {
        let src = "fn f(x: f64) -> f64 {\n  // _ignored\n  let _d_x: f64 = x;\n  return _d_x;\n}";
        let found: Vec<String> = reserved_identifiers(src).into_iter().map(|(n, _)| n).collect();
        assert_eq!(found, vec!["_d_x".to_string(), "_d_x".to_string()]);
    }

    #[test]
    fn plain_source_is_clean() {
        assert!(reserved_identifiers("fn f(x: f64) -> f64 { return x * 2.0; }").is_empty());
    }
}
