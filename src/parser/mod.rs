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

//! # Example
//! ```
//! use mindad::parser;
//! let program = parser::parse("fn sq(x: f64) -> f64 { return x * x; }").unwrap();
//! assert_eq!(program.functions[0].name, "sq");
//! ```

use chumsky::prelude::*;

use crate::ast::{
    AssignOp, BinOp, Block, Expr, ExprKind, FieldDef, Function, Param, Program, Span, Stmt,
    StmtKind, StructDef, Type, UnaryOp,
};
use crate::diagnostics::Diagnostic;

fn kw(s: &'static str) -> impl Parser<char, &'static str, Error = Simple<char>> + Clone {
    text::keyword(s).to(s)
}

fn ident() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    text::ident::<char, Simple<char>>()
}

fn span_of(sp: std::ops::Range<usize>) -> Span {
    Span::new(sp.start, sp.end)
}

fn joined(l: &Expr, r: &Expr) -> Span {
    Span::new(l.span.start(), r.span.end())
}

fn number() -> impl Parser<char, ExprKind, Error = Simple<char>> + Clone {
    let digits = filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>();
    let exponent = one_of("eE")
        .then(one_of("+-").or_not())
        .then(digits.clone())
        .map(|((e, sign), d)| {
            let mut s = e.to_string();
            if let Some(sign) = sign {
                s.push(sign);
            }
            s.push_str(&d);
            s
        });
    let float = digits
        .clone()
        .then(just('.').ignore_then(digits.clone()))
        .then(exponent.clone().or_not())
        .map(|((int, frac), exp)| format!("{}.{}{}", int, frac, exp.unwrap_or_default()))
        .or(digits
            .clone()
            .then(exponent)
            .map(|(int, exp)| format!("{}{}", int, exp)))
        .try_map(|s, sp| {
            s.parse::<f64>()
                .map(ExprKind::Float)
                .map_err(|e| Simple::custom(sp, e.to_string()))
        });
    let int = digits.try_map(|s, sp| {
        s.parse::<i64>()
            .map(ExprKind::Int)
            .map_err(|e| Simple::custom(sp, e.to_string()))
    });
    float.or(int)
}

/// Type syntax: `f64`, `i64`, `bool`, `void`, `tape`, `[T]`, `&T`, `tag<P>`, `P`.
pub fn type_parser() -> impl Parser<char, Type, Error = Simple<char>> + Clone {
    recursive(|ty| {
        choice((
            kw("f64").to(Type::F64),
            kw("i64").to(Type::I64),
            kw("bool").to(Type::Bool),
            kw("void").to(Type::Void),
            kw("tape").to(Type::Tape),
            kw("tag")
                .ignore_then(ident().padded().delimited_by(just('<').padded(), just('>')))
                .map(Type::Tag),
            ty.clone()
                .delimited_by(just('[').padded(), just(']'))
                .map(Type::array_of),
            just('&').ignore_then(ty).map(Type::ref_to),
            ident().map(Type::Struct),
        ))
        .padded()
    })
}

pub fn expr_parser() -> impl Parser<char, Expr, Error = Simple<char>> + Clone {
    enum NameSuffix {
        Call(Vec<Expr>),
        Struct(Vec<(String, Expr)>),
    }
    enum Postfix {
        Index(Expr),
        Field(String),
    }

    recursive(|expr| {
        let literal = choice((
            number(),
            kw("true").to(ExprKind::Bool(true)),
            kw("false").to(ExprKind::Bool(false)),
            kw("tag")
                .ignore_then(ident().padded().delimited_by(just('<').padded(), just('>')))
                .map(ExprKind::Tag),
        ))
        .map_with_span(|kind, sp| Expr::new(kind, span_of(sp)));

        let qualified = ident()
            .then(just("::").ignore_then(ident()).or_not())
            .map(|(head, tail)| match tail {
                Some(tail) => format!("{}::{}", head, tail),
                None => head,
            });

        let call_args = expr
            .clone()
            .separated_by(just(',').padded())
            .allow_trailing()
            .delimited_by(just('(').padded(), just(')'));

        let struct_fields = ident()
            .padded()
            .then_ignore(just(':').padded())
            .then(expr.clone())
            .separated_by(just(',').padded())
            .allow_trailing()
            .at_least(1)
            .delimited_by(just('{').padded(), just('}'));

        let named = qualified
            .then(
                choice((
                    call_args.map(NameSuffix::Call),
                    struct_fields.map(NameSuffix::Struct),
                ))
                .or_not(),
            )
            .map_with_span(|(name, suffix), sp| {
                let kind = match suffix {
                    None => ExprKind::Var(name),
                    Some(NameSuffix::Call(args)) => ExprKind::Call { callee: name, args },
                    Some(NameSuffix::Struct(fields)) => ExprKind::StructLit { name, fields },
                };
                Expr::new(kind, span_of(sp))
            });

        let array = just('[')
            .padded()
            .ignore_then(
                expr.clone()
                    .then_ignore(just(';').padded())
                    .then(expr.clone())
                    .map(|(value, len)| ExprKind::ArrayFill {
                        value: Box::new(value),
                        len: Box::new(len),
                    })
                    .or(expr
                        .clone()
                        .separated_by(just(',').padded())
                        .allow_trailing()
                        .map(ExprKind::ArrayLit)),
            )
            .then_ignore(just(']'))
            .map_with_span(|kind, sp| Expr::new(kind, span_of(sp)));

        let paren = expr
            .clone()
            .delimited_by(just('(').padded(), just(')'));

        let atom = choice((literal, array, paren, named)).padded().boxed();

        let postfix = atom
            .then(
                choice((
                    expr.clone()
                        .delimited_by(just('[').padded(), just(']'))
                        .map(Postfix::Index),
                    just('.').ignore_then(ident()).map(Postfix::Field),
                ))
                .map_with_span(|p, sp: std::ops::Range<usize>| (p, sp.end))
                .padded()
                .repeated(),
            )
            .foldl(|base, (p, end)| {
                let span = Span::new(base.span.start(), end);
                let kind = match p {
                    Postfix::Index(index) => ExprKind::Index {
                        base: Box::new(base),
                        index: Box::new(index),
                    },
                    Postfix::Field(field) => ExprKind::Field {
                        base: Box::new(base),
                        field,
                    },
                };
                Expr::new(kind, span)
            })
            .boxed();

        let unary = choice((just('-').to(UnaryOp::Neg), just('!').to(UnaryOp::Not)))
            .map_with_span(|op, sp: std::ops::Range<usize>| (op, sp.start))
            .padded()
            .repeated()
            .then(postfix)
            .map(|(ops, operand)| {
                ops.into_iter().rev().fold(operand, |acc, (op, start)| {
                    let span = Span::new(start, acc.span.end());
                    Expr::new(
                        ExprKind::Unary {
                            op,
                            operand: Box::new(acc),
                        },
                        span,
                    )
                })
            })
            .boxed();

        let fold_binary = |l: Expr, (op, r): (BinOp, Expr)| {
            let span = joined(&l, &r);
            Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(l),
                    right: Box::new(r),
                },
                span,
            )
        };

        let product = unary
            .clone()
            .then(
                choice((just('*').to(BinOp::Mul), just('/').to(BinOp::Div)))
                    .padded()
                    .then(unary)
                    .repeated(),
            )
            .foldl(fold_binary)
            .boxed();

        let sum = product
            .clone()
            .then(
                choice((just('+').to(BinOp::Add), just('-').to(BinOp::Sub)))
                    .padded()
                    .then(product)
                    .repeated(),
            )
            .foldl(fold_binary)
            .boxed();

        let cmp_op = choice((
            just("<=").to(BinOp::Le),
            just(">=").to(BinOp::Ge),
            just("==").to(BinOp::Eq),
            just("!=").to(BinOp::Ne),
            just('<').to(BinOp::Lt),
            just('>').to(BinOp::Gt),
        ))
        .padded();

        let comparison = sum
            .clone()
            .then(cmp_op.then(sum).or_not())
            .map(move |(l, rest)| match rest {
                Some(pair) => fold_binary(l, pair),
                None => l,
            })
            .boxed();

        let conjunction = comparison
            .clone()
            .then(just("&&").padded().to(BinOp::And).then(comparison).repeated())
            .foldl(fold_binary)
            .boxed();

        let disjunction = conjunction
            .clone()
            .then(just("||").padded().to(BinOp::Or).then(conjunction).repeated())
            .foldl(fold_binary)
            .boxed();

        disjunction
            .then(
                just('?')
                    .padded()
                    .ignore_then(expr.clone())
                    .then_ignore(just(':').padded())
                    .then(expr)
                    .or_not(),
            )
            .map(|(cond, branches)| match branches {
                Some((then_expr, else_expr)) => {
                    let span = joined(&cond, &else_expr);
                    Expr::new(
                        ExprKind::Cond {
                            cond: Box::new(cond),
                            then_expr: Box::new(then_expr),
                            else_expr: Box::new(else_expr),
                        },
                        span,
                    )
                }
                None => cond,
            })
    })
}

pub fn stmt_parser() -> impl Parser<char, Stmt, Error = Simple<char>> + Clone {
    let expr = expr_parser();
    let semi = just(';').padded();

    recursive(move |stmt| {
        let block = stmt
            .repeated()
            .delimited_by(just('{').padded(), just('}').padded())
            .map_with_span(|stmts, sp| Block {
                stmts,
                span: span_of(sp),
            })
            .boxed();

        let let_stmt = kw("let")
            .padded()
            .ignore_then(ident().map_with_span(|name, sp| (name, span_of(sp))))
            .then_ignore(just(':').padded())
            .then(type_parser())
            .then(just('=').padded().ignore_then(expr.clone()).or_not())
            .then_ignore(semi.clone())
            .map(|(((name, name_span), ty), value)| StmtKind::Let {
                name,
                name_span,
                ty,
                value,
            });

        let if_stmt = recursive(|if_stmt| {
            kw("if")
                .padded()
                .ignore_then(expr.clone())
                .then(block.clone())
                .then(
                    kw("else")
                        .padded()
                        .ignore_then(block.clone().or(if_stmt.map_with_span(
                            |kind, sp: std::ops::Range<usize>| {
                                let span = span_of(sp);
                                Block {
                                    stmts: vec![Stmt::new(kind, span)],
                                    span,
                                }
                            },
                        )))
                        .or_not(),
                )
                .map(|((cond, then_block), else_block)| StmtKind::If {
                    cond,
                    then_block,
                    else_block,
                })
        });

        let while_stmt = kw("while")
            .padded()
            .ignore_then(expr.clone())
            .then(block.clone())
            .map(|(cond, body)| StmtKind::While { cond, body });

        let for_stmt = kw("for")
            .padded()
            .ignore_then(ident().map_with_span(|name, sp| (name, span_of(sp))))
            .then_ignore(kw("in").padded())
            .then(expr.clone())
            .then_ignore(just("..").padded())
            .then(expr.clone())
            .then(block.clone())
            .map(|((((var, var_span), start), end), body)| StmtKind::For {
                var,
                var_span,
                start,
                end,
                body,
            });

        let return_stmt = kw("return")
            .padded()
            .ignore_then(expr.clone().or_not())
            .then_ignore(semi.clone())
            .map(StmtKind::Return);

        let assign_op = choice((
            just("+=").to(AssignOp::Add),
            just("-=").to(AssignOp::Sub),
            just("*=").to(AssignOp::Mul),
            just("/=").to(AssignOp::Div),
            just('=').to(AssignOp::Set),
        ))
        .padded();

        let assign_stmt = expr
            .clone()
            .then(assign_op)
            .then(expr.clone())
            .then_ignore(semi.clone())
            .try_map(|((target, op), value), sp| {
                if target.is_place() {
                    Ok(StmtKind::Assign { target, op, value })
                } else {
                    Err(Simple::custom(sp, "left-hand side of assignment is not assignable"))
                }
            });

        choice((
            let_stmt,
            if_stmt,
            while_stmt,
            for_stmt,
            return_stmt,
            kw("break").padded().then(semi.clone()).to(StmtKind::Break),
            kw("continue").padded().then(semi.clone()).to(StmtKind::Continue),
            block.clone().map(StmtKind::Block),
            assign_stmt,
            expr.clone().then_ignore(semi.clone()).map(StmtKind::Expr),
        ))
        .map_with_span(|kind, sp| Stmt::new(kind, span_of(sp)))
        .padded()
    })
}

enum Item {
    Struct(StructDef),
    Func(Function),
    Impl(String, Vec<Function>),
    Mod(String, Vec<Item>),
}

fn function_parser() -> impl Parser<char, Function, Error = Simple<char>> + Clone {
    let attr = just('#')
        .then(just('[').padded())
        .then(kw("non_differentiable"))
        .then(just(']').padded())
        .padded()
        .or_not()
        .map(|a| a.is_some());

    let param = ident()
        .padded()
        .then_ignore(just(':').padded())
        .then(type_parser())
        .map_with_span(|(name, ty), sp| Param {
            name,
            ty,
            span: span_of(sp),
        });

    let body = stmt_parser()
        .repeated()
        .delimited_by(just('{').padded(), just('}').padded())
        .map_with_span(|stmts, sp| Some(Block {
            stmts,
            span: span_of(sp),
        }))
        .or(just(';').padded().to(None));

    attr.then_ignore(kw("fn").padded())
        .then(ident().padded())
        .then(
            param
                .separated_by(just(',').padded())
                .allow_trailing()
                .delimited_by(just('(').padded(), just(')').padded()),
        )
        .then(just("->").padded().ignore_then(type_parser()).or_not())
        .then(body)
        .map_with_span(|((((non_diff, name), params), ret), body), sp| Function {
            name,
            owner: None,
            namespace: None,
            params,
            ret: ret.unwrap_or(Type::Void),
            body,
            non_differentiable: non_diff,
            span: span_of(sp),
        })
}

fn item_parser() -> impl Parser<char, Item, Error = Simple<char>> + Clone {
    let attr = just('#')
        .then(just('[').padded())
        .then(kw("non_differentiable"))
        .then(just(']').padded())
        .padded()
        .or_not()
        .map(|a| a.is_some());

    let field = ident()
        .padded()
        .then_ignore(just(':').padded())
        .then(type_parser())
        .map(|(name, ty)| FieldDef { name, ty });

    let struct_def = attr
        .then_ignore(kw("struct").padded())
        .then(ident().padded())
        .then(
            field
                .separated_by(just(',').padded())
                .allow_trailing()
                .delimited_by(just('{').padded(), just('}').padded()),
        )
        .map_with_span(|((non_diff, name), fields), sp| {
            Item::Struct(StructDef {
                name,
                fields,
                non_differentiable: non_diff,
                span: span_of(sp),
            })
        });

    let impl_block = kw("impl")
        .padded()
        .ignore_then(ident().padded())
        .then(
            function_parser()
                .repeated()
                .delimited_by(just('{').padded(), just('}').padded()),
        )
        .map(|(owner, funcs)| Item::Impl(owner, funcs));

    recursive(|item| {
        let mod_block = kw("mod")
            .padded()
            .ignore_then(ident().padded())
            .then(
                item.repeated()
                    .delimited_by(just('{').padded(), just('}').padded()),
            )
            .map(|(name, items)| Item::Mod(name, items));

        choice((
            mod_block,
            impl_block.clone(),
            struct_def.clone(),
            function_parser().map(Item::Func),
        ))
        .padded()
    })
}

fn flatten(items: Vec<Item>, namespace: Option<&str>, program: &mut Program) {
    for item in items {
        match item {
            Item::Struct(s) => program.structs.push(s),
            Item::Func(mut f) => {
                f.namespace = namespace.map(str::to_string);
                program.functions.push(f);
            }
            Item::Impl(owner, funcs) => {
                for mut f in funcs {
                    f.owner = Some(owner.clone());
                    f.namespace = namespace.map(str::to_string);
                    program.functions.push(f);
                }
            }
            Item::Mod(name, inner) => flatten(inner, Some(&name), program),
        }
    }
}

pub fn parser() -> impl Parser<char, Program, Error = Simple<char>> {
    item_parser()
        .repeated()
        .padded()
        .then_ignore(end())
        .map(|items| {
            let mut program = Program::default();
            flatten(items, None, &mut program);
            program
        })
}

/// Blank out `//` comments, keeping byte offsets intact for diagnostics.
fn strip_comments(input: &str) -> String {
    input
        .split('\n')
        .map(|line| match line.find("//") {
            Some(idx) => format!("{}{}", &line[..idx], " ".repeat(line.len() - idx)),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse(input: &str) -> Result<Program, Vec<Simple<char>>> {
    let stripped = strip_comments(input);
    parser().parse(stripped.as_str())
}

/// Parse with pretty diagnostics instead of raw chumsky errors.
pub fn parse_with_diagnostics(input: &str) -> Result<Program, Vec<Diagnostic>> {
    let stripped = strip_comments(input);
    let (program, errs) = parser().parse_recovery(stripped.as_str());
    match program {
        Some(program) if errs.is_empty() => Ok(program),
        _ => Err(errs
            .into_iter()
            .map(|e| Diagnostic::from_chumsky(input, e))
            .collect()),
    }
}

/// Parse a single expression (used by tests and the request syntax).
pub fn parse_expr(input: &str) -> Result<Expr, Vec<Simple<char>>> {
    expr_parser().padded().then_ignore(end()).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_assignment_and_loops() {
        let src = r#"
            fn modify(arr: [f64], x: f64) -> f64 {
                arr[3] *= x; // scale
                for i in 0..5 {
                    arr[i] /= 2.0;
                }
                return arr[3];
            }
        "#;
        let program = parse(src).expect("parse");
        let f = &program.functions[0];
        assert_eq!(f.params[0].ty, Type::array_of(Type::F64));
        let body = f.body.as_ref().expect("body");
        assert_eq!(body.stmts.len(), 3);
        assert!(matches!(
            body.stmts[0].kind,
            StmtKind::Assign {
                op: AssignOp::Mul,
                ..
            }
        ));
        assert!(matches!(body.stmts[1].kind, StmtKind::For { .. }));
    }

    #[test]
    fn precedence_and_ternary() {
        let e = parse_expr("a + b * c > 0.5 ? -x : y").expect("expr");
        match e.kind {
            ExprKind::Cond { cond, then_expr, .. } => {
                assert_eq!(cond.to_string(), "a + b * c > 0.5");
                assert_eq!(then_expr.to_string(), "-x");
            }
            other => panic!("expected ternary, got {:?}", other),
        }
    }

    #[test]
    fn items_methods_and_custom_derivatives() {
        let src = r#"
            #[non_differentiable]
            struct Cfg { k: f64 }
            struct P { x: f64, y: f64 }
            impl P {
                fn norm2(self: P) -> f64 { return self.x * self.x + self.y * self.y; }
            }
            fn ext(x: f64) -> f64;
            mod custom_derivatives {
                fn ext_pushforward(x: f64, _d_x: f64, _d_ret: &f64) -> f64 {
                    _d_ret = 2.0 * _d_x;
                    return ext(x);
                }
            }
        "#;
        let program = parse(src).expect("parse");
        assert!(program.structs[0].non_differentiable);
        let names: Vec<String> = program.functions.iter().map(|f| f.qualified_name()).collect();
        assert_eq!(names, vec!["P::norm2", "ext", "ext_pushforward"]);
        assert!(program.functions[1].is_declaration());
        assert_eq!(
            program.functions[2].namespace.as_deref(),
            Some("custom_derivatives")
        );
    }

    #[test]
    fn struct_literals_do_not_swallow_blocks() {
        let src = "fn f(n: i64) -> f64 {
            let s: f64 = 0.0;
            while s < 3.0 { s = s + 1.0; }
            if n > 0 { s = 0.0; } else if n < 0 { s = 1.0; }
            return s;
        }";
        let program = parse(src).expect("parse");
        let body = program.functions[0].body.as_ref().expect("body");
        assert!(matches!(body.stmts[1].kind, StmtKind::While { .. }));
        assert!(matches!(body.stmts[2].kind, StmtKind::If { .. }));
    }

    #[test]
    fn printed_functions_reparse() {
        let src = "fn f(x: f64, p: &f64) -> f64 {
            let t: f64 = (x + 1.0) * -x;
            p += t / 2.0;
            return x > 0.0 ? t : pow(x, 2.0);
        }";
        let program = parse(src).expect("parse");
        let printed = program.to_string();
        let reparsed = parse(&printed).expect("reparse");
        assert_eq!(printed, reparsed.to_string());
    }

    #[test]
    fn bad_syntax_has_diagnostics() {
        let errs = parse_with_diagnostics("fn f(x: f64) -> f64 { return x +; }").unwrap_err();
        assert!(!errs.is_empty());
        assert!(errs[0].start.line >= 1);
    }
}
