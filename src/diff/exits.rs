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

//! Lowering of early exits to flags.
//!
//! `return`, `break` and `continue` become assignments to boolean flags.
//! The statements after an exit are wrapped in `if !flag { ... }` and loop
//! conditions test the flags, so every block of the result falls through
//! to its end. The reverse transformation replays those guards like any
//! other branch.

use crate::ast::{AssignOp, BinOp, Block, Expr, Function, Stmt, StmtKind, Type};

use super::NameGen;

/// Exits a statement can take out of the innermost enclosing loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Exits {
    ret: bool,
    brk: bool,
    cont: bool,
}

impl Exits {
    fn union(self, other: Exits) -> Exits {
        Exits {
            ret: self.ret || other.ret,
            brk: self.brk || other.brk,
            cont: self.cont || other.cont,
        }
    }
}

fn block_exits(stmts: &[Stmt]) -> Exits {
    stmts
        .iter()
        .fold(Exits::default(), |acc, s| acc.union(stmt_exits(s)))
}

fn stmt_exits(s: &Stmt) -> Exits {
    match &s.kind {
        StmtKind::Return(_) => Exits {
            ret: true,
            ..Exits::default()
        },
        StmtKind::Break => Exits {
            brk: true,
            ..Exits::default()
        },
        StmtKind::Continue => Exits {
            cont: true,
            ..Exits::default()
        },
        StmtKind::If {
            then_block,
            else_block,
            ..
        } => {
            let e = block_exits(&then_block.stmts);
            match else_block {
                Some(b) => e.union(block_exits(&b.stmts)),
                None => e,
            }
        }
        StmtKind::Block(b) => block_exits(&b.stmts),
        StmtKind::While { body, .. } | StmtKind::For { body, .. } => Exits {
            ret: block_exits(&body.stmts).ret,
            ..Exits::default()
        },
        StmtKind::Let { .. } | StmtKind::Assign { .. } | StmtKind::Expr(_) => Exits::default(),
    }
}

/// True when some `return` is not the last top-level statement.
fn returns_early(stmts: &[Stmt]) -> bool {
    let n = stmts.len();
    stmts.iter().enumerate().any(|(k, s)| match s.kind {
        StmtKind::Return(_) => k + 1 != n,
        _ => stmt_exits(s).ret,
    })
}

/// True when the body has an early return or any loop exit.
pub fn has_early_exit(func: &Function) -> bool {
    let Some(body) = &func.body else {
        return false;
    };
    let mut loop_exit = false;
    body.walk(&mut |s| loop_exit |= matches!(s.kind, StmtKind::Break | StmtKind::Continue));
    loop_exit || returns_early(&body.stmts)
}

#[derive(Debug, Default)]
struct LoopFlags {
    brk: Option<String>,
    cont: Option<String>,
}

struct Lowering<'n> {
    names: &'n mut NameGen,
    returned: Option<String>,
    result: Option<String>,
    loops: Vec<LoopFlags>,
}

fn set(flag: &str, value: bool) -> Stmt {
    Stmt::assign(Expr::var(flag), Expr::boolean(value))
}

/// `!(a || b || ...)` over the given flags.
fn none_set(flags: &[&String]) -> Option<Expr> {
    let mut iter = flags.iter().map(|f| Expr::var(f.as_str()));
    let first = iter.next()?;
    let any = iter.fold(first, |acc, f| Expr::binary(BinOp::Or, acc, f));
    Some(Expr::not(any))
}

/// Rewrite `func` so that it has no early exits. Functions without any are
/// returned unchanged.
pub fn lower_exits(func: &Function, names: &mut NameGen) -> Function {
    if !has_early_exit(func) {
        return func.clone();
    }
    let Some(body) = &func.body else {
        return func.clone();
    };
    let mut lowering = Lowering {
        returned: None,
        result: None,
        loops: Vec::new(),
        names,
    };
    let mut head = Vec::new();
    if returns_early(&body.stmts) {
        let flag = lowering.names.fresh("_returned");
        head.push(Stmt::let_(flag.clone(), Type::Bool, Some(Expr::boolean(false))));
        lowering.returned = Some(flag);
        if func.ret != Type::Void {
            let result = lowering.names.fresh("_result");
            head.push(Stmt::let_(result.clone(), func.ret.clone(), None));
            lowering.result = Some(result);
        }
    }
    let mut stmts = head;
    stmts.extend(lowering.block(&body.stmts));
    if let Some(result) = &lowering.result {
        stmts.push(Stmt::ret(Some(Expr::var(result.as_str()))));
    }
    Function {
        body: Some(Block {
            stmts,
            span: body.span,
        }),
        ..func.clone()
    }
}

impl Lowering<'_> {
    /// Condition under which execution continues after a statement with
    /// the given exits.
    fn guard(&self, exits: Exits) -> Option<Expr> {
        let mut flags = Vec::new();
        if exits.ret {
            flags.extend(self.returned.as_ref());
        }
        if let Some(current) = self.loops.last() {
            if exits.brk {
                flags.extend(current.brk.as_ref());
            }
            if exits.cont {
                flags.extend(current.cont.as_ref());
            }
        }
        none_set(&flags)
    }

    fn block(&mut self, stmts: &[Stmt]) -> Vec<Stmt> {
        let mut out = Vec::new();
        for (k, s) in stmts.iter().enumerate() {
            out.extend(self.stmt(s));
            let rest = &stmts[k + 1..];
            if rest.is_empty() {
                break;
            }
            if let Some(cond) = self.guard(stmt_exits(s)) {
                let rest = self.block(rest);
                out.push(Stmt::if_(cond, rest, None));
                break;
            }
        }
        out
    }

    fn sub_block(&mut self, b: &Block) -> Block {
        Block {
            stmts: self.block(&b.stmts),
            span: b.span,
        }
    }

    fn stmt(&mut self, s: &Stmt) -> Vec<Stmt> {
        let rebuilt = |kind: StmtKind| vec![Stmt::new(kind, s.span)];
        match &s.kind {
            StmtKind::Return(value) => {
                let Some(flag) = &self.returned else {
                    return vec![s.clone()];
                };
                let mut out = Vec::new();
                if let (Some(result), Some(v)) = (&self.result, value) {
                    out.push(Stmt::new(
                        StmtKind::Assign {
                            target: Expr::var(result.as_str()),
                            op: AssignOp::Set,
                            value: v.clone(),
                        },
                        s.span,
                    ));
                }
                out.push(set(flag, true));
                out
            }
            StmtKind::Break => match self.loops.last().and_then(|l| l.brk.as_ref()) {
                Some(flag) => vec![set(flag, true)],
                None => vec![s.clone()],
            },
            StmtKind::Continue => match self.loops.last().and_then(|l| l.cont.as_ref()) {
                Some(flag) => vec![set(flag, true)],
                None => vec![s.clone()],
            },
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let then_block = self.sub_block(then_block);
                let else_block = else_block.as_ref().map(|b| self.sub_block(b));
                rebuilt(StmtKind::If {
                    cond: cond.clone(),
                    then_block,
                    else_block,
                })
            }
            StmtKind::Block(b) => {
                let b = self.sub_block(b);
                rebuilt(StmtKind::Block(b))
            }
            StmtKind::While { cond, body } => {
                let (mut pre, stop, body) = self.loop_body(body);
                let cond = match stop {
                    Some(stop) => Expr::binary(BinOp::And, stop, cond.clone()),
                    None => cond.clone(),
                };
                pre.push(Stmt::new(StmtKind::While { cond, body }, s.span));
                pre
            }
            StmtKind::For {
                var,
                var_span,
                start,
                end,
                body,
            } => {
                let (mut pre, stop, body) = self.loop_body(body);
                // The range is fixed, so the remaining iterations run empty.
                let body = match stop {
                    Some(stop) => Block {
                        stmts: vec![Stmt::if_(stop, body.stmts, None)],
                        span: body.span,
                    },
                    None => body,
                };
                pre.push(Stmt::new(
                    StmtKind::For {
                        var: var.clone(),
                        var_span: *var_span,
                        start: start.clone(),
                        end: end.clone(),
                        body,
                    },
                    s.span,
                ));
                pre
            }
            StmtKind::Let { .. } | StmtKind::Assign { .. } | StmtKind::Expr(_) => vec![s.clone()],
        }
    }

    /// Lower a loop body. Returns the flag resets to run before the loop,
    /// the condition for starting another iteration, and the new body.
    fn loop_body(&mut self, body: &Block) -> (Vec<Stmt>, Option<Expr>, Block) {
        let exits = block_exits(&body.stmts);
        let flags = LoopFlags {
            brk: exits.brk.then(|| self.names.numbered("_break")),
            cont: exits.cont.then(|| self.names.numbered("_continue")),
        };
        self.loops.push(flags);
        let mut stmts = self.block(&body.stmts);
        let flags = self.loops.pop().unwrap_or_default();

        let mut pre = Vec::new();
        let mut stops = Vec::new();
        if exits.ret {
            stops.extend(self.returned.as_ref());
        }
        if let Some(brk) = &flags.brk {
            pre.push(Stmt::let_(brk.clone(), Type::Bool, Some(Expr::boolean(false))));
            stops.push(brk);
        }
        if let Some(cont) = &flags.cont {
            pre.push(Stmt::let_(cont.clone(), Type::Bool, Some(Expr::boolean(false))));
            stmts.insert(0, set(cont, false));
        }
        let stop = none_set(&stops);
        (
            pre,
            stop,
            Block {
                stmts,
                span: body.span,
            },
        )
    }
}
