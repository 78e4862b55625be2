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

//! Control-flow graph over a function body.
//!
//! Blocks hold borrowed elements of the syntax tree in execution order.
//! Block [`ENTRY`] starts the function and block [`EXIT`] collects every
//! `return` and the fall-through end of the body.

use crate::ast::{AssignOp, Block, Expr, Function, Span, StmtKind, Type};

pub type BlockId = usize;

pub const ENTRY: BlockId = 0;
pub const EXIT: BlockId = 1;

#[derive(Debug, Clone, Copy)]
pub enum Element<'a> {
    Let {
        name: &'a str,
        name_span: Span,
        ty: &'a Type,
        value: Option<&'a Expr>,
    },
    Assign {
        target: &'a Expr,
        op: AssignOp,
        value: &'a Expr,
    },
    Expr(&'a Expr),
    /// Branch condition of an `if` or `while`.
    Cond(&'a Expr),
    /// Evaluates the range bounds and defines the loop variable.
    ForInit {
        var: &'a str,
        var_span: Span,
        start: &'a Expr,
        end: &'a Expr,
    },
    /// Advances the loop variable at the latch.
    ForStep { var: &'a str, var_span: Span },
    Return(Option<&'a Expr>),
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock<'a> {
    pub elements: Vec<Element<'a>>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
}

#[derive(Debug, Clone)]
pub struct Cfg<'a> {
    pub blocks: Vec<BasicBlock<'a>>,
}

struct LoopTargets {
    brk: BlockId,
    cont: BlockId,
}

struct Builder<'a> {
    blocks: Vec<BasicBlock<'a>>,
    loops: Vec<LoopTargets>,
}

impl<'a> Builder<'a> {
    fn fresh(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default());
        self.blocks.len() - 1
    }

    fn edge(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
            self.blocks[to].preds.push(from);
        }
    }

    fn push(&mut self, at: BlockId, element: Element<'a>) {
        self.blocks[at].elements.push(element);
    }

    /// Lower `block` starting in `cur`; returns the block control falls out
    /// of, or `None` when every path left through return/break/continue.
    fn lower(&mut self, block: &'a Block, mut cur: BlockId) -> Option<BlockId> {
        let mut reachable = true;
        for stmt in &block.stmts {
            if !reachable {
                cur = self.fresh();
                reachable = true;
            }
            match &stmt.kind {
                StmtKind::Let {
                    name,
                    name_span,
                    ty,
                    value,
                } => self.push(
                    cur,
                    Element::Let {
                        name,
                        name_span: *name_span,
                        ty,
                        value: value.as_ref(),
                    },
                ),
                StmtKind::Assign { target, op, value } => self.push(
                    cur,
                    Element::Assign {
                        target,
                        op: *op,
                        value,
                    },
                ),
                StmtKind::Expr(e) => self.push(cur, Element::Expr(e)),
                StmtKind::If {
                    cond,
                    then_block,
                    else_block,
                } => {
                    self.push(cur, Element::Cond(cond));
                    let join = self.fresh();
                    let then_start = self.fresh();
                    self.edge(cur, then_start);
                    if let Some(end) = self.lower(then_block, then_start) {
                        self.edge(end, join);
                    }
                    match else_block {
                        Some(else_block) => {
                            let else_start = self.fresh();
                            self.edge(cur, else_start);
                            if let Some(end) = self.lower(else_block, else_start) {
                                self.edge(end, join);
                            }
                        }
                        None => self.edge(cur, join),
                    }
                    cur = join;
                }
                StmtKind::While { cond, body } => {
                    let header = self.fresh();
                    let body_start = self.fresh();
                    let after = self.fresh();
                    self.edge(cur, header);
                    self.push(header, Element::Cond(cond));
                    self.edge(header, body_start);
                    self.edge(header, after);
                    self.loops.push(LoopTargets {
                        brk: after,
                        cont: header,
                    });
                    if let Some(end) = self.lower(body, body_start) {
                        self.edge(end, header);
                    }
                    self.loops.pop();
                    cur = after;
                }
                StmtKind::For {
                    var,
                    var_span,
                    start,
                    end,
                    body,
                } => {
                    self.push(
                        cur,
                        Element::ForInit {
                            var,
                            var_span: *var_span,
                            start,
                            end,
                        },
                    );
                    let header = self.fresh();
                    let body_start = self.fresh();
                    let latch = self.fresh();
                    let after = self.fresh();
                    self.edge(cur, header);
                    self.edge(header, body_start);
                    self.edge(header, after);
                    self.loops.push(LoopTargets {
                        brk: after,
                        cont: latch,
                    });
                    if let Some(end) = self.lower(body, body_start) {
                        self.edge(end, latch);
                    }
                    self.loops.pop();
                    self.push(
                        latch,
                        Element::ForStep {
                            var,
                            var_span: *var_span,
                        },
                    );
                    self.edge(latch, header);
                    cur = after;
                }
                StmtKind::Return(value) => {
                    self.push(cur, Element::Return(value.as_ref()));
                    self.edge(cur, EXIT);
                    reachable = false;
                }
                StmtKind::Break | StmtKind::Continue => {
                    if let Some(targets) = self.loops.last() {
                        let to = if matches!(stmt.kind, StmtKind::Break) {
                            targets.brk
                        } else {
                            targets.cont
                        };
                        self.edge(cur, to);
                    }
                    reachable = false;
                }
                StmtKind::Block(inner) => match self.lower(inner, cur) {
                    Some(end) => cur = end,
                    None => reachable = false,
                },
            }
        }
        reachable.then_some(cur)
    }
}

impl<'a> Cfg<'a> {
    pub fn build(func: &'a Function) -> Cfg<'a> {
        let mut builder = Builder {
            blocks: vec![BasicBlock::default(), BasicBlock::default()],
            loops: Vec::new(),
        };
        if let Some(body) = &func.body {
            let start = builder.fresh();
            builder.edge(ENTRY, start);
            if let Some(end) = builder.lower(body, start) {
                builder.edge(end, EXIT);
            }
        } else {
            builder.edge(ENTRY, EXIT);
        }
        Cfg {
            blocks: builder.blocks,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock<'a> {
        &self.blocks[id]
    }

    /// Blocks reachable from the entry, in breadth-first order.
    pub fn reachable(&self) -> Vec<BlockId> {
        let mut seen = vec![false; self.blocks.len()];
        let mut order = vec![ENTRY];
        seen[ENTRY] = true;
        let mut i = 0;
        while i < order.len() {
            for &s in &self.blocks[order[i]].succs {
                if !seen[s] {
                    seen[s] = true;
                    order.push(s);
                }
            }
            i += 1;
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[test]
    fn loop_has_back_edge() {
        let program = parser::parse(
            "fn f(x: f64) -> f64 { let s: f64 = 0.0; for i in 0..3 { s += x; } return s; }",
        )
        .expect("parse");
        let cfg = Cfg::build(&program.functions[0]);
        let latch = cfg
            .blocks
            .iter()
            .position(|b| b.elements.iter().any(|e| matches!(e, Element::ForStep { .. })))
            .expect("latch");
        let header = cfg.blocks[latch].succs[0];
        assert!(cfg.blocks[header].preds.len() == 2);
        assert!(cfg.reachable().contains(&EXIT));
    }

    #[test]
    fn break_and_return_leave_blocks() {
        let program = parser::parse(
            "fn f(x: f64) -> f64 {
                while x > 0.0 { if x > 5.0 { break; } x = x - 1.0; }
                return x;
                return 0.0;
            }",
        )
        .expect("parse");
        let cfg = Cfg::build(&program.functions[0]);
        let returns: Vec<_> = cfg
            .reachable()
            .into_iter()
            .filter(|&b| cfg.blocks[b].elements.iter().any(|e| matches!(e, Element::Return(_))))
            .collect();
        assert_eq!(returns.len(), 1, "second return is unreachable");
    }
}
