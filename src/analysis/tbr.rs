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

//! To-be-recorded (TBR) analysis.
//!
//! Finds the assignments whose overwritten value is still needed by the
//! reverse sweep. The pass walks the control-flow graph forward: a use whose
//! local partial derivative reads the value marks its access path USEFUL,
//! and a definition of a USEFUL path is recorded before the path is reset
//! to USELESS. Joins take the union of USEFUL paths, so the result may
//! over-record but never misses a needed value.
//!
//! Per-block state lives in an arena indexed by block id. A block only
//! stores the entries it changed; everything else is inherited through the
//! `prev` link to its earliest-visited predecessor.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use crate::ast::{AssignOp, BinOp, Block, Expr, ExprKind, Function, Span, StmtKind, UnaryOp};
use crate::cfg::{BlockId, Cfg, Element, ENTRY};
use crate::diff::registry::has_constructor_pullback;
use crate::diff::DiffError;
use crate::types::{is_builtin, is_differentiable, TypeEnv};

use super::may_write_param;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbrStatus {
    /// The current value is read by the reverse sweep.
    Useful,
    /// The current value is not needed.
    Useless,
    /// No path to this point has touched the location.
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathElem {
    Field(String),
    /// Constant index, or `None` when the index is not a literal.
    Index(Option<i64>),
}

impl PathElem {
    fn overlaps(&self, other: &PathElem) -> bool {
        match (self, other) {
            (PathElem::Field(a), PathElem::Field(b)) => a == b,
            (PathElem::Index(a), PathElem::Index(b)) => a.is_none() || b.is_none() || a == b,
            _ => false,
        }
    }
}

/// Structural identity of a storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessPath {
    pub root: String,
    pub elems: Vec<PathElem>,
}

impl AccessPath {
    pub fn var(root: impl Into<String>) -> Self {
        AccessPath {
            root: root.into(),
            elems: Vec::new(),
        }
    }

    /// Path of a place expression (`x`, `a[3]`, `a[k].y`).
    pub fn from_expr(e: &Expr) -> Option<AccessPath> {
        match &e.kind {
            ExprKind::Var(name) => Some(AccessPath::var(name.clone())),
            ExprKind::Index { base, index } => {
                let mut path = AccessPath::from_expr(base)?;
                let idx = match &index.kind {
                    ExprKind::Int(v) => Some(*v),
                    _ => None,
                };
                path.elems.push(PathElem::Index(idx));
                Some(path)
            }
            ExprKind::Field { base, field } => {
                let mut path = AccessPath::from_expr(base)?;
                path.elems.push(PathElem::Field(field.clone()));
                Some(path)
            }
            _ => None,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn has_wildcard(&self) -> bool {
        self.elems.iter().any(|e| matches!(e, PathElem::Index(None)))
    }

    /// Whether the two paths may name overlapping storage: one is a prefix
    /// of the other once wildcard indices are allowed to match anything.
    pub fn overlaps(&self, other: &AccessPath) -> bool {
        self.root == other.root
            && self
                .elems
                .iter()
                .zip(other.elems.iter())
                .all(|(a, b)| a.overlaps(b))
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn covers(&self, other: &AccessPath) -> bool {
        self.root == other.root
            && self.elems.len() <= other.elems.len()
            && self.elems.iter().zip(other.elems.iter()).all(|(a, b)| a == b)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TbrOptions {
    pub max_passes: usize,
    /// Treat every assigned value as read afterwards (error estimation
    /// reads each assignment's result in the reverse sweep).
    pub mark_assigned_useful: bool,
}

impl Default for TbrOptions {
    fn default() -> Self {
        TbrOptions {
            max_passes: 64,
            mark_assigned_useful: false,
        }
    }
}

/// Source positions whose overwritten value must be taped.
#[derive(Debug, Clone, Default)]
pub struct TbrResult {
    locations: HashSet<Span>,
    record_all: bool,
}

impl TbrResult {
    /// Result that records every definition.
    pub fn record_all() -> Self {
        TbrResult {
            locations: HashSet::new(),
            record_all: true,
        }
    }

    pub fn is_recorded(&self, span: Span) -> bool {
        self.record_all || self.locations.contains(&span)
    }

    pub fn locations(&self) -> &HashSet<Span> {
        &self.locations
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty() && !self.record_all
    }
}

#[derive(Debug, Default, Clone)]
struct VarsData {
    entries: HashMap<AccessPath, TbrStatus>,
    prev: Option<BlockId>,
}

struct Analyzer<'e, 'p> {
    env: &'e TypeEnv<'p>,
    function: String,
    options: TbrOptions,
    data: Vec<VarsData>,
    /// Order in which blocks were first visited; `None` = unvisited.
    visit_order: Vec<Option<usize>>,
    pass_counter: Vec<usize>,
    useful_out: Vec<Option<BTreeSet<AccessPath>>>,
    locations: HashSet<Span>,
    current: BlockId,
}

impl<'e, 'p> Analyzer<'e, 'p> {
    fn nearest(&self, block: BlockId, key: &AccessPath) -> TbrStatus {
        let mut at = Some(block);
        while let Some(b) = at {
            if let Some(status) = self.data[b].entries.get(key) {
                return *status;
            }
            at = self.data[b].prev;
        }
        TbrStatus::Undefined
    }

    /// Every path known in the view of `block`, each with its nearest status.
    fn view(&self, block: BlockId) -> HashMap<AccessPath, TbrStatus> {
        let mut seen: HashMap<AccessPath, TbrStatus> = HashMap::new();
        let mut at = Some(block);
        while let Some(b) = at {
            for (k, v) in &self.data[b].entries {
                seen.entry(k.clone()).or_insert(*v);
            }
            at = self.data[b].prev;
        }
        seen
    }

    fn useful_set(&self, block: BlockId) -> BTreeSet<AccessPath> {
        self.view(block)
            .into_iter()
            .filter(|(_, v)| *v == TbrStatus::Useful)
            .map(|(k, _)| k)
            .collect()
    }

    fn is_useful(&self, path: &AccessPath) -> bool {
        if self.nearest(self.current, path) == TbrStatus::Useful {
            return true;
        }
        self.view(self.current)
            .into_iter()
            .any(|(k, v)| v == TbrStatus::Useful && k.overlaps(path))
    }

    fn set(&mut self, path: AccessPath, status: TbrStatus) {
        self.data[self.current].entries.insert(path, status);
    }

    fn mark_useful(&mut self, path: AccessPath) {
        if path.has_wildcard() || path.elems.is_empty() {
            let matching: Vec<AccessPath> = self
                .view(self.current)
                .into_keys()
                .filter(|k| k != &path && k.overlaps(&path))
                .collect();
            for k in matching {
                self.set(k, TbrStatus::Useful);
            }
        }
        self.set(path, TbrStatus::Useful);
    }

    fn define(&mut self, path: AccessPath, at: Span) {
        if self.is_useful(&path) {
            self.locations.insert(at);
        }
        if path.has_wildcard() {
            return;
        }
        let descendants: Vec<AccessPath> = self
            .view(self.current)
            .into_keys()
            .filter(|k| k != &path && path.covers(k))
            .collect();
        for k in descendants {
            self.set(k, TbrStatus::Useless);
        }
        self.set(path.clone(), TbrStatus::Useless);
        if self.options.mark_assigned_useful {
            self.set(path, TbrStatus::Useful);
        }
    }

    /// Visit an expression. `marking` is set while the enclosing statement
    /// feeds a differentiable value; `nonlinear` while the current operand's
    /// value enters a local partial derivative.
    fn visit(&mut self, e: &Expr, marking: bool, nonlinear: bool) {
        match &e.kind {
            ExprKind::Float(_) | ExprKind::Int(_) | ExprKind::Bool(_) | ExprKind::Tag(_) => {}
            ExprKind::Var(_) | ExprKind::Index { .. } | ExprKind::Field { .. } => {
                self.visit_indices(e, marking);
                if marking && nonlinear {
                    if let Some(path) = AccessPath::from_expr(e) {
                        self.mark_useful(path);
                    }
                }
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => self.visit(operand, marking, nonlinear),
                UnaryOp::Not => self.visit(operand, marking, true),
            },
            ExprKind::Binary { op, left, right } => {
                let nl = nonlinear || !matches!(op, BinOp::Add | BinOp::Sub);
                self.visit(left, marking, nl);
                self.visit(right, marking, nl);
            }
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                self.visit(cond, marking, true);
                self.visit(then_expr, marking, nonlinear);
                self.visit(else_expr, marking, nonlinear);
            }
            ExprKind::Call { callee, args } => {
                if callee == "len" {
                    return;
                }
                for a in args {
                    self.visit(a, marking, true);
                }
            }
            ExprKind::StructLit { name, fields } => {
                // A user pullback reads every field value.
                let nl = nonlinear || has_constructor_pullback(self.env.program(), name);
                for (_, f) in fields {
                    self.visit(f, marking, nl);
                }
            }
            ExprKind::ArrayFill { value, len } => {
                self.visit(value, marking, nonlinear);
                self.visit(len, false, false);
            }
            ExprKind::ArrayLit(items) => {
                for i in items {
                    self.visit(i, marking, nonlinear);
                }
            }
        }
    }

    /// Index expressions inside a place are re-evaluated by the reverse sweep.
    fn visit_indices(&mut self, e: &Expr, marking: bool) {
        match &e.kind {
            ExprKind::Index { base, index } => {
                self.visit_indices(base, marking);
                self.visit(index, marking, true);
            }
            ExprKind::Field { base, .. } => self.visit_indices(base, marking),
            _ => {}
        }
    }

    /// Arguments bound to parameters the callee may write are read by the
    /// callee's pullback and then overwritten.
    fn visit_call_effects(&mut self, e: &Expr) {
        let program = self.env.program();
        let mut effects: Vec<Expr> = Vec::new();
        e.walk(&mut |sub| {
            if let ExprKind::Call { callee, args } = &sub.kind {
                if callee.starts_with("__") || is_builtin(callee) {
                    return;
                }
                let Some(target) = program
                    .functions_named(callee)
                    .find(|f| f.params.len() == args.len())
                else {
                    return;
                };
                for (i, arg) in args.iter().enumerate() {
                    if arg.is_place() && may_write_param(program, target, i) {
                        effects.push(arg.clone());
                    }
                }
            }
        });
        for arg in effects {
            if let Some(path) = AccessPath::from_expr(&arg) {
                self.mark_useful(path.clone());
                self.define(path, arg.span);
            }
        }
    }

    fn element(&mut self, el: &Element<'_>) {
        match *el {
            Element::Let {
                name,
                name_span,
                ty,
                value,
            } => {
                let marking = is_differentiable(self.env.program(), ty);
                if let Some(v) = value {
                    self.visit(v, marking, false);
                    self.visit_call_effects(v);
                }
                self.define(AccessPath::var(name), name_span);
            }
            Element::Assign { target, op, value } => {
                let marking = self.env.is_active(target);
                self.visit_indices(target, true);
                if marking && matches!(op, AssignOp::Mul | AssignOp::Div) {
                    if let Some(path) = AccessPath::from_expr(target) {
                        self.mark_useful(path);
                    }
                }
                if matches!(op, AssignOp::Mul | AssignOp::Div) {
                    self.visit(value, marking, true);
                } else {
                    self.visit(value, marking, false);
                }
                self.visit_call_effects(value);
                if let Some(path) = AccessPath::from_expr(target) {
                    self.define(path, target.span);
                }
            }
            Element::Expr(e) => {
                self.visit(e, true, false);
                self.visit_call_effects(e);
            }
            Element::Cond(c) => self.visit(c, false, false),
            Element::ForInit {
                var,
                var_span,
                start,
                end,
            } => {
                self.visit(start, false, false);
                self.visit(end, false, false);
                self.define(AccessPath::var(var), var_span);
            }
            Element::ForStep { var, var_span } => {
                self.define(AccessPath::var(var), var_span);
            }
            Element::Return(value) => {
                if let Some(v) = value {
                    let marking = self.env.is_active(v);
                    self.visit(v, marking, false);
                    self.visit_call_effects(v);
                }
            }
        }
    }

    /// Rebuild the entry state of `block` from its processed predecessors.
    fn merge_predecessors(&mut self, cfg: &Cfg<'_>, block: BlockId) {
        let mut preds: Vec<(usize, BlockId)> = cfg
            .block(block)
            .preds
            .iter()
            .filter(|&&p| p != block)
            .filter_map(|&p| self.visit_order[p].map(|o| (o, p)))
            .collect();
        preds.sort();
        let mut data = VarsData {
            entries: HashMap::new(),
            prev: preds.first().map(|&(_, p)| p),
        };
        if let Some(&(_, first)) = preds.first() {
            let base = self.useful_set(first);
            let mut extra: Vec<AccessPath> = Vec::new();
            for &(_, p) in preds.iter().skip(1) {
                extra.extend(self.useful_set(p).into_iter().filter(|k| !base.contains(k)));
            }
            // A self-loop contributes its own previous exit state.
            if cfg.block(block).preds.contains(&block) {
                if let Some(own) = &self.useful_out[block] {
                    extra.extend(own.iter().filter(|k| !base.contains(*k)).cloned());
                }
            }
            for k in extra {
                data.entries.insert(k, TbrStatus::Useful);
            }
        }
        self.data[block] = data;
    }

    fn run(&mut self, cfg: &Cfg<'_>) -> Result<(), DiffError> {
        let mut queue: VecDeque<BlockId> = VecDeque::from([ENTRY]);
        let mut queued = vec![false; cfg.len()];
        queued[ENTRY] = true;
        let mut next_order = 0usize;

        while let Some(block) = queue.pop_front() {
            queued[block] = false;
            self.pass_counter[block] += 1;
            if self.pass_counter[block] > self.options.max_passes {
                return Err(DiffError::AnalysisDidNotConverge {
                    function: self.function.clone(),
                    passes: self.options.max_passes,
                });
            }
            if self.visit_order[block].is_none() {
                self.visit_order[block] = Some(next_order);
                next_order += 1;
            }

            self.merge_predecessors(cfg, block);
            self.current = block;
            for el in &cfg.block(block).elements {
                self.element(el);
            }

            let out = self.useful_set(block);
            let changed = self.useful_out[block].as_ref() != Some(&out);
            self.useful_out[block] = Some(out);
            for &s in &cfg.block(block).succs {
                let unvisited = self.visit_order[s].is_none();
                if (changed || unvisited) && !queued[s] {
                    queued[s] = true;
                    queue.push_back(s);
                }
            }
        }
        Ok(())
    }
}

/// Run the analysis over `func`.
pub fn analyze(
    func: &Function,
    env: &TypeEnv<'_>,
    options: TbrOptions,
) -> Result<TbrResult, DiffError> {
    let cfg = Cfg::build(func);
    let n = cfg.len();
    let mut analyzer = Analyzer {
        env,
        function: func.qualified_name(),
        options,
        data: vec![VarsData::default(); n],
        visit_order: vec![None; n],
        pass_counter: vec![0; n],
        useful_out: vec![None; n],
        locations: HashSet::new(),
        current: ENTRY,
    };
    analyzer.run(&cfg)?;
    Ok(TbrResult {
        locations: analyzer.locations,
        record_all: false,
    })
}

/// Give every definition site in `func` its own span.
///
/// Results are keyed by span, so generated statements (which carry the
/// default span) and statements duplicated by a rewrite are renumbered
/// from a range no source file reaches.
pub fn distinct_def_spans(func: &mut Function) {
    let mut seen = HashSet::new();
    let mut next = usize::MAX / 2;
    if let Some(body) = &mut func.body {
        renumber_block(body, &mut seen, &mut next);
    }
}

fn fresh_span(span: &mut Span, seen: &mut HashSet<Span>, next: &mut usize) {
    if span.is_synthetic() || !seen.insert(*span) {
        *span = Span::new(*next, *next + 1);
        *next += 1;
        seen.insert(*span);
    }
}

fn renumber_block(block: &mut Block, seen: &mut HashSet<Span>, next: &mut usize) {
    for stmt in &mut block.stmts {
        match &mut stmt.kind {
            StmtKind::Let {
                name_span, value, ..
            } => {
                if let Some(v) = value {
                    renumber_args(v, seen, next);
                }
                fresh_span(name_span, seen, next);
            }
            StmtKind::Assign { target, value, .. } => {
                renumber_args(value, seen, next);
                fresh_span(&mut target.span, seen, next);
            }
            StmtKind::Expr(e) | StmtKind::Return(Some(e)) => renumber_args(e, seen, next),
            StmtKind::If {
                then_block,
                else_block,
                ..
            } => {
                renumber_block(then_block, seen, next);
                if let Some(b) = else_block {
                    renumber_block(b, seen, next);
                }
            }
            StmtKind::While { body, .. } => renumber_block(body, seen, next),
            StmtKind::For { var_span, body, .. } => {
                fresh_span(var_span, seen, next);
                renumber_block(body, seen, next);
            }
            StmtKind::Block(b) => renumber_block(b, seen, next),
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
        }
    }
}

/// Place arguments of calls are definition sites when the callee writes them.
fn renumber_args(e: &mut Expr, seen: &mut HashSet<Span>, next: &mut usize) {
    match &mut e.kind {
        ExprKind::Call { args, .. } => {
            for a in args {
                renumber_args(a, seen, next);
                if a.is_place() {
                    fresh_span(&mut a.span, seen, next);
                }
            }
        }
        ExprKind::Index { base, index } => {
            renumber_args(base, seen, next);
            renumber_args(index, seen, next);
        }
        ExprKind::Field { base, .. } => renumber_args(base, seen, next),
        ExprKind::Unary { operand, .. } => renumber_args(operand, seen, next),
        ExprKind::Binary { left, right, .. } => {
            renumber_args(left, seen, next);
            renumber_args(right, seen, next);
        }
        ExprKind::Cond {
            cond,
            then_expr,
            else_expr,
        } => {
            renumber_args(cond, seen, next);
            renumber_args(then_expr, seen, next);
            renumber_args(else_expr, seen, next);
        }
        ExprKind::StructLit { fields, .. } => {
            for (_, f) in fields {
                renumber_args(f, seen, next);
            }
        }
        ExprKind::ArrayFill { value, len } => {
            renumber_args(value, seen, next);
            renumber_args(len, seen, next);
        }
        ExprKind::ArrayLit(items) => {
            for i in items {
                renumber_args(i, seen, next);
            }
        }
        ExprKind::Float(_)
        | ExprKind::Int(_)
        | ExprKind::Bool(_)
        | ExprKind::Var(_)
        | ExprKind::Tag(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::parser;

    fn run(src: &str) -> (Program, TbrResult) {
        let program = parser::parse(src).expect("parse");
        let f = program.functions[0].clone();
        let env = TypeEnv::for_function(&program, &f).expect("env");
        let result = analyze(&f, &env, TbrOptions::default()).expect("tbr");
        (program.clone(), result)
    }

    fn assign_spans(program: &Program) -> Vec<(String, Span)> {
        let mut out = Vec::new();
        if let Some(body) = &program.functions[0].body {
            body.walk(&mut |s| {
                if let StmtKind::Assign { target, .. } = &s.kind {
                    out.push((target.to_string(), target.span));
                }
            });
        }
        out
    }

    #[test]
    fn overwritten_factor_is_recorded() {
        let (program, tbr) = run(
            "fn f(x: f64, y: f64) -> f64 { let t: f64 = x * y; x = 3.0; return t; }",
        );
        let spans = assign_spans(&program);
        assert!(tbr.is_recorded(spans[0].1), "x was read by x * y");
    }

    #[test]
    fn linear_use_is_not_recorded() {
        let (program, tbr) = run(
            "fn f(x: f64, y: f64) -> f64 { let t: f64 = x + y; x = 3.0; return t + x; }",
        );
        let spans = assign_spans(&program);
        assert!(!tbr.is_recorded(spans[0].1));
    }

    #[test]
    fn dead_value_is_not_recorded() {
        let (program, tbr) = run(
            "fn f(x: f64) -> f64 { let t: f64 = 2.0; t = x; t = x * 4.0; return t; }",
        );
        let spans = assign_spans(&program);
        assert!(spans.iter().all(|(_, s)| !tbr.is_recorded(*s)));
    }

    #[test]
    fn branch_use_reaches_join() {
        let (program, tbr) = run(
            "fn f(x: f64, c: bool) -> f64 {
                let y: f64 = 0.0;
                if c { y = x * x; } else { y = 1.0; }
                x = 0.0;
                return y;
            }",
        );
        let spans = assign_spans(&program);
        let (_, last) = spans.iter().find(|(t, _)| t == "x").expect("x assignment");
        assert!(tbr.is_recorded(*last));
    }

    #[test]
    fn loop_carried_value_is_recorded() {
        let (program, tbr) = run(
            "fn f(x: f64) -> f64 { let p: f64 = 1.0; for i in 0..3 { p = p * x; } return p; }",
        );
        let spans = assign_spans(&program);
        assert!(tbr.is_recorded(spans[0].1), "p is read by the next iteration's product");
    }

    #[test]
    fn wildcard_use_covers_constant_elements() {
        let (program, tbr) = run(
            "fn f(a: [f64], k: i64) -> f64 { let s: f64 = a[k] * a[k]; a[2] = 0.0; return s; }",
        );
        let spans = assign_spans(&program);
        assert!(tbr.is_recorded(spans[0].1));
    }

    #[test]
    fn distinct_constant_elements_do_not_alias() {
        let (program, tbr) = run(
            "fn f(a: [f64]) -> f64 { let s: f64 = a[1] * a[1]; a[2] = 0.0; return s; }",
        );
        let spans = assign_spans(&program);
        assert!(!tbr.is_recorded(spans[0].1));
    }

    #[test]
    fn paths_have_stable_fingerprints() {
        let a = AccessPath::from_expr(&parser::parse_expr("p.x").expect("expr")).expect("path");
        let b = AccessPath {
            root: "p".into(),
            elems: vec![PathElem::Field("x".into())],
        };
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        let w = AccessPath::from_expr(&parser::parse_expr("a[k]").expect("expr")).expect("path");
        let c = AccessPath::from_expr(&parser::parse_expr("a[3]").expect("expr")).expect("path");
        assert!(w.has_wildcard() && w.overlaps(&c) && !c.covers(&w));
    }

    #[test]
    fn generated_sites_get_distinct_spans() {
        let mut program =
            parser::parse("fn f(x: f64) -> f64 { let y: f64 = x; y = y * x; return y; }")
                .expect("parse");
        let f = &mut program.functions[0];
        if let Some(body) = &mut f.body {
            body.stmts.push(crate::ast::Stmt::assign(Expr::var("y"), Expr::float(1.0)));
            body.stmts.push(crate::ast::Stmt::assign(Expr::var("y"), Expr::float(2.0)));
        }
        distinct_def_spans(f);
        let spans: Vec<Span> = assign_spans(&program).into_iter().map(|(_, s)| s).collect();
        let unique: HashSet<Span> = spans.iter().copied().collect();
        assert_eq!(unique.len(), spans.len());
        assert!(spans.iter().all(|s| !s.is_synthetic()));
    }

    #[test]
    fn iteration_cap_is_reported() {
        let program = parser::parse(
            "fn f(x: f64) -> f64 {
                let p: f64 = 1.0;
                let q: f64 = 1.0;
                while p < 10.0 { q = q * p; p = p * x; }
                return q;
            }",
        )
        .expect("parse");
        let f = program.functions[0].clone();
        let env = TypeEnv::for_function(&program, &f).expect("env");
        let err = analyze(
            &f,
            &env,
            TbrOptions {
                max_passes: 1,
                mark_assigned_useful: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DiffError::AnalysisDidNotConverge { .. }));
    }
}
