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

//! Request scheduling: memoisation, declaration-first registration of
//! nested requests, and rollback of failed requests.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use crate::ast::{qualify, Block, Expr, Function, Param, Program, Span, Stmt};
use crate::config::EngineConfig;

use super::error_estimate::{ErrorEstimationStack, ErrorModel};
use super::graph::{NodeState, RequestGraph, RequestNode};
use super::registry::{context_of, find_custom_derivative, is_non_differentiable};
use super::request::{
    adjoint_type, derived_name, differentiable_params, resolve_indeps, DiffMode, DiffRequest,
    IndepVar, MemoKey,
};
use super::{forward, hessian, jacobian, reverse, DerivativeResult, DiffError, NameGen};

/// Progress message recorded in verbose mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub function: String,
    pub message: String,
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.function, self.message)
    }
}

#[derive(Debug, Clone)]
struct MemoEntry {
    name: String,
    arity: usize,
    overload_arity: Option<usize>,
    node: Option<usize>,
}

/// A nested request whose declaration is registered and whose body is
/// still to be generated.
#[derive(Debug, Clone)]
struct Pending {
    func: Function,
    mode: DiffMode,
    indeps: Vec<IndepVar>,
    order: u32,
    key: MemoKey,
    node: usize,
}

/// Everything a transformation needs to know about the request it serves.
pub struct Target<'a> {
    /// Program as it was when the transformation started.
    pub program: &'a Program,
    pub func: &'a Function,
    pub mode: DiffMode,
    pub indeps: &'a [IndepVar],
    pub order: u32,
    /// Registered declaration of the derivative.
    pub signature: &'a Function,
    pub error_model: Option<Rc<dyn ErrorModel>>,
}

impl Target<'_> {
    pub fn function_name(&self) -> String {
        self.func.qualified_name()
    }
}

pub struct DerivativeBuilder {
    program: Program,
    config: EngineConfig,
    memo: HashMap<MemoKey, MemoEntry>,
    graph: RequestGraph,
    notes: Vec<Note>,
    errors: ErrorEstimationStack,
    active: Vec<usize>,
    pending: VecDeque<Pending>,
    verbose_request: bool,
}

impl DerivativeBuilder {
    pub fn new(program: Program, config: EngineConfig) -> Self {
        DerivativeBuilder {
            program,
            config,
            memo: HashMap::new(),
            graph: RequestGraph::new(),
            notes: Vec::new(),
            errors: ErrorEstimationStack::default(),
            active: Vec::new(),
            pending: VecDeque::new(),
            verbose_request: false,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn into_program(self) -> Program {
        self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &RequestGraph {
        &self.graph
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn take_notes(&mut self) -> Vec<Note> {
        std::mem::take(&mut self.notes)
    }

    /// Install `model` for the next error-estimation request.
    pub fn push_error_model(&mut self, model: Box<dyn ErrorModel>) {
        self.errors.push_model(model);
    }

    pub fn error_stack_depth(&self) -> usize {
        self.errors.depth()
    }

    pub(crate) fn note(&mut self, function: &str, message: impl Into<String>) {
        if self.config.verbose || self.verbose_request {
            self.notes.push(Note {
                function: function.to_string(),
                message: message.into(),
            });
        }
    }

    /// Derive `request` and everything it needs. On failure the program and
    /// the memo are left as they were before the call.
    pub fn derive(&mut self, request: &DiffRequest) -> Result<DerivativeResult, DiffError> {
        let function_mark = self.program.functions.len();
        let node_mark = self.graph.nodes().len();
        let memo_backup = self.memo.clone();
        let active_mark = self.active.len();
        self.verbose_request = request.verbose;

        let result = self.derive_request(request);
        if let Err(err) = &result {
            self.program.functions.truncate(function_mark);
            self.memo = memo_backup;
            self.pending.clear();
            self.active.truncate(active_mark);
            let failed: Vec<usize> = (node_mark..self.graph.nodes().len())
                .filter(|&id| {
                    self.graph.node(id).map(|n| n.state) == Some(NodeState::Pending)
                })
                .collect();
            for id in failed {
                self.graph.set_state(id, NodeState::Failed);
            }
            let name = err.function().to_string();
            self.note(&name, format!("failed: {}", err));
        }
        self.verbose_request = false;
        result
    }

    /// Fully derive `request` from inside a transformation and return the
    /// name to call.
    pub(crate) fn require(&mut self, request: &DiffRequest) -> Result<String, DiffError> {
        Ok(self.derive_request(request)?.name())
    }

    fn derive_request(&mut self, request: &DiffRequest) -> Result<DerivativeResult, DiffError> {
        let func = self.resolve_target(request)?;
        self.check_differentiable(&func)?;
        let fname = func.qualified_name();
        let indeps = resolve_indeps(
            &self.program,
            &func,
            request.mode,
            request.order,
            &request.args,
        )?;
        let list: Vec<String> = indeps.iter().map(|v| v.to_string()).collect();
        self.note(
            &fname,
            format!(
                "request {} w.r.t. [{}] order {}",
                request.mode,
                list.join(", "),
                request.order
            ),
        );

        let key = MemoKey {
            function: fname.clone(),
            arity: func.params.len(),
            mode: request.mode,
            indeps: indeps.clone(),
            order: request.order,
        };
        if let Some(entry) = self.memo.get(&key).cloned() {
            self.note(&fname, format!("memo hit: {}", entry.name));
            if let (Some(&top), Some(node)) = (self.active.last(), entry.node) {
                self.graph.add_edge(top, node, true);
            }
            return self.complete_memo_hit(&func, &key, &entry, request.declaration_only);
        }

        let base = self.base_name(&func, request.mode, &indeps);
        let signature = self.signature(&func, request.mode, &indeps, &base)?;
        let qname = signature.qualified_name();
        let arity = signature.params.len();

        if let Some(custom) = self.custom_derivative(&fname, &func, &signature)? {
            self.note(&fname, format!("using custom derivative {}", custom.qualified_name()));
            self.memo.insert(
                key,
                MemoEntry {
                    name: custom.qualified_name(),
                    arity: custom.params.len(),
                    overload_arity: None,
                    node: None,
                },
            );
            return Ok(DerivativeResult {
                primary: custom,
                overload: None,
            });
        }

        // Requests that differ only in order produce the same function.
        if let Some(entry) = self
            .memo
            .values()
            .find(|e| e.name == qname && e.arity == arity)
            .cloned()
        {
            self.memo.insert(key.clone(), entry.clone());
            return self.complete_memo_hit(&func, &key, &entry, request.declaration_only);
        }

        let node = self.graph.add_node(RequestNode {
            function: fname.clone(),
            name: qname.clone(),
            arity,
            mode: request.mode,
            indeps: list.join(", "),
            order: request.order,
            state: NodeState::Pending,
        });
        if let Some(&top) = self.active.last() {
            self.graph.add_edge(top, node, false);
        }

        if !request.declaration_only && func.body.is_none() {
            return Err(DiffError::NoDefinition {
                function: fname,
                span: Some(func.span),
            });
        }
        self.program.functions.push(signature.clone());
        self.memo.insert(
            key.clone(),
            MemoEntry {
                name: qname.clone(),
                arity,
                overload_arity: None,
                node: Some(node),
            },
        );
        if request.declaration_only {
            self.note(&fname, format!("declared {}", qname));
            return Ok(DerivativeResult {
                primary: signature,
                overload: None,
            });
        }

        let result = self.define(&func, request.mode, &indeps, request.order, &key, node)?;
        self.drain_pending()?;
        Ok(result)
    }

    fn complete_memo_hit(
        &mut self,
        func: &Function,
        key: &MemoKey,
        entry: &MemoEntry,
        declaration_only: bool,
    ) -> Result<DerivativeResult, DiffError> {
        let declared = self
            .find_function(&entry.name, entry.arity)
            .map(|f| f.is_declaration())
            .unwrap_or(false);
        let generated = entry.node.is_some();
        if declared && generated && !declaration_only {
            if self.pending.iter().any(|p| &p.key == key) {
                self.drain_pending()?;
            } else if !self.active.iter().any(|&a| Some(a) == entry.node) {
                let node = entry.node.unwrap_or_default();
                self.pending.push_back(Pending {
                    func: func.clone(),
                    mode: key.mode,
                    indeps: key.indeps.clone(),
                    order: key.order,
                    key: key.clone(),
                    node,
                });
                self.drain_pending()?;
            }
        }
        let entry = self.memo.get(key).cloned().unwrap_or_else(|| entry.clone());
        self.result_for(&entry)
    }

    fn result_for(&self, entry: &MemoEntry) -> Result<DerivativeResult, DiffError> {
        let primary = self
            .find_function(&entry.name, entry.arity)
            .cloned()
            .ok_or_else(|| DiffError::NoDefinition {
                function: entry.name.clone(),
                span: None,
            })?;
        let overload = entry
            .overload_arity
            .and_then(|a| self.find_function(&entry.name, a).cloned());
        Ok(DerivativeResult { primary, overload })
    }

    fn find_function(&self, name: &str, arity: usize) -> Option<&Function> {
        self.program
            .functions_named(name)
            .find(|f| f.params.len() == arity)
    }

    fn resolve_target(&self, request: &DiffRequest) -> Result<Function, DiffError> {
        let candidates: Vec<&Function> = self
            .program
            .functions_named(&request.function)
            .filter(|f| request.arity.map_or(true, |a| f.params.len() == a))
            .collect();
        match candidates.len() {
            0 => Err(DiffError::NoDefinition {
                function: request.function.clone(),
                span: None,
            }),
            1 => Ok(candidates[0].clone()),
            n => Err(DiffError::AmbiguousOverload {
                function: request.function.clone(),
                callee: request.function.clone(),
                candidates: n,
                span: None,
            }),
        }
    }

    fn check_differentiable(&self, func: &Function) -> Result<(), DiffError> {
        if func.non_differentiable {
            return Err(DiffError::NonDifferentiable {
                function: func.qualified_name(),
                span: Some(func.span),
            });
        }
        if is_non_differentiable(&self.program, func) {
            return Err(DiffError::NonDifferentiableType {
                function: func.qualified_name(),
                ty: func.owner.clone().unwrap_or_default(),
                span: Some(func.span),
            });
        }
        Ok(())
    }

    fn base_name(&self, func: &Function, mode: DiffMode, indeps: &[IndepVar]) -> String {
        let mut all = differentiable_params(&self.program, func);
        if mode == DiffMode::Jacobian {
            all.retain(|&i| i + 1 != func.params.len());
        }
        derived_name(&func.name, mode, indeps, &all)
    }

    fn signature(
        &self,
        func: &Function,
        mode: DiffMode,
        indeps: &[IndepVar],
        base: &str,
    ) -> Result<Function, DiffError> {
        match mode {
            DiffMode::Forward
            | DiffMode::Pushforward
            | DiffMode::VectorForward
            | DiffMode::VectorPushforward => {
                forward::signature(&self.program, func, mode, indeps, base)
            }
            DiffMode::Reverse
            | DiffMode::Pullback
            | DiffMode::ReverseForwardPass
            | DiffMode::ErrorEstimation => {
                reverse::signature(&self.program, func, mode, indeps, base)
            }
            DiffMode::Hessian | DiffMode::HessianDiagonal => {
                hessian::signature(&self.program, func, mode, indeps, base)
            }
            DiffMode::Jacobian => jacobian::signature(&self.program, func, indeps, base),
        }
    }

    fn custom_derivative(
        &self,
        caller: &str,
        func: &Function,
        signature: &Function,
    ) -> Result<Option<Function>, DiffError> {
        Ok(find_custom_derivative(
            &self.program,
            caller,
            &signature.name,
            &signature.param_types(),
            context_of(func),
        )?
        .cloned())
    }

    /// Generate the body of a registered declaration.
    fn define(
        &mut self,
        func: &Function,
        mode: DiffMode,
        indeps: &[IndepVar],
        order: u32,
        key: &MemoKey,
        node: usize,
    ) -> Result<DerivativeResult, DiffError> {
        let entry = self.memo.get(key).cloned().ok_or_else(|| DiffError::NoDefinition {
            function: key.function.clone(),
            span: None,
        })?;
        let signature = self
            .find_function(&entry.name, entry.arity)
            .cloned()
            .ok_or_else(|| DiffError::NoDefinition {
                function: entry.name.clone(),
                span: None,
            })?;
        let snapshot = self.program.clone();
        let error_model = if mode == DiffMode::ErrorEstimation {
            Some(self.errors.begin(&signature.qualified_name()))
        } else {
            None
        };
        let target = Target {
            program: &snapshot,
            func,
            mode,
            indeps,
            order,
            signature: &signature,
            error_model,
        };
        self.active.push(node);
        let body = self.transform(&target);
        self.active.pop();
        if mode == DiffMode::ErrorEstimation {
            self.errors.end();
        }
        let body = body?;

        let mut primary = signature.clone();
        primary.body = Some(body);
        if let Some(slot) = self
            .program
            .functions
            .iter_mut()
            .find(|f| f.qualified_name() == entry.name && f.params.len() == entry.arity)
        {
            *slot = primary.clone();
        }
        let overload = self.overload(func, mode, indeps, &primary);
        if let Some(o) = &overload {
            self.program.functions.push(o.clone());
            if let Some(e) = self.memo.get_mut(key) {
                e.overload_arity = Some(o.params.len());
            }
        }
        self.graph.mark_derived(node);
        self.note(&key.function, format!("registered {}", entry.name));
        Ok(DerivativeResult { primary, overload })
    }

    fn transform(&mut self, target: &Target<'_>) -> Result<Block, DiffError> {
        match target.mode {
            DiffMode::Forward
            | DiffMode::Pushforward
            | DiffMode::VectorForward
            | DiffMode::VectorPushforward => forward::derive(self, target),
            DiffMode::Reverse
            | DiffMode::Pullback
            | DiffMode::ReverseForwardPass
            | DiffMode::ErrorEstimation => reverse::derive(self, target),
            DiffMode::Hessian | DiffMode::HessianDiagonal => hessian::derive(self, target),
            DiffMode::Jacobian => jacobian::derive(self, target),
        }
    }

    fn drain_pending(&mut self) -> Result<(), DiffError> {
        while let Some(p) = self.pending.pop_front() {
            let defined = self
                .memo
                .get(&p.key)
                .and_then(|e| self.find_function(&e.name, e.arity))
                .map(|f| !f.is_declaration())
                .unwrap_or(false);
            if defined {
                continue;
            }
            self.define(&p.func, p.mode, &p.indeps, p.order, &p.key, p.node)?;
        }
        Ok(())
    }

    /// Name of the derivative of `callee` needed by the function being
    /// transformed. The definition is generated after the current
    /// transformation finishes.
    pub(crate) fn nested(
        &mut self,
        callee: &Function,
        mode: DiffMode,
        span: Span,
    ) -> Result<String, DiffError> {
        let fname = callee.qualified_name();
        self.check_differentiable(callee)?;
        let indeps = resolve_indeps(&self.program, callee, mode, 1, &[])?;
        let key = MemoKey {
            function: fname.clone(),
            arity: callee.params.len(),
            mode,
            indeps: indeps.clone(),
            order: 1,
        };
        if let Some(entry) = self.memo.get(&key).cloned() {
            if let (Some(&top), Some(node)) = (self.active.last(), entry.node) {
                self.graph.add_edge(top, node, true);
            }
            self.note(&fname, format!("{} already scheduled", entry.name));
            return Ok(entry.name);
        }
        let base = self.base_name(callee, mode, &indeps);
        let signature = self.signature(callee, mode, &indeps, &base)?;
        if let Some(custom) = self.custom_derivative(&fname, callee, &signature)? {
            let name = custom.qualified_name();
            self.note(&fname, format!("using custom derivative {}", name));
            self.memo.insert(
                key,
                MemoEntry {
                    name: name.clone(),
                    arity: custom.params.len(),
                    overload_arity: None,
                    node: None,
                },
            );
            return Ok(name);
        }
        if callee.body.is_none() {
            return Err(DiffError::NoDefinition {
                function: fname,
                span: Some(span),
            });
        }
        let qname = signature.qualified_name();
        let arity = signature.params.len();
        let node = self.graph.add_node(RequestNode {
            function: fname.clone(),
            name: qname.clone(),
            arity,
            mode,
            indeps: indeps
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            order: 1,
            state: NodeState::Pending,
        });
        if let Some(&top) = self.active.last() {
            self.graph.add_edge(top, node, false);
        }
        self.program.functions.push(signature);
        self.memo.insert(
            key.clone(),
            MemoEntry {
                name: qname.clone(),
                arity,
                overload_arity: None,
                node: Some(node),
            },
        );
        self.pending.push_back(Pending {
            func: callee.clone(),
            mode,
            indeps,
            order: 1,
            key,
            node,
        });
        self.note(&fname, format!("scheduled {}", qname));
        Ok(qname)
    }

    /// All-parameter overload for a request that covers only some
    /// parameters.
    fn overload(
        &self,
        func: &Function,
        mode: DiffMode,
        indeps: &[IndepVar],
        primary: &Function,
    ) -> Option<Function> {
        if !self.config.emit_overloads
            || !matches!(mode, DiffMode::Reverse | DiffMode::VectorForward)
        {
            return None;
        }
        let all = differentiable_params(&self.program, func);
        let mut requested: Vec<usize> = Vec::new();
        for v in indeps {
            if !requested.contains(&v.param) {
                requested.push(v.param);
            }
        }
        let mut sorted = requested.clone();
        sorted.sort_unstable();
        if sorted == all {
            return None;
        }

        let n = func.params.len();
        let mut names = NameGen::new(primary.params.iter().map(|p| p.name.clone()));
        let mut params = func.params.clone();
        let mut forwarded: HashMap<usize, String> = HashMap::new();
        for &i in &all {
            let p = &func.params[i];
            let name = match requested.iter().position(|&r| r == i) {
                Some(k) => primary.params[n + k].name.clone(),
                None => names.shadow(&p.name),
            };
            forwarded.insert(i, name.clone());
            params.push(Param::new(name, adjoint_type(&p.ty)));
        }
        let mut args: Vec<Expr> = func.params.iter().map(|p| Expr::var(p.name.clone())).collect();
        for i in &requested {
            args.push(Expr::var(forwarded.get(i).cloned().unwrap_or_default()));
        }
        let call = Expr::call(qualify(primary.owner.as_deref(), &primary.name), args);
        Some(Function {
            name: primary.name.clone(),
            owner: primary.owner.clone(),
            namespace: None,
            params,
            ret: primary.ret.clone(),
            body: Some(Block::new(vec![Stmt::expr(call), Stmt::ret(None)])),
            non_differentiable: false,
            span: primary.span,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn builder(src: &str) -> DerivativeBuilder {
        DerivativeBuilder::new(parser::parse(src).unwrap(), EngineConfig::default())
    }

    #[test]
    fn memoizes_identical_requests() {
        let mut b = builder("fn f(x: f64) -> f64 { return x * x; }");
        let req = DiffRequest::new("f", DiffMode::Reverse);
        let first = b.derive(&req).unwrap();
        let count = b.program().functions.len();
        let second = b.derive(&req).unwrap();
        assert_eq!(first, second);
        assert_eq!(b.program().functions.len(), count);
        assert_eq!(first.name(), "f_grad");
    }

    #[test]
    fn declaration_only_then_definition() {
        let mut b = builder("fn f(x: f64) -> f64 { return x * x; }");
        let decl = b
            .derive(&DiffRequest::new("f", DiffMode::Pullback).declaration_only())
            .unwrap();
        assert!(decl.primary.is_declaration());
        let full = b.derive(&DiffRequest::new("f", DiffMode::Pullback)).unwrap();
        assert!(!full.primary.is_declaration());
        assert_eq!(b.program().functions_named("f_pullback").count(), 1);
    }

    #[test]
    fn failed_request_rolls_back() {
        let mut b = builder(
            "fn g(x: f64) -> f64; fn f(x: f64) -> f64 { return g(x) * 2.0; }",
        );
        let before = b.program().functions.len();
        let err = b.derive(&DiffRequest::new("f", DiffMode::Reverse)).unwrap_err();
        assert!(matches!(err, DiffError::NoDefinition { ref function, .. } if function == "g"));
        assert_eq!(b.program().functions.len(), before);
        assert!(b
            .graph()
            .nodes()
            .iter()
            .all(|n| n.state != NodeState::Pending));
    }

    #[test]
    fn partial_reverse_gets_overload() {
        let mut b = builder("fn f(x: f64, y: f64) -> f64 { return x * y; }");
        let r = b
            .derive(&DiffRequest::new("f", DiffMode::Reverse).with_args("y").unwrap())
            .unwrap();
        assert_eq!(r.primary.name, "f_grad_1");
        let o = r.overload.expect("overload");
        assert_eq!(o.name, "f_grad_1");
        assert_eq!(o.params.len(), 4);
        assert_eq!(r.primary.params.len(), 3);
    }

    #[test]
    fn verbose_requests_leave_notes() {
        let mut b = builder("fn f(x: f64) -> f64 { return x * x; }");
        let mut req = DiffRequest::new("f", DiffMode::Reverse);
        req.verbose = true;
        b.derive(&req).unwrap();
        assert!(b.notes().iter().any(|n| n.message.starts_with("registered")));
        assert!(b.take_notes().len() >= 2);
        assert!(b.notes().is_empty());
    }
}
