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

//! Append-only record of the requests a session derived and what each
//! one required.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::request::DiffMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Derived,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestNode {
    /// Qualified name of the differentiated function.
    pub function: String,
    /// Qualified name of the derivative.
    pub name: String,
    pub arity: usize,
    pub mode: DiffMode,
    pub indeps: String,
    pub order: u32,
    pub state: NodeState,
}

/// `from` needed `to`. `already_derived` is set when `to` was served from
/// the memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestEdge {
    pub from: usize,
    pub to: usize,
    pub already_derived: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestGraph {
    nodes: Vec<RequestNode>,
    edges: Vec<RequestEdge>,
    #[serde(skip)]
    index: HashMap<(String, usize), usize>,
}

impl RequestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `node` unless a node with the same derivative name and arity
    /// exists; returns the node's id either way.
    pub fn add_node(&mut self, node: RequestNode) -> usize {
        let key = (node.name.clone(), node.arity);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(key, id);
        id
    }

    pub fn find(&self, name: &str, arity: usize) -> Option<usize> {
        self.index.get(&(name.to_string(), arity)).copied()
    }

    pub fn add_edge(&mut self, from: usize, to: usize, already_derived: bool) {
        let edge = RequestEdge {
            from,
            to,
            already_derived,
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn set_state(&mut self, id: usize, state: NodeState) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = state;
        }
    }

    pub fn mark_derived(&mut self, id: usize) {
        self.set_state(id, NodeState::Derived);
    }

    pub fn nodes(&self) -> &[RequestNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[RequestEdge] {
        &self.edges
    }

    pub fn node(&self, id: usize) -> Option<&RequestNode> {
        self.nodes.get(id)
    }

    /// Whether some chain of edges leads from `id` back to itself.
    pub fn is_recursive(&self, id: usize) -> bool {
        let mut stack = vec![id];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(n) = stack.pop() {
            for e in self.edges.iter().filter(|e| e.from == n) {
                if e.to == id {
                    return true;
                }
                if !seen[e.to] {
                    seen[e.to] = true;
                    stack.push(e.to);
                }
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for RequestGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, n) in self.nodes.iter().enumerate() {
            writeln!(
                f,
                "#{} {} <- {} of {}({}) order {} [{:?}]",
                id, n.name, n.mode, n.function, n.indeps, n.order, n.state
            )?;
        }
        for e in &self.edges {
            let from = self.nodes.get(e.from).map(|n| n.name.as_str()).unwrap_or("?");
            let to = self.nodes.get(e.to).map(|n| n.name.as_str()).unwrap_or("?");
            if e.already_derived {
                writeln!(f, "{} -> {} (already derived)", from, to)?;
            } else {
                writeln!(f, "{} -> {}", from, to)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> RequestNode {
        RequestNode {
            function: "f".into(),
            name: name.into(),
            arity: 1,
            mode: DiffMode::Pullback,
            indeps: "x".into(),
            order: 1,
            state: NodeState::Pending,
        }
    }

    #[test]
    fn nodes_are_inserted_once() {
        let mut g = RequestGraph::new();
        let a = g.add_node(node("f_pullback"));
        let b = g.add_node(node("f_pullback"));
        assert_eq!(a, b);
        assert_eq!(g.nodes().len(), 1);
        g.mark_derived(a);
        assert_eq!(g.nodes()[0].state, NodeState::Derived);
    }

    #[test]
    fn detects_self_reference() {
        let mut g = RequestGraph::new();
        let a = g.add_node(node("f_pullback"));
        let b = g.add_node(node("g_pullback"));
        g.add_edge(a, b, false);
        assert!(!g.is_recursive(a));
        g.add_edge(b, a, true);
        g.add_edge(b, a, true);
        assert!(g.is_recursive(a));
        assert_eq!(g.edges().len(), 2);
        let text = g.to_string();
        assert!(text.contains("g_pullback -> f_pullback (already derived)"));
    }
}
