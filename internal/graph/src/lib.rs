//! The build graph: one store of named nodes, two overlaid subgraphs.
//!
//! Files and actions live in the same arena and share a single untyped edge
//! list, but traversals only ever follow edges between nodes of the same
//! kind as the starting node. That gives the scanner a file subgraph for
//! timestamp propagation and the scheduler an action subgraph for layering,
//! without duplicating the vertices they share.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use derive_more::{From, Into};
use qi_lang::{AssignOp, Origin};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("circular dependency detected: {0}")]
    Cycle(String),
}

/// A file's modification time; `None` stands in for a missing file or a
/// missing target and sorts below every real time, so closure maxima and
/// staleness comparisons read directly off `Ord`.
pub type Timestamp = Option<SystemTime>;

/// Index of a node in the [`Graph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct NodeId(usize);

/// One element of a file's assembled directive stream: either a captured
/// directive line or a splice point for an included file's directives.
#[derive(Debug, Clone)]
pub enum CodeElement {
    Line(CodeLine),
    Include(NodeId),
}

/// A directive line tagged with where it came from.
#[derive(Debug, Clone)]
pub struct CodeLine {
    pub origin: Origin,
    pub text: String,
}

impl CodeLine {
    pub fn new(origin: Origin, text: impl Into<String>) -> Self {
        Self {
            origin,
            text: text.into(),
        }
    }
}

/// A compiled command of an action, with its payload still in deferred form.
#[derive(Debug, Clone)]
pub struct Command {
    pub origin: Origin,
    pub kind: CommandKind,
}

#[derive(Debug, Clone)]
pub enum CommandKind {
    Assignment {
        var: String,
        op: AssignOp,
        rhs: String,
    },
    FunctionCall {
        name: String,
        args: String,
    },
    External(String),
}

/// A source or header file.
#[derive(Debug, Default)]
pub struct FileNode {
    pub scanned: bool,
    pub may_not_exist: bool,
    pub code: Vec<CodeElement>,
    /// Names of the actions declared in this file, in declaration order;
    /// `None` until the file has been parsed.
    pub actions: Option<Vec<String>>,
}

/// A named rule bound to one source.
#[derive(Debug)]
pub struct ActionNode {
    /// Whitespace-separated target paths, already evaluated.
    pub targets: String,
    /// Raw dependents text, deferred until resolution.
    pub dependents: String,
    pub commands: Vec<Command>,
    pub resolved: bool,
    /// Layer index in the schedule; `None` until scheduled.
    pub update_order: Option<usize>,
    pub has_failed: bool,
    /// The rule header that declared this action.
    pub origin: Origin,
}

impl ActionNode {
    pub fn new(targets: String, origin: Origin) -> Self {
        Self {
            targets,
            dependents: String::new(),
            commands: Vec::new(),
            resolved: false,
            update_order: None,
            has_failed: false,
            origin,
        }
    }
}

#[derive(Debug)]
pub enum NodeKind {
    File(FileNode),
    Action(ActionNode),
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub children: Vec<NodeId>,
    pub timestamp: Timestamp,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File(_))
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match &self.kind {
            NodeKind::File(f) => Some(f),
            NodeKind::Action(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileNode> {
        match &mut self.kind {
            NodeKind::File(f) => Some(f),
            NodeKind::Action(_) => None,
        }
    }

    pub fn as_action(&self) -> Option<&ActionNode> {
        match &self.kind {
            NodeKind::Action(a) => Some(a),
            NodeKind::File(_) => None,
        }
    }

    pub fn as_action_mut(&mut self) -> Option<&mut ActionNode> {
        match &mut self.kind {
            NodeKind::Action(a) => Some(a),
            NodeKind::File(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Inserts a node under `name`, or returns the existing node of that
    /// name untouched. Node identity is by name.
    pub fn insert(&mut self, name: &str, timestamp: Timestamp, kind: NodeKind) -> NodeId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_owned(),
            children: Vec::new(),
            timestamp,
            kind,
        });
        self.index.insert(name.to_owned(), id);
        id
    }

    /// Records `child` as a dependency of `parent`. Idempotent; returns
    /// whether the edge was new.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) -> bool {
        let children = &mut self.nodes[parent.0].children;
        if children.contains(&child) {
            return false;
        }
        children.push(child);
        true
    }

    /// Walks the subgraph of `start`'s kind reachable from `start`, in
    /// post-order: by the time a node is emitted every same-kind descendant
    /// of it has been emitted already. Children of the other kind are
    /// neither emitted nor descended into; revisits are skipped.
    ///
    /// With `check_cycles`, meeting a node that is still open on the walk
    /// stack is an error naming every node on the cycle and the return edge.
    pub fn dfs(&self, start: NodeId, check_cycles: bool) -> Result<Vec<NodeId>, Error> {
        let start_is_file = self.node(start).is_file();
        let mut order = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        // (node, index of the next child to look at)
        let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];

        while let Some(&(id, next)) = stack.last() {
            let children = &self.node(id).children;
            let mut descended = false;
            let mut i = next;
            while i < children.len() {
                let child = children[i];
                if self.node(child).is_file() != start_is_file || visited.contains(&child) {
                    i += 1;
                    continue;
                }
                if self.node(child).children.is_empty() {
                    order.push(child);
                    visited.insert(child);
                    i += 1;
                    continue;
                }
                if let Some(pos) = stack.iter().position(|&(open, _)| open == child) {
                    if check_cycles {
                        let mut path: Vec<&str> = stack[pos..]
                            .iter()
                            .map(|&(open, _)| self.node(open).name.as_str())
                            .collect();
                        path.push(self.node(child).name.as_str());
                        return Err(Error::Cycle(path.join(" -> ")));
                    }
                    i += 1;
                    continue;
                }
                if let Some(last) = stack.last_mut() {
                    last.1 = i;
                }
                stack.push((child, 0));
                descended = true;
                break;
            }
            if descended {
                continue;
            }
            if let Some(last) = stack.last_mut() {
                last.1 = i;
            }
            order.push(id);
            visited.insert(id);
            stack.pop();
        }

        Ok(order)
    }
}
