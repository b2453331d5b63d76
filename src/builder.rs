//! Central builder state.
//!
//! One [`Builder`] owns the node graph, the source/header registry and the
//! run options for the lifetime of an invocation. The scanner, parser,
//! resolver and scheduler all mutate it from the coordinating thread; by
//! the time the executor's workers start, it is only ever read.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::PathBuf;

use qi_lang::Origin;
use qi_make_graph::{ActionNode, CodeLine, FileNode, Graph, NodeId, NodeKind, Timestamp};

use crate::config::ConfigTable;
use crate::error::{BuildError, Result};
use crate::paths;

pub type SymbolTable = HashMap<String, String>;

/// Run options, as selected on the command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub jobs: usize,
    pub just_print: bool,
    pub keep_going: bool,
    pub force: bool,
    pub silent: bool,
    pub summary: bool,
    pub all: bool,
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            jobs: 1,
            just_print: false,
            keep_going: false,
            force: false,
            silent: false,
            summary: false,
            all: false,
            verbose: false,
        }
    }
}

/// A caller-registered function, callable from directives as
/// `$(name args…)`.
pub enum UserFunction {
    /// An expression template. `$args` is bound to the raw argument string
    /// and `$1`…`$n` to the whitespace-split arguments.
    Template(String),
    /// A native function taking the raw argument string.
    Native(Box<dyn Fn(&str) -> std::result::Result<String, String> + Send + Sync>),
}

impl std::fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserFunction::Template(t) => f.debug_tuple("Template").field(t).finish(),
            UserFunction::Native(_) => f.debug_tuple("Native").finish(),
        }
    }
}

#[derive(Debug)]
pub struct Builder {
    pub root: PathBuf,
    pub options: Options,
    /// Registered sources and their declared headers.
    pub source_headers: BTreeMap<String, Vec<String>>,
    /// The inverse: header name to the sources declaring it.
    pub header_sources: HashMap<String, Vec<String>>,
    /// Base name (extension stripped) to source, for sources that declare
    /// no headers; lets `foo.h` find `foo.c` without a declaration.
    pub base_sources: HashMap<String, String>,
    pub user_functions: HashMap<String, UserFunction>,
    pub init_code: Vec<CodeLine>,
    pub final_code: Vec<CodeLine>,
    pub config: ConfigTable,
    pub environment: SymbolTable,
    pub graph: Graph,
}

impl Builder {
    pub fn new(
        root: PathBuf,
        sources: BTreeMap<String, Vec<String>>,
        init_code: Vec<CodeLine>,
        final_code: Vec<CodeLine>,
        user_functions: HashMap<String, UserFunction>,
        config: ConfigTable,
        options: Options,
    ) -> Result<Self> {
        let mut header_sources: HashMap<String, Vec<String>> = HashMap::new();
        let mut base_sources: HashMap<String, String> = HashMap::new();
        for (source, headers) in &sources {
            if headers.is_empty() {
                let base = strip_extension(source);
                if let Some(existing) = base_sources.insert(base, source.clone()) {
                    return Err(BuildError::DuplicateBaseName(source.clone(), existing));
                }
            } else {
                for header in headers {
                    header_sources
                        .entry(header.clone())
                        .or_default()
                        .push(source.clone());
                }
            }
        }

        Ok(Self {
            root,
            options,
            source_headers: sources,
            header_sources,
            base_sources,
            user_functions,
            init_code,
            final_code,
            config,
            environment: env::vars().collect(),
            graph: Graph::new(),
        })
    }

    /// The symbol table a source parse starts from: environment, overridden
    /// by the per-user config, plus the implicit `source` variable.
    pub(crate) fn parse_symbols(&self, source: &str) -> SymbolTable {
        let mut symbols = self.environment.clone();
        for (key, value) in &self.config {
            symbols.insert(key.clone(), value.clone());
        }
        symbols.insert("source".to_owned(), source.to_owned());
        symbols
    }

    /// The effective timestamp of a whitespace-separated target list: the
    /// oldest target's mtime, or `None` as soon as any target is missing.
    pub(crate) fn target_timestamp(&self, targets: &str) -> Timestamp {
        let mut stamp: Timestamp = None;
        for target in targets.split_whitespace() {
            match paths::mtime(&paths::join(&self.root, target)) {
                Some(t) => stamp = Some(stamp.map_or(t, |s| s.min(t))),
                None => return None,
            }
        }
        stamp
    }

    pub fn add_file_node(&mut self, name: &str, may_not_exist: bool) -> Result<NodeId> {
        let timestamp = self.target_timestamp(name);
        if timestamp.is_none() && !may_not_exist {
            return Err(BuildError::MissingFile(name.to_owned()));
        }
        let file = FileNode {
            // A missing file has nothing to scan.
            scanned: timestamp.is_none(),
            may_not_exist,
            ..FileNode::default()
        };
        Ok(self.graph.insert(name, timestamp, NodeKind::File(file)))
    }

    pub fn add_action_node(
        &mut self,
        action: &str,
        source: &str,
        targets: String,
        origin: Origin,
    ) -> NodeId {
        let name = action_name(action, source);
        let timestamp = self.target_timestamp(&targets);
        self.graph
            .insert(&name, timestamp, NodeKind::Action(ActionNode::new(targets, origin)))
    }

    pub fn find_file_node(&self, name: &str) -> Result<Option<NodeId>> {
        match self.graph.get(name) {
            Some(id) if self.graph.node(id).is_file() => Ok(Some(id)),
            Some(_) => Err(BuildError::ExpectedFile(name.to_owned())),
            None => Ok(None),
        }
    }

    pub fn require_file_node(&self, name: &str) -> Result<NodeId> {
        self.find_file_node(name)?
            .ok_or_else(|| BuildError::UnknownFileNode(name.to_owned()))
    }

    pub fn find_action_node(&self, action: &str, source: &str) -> Result<Option<NodeId>> {
        let name = action_name(action, source);
        match self.graph.get(&name) {
            Some(id) if !self.graph.node(id).is_file() => Ok(Some(id)),
            Some(_) => Err(BuildError::ExpectedAction(name)),
            None => Ok(None),
        }
    }

    pub fn require_action_node(&self, action: &str, source: &str) -> Result<NodeId> {
        match self.find_action_node(action, source)? {
            Some(id) => Ok(id),
            None => {
                if self.find_file_node(source)?.is_none() {
                    Err(BuildError::NotParsed(source.to_owned()))
                } else {
                    Err(BuildError::UnknownAction {
                        action: action.to_owned(),
                        source_file: source.to_owned(),
                    })
                }
            }
        }
    }

    pub(crate) fn node_name(&self, id: NodeId) -> &str {
        &self.graph.node(id).name
    }

    /// `id` must be a file node.
    pub(crate) fn file(&self, id: NodeId) -> &FileNode {
        self.graph.node(id).as_file().expect("file node")
    }

    /// `id` must be a file node.
    pub(crate) fn file_mut(&mut self, id: NodeId) -> &mut FileNode {
        self.graph.node_mut(id).as_file_mut().expect("file node")
    }

    /// `id` must be an action node.
    pub(crate) fn action(&self, id: NodeId) -> &ActionNode {
        self.graph.node(id).as_action().expect("action node")
    }

    /// `id` must be an action node.
    pub(crate) fn action_mut(&mut self, id: NodeId) -> &mut ActionNode {
        self.graph.node_mut(id).as_action_mut().expect("action node")
    }
}

/// The graph name of an action bound to a source.
pub(crate) fn action_name(action: &str, source: &str) -> String {
    format!("{}({})", action, source)
}

/// `os.path`-style extension stripping: `sub/foo.c` becomes `sub/foo`, a
/// leading dot in the file name is not an extension.
pub(crate) fn strip_extension(name: &str) -> String {
    let sep = name.rfind(|c| c == '/' || c == '\\').map(|p| p + 1);
    match name.rfind('.') {
        Some(dot) if dot > sep.unwrap_or(0) => name[..dot].to_owned(),
        _ => name.to_owned(),
    }
}
