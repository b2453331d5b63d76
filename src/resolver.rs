//! Dependency resolution.
//!
//! An action's dependents stay textual until the first time the scheduler
//! looks at it. Resolution expands the text with an empty symbol table —
//! anything that needs parse-time scope must already have been folded in —
//! and turns each token into an edge: a local action of the same source, a
//! file, or `action(sources…)` across other sources, recursing as it goes.

use qi_make_graph::NodeId;

use crate::builder::{Builder, SymbolTable};
use crate::error::{BuildError, Result};

impl Builder {
    /// Resolves `action_id`'s dependents into edges. Latched; a second call
    /// is a no-op.
    pub fn resolve_dependency(&mut self, action_id: NodeId, source_id: NodeId) -> Result<()> {
        if self.action(action_id).resolved {
            return Ok(());
        }
        self.action_mut(action_id).resolved = true;

        let (dependents_text, origin) = {
            let action = self.action(action_id);
            (action.dependents.clone(), action.origin.clone())
        };
        self.action_mut(action_id).dependents = String::new();

        let dependents = self
            .translate(&dependents_text, &SymbolTable::new(), &origin, false)?
            .trim()
            .to_owned();
        if dependents.is_empty() {
            log::debug!("{} has no dependency", self.node_name(action_id));
            return Ok(());
        }
        log::debug!(
            "{} is dependent on {}",
            self.node_name(action_id),
            dependents
        );

        for dependent in qi_lang::split(&dependents) {
            match qi_lang::split_action_sources(&dependent) {
                None => self.resolve_bare_dependent(action_id, source_id, &dependent)?,
                Some((action, sources)) => {
                    if sources.is_empty() {
                        continue;
                    }
                    if sources.contains('(') || sources.contains('$') {
                        return Err(BuildError::NotEvaluable {
                            text: sources.to_owned(),
                            origin,
                        });
                    }
                    let action = action.to_owned();
                    let sources: Vec<String> =
                        sources.split_whitespace().map(str::to_owned).collect();
                    for source in sources {
                        self.parse(&source, false)?;
                        let node = self.require_action_node(&action, &source)?;
                        if !self.action(node).resolved {
                            let dep_source = self.require_file_node(&source)?;
                            self.resolve_dependency(node, dep_source)?;
                        }
                        self.graph.add_edge(action_id, node);
                    }
                }
            }
        }
        Ok(())
    }

    /// A bare token names an action of the current source when one exists,
    /// and a file otherwise.
    fn resolve_bare_dependent(
        &mut self,
        action_id: NodeId,
        source_id: NodeId,
        dependent: &str,
    ) -> Result<()> {
        let source_name = self.node_name(source_id).to_owned();
        let node = match self.find_action_node(dependent, &source_name)? {
            Some(node) => {
                self.resolve_dependency(node, source_id)?;
                node
            }
            None => match self.find_file_node(dependent)? {
                Some(node) => node,
                None => self.add_file_node(dependent, false)?,
            },
        };
        self.graph.add_edge(action_id, node);
        Ok(())
    }
}
