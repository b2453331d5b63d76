//! Staleness computation and layering.
//!
//! Inspecting an action walks its action subgraph in post-order with cycle
//! detection and assigns every stale node an update order: 0 for actions
//! with no scheduled action child, one past the deepest scheduled child
//! otherwise. The result accumulates into a list of layers; everything in
//! layer *i* may run concurrently once layer *i−1* has drained.

use qi_make_graph::{CommandKind, NodeId, Timestamp};

use crate::builder::Builder;
use crate::error::Result;

impl Builder {
    /// Schedules `action(source)` and everything it depends on into
    /// `layers`. With `dump`, prints the resolved action instead (the
    /// `parse` verb) and schedules nothing.
    pub fn inspect(
        &mut self,
        action: &str,
        source: &str,
        layers: &mut Vec<Vec<NodeId>>,
        dump: bool,
    ) -> Result<()> {
        log::debug!("inspecting {}({})", action, source);

        let action_id = match self.find_action_node(action, source)? {
            Some(id) => id,
            None => {
                if self.find_file_node(source)?.is_none() {
                    self.parse(source, false)?;
                }
                self.require_action_node(action, source)?
            }
        };
        let source_id = self.require_file_node(source)?;

        self.resolve_dependency(action_id, source_id)?;

        if dump {
            self.dump_action(action, action_id);
            return Ok(());
        }

        for id in self.graph.dfs(action_id, true)? {
            if self.action(id).update_order.is_some() {
                continue;
            }

            let mut newest: Timestamp = None;
            let mut child_order: Option<usize> = None;
            for &child in &self.graph.node(id).children {
                let node = self.graph.node(child);
                if !node.is_file() {
                    if let Some(order) = node.as_action().and_then(|a| a.update_order) {
                        child_order = Some(child_order.map_or(order, |o| o.max(order)));
                    }
                }
                newest = newest.max(node.timestamp);
            }

            let node = self.graph.node(id);
            let update_order = match child_order {
                Some(order) => Some(order + 1),
                None if newest > node.timestamp || node.timestamp.is_none() => Some(0),
                None if self.options.force => Some(0),
                None => None,
            };

            if let Some(order) = update_order {
                self.action_mut(id).update_order = Some(order);
                log::debug!(
                    "schedule {} at update level {}",
                    self.node_name(id),
                    order
                );
                while layers.len() <= order {
                    layers.push(Vec::new());
                }
                layers[order].push(id);
            }
        }

        Ok(())
    }

    /// The `parse` verb's dump: targets, children and compiled commands.
    fn dump_action(&self, action: &str, id: NodeId) {
        let node = self.action(id);
        print!("{}({}): ", action, node.targets);
        for &child in &self.graph.node(id).children {
            print!("{} ", self.node_name(child));
        }
        println!();
        for command in &node.commands {
            match &command.kind {
                CommandKind::Assignment { var, op, rhs } => {
                    println!("\t{} {}{}", var, op, rhs)
                }
                CommandKind::FunctionCall { name, args } => println!("\t$({} {})", name, args),
                CommandKind::External(text) => println!("\t{}", text),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Options;
    use crate::config::ConfigTable;
    use crate::error::BuildError;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn builder_for(root: &Path, sources: &[&str], force: bool) -> Builder {
        let mut map = BTreeMap::new();
        for source in sources {
            map.insert((*source).to_owned(), Vec::new());
        }
        Builder::new(
            root.canonicalize().unwrap(),
            map,
            Vec::new(),
            Vec::new(),
            std::collections::HashMap::new(),
            ConfigTable::new(),
            Options {
                force,
                ..Options::default()
            },
        )
        .unwrap()
    }

    fn layer_names(builder: &Builder, layers: &[Vec<NodeId>]) -> Vec<Vec<String>> {
        layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .map(|&id| builder.node_name(id).to_owned())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_missing_target_schedules_at_layer_zero() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"], false);
        let mut layers = Vec::new();
        builder.inspect("compile", "a.c", &mut layers, false).unwrap();
        assert_eq!(layer_names(&builder, &layers), vec![vec!["compile(a.c)"]]);
    }

    #[test]
    fn test_fresh_target_is_not_scheduled() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();
        // The target exists and the scheduler compares mtimes, so make it
        // unambiguously newer than the source.
        std::fs::write(dir.path().join("a.c.o"), "").unwrap();
        let late = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("a.c.o"))
            .unwrap();
        file.set_modified(late).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"], false);
        let mut layers = Vec::new();
        builder.inspect("compile", "a.c", &mut layers, false).unwrap();
        assert!(layers.is_empty());
    }

    #[test]
    fn test_force_reschedules_fresh_target() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();
        std::fs::write(dir.path().join("a.c.o"), "").unwrap();
        let late = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("a.c.o"))
            .unwrap();
        file.set_modified(late).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"], true);
        let mut layers = Vec::new();
        builder.inspect("compile", "a.c", &mut layers, false).unwrap();
        assert_eq!(layer_names(&builder, &layers), vec![vec!["compile(a.c)"]]);
    }

    #[test]
    fn test_two_layer_build() {
        let dir = TempDir::new().unwrap();
        let lib = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("lib.c"), lib).unwrap();
        let main = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
            "//qi: \n",
            "//qi: link(a.out): compile compile(lib.c)\n",
            "//qi:     gcc -o a.out\n",
        );
        std::fs::write(dir.path().join("main.c"), main).unwrap();

        let mut builder = builder_for(dir.path(), &["main.c", "lib.c"], false);
        let mut layers = Vec::new();
        builder.inspect("link", "main.c", &mut layers, false).unwrap();

        assert_eq!(layers.len(), 2);
        let names = layer_names(&builder, &layers);
        assert!(names[0].contains(&"compile(main.c)".to_owned()));
        assert!(names[0].contains(&"compile(lib.c)".to_owned()));
        assert_eq!(names[1], vec!["link(main.c)"]);

        // Layering invariant: every scheduled descendant sits strictly
        // below its ancestor.
        let link = builder.find_action_node("link", "main.c").unwrap().unwrap();
        let link_order = builder.action(link).update_order.unwrap();
        for id in builder.graph.dfs(link, false).unwrap() {
            if id == link {
                continue;
            }
            if let Some(order) = builder.action(id).update_order {
                assert!(order < link_order);
            }
        }
    }

    #[test]
    fn test_link_depends_two_layer() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lib.h"), "").unwrap();
        let lib = concat!(
            "#include \"lib.h\"\n",
            "//qi: compile($source.o): $source\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("lib.c"), lib).unwrap();
        let main = concat!(
            "#include \"lib.h\"\n",
            "//qi: compile($source.o): $source\n",
            "//qi:     gcc -c $source -o $source.o\n",
            "//qi: \n",
            "//qi: link(a.out): compile($(link_depends main.c))\n",
            "//qi:     gcc -o a.out\n",
        );
        std::fs::write(dir.path().join("main.c"), main).unwrap();

        let mut map = BTreeMap::new();
        map.insert("main.c".to_owned(), Vec::new());
        map.insert("lib.c".to_owned(), Vec::new());
        let mut builder = Builder::new(
            dir.path().canonicalize().unwrap(),
            map,
            Vec::new(),
            Vec::new(),
            std::collections::HashMap::new(),
            ConfigTable::new(),
            Options::default(),
        )
        .unwrap();

        let mut layers = Vec::new();
        builder.inspect("link", "main.c", &mut layers, false).unwrap();
        let names = layer_names(&builder, &layers);
        assert_eq!(names.len(), 2);
        assert!(names[0].contains(&"compile(lib.c)".to_owned()));
        assert!(names[0].contains(&"compile(main.c)".to_owned()));
        assert_eq!(names[1], vec!["link(main.c)"]);
    }

    #[test]
    fn test_circular_dependency() {
        let dir = TempDir::new().unwrap();
        let one = concat!("//qi: a: b(two.c)\n", "//qi:     true\n");
        std::fs::write(dir.path().join("one.c"), one).unwrap();
        let two = concat!("//qi: b: a(one.c)\n", "//qi:     true\n");
        std::fs::write(dir.path().join("two.c"), two).unwrap();

        let mut builder = builder_for(dir.path(), &["one.c", "two.c"], false);
        let mut layers = Vec::new();
        let err = builder
            .inspect("a", "one.c", &mut layers, false)
            .unwrap_err();
        match err {
            BuildError::Graph(graph_err) => {
                let message = graph_err.to_string();
                assert!(message.contains("a(one.c)"), "{}", message);
                assert!(message.contains("b(two.c)"), "{}", message);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_idempotent_second_inspect() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"], false);
        let mut layers = Vec::new();
        builder.inspect("compile", "a.c", &mut layers, false).unwrap();
        builder.inspect("compile", "a.c", &mut layers, false).unwrap();
        // Already scheduled; the second walk adds nothing.
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 1);
    }

    #[test]
    fn test_undefined_action() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: QI_X = 1\n").unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"], false);
        let mut layers = Vec::new();
        assert!(matches!(
            builder.inspect("nope", "a.c", &mut layers, false),
            Err(BuildError::UnknownAction { .. })
        ));
    }
}
