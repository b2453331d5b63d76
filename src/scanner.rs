//! Source scanning.
//!
//! Scanning a source reads it line by line, resolves `#include` directives
//! against a growable include path, recurses into headers it has not seen
//! yet, and captures every embedded directive with its origin. When the
//! scan finishes, the source's effective timestamp is the newest mtime in
//! its include closure, which is what staleness decisions run on.

use std::fs;
use std::path::PathBuf;

use qi_lang::{begin_block, end_block, include_file, include_path, one_line_code, Origin};
use qi_make_graph::{CodeElement, CodeLine, NodeId};

use crate::builder::{strip_extension, Builder};
use crate::error::{BuildError, Result};
use crate::paths;

impl Builder {
    /// Scans `source`, creating its file node on first sight. Idempotent.
    pub fn scan(&mut self, source: &str) -> Result<NodeId> {
        let id = match self.find_file_node(source)? {
            Some(id) => id,
            None => self.add_file_node(source, false)?,
        };
        if self.file(id).scanned {
            return Ok(id);
        }
        self.file_mut(id).scanned = true;

        log::debug!("scanning {}", source);
        let mut include_paths = vec![self.root.clone()];
        self.scan_file(id, &mut include_paths)?;

        // A source is as new as the newest file it reaches.
        let timestamp = self
            .graph
            .dfs(id, false)?
            .into_iter()
            .filter_map(|n| self.graph.node(n).timestamp)
            .max();
        self.graph.node_mut(id).timestamp = timestamp;

        Ok(id)
    }

    fn scan_file(&mut self, id: NodeId, include_paths: &mut Vec<PathBuf>) -> Result<()> {
        let name = self.node_name(id).to_owned();
        let full = paths::join(&self.root, &name);
        let text =
            fs::read_to_string(&full).map_err(|_| BuildError::UnreadableFile(name.clone()))?;
        let lines: Vec<&str> = text.lines().collect();

        let mut i = 0;
        while i < lines.len() {
            let raw = lines[i];
            let lineno = (i + 1) as u32;
            i += 1;

            if let Some(path) = include_path(raw) {
                let path = paths::join(&self.root, path.trim());
                if !path.exists() {
                    log::warn!("'{}' is not a valid include path", path.display());
                } else if !include_paths.contains(&path) {
                    include_paths.push(path);
                }
                continue;
            }

            if let Some(include) = include_file(raw) {
                if include.ignored {
                    continue;
                }
                self.resolve_include(id, &include.path, lineno, include_paths)?;
                continue;
            }

            if begin_block(raw) {
                let mut continuation = false;
                while i < lines.len() {
                    let block_line = lines[i];
                    let block_lineno = (i + 1) as u32;
                    i += 1;
                    if end_block(block_line) {
                        break;
                    }
                    let trimmed = block_line.trim_end_matches(|c| c == ' ' || c == '\r');
                    if trimmed.trim_start_matches(' ').starts_with('#') {
                        continuation = false;
                        continue;
                    }
                    let (content, backslash) = match trimmed.ends_with('\\') {
                        true => (trimmed.trim_end_matches('\\'), true),
                        false => (trimmed, false),
                    };
                    if continuation {
                        self.append_code(id, content);
                    } else {
                        self.push_code(id, Origin::new(&name, block_lineno), content);
                    }
                    continuation = backslash;
                }
                continue;
            }

            if let Some(code) = one_line_code(raw) {
                self.push_code(id, Origin::new(&name, lineno), code);
                continue;
            }
        }

        Ok(())
    }

    /// Resolves one `#include` line: probe the include paths, bind the
    /// header to a source when the base names line up, record the edge and
    /// splice point, and descend if the header is new.
    fn resolve_include(
        &mut self,
        id: NodeId,
        file: &str,
        lineno: u32,
        include_paths: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let file = paths::normalize(file);
        let mut header = None;
        for path in include_paths.iter() {
            let candidate = path.join(&file);
            if candidate.exists() {
                header = Some(paths::standard_name(&self.root, &candidate));
                break;
            }
        }
        let header = match header {
            Some(header) => header,
            None => {
                log::trace!(
                    "{}:{}: include '{}' not found on the include path",
                    self.node_name(id),
                    lineno,
                    file
                );
                return Ok(());
            }
        };

        if !self.header_sources.contains_key(&header) {
            let base = strip_extension(&file);
            if let Some(source) = self.base_sources.get(&base).cloned() {
                self.source_headers
                    .entry(source.clone())
                    .or_default()
                    .push(header.clone());
                self.header_sources.insert(header.clone(), vec![source]);
            }
        }

        let header_id = match self.find_file_node(&header)? {
            Some(id) => id,
            None => self.add_file_node(&header, true)?,
        };
        self.graph.add_edge(id, header_id);
        self.file_mut(id).code.push(CodeElement::Include(header_id));

        if !self.file(header_id).scanned {
            self.file_mut(header_id).scanned = true;
            self.scan_file(header_id, include_paths)?;
        }
        Ok(())
    }

    fn push_code(&mut self, id: NodeId, origin: Origin, text: &str) {
        self.file_mut(id)
            .code
            .push(CodeElement::Line(CodeLine::new(origin, text)));
    }

    fn append_code(&mut self, id: NodeId, text: &str) {
        if let Some(CodeElement::Line(last)) = self.file_mut(id).code.last_mut() {
            last.text.push_str(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Options;
    use crate::config::ConfigTable;
    use std::collections::{BTreeMap, HashMap};
    use std::path::Path;
    use tempfile::TempDir;

    fn builder_for(root: &Path, sources: &[(&str, &[&str])]) -> Builder {
        let mut map = BTreeMap::new();
        for (source, headers) in sources {
            map.insert(
                (*source).to_owned(),
                headers.iter().map(|h| (*h).to_owned()).collect(),
            );
        }
        Builder::new(
            root.canonicalize().unwrap(),
            map,
            Vec::new(),
            Vec::new(),
            HashMap::new(),
            ConfigTable::new(),
            Options::default(),
        )
        .unwrap()
    }

    fn directive_lines(builder: &Builder, id: NodeId) -> Vec<String> {
        builder
            .file(id)
            .code
            .iter()
            .filter_map(|e| match e {
                CodeElement::Line(l) => Some(l.text.clone()),
                CodeElement::Include(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_captures_one_line_directives() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.c"),
            "//qi: compile($source.o):\n\
             //qi:     gcc -c $source -o $source.o\n\
             int main() { return 0; }\n\
             /*qi: OPT = -O2*/\n",
        )
        .unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &[])]);
        let id = builder.scan("a.c").unwrap();
        assert_eq!(
            directive_lines(&builder, id),
            vec![
                "compile($source.o):",
                "    gcc -c $source -o $source.o",
                "OPT = -O2",
            ]
        );

        let file = builder.file(id);
        assert!(file.scanned);
        let origins: Vec<u32> = file
            .code
            .iter()
            .filter_map(|e| match e {
                CodeElement::Line(l) => Some(l.origin.line),
                _ => None,
            })
            .collect();
        assert_eq!(origins, vec![1, 2, 4]);
    }

    #[test]
    fn test_include_discovery_and_timestamp() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.h"), "//qi: HDR = yes\n").unwrap();
        std::fs::write(dir.path().join("a.c"), "#include \"a.h\"\nint x;\n").unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &["a.h"])]);
        let id = builder.scan("a.c").unwrap();

        let header_id = builder.require_file_node("a.h").unwrap();
        assert!(builder.graph.node(id).children.contains(&header_id));
        assert!(builder.file(header_id).scanned);

        // The source's effective timestamp covers the header.
        let reachable = builder.graph.dfs(id, false).unwrap();
        let newest = reachable
            .iter()
            .filter_map(|&n| builder.graph.node(n).timestamp)
            .max();
        assert_eq!(builder.graph.node(id).timestamp, newest);
        assert!(newest.is_some());
    }

    #[test]
    fn test_include_ignore_marker() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.h"), "").unwrap();
        std::fs::write(
            dir.path().join("a.c"),
            "#include \"a.h\" //qi: ignore\n",
        )
        .unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &[])]);
        let id = builder.scan("a.c").unwrap();
        assert!(builder.graph.node(id).children.is_empty());
    }

    #[test]
    fn test_unresolved_include_is_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "#include <stdio.h>\n").unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &[])]);
        let id = builder.scan("a.c").unwrap();
        assert!(builder.graph.node(id).children.is_empty());
    }

    #[test]
    fn test_include_path_directive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("inc")).unwrap();
        std::fs::write(dir.path().join("inc/dep.h"), "//qi: FROM_DEP = 1\n").unwrap();
        std::fs::write(
            dir.path().join("a.c"),
            "//qi: includepath <inc>\n#include \"dep.h\"\n",
        )
        .unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &[])]);
        let id = builder.scan("a.c").unwrap();
        let header_id = builder.require_file_node("inc/dep.h").unwrap();
        assert!(builder.graph.node(id).children.contains(&header_id));
    }

    #[test]
    fn test_header_binds_to_source_by_base_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lib.h"), "").unwrap();
        std::fs::write(dir.path().join("lib.c"), "#include \"lib.h\"\n").unwrap();
        std::fs::write(dir.path().join("main.c"), "#include \"lib.h\"\n").unwrap();

        let mut builder = builder_for(dir.path(), &[("main.c", &[]), ("lib.c", &[])]);
        builder.scan("main.c").unwrap();

        assert_eq!(builder.header_sources["lib.h"], vec!["lib.c"]);
        assert_eq!(builder.source_headers["lib.c"], vec!["lib.h"]);
    }

    #[test]
    fn test_begin_end_block_with_continuation() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "/*qi: begin\n",
            "compile($source.o):\n",
            "# a comment inside the block\n",
            "    gcc -c $source \\\n",
            "    -o $source.o\n",
            "qi: end*/\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &[])]);
        let id = builder.scan("a.c").unwrap();
        assert_eq!(
            directive_lines(&builder, id),
            vec!["compile($source.o):", "    gcc -c $source     -o $source.o"]
        );
    }

    #[test]
    fn test_scan_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: X = 1\n").unwrap();

        let mut builder = builder_for(dir.path(), &[("a.c", &[])]);
        let id = builder.scan("a.c").unwrap();
        assert_eq!(builder.scan("a.c").unwrap(), id);
        assert_eq!(directive_lines(&builder, id).len(), 1);
    }

    #[test]
    fn test_missing_source_errors() {
        let dir = TempDir::new().unwrap();
        let mut builder = builder_for(dir.path(), &[]);
        assert!(matches!(
            builder.scan("absent.c"),
            Err(BuildError::MissingFile(_))
        ));
    }
}
