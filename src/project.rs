//! The project file.
//!
//! `qi.prj` lives at the project root and is the only registry the engine
//! has: which sources belong to the project, which headers they declare,
//! directive code to run before and after every source's own directives,
//! and user-defined function templates. The format is plain text split into
//! bracketed sections.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use qi_lang::Origin;
use qi_make_graph::CodeLine;
use regex::Regex;

use crate::error::{BuildError, Result};
use crate::paths;

pub const PROJECT_FILE: &str = "qi.prj";

const SOURCE_FILES: &str = "[Source Files]";
const INITIALIZATION_CODE: &str = "[Initialization Code]";
const FINALIZATION_CODE: &str = "[Finalization Code]";
const USER_FUNCTIONS: &str = "[User-Defined Functions]";

static FUNCTION_DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*=\s*(.*)").unwrap());

#[derive(Debug, Default)]
pub struct Project {
    /// Registered sources and the headers they declare.
    pub sources: BTreeMap<String, Vec<String>>,
    /// Directive code prepended to every source's own directives.
    pub init_code: Vec<CodeLine>,
    /// Directive code appended after them.
    pub final_code: Vec<CodeLine>,
    /// `NAME = TEMPLATE` expression templates callable as `$(NAME args…)`.
    pub function_templates: Vec<(String, String)>,
    /// Every section except `[Source Files]`, verbatim, so that rewrites
    /// only ever touch the source list.
    other_sections: Vec<(String, Vec<String>)>,
}

impl Project {
    /// Creates an empty project file in `dir`. Refuses to overwrite one.
    pub fn init(dir: &Path) -> Result<()> {
        let path = dir.join(PROJECT_FILE);
        if path.exists() {
            return Err(BuildError::ProjectExists(PROJECT_FILE.to_owned()));
        }
        let text = format!(
            "{}\n{}\n{}\n{}\n",
            SOURCE_FILES, INITIALIZATION_CODE, FINALIZATION_CODE, USER_FUNCTIONS
        );
        fs::write(&path, text).map_err(|_| BuildError::ProjectWrite(PROJECT_FILE.to_owned()))
    }

    /// Walks up from `start` looking for the directory holding the project
    /// file.
    pub fn find_root(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            if dir.join(PROJECT_FILE).exists() {
                return Some(dir);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(PROJECT_FILE);
        let text = fs::read_to_string(&path)
            .map_err(|_| BuildError::ProjectRead(PROJECT_FILE.to_owned()))?;

        let mut project = Project::default();
        let mut current: Option<String> = None;
        let mut seen_sources = false;

        for (index, line) in text.lines().enumerate() {
            let lineno = (index + 1) as u32;
            if line.len() > 2 && line.starts_with('[') && line.ends_with(']') {
                if line == SOURCE_FILES {
                    seen_sources = true;
                } else {
                    project.other_sections.push((line.to_owned(), Vec::new()));
                }
                current = Some(line.to_owned());
                continue;
            }
            let section = match current.as_deref() {
                Some(section) => section,
                None => continue,
            };
            if section == SOURCE_FILES {
                let mut parts = line.split_whitespace().map(str::to_owned);
                if let Some(source) = parts.next() {
                    project
                        .sources
                        .insert(paths::normalize(&source), parts.collect());
                }
                continue;
            }
            if let Some((_, lines)) = project.other_sections.last_mut() {
                lines.push(line.to_owned());
            }
            let origin = Origin::new(PROJECT_FILE, lineno);
            match section {
                INITIALIZATION_CODE => project.init_code.push(CodeLine::new(origin, line)),
                FINALIZATION_CODE => project.final_code.push(CodeLine::new(origin, line)),
                USER_FUNCTIONS => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let caps = FUNCTION_DEFINITION.captures(line).ok_or_else(|| {
                        BuildError::BadFunctionDefinition {
                            line: line.to_owned(),
                            origin,
                        }
                    })?;
                    project.function_templates.push((
                        caps.get(1).map_or("", |m| m.as_str()).to_owned(),
                        caps.get(2).map_or("", |m| m.as_str()).to_owned(),
                    ));
                }
                _ => {}
            }
        }

        if !seen_sources {
            return Err(BuildError::MissingSourceSection {
                origin: Origin::new(PROJECT_FILE, 1),
            });
        }
        Ok(project)
    }

    /// Rewrites the project file: the source list sorted, every other
    /// section byte-for-byte as it was loaded.
    pub fn save(&self, root: &Path) -> Result<()> {
        let mut text = String::new();
        text.push_str(SOURCE_FILES);
        text.push('\n');
        for (source, headers) in &self.sources {
            text.push_str(&format!("{} {}\n", source, headers.join(" ")));
        }
        for (header, lines) in &self.other_sections {
            text.push_str(header);
            text.push('\n');
            for line in lines {
                text.push_str(line);
                text.push('\n');
            }
        }
        fs::write(root.join(PROJECT_FILE), text)
            .map_err(|_| BuildError::ProjectWrite(PROJECT_FILE.to_owned()))
    }

    /// Registers a source, optionally attaching a declared header.
    pub fn add_source(&mut self, source: String, header: Option<String>) {
        let headers = self.sources.entry(source).or_default();
        if let Some(header) = header {
            if !headers.contains(&header) {
                headers.push(header);
            }
        }
    }

    /// Detaches a header from a source, or unregisters the source entirely
    /// when no header is given. Returns whether the source was known.
    pub fn remove_source(&mut self, source: &str, header: Option<&str>) -> bool {
        match header {
            Some(header) => match self.sources.get_mut(source) {
                Some(headers) => {
                    headers.retain(|h| h != header);
                    true
                }
                None => false,
            },
            None => self.sources.remove(source).is_some(),
        }
    }
}
