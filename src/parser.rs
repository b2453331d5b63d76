//! The rule compiler.
//!
//! Parsing a source assembles its directive stream — initialization code,
//! the source's own directives with included files spliced in, finalization
//! code — and walks it line by line, maintaining the conditional stack and
//! the current rule. File-scope lines take effect immediately; rule-body
//! lines compile into commands with their payloads kept deferred, so they
//! expand against the rule's own scope at execution time.

use std::collections::HashSet;

use qi_lang::{AssignOp, Conditional, CmpOp, Origin};
use qi_make_graph::{CodeElement, CodeLine, Command, CommandKind, NodeId};
use regex::Regex;

use crate::builder::Builder;
use crate::error::{BuildError, Result};

impl Builder {
    /// Parses `source` into its actions, scanning it first if needed.
    /// Idempotent; returns the action names declared by the source. With
    /// `print_code`, the assembled directive stream is printed first (the
    /// `scan` verb), and parsing still proceeds.
    pub fn parse(&mut self, source: &str, print_code: bool) -> Result<Vec<String>> {
        let source_id = self.scan(source)?;

        if !print_code {
            if let Some(actions) = &self.file(source_id).actions {
                return Ok(actions.clone());
            }
        }

        let mut code = self.init_code.clone();
        let mut visited = HashSet::new();
        visited.insert(source_id);
        self.collect_code(source_id, &mut visited, &mut code);
        code.extend(self.final_code.iter().cloned());

        if print_code {
            println!("{} {}{}", "*".repeat(30), source, "*".repeat(30));
            for line in &code {
                println!("{}, {}: {}", line.origin.file, line.origin.line, line.text);
            }
            if let Some(actions) = &self.file(source_id).actions {
                return Ok(actions.clone());
            }
        }

        log::debug!("parsing {}", source);
        let mut symbols = self.parse_symbols(source);
        self.file_mut(source_id).actions = Some(Vec::new());

        let mut if_stack: Vec<bool> = Vec::new();
        let mut current_action: Option<NodeId> = None;
        let mut current_indent: Option<String> = None;
        let mut last_origin = Origin::new(source, 0);

        for code_line in &code {
            let origin = code_line.origin.clone();
            let line = code_line.text.as_str();
            last_origin = origin.clone();

            if line.trim().is_empty() {
                current_action = None;
                continue;
            }

            if let Some(conditional) = qi_lang::conditional(line) {
                match conditional {
                    Conditional::If {
                        deref,
                        lhs,
                        op,
                        rhs,
                    } => {
                        let lhs_value = if deref {
                            match symbols.get(lhs) {
                                Some(value) => value.clone(),
                                None => {
                                    return Err(BuildError::UndefinedVariable {
                                        name: lhs.to_owned(),
                                        origin,
                                    })
                                }
                            }
                        } else {
                            lhs.to_owned()
                        };
                        let rhs_value = self.translate(rhs.trim(), &symbols, &origin, false)?;
                        let result = match op {
                            CmpOp::Eq => lhs_value == rhs_value,
                            CmpOp::Ne => lhs_value != rhs_value,
                            CmpOp::Match | CmpOp::NoMatch => {
                                let pattern =
                                    Regex::new(&rhs_value).map_err(|err| BuildError::BadRegex {
                                        pattern: rhs_value.clone(),
                                        err,
                                        origin: origin.clone(),
                                    })?;
                                pattern.is_match(&lhs_value) == (op == CmpOp::Match)
                            }
                        };
                        if_stack.push(result);
                    }
                    Conditional::Ifdef { negated, name } => {
                        if_stack.push(symbols.contains_key(name) != negated);
                    }
                    Conditional::Else => match if_stack.last_mut() {
                        Some(branch) => *branch = !*branch,
                        None => return Err(BuildError::DanglingElse { origin }),
                    },
                    Conditional::Endif => {
                        if if_stack.pop().is_none() {
                            return Err(BuildError::DanglingEndif { origin });
                        }
                    }
                }
                continue;
            }

            if if_stack.iter().any(|branch| !*branch) {
                continue;
            }

            if let Some(rule) = qi_lang::rule_header(line) {
                if !rule.indent.is_empty() {
                    return Err(BuildError::IndentedRule { origin });
                }
                if qi_lang::RESERVED_ACTIONS.contains(&rule.name) {
                    return Err(BuildError::ReservedAction {
                        name: rule.name.to_owned(),
                        origin,
                    });
                }
                let targets = match rule.targets {
                    Some(targets) => self.translate(targets, &symbols, &origin, false)?,
                    None => String::new(),
                };
                let dependents = self.translate(rule.dependents, &symbols, &origin, true)?;
                match self.find_action_node(rule.name, source)? {
                    Some(id) => {
                        if !targets.is_empty() && self.action(id).targets != targets {
                            return Err(BuildError::TargetMismatch {
                                name: rule.name.to_owned(),
                                origin,
                            });
                        }
                        let action = self.action_mut(id);
                        action.dependents.push(' ');
                        action.dependents.push_str(&dependents);
                        current_action = Some(id);
                    }
                    None => {
                        let id = self.add_action_node(rule.name, source, targets, origin.clone());
                        self.action_mut(id).dependents = dependents;
                        let actions = self
                            .file_mut(source_id)
                            .actions
                            .as_mut()
                            .expect("actions initialised before the parse loop");
                        if !actions.iter().any(|a| a == rule.name) {
                            actions.push(rule.name.to_owned());
                        }
                        current_action = Some(id);
                    }
                }
                current_indent = None;
                continue;
            }

            if current_action.is_some() {
                let indent = qi_lang::indentation(line);
                if indent.is_empty() {
                    current_action = None;
                } else {
                    if let Some(expected) = &current_indent {
                        if expected != indent {
                            return Err(BuildError::IndentationChanged { origin });
                        }
                    }
                    current_indent = Some(indent.to_owned());
                }
            }

            if let Some(assign) = qi_lang::assignment(line) {
                let mut rhs = assign.rhs.trim().to_owned();
                if rhs.len() > 2 && rhs.starts_with('"') && rhs.ends_with('"') {
                    rhs = rhs[1..rhs.len() - 1].to_owned();
                }
                match current_action {
                    Some(id) => {
                        if symbols.contains_key(assign.var) {
                            return Err(BuildError::RuleScopeReassignment { origin });
                        }
                        let rhs = self.translate(&rhs, &symbols, &origin, true)?;
                        self.action_mut(id).commands.push(Command {
                            origin: origin.clone(),
                            kind: CommandKind::Assignment {
                                var: assign.var.to_owned(),
                                op: assign.op,
                                rhs,
                            },
                        });
                    }
                    None => match assign.op {
                        AssignOp::Set | AssignOp::Defer => {
                            let value = self.translate(
                                &rhs,
                                &symbols,
                                &origin,
                                assign.op == AssignOp::Defer,
                            )?;
                            symbols.insert(assign.var.to_owned(), value);
                        }
                        AssignOp::Append => {
                            let value = self.translate(&rhs, &symbols, &origin, false)?;
                            match symbols.get_mut(assign.var) {
                                Some(existing) => {
                                    existing.push(' ');
                                    existing.push_str(&value);
                                }
                                None => {
                                    symbols.insert(assign.var.to_owned(), value);
                                }
                            }
                        }
                    },
                }
                continue;
            }

            if let Some((name, args)) = qi_lang::function_call(line.trim()) {
                match current_action {
                    Some(id) => {
                        let args = self.translate(args, &symbols, &origin, true)?;
                        self.action_mut(id).commands.push(Command {
                            origin: origin.clone(),
                            kind: CommandKind::FunctionCall {
                                name: name.to_owned(),
                                args,
                            },
                        });
                    }
                    None => {
                        let args = self.translate(args, &symbols, &origin, false)?;
                        self.call_function(name, &args, &symbols, &origin)?;
                    }
                }
                continue;
            }

            match current_action {
                Some(id) => {
                    let text = self.translate(line.trim(), &symbols, &origin, true)?;
                    self.action_mut(id).commands.push(Command {
                        origin: origin.clone(),
                        kind: CommandKind::External(text),
                    });
                }
                None => {
                    return Err(BuildError::Syntax {
                        line: line.to_owned(),
                        origin,
                    })
                }
            }
        }

        if !if_stack.is_empty() {
            return Err(BuildError::UnterminatedIf {
                origin: last_origin,
            });
        }

        Ok(self.file(source_id).actions.clone().unwrap_or_default())
    }

    /// Splices the directive streams of `id` and every included file, each
    /// included file once per parse, in include order.
    fn collect_code(&self, id: NodeId, visited: &mut HashSet<NodeId>, out: &mut Vec<CodeLine>) {
        for element in &self.file(id).code {
            match element {
                CodeElement::Line(line) => out.push(line.clone()),
                CodeElement::Include(included) => {
                    if visited.insert(*included) {
                        self.collect_code(*included, visited, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Options;
    use crate::config::ConfigTable;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn builder_for(root: &Path, sources: &[&str]) -> Builder {
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
            Options::default(),
        )
        .unwrap()
    }

    fn commands(builder: &Builder, action: &str, source: &str) -> Vec<CommandKind> {
        let id = builder.find_action_node(action, source).unwrap().unwrap();
        builder
            .action(id)
            .commands
            .iter()
            .map(|c| c.kind.clone())
            .collect()
    }

    #[test]
    fn test_simple_rule() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: compile($source.o):\n",
            "//qi:     gcc -c $source -o $source.o\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        let actions = builder.parse("a.c", false).unwrap();
        assert_eq!(actions, vec!["compile"]);

        let id = builder.find_action_node("compile", "a.c").unwrap().unwrap();
        let action = builder.action(id);
        assert_eq!(action.targets, "a.c.o");
        assert_eq!(action.commands.len(), 1);
        match &action.commands[0].kind {
            CommandKind::External(text) => {
                // Variables substitute at parse time; only calls stay
                // deferred.
                assert_eq!(text, "gcc -c a.c -o a.c.o");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: build:\n//qi:     true\n").unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        builder.parse("a.c", false).unwrap();
        assert_eq!(commands(&builder, "build", "a.c").len(), 1);
    }

    #[test]
    fn test_blank_line_terminates_rule() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: build:\n",
            "//qi:     true\n",
            "//qi: \n",
            "//qi: X = 1\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        // The assignment landed at file scope, not in the rule.
        assert_eq!(commands(&builder, "build", "a.c").len(), 1);
    }

    #[test]
    fn test_file_scope_assignments() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: QI_CC = gcc\n",
            "//qi: QI_CC += -O2\n",
            "//qi: build:\n",
            "//qi:     $QI_CC $source\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        match &commands(&builder, "build", "a.c")[0] {
            CommandKind::External(text) => assert_eq!(text, "gcc -O2 a.c"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_deferred_assignment_keeps_call() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: QI_NOW := $(shell echo later)\n",
            "//qi: build:\n",
            "//qi:     echo $QI_NOW\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        match &commands(&builder, "build", "a.c")[0] {
            CommandKind::External(text) => {
                assert_eq!(text, "echo $(shell echo later)");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_conditionals() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: QI_MODE = debug\n",
            "//qi: if $QI_MODE == debug\n",
            "//qi: QI_FLAGS = -g\n",
            "//qi: else\n",
            "//qi: QI_FLAGS = -O2\n",
            "//qi: endif\n",
            "//qi: build:\n",
            "//qi:     cc $QI_FLAGS\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        match &commands(&builder, "build", "a.c")[0] {
            CommandKind::External(text) => assert_eq!(text, "cc -g"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_config_conditional_in_rule_body() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: build:\n",
            "//qi:     if $PLATFORM == TestOS\n",
            "//qi:     cl /c $source\n",
            "//qi:     else\n",
            "//qi:     gcc -c $source\n",
            "//qi:     endif\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut map = BTreeMap::new();
        map.insert("a.c".to_owned(), Vec::new());
        let mut config = ConfigTable::new();
        config.insert("PLATFORM".to_owned(), "TestOS".to_owned());
        let mut builder = Builder::new(
            dir.path().canonicalize().unwrap(),
            map,
            Vec::new(),
            Vec::new(),
            std::collections::HashMap::new(),
            config,
            Options::default(),
        )
        .unwrap();
        builder.parse("a.c", false).unwrap();

        let compiled = commands(&builder, "build", "a.c");
        assert_eq!(compiled.len(), 1);
        match &compiled[0] {
            CommandKind::External(text) => assert_eq!(text, "cl /c a.c"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_ifdef() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: ifdef QI_SURELY_UNSET_XYZ\n",
            "//qi: QI_OUT = yes\n",
            "//qi: endif\n",
            "//qi: ifndef QI_SURELY_UNSET_XYZ\n",
            "//qi: QI_OUT = no\n",
            "//qi: endif\n",
            "//qi: build:\n",
            "//qi:     echo $QI_OUT\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        match &commands(&builder, "build", "a.c")[0] {
            CommandKind::External(text) => assert_eq!(text, "echo no"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_undefined_if_variable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.c"),
            "//qi: if $QI_SURELY_UNSET_XYZ == x\n//qi: endif\n",
        )
        .unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn test_unterminated_if() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: ifdef PATH\n").unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::UnterminatedIf { .. })
        ));
    }

    #[test]
    fn test_dangling_else() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: else\n").unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::DanglingElse { .. })
        ));
    }

    #[test]
    fn test_reserved_action_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: scan:\n//qi:     true\n").unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::ReservedAction { .. })
        ));
    }

    #[test]
    fn test_rule_scope_reassignment_rejected() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: QI_SET = once\n",
            "//qi: build:\n",
            "//qi:     QI_SET = twice\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::RuleScopeReassignment { .. })
        ));
    }

    #[test]
    fn test_inconsistent_indentation() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: build:\n",
            "//qi:     true\n",
            "//qi:   false\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::IndentationChanged { .. })
        ));
    }

    #[test]
    fn test_bare_line_outside_rule() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: gcc -c whatever\n").unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::Syntax { .. })
        ));
    }

    #[test]
    fn test_redeclared_action_appends_dependents() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: build(a.out): one.o\n",
            "//qi: \n",
            "//qi: build: two.o\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        let actions = builder.parse("a.c", false).unwrap();
        assert_eq!(actions, vec!["build"]);
        let id = builder.find_action_node("build", "a.c").unwrap().unwrap();
        assert_eq!(builder.action(id).dependents, " one.o  two.o");
    }

    #[test]
    fn test_redeclared_action_target_mismatch() {
        let dir = TempDir::new().unwrap();
        let text = concat!(
            "//qi: build(a.out):\n",
            "//qi: \n",
            "//qi: build(b.out):\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        assert!(matches!(
            builder.parse("a.c", false),
            Err(BuildError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn test_initialization_code_prepended() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.c"), "//qi: build:\n//qi:     $QI_TOOL\n").unwrap();

        let mut map = BTreeMap::new();
        map.insert("a.c".to_owned(), Vec::new());
        let mut builder = Builder::new(
            dir.path().canonicalize().unwrap(),
            map,
            vec![CodeLine::new(Origin::new("qi.prj", 2), "QI_TOOL = lint")],
            Vec::new(),
            std::collections::HashMap::new(),
            ConfigTable::new(),
            Options::default(),
        )
        .unwrap();
        builder.parse("a.c", false).unwrap();
        match &commands(&builder, "build", "a.c")[0] {
            CommandKind::External(text) => assert_eq!(text, "lint"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_included_directives_spliced_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("common.h"), "//qi: QI_COMMON = -Wall\n").unwrap();
        let text = concat!(
            "#include \"common.h\"\n",
            "#include \"common.h\"\n",
            "//qi: build:\n",
            "//qi:     cc $QI_COMMON\n",
        );
        std::fs::write(dir.path().join("a.c"), text).unwrap();

        let mut builder = builder_for(dir.path(), &["a.c"]);
        builder.parse("a.c", false).unwrap();
        match &commands(&builder, "build", "a.c")[0] {
            CommandKind::External(text) => assert_eq!(text, "cc -Wall"),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
