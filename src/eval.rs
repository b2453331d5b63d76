//! Expression expansion.
//!
//! The tokeniser lives in `qi-lang`; this module drives it. Expansion walks
//! the token stream with a stack of open function-call/action-expansion
//! frames, substituting variables as it goes. In deferred mode a completed
//! frame is copied back out verbatim (variables already substituted) so the
//! call can be re-expanded at execution time against the rule's own scope.

use qi_lang::{Origin, Token};
use qi_make_graph::NodeId;

use crate::builder::{Builder, SymbolTable};
use crate::error::{BuildError, Result};
use crate::functions;

/// Phase-dependent view of the builder used during evaluation.
///
/// Parse-phase evaluation may scan and parse further sources on demand.
/// Execute-phase evaluation runs on worker threads and must leave the graph
/// untouched, so it only accepts sources the coordinator has already
/// visited.
pub(crate) trait Access {
    fn builder(&self) -> &Builder;
    fn ensure_scanned(&mut self, source: &str, origin: &Origin) -> Result<NodeId>;
    fn ensure_parsed(&mut self, source: &str) -> Result<()>;
}

pub(crate) struct ParseAccess<'a>(pub &'a mut Builder);

impl Access for ParseAccess<'_> {
    fn builder(&self) -> &Builder {
        self.0
    }

    fn ensure_scanned(&mut self, source: &str, _origin: &Origin) -> Result<NodeId> {
        self.0.scan(source)
    }

    fn ensure_parsed(&mut self, source: &str) -> Result<()> {
        self.0.parse(source, false).map(|_| ())
    }
}

pub(crate) struct ExecAccess<'a>(pub &'a Builder);

impl Access for ExecAccess<'_> {
    fn builder(&self) -> &Builder {
        self.0
    }

    fn ensure_scanned(&mut self, source: &str, origin: &Origin) -> Result<NodeId> {
        match self.0.find_file_node(source)? {
            Some(id) if self.0.file(id).scanned => Ok(id),
            _ => Err(BuildError::NotScanned {
                name: source.to_owned(),
                origin: origin.clone(),
            }),
        }
    }

    fn ensure_parsed(&mut self, source: &str) -> Result<()> {
        match self.0.find_file_node(source)? {
            Some(id) if self.0.file(id).actions.is_some() => Ok(()),
            _ => Err(BuildError::NotParsed(source.to_owned())),
        }
    }
}

struct Frame {
    text: String,
    depth: i32,
}

fn top(stack: &mut Vec<Frame>) -> &mut Frame {
    stack.last_mut().expect("expansion stack is never empty")
}

/// Expands `input` against `symbols`. With `defer`, function calls and
/// action expansions are preserved textually; variables substitute either
/// way. Unknown variable names pass through as written.
pub(crate) fn expand<A: Access>(
    access: &mut A,
    input: &str,
    symbols: &SymbolTable,
    origin: &Origin,
    defer: bool,
) -> Result<String> {
    let mut stack = vec![Frame {
        text: String::new(),
        depth: 0,
    }];

    for token in qi_lang::tokens(input) {
        match token {
            Token::Text(text) => top(&mut stack).text.push_str(text),
            Token::Var(name) => {
                let frame = top(&mut stack);
                match symbols.get(name) {
                    Some(value) => frame.text.push_str(value),
                    None => {
                        frame.text.push('$');
                        frame.text.push_str(name);
                    }
                }
            }
            Token::ParenVar(name) => {
                let frame = top(&mut stack);
                match symbols.get(name) {
                    Some(value) => frame.text.push_str(value),
                    None => {
                        frame.text.push_str("$(");
                        frame.text.push_str(name);
                        frame.text.push(')');
                    }
                }
            }
            Token::Funct { raw, .. } | Token::Action { raw, .. } => stack.push(Frame {
                text: raw.to_owned(),
                depth: 1,
            }),
            Token::Dollar => top(&mut stack).text.push('$'),
            Token::Lparen => {
                let frame = top(&mut stack);
                frame.text.push('(');
                frame.depth += 1;
            }
            Token::Rparen => {
                let depth = {
                    let frame = top(&mut stack);
                    frame.text.push(')');
                    frame.depth -= 1;
                    frame.depth
                };
                if depth == 0 && stack.len() > 1 {
                    let frame = stack.pop().expect("expansion stack is never empty");
                    let expansion = if defer {
                        frame.text
                    } else if let Some((name, args)) = qi_lang::function_call(&frame.text) {
                        functions::call(access, name, args, symbols, origin)?
                    } else if let Some((action, sources)) =
                        qi_lang::split_action_sources(&frame.text)
                    {
                        functions::expand_action(access, action, sources, symbols, origin)?
                    } else {
                        return Err(BuildError::NotEvaluable {
                            text: frame.text,
                            origin: origin.clone(),
                        });
                    };
                    top(&mut stack).text.push_str(&expansion);
                }
            }
        }
    }

    if stack.len() != 1 {
        return Err(BuildError::UnclosedParen {
            origin: origin.clone(),
        });
    }
    Ok(stack.pop().expect("expansion stack is never empty").text)
}

impl Builder {
    /// Parse-phase expansion; may scan and parse other sources.
    pub(crate) fn translate(
        &mut self,
        input: &str,
        symbols: &SymbolTable,
        origin: &Origin,
        defer: bool,
    ) -> Result<String> {
        expand(&mut ParseAccess(self), input, symbols, origin, defer)
    }

    /// Execute-phase expansion; read-only with respect to the graph.
    pub(crate) fn translate_exec(
        &self,
        input: &str,
        symbols: &SymbolTable,
        origin: &Origin,
    ) -> Result<String> {
        expand(&mut ExecAccess(self), input, symbols, origin, false)
    }

    /// Parse-phase function invocation, used for file-scope call lines.
    pub(crate) fn call_function(
        &mut self,
        name: &str,
        args: &str,
        symbols: &SymbolTable,
        origin: &Origin,
    ) -> Result<String> {
        functions::call(&mut ParseAccess(self), name, args, symbols, origin)
    }

    /// Execute-phase function invocation, used by workers.
    pub(crate) fn call_function_exec(
        &self,
        name: &str,
        args: &str,
        symbols: &SymbolTable,
        origin: &Origin,
    ) -> Result<String> {
        functions::call(&mut ExecAccess(self), name, args, symbols, origin)
    }
}
