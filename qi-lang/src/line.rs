//! Line grammars.
//!
//! Two families live here: the directive markers the scanner looks for while
//! reading C/C++ text (`includepath`, `#include`, `qi: begin`/`qi: end`,
//! one-line `//qi:` code), and the line classes of the rule language itself
//! (conditionals, rule headers, assignments, function calls).
//!
//! All patterns are anchored at the start of the line and deliberately
//! permissive about what follows the part they care about.

use std::fmt::{self, Display};

use once_cell::sync::Lazy;
use regex::Regex;

static INCLUDE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/(?:/|\*)qi:\s*includepath\s+<(.+)>").unwrap());
static INCLUDE_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?://)?#\s*include\s*["<](.+)[">]\s*(/(?:/|\*)qi:\s*ignore)?"#).unwrap()
});
// At most one separator character is stripped after the marker, so the
// indentation of one-line rule-body directives survives capture.
static ONE_LINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^//qi:\s?(.*)|^/\*qi:\s?(.*)\*/").unwrap());
static BEGIN_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:/\*)?qi:\s*begin").unwrap());
static END_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^qi:\s*end\s*(?:\*/)?").unwrap());

static IF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*if\s+(\$)?(\w+)\s*(~=|~|!~|==|=|!=)(.*)").unwrap());
static IFDEF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*if(n)?def\s+(\w+)").unwrap());
static ELSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*else").unwrap());
static ENDIF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*endif").unwrap());
static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)(\w+)\s*(=|\+=|:=)(.*)").unwrap());
static RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)(\w+)(\([^:]+\))?:(.*)").unwrap());
static FUNCTION_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\$\((\w+)\s+(.*)\)").unwrap());
static INDENTATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*").unwrap());

/// An `#include` recognised by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective<'a> {
    /// The path between the quotes or angle brackets, as written.
    pub path: &'a str,
    /// Whether a trailing `qi: ignore` marker suppresses resolution.
    pub ignored: bool,
}

/// Matches `//qi: includepath <PATH>` and `/*qi: includepath <PATH>*/`,
/// returning the path text.
pub fn include_path(line: &str) -> Option<&str> {
    INCLUDE_PATH
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Matches `#include "X"` and `#include <X>`, optionally commented out with
/// `//` and optionally carrying a trailing ignore marker.
pub fn include_file(line: &str) -> Option<IncludeDirective<'_>> {
    INCLUDE_FILE.captures(line).map(|c| IncludeDirective {
        path: c.get(1).map_or("", |m| m.as_str()),
        ignored: c.get(2).is_some(),
    })
}

/// Matches a one-line directive, `//qi: <code>` or `/*qi: <code>*/`,
/// returning the code text.
pub fn one_line_code(line: &str) -> Option<&str> {
    ONE_LINE_CODE
        .captures(line)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str())
}

/// Whether the line opens a `qi: begin` block.
pub fn begin_block(line: &str) -> bool {
    BEGIN_BLOCK.is_match(line)
}

/// Whether the line closes a `qi: begin` block.
pub fn end_block(line: &str) -> bool {
    END_BLOCK.is_match(line)
}

/// A comparison operator of an `if` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==` or `=`.
    Eq,
    /// `!=`.
    Ne,
    /// `~` or `~=`: the right-hand side is a regex matched against the left.
    Match,
    /// `!~`.
    NoMatch,
}

/// A conditional line of the rule language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<'a> {
    If {
        /// `true` when the left-hand side was written `$NAME` and must be
        /// dereferenced through the symbol table.
        deref: bool,
        lhs: &'a str,
        op: CmpOp,
        rhs: &'a str,
    },
    Ifdef {
        negated: bool,
        name: &'a str,
    },
    Else,
    Endif,
}

/// Classifies a conditional line, if it is one.
pub fn conditional(line: &str) -> Option<Conditional<'_>> {
    if let Some(c) = IF.captures(line) {
        let op = match c.get(3).map_or("", |m| m.as_str()) {
            "==" | "=" => CmpOp::Eq,
            "!=" => CmpOp::Ne,
            "~" | "~=" => CmpOp::Match,
            _ => CmpOp::NoMatch,
        };
        return Some(Conditional::If {
            deref: c.get(1).is_some(),
            lhs: c.get(2).map_or("", |m| m.as_str()),
            op,
            rhs: c.get(4).map_or("", |m| m.as_str()),
        });
    }
    if let Some(c) = IFDEF.captures(line) {
        return Some(Conditional::Ifdef {
            negated: c.get(1).is_some(),
            name: c.get(2).map_or("", |m| m.as_str()),
        });
    }
    if ELSE.is_match(line) {
        return Some(Conditional::Else);
    }
    if ENDIF.is_match(line) {
        return Some(Conditional::Endif);
    }
    None
}

/// An assignment operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`: evaluate now.
    Set,
    /// `+=`: evaluate now and append.
    Append,
    /// `:=`: keep function calls for execution time.
    Defer,
}

impl Display for AssignOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssignOp::Set => "=",
            AssignOp::Append => "+=",
            AssignOp::Defer => ":=",
        })
    }
}

/// An assignment line, `VAR = RHS` and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment<'a> {
    pub indent: &'a str,
    pub var: &'a str,
    pub op: AssignOp,
    pub rhs: &'a str,
}

pub fn assignment(line: &str) -> Option<Assignment<'_>> {
    ASSIGNMENT.captures(line).map(|c| Assignment {
        indent: c.get(1).map_or("", |m| m.as_str()),
        var: c.get(2).map_or("", |m| m.as_str()),
        op: match c.get(3).map_or("", |m| m.as_str()) {
            "=" => AssignOp::Set,
            "+=" => AssignOp::Append,
            _ => AssignOp::Defer,
        },
        rhs: c.get(4).map_or("", |m| m.as_str()),
    })
}

/// A rule header, `NAME(targets): dependents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHeader<'a> {
    pub indent: &'a str,
    pub name: &'a str,
    /// The text between the parentheses, absent when no target list was
    /// written.
    pub targets: Option<&'a str>,
    pub dependents: &'a str,
}

/// Classifies a rule header. Callers must try this *before* [`assignment`]:
/// `X:=v` written without a space parses as a rule named `X`, matching the
/// precedence the language has always had.
pub fn rule_header(line: &str) -> Option<RuleHeader<'_>> {
    RULE.captures(line).map(|c| RuleHeader {
        indent: c.get(1).map_or("", |m| m.as_str()),
        name: c.get(2).map_or("", |m| m.as_str()),
        targets: c.get(3).map(|m| {
            let t = m.as_str();
            &t[1..t.len() - 1]
        }),
        dependents: c.get(4).map_or("", |m| m.as_str()),
    })
}

/// Matches a whole-line function call, `$(name args…)`.
pub fn function_call(line: &str) -> Option<(&str, &str)> {
    FUNCTION_CALL.captures(line).map(|c| {
        (
            c.get(1).map_or("", |m| m.as_str()),
            c.get(2).map_or("", |m| m.as_str()),
        )
    })
}

/// The leading whitespace of a line.
pub fn indentation(line: &str) -> &str {
    INDENTATION.find(line).map_or("", |m| m.as_str())
}
