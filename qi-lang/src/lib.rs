//! The qi directive language: the comment-embedded build language carried by
//! C/C++ sources.
//!
//! This crate is purely textual. It knows how to recognise directive lines
//! inside source text, how to break the rule language into its line classes,
//! and how to tokenise expression strings for substitution. Evaluation,
//! filesystem access and graph bookkeeping all live with the caller.

mod expr;
mod line;
mod origin;

pub use expr::{split, split_action_sources, tokens, Token, Tokens};
pub use line::{
    assignment, begin_block, conditional, end_block, function_call, include_file, include_path,
    indentation, one_line_code, rule_header, AssignOp, Assignment, CmpOp, Conditional,
    IncludeDirective, RuleHeader,
};
pub use origin::Origin;

/// Action names reserved for the command-line verbs; a rule may not use them.
pub const RESERVED_ACTIONS: &[&str] = &[
    "add", "delete", "list", "scan", "parse", "set", "unset", "init",
];
