//! Built-in directive functions and user-function dispatch.
//!
//! All functions take a single raw argument string; most split it on
//! whitespace (paren-aware where grouped sets make sense). They return
//! strings — even `mkdir`, whose result participates in string
//! concatenation and therefore yields the empty string.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use qi_lang::Origin;
use regex::Regex;

use crate::builder::{strip_extension, UserFunction};
use crate::error::{BuildError, Result};
use crate::eval::{expand, Access};
use crate::paths;

pub(crate) fn call<A: Access>(
    access: &mut A,
    name: &str,
    args: &str,
    symbols: &crate::builder::SymbolTable,
    origin: &Origin,
) -> Result<String> {
    match name {
        "shell" => {
            let exec = qi_make_process::run(args, &access.builder().root)?;
            Ok(exec.output.trim().to_owned())
        }
        "eval" => expand(access, args, symbols, origin, false),
        "print" => {
            println!("{}", args);
            Ok(String::new())
        }
        "reverse" => {
            let mut items = qi_lang::split(args);
            items.reverse();
            Ok(items.join(" "))
        }
        "match" => match_groups(args, origin),
        "add_prefix" => Ok(affix(args, true)),
        "add_suffix" => Ok(affix(args, false)),
        "list" => {
            let mut sources = Vec::new();
            for dir in qi_lang::split(args) {
                for source in access.builder().source_headers.keys() {
                    if source.starts_with(&dir) {
                        sources.push(source.clone());
                    }
                }
            }
            Ok(sources.join(" "))
        }
        "get_headers" => {
            let mut headers = Vec::new();
            for source in qi_lang::split(args) {
                if access.builder().source_headers.contains_key(&source) {
                    access.ensure_scanned(&source, origin)?;
                    if let Some(declared) = access.builder().source_headers.get(&source) {
                        headers.extend(declared.iter().cloned());
                    }
                }
            }
            Ok(headers.join(" "))
        }
        "get_sources" => {
            let mut sources = Vec::new();
            for header in qi_lang::split(args) {
                if let Some(declaring) = access.builder().header_sources.get(&header) {
                    sources.extend(declaring.iter().cloned());
                } else if let Some(source) =
                    access.builder().base_sources.get(&strip_extension(&header))
                {
                    sources.push(source.clone());
                }
            }
            Ok(sources.join(" "))
        }
        "join" => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            Ok(match parts.split_first() {
                Some((base, rest)) => rest
                    .iter()
                    .map(|p| paths::join_name(base, p))
                    .collect::<Vec<_>>()
                    .join(" "),
                None => String::new(),
            })
        }
        "remove" => Ok(remove(args)),
        "exist" => {
            for item in qi_lang::split(args) {
                if !paths::join(&access.builder().root, &item).exists() {
                    return Ok("0".to_owned());
                }
            }
            Ok("1".to_owned())
        }
        "compile_depends" => {
            let mut results = Vec::new();
            let mut seen = HashSet::new();
            for source in qi_lang::split(args) {
                let id = access.ensure_scanned(&source, origin)?;
                for node in access.builder().graph.dfs(id, false)? {
                    if node == id {
                        continue;
                    }
                    let name = access.builder().node_name(node).to_owned();
                    if seen.insert(name.clone()) {
                        results.push(name);
                    }
                }
            }
            Ok(results.join(" "))
        }
        "link_depends" => {
            let mut results = Vec::new();
            let mut visited = HashSet::new();
            link_depends(access, args.trim(), &mut results, &mut visited, origin)?;
            Ok(results.join(" "))
        }
        "file_name" => Ok(origin.file.clone()),
        "line_number" => Ok(origin.line.to_string()),
        "dir" => Ok(Path::new(args)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()),
        "mkdir" => {
            let _ = fs::create_dir_all(paths::join(&access.builder().root, args));
            Ok(String::new())
        }
        "platform" => Ok(paths::platform_name().to_owned()),
        _ => call_user_function(access, name, args, symbols, origin),
    }
}

/// Expands `$action(sources…)`: evaluate the sources, make sure each is
/// parsed, and concatenate the action's targets across them. Sources that
/// never declared the action contribute nothing.
pub(crate) fn expand_action<A: Access>(
    access: &mut A,
    action: &str,
    sources: &str,
    symbols: &crate::builder::SymbolTable,
    origin: &Origin,
) -> Result<String> {
    let sources = expand(access, sources, symbols, origin, false)?;
    let mut results = Vec::new();
    for source in sources.split_whitespace() {
        access.ensure_parsed(source)?;
        if let Some(id) = access.builder().find_action_node(action, source)? {
            results.push(access.builder().action(id).targets.clone());
        }
    }
    Ok(results.join(" "))
}

fn call_user_function<A: Access>(
    access: &mut A,
    name: &str,
    args: &str,
    symbols: &crate::builder::SymbolTable,
    origin: &Origin,
) -> Result<String> {
    let template = match access.builder().user_functions.get(name) {
        None => {
            return Err(BuildError::UnknownFunction {
                name: name.to_owned(),
                origin: origin.clone(),
            })
        }
        Some(UserFunction::Native(function)) => {
            return function(args).map_err(|message| BuildError::UserFunction {
                name: name.to_owned(),
                message,
                origin: origin.clone(),
            })
        }
        Some(UserFunction::Template(template)) => template.clone(),
    };

    let mut scope = symbols.clone();
    scope.insert("args".to_owned(), args.to_owned());
    for (index, arg) in args.split_whitespace().enumerate() {
        scope.insert((index + 1).to_string(), arg.to_owned());
    }
    expand(access, &template, &scope, origin, false)
}

/// `match <regex> <candidates…>`: the first capture group of every
/// candidate the pattern matches.
fn match_groups(args: &str, origin: &Origin) -> Result<String> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() <= 1 {
        return Ok(String::new());
    }
    let pattern = Regex::new(parts[0]).map_err(|err| BuildError::BadRegex {
        pattern: parts[0].to_owned(),
        err,
        origin: origin.clone(),
    })?;
    let mut results = Vec::new();
    for candidate in &parts[1..] {
        if let Some(group) = pattern.captures(candidate).and_then(|c| c.get(1)) {
            results.push(group.as_str().to_owned());
        }
    }
    Ok(results.join(" "))
}

fn affix(args: &str, prefix: bool) -> String {
    let parts: Vec<&str> = args.split_whitespace().collect();
    match parts.split_first() {
        Some((affix, rest)) => rest
            .iter()
            .map(|item| {
                if prefix {
                    format!("{}{}", affix, item)
                } else {
                    format!("{}{}", item, affix)
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        None => String::new(),
    }
}

/// `remove <set> <items…>` where the set may be a parenthesised group.
/// Each item removes one occurrence.
fn remove(args: &str) -> String {
    let parts = qi_lang::split(args);
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return String::new(),
    };
    let mut set: Vec<String> = if first.len() > 2 && first.starts_with('(') && first.ends_with(')')
    {
        first[1..first.len() - 1]
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    } else {
        vec![first.clone()]
    };
    for item in rest {
        if let Some(position) = set.iter().position(|x| x == item) {
            set.remove(position);
        }
    }
    set.join(" ")
}

/// The link-depend closure: every source whose declared headers appear,
/// transitively, in `source_file`'s include tree. The starting source
/// itself comes last.
fn link_depends<A: Access>(
    access: &mut A,
    source_file: &str,
    results: &mut Vec<String>,
    visited: &mut HashSet<qi_make_graph::NodeId>,
    origin: &Origin,
) -> Result<()> {
    let id = access.ensure_scanned(source_file, origin)?;
    for node in access.builder().graph.dfs(id, false)? {
        if node == id || visited.contains(&node) {
            continue;
        }
        let matched = match access
            .builder()
            .header_sources
            .get(access.builder().node_name(node))
        {
            Some(matched) => matched.clone(),
            None => continue,
        };
        visited.insert(node);
        for source in &matched {
            if !results.contains(source) {
                link_depends(access, source, results, visited, origin)?;
            }
        }
        for source in &matched {
            if !results.contains(source) {
                results.push(source.clone());
            }
        }
    }
    if !results.iter().any(|r| r == source_file) {
        results.push(source_file.to_owned());
    }
    Ok(())
}
