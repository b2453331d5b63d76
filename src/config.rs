//! The per-user configuration file.
//!
//! Each user carries their own `KEY = VALUE` table at the project root,
//! named after the host and user so that checkouts shared over NFS or
//! between accounts don't fight over it. The table overrides the host
//! environment in every parse-time symbol table.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{BuildError, Result};

pub type ConfigTable = BTreeMap<String, String>;

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)\s*=\s*([^\r\n]*)").unwrap());

/// The config file path for the current host and user.
pub fn file_name(root: &Path) -> PathBuf {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned());
    root.join(format!(".qi-{}-{}.conf", host, whoami::username()))
}

/// Reads the table. A missing file is an empty table; a line that is not
/// `KEY = VALUE` is a configuration error.
pub fn read(root: &Path) -> Result<ConfigTable> {
    let path = file_name(root);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => return Ok(ConfigTable::new()),
    };

    let mut table = ConfigTable::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let caps = KEY_VALUE
            .captures(line)
            .ok_or_else(|| BuildError::MalformedConfig(path.display().to_string()))?;
        table.insert(
            caps.get(1).map_or("", |m| m.as_str()).to_owned(),
            caps.get(2).map_or("", |m| m.as_str()).to_owned(),
        );
    }
    Ok(table)
}

/// Writes the table back, one `KEY = VALUE` per line.
pub fn write(root: &Path, table: &ConfigTable) -> Result<()> {
    let path = file_name(root);
    let mut text = String::new();
    for (key, value) in table {
        text.push_str(key);
        text.push_str(" = ");
        text.push_str(value);
        text.push('\n');
    }
    fs::write(&path, text).map_err(|_| BuildError::ConfigWrite(path.display().to_string()))
}
