//! Path handling.
//!
//! Names stored in the graph, the project file and the maps are *standard
//! names*: project-relative, written with the host separator. Everything
//! that touches raw OS paths funnels through here.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Rewrites a path string to use the host separator.
pub fn normalize(path: &str) -> String {
    if cfg!(windows) {
        path.replace('/', "\\")
    } else {
        path.replace('\\', "/")
    }
}

/// Joins a standard name onto the project root. An absolute name wins, the
/// same way `os.path`-style joins behave.
pub fn join(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// String-level join used by the `join` directive function.
pub fn join_name(base: &str, rel: &str) -> String {
    normalize(&Path::new(base).join(rel).to_string_lossy())
}

/// The canonical standard name for `path`: symlinks resolved, the root
/// prefix stripped. Paths outside the root keep their full form.
pub fn standard_name(root: &Path, path: &Path) -> String {
    let real = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let stripped = real.strip_prefix(root).unwrap_or(&real);
    normalize(&stripped.to_string_lossy())
}

/// Modification time of `path`, or `None` when it does not exist.
pub fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// The platform name exposed by the `platform` directive function.
pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}
