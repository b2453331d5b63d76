use std::fmt::{self, Display};

/// Where a directive line came from: the standard name of the file that
/// carried it and the 1-based line number within that file.
///
/// Origins survive scanning, parsing and execution so that every error can be
/// pinned to the line that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub file: String,
    pub line: u32,
}

impl Origin {
    pub fn new<F: Into<String>>(file: F, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
