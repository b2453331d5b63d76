//! External command execution.
//!
//! Commands come in as a single string the way they were written in a rule
//! body. Splitting follows the platform convention: POSIX lexer rules
//! everywhere except Windows, which splits on whitespace. The child runs
//! with stdout and stderr captured; callers get the combined output and a
//! classified exit status.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot execute an empty command")]
    Empty,

    #[error("unbalanced quoting in command '{0}'")]
    Quoting(String),

    #[error("error spawning '{command}': {err}")]
    Spawn {
        command: String,
        #[source]
        err: io::Error,
    },
}

/// How a child process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with the given code.
    Code(i32),
    /// Killed by the given signal.
    Signal(i32),
}

impl ExitKind {
    pub fn success(self) -> bool {
        self == ExitKind::Code(0)
    }
}

/// Outcome of a finished child process.
#[derive(Debug)]
pub struct Exec {
    /// Captured stdout with stderr appended, lossily decoded.
    pub output: String,
    pub status: ExitKind,
}

/// Splits a command line into an argument vector.
pub fn split_command(command: &str) -> Result<Vec<String>, Error> {
    let argv = if cfg!(windows) {
        command.split_whitespace().map(str::to_owned).collect()
    } else {
        shlex::split(command).ok_or_else(|| Error::Quoting(command.to_owned()))?
    };
    Ok(argv)
}

/// Runs `command` with `cwd` as its working directory and waits for it to
/// finish, capturing its output.
pub fn run(command: &str, cwd: &Path) -> Result<Exec, Error> {
    let argv = split_command(command)?;
    let (program, args) = argv.split_first().ok_or(Error::Empty)?;

    log::trace!("spawning {:?} in {}", argv, cwd.display());
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| Error::Spawn {
            command: command.to_owned(),
            err,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(Exec {
        output: combined,
        status: classify(&output.status),
    })
}

#[cfg(unix)]
fn classify(status: &std::process::ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitKind::Code(code),
        None => ExitKind::Signal(status.signal().unwrap_or(0)),
    }
}

#[cfg(not(unix))]
fn classify(status: &std::process::ExitStatus) -> ExitKind {
    ExitKind::Code(status.code().unwrap_or(-1))
}
