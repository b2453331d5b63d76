//! Parallel command execution.
//!
//! The coordinator walks the schedule layer by layer. For every action in a
//! layer it first folds the assignment commands of the action's closure
//! into a private symbol scope, then hands the action to the worker pool
//! over a flume queue; a per-layer reply channel is the barrier that keeps
//! layer *i+1* from starting before layer *i* has drained.
//!
//! Workers share nothing mutable beyond the queue, the output lock and the
//! termination flag. After a failure without `--keep-going`, and always
//! after a child killed by SIGINT, the pool drains the remaining tasks
//! without running them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use qi_lang::AssignOp;
use qi_make_graph::{CommandKind, NodeId};
use qi_make_process::{self as process, ExitKind};

use crate::builder::{Builder, SymbolTable};
use crate::error::Result;

/// What an `update` run observed across all layers.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub failures: usize,
    pub interrupted: bool,
}

struct Task {
    action: NodeId,
    symbols: SymbolTable,
    reply: flume::Sender<(NodeId, TaskOutcome)>,
}

enum TaskOutcome {
    Completed { failed: bool },
    Skipped,
}

struct ExecState {
    terminating: AtomicBool,
    interrupted: AtomicBool,
    output: Mutex<()>,
}

impl Builder {
    /// Runs the scheduled layers and reports the number of failed actions.
    pub fn update(&mut self, layers: &[Vec<NodeId>]) -> Result<UpdateOutcome> {
        let jobs = self.options.jobs.max(1);
        let state = ExecState {
            terminating: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            output: Mutex::new(()),
        };

        let this: &Builder = &*self;
        let outcomes = thread::scope(|scope| -> Result<Vec<(NodeId, TaskOutcome)>> {
            let (tx, rx) = flume::unbounded::<Task>();
            for worker_id in 0..jobs {
                let rx = rx.clone();
                let state = &state;
                scope.spawn(move || worker_loop(this, state, worker_id, jobs, rx));
            }
            drop(rx);

            let mut outcomes = Vec::new();
            for layer in layers {
                let (reply_tx, reply_rx) = flume::unbounded();
                for &action in layer {
                    let mut symbols = SymbolTable::new();
                    for node in this.graph.dfs(action, false)? {
                        apply_assignments(this, node, &mut symbols)?;
                    }
                    let _ = tx.send(Task {
                        action,
                        symbols,
                        reply: reply_tx.clone(),
                    });
                }
                drop(reply_tx);
                // The layer barrier: every task of this layer replies before
                // the next layer is released.
                outcomes.extend(reply_rx.iter());
            }
            Ok(outcomes)
        })?;

        let mut failed: Vec<NodeId> = Vec::new();
        for (action, outcome) in outcomes {
            if let TaskOutcome::Completed { failed: true } = outcome {
                self.action_mut(action).has_failed = true;
                failed.push(action);
            }
        }
        let failures = failed.len();

        if self.options.summary {
            if failures > 0 {
                println!("Failed to update the following {} actions:", failures);
                let mut by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for &id in &failed {
                    if let Some((action, source)) =
                        qi_lang::split_action_sources(self.node_name(id))
                    {
                        by_source
                            .entry(source.to_owned())
                            .or_default()
                            .push(action.to_owned());
                    }
                }
                for (source, actions) in by_source {
                    println!("{}: {}", source, actions.join(" "));
                }
            } else {
                println!("No failed actions.");
            }
        } else if failures > 0 {
            println!("Failed to update {} action(s).", failures);
        }

        Ok(UpdateOutcome {
            failures,
            interrupted: state.interrupted.load(Ordering::SeqCst),
        })
    }
}

/// Folds the assignment commands of one action into `symbols`, giving the
/// executed commands their scope. Runs on the coordinator, in closure
/// post-order, so a parent's own assignments land last.
fn apply_assignments(builder: &Builder, id: NodeId, symbols: &mut SymbolTable) -> Result<()> {
    for command in &builder.action(id).commands {
        if let CommandKind::Assignment { var, op, rhs } = &command.kind {
            let value = builder.translate_exec(rhs, symbols, &command.origin)?;
            match op {
                AssignOp::Set => {
                    symbols.insert(var.clone(), value);
                }
                AssignOp::Append | AssignOp::Defer => match symbols.get_mut(var) {
                    Some(existing) => {
                        existing.push(' ');
                        existing.push_str(&value);
                    }
                    None => {
                        symbols.insert(var.clone(), value);
                    }
                },
            }
        }
    }
    Ok(())
}

fn worker_loop(
    builder: &Builder,
    state: &ExecState,
    worker: usize,
    jobs: usize,
    rx: flume::Receiver<Task>,
) {
    while let Ok(task) = rx.recv() {
        if state.terminating.load(Ordering::SeqCst) {
            let _ = task.reply.send((task.action, TaskOutcome::Skipped));
            continue;
        }

        let mut symbols = task.symbols;
        let failed = match run_action(builder, state, worker, jobs, task.action, &mut symbols) {
            Ok(status) if status.success() => false,
            Ok(status) => {
                let message = match status {
                    ExitKind::Signal(signal) => {
                        format!("command was terminated by signal {}", signal)
                    }
                    ExitKind::Code(code) => format!("command execution returned {}", code),
                };
                report_error(state, &message);
                if status == ExitKind::Signal(2) {
                    state.interrupted.store(true, Ordering::SeqCst);
                    state.terminating.store(true, Ordering::SeqCst);
                } else if !builder.options.keep_going {
                    state.terminating.store(true, Ordering::SeqCst);
                }
                true
            }
            Err(err) => {
                let message = match err.origin() {
                    Some(origin) => format!("{} ({})", err, origin),
                    None => err.to_string(),
                };
                report_error(state, &message);
                if !builder.options.keep_going {
                    state.terminating.store(true, Ordering::SeqCst);
                }
                true
            }
        };
        let _ = task.reply.send((task.action, TaskOutcome::Completed { failed }));
    }
}

/// Executes one action's function-call and external commands in order.
/// Stops at the first non-zero exit and returns it.
fn run_action(
    builder: &Builder,
    state: &ExecState,
    worker: usize,
    jobs: usize,
    action: NodeId,
    symbols: &mut SymbolTable,
) -> Result<ExitKind> {
    let node = builder.action(action);
    for command in &node.commands {
        match &command.kind {
            CommandKind::Assignment { .. } => {}
            CommandKind::FunctionCall { name, args } => {
                let args = builder.translate_exec(args, symbols, &command.origin)?;
                builder.call_function_exec(name, &args, symbols, &command.origin)?;
            }
            CommandKind::External(text) => {
                let expanded = builder.translate_exec(text, symbols, &command.origin)?;
                if expanded.is_empty() {
                    continue;
                }
                let (echo, command_line) = match expanded.strip_prefix('@') {
                    Some(rest) => (false, rest.to_owned()),
                    None => (true, expanded),
                };

                let (output, status) = if builder.options.just_print {
                    (String::new(), ExitKind::Code(0))
                } else {
                    let exec = process::run(&command_line, &builder.root)?;
                    (exec.output.trim_end().to_owned(), exec.status)
                };

                emit(builder, state, worker, jobs, echo, &command_line, &output);
                log::debug!(
                    "worker {} ran a command of {}: {:?}",
                    worker,
                    builder.node_name(action),
                    status
                );
                if !status.success() {
                    return Ok(status);
                }
            }
        }
    }
    Ok(ExitKind::Code(0))
}

/// Prints one echo + output pair. With more than one worker the pair is
/// atomic under the output lock and tagged with the worker id.
fn emit(
    builder: &Builder,
    state: &ExecState,
    worker: usize,
    jobs: usize,
    echo: bool,
    command: &str,
    output: &str,
) {
    if builder.options.silent {
        return;
    }
    if jobs == 1 {
        if echo {
            println!("{}", command);
        }
        if !output.is_empty() {
            println!("{}", output);
        }
    } else {
        let _guard = state
            .output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if echo {
            println!("[{}] {}", worker, command);
        }
        if !output.is_empty() {
            println!("{}", output);
        }
    }
}

fn report_error(state: &ExecState, message: &str) {
    let _guard = state
        .output
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    println!("Error: {}.", message);
}
