//! qi-make: a build engine for C/C++ where the build rules live inside the
//! sources they build.
//!
//! The first positional argument is a verb. The project-file verbs (`init`,
//! `add`, `delete`, `list`) and config verbs (`set`, `unset`) are handled
//! here; `scan` and `parse` expose the engine's intermediate stages;
//! anything else names an action to build across the selected sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::exit;

use structopt::clap::AppSettings;
use structopt::StructOpt;

mod builder;
mod config;
mod error;
mod eval;
mod executor;
mod functions;
mod parser;
mod paths;
mod project;
mod resolver;
mod scanner;
mod scheduler;

use builder::{Builder, Options, UserFunction};
use error::BuildError;
use project::{Project, PROJECT_FILE};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "qi-make",
    about = "A link-smart build engine for C/C++",
    setting = AppSettings::DisableVersion
)]
struct Opt {
    /// number of threads to execute external commands; 0 means one per CPU
    #[structopt(short, long, default_value = "1")]
    jobs: usize,

    /// don't run commands; just print them
    #[structopt(short = "n", long)]
    just_print: bool,

    /// don't stop on errors; keep going
    #[structopt(short, long)]
    keep_going: bool,

    /// rebuild actions even if they are up to date
    #[structopt(short, long)]
    force: bool,

    /// don't echo commands when executing them
    #[structopt(short, long)]
    silent: bool,

    /// print a summary of actions that failed
    #[structopt(short = "S", long)]
    summary: bool,

    /// process all specified source files even if they are not registered
    #[structopt(short, long)]
    all: bool,

    /// print version information
    #[structopt(short = "V", long = "version")]
    print_version: bool,

    /// print detailed information about what is being done
    #[structopt(short, long)]
    verbose: bool,

    /// action to perform, followed by source files or directories
    args: Vec<String>,
}

fn main() {
    let opt = Opt::from_args();
    let level = if opt.verbose { "debug" } else { "warn" };
    let _logger = flexi_logger::Logger::try_with_env_or_str(level).and_then(|l| l.start());
    exit(run(opt));
}

fn run(opt: Opt) -> i32 {
    if opt.print_version {
        println!("qi-make: a link-smart build engine for C/C++");
        println!("version {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(_) => {
            eprintln!("Error: cannot determine the current directory.");
            return 1;
        }
    };

    // A directory argument selects the working directory; a file argument
    // its parent.
    let mut work_dir = cwd.clone();
    if opt.args.len() >= 2 {
        let source = absolute(&cwd, &opt.args[1]);
        if source.is_dir() {
            work_dir = source;
        } else if let Some(parent) = source.parent() {
            work_dir = parent.to_path_buf();
        }
    }

    if opt.args.first().map(String::as_str) == Some("init") {
        return match Project::init(&work_dir) {
            Ok(()) => 0,
            Err(err) => report(&err, 1),
        };
    }

    let root = match Project::find_root(&work_dir) {
        Some(root) => root.canonicalize().unwrap_or(root),
        None => {
            eprintln!(
                "Error: the default project file '{}' is not found.",
                PROJECT_FILE
            );
            return 1;
        }
    };
    let work_name = paths::standard_name(&root, &work_dir);

    let mut project = match Project::load(&root) {
        Ok(project) => project,
        Err(err) => return report(&err, 1),
    };

    match opt.args.first().map(String::as_str) {
        Some("set") | Some("unset") => return run_set_unset(&root, &opt.args),
        Some("add") | Some("delete") => {
            return run_add_delete(&root, &cwd, &mut project, &opt.args)
        }
        Some("list") => return run_list(&root, &cwd, &work_name, &project, &opt.args),
        _ => {}
    }

    let config = match config::read(&root) {
        Ok(config) => config,
        Err(err) => return report(&err, 1),
    };

    let options = Options {
        jobs: if opt.jobs == 0 {
            num_cpus::get()
        } else {
            opt.jobs
        },
        just_print: opt.just_print,
        keep_going: opt.keep_going,
        force: opt.force,
        silent: opt.silent,
        summary: opt.summary,
        all: opt.all,
        verbose: opt.verbose,
    };

    let mut user_functions: HashMap<String, UserFunction> = HashMap::new();
    for (name, template) in &project.function_templates {
        user_functions.insert(name.clone(), UserFunction::Template(template.clone()));
    }

    let mut builder = match Builder::new(
        root.clone(),
        project.sources.clone(),
        project.init_code.clone(),
        project.final_code.clone(),
        user_functions,
        config,
        options,
    ) {
        Ok(builder) => builder,
        Err(err) => return report(&err, 1),
    };

    match run_build(&mut builder, &root, &cwd, &work_name, &opt.args) {
        Ok(code) => code,
        Err(err) => report(&err, 2),
    }
}

fn run_build(
    builder: &mut Builder,
    root: &Path,
    cwd: &Path,
    work_name: &str,
    args: &[String],
) -> error::Result<i32> {
    let sources: Vec<String> = if args.len() <= 1 {
        let selected: Vec<String> = builder
            .source_headers
            .keys()
            .filter(|source| source.starts_with(work_name))
            .cloned()
            .collect();
        if selected.is_empty() {
            eprintln!("Error: no registered source files under '{}'.", work_name);
            return Ok(1);
        }
        selected
    } else {
        let mut selected = Vec::new();
        for arg in &args[1..] {
            let full = absolute(cwd, arg);
            let name = paths::standard_name(root, &full);
            if full.is_file() {
                if !builder.source_headers.contains_key(&name) && !builder.options.all {
                    eprintln!("Error: '{}' has not been registered.", name);
                    return Ok(1);
                }
                if !selected.contains(&name) {
                    selected.push(name);
                }
                continue;
            }
            if full.is_dir() {
                for source in builder.source_headers.keys() {
                    if source.starts_with(&name) && !selected.contains(source) {
                        selected.push(source.clone());
                    }
                }
            }
        }
        selected
    };

    if sources.is_empty() {
        eprintln!("Error: no valid source file specified.");
        return Ok(1);
    }

    let verb = args.first().map(String::as_str);
    let mut layers = Vec::new();
    let mut action_defined = false;

    for source in &sources {
        match verb {
            Some("scan") => {
                action_defined = true;
                builder.parse(source, true)?;
            }
            Some("parse") => {
                action_defined = true;
                let actions = builder.parse(source, false)?;
                println!("{} {}{}", "*".repeat(30), source, "*".repeat(30));
                for action in actions {
                    builder.inspect(&action, source, &mut layers, true)?;
                }
            }
            Some(action) => {
                if args.len() == 1 {
                    // Sources were collected from the working directory;
                    // only build the action where it is defined.
                    let actions = builder.parse(source, false)?;
                    if actions.iter().any(|a| a == action) {
                        action_defined = true;
                        builder.inspect(action, source, &mut layers, false)?;
                    }
                } else {
                    action_defined = true;
                    builder.inspect(action, source, &mut layers, false)?;
                }
            }
            None => {
                // No action specified: build the first action each source
                // defines.
                action_defined = true;
                let actions = builder.parse(source, false)?;
                if let Some(first) = actions.first() {
                    let first = first.clone();
                    builder.inspect(&first, source, &mut layers, false)?;
                }
            }
        }
    }

    if !action_defined {
        eprintln!(
            "Error: the action '{}' is not defined.",
            verb.unwrap_or("")
        );
        return Ok(2);
    }

    if layers.is_empty() {
        return Ok(0);
    }
    let outcome = builder.update(&layers)?;
    if outcome.interrupted {
        return Ok(2);
    }
    if outcome.failures > 0 {
        return Ok(3);
    }
    Ok(0)
}

fn run_set_unset(root: &Path, args: &[String]) -> i32 {
    let mut table = match config::read(root) {
        Ok(table) => table,
        Err(err) => return report(&err, 1),
    };
    let is_set = args[0] == "set";

    match args.len() {
        1 => {
            for (key, value) in &table {
                println!("{} = {}", key, value);
            }
            0
        }
        2 => {
            if is_set {
                table.insert(args[1].clone(), String::new());
                println!("{} = ", args[1]);
            } else {
                table.remove(&args[1]);
            }
            write_config(root, &table)
        }
        _ => {
            if is_set {
                println!("{} = {}", args[1], args[2]);
                table.insert(args[1].clone(), args[2].clone());
            } else {
                for name in &args[1..] {
                    table.remove(name);
                }
            }
            write_config(root, &table)
        }
    }
}

fn write_config(root: &Path, table: &config::ConfigTable) -> i32 {
    match config::write(root, table) {
        Ok(()) => 0,
        Err(err) => report(&err, 1),
    }
}

fn run_add_delete(root: &Path, cwd: &Path, project: &mut Project, args: &[String]) -> i32 {
    if args.len() < 2 {
        eprintln!("Error: a source file must be specified.");
        return 1;
    }
    let source_path = absolute(cwd, &args[1]);
    let source = paths::standard_name(root, &source_path);
    let header = args.get(2).map(|arg| {
        let path = absolute(cwd, arg);
        (paths::standard_name(root, &path), path)
    });

    if args[0] == "add" {
        if std::fs::File::open(&source_path).is_err() {
            eprintln!(
                "Error: the specified source file '{}' cannot be opened.",
                source
            );
            return 1;
        }
        if let Some((header_name, header_path)) = &header {
            if std::fs::File::open(header_path).is_err() {
                eprintln!(
                    "Error: the specified header file '{}' cannot be opened.",
                    header_name
                );
                return 1;
            }
        }
        project.add_source(source, header.map(|(name, _)| name));
    } else if !project.remove_source(&source, header.as_ref().map(|(name, _)| name.as_str())) {
        eprintln!(
            "Error: no source file named '{}' in the default project file '{}'.",
            source, PROJECT_FILE
        );
        return 1;
    }

    match project.save(root) {
        Ok(()) => 0,
        Err(err) => report(&err, 1),
    }
}

fn run_list(root: &Path, cwd: &Path, work_name: &str, project: &Project, args: &[String]) -> i32 {
    let prefix = match args.get(1) {
        Some(arg) => paths::standard_name(root, &absolute(cwd, arg)),
        None => work_name.to_owned(),
    };
    for (source, headers) in &project.sources {
        if source.starts_with(&prefix) {
            println!("{}: {}", source, headers.join(" "));
        }
    }
    0
}

fn absolute(cwd: &Path, arg: &str) -> PathBuf {
    let path = Path::new(arg);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn report(err: &BuildError, code: i32) -> i32 {
    match err.origin() {
        Some(origin) => eprintln!("Error at {}: {}", origin, err),
        None => eprintln!("Error: {}", err),
    }
    code
}
