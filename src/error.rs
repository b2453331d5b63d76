use qi_lang::Origin;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Everything that can go wrong between reading a project file and the last
/// external command. Variants that arise from a directive line carry the
/// line's origin so the front-end can report `Error at file:line: …`.
#[derive(Debug, Error)]
pub enum BuildError {
    // Configuration errors.
    #[error("failed to open or read file '{0}'")]
    UnreadableFile(String),

    #[error("the file or directory '{0}' doesn't exist")]
    MissingFile(String),

    #[error("unable to parse the configuration file '{0}'")]
    MalformedConfig(String),

    #[error("failed to open or write to the configuration file '{0}'")]
    ConfigWrite(String),

    #[error("'{0}' and '{1}' share the same base name")]
    DuplicateBaseName(String, String),

    #[error("the default project file '{0}' already exists")]
    ProjectExists(String),

    #[error("unable to open or read the default project file '{0}'")]
    ProjectRead(String),

    #[error("failed to open or write to the default project file '{0}'")]
    ProjectWrite(String),

    #[error("can't locate the section containing source files")]
    MissingSourceSection { origin: Origin },

    #[error("invalid user-defined function definition: '{line}'")]
    BadFunctionDefinition { line: String, origin: Origin },

    // Parse errors.
    #[error("'else' without corresponding 'if'")]
    DanglingElse { origin: Origin },

    #[error("'endif' without corresponding 'if'")]
    DanglingEndif { origin: Origin },

    #[error("'if' without corresponding 'endif'")]
    UnterminatedIf { origin: Origin },

    #[error("indentation is not allowed when specifying rules")]
    IndentedRule { origin: Origin },

    #[error("'{name}' is a reserved action name")]
    ReservedAction { name: String, origin: Origin },

    #[error("action '{name}' is already defined and assigned a different target name")]
    TargetMismatch { name: String, origin: Origin },

    #[error("indentation has changed from previous lines")]
    IndentationChanged { origin: Origin },

    #[error("a variable that exists in the source scope cannot be reassigned in a rule")]
    RuleScopeReassignment { origin: Origin },

    #[error("syntax error: '{line}'")]
    Syntax { line: String, origin: Origin },

    // Evaluation errors.
    #[error("unclosed left parenthesis")]
    UnclosedParen { origin: Origin },

    #[error("variable '{name}' has not been defined")]
    UndefinedVariable { name: String, origin: Origin },

    #[error("function '{name}' is not implemented")]
    UnknownFunction { name: String, origin: Origin },

    #[error("invalid regular expression '{pattern}': {err}")]
    BadRegex {
        pattern: String,
        #[source]
        err: regex::Error,
        origin: Origin,
    },

    #[error("'{text}' can't be evaluated")]
    NotEvaluable { text: String, origin: Origin },

    #[error("error when calling the user-defined function '{name}': {message}")]
    UserFunction {
        name: String,
        message: String,
        origin: Origin,
    },

    #[error("'{name}' has not been scanned")]
    NotScanned { name: String, origin: Origin },

    // Graph errors.
    #[error(transparent)]
    Graph(#[from] qi_make_graph::Error),

    #[error("a file node named '{0}' cannot be found")]
    UnknownFileNode(String),

    #[error("there is no action named '{action}' within '{source_file}'")]
    UnknownAction { action: String, source_file: String },

    #[error("'{0}' is expected to be a file, not an action")]
    ExpectedFile(String),

    #[error("'{0}' is expected to be an action, not a file")]
    ExpectedAction(String),

    #[error("file '{0}' has not been parsed")]
    NotParsed(String),

    // Execution errors.
    #[error(transparent)]
    Process(#[from] qi_make_process::Error),
}

impl BuildError {
    /// The directive line the error is pinned to, when there is one.
    pub fn origin(&self) -> Option<&Origin> {
        use BuildError::*;
        match self {
            MissingSourceSection { origin }
            | BadFunctionDefinition { origin, .. }
            | DanglingElse { origin }
            | DanglingEndif { origin }
            | UnterminatedIf { origin }
            | IndentedRule { origin }
            | ReservedAction { origin, .. }
            | TargetMismatch { origin, .. }
            | IndentationChanged { origin }
            | RuleScopeReassignment { origin }
            | Syntax { origin, .. }
            | UnclosedParen { origin }
            | UndefinedVariable { origin, .. }
            | UnknownFunction { origin, .. }
            | BadRegex { origin, .. }
            | NotEvaluable { origin, .. }
            | UserFunction { origin, .. }
            | NotScanned { origin, .. } => Some(origin),
            _ => None,
        }
    }
}
