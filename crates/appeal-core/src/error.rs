//! Unified error types for Appeal.
//!
//! Three kinds of failure can come out of the core:
//!
//! ```text
//! AppealError (top-level wrapper)
//! ├── UsageError    - invalid command-line input (the end user's fault)
//! ├── ConfigError   - API misuse detected at registration or compile time
//! └── InternalError - a bug in the core itself
//! ```
//!
//! The core never catches any of these. A front end is expected to catch
//! [`UsageError`] to render help, and let the others propagate.

use thiserror::Error;

/// Errors raised while parsing a command line (or a mapping).
///
/// These are user-facing: the message names the offending option or value
/// and, for group errors, the exact argument counts needed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UsageError {
    /// An option token that is mapped nowhere.
    #[error("unknown option {option}")]
    UnknownOption {
        /// Denormalized option spelling (`-x` or `--xyz`).
        option: String,
    },

    /// An option that exists but is not in scope here.
    #[error("{option} can't be used here, it must be used immediately after {parents}")]
    OptionOutOfScope {
        /// Denormalized option spelling.
        option: String,
        /// Denormalized spellings of the options that map it in.
        parents: String,
    },

    /// A single-use option was given twice.
    #[error("{option} specified more than once")]
    OptionRepeated {
        /// Denormalized option spelling.
        option: String,
    },

    /// `--opt=value` where `--opt` consumes no opargs.
    #[error("{option}={value} isn't allowed, because {option} doesn't take an argument")]
    OptionTakesNoArgument { option: String, value: String },

    /// `--opt=value` where `--opt` consumes two or more opargs.
    #[error("{option}={value} isn't allowed, because {option} takes multiple arguments")]
    OptionTakesMultipleArguments { option: String, value: String },

    /// A short option that consumes opargs appeared mid-cluster.
    #[error("-{option}{remainder} isn't allowed, -{option} takes {arguments}, it must be last")]
    OptionMustBeLast {
        option: char,
        remainder: String,
        /// Rendered count, e.g. `1 argument` or `1 to 3 arguments`.
        arguments: String,
    },

    /// The current argument group ended short of its minimum.
    #[error("{program} requires {arguments} in this argument group")]
    GroupNotSatisfied {
        /// Name of the program whose group went unsatisfied.
        program: String,
        /// Rendered count, e.g. `2 arguments` or
        /// `at least 1 argument but no more than 3 arguments`.
        arguments: String,
    },

    /// A leaf string did not parse as the annotated scalar type.
    #[error("invalid value {value:?} for {name}, must be {expected}")]
    InvalidValue {
        value: String,
        /// Parameter (usage) name the value was bound to.
        name: String,
        /// Target type name (`int`, `float`, ...).
        expected: &'static str,
    },

    /// A required key was absent in mapping mode.
    #[error("{name} is required but was not set in the mapping")]
    MissingKey { name: String },

    /// A token was left over after the root program finished.
    #[error("unexpected extra argument {argument:?}")]
    ExtraArgument { argument: String },

    /// Free-form usage error from a converter callable or validator.
    #[error("{0}")]
    Other(String),
}

impl UsageError {
    /// Build an [`UsageError::Other`] from anything displayable.
    pub fn other(message: impl Into<String>) -> Self {
        UsageError::Other(message.into())
    }
}

/// Errors raised when the API user misconfigures a grammar.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A keyword-only parameter must carry a default.
    #[error("{callable}: keyword-only parameter {name:?} doesn't have a default value")]
    KeywordOnlyWithoutDefault { callable: String, name: String },

    /// The same option was mapped twice in one argument group with no
    /// intervening positional consumption.
    #[error("multiple definitions of option {option} are ambiguous (no command-line arguments between definitions)")]
    AmbiguousDuplicateOption { option: String },

    /// A required parameter can never be reached past a var-positional one.
    #[error(
        "this command line can never be satisfied: {name:?} is required, \
         but it comes after var-positional parameter {var_positional:?} \
         which already consumed all remaining arguments"
    )]
    RequiredAfterVarPositional { name: String, var_positional: String },

    /// Options target `**kwargs`, but the callable accepts none.
    #[error("{callable}: there are options that must go into **kwargs, but this callable doesn't accept **kwargs: {options}")]
    NoVarKeyword { callable: String, options: String },

    /// An empty list/tuple default gives the sequence factory nothing to
    /// infer element types from.
    #[error("{name}: empty sequence used as default, so element types can't be inferred")]
    EmptySequenceDefault { name: String },

    /// No converter factory accepted the parameter.
    #[error("{callable}: no converter for parameter {name:?}")]
    NoConverter { callable: String, name: String },

    /// An assembler label was defined twice.
    #[error("label defined twice: {label:?}")]
    DuplicateLabel { label: String },

    /// A jump referenced a label that was never defined.
    #[error("unknown label {label:?}")]
    UnknownLabel { label: String },

    /// A referenced callable id is not in the registry.
    #[error("unknown callable id {id}")]
    UnknownCallable { id: u32 },

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ConfigError {
    /// Build a [`ConfigError::Other`] from anything displayable.
    pub fn other(message: impl Into<String>) -> Self {
        ConfigError::Other(message.into())
    }
}

/// A bug inside the core: an invariant the compiler or interpreter relies
/// on did not hold.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("internal error: {message}")]
pub struct InternalError {
    pub message: String,
}

impl InternalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The unified error type for all Appeal operations.
///
/// Each variant uses `#[from]`, so `?` converts phase errors automatically.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppealError {
    /// Invalid command-line input.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// API misuse.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A bug in the core.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl AppealError {
    /// Check if this is a usage error.
    pub fn is_usage(&self) -> bool {
        matches!(self, AppealError::Usage(_))
    }

    /// Check if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, AppealError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_error_display() {
        let err = UsageError::UnknownOption {
            option: "--frob".to_string(),
        };
        assert_eq!(format!("{err}"), "unknown option --frob");
    }

    #[test]
    fn group_error_display() {
        let err = UsageError::GroupNotSatisfied {
            program: "frobnicate".to_string(),
            arguments: "2 arguments".to_string(),
        };
        assert_eq!(
            format!("{err}"),
            "frobnicate requires 2 arguments in this argument group"
        );
    }

    #[test]
    fn appeal_error_from_usage() {
        let err: AppealError = UsageError::other("boom").into();
        assert!(err.is_usage());
        assert!(!err.is_config());
        assert_eq!(format!("{err}"), "boom");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::KeywordOnlyWithoutDefault {
            callable: "frobnicate".to_string(),
            name: "verbose".to_string(),
        };
        assert!(format!("{err}").contains("doesn't have a default value"));
    }
}
