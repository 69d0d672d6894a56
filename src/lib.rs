//! Appeal: a command-line parsing library where the *shape* of the
//! grammar is derived from the *shape* of a callable.
//!
//! You declare callables — a signature plus a body — and register them
//! with an [`Appeal`] instance. Positional parameters become positional
//! arguments, keyword-only parameters become options, callable
//! annotations become nested converters, and defaults make whole
//! subtrees optional. The analyzer works out which parameters are really
//! required, the Charm compiler lowers the grammar to bytecode, and the
//! interpreter drives that bytecode over the command line, building a
//! tree of converters that finally invokes your callables.
//!
//! ```
//! use appeal::{Appeal, CallArgs, Signature, Value};
//!
//! let mut app = Appeal::new();
//! let cmd = app.command(
//!     "greet",
//!     Signature::builder().positional("name").build(),
//!     |call: CallArgs| Ok(Value::str(format!("hello, {}", call.args[0]))),
//! );
//! let value = app.process(cmd, ["world"]).unwrap();
//! assert_eq!(value, Value::str("hello, world"));
//! ```

mod builder;
mod combinators;

pub use builder::Appeal;

pub use appeal_core::{
    Annotation, AppealError, CallArgs, CallableId, CallableImpl, CallableRegistry, Complex,
    ConfigError, ConverterClass, ConverterFactory, FactoryRegistry, InternalError,
    MultiAccumulator, OptionEntry, OptionKey, ParamKind, ParamSpec, ParseFlags, ScalarKind,
    Signature, UsageError, Value,
};

pub use appeal_analysis::{GroupedParameter, ParameterGrouper};
pub use appeal_compiler::{
    ArgTally, CharmProgram, Instruction, compile_command, compile_iterator, compile_mapping,
};
pub use appeal_vm::{ConverterArena, ConverterIx, Machine};
