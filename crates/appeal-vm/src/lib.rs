//! The Charm interpreter.
//!
//! A register/stack virtual machine that executes assembled Charm
//! programs against a token stream and/or a mapping. Its side effects are
//! the construction of a tree of converter instances and the assignment
//! of argument strings into their positional and keyword slots; once a
//! run finishes, [`ConverterArena::convert`] and
//! [`ConverterArena::execute`] evaluate the tree bottom-up, invoking the
//! registered callables.
//!
//! One [`Machine`] owns all mutable state for one parse. Programs are
//! immutable and shared; any number of machines may execute the same
//! program concurrently.

mod converter;
mod machine;
mod options;
mod tokens;

pub use converter::{Converter, ConverterArena, ConverterIx, Slot};
pub use machine::Machine;
pub use options::{MappedOption, OptionScopes, ScopeToken};
pub use tokens::TokenStream;
