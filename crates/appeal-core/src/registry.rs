//! The callable registry.
//!
//! Replaces runtime introspection: the front end registers every callable
//! (commands, nested converters, option handlers) with an explicit
//! [`Signature`] and an implementation, and gets back a [`CallableId`].
//! All lookups downstream are O(1) by id.
//!
//! Each entry also owns the per-callable metadata tables the compiler
//! consumes: the normalized option table, the parameter-name →
//! option-alias table, and the positional usage-name overrides.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{ConfigError, UsageError};
use crate::options::{OptionEntry, OptionKey};
use crate::signature::{ParamSpec, Signature};
use crate::value::Value;

/// Identifies a registered callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallableId(pub u32);

impl fmt::Display for CallableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn-{}", self.0)
    }
}

/// The converted arguments a callable is invoked with.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: FxHashMap<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: FxHashMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: FxHashMap::default(),
        }
    }
}

/// An ordinary callable body.
pub type NativeFn = Arc<dyn Fn(CallArgs) -> Result<Value, UsageError> + Send + Sync>;

/// Per-parse state of a multi-option: invoked once per occurrence,
/// rendered exactly once afterwards.
pub trait MultiAccumulator: Send {
    /// Called for each occurrence, with that occurrence's converted
    /// arguments.
    fn invoke(&mut self, call: CallArgs) -> Result<(), UsageError>;

    /// Called once after the final occurrence; the returned value becomes
    /// the parameter's value.
    fn render(&mut self) -> Result<Value, UsageError>;
}

/// Builds a fresh accumulator at converter-creation time. Receives the
/// parameter's default, if any.
pub type MultiFactory = Arc<dyn Fn(Option<&Value>) -> Box<dyn MultiAccumulator> + Send + Sync>;

/// How a callable runs.
#[derive(Clone)]
pub enum CallableImpl {
    /// Invoke once with all converted arguments.
    Native(NativeFn),
    /// A multi-option: one `invoke` per occurrence, one `render` at the
    /// end.
    Multi(MultiFactory),
}

impl fmt::Debug for CallableImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallableImpl::Native(_) => write!(f, "Native(..)"),
            CallableImpl::Multi(_) => write!(f, "Multi(..)"),
        }
    }
}

/// One registered callable with its metadata tables.
#[derive(Debug, Clone)]
pub struct CallableEntry {
    pub id: CallableId,
    pub name: String,
    pub signature: Signature,
    pub imp: CallableImpl,

    /// Normalized option key → name of the parameter it fills. Used to
    /// detect collisions before deriving default options.
    pub options: FxHashMap<OptionKey, String>,

    /// Parameter name → ordered alias entries.
    pub kw_parameters: FxHashMap<String, Vec<OptionEntry>>,

    /// Positional parameter name → usage-name override.
    pub positionals: FxHashMap<String, String>,

    /// Opted out of nested sub-mapping reads in mapping mode.
    pub unnested: bool,
}

impl CallableEntry {
    /// Is this a multi-option callable?
    pub fn is_multi(&self) -> bool {
        matches!(self.imp, CallableImpl::Multi(_))
    }

    /// The usage name for a positional parameter, honoring overrides.
    pub fn usage_name<'a>(&'a self, parameter_name: &'a str) -> &'a str {
        self.positionals
            .get(parameter_name)
            .map(String::as_str)
            .unwrap_or(parameter_name)
    }
}

/// Central storage for all registered callables.
#[derive(Debug, Default, Clone)]
pub struct CallableRegistry {
    entries: Vec<CallableEntry>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable; the returned id is stable for the registry's
    /// lifetime.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        imp: CallableImpl,
    ) -> CallableId {
        let id = CallableId(self.entries.len() as u32);
        self.entries.push(CallableEntry {
            id,
            name: name.into(),
            signature,
            imp,
            options: FxHashMap::default(),
            kw_parameters: FxHashMap::default(),
            positionals: FxHashMap::default(),
            unnested: false,
        });
        id
    }

    pub fn get(&self, id: CallableId) -> Result<&CallableEntry, ConfigError> {
        self.entries
            .get(id.0 as usize)
            .ok_or(ConfigError::UnknownCallable { id: id.0 })
    }

    pub fn get_mut(&mut self, id: CallableId) -> Result<&mut CallableEntry, ConfigError> {
        self.entries
            .get_mut(id.0 as usize)
            .ok_or(ConfigError::UnknownCallable { id: id.0 })
    }

    /// Map an option alias onto a keyword-only parameter of `callable`.
    ///
    /// `param` describes the alias's own sub-signature slot; aliases for
    /// the same parameter name may carry different annotations.
    pub fn add_option(
        &mut self,
        callable: CallableId,
        parameter_name: &str,
        option: OptionKey,
        param: ParamSpec,
    ) -> Result<(), ConfigError> {
        let entry = self.get_mut(callable)?;
        entry
            .options
            .insert(option.clone(), parameter_name.to_string());
        entry
            .kw_parameters
            .entry(parameter_name.to_string())
            .or_default()
            .push(OptionEntry { option, param });
        Ok(())
    }

    /// Is `option` already mapped on `callable`?
    pub fn has_option(&self, callable: CallableId, option: &OptionKey) -> bool {
        self.get(callable)
            .map(|entry| entry.options.contains_key(option))
            .unwrap_or(false)
    }

    /// Override the usage name of a positional parameter.
    pub fn set_positional_usage(
        &mut self,
        callable: CallableId,
        parameter_name: &str,
        usage_name: impl Into<String>,
    ) -> Result<(), ConfigError> {
        self.get_mut(callable)?
            .positionals
            .insert(parameter_name.to_string(), usage_name.into());
        Ok(())
    }

    /// Opt a callable out of nested sub-mapping reads in mapping mode.
    pub fn set_unnested(&mut self, callable: CallableId) -> Result<(), ConfigError> {
        self.get_mut(callable)?.unnested = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
