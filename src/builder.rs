//! The registration surface.
//!
//! In the dynamic original, a grammar was introspected out of live
//! function objects. Here the front end declares everything explicitly:
//! callables with signatures, option aliases, usage-name overrides. The
//! [`Appeal`] struct owns the registries and drives
//! compile-then-interpret-then-evaluate for each parse.

use std::sync::Arc;

use appeal_compiler::{compile_command, compile_iterator, compile_mapping};
use appeal_core::{
    Annotation, AppealError, CallArgs, CallableId, CallableImpl, CallableRegistry, ConfigError,
    ConverterFactory, FactoryRegistry, MultiAccumulator, OptionKey, ParamKind, ParamSpec,
    ParseFlags, Signature, UsageError, Value,
};
use appeal_vm::Machine;

/// The top-level entry point: a callable registry, the converter factory
/// chain, and the parse-semantics flags.
pub struct Appeal {
    registry: CallableRegistry,
    factories: FactoryRegistry,
    flags: ParseFlags,
}

impl Default for Appeal {
    fn default() -> Self {
        Self::new()
    }
}

impl Appeal {
    pub fn new() -> Self {
        Self {
            registry: CallableRegistry::new(),
            factories: FactoryRegistry::with_defaults(),
            flags: ParseFlags::default(),
        }
    }

    /// Replace the parse-semantics flags.
    pub fn parse_flags(&mut self, flags: ParseFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Register a command: a callable that can be the root of a parse.
    pub fn command(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        body: impl Fn(CallArgs) -> Result<Value, UsageError> + Send + Sync + 'static,
    ) -> CallableId {
        self.registry
            .register(name, signature, CallableImpl::Native(Arc::new(body)))
    }

    /// Register a converter callable, usable as an annotation on another
    /// callable's parameter. (Identical to [`Appeal::command`]; the two
    /// names exist because registrations read better when they say what
    /// they're for.)
    pub fn converter(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        body: impl Fn(CallArgs) -> Result<Value, UsageError> + Send + Sync + 'static,
    ) -> CallableId {
        self.command(name, signature, body)
    }

    /// Register a multi-option: invoked once per occurrence on the
    /// command line, rendered once afterwards.
    pub fn multi_option(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        factory: impl Fn(Option<&Value>) -> Box<dyn MultiAccumulator> + Send + Sync + 'static,
    ) -> CallableId {
        self.registry
            .register(name, signature, CallableImpl::Multi(Arc::new(factory)))
    }

    /// Map explicit option spellings onto a keyword-only parameter.
    ///
    /// The alias carries its own annotation and default, so different
    /// aliases of one parameter may run different converters.
    pub fn option(
        &mut self,
        callable: CallableId,
        parameter_name: &str,
        spellings: &[&str],
        annotation: Option<Annotation>,
        default: Value,
    ) -> Result<&mut Self, ConfigError> {
        let param = ParamSpec {
            name: parameter_name.to_string(),
            kind: ParamKind::KeywordOnly,
            annotation,
            default: Some(default),
        };
        for spelling in spellings {
            let key = OptionKey::normalize(spelling);
            self.registry
                .add_option(callable, parameter_name, key, param.clone())?;
        }
        Ok(self)
    }

    /// Override the usage name of a positional parameter.
    pub fn parameter_usage(
        &mut self,
        callable: CallableId,
        parameter_name: &str,
        usage_name: impl Into<String>,
    ) -> Result<&mut Self, ConfigError> {
        self.registry
            .set_positional_usage(callable, parameter_name, usage_name)?;
        Ok(self)
    }

    /// Opt a callable out of nested sub-mapping reads in mapping mode.
    pub fn unnested(&mut self, callable: CallableId) -> Result<&mut Self, ConfigError> {
        self.registry.set_unnested(callable)?;
        Ok(self)
    }

    /// Append a custom converter factory to the chain.
    pub fn factory(&mut self, factory: ConverterFactory) -> &mut Self {
        self.factories.push(factory);
        self
    }

    pub fn registry(&self) -> &CallableRegistry {
        &self.registry
    }

    /// Derive `-x` / `--long-name` options for every keyword-only
    /// parameter that has no explicit aliases. Explicit registrations
    /// always win; derivation never overwrites an existing spelling.
    fn derive_default_options(&mut self) -> Result<(), ConfigError> {
        for i in 0..self.registry.len() {
            let id = CallableId(i as u32);
            let to_add = {
                let entry = self.registry.get(id)?;
                let mut to_add: Vec<(ParamSpec, Vec<OptionKey>)> = Vec::new();
                for p in entry.signature.keyword_only() {
                    if entry.kw_parameters.contains_key(&p.name) {
                        continue;
                    }
                    let candidates = [OptionKey::short_for(&p.name), OptionKey::long_for(&p.name)];
                    let keys: Vec<OptionKey> = candidates
                        .into_iter()
                        .flatten()
                        .filter(|key| !entry.options.contains_key(key))
                        .collect();
                    if keys.is_empty() {
                        return Err(ConfigError::other(format!(
                            "couldn't add any default options for {} parameter {:?}",
                            entry.name, p.name
                        )));
                    }
                    to_add.push((p.clone(), keys));
                }
                to_add
            };
            for (param, keys) in to_add {
                for key in keys {
                    self.registry.add_option(id, &param.name, key, param.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Parse a command line and run the command.
    pub fn process<I, S>(&mut self, command: CallableId, args: I) -> Result<Value, AppealError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.derive_default_options()?;
        let program = compile_command(&self.registry, &self.factories, command)?;
        let mut machine = Machine::new(&self.registry, &self.factories, self.flags, program)
            .with_tokens(args.into_iter().map(Into::into));
        let root = machine.run()?;
        if let Some(extra) = machine.remaining_tokens().into_iter().next() {
            return Err(UsageError::ExtraArgument {
                argument: extra.to_string(),
            }
            .into());
        }
        machine.evaluate(root)
    }

    /// Read the command's arguments out of a mapping and run it.
    pub fn process_mapping(
        &mut self,
        command: CallableId,
        mapping: Value,
    ) -> Result<Value, AppealError> {
        if !matches!(mapping, Value::Map(_)) {
            return Err(ConfigError::other("process_mapping requires a Value::Map").into());
        }
        self.derive_default_options()?;
        let program = compile_mapping(&self.registry, &self.factories, command)?;
        let mut machine = Machine::new(&self.registry, &self.factories, self.flags, program)
            .with_mapping(mapping);
        let root = machine.run()?;
        machine.evaluate(root)
    }

    /// Read the command's arguments out of one flat row of values.
    pub fn process_row(
        &mut self,
        command: CallableId,
        row: Vec<Value>,
    ) -> Result<Value, AppealError> {
        self.derive_default_options()?;
        let program = compile_iterator(&self.registry, &self.factories, command)?;
        let mut machine = Machine::new(&self.registry, &self.factories, self.flags, program)
            .with_values(row);
        let root = machine.run()?;
        if let Some(extra) = machine.remaining_tokens().into_iter().next() {
            return Err(UsageError::ExtraArgument {
                argument: extra.to_string(),
            }
            .into());
        }
        machine.evaluate(root)
    }

    /// Run the command once per row, compiling the row program once.
    pub fn process_rows(
        &mut self,
        command: CallableId,
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<Value>, AppealError> {
        self.derive_default_options()?;
        let program = compile_iterator(&self.registry, &self.factories, command)?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let mut machine =
                Machine::new(&self.registry, &self.factories, self.flags, program.clone())
                    .with_values(row);
            let root = machine.run()?;
            results.push(machine.evaluate(root)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_derive_short_and_long() {
        let mut app = Appeal::new();
        let cmd = app.command(
            "cmd",
            Signature::builder()
                .keyword_only("dry_run", None, Value::Bool(false))
                .build(),
            |_| Ok(Value::Null),
        );
        app.derive_default_options().unwrap();
        let entry = app.registry().get(cmd).unwrap();
        let aliases = &entry.kw_parameters["dry_run"];
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0].option, OptionKey::Short('d'));
        assert_eq!(aliases[1].option, OptionKey::Long("dry-run".to_string()));
    }

    #[test]
    fn explicit_options_suppress_derivation() {
        let mut app = Appeal::new();
        let cmd = app.command(
            "cmd",
            Signature::builder()
                .keyword_only("verbose", None, Value::Bool(false))
                .build(),
            |_| Ok(Value::Null),
        );
        app.option(cmd, "verbose", &["-V"], None, Value::Bool(false))
            .unwrap();
        app.derive_default_options().unwrap();
        let entry = app.registry().get(cmd).unwrap();
        assert_eq!(entry.kw_parameters["verbose"].len(), 1);
        assert_eq!(
            entry.kw_parameters["verbose"][0].option,
            OptionKey::Short('V')
        );
    }

    #[test]
    fn derivation_is_idempotent() {
        let mut app = Appeal::new();
        let cmd = app.command(
            "cmd",
            Signature::builder()
                .keyword_only("count", None, Value::Int(0))
                .build(),
            |_| Ok(Value::Null),
        );
        app.derive_default_options().unwrap();
        app.derive_default_options().unwrap();
        let entry = app.registry().get(cmd).unwrap();
        assert_eq!(entry.kw_parameters["count"].len(), 2);
    }
}
