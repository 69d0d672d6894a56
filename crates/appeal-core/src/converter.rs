//! Converter classes and the factory chain that picks them.
//!
//! A converter class describes *how* one parameter's value gets built:
//! from a single string, by inverting a flag, by calling a registered
//! callable, or by consuming one string per element of a sequence
//! default. Classes are chosen by consulting an ordered list of
//! factories; the first factory to claim a parameter wins.
//!
//! Factories are pure: they never touch I/O and never mutate the
//! parameter they inspect.

use crate::error::ConfigError;
use crate::registry::{CallableId, CallableRegistry};
use crate::signature::{Annotation, ParamKind, ParamSpec, ScalarKind, Signature};
use crate::value::Value;

/// How a parameter's value is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ConverterClass {
    /// One string, converted to one scalar.
    Simple(ScalarKind),
    /// A keyword-only `bool`: each occurrence inverts the default and
    /// consumes nothing.
    Flag,
    /// A registered callable that runs once.
    Single(CallableId),
    /// A registered multi-option: runs once per occurrence, renders once.
    Multi(CallableId),
    /// A list/tuple default: one argument per element, each converted to
    /// the element's inferred type. Pairs are (usage name, kind).
    Sequence(Vec<(String, ScalarKind)>),
}

impl ConverterClass {
    /// Does this class build an actual converter subtree (as opposed to a
    /// leaf that swallows at most one string)?
    pub fn is_leaf(&self) -> bool {
        matches!(self, ConverterClass::Simple(_) | ConverterClass::Flag)
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, ConverterClass::Multi(_))
    }
}

/// The signature a converter class presents to the analyzer and compiler.
///
/// Scalar leaves look like a one-parameter function (`int(int)`) whose
/// single parameter is *unannotated* — that parameter resolves to the
/// plain string converter, which is what terminates recursion over the
/// annotation tree. Flags take nothing; callables present their
/// registered signature; sequences present one generated positional per
/// element.
pub fn converter_signature(
    class: &ConverterClass,
    registry: &CallableRegistry,
) -> Result<Signature, ConfigError> {
    match class {
        ConverterClass::Simple(kind) => Ok(Signature::new(vec![ParamSpec::new(
            kind.type_name(),
            ParamKind::PositionalOnly,
        )])),
        ConverterClass::Flag => Ok(Signature::default()),
        ConverterClass::Single(id) | ConverterClass::Multi(id) => {
            Ok(registry.get(*id)?.signature.clone())
        }
        ConverterClass::Sequence(elements) => Ok(Signature::new(
            elements
                .iter()
                .map(|(name, kind)| {
                    ParamSpec::new(name.clone(), ParamKind::PositionalOnly)
                        .with_annotation(Annotation::Scalar(*kind))
                })
                .collect(),
        )),
    }
}

/// One factory: claims a parameter by returning `Some(class)`.
pub type ConverterFactory =
    fn(&ParamSpec, &CallableRegistry) -> Result<Option<ConverterClass>, ConfigError>;

/// The ordered factory list.
#[derive(Debug, Clone)]
pub struct FactoryRegistry {
    factories: Vec<ConverterFactory>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FactoryRegistry {
    /// The built-in chain, in consultation order: unannotated,
    /// scalar-annotated, callable-annotated, value-inferred,
    /// sequence-inferred.
    pub fn with_defaults() -> Self {
        Self {
            factories: vec![
                unannotated_to_converter,
                scalar_to_converter,
                callable_to_converter,
                inferred_type_to_converter,
                sequence_to_converter,
            ],
        }
    }

    /// Append a custom factory; it is consulted after the built-ins.
    pub fn push(&mut self, factory: ConverterFactory) {
        self.factories.push(factory);
    }

    /// Pick the converter class for a parameter. The first factory to
    /// claim it wins; no claimant is a configuration error.
    pub fn converter_for(
        &self,
        param: &ParamSpec,
        registry: &CallableRegistry,
        callable_name: &str,
    ) -> Result<ConverterClass, ConfigError> {
        for factory in &self.factories {
            if let Some(class) = factory(param, registry)? {
                return Ok(class);
            }
        }
        Err(ConfigError::NoConverter {
            callable: callable_name.to_string(),
            name: param.name.clone(),
        })
    }
}

/// No annotation and no meaningful default: plain `str`.
fn unannotated_to_converter(
    param: &ParamSpec,
    _registry: &CallableRegistry,
) -> Result<Option<ConverterClass>, ConfigError> {
    let defaultless = matches!(param.default, None | Some(Value::Null));
    if param.annotation.is_none() && defaultless {
        return Ok(Some(ConverterClass::Simple(ScalarKind::Str)));
    }
    Ok(None)
}

/// A scalar annotation. `bool` in keyword-only position is a flag.
fn scalar_to_converter(
    param: &ParamSpec,
    _registry: &CallableRegistry,
) -> Result<Option<ConverterClass>, ConfigError> {
    match param.annotation {
        Some(Annotation::Scalar(kind)) => Ok(Some(scalar_class(kind, param.kind))),
        _ => Ok(None),
    }
}

/// A callable annotation: a nested converter.
fn callable_to_converter(
    param: &ParamSpec,
    registry: &CallableRegistry,
) -> Result<Option<ConverterClass>, ConfigError> {
    match param.annotation {
        Some(Annotation::Callable(id)) => {
            let entry = registry.get(id)?;
            Ok(Some(if entry.is_multi() {
                ConverterClass::Multi(id)
            } else {
                ConverterClass::Single(id)
            }))
        }
        _ => Ok(None),
    }
}

/// No annotation but a scalar default: use the default's type.
///
/// List and map defaults are refused here; a list default belongs to the
/// sequence factory, and treating a map as "a callable with parameters"
/// would be silent nonsense.
fn inferred_type_to_converter(
    param: &ParamSpec,
    _registry: &CallableRegistry,
) -> Result<Option<ConverterClass>, ConfigError> {
    if param.annotation.is_some() {
        return Ok(None);
    }
    let Some(default) = &param.default else {
        return Ok(None);
    };
    match default.scalar_kind() {
        Some(kind) => Ok(Some(scalar_class(kind, param.kind))),
        None => Ok(None),
    }
}

/// No annotation but a list default: one argument per element, each with
/// the element's inferred scalar type.
fn sequence_to_converter(
    param: &ParamSpec,
    _registry: &CallableRegistry,
) -> Result<Option<ConverterClass>, ConfigError> {
    if param.annotation.is_some() {
        return Ok(None);
    }
    let Some(Value::List(elements)) = &param.default else {
        return Ok(None);
    };
    if elements.is_empty() {
        return Err(ConfigError::EmptySequenceDefault {
            name: param.name.clone(),
        });
    }

    let width = elements.len().to_string().len();
    let separator = if param.name.ends_with(|c: char| c.is_ascii_digit()) {
        "_"
    } else {
        ""
    };

    let mut specs = Vec::with_capacity(elements.len());
    for (i, element) in elements.iter().enumerate() {
        let Some(kind) = element.scalar_kind() else {
            return Err(ConfigError::other(format!(
                "{}: sequence default element {i} is not a scalar, so its type can't be inferred",
                param.name
            )));
        };
        specs.push((format!("{}{}{:0width$}", param.name, separator, i), kind));
    }
    Ok(Some(ConverterClass::Sequence(specs)))
}

fn scalar_class(kind: ScalarKind, param_kind: ParamKind) -> ConverterClass {
    if kind == ScalarKind::Bool && param_kind == ParamKind::KeywordOnly {
        ConverterClass::Flag
    } else {
        ConverterClass::Simple(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CallableImpl;
    use std::sync::Arc;

    fn registry_with_fn() -> (CallableRegistry, CallableId) {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "pair",
            Signature::builder().positional("i").positional("f").build(),
            CallableImpl::Native(Arc::new(|_| Ok(Value::Null))),
        );
        (registry, id)
    }

    fn pick(param: &ParamSpec, registry: &CallableRegistry) -> ConverterClass {
        FactoryRegistry::with_defaults()
            .converter_for(param, registry, "test")
            .unwrap()
    }

    #[test]
    fn unannotated_is_str() {
        let registry = CallableRegistry::new();
        let param = ParamSpec::new("a", ParamKind::PositionalOrKeyword);
        assert_eq!(pick(&param, &registry), ConverterClass::Simple(ScalarKind::Str));
    }

    #[test]
    fn null_default_is_str() {
        let registry = CallableRegistry::new();
        let param = ParamSpec::new("a", ParamKind::PositionalOrKeyword).with_default(Value::Null);
        assert_eq!(pick(&param, &registry), ConverterClass::Simple(ScalarKind::Str));
    }

    #[test]
    fn scalar_annotation_wins() {
        let registry = CallableRegistry::new();
        let param = ParamSpec::new("n", ParamKind::PositionalOrKeyword)
            .with_annotation(Annotation::Scalar(ScalarKind::Int));
        assert_eq!(pick(&param, &registry), ConverterClass::Simple(ScalarKind::Int));
    }

    #[test]
    fn keyword_only_bool_is_flag() {
        let registry = CallableRegistry::new();
        let param = ParamSpec::new("verbose", ParamKind::KeywordOnly)
            .with_annotation(Annotation::Scalar(ScalarKind::Bool))
            .with_default(Value::Bool(false));
        assert_eq!(pick(&param, &registry), ConverterClass::Flag);

        // Inferred from a bool default too.
        let param = ParamSpec::new("verbose", ParamKind::KeywordOnly).with_default(Value::Bool(false));
        assert_eq!(pick(&param, &registry), ConverterClass::Flag);
    }

    #[test]
    fn callable_annotation_recurses() {
        let (registry, id) = registry_with_fn();
        let param = ParamSpec::new("pair", ParamKind::PositionalOrKeyword)
            .with_annotation(Annotation::Callable(id));
        assert_eq!(pick(&param, &registry), ConverterClass::Single(id));
    }

    #[test]
    fn inferred_from_default() {
        let registry = CallableRegistry::new();
        let param = ParamSpec::new("n", ParamKind::PositionalOrKeyword).with_default(Value::Int(3));
        assert_eq!(pick(&param, &registry), ConverterClass::Simple(ScalarKind::Int));
    }

    #[test]
    fn sequence_default_generates_elements() {
        let registry = CallableRegistry::new();
        let param = ParamSpec::new("pair", ParamKind::PositionalOrKeyword)
            .with_default(Value::List(vec![Value::Int(0), Value::Float(0.0)]));
        let class = pick(&param, &registry);
        assert_eq!(
            class,
            ConverterClass::Sequence(vec![
                ("pair0".to_string(), ScalarKind::Int),
                ("pair1".to_string(), ScalarKind::Float),
            ])
        );
        let sig = converter_signature(&class, &registry).unwrap();
        assert_eq!(sig.len(), 2);
    }

    #[test]
    fn map_default_is_refused() {
        let registry = CallableRegistry::new();
        let param =
            ParamSpec::new("m", ParamKind::PositionalOrKeyword).with_default(Value::Map(vec![]));
        let err = FactoryRegistry::with_defaults()
            .converter_for(&param, &registry, "test")
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoConverter { .. }));
    }

    #[test]
    fn empty_sequence_default_is_config_error() {
        let registry = CallableRegistry::new();
        let param =
            ParamSpec::new("xs", ParamKind::PositionalOrKeyword).with_default(Value::List(vec![]));
        let err = FactoryRegistry::with_defaults()
            .converter_for(&param, &registry, "test")
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptySequenceDefault { .. }));
    }

    #[test]
    fn simple_signature_shape() {
        let registry = CallableRegistry::new();
        let sig =
            converter_signature(&ConverterClass::Simple(ScalarKind::Int), &registry).unwrap();
        assert_eq!(sig.len(), 1);
        assert_eq!(sig.params[0].name, "int");
        assert!(sig.params[0].annotation.is_none());
        assert!(sig.params[0].is_required());

        let sig = converter_signature(&ConverterClass::Flag, &registry).unwrap();
        assert!(sig.is_empty());
    }
}
