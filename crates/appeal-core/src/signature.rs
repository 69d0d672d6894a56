//! Parameter descriptors and signatures.
//!
//! In the original dynamic design a grammar was introspected out of a
//! function object. Here the front end *declares* signatures through
//! [`Signature::builder`]; everything downstream (grouping, compilation,
//! interpretation) consumes these descriptors.

use crate::registry::CallableId;
use crate::value::Value;

/// The five parameter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Fillable only by position.
    PositionalOnly,
    /// Fillable by position or by name.
    PositionalOrKeyword,
    /// `*args`: consumes every remaining positional argument.
    VarPositional,
    /// Fillable only by name; becomes a command-line option.
    KeywordOnly,
    /// `**kwargs`: catch-all for named options.
    VarKeyword,
}

impl ParamKind {
    /// Does this kind consume positional arguments?
    pub fn is_positional(self) -> bool {
        matches!(
            self,
            ParamKind::PositionalOnly | ParamKind::PositionalOrKeyword | ParamKind::VarPositional
        )
    }
}

/// The built-in scalar conversion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Str,
    Int,
    Float,
    Complex,
    Bool,
}

/// A type annotation on a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// One of the scalar types.
    Scalar(ScalarKind),
    /// A registered callable: a nested converter.
    Callable(CallableId),
}

/// One declared parameter.
///
/// `default: None` is the "no default" sentinel; `Some(Value::Null)` is an
/// actual `None`-shaped default. The two are distinct and the distinction
/// matters: only the former makes a parameter required.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub annotation: Option<Annotation>,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            annotation: None,
            default: None,
        }
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// A parameter is locally required when it has no default and is not
    /// var-positional.
    pub fn is_required(&self) -> bool {
        self.default.is_none() && self.kind != ParamKind::VarPositional
    }
}

/// An ordered list of parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    pub params: Vec<ParamSpec>,
}

impl Signature {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// Start declaring a signature.
    pub fn builder() -> SignatureBuilder {
        SignatureBuilder::default()
    }

    /// The parameters that consume positional arguments, in order.
    pub fn positional(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.kind.is_positional())
    }

    /// The keyword-only parameters, in order.
    pub fn keyword_only(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::KeywordOnly)
    }

    /// The `**kwargs` parameter, if declared.
    pub fn var_keyword(&self) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.kind == ParamKind::VarKeyword)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Fluent declaration of a [`Signature`].
///
/// ```
/// use appeal_core::{Annotation, ScalarKind, Signature, Value};
///
/// let sig = Signature::builder()
///     .positional("src")
///     .positional_with("count", Annotation::Scalar(ScalarKind::Int), Some(Value::Int(1)))
///     .keyword_only("verbose", None, Value::Bool(false))
///     .build();
/// assert_eq!(sig.len(), 3);
/// ```
#[derive(Debug, Default)]
pub struct SignatureBuilder {
    params: Vec<ParamSpec>,
}

impl SignatureBuilder {
    /// A plain required positional parameter (inferred `str`).
    pub fn positional(mut self, name: impl Into<String>) -> Self {
        self.params
            .push(ParamSpec::new(name, ParamKind::PositionalOrKeyword));
        self
    }

    /// A positional parameter with explicit annotation and/or default.
    pub fn positional_with(
        mut self,
        name: impl Into<String>,
        annotation: impl Into<Option<Annotation>>,
        default: Option<Value>,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::PositionalOrKeyword,
            annotation: annotation.into(),
            default,
        });
        self
    }

    /// A `*args` parameter.
    pub fn var_positional(
        mut self,
        name: impl Into<String>,
        annotation: impl Into<Option<Annotation>>,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::VarPositional,
            annotation: annotation.into(),
            default: None,
        });
        self
    }

    /// A keyword-only parameter. Keyword-only parameters must have a
    /// default; that rule is enforced at compile time, not here.
    pub fn keyword_only(
        mut self,
        name: impl Into<String>,
        annotation: impl Into<Option<Annotation>>,
        default: Value,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::KeywordOnly,
            annotation: annotation.into(),
            default: Some(default),
        });
        self
    }

    /// A `**kwargs` parameter.
    pub fn var_keyword(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::VarKeyword,
            annotation: None,
            default: None,
        });
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn build(self) -> Signature {
        Signature::new(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_needs_no_default_and_not_var_positional() {
        let p = ParamSpec::new("a", ParamKind::PositionalOrKeyword);
        assert!(p.is_required());

        let p = p.with_default(Value::Null);
        assert!(!p.is_required());

        let v = ParamSpec::new("rest", ParamKind::VarPositional);
        assert!(!v.is_required());
    }

    #[test]
    fn builder_orders_parameters() {
        let sig = Signature::builder()
            .positional("a")
            .var_positional("rest", None)
            .keyword_only("verbose", None, Value::Bool(false))
            .build();
        assert_eq!(sig.positional().count(), 2);
        assert_eq!(sig.keyword_only().count(), 1);
        assert!(sig.var_keyword().is_none());
        assert_eq!(sig.params[0].name, "a");
    }
}
