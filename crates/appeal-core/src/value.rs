//! The dynamic value model.
//!
//! Command-line parsing is stringly-typed at the edges and typed in the
//! middle: tokens come in as strings, converters turn them into [`Value`]s,
//! and user callables receive and return [`Value`]s. Mapping-mode parses
//! additionally traffic in [`Value::List`] and [`Value::Map`].

use std::fmt;
use std::str::FromStr;

use crate::error::UsageError;
use crate::signature::ScalarKind;

/// A complex number with `f64` parts.
///
/// Accepts the conventional command-line spellings: `3+4j`, `-1.5j`, `2`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im == 0.0 {
            write!(f, "{}", self.re)
        } else if self.re == 0.0 {
            write!(f, "{}j", self.im)
        } else if self.im < 0.0 {
            write!(f, "{}{}j", self.re, self.im)
        } else {
            write!(f, "{}+{}j", self.re, self.im)
        }
    }
}

impl FromStr for Complex {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(());
        }
        if let Some(imag) = s.strip_suffix(['j', 'J']) {
            // Find the split between real and imaginary parts: the last
            // +/- that isn't an exponent sign and isn't leading.
            let bytes = imag.as_bytes();
            let mut split = None;
            for i in (1..bytes.len()).rev() {
                let c = bytes[i];
                if (c == b'+' || c == b'-') && !matches!(bytes[i - 1], b'e' | b'E') {
                    split = Some(i);
                    break;
                }
            }
            let (re, im) = match split {
                Some(i) => {
                    let re: f64 = imag[..i].parse().map_err(|_| ())?;
                    let im_str = &imag[i..];
                    let im: f64 = match im_str {
                        "+" => 1.0,
                        "-" => -1.0,
                        _ => im_str.parse().map_err(|_| ())?,
                    };
                    (re, im)
                }
                None => {
                    let im: f64 = match imag {
                        "" => 1.0,
                        "-" => -1.0,
                        _ => imag.parse().map_err(|_| ())?,
                    };
                    (0.0, im)
                }
            };
            Ok(Complex::new(re, im))
        } else {
            let re: f64 = s.parse().map_err(|_| ())?;
            Ok(Complex::new(re, 0.0))
        }
    }
}

/// A dynamically-typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The absence of a value (a `None`-shaped default).
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(Complex),
    Str(String),
    List(Vec<Value>),
    /// Insertion-ordered string-keyed mapping.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Shorthand for `Value::Str(s.into())`.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// The scalar kind this value would be inferred as, if any.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            Value::Bool(_) => Some(ScalarKind::Bool),
            Value::Int(_) => Some(ScalarKind::Int),
            Value::Float(_) => Some(ScalarKind::Float),
            Value::Complex(_) => Some(ScalarKind::Complex),
            Value::Str(_) => Some(ScalarKind::Str),
            _ => None,
        }
    }

    /// Truthiness, matching the conventions converters rely on.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Complex(c) => c.re != 0.0 || c.im != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a key in a `Value::Map`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()
            .and_then(|entries| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Complex(c) => write!(f, "{c}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl ScalarKind {
    /// The type name used in "invalid value" diagnostics.
    pub fn type_name(self) -> &'static str {
        match self {
            ScalarKind::Str => "str",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Complex => "complex",
            ScalarKind::Bool => "bool",
        }
    }

    /// Convert one string into a value of this kind.
    ///
    /// Failures are usage errors naming the value, the parameter it was
    /// bound to, and the expected type.
    pub fn convert(self, s: &str, name: &str) -> Result<Value, UsageError> {
        let invalid = || UsageError::InvalidValue {
            value: s.to_string(),
            name: name.to_string(),
            expected: self.type_name(),
        };
        match self {
            ScalarKind::Str => Ok(Value::Str(s.to_string())),
            ScalarKind::Int => s.parse::<i64>().map(Value::Int).map_err(|_| invalid()),
            ScalarKind::Float => s.parse::<f64>().map(Value::Float).map_err(|_| invalid()),
            ScalarKind::Complex => s
                .parse::<Complex>()
                .map(Value::Complex)
                .map_err(|_| invalid()),
            // bool("") is falsy, anything else is truthy; matching the
            // truthiness rule rather than spelled-out true/false keeps
            // "-" and "0" behaving like ordinary strings.
            ScalarKind::Bool => Ok(Value::Bool(!s.is_empty())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_parsing() {
        assert_eq!("3+4j".parse::<Complex>(), Ok(Complex::new(3.0, 4.0)));
        assert_eq!("-1.5j".parse::<Complex>(), Ok(Complex::new(0.0, -1.5)));
        assert_eq!("2".parse::<Complex>(), Ok(Complex::new(2.0, 0.0)));
        assert_eq!("j".parse::<Complex>(), Ok(Complex::new(0.0, 1.0)));
        assert_eq!("1e2+3j".parse::<Complex>(), Ok(Complex::new(100.0, 3.0)));
        assert!("frob".parse::<Complex>().is_err());
    }

    #[test]
    fn scalar_convert() {
        assert_eq!(
            ScalarKind::Int.convert("42", "n").unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            ScalarKind::Float.convert("2.5", "x").unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            ScalarKind::Str.convert("hi", "s").unwrap(),
            Value::str("hi")
        );
    }

    #[test]
    fn scalar_convert_failure_is_usage_error() {
        let err = ScalarKind::Int.convert("abc", "n").unwrap_err();
        assert_eq!(
            err,
            UsageError::InvalidValue {
                value: "abc".to_string(),
                name: "n".to_string(),
                expected: "int",
            }
        );
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn map_lookup() {
        let map = Value::Map(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]);
        assert_eq!(map.get("b"), Some(&Value::Int(2)));
        assert_eq!(map.get("c"), None);
    }
}
