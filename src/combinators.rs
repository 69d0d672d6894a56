//! Converter and multi-option combinators.
//!
//! These register small, reusable callables: value validators, a string
//! splitter, and the classic multi-option shapes (counting flags,
//! accumulating lists, key/value maps). Each returns a [`CallableId`]
//! you use as an [`Annotation::Callable`] on a parameter.

use std::cmp::Ordering;

use appeal_core::{
    Annotation, CallArgs, CallableId, ConfigError, MultiAccumulator, ParamKind, ParamSpec,
    ScalarKind, Signature, UsageError, Value,
};

use crate::builder::Appeal;

fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn scalar_param(name: &str, kind: ScalarKind) -> ParamSpec {
    ParamSpec::new(name, ParamKind::PositionalOnly).with_annotation(Annotation::Scalar(kind))
}

fn zero_of(kind: ScalarKind) -> Value {
    match kind {
        ScalarKind::Int => Value::Int(0),
        ScalarKind::Float => Value::Float(0.0),
        ScalarKind::Str => Value::Str(String::new()),
        ScalarKind::Bool => Value::Bool(false),
        ScalarKind::Complex => Value::Complex(Default::default()),
    }
}

impl Appeal {
    /// A converter that accepts only the listed values.
    ///
    /// The value's type is inferred from the first listed value; all
    /// values must share it.
    pub fn validate(&mut self, values: Vec<Value>) -> Result<CallableId, ConfigError> {
        let Some(first) = values.first() else {
            return Err(ConfigError::other("validate() called without any values"));
        };
        let Some(kind) = first.scalar_kind() else {
            return Err(ConfigError::other("validate() values must be scalars"));
        };
        if let Some(odd) = values.iter().find(|v| v.scalar_kind() != Some(kind)) {
            return Err(ConfigError::other(format!(
                "validate() called with non-homogeneous values: {odd}"
            )));
        }

        let signature = Signature::new(vec![scalar_param("value", kind)]);
        Ok(self.converter("validate", signature, move |call: CallArgs| {
            let value = call.args.into_iter().next().unwrap_or_default();
            if values.contains(&value) {
                Ok(value)
            } else {
                let listed: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
                Err(UsageError::other(format!(
                    "illegal value {value}, should be one of {}",
                    listed.join(" ")
                )))
            }
        }))
    }

    /// A converter that accepts values within a range.
    ///
    /// `start` and `stop` work like `range()` bounds, except values equal
    /// to `stop` are allowed. With one bound, the range runs from the
    /// type's zero. With `clamp`, out-of-range values snap to the nearest
    /// bound instead of failing.
    pub fn validate_range(
        &mut self,
        start: Value,
        stop: Option<Value>,
        clamp: bool,
    ) -> Result<CallableId, ConfigError> {
        let Some(kind) = start.scalar_kind() else {
            return Err(ConfigError::other("validate_range() bounds must be scalars"));
        };
        let (mut start, mut stop) = match stop {
            Some(stop) => (start, stop),
            None => (zero_of(kind), start),
        };
        if value_cmp(&start, &stop) == Some(Ordering::Greater) {
            std::mem::swap(&mut start, &mut stop);
        }

        let signature = Signature::new(vec![scalar_param("value", kind)]);
        Ok(self.converter("validate_range", signature, move |call: CallArgs| {
            let value = call.args.into_iter().next().unwrap_or_default();
            let below = value_cmp(&value, &start) == Some(Ordering::Less);
            let above = value_cmp(&stop, &value) == Some(Ordering::Less);
            if !(below || above) {
                return Ok(value);
            }
            if clamp {
                return Ok(if above { stop.clone() } else { start.clone() });
            }
            Err(UsageError::other(format!(
                "illegal value {value}, should be {start} <= value < {stop}"
            )))
        }))
    }

    /// A converter that splits a string on one or more separators.
    ///
    /// With no separators, splits on whitespace. With `strip`, leading
    /// and trailing separators produce no empty pieces.
    pub fn split(
        &mut self,
        separators: Vec<String>,
        strip: bool,
    ) -> Result<CallableId, ConfigError> {
        if separators.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::other(
                "split(): every separator must be a non-empty string",
            ));
        }

        let signature = Signature::new(vec![ParamSpec::new("str", ParamKind::PositionalOnly)]);
        Ok(self.converter("split", signature, move |call: CallArgs| {
            let text = match call.args.into_iter().next() {
                Some(Value::Str(s)) => s,
                other => {
                    return Err(UsageError::other(format!(
                        "split() expects a string, got {}",
                        other.unwrap_or_default()
                    )));
                }
            };
            let mut pieces: Vec<&str> = if separators.is_empty() {
                text.split_whitespace().collect()
            } else {
                let mut pieces = Vec::new();
                let mut rest = text.as_str();
                'outer: loop {
                    let mut earliest: Option<(usize, usize)> = None;
                    for sep in &separators {
                        if let Some(at) = rest.find(sep.as_str()) {
                            if earliest.is_none_or(|(best, _)| at < best) {
                                earliest = Some((at, sep.len()));
                            }
                        }
                    }
                    match earliest {
                        Some((at, len)) => {
                            pieces.push(&rest[..at]);
                            rest = &rest[at + len..];
                        }
                        None => {
                            pieces.push(rest);
                            break 'outer;
                        }
                    }
                }
                pieces
            };
            if strip {
                while pieces.first() == Some(&"") {
                    pieces.remove(0);
                }
                while pieces.last() == Some(&"") {
                    pieces.pop();
                }
            }
            Ok(Value::List(pieces.into_iter().map(Value::str).collect()))
        }))
    }

    /// A counting multi-option: each occurrence steps the count, with an
    /// optional ceiling (or floor, for a negative step).
    pub fn counter(&mut self, max: Option<i64>, step: i64) -> Result<CallableId, ConfigError> {
        if step == 0 {
            return Err(ConfigError::other("counter(): step value cannot be 0"));
        }

        struct Counter {
            count: i64,
            max: i64,
            step: i64,
        }
        impl MultiAccumulator for Counter {
            fn invoke(&mut self, _call: CallArgs) -> Result<(), UsageError> {
                let next = self.count.saturating_add(self.step);
                self.count = if self.step > 0 {
                    next.min(self.max)
                } else {
                    next.max(self.max)
                };
                Ok(())
            }
            fn render(&mut self) -> Result<Value, UsageError> {
                Ok(Value::Int(self.count))
            }
        }

        Ok(self.multi_option(
            "counter",
            Signature::default(),
            move |default: Option<&Value>| {
                let count = match default {
                    Some(Value::Int(i)) => *i,
                    _ => 0,
                };
                let max = max.unwrap_or(if step > 0 { i64::MAX } else { i64::MIN });
                Box::new(Counter { count, max, step })
            },
        ))
    }

    /// An accumulating multi-option: each occurrence converts one value
    /// and appends it; renders the collected list.
    pub fn accumulator(&mut self, kind: ScalarKind) -> CallableId {
        struct Accumulator {
            values: Vec<Value>,
        }
        impl MultiAccumulator for Accumulator {
            fn invoke(&mut self, call: CallArgs) -> Result<(), UsageError> {
                self.values.extend(call.args);
                Ok(())
            }
            fn render(&mut self) -> Result<Value, UsageError> {
                Ok(Value::List(std::mem::take(&mut self.values)))
            }
        }

        let signature = Signature::new(vec![scalar_param("arg", kind)]);
        self.multi_option("accumulator", signature, |default: Option<&Value>| {
            let values = match default {
                Some(Value::List(values)) => values.clone(),
                _ => Vec::new(),
            };
            Box::new(Accumulator { values })
        })
    }

    /// A key/value multi-option: each occurrence consumes a key and a
    /// value; renders the collected mapping. Duplicate keys are a usage
    /// error.
    pub fn key_value_map(&mut self, key: ScalarKind, value: ScalarKind) -> CallableId {
        struct KeyValueMap {
            entries: Vec<(String, Value)>,
        }
        impl MultiAccumulator for KeyValueMap {
            fn invoke(&mut self, call: CallArgs) -> Result<(), UsageError> {
                let mut args = call.args.into_iter();
                let key = args.next().unwrap_or_default().to_string();
                let value = args.next().unwrap_or_default();
                if self.entries.iter().any(|(k, _)| *k == key) {
                    return Err(UsageError::other(format!("defined {key} more than once")));
                }
                self.entries.push((key, value));
                Ok(())
            }
            fn render(&mut self) -> Result<Value, UsageError> {
                Ok(Value::Map(std::mem::take(&mut self.entries)))
            }
        }

        let signature = Signature::new(vec![
            scalar_param("key", key),
            scalar_param("value", value),
        ]);
        self.multi_option("mapping", signature, |default: Option<&Value>| {
            let entries = match default {
                Some(Value::Map(entries)) => entries.clone(),
                _ => Vec::new(),
            };
            Box::new(KeyValueMap { entries })
        })
    }
}
