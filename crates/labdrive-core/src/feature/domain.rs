use super::value::Value;
use crate::error::{InstrError, InstrResult};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Bidirectional mapping between logical labels and wire codes.
///
/// Declaration order is preserved for introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnumMap(IndexMap<String, String>);

impl EnumMap {
    pub fn new<L, C>(pairs: impl IntoIterator<Item = (L, C)>) -> Self
    where
        L: Into<String>,
        C: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(label, code)| (label.into(), code.into()))
                .collect(),
        )
    }

    pub fn code_for(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    /// Reverse lookup. Exact matches win, then a case-insensitive match, since
    /// instruments commonly echo codes in a different case.
    pub fn label_for(&self, code: &str) -> Option<&str> {
        let code = code.trim();
        self.0
            .iter()
            .find(|(_, c)| c.as_str() == code)
            .or_else(|| self.0.iter().find(|(_, c)| c.eq_ignore_ascii_case(code)))
            .map(|(label, _)| label.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Set of legal logical values for a feature.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    /// Value-less command (`*RST`, `*TRG`).
    Action,
    Bool,
    Int { min: i64, max: i64 },
    Float { min: Option<f64>, max: Option<f64> },
    Enum { labels: EnumMap },
    Text { max_len: Option<usize> },
    Bytes { max_len: Option<usize> },
}

impl Domain {
    /// Signed integer of the given bit width.
    pub fn signed(bits: u32) -> Self {
        let bits = bits.clamp(2, 64);
        if bits == 64 {
            return Domain::Int {
                min: i64::MIN,
                max: i64::MAX,
            };
        }
        Domain::Int {
            min: -(1i64 << (bits - 1)),
            max: (1i64 << (bits - 1)) - 1,
        }
    }

    /// Unsigned integer of the given bit width (at most 63 bits).
    pub fn unsigned(bits: u32) -> Self {
        let bits = bits.clamp(1, 63);
        Domain::Int {
            min: 0,
            max: (1i64 << bits) - 1,
        }
    }

    pub fn int(min: i64, max: i64) -> Self {
        Domain::Int { min, max }
    }

    pub fn float(min: f64, max: f64) -> Self {
        Domain::Float {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn any_float() -> Self {
        Domain::Float {
            min: None,
            max: None,
        }
    }

    pub fn enumeration<L, C>(pairs: impl IntoIterator<Item = (L, C)>) -> Self
    where
        L: Into<String>,
        C: Into<String>,
    {
        Domain::Enum {
            labels: EnumMap::new(pairs),
        }
    }

    pub fn text() -> Self {
        Domain::Text { max_len: None }
    }

    pub fn bytes() -> Self {
        Domain::Bytes { max_len: None }
    }

    /// Checks `value` and returns its canonical form.
    ///
    /// Integers are accepted where floats are expected and widened; nothing
    /// else is coerced.
    pub fn check(&self, feature: &str, value: Value) -> InstrResult<Value> {
        let mismatch = |v: &Value| {
            InstrError::domain(
                feature,
                format!("expected {}, got {} value", self.shape_name(), v.shape()),
            )
        };
        match (self, value) {
            (Domain::Action, Value::Unit) => Ok(Value::Unit),
            (Domain::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (Domain::Int { min, max }, Value::Int(v)) => {
                if v < *min || v > *max {
                    Err(InstrError::domain(
                        feature,
                        format!("{} is outside [{}, {}]", v, min, max),
                    ))
                } else {
                    Ok(Value::Int(v))
                }
            }
            (Domain::Float { min, max }, value @ (Value::Int(_) | Value::Float(_))) => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                if !v.is_finite() {
                    return Err(InstrError::domain(feature, format!("{} is not finite", v)));
                }
                if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                    return Err(InstrError::domain(
                        feature,
                        format!("{} is outside [{}, {}]", v, fmt_bound(*min), fmt_bound(*max)),
                    ));
                }
                Ok(Value::Float(v))
            }
            (Domain::Enum { labels }, Value::Text(label)) => {
                if labels.code_for(&label).is_some() {
                    Ok(Value::Text(label))
                } else {
                    let allowed: Vec<&str> = labels.labels().collect();
                    Err(InstrError::domain(
                        feature,
                        format!("'{}' is not one of {:?}", label, allowed),
                    ))
                }
            }
            (Domain::Text { max_len }, Value::Text(text)) => {
                if max_len.is_some_and(|m| text.len() > m) {
                    Err(InstrError::domain(feature, "text is too long"))
                } else {
                    Ok(Value::Text(text))
                }
            }
            (Domain::Bytes { max_len }, Value::Bytes(bytes)) => {
                if max_len.is_some_and(|m| bytes.len() > m) {
                    Err(InstrError::domain(feature, "byte block is too long"))
                } else {
                    Ok(Value::Bytes(bytes))
                }
            }
            (_, other) => Err(mismatch(&other)),
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            Domain::Action => "no value",
            Domain::Bool => "bool",
            Domain::Int { .. } => "int",
            Domain::Float { .. } => "float",
            Domain::Enum { .. } => "enum label",
            Domain::Text { .. } => "text",
            Domain::Bytes { .. } => "bytes",
        }
    }

    /// Default verify tolerance: exact for everything except floats.
    pub(crate) fn default_tolerance(&self) -> Tolerance {
        match self {
            Domain::Float { .. } => Tolerance::Relative(1e-9),
            _ => Tolerance::Exact,
        }
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "∞".to_string(), |b| b.to_string())
}

/// Maximum accepted difference between a written value and its readback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Tolerance {
    Exact,
    Absolute(f64),
    Relative(f64),
}

impl Tolerance {
    pub fn accepts(&self, expected: &Value, actual: &Value) -> bool {
        match (expected.as_f64(), actual.as_f64()) {
            (Some(e), Some(a)) => match self {
                Tolerance::Exact => e == a,
                Tolerance::Absolute(tol) => (e - a).abs() <= *tol,
                Tolerance::Relative(tol) => (e - a).abs() <= tol * e.abs().max(a.abs()).max(1.0),
            },
            _ => expected == actual,
        }
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tolerance::Exact => write!(f, "exact"),
            Tolerance::Absolute(v) => write!(f, "±{}", v),
            Tolerance::Relative(v) => write!(f, "±{} rel", v),
        }
    }
}

/// Extra constraint on top of a [`Domain`].
#[derive(Clone)]
pub enum Validator {
    /// Inclusive numeric range.
    Range { min: f64, max: f64 },
    /// Explicit set of allowed values.
    OneOf(Vec<Value>),
    /// Arbitrary predicate with a description used in error messages.
    Predicate {
        description: String,
        check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    },
}

impl Validator {
    pub fn predicate(
        description: impl Into<String>,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Validator::Predicate {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    pub fn validate(&self, feature: &str, value: &Value) -> InstrResult<()> {
        match self {
            Validator::Range { min, max } => match value.as_f64() {
                Some(v) if v >= *min && v <= *max => Ok(()),
                Some(v) => Err(InstrError::domain(
                    feature,
                    format!("{} is outside [{}, {}]", v, min, max),
                )),
                None => Err(InstrError::domain(feature, "range check needs a number")),
            },
            Validator::OneOf(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    Err(InstrError::domain(
                        feature,
                        format!("{} is not an allowed value", value),
                    ))
                }
            }
            Validator::Predicate { description, check } => {
                if check(value) {
                    Ok(())
                } else {
                    Err(InstrError::domain(
                        feature,
                        format!("{} violates '{}'", value, description),
                    ))
                }
            }
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Validator::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            Validator::Predicate { description, .. } => {
                f.debug_tuple("Predicate").field(description).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn signed_widths() {
        assert_eq!(Domain::signed(16), Domain::int(-32768, 32767));
        assert_eq!(
            Domain::signed(32),
            Domain::int(i32::MIN as i64, i32::MAX as i64)
        );
        assert_eq!(Domain::unsigned(8), Domain::int(0, 255));
    }

    #[test]
    fn int_range_is_enforced() {
        let d = Domain::unsigned(8);
        assert_eq!(d.check("sre", Value::Int(50)).unwrap(), Value::Int(50));
        let err = d.check("sre", Value::Int(550)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Domain);
        assert!(d.check("sre", Value::Float(5.0)).is_err());
    }

    #[test]
    fn floats_accept_ints_and_reject_nan() {
        let d = Domain::float(-10.0, 10.0);
        assert_eq!(d.check("volt", Value::Int(3)).unwrap(), Value::Float(3.0));
        assert!(d.check("volt", Value::Float(f64::NAN)).is_err());
        assert!(d.check("volt", Value::Float(10.5)).is_err());
        assert!(d.check("volt", Value::Text("3".into())).is_err());
    }

    #[test]
    fn enum_lookup_both_ways() {
        let d = Domain::enumeration([("sin", "SIN"), ("square", "SQU")]);
        let Domain::Enum { labels } = &d else {
            unreachable!()
        };
        assert_eq!(labels.code_for("square"), Some("SQU"));
        assert_eq!(labels.label_for("squ\n"), Some("square"));
        assert_eq!(labels.label_for("TRI"), None);
        assert!(d.check("shape", Value::from("triangle")).is_err());
    }

    #[test]
    fn tolerance_comparison() {
        let rel = Tolerance::Relative(1e-9);
        assert!(rel.accepts(&Value::Float(1e4), &Value::Float(1e4 + 1e-7)));
        assert!(!rel.accepts(&Value::Float(1.0), &Value::Float(1.001)));
        assert!(Tolerance::Absolute(0.01).accepts(&Value::Float(1.23), &Value::Float(1.235)));
        assert!(Tolerance::Exact.accepts(&Value::from("sin"), &Value::from("sin")));
    }

    #[test]
    fn predicate_validator() {
        let even = Validator::predicate("even", |v| v.as_i64().is_some_and(|n| n % 2 == 0));
        assert!(even.validate("n", &Value::Int(4)).is_ok());
        assert_eq!(
            even.validate("n", &Value::Int(3)).unwrap_err().kind(),
            ErrorKind::Domain
        );
    }
}
