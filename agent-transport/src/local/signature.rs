//! Declared parameters of a callable and how call parameters bind to them.

use std::collections::HashSet;
use std::fmt;

use agent_primitives::Params;
use serde_json::{Number, Value};

use super::callable::Arguments;
use crate::error::{TransportError, TransportResult};

/// Expected type of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParamKind {
    /// Any JSON value, including `null`.
    #[default]
    Any,
    /// A string.
    String,
    /// A whole number. Numeric strings are accepted.
    Integer,
    /// Any number. Numeric strings are accepted.
    Number,
    /// `true` or `false`, also as strings.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any value",
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Array => "an array",
            Self::Object => "an object",
        };
        f.write_str(name)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    kind: ParamKind,
    default: Option<Value>,
}

impl Parameter {
    /// A parameter the caller must supply.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    /// A parameter that falls back to `default` when omitted.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ParamKind, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default.into()),
        }
    }

    /// Returns the parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the expected type.
    #[must_use]
    pub const fn kind(&self) -> ParamKind {
        self.kind
    }

    /// Returns the default value, if the parameter is optional.
    #[must_use]
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    fn coerce(&self, value: Value) -> TransportResult<Value> {
        if value.is_null() && (self.kind == ParamKind::Any || self.default == Some(Value::Null)) {
            return Ok(value);
        }

        let coerced = match (self.kind, value) {
            (ParamKind::Any, value)
            | (ParamKind::String, value @ Value::String(_))
            | (ParamKind::Boolean, value @ Value::Bool(_))
            | (ParamKind::Array, value @ Value::Array(_))
            | (ParamKind::Number, value @ Value::Number(_))
            | (ParamKind::Object, value @ Value::Object(_)) => Ok(value),
            (ParamKind::Integer, Value::Number(number)) => integer(&number).ok_or(Value::Number(number)),
            (ParamKind::Integer, Value::String(text)) => match text.trim().parse::<i64>() {
                Ok(parsed) => Ok(Value::from(parsed)),
                Err(_) => Err(Value::String(text)),
            },
            (ParamKind::Number, Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or(Value::String(text)),
            (ParamKind::Boolean, Value::String(text)) => {
                if text.eq_ignore_ascii_case("true") {
                    Ok(Value::Bool(true))
                } else if text.eq_ignore_ascii_case("false") {
                    Ok(Value::Bool(false))
                } else {
                    Err(Value::String(text))
                }
            }
            (_, other) => Err(other),
        };

        coerced.map_err(|rejected| {
            TransportError::validation(format!(
                "parameter `{}` expects {}, got {}",
                self.name,
                self.kind,
                describe(&rejected)
            ))
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integer(number: &Number) -> Option<Value> {
    if number.is_i64() || number.is_u64() {
        return Some(Value::Number(number.clone()));
    }
    let float = number.as_f64()?;
    let whole = float.fract() == 0.0 && float >= i64::MIN as f64 && float <= i64::MAX as f64;
    whole.then(|| Value::from(float as i64))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "an array".to_owned(),
        Value::Object(_) => "an object".to_owned(),
    }
}

/// Declared parameters of a callable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    parameters: Vec<Parameter>,
    accepts_extra: bool,
}

impl Signature {
    /// A signature with no parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter.
    #[must_use]
    pub fn with(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Appends a required parameter.
    #[must_use]
    pub fn required(self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.with(Parameter::required(name, kind))
    }

    /// Appends an optional parameter with its default.
    #[must_use]
    pub fn optional(self, name: impl Into<String>, kind: ParamKind, default: impl Into<Value>) -> Self {
        self.with(Parameter::optional(name, kind, default))
    }

    /// Passes parameters not declared here through to the callable instead of
    /// rejecting them.
    #[must_use]
    pub const fn accepting_extra(mut self) -> Self {
        self.accepts_extra = true;
        self
    }

    /// Returns the declared parameters in order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Returns `true` if undeclared parameters are passed through.
    #[must_use]
    pub const fn accepts_extra(&self) -> bool {
        self.accepts_extra
    }

    /// Checks the declaration itself: names must be non-empty and unique.
    pub(crate) fn check(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if parameter.name.trim().is_empty() {
                return Err("parameter names cannot be empty".into());
            }
            if !seen.insert(parameter.name.as_str()) {
                return Err(format!("parameter `{}` is declared twice", parameter.name));
            }
        }
        Ok(())
    }

    /// Binds call parameters: fills defaults, coerces declared types and
    /// rejects missing or undeclared names.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Validation`] naming the offending parameter.
    pub fn bind(&self, params: Params) -> TransportResult<Arguments> {
        let mut remaining = params;
        let mut bound = Params::new();

        for parameter in &self.parameters {
            let value = match (remaining.remove(&parameter.name), &parameter.default) {
                (Some(value), _) => parameter.coerce(value)?,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(TransportError::validation(format!(
                        "missing required parameter `{}`",
                        parameter.name
                    )));
                }
            };
            bound.insert(parameter.name.clone(), value);
        }

        if !remaining.is_empty() {
            if !self.accepts_extra {
                let names: Vec<_> = remaining.keys().map(String::as_str).collect();
                return Err(TransportError::validation(format!(
                    "unexpected parameter(s): {}",
                    names.join(", ")
                )));
            }
            bound.extend(remaining);
        }

        Ok(Arguments::new(bound))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    fn greet() -> Signature {
        Signature::new()
            .required("name", ParamKind::String)
            .optional("times", ParamKind::Integer, 1)
            .optional("loud", ParamKind::Boolean, false)
    }

    #[test]
    fn defaults_fill_omitted_parameters() {
        let args = greet().bind(params(json!({"name": "Ada"}))).unwrap();
        assert_eq!(
            args.as_params(),
            &params(json!({"name": "Ada", "times": 1, "loud": false}))
        );
    }

    #[test]
    fn strings_are_coerced_to_declared_types() {
        let args = greet()
            .bind(params(json!({"name": "Ada", "times": "3", "loud": "TRUE"})))
            .unwrap();
        assert_eq!(args.value("times"), Some(&json!(3)));
        assert_eq!(args.value("loud"), Some(&json!(true)));

        let ratio = Signature::new().required("ratio", ParamKind::Number);
        let args = ratio.bind(params(json!({"ratio": "0.5"}))).unwrap();
        assert_eq!(args.value("ratio"), Some(&json!(0.5)));
    }

    #[test]
    fn missing_and_unexpected_parameters_are_rejected() {
        let err = greet().bind(Params::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("`name`"));

        let err = greet()
            .bind(params(json!({"name": "Ada", "colour": "red"})))
            .unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn extra_parameters_pass_through_when_accepted() {
        let args = greet()
            .accepting_extra()
            .bind(params(json!({"name": "Ada", "colour": "red"})))
            .unwrap();
        assert_eq!(args.value("colour"), Some(&json!("red")));
    }

    #[test]
    fn type_mismatches_name_the_parameter() {
        let err = greet()
            .bind(params(json!({"name": "Ada", "times": "many"})))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid parameters: parameter `times` expects an integer, got string \"many\""
        );

        let err = greet().bind(params(json!({"name": null}))).unwrap_err();
        assert!(err.to_string().contains("got null"));
    }

    #[test]
    fn whole_floats_count_as_integers() {
        let sig = Signature::new().required("n", ParamKind::Integer);
        assert_eq!(
            sig.bind(params(json!({"n": 4.0}))).unwrap().value("n"),
            Some(&json!(4))
        );
        assert!(sig.bind(params(json!({"n": 4.5}))).is_err());
    }

    #[test]
    fn declaration_checks() {
        assert!(greet().check().is_ok());
        let dup = Signature::new()
            .required("a", ParamKind::Any)
            .required("a", ParamKind::Any);
        assert!(dup.check().unwrap_err().contains("twice"));
    }
}
