//! Build parameters
//!
//! Typed, named values a pipeline run can be started with. Defaults come from
//! the definition; `NAME=value` overrides come from the command line.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use super::errors::PipelineError;
use super::types::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a build parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamKind {
    /// true/false
    Bool,
    /// Free text, optionally limited to choices
    String {
        /// Allowed values, any value when empty
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        choices: Vec<String>,
    },
    /// One of a fixed set of values; the first is the default
    Choice {
        /// Allowed values
        choices: Vec<String>,
    },
}

/// Value of a build parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean value
    Bool(bool),
    /// Text value
    String(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// One declared build parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParam {
    /// Parameter name
    pub name: String,

    /// What the parameter controls
    #[serde(default)]
    pub description: String,

    /// Parameter type
    #[serde(flatten)]
    pub kind: ParamKind,

    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,

    /// Fails the run if no value is given
    #[serde(default)]
    pub required: bool,

    /// Value given for this run
    #[serde(skip)]
    value: Option<ParamValue>,
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

impl BuildParam {
    fn new(name: impl Into<String>, description: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            default: None,
            required: false,
            value: None,
        }
    }

    /// Declares a boolean parameter
    pub fn bool(name: impl Into<String>, description: impl Into<String>, default: bool) -> Self {
        let mut param = Self::new(name, description, ParamKind::Bool);
        param.default = Some(ParamValue::Bool(default));
        param
    }

    /// Declares a string parameter without a default
    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(
            name,
            description,
            ParamKind::String {
                choices: Vec::new(),
            },
        )
    }

    /// Declares a choice parameter; the first choice is the default
    pub fn choice<I, S>(name: impl Into<String>, description: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let choices: Vec<String> = choices.into_iter().map(Into::into).collect();
        let default = choices.first().cloned().map(ParamValue::String);
        let mut param = Self::new(name, description, ParamKind::Choice { choices });
        param.default = default;
        param
    }

    /// Sets the default value
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(ParamValue::String(value.into()));
        self
    }

    /// Limits a string parameter to the given values
    pub fn with_choices<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let ParamKind::String { choices } = &mut self.kind {
            *choices = values.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Marks the parameter as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Effective value: the override if given, else the default
    pub fn value(&self) -> Option<&ParamValue> {
        self.value.as_ref().or(self.default.as_ref())
    }

    fn error(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::Parameter {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Parses a raw override for this parameter
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not fit the parameter type.
    pub fn parse(&self, raw: &str) -> Result<ParamValue, PipelineError> {
        let value = match &self.kind {
            ParamKind::Bool => ParamValue::Bool(
                parse_bool(raw).ok_or_else(|| self.error(format!("'{raw}' is not a boolean")))?,
            ),
            ParamKind::String { .. } | ParamKind::Choice { .. } => {
                ParamValue::String(raw.to_string())
            }
        };
        self.check(&value)?;
        Ok(value)
    }

    fn check(&self, value: &ParamValue) -> Result<(), PipelineError> {
        match (&self.kind, value) {
            (ParamKind::Bool, ParamValue::Bool(_)) => Ok(()),
            (ParamKind::Bool, ParamValue::String(_)) => Err(self.error("must be a boolean")),
            (ParamKind::String { .. } | ParamKind::Choice { .. }, ParamValue::Bool(_)) => {
                Err(self.error("must be a string"))
            }
            (ParamKind::String { choices } | ParamKind::Choice { choices }, ParamValue::String(s)) => {
                if choices.is_empty() || choices.contains(s) {
                    Ok(())
                } else {
                    Err(self.error(format!("must be one of {}", choices.join(", "))))
                }
            }
        }
    }

    /// Sets the value for this run from a raw string
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not fit the parameter type.
    pub fn set(&mut self, raw: &str) -> Result<(), PipelineError> {
        self.value = Some(self.parse(raw)?);
        Ok(())
    }
}

impl Validate for BuildParam {
    type Error = PipelineError;

    fn validate(&self) -> Result<(), Self::Error> {
        if !valid_name(&self.name) {
            return Err(self.error("name may only contain letters, digits, '_' and '-'"));
        }
        if let ParamKind::Choice { choices } = &self.kind {
            if choices.is_empty() {
                return Err(self.error("choice parameter needs at least one choice"));
            }
        }
        if let Some(default) = &self.default {
            self.check(default)?;
        }
        if self.required && self.value().is_none() {
            return Err(self.error("required but no value given"));
        }
        Ok(())
    }
}

/// The declared build parameters of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildParams {
    params: Vec<BuildParam>,
}

/// Splits a `NAME=value` override
///
/// # Errors
///
/// Returns an error if there is no `=` or the name is empty.
pub fn parse_override(raw: &str) -> Result<(&str, &str), PipelineError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(PipelineError::Parameter {
            name: raw.to_string(),
            reason: "override must look like NAME=value".into(),
        }),
    }
}

impl BuildParams {
    /// Creates an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter declaration
    pub fn with(mut self, param: BuildParam) -> Self {
        self.params.retain(|p| p.name != param.name);
        self.params.push(param);
        self
    }

    /// Declared parameters, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &BuildParam> {
        self.params.iter()
    }

    /// Returns true if nothing is declared
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Looks up a declared parameter
    pub fn get(&self, name: &str) -> Option<&BuildParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Sets one parameter from a raw string
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names and ill-typed values.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), PipelineError> {
        let param = self
            .params
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| PipelineError::Parameter {
                name: name.to_string(),
                reason: "unknown parameter".into(),
            })?;
        param.set(raw)
    }

    /// Applies `NAME=value` overrides, then validates the whole set
    ///
    /// # Errors
    ///
    /// Returns the first invalid override or missing required value.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<(), PipelineError> {
        for raw in overrides {
            let (name, value) = parse_override(raw.as_ref())?;
            self.set(name, value)?;
            tracing::debug!(param = %name, "Build parameter overridden");
        }
        self.validate()
    }

    /// Effective value of a parameter
    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.get(name).and_then(BuildParam::value)
    }

    /// Boolean value of a parameter
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is unknown, unset or not boolean.
    pub fn bool(&self, name: &str) -> Result<bool, PipelineError> {
        match self.value(name) {
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(ParamValue::String(_)) => Err(PipelineError::Parameter {
                name: name.to_string(),
                reason: "not a boolean parameter".into(),
            }),
            None => Err(PipelineError::Parameter {
                name: name.to_string(),
                reason: "no value".into(),
            }),
        }
    }

    /// Text value of a parameter
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is unknown, unset or boolean.
    pub fn string(&self, name: &str) -> Result<&str, PipelineError> {
        match self.value(name) {
            Some(ParamValue::String(s)) => Ok(s),
            Some(ParamValue::Bool(_)) => Err(PipelineError::Parameter {
                name: name.to_string(),
                reason: "not a string parameter".into(),
            }),
            None => Err(PipelineError::Parameter {
                name: name.to_string(),
                reason: "no value".into(),
            }),
        }
    }
}

impl Validate for BuildParams {
    type Error = PipelineError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.params.iter().try_for_each(|param| param.validate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BuildParams {
        BuildParams::new()
            .with(BuildParam::bool("DEPLOY", "Whether to deploy", true))
            .with(BuildParam::choice("TARGET", "Where to", ["staging", "prod"]))
            .with(BuildParam::string("VERSION", "Release version"))
    }

    #[test]
    fn test_defaults() {
        let params = params();
        assert!(params.bool("DEPLOY").unwrap());
        assert_eq!(params.string("TARGET").unwrap(), "staging");
        assert!(params.value("VERSION").is_none());
    }

    #[test]
    fn test_apply_overrides() {
        let mut params = params();
        params
            .apply_overrides(&["DEPLOY=false", "TARGET=prod", "VERSION=1.2=rc"])
            .unwrap();

        assert!(!params.bool("DEPLOY").unwrap());
        assert_eq!(params.string("TARGET").unwrap(), "prod");
        assert_eq!(params.string("VERSION").unwrap(), "1.2=rc");
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut params = params();
        assert!(params.apply_overrides(&["DEPLOY=maybe"]).is_err());
        assert!(params.apply_overrides(&["TARGET=moon"]).is_err());
        assert!(params.apply_overrides(&["UNKNOWN=1"]).is_err());
        assert!(params.apply_overrides(&["novalue"]).is_err());
        assert!(params.apply_overrides(&["=x"]).is_err());
    }

    #[test]
    fn test_required_without_value() {
        let mut params =
            BuildParams::new().with(BuildParam::string("VERSION", "Release version").required());

        let err = params.apply_overrides::<&str>(&[]).unwrap_err();
        assert!(matches!(err, PipelineError::Parameter { ref name, .. } if name == "VERSION"));

        params.apply_overrides(&["VERSION=2.0"]).unwrap();
    }

    #[test]
    fn test_string_with_choices() {
        let param = BuildParam::string("ENV", "").with_choices(["a", "b"]);
        assert!(param.parse("a").is_ok());
        assert!(param.parse("c").is_err());
    }

    #[test]
    fn test_invalid_name() {
        let params = BuildParams::new().with(BuildParam::bool("has space", "", false));
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_type_mismatch_accessors() {
        let params = params();
        assert!(params.string("DEPLOY").is_err());
        assert!(params.bool("TARGET").is_err());
        assert!(params.bool("MISSING").is_err());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let params: BuildParams = serde_yaml::from_str(
            "- name: DEPLOY\n  type: bool\n  default: true\n- name: TARGET\n  type: choice\n  choices: [a, b]\n",
        )
        .unwrap();

        assert!(params.get("DEPLOY").is_some());
        assert!(matches!(
            params.get("TARGET").map(|p| &p.kind),
            Some(ParamKind::Choice { .. })
        ));
    }
}
