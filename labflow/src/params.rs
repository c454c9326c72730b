//! Pipeline parameters: typed declarations, defaults, and override merging.
//!
//! Resolution is a pure merge. Every override key must name a declared
//! parameter; the override value is parsed according to the declared
//! default's type.

use crate::errors::{LabflowError, UnknownParameterError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A boolean flag.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string (also used for paths).
    Str(String),
}

impl ParamValue {
    /// The type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }

    /// Parses a raw override token into the same type as `self`.
    pub fn parse_as_same_type(&self, raw: &str) -> Result<Self, ValidationError> {
        match self {
            Self::Bool(_) => raw.parse::<bool>().map(Self::Bool).map_err(|_| {
                ValidationError::new(format!("expected a bool, got '{raw}'"))
            }),
            Self::Int(_) => raw.parse::<i64>().map(Self::Int).map_err(|_| {
                ValidationError::new(format!("expected an integer, got '{raw}'"))
            }),
            Self::Float(_) => raw.parse::<f64>().map(Self::Float).map_err(|_| {
                ValidationError::new(format!("expected a float, got '{raw}'"))
            }),
            Self::Str(_) => Ok(Self::Str(raw.to_string())),
        }
    }

    /// Renders the value the way it is substituted into command templates.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A declared pipeline parameter: name, default, and documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDecl {
    /// The parameter name, as overridable from the invocation surface.
    pub name: String,
    /// The default value; its type fixes the parameter's type.
    pub default: ParamValue,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

impl ParamDecl {
    /// Creates a new declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, default: ParamValue) -> Self {
        Self {
            name: name.into(),
            default,
            description: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The fully resolved parameter set for one run.
///
/// Read-only after resolution; ordering is stable so fingerprints are
/// deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedParams {
    values: BTreeMap<String, ParamValue>,
}

impl ResolvedParams {
    /// Looks up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Returns true if a parameter with this name was declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterates over (name, value) pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// The number of resolved parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no parameters are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Projects the subset of parameters named in `names`, in name order.
    ///
    /// Used to fingerprint a stage against only the parameters its command
    /// references.
    #[must_use]
    pub fn subset(&self, names: &[String]) -> BTreeMap<String, ParamValue> {
        self.values
            .iter()
            .filter(|(name, _)| names.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Merges declared defaults with invocation-time overrides.
///
/// # Errors
///
/// Returns [`LabflowError::UnknownParameter`] if an override names an
/// undeclared parameter, or a validation error if an override cannot be
/// parsed as the declared type.
pub fn resolve_params(
    declared: &[ParamDecl],
    overrides: &BTreeMap<String, String>,
) -> Result<ResolvedParams, LabflowError> {
    let mut values: BTreeMap<String, ParamValue> = declared
        .iter()
        .map(|decl| (decl.name.clone(), decl.default.clone()))
        .collect();

    for (name, raw) in overrides {
        let Some(current) = values.get(name) else {
            return Err(UnknownParameterError::new(
                name.clone(),
                declared.iter().map(|d| d.name.clone()).collect(),
            )
            .into());
        };
        let parsed = current.parse_as_same_type(raw).map_err(|err| {
            ValidationError::new(format!("parameter '--{name}': {}", err.message))
        })?;
        values.insert(name.clone(), parsed);
    }

    Ok(ResolvedParams { values })
}

/// Parses trailing `--name value` override tokens from the command line.
///
/// Tokens must come in pairs; a bare flag or a value without a preceding
/// `--name` is rejected. Duplicate names keep the last value.
pub fn parse_override_tokens(
    tokens: &[String],
) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut overrides = BTreeMap::new();
    let mut iter = tokens.iter();

    while let Some(token) = iter.next() {
        let Some(name) = token.strip_prefix("--") else {
            return Err(ValidationError::new(format!(
                "expected '--name value' override pairs, got '{token}'"
            )));
        };
        if name.is_empty() {
            return Err(ValidationError::new("empty parameter name in overrides"));
        }
        let Some(value) = iter.next() else {
            return Err(ValidationError::new(format!(
                "override '--{name}' is missing a value"
            )));
        };
        overrides.insert(name.to_string(), value.clone());
    }

    Ok(overrides)
}
