use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::SkillId;

/// Parameter values keyed by parameter name, in a stable order for the wire.
pub type ParameterValues = BTreeMap<String, ParameterValue>;

/// A named, parameterized unit of AI work. Immutable for the duration of an execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: SkillId,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub multi_turn: bool,
}

fn default_true() -> bool {
    true
}

impl Skill {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Declared input of a skill.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            label: None,
            placeholder: None,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label for user-facing messages, falling back to the raw name.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Initial value before any auto-fill: the declared default, or the empty value for the type.
    pub fn seed_value(&self) -> ParameterValue {
        self.default
            .clone()
            .unwrap_or_else(|| ParameterValue::empty_for(self.kind))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    #[serde(alias = "string")]
    Text,
    Textarea,
    Number,
    #[serde(alias = "bool", alias = "checkbox")]
    Boolean,
    Select,
    #[serde(alias = "array", alias = "multiselect")]
    MultiSelect,
    Date,
}

/// A parameter value as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<String>),
}

impl ParameterValue {
    pub fn empty_for(kind: ParameterType) -> Self {
        match kind {
            ParameterType::Boolean => Self::Bool(false),
            ParameterType::MultiSelect => Self::List(Vec::new()),
            ParameterType::Text
            | ParameterType::Textarea
            | ParameterType::Number
            | ParameterType::Select
            | ParameterType::Date => Self::Text(String::new()),
        }
    }

    /// Null, empty string and empty list count as "no value". `false` and `0` do not.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Bool(_) | Self::Number(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret raw user input (e.g. a `name=value` flag) according to the declared type.
    pub fn parse_as(kind: ParameterType, raw: &str) -> Self {
        match kind {
            ParameterType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Self::Bool(true),
                "false" | "0" | "no" | "off" | "" => Self::Bool(false),
                _ => Self::Text(raw.to_string()),
            },
            ParameterType::Number => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| Self::Text(raw.to_string()), Self::Number),
            ParameterType::MultiSelect => Self::List(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            ParameterType::Text
            | ParameterType::Textarea
            | ParameterType::Select
            | ParameterType::Date => Self::Text(raw.to_string()),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for ParameterValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}
