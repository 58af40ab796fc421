use anyhow::{Context, anyhow};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    entry::{Entry, Severity},
    operator::{Capability, Operator, ProcessError, registry::OperatorBuilder},
};

use super::Field;

/// Parses a JSON document contained in an entry.
pub struct JsonParser {
    id: String,
    config: JsonParserConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonParserConfig {
    /// Where to find the JSON string.
    #[serde(default)]
    pub parse_from: Field,
    /// Where to write the parsed value.
    #[serde(default)]
    pub parse_to: ParseTo,
    /// What to do with the entries that cannot be parsed.
    #[serde(default)]
    pub on_error: OnError,
    /// Key of the parsed object that holds the severity of the event.
    pub severity_field: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseTo {
    /// Replace the body with the parsed value.
    #[default]
    Body,
    /// Merge the top-level keys of the parsed object into the attributes.
    Attributes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Forward the entry unchanged.
    #[default]
    Send,
    /// Drop the entry.
    Drop,
}

impl OperatorBuilder for JsonParser {
    type Config = JsonParserConfig;

    fn type_name() -> &'static str {
        "json_parser"
    }

    fn capability() -> Capability {
        Capability::Intermediate
    }

    fn build(id: &str, config: JsonParserConfig) -> anyhow::Result<Box<Self>> {
        if let Some(key) = &config.severity_field {
            anyhow::ensure!(!key.is_empty(), "severity_field cannot be empty");
        }
        Ok(Box::new(Self {
            id: id.to_owned(),
            config,
        }))
    }
}

impl Operator for JsonParser {
    fn process(&mut self, mut entry: Entry) -> Result<Option<Entry>, ProcessError> {
        let parsed = match self.parse(&entry) {
            Ok(value) => value,
            Err(e) => {
                return match self.config.on_error {
                    OnError::Send => {
                        log::debug!("{}: entry forwarded without parsing: {e:#}", self.id);
                        Ok(Some(entry))
                    }
                    OnError::Drop => Err(ProcessError::InvalidEntry(e)),
                };
            }
        };

        if let Some(key) = &self.config.severity_field {
            if let Some(text) = parsed.get(key).and_then(Value::as_str) {
                entry.severity = text.parse().unwrap_or(Severity::Default);
                entry.severity_text = Some(text.to_owned());
            }
        }

        // parse() only returns objects when parsing to attributes
        match parsed {
            Value::Object(map) if self.config.parse_to == ParseTo::Attributes => {
                for (key, value) in map {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    entry.attributes.insert(key, value);
                }
            }
            value => entry.body = value,
        }
        Ok(Some(entry))
    }
}

impl JsonParser {
    fn parse(&self, entry: &Entry) -> anyhow::Result<Value> {
        let input = match &self.config.parse_from {
            Field::Body => match &entry.body {
                Value::String(s) => s.as_str(),
                other => return Err(anyhow!("expected a string body, got {}", json_type(other))),
            },
            Field::Attribute(key) => entry
                .attribute(key)
                .with_context(|| format!("missing attribute '{key}'"))?,
        };
        let value: Value = serde_json::from_str(input).context("invalid JSON")?;
        if self.config.parse_to == ParseTo::Attributes && !value.is_object() {
            return Err(anyhow!(
                "only a JSON object can be parsed to attributes, got {}",
                json_type(&value)
            ));
        }
        Ok(value)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
