//! Built-in operators.

use std::fmt;

use serde::Deserialize;

use crate::operator::registry::OperatorMetadata;

pub mod add;
pub mod drop_output;
pub mod json_parser;

pub use add::Add;
pub use drop_output::DropOutput;
pub use json_parser::JsonParser;

/// Returns the metadata of the built-in operators.
pub fn builtins() -> Vec<OperatorMetadata> {
    crate::static_operators![JsonParser, Add, DropOutput]
}

/// A location in an entry, written `body` or `attributes.<key>` in the configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Field {
    #[default]
    Body,
    Attribute(String),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid field '{0}', expected 'body' or 'attributes.<key>'")]
pub struct InvalidField(String);

impl TryFrom<String> for Field {
    type Error = InvalidField;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "body" {
            return Ok(Field::Body);
        }
        match value.strip_prefix("attributes.") {
            Some(key) if !key.is_empty() => Ok(Field::Attribute(key.to_owned())),
            _ => Err(InvalidField(value)),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Body => f.write_str("body"),
            Field::Attribute(key) => write!(f, "attributes.{key}"),
        }
    }
}

#[cfg(test)]
pub(crate) fn registry_config<T: serde::de::DeserializeOwned>(config: toml::Table) -> T {
    crate::operator::registry::deserialize_config(config).unwrap()
}
