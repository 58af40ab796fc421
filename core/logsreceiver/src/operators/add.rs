use serde::Deserialize;

use crate::{
    entry::{Attributes, Entry},
    operator::{Capability, Operator, ProcessError, registry::OperatorBuilder},
};

/// Adds fixed key-values to every entry.
pub struct Add {
    config: AddConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddConfig {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub resource: Attributes,
}

impl OperatorBuilder for Add {
    type Config = AddConfig;

    fn type_name() -> &'static str {
        "add"
    }

    fn capability() -> Capability {
        Capability::Intermediate
    }

    fn build(id: &str, config: AddConfig) -> anyhow::Result<Box<Self>> {
        if config.attributes.is_empty() && config.resource.is_empty() {
            log::warn!("operator {id} has nothing to add, it will forward entries unchanged");
        }
        Ok(Box::new(Self { config }))
    }
}

impl Operator for Add {
    fn process(&mut self, mut entry: Entry) -> Result<Option<Entry>, ProcessError> {
        for (k, v) in &self.config.attributes {
            entry.add_attribute(k, v);
        }
        for (k, v) in &self.config.resource {
            entry.add_resource(k, v);
        }
        Ok(Some(entry))
    }
}
