use serde::Deserialize;

use crate::{
    entry::Entry,
    operator::{Capability, Operator, ProcessError, registry::OperatorBuilder},
};

/// Discards every entry.
pub struct DropOutput {
    dropped: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropOutputConfig {}

impl OperatorBuilder for DropOutput {
    type Config = DropOutputConfig;

    fn type_name() -> &'static str {
        "drop_output"
    }

    fn capability() -> Capability {
        Capability::Output
    }

    fn build(_id: &str, _config: DropOutputConfig) -> anyhow::Result<Box<Self>> {
        Ok(Box::new(Self { dropped: 0 }))
    }
}

impl Operator for DropOutput {
    fn process(&mut self, _entry: Entry) -> Result<Option<Entry>, ProcessError> {
        self.dropped += 1;
        Ok(None)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        log::debug!("drop_output: {} entries discarded", self.dropped);
        Ok(())
    }
}
