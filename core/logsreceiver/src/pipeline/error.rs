use thiserror::Error;

use crate::operator::Capability;

/// Error that prevents a pipeline from being built.
///
/// When building fails, no operator is kept: every operator that has already been
/// created is dropped without being started.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("the pipeline is empty")]
    EmptyPipeline,
    #[error("operator #{index} of {location} has no 'type'")]
    MissingType { index: usize, location: String },
    #[error("invalid value for '{key}' in operator #{index} of {location}: expected a string, got {actual}")]
    NotAString {
        key: &'static str,
        index: usize,
        location: String,
        actual: &'static str,
    },
    #[error("unsupported operator type '{type_name}' (operator '{id}')")]
    UnknownType { id: String, type_name: String },
    #[error("invalid configuration for operator '{id}' of type '{type_name}'")]
    InvalidConfig {
        id: String,
        type_name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("missing parameter '{parameter}' for plugin '{plugin}' (operator '{id}')")]
    MissingParameter {
        id: String,
        plugin: String,
        parameter: String,
    },
    #[error("unknown parameter '{parameter}' for plugin '{plugin}' (operator '{id}')")]
    UnknownParameter {
        id: String,
        plugin: String,
        parameter: String,
    },
    #[error("duplicate operator id '{0}'")]
    DuplicateId(String),
    #[error("operator '{id}' is an {capability} and must be the {expected} operator of the pipeline")]
    Misplaced {
        id: String,
        capability: Capability,
        expected: &'static str,
    },
    #[error("plugin '{plugin}' references itself: {chain}")]
    PluginCycle { plugin: String, chain: String },
    #[error("plugins are nested too deeply (more than {max} levels): {chain}")]
    PluginTooDeep { max: usize, chain: String },
}
