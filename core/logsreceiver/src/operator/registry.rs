//! Registry of the operator types that can be used in a pipeline.

use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;

use super::{Capability, Operator};

/// Creates a [`Vec`] containing [`OperatorMetadata`] for statically-linked operators.
///
/// Each argument must be a _type_ that implements the [`OperatorBuilder`] trait.
///
/// # Example
/// ```ignore
/// use logsreceiver::operator::registry::OperatorMetadata;
///
/// let operators: Vec<OperatorMetadata> = static_operators![OperatorA, OperatorB];
/// ```
///
/// Attributes are supported:
/// ```ignore
/// let operators = static_operators![
///     #[cfg(feature = "some-feature")]
///     ConditionalOperator
/// ];
/// ```
#[macro_export]
macro_rules! static_operators {
    [] => {
        Vec::<$crate::operator::registry::OperatorMetadata>::new()
    };
    [$( $(#[$m:meta])* $x:path ),+ $(,)?] => {
        {
            vec![
                $(
                    $(#[$m])*
                    $crate::operator::registry::OperatorMetadata::from_static::<$x>(),
                )*
            ] as Vec<$crate::operator::registry::OperatorMetadata>
        }
    }
}

/// Trait for operators that can be created from their configuration.
pub trait OperatorBuilder: Operator + Sized + 'static {
    /// The typed configuration of the operator.
    ///
    /// It is deserialized from the operator table of the pipeline config, without the
    /// `type` and `id` keys.
    type Config: DeserializeOwned;

    /// The value of the `type` key that selects this operator.
    fn type_name() -> &'static str;

    fn capability() -> Capability;

    /// Creates a new operator. It should not start anything yet.
    fn build(id: &str, config: Self::Config) -> anyhow::Result<Box<Self>>;
}

type BuildFn = dyn Fn(&str, toml::Table) -> anyhow::Result<Box<dyn Operator>> + Send + Sync;

/// Operator type, and a function that creates operators of this type.
pub struct OperatorMetadata {
    pub type_name: String,
    pub capability: Capability,
    pub build: Box<BuildFn>,
}

impl OperatorMetadata {
    pub fn from_static<O: OperatorBuilder>() -> Self {
        Self {
            type_name: O::type_name().to_owned(),
            capability: O::capability(),
            build: Box::new(|id, config| {
                let config: O::Config = deserialize_config(config)?;
                let operator = O::build(id, config)?;
                Ok(operator as Box<dyn Operator>)
            }),
        }
    }
}

/// Deserializes an operator configuration into a typed struct.
pub fn deserialize_config<T: DeserializeOwned>(config: toml::Table) -> anyhow::Result<T> {
    toml::Value::Table(config)
        .try_into()
        .context("invalid operator configuration")
}

/// Maps operator types to their metadata.
///
/// The registry is filled when the application initializes, and then only read by the
/// [`PipelineBuilder`](crate::pipeline::builder::PipelineBuilder).
pub struct OperatorRegistry {
    types: FxHashMap<String, OperatorMetadata>,
}

#[derive(Debug, thiserror::Error)]
#[error("operator type '{0}' is already registered")]
pub struct DuplicateTypeError(pub String);

impl OperatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            types: FxHashMap::default(),
        }
    }

    /// Creates a registry that contains the built-in operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for metadata in crate::operators::builtins() {
            // the built-ins have distinct names
            registry.types.insert(metadata.type_name.clone(), metadata);
        }
        registry
    }

    /// Registers a new operator type.
    pub fn register(&mut self, metadata: OperatorMetadata) -> Result<(), DuplicateTypeError> {
        match self.types.entry(metadata.type_name.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => Err(DuplicateTypeError(e.key().clone())),
            std::collections::hash_map::Entry::Vacant(e) => {
                log::debug!("Operator type '{}' registered", metadata.type_name);
                e.insert(metadata);
                Ok(())
            }
        }
    }

    /// Registers multiple operator types, for instance the result of [`static_operators!`].
    pub fn register_all(
        &mut self,
        operators: impl IntoIterator<Item = OperatorMetadata>,
    ) -> Result<(), DuplicateTypeError> {
        for metadata in operators {
            self.register(metadata)?;
        }
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&OperatorMetadata> {
        self.types.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Returns the registered types, sorted by name.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
