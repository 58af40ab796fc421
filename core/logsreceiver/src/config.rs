//! Configuration of the receiver.
use std::{borrow::Cow, env::VarError, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::converter::ConverterConfig;
use error::{InvalidSubstitutionError, LoadError, LoadErrorCause};

/// Configuration of a [`Receiver`](crate::receiver::Receiver).
///
/// ## Example
///
/// ```toml
/// plugin_dir = "/etc/logsreceiver/plugins"
/// shutdown_timeout = "5s"
///
/// [[pipeline]]
/// type = "http_input"
/// listen_address = "0.0.0.0:8080"
///
/// [[pipeline]]
/// type = "json_parser"
/// parse_from = "attributes.message"
///
/// [converter]
/// max_flush_count = 500
/// flush_interval = "1s"
///
/// [delivery]
/// on_error = "retry"
/// max_retries = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Operators of the pipeline, in order.
    pub pipeline: Vec<toml::Table>,
    /// Directory that contains the plugin templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Maximum time given to the operators to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// What to do with the batches that the downstream consumer rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    pub on_error: OnDeliveryError,
    /// Number of additional attempts, when `on_error` is `retry`.
    pub max_retries: u32,
    /// Time to wait before the first retry. The delay doubles after each attempt.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDeliveryError {
    /// Log the error and drop the batch.
    #[default]
    Drop,
    /// Try again, then drop the batch if every attempt failed.
    Retry,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            on_error: OnDeliveryError::Drop,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl ReceiverConfig {
    /// Creates a config with the given pipeline and default settings.
    pub fn new(pipeline: Vec<toml::Table>) -> Self {
        Self {
            pipeline,
            plugin_dir: None,
            converter: ConverterConfig::default(),
            delivery: DeliveryConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    /// Deserializes the config from a TOML table.
    pub fn from_table(table: toml::Table) -> Result<Self, toml::de::Error> {
        toml::Value::Table(table).try_into()
    }
}

impl FromStr for ReceiverConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

/// Loads the receiver configuration from a TOML file.
pub struct Loader {
    file: PathBuf,
    overrides: Option<toml::Table>,
    substitute_env: bool,
}

impl Loader {
    /// Creates a new `Loader` that will read `config_file` on [`load`](Self::load).
    pub fn parse_file<P: Into<PathBuf>>(config_file: P) -> Self {
        Self {
            file: config_file.into(),
            overrides: None,
            substitute_env: false,
        }
    }

    /// Overrides the content of the file by [merging](merge_override) it with another table.
    ///
    /// Multiple overrides can be set, they are applied in order.
    pub fn with_override(mut self, config_override: toml::Table) -> Self {
        match &mut self.overrides {
            Some(existing) => merge_override(existing, config_override),
            None => self.overrides = Some(config_override),
        }
        self
    }

    /// Enables or disables the substitution of environment variables (see [`substitute_env`]).
    ///
    /// The substitution is done on the raw content of the file, before parsing it.
    pub fn substitute_env_variables(mut self, substitute_env: bool) -> Self {
        self.substitute_env = substitute_env;
        self
    }

    /// Loads the file as a TOML table, without interpreting it.
    pub fn load_table(mut self) -> Result<toml::Table, LoadError> {
        self.load_table_impl().map_err(|cause| LoadError {
            config_file: self.file,
            cause,
        })
    }

    /// Loads the file and deserializes it.
    pub fn load(mut self) -> Result<ReceiverConfig, LoadError> {
        let res = self
            .load_table_impl()
            .and_then(|table| ReceiverConfig::from_table(table).map_err(LoadErrorCause::InvalidConfig));
        res.map_err(|cause| LoadError {
            config_file: self.file,
            cause,
        })
    }

    fn load_table_impl(&mut self) -> Result<toml::Table, LoadErrorCause> {
        let content = std::fs::read_to_string(&self.file).map_err(LoadErrorCause::Read)?;
        let content = if self.substitute_env {
            substitute_env(&content)?
        } else {
            Cow::Borrowed(content.as_str())
        };
        let mut table = toml::Table::from_str(&content)?;
        if let Some(overrides) = self.overrides.take() {
            merge_override(&mut table, overrides);
        }
        Ok(table)
    }
}

/// Replaces every `${VAR_NAME}` by the value of the environment variable `VAR_NAME`.
///
/// Write `\${NOT_A_VAR}` to keep the text as it is (the backslash is removed).
/// Returns an error if a variable does not exist or is not valid UTF-8.
pub fn substitute_env(input: &str) -> Result<Cow<'_, str>, InvalidSubstitutionError> {
    substitute_vars(input, |name| std::env::var(name))
}

fn substitute_vars(
    input: &str,
    lookup: impl Fn(&str) -> Result<String, VarError>,
) -> Result<Cow<'_, str>, InvalidSubstitutionError> {
    if !input.contains("${") {
        return Ok(Cow::Borrowed(input));
    }

    let mut res = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(begin) = rest.find("${") {
        if begin > 0 && rest.as_bytes()[begin - 1] == b'\\' {
            // escaped: drop the backslash
            res.push_str(&rest[..begin - 1]);
            res.push_str("${");
            rest = &rest[begin + 2..];
            continue;
        }

        res.push_str(&rest[..begin]);
        let after = &rest[begin + 2..];
        let end = after.find('}').ok_or(InvalidSubstitutionError::WrongSyntax)?;
        let name = &after[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(InvalidSubstitutionError::InvalidName(name.to_owned()));
        }
        match lookup(name) {
            Ok(value) => res.push_str(&value),
            Err(VarError::NotPresent) => return Err(InvalidSubstitutionError::Missing(name.to_owned())),
            Err(VarError::NotUnicode(_)) => return Err(InvalidSubstitutionError::InvalidValue(name.to_owned())),
        }
        rest = &after[end + 1..];
    }
    res.push_str(rest);
    Ok(Cow::Owned(res))
}

/// Merges `overrider` into `original`, recursively.
///
/// Tables are merged key by key. Any other value of `overrider`, including arrays,
/// replaces the value of `original`.
pub fn merge_override(original: &mut toml::Table, overrider: toml::Table) {
    for (key, value) in overrider {
        match (original.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(table)) => merge_override(existing, table),
            (_, value) => {
                original.insert(key, value);
            }
        }
    }
}

pub mod error {
    use std::{io, path::PathBuf};
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("could not load config from '{config_file}'")]
    pub struct LoadError {
        pub config_file: PathBuf,
        #[source]
        pub(super) cause: LoadErrorCause,
    }

    #[derive(Error, Debug)]
    pub(super) enum LoadErrorCause {
        #[error("read failed")]
        Read(#[source] io::Error),
        #[error("env var substitution failed")]
        Substitution(#[from] InvalidSubstitutionError),
        #[error("invalid TOML")]
        InvalidToml(#[from] toml::de::Error),
        #[error("invalid receiver config")]
        InvalidConfig(#[source] toml::de::Error),
    }

    #[derive(Error, Debug, PartialEq)]
    pub enum InvalidSubstitutionError {
        #[error("the environment variable {0} does not exist")]
        Missing(String),
        #[error("value of env var {0} is not valid UTF-8")]
        InvalidValue(String),
        #[error("env var name '{0}' is not valid")]
        InvalidName(String),
        #[error("wrong use of the substitution syntax, it should be ${{ENV_VAR}}")]
        WrongSyntax,
    }
}
