//! Plugins: operators defined by parameterized pipeline templates.
//!
//! A plugin is a TOML file that describes a reusable sub-pipeline. Once loaded, the name
//! of the plugin can be used as the `type` of an operator, like a built-in operator.
//!
//! ```toml
//! # plugins/nginx_access.toml
//! name = "nginx_access"
//! version = "0.1.0"
//! description = "Receives nginx access logs over HTTP"
//!
//! # parameters that must be given by the pipeline config
//! required = ["listen_address"]
//!
//! # parameters with a default value
//! [optional]
//! environment = "production"
//!
//! [[pipeline]]
//! type = "http_input"
//! listen_address = "{{listen_address}}"
//!
//! [[pipeline]]
//! type = "add"
//! attributes = { env = "{{environment}}" }
//! ```
//!
//! The plugin can then be referenced from the pipeline config:
//! ```toml
//! [[pipeline]]
//! type = "nginx_access"
//! listen_address = "0.0.0.0:8080"
//! ```
//!
//! When a placeholder is the whole string, it is replaced by the parameter value with its
//! original type: `port = "{{port}}"` becomes `port = 8080` if the parameter is an integer.
//!
//! Templates are loaded once per pipeline build, see [`load_dir`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use template::{Node, TemplateError, check_param_name};

pub mod template;

/// An operator defined by a parameterized sub-pipeline.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    /// The file that defines the template.
    pub source: PathBuf,
    required: Vec<String>,
    optional: toml::Table,
    pipeline: Vec<Node>,
}

/// Content of a template file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    optional: toml::Table,
    pipeline: Vec<toml::Table>,
}

/// Error returned by [`Template::instantiate`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InstantiateError {
    #[error("missing parameter '{0}'")]
    MissingParameter(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
}

impl Template {
    /// Parses a template from the content of a TOML file.
    ///
    /// `default_name` is used when the file does not declare a name.
    pub fn parse(content: &str, default_name: &str, source: PathBuf) -> Result<Template, LoadErrorCause> {
        let file: TemplateFile = toml::from_str(content)?;
        let name = file.name.unwrap_or_else(|| default_name.to_owned());
        if name.is_empty() {
            return Err(LoadErrorCause::EmptyName);
        }

        for p in file.required.iter().chain(file.optional.keys()) {
            check_param_name(p)?;
        }
        if let Some(p) = file.required.iter().find(|p| file.optional.contains_key(*p)) {
            return Err(TemplateError::AmbiguousParameter(p.clone()).into());
        }
        if file.pipeline.is_empty() {
            return Err(TemplateError::EmptyPipeline.into());
        }

        let pipeline = file
            .pipeline
            .into_iter()
            .map(Node::parse_table)
            .collect::<Result<Vec<_>, _>>()?;

        let template = Template {
            name,
            version: file.version,
            description: file.description,
            source,
            required: file.required,
            optional: file.optional,
            pipeline,
        };

        // every placeholder must refer to a declared parameter
        let mut used = BTreeSet::new();
        for node in &template.pipeline {
            node.collect_params(&mut used);
        }
        if let Some(undeclared) = used.into_iter().find(|p| !template.is_declared(p)) {
            return Err(TemplateError::UndeclaredParameter(undeclared.to_owned()).into());
        }
        Ok(template)
    }

    /// The names of the required parameters.
    pub fn required_parameters(&self) -> &[String] {
        &self.required
    }

    /// The optional parameters and their default values.
    pub fn optional_parameters(&self) -> &toml::Table {
        &self.optional
    }

    fn is_declared(&self, param: &str) -> bool {
        self.optional.contains_key(param) || self.required.iter().any(|r| r == param)
    }

    /// Creates the configs of the operators of the sub-pipeline, by substituting the
    /// parameters in the template.
    ///
    /// Every required parameter must be present in `params`, and every key of `params`
    /// must be a declared parameter.
    pub fn instantiate(&self, params: &toml::Table) -> Result<Vec<toml::Table>, InstantiateError> {
        if let Some(missing) = self.required.iter().find(|r| !params.contains_key(*r)) {
            return Err(InstantiateError::MissingParameter(missing.clone()));
        }
        if let Some(unknown) = params.keys().find(|k| !self.is_declared(k)) {
            return Err(InstantiateError::UnknownParameter(unknown.clone()));
        }

        let lookup = |name: &str| params.get(name).or_else(|| self.optional.get(name));
        let configs = self
            .pipeline
            .iter()
            .map(|node| match node.render(&lookup) {
                toml::Value::Table(t) => t,
                // the pipeline nodes come from tables
                _ => toml::Table::new(),
            })
            .collect();
        Ok(configs)
    }
}

/// A set of templates, indexed by name.
#[derive(Debug, Default, Clone)]
pub struct TemplateSet(BTreeMap<String, Template>);

impl TemplateSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a template to the set. If a template with the same name exists,
    /// it is replaced and returned.
    pub fn insert(&mut self, template: Template) -> Option<Template> {
        self.0.insert(template.name.clone(), template)
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Loads the templates defined in a directory.
///
/// Every file with the `.toml` extension is loaded, in the lexicographic order of
/// the file names. Subdirectories are ignored.
/// If two files define a template with the same name, the last one wins.
pub fn load_dir(dir: &Path) -> Result<TemplateSet, LoadError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LoadError::DirNotFound(dir.to_owned())),
        Err(e) => {
            return Err(LoadError::Io {
                path: dir.to_owned(),
                source: e,
            });
        }
    };

    let mut files = Vec::new();
    for dir_entry in read_dir {
        let path = dir_entry
            .map_err(|e| LoadError::Io {
                path: dir.to_owned(),
                source: e,
            })?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();

    let mut templates = TemplateSet::new();
    for path in files {
        let template = load_file(&path).map_err(|cause| LoadError::InvalidFile {
            path: path.clone(),
            cause,
        })?;
        log::debug!("Plugin template '{}' loaded from {}", template.name, path.display());
        if let Some(previous) = templates.insert(template) {
            log::warn!(
                "Plugin template '{}' of {} is overridden by {}",
                previous.name,
                previous.source.display(),
                path.display()
            );
        }
    }
    Ok(templates)
}

fn load_file(path: &Path) -> Result<Template, LoadErrorCause> {
    let content = fs::read_to_string(path)?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    Template::parse(&content, stem, path.to_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("plugin dir not found: {0}")]
    DirNotFound(PathBuf),
    #[error("could not read plugin dir {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid plugin file {path}")]
    InvalidFile {
        path: PathBuf,
        #[source]
        cause: LoadErrorCause,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LoadErrorCause {
    #[error("read failed")]
    Read(#[from] io::Error),
    #[error("invalid TOML")]
    InvalidToml(#[from] toml::de::Error),
    #[error("the name of the template cannot be empty")]
    EmptyName,
    #[error("invalid template")]
    InvalidTemplate(#[from] TemplateError),
}
