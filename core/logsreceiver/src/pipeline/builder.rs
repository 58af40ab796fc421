//! Construction of pipelines from their configuration.

use rustc_hash::FxHashSet;

use crate::{
    operator::{Capability, registry::OperatorRegistry},
    plugin::{InstantiateError, TemplateSet},
};

use super::{BuiltOperator, Pipeline, error::BuildError};

/// Maximum nesting of plugins: a plugin whose pipeline references a plugin, that
/// references a plugin, and so on.
pub const MAX_PLUGIN_DEPTH: usize = 16;

/// Builds pipelines from a list of operator configurations.
///
/// The `type` of each operator is looked up in the [`OperatorRegistry`] first, then in
/// the plugin templates. The builder only reads the registry and the templates, which
/// makes it possible to build multiple pipelines from the same registry.
pub struct PipelineBuilder<'a> {
    registry: &'a OperatorRegistry,
    templates: Option<&'a TemplateSet>,
}

/// An operator whose type has been resolved to a registered operator.
struct Resolved<'r> {
    id: String,
    type_name: String,
    capability: Capability,
    config: toml::Table,
    registry_entry: &'r crate::operator::registry::OperatorMetadata,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(registry: &'a OperatorRegistry) -> Self {
        Self {
            registry,
            templates: None,
        }
    }

    /// Makes the plugin templates available to the pipeline.
    pub fn with_templates(mut self, templates: &'a TemplateSet) -> Self {
        for name in templates.names() {
            if self.registry.contains(name) {
                log::warn!("Plugin '{name}' has the same name as a built-in operator, it will never be used.");
            }
        }
        self.templates = Some(templates);
        self
    }

    /// Builds a pipeline.
    ///
    /// Each config must contain a `type` and can contain an `id`. The other keys are
    /// given to the operator (or to the plugin, as parameters).
    ///
    /// The operators are created but not started.
    pub fn build(&self, configs: &[toml::Table]) -> Result<Pipeline, BuildError> {
        // expand the plugins
        let mut resolved = Vec::with_capacity(configs.len());
        let mut plugin_stack = Vec::new();
        self.resolve_all(configs, None, &mut plugin_stack, &mut resolved)?;

        // check the chain before creating anything
        if resolved.is_empty() {
            return Err(BuildError::EmptyPipeline);
        }
        let mut ids = FxHashSet::default();
        for r in &resolved {
            if !ids.insert(r.id.as_str()) {
                return Err(BuildError::DuplicateId(r.id.clone()));
            }
        }
        let last = resolved.len() - 1;
        for (i, r) in resolved.iter().enumerate() {
            let expected = match r.capability {
                Capability::Input if i != 0 => "first",
                Capability::Output if i != last => "last",
                _ => continue,
            };
            return Err(BuildError::Misplaced {
                id: r.id.clone(),
                capability: r.capability,
                expected,
            });
        }
        if resolved[0].capability != Capability::Input {
            log::debug!(
                "The pipeline does not start with an input (first operator: '{}'), entries must be sent to it directly.",
                resolved[0].id
            );
        }

        // create the operators
        let mut operators = Vec::with_capacity(resolved.len());
        for r in resolved {
            let operator = (r.registry_entry.build)(&r.id, r.config).map_err(|source| BuildError::InvalidConfig {
                id: r.id.clone(),
                type_name: r.type_name.clone(),
                source,
            })?;
            log::debug!("Operator '{}' of type '{}' built.", r.id, r.type_name);
            operators.push(BuiltOperator {
                id: r.id,
                type_name: r.type_name,
                capability: r.capability,
                operator,
            });
        }
        Ok(Pipeline { operators })
    }

    /// Resolves the type of each config, and expands the plugins recursively.
    ///
    /// `parent` is the id of the plugin operator that contains the configs, if any.
    fn resolve_all(
        &self,
        configs: &[toml::Table],
        parent: Option<&str>,
        plugin_stack: &mut Vec<String>,
        out: &mut Vec<Resolved<'a>>,
    ) -> Result<(), BuildError> {
        let location = || match parent {
            Some(p) => format!("plugin operator '{p}'"),
            None => String::from("the pipeline"),
        };

        for (index, config) in configs.iter().enumerate() {
            let mut config = config.clone();
            let type_name = match config.remove("type") {
                Some(toml::Value::String(t)) => t,
                Some(bad) => {
                    return Err(BuildError::NotAString {
                        key: "type",
                        index,
                        location: location(),
                        actual: bad.type_str(),
                    });
                }
                None => {
                    return Err(BuildError::MissingType {
                        index,
                        location: location(),
                    });
                }
            };
            let local_id = match config.remove("id") {
                Some(toml::Value::String(id)) => id,
                Some(bad) => {
                    return Err(BuildError::NotAString {
                        key: "id",
                        index,
                        location: location(),
                        actual: bad.type_str(),
                    });
                }
                None => type_name.clone(),
            };
            let id = match parent {
                Some(p) => format!("{p}.{local_id}"),
                None => local_id,
            };

            if let Some(metadata) = self.registry.get(&type_name) {
                out.push(Resolved {
                    id,
                    type_name,
                    capability: metadata.capability,
                    config,
                    registry_entry: metadata,
                });
            } else if let Some(template) = self.templates.and_then(|t| t.get(&type_name)) {
                if plugin_stack.contains(&type_name) {
                    plugin_stack.push(type_name.clone());
                    return Err(BuildError::PluginCycle {
                        plugin: type_name,
                        chain: plugin_stack.join(" -> "),
                    });
                }
                if plugin_stack.len() >= MAX_PLUGIN_DEPTH {
                    plugin_stack.push(type_name);
                    return Err(BuildError::PluginTooDeep {
                        max: MAX_PLUGIN_DEPTH,
                        chain: plugin_stack.join(" -> "),
                    });
                }

                let sub_pipeline = template.instantiate(&config).map_err(|e| match e {
                    InstantiateError::MissingParameter(parameter) => BuildError::MissingParameter {
                        id: id.clone(),
                        plugin: type_name.clone(),
                        parameter,
                    },
                    InstantiateError::UnknownParameter(parameter) => BuildError::UnknownParameter {
                        id: id.clone(),
                        plugin: type_name.clone(),
                        parameter,
                    },
                })?;
                log::debug!("Expanding plugin '{type_name}' for operator '{id}'.");

                plugin_stack.push(type_name);
                self.resolve_all(&sub_pipeline, Some(&id), plugin_stack, out)?;
                plugin_stack.pop();
            } else {
                return Err(BuildError::UnknownType { id, type_name });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use crate::{
        operator::{Capability, registry::OperatorRegistry},
        pipeline::error::BuildError,
        plugin::{Template, TemplateSet},
    };

    use super::{MAX_PLUGIN_DEPTH, PipelineBuilder};

    fn template(name: &str, content: &str) -> Template {
        Template::parse(content, name, PathBuf::from(format!("{name}.toml"))).unwrap()
    }

    fn configs(toml_str: &str) -> Vec<toml::Table> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            pipeline: Vec<toml::Table>,
        }
        toml::from_str::<Wrapper>(toml_str).unwrap().pipeline
    }

    #[test]
    fn builtin_chain() {
        let registry = OperatorRegistry::with_builtins();
        let pipeline = PipelineBuilder::new(&registry)
            .build(&configs(
                r#"
                [[pipeline]]
                type = "json_parser"

                [[pipeline]]
                id = "tag"
                type = "add"
                attributes = { a = "b" }

                [[pipeline]]
                type = "drop_output"
                "#,
            ))
            .unwrap();
        assert_eq!(
            pipeline.describe(),
            vec![
                ("json_parser", "json_parser", Capability::Intermediate),
                ("tag", "add", Capability::Intermediate),
                ("drop_output", "drop_output", Capability::Output),
            ]
        );
    }

    #[test]
    fn plugin_ids_are_namespaced() {
        let registry = OperatorRegistry::with_builtins();
        let mut templates = TemplateSet::new();
        templates.insert(template(
            "tagger",
            r#"
            required = ["value"]
            [[pipeline]]
            type = "add"
            attributes = { tag = "{{value}}" }
            [[pipeline]]
            id = "parse"
            type = "json_parser"
            "#,
        ));

        let pipeline = PipelineBuilder::new(&registry)
            .with_templates(&templates)
            .build(&configs(
                r#"
                [[pipeline]]
                type = "tagger"
                value = "one"
                [[pipeline]]
                id = "second"
                type = "tagger"
                value = "two"
                "#,
            ))
            .unwrap();
        let ids: Vec<&str> = pipeline.describe().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec!["tagger.add", "tagger.parse", "second.add", "second.parse"]);
    }

    #[test]
    fn errors() {
        let registry = OperatorRegistry::with_builtins();
        let builder = PipelineBuilder::new(&registry);

        let err = builder.build(&[]).unwrap_err();
        assert!(matches!(err, BuildError::EmptyPipeline));

        let err = builder.build(&configs("[[pipeline]]\nbadparam = \"badvalue\"")).unwrap_err();
        assert!(matches!(err, BuildError::MissingType { index: 0, .. }));

        let err = builder.build(&configs("[[pipeline]]\ntype = 12")).unwrap_err();
        assert!(matches!(err, BuildError::NotAString { key: "type", .. }));

        let err = builder.build(&configs("[[pipeline]]\ntype = \"whodis\"")).unwrap_err();
        assert!(matches!(err, BuildError::UnknownType { ref type_name, .. } if type_name == "whodis"));

        let err = builder
            .build(&configs("[[pipeline]]\ntype = \"json_parser\"\nparse_form = \"body\""))
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig { .. }));
        assert!(format!("{:#}", anyhow::Error::from(err)).contains("parse_form"));

        let err = builder
            .build(&configs(
                "[[pipeline]]\ntype = \"add\"\n[[pipeline]]\ntype = \"add\"",
            ))
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateId(ref id) if id == "add"));

        let err = builder
            .build(&configs(
                "[[pipeline]]\ntype = \"drop_output\"\n[[pipeline]]\ntype = \"add\"",
            ))
            .unwrap_err();
        assert!(matches!(err, BuildError::Misplaced { expected: "last", .. }));
    }

    #[test]
    fn plugin_cycle() {
        let registry = OperatorRegistry::with_builtins();
        let mut templates = TemplateSet::new();
        templates.insert(template("a", "[[pipeline]]\ntype = \"b\""));
        templates.insert(template("b", "[[pipeline]]\ntype = \"a\""));

        let err = PipelineBuilder::new(&registry)
            .with_templates(&templates)
            .build(&configs("[[pipeline]]\ntype = \"a\""))
            .unwrap_err();
        match err {
            BuildError::PluginCycle { plugin, chain } => {
                assert_eq!(plugin, "a");
                assert_eq!(chain, "a -> b -> a");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn plugin_too_deep() {
        let registry = OperatorRegistry::with_builtins();
        let mut templates = TemplateSet::new();
        for i in 0..=MAX_PLUGIN_DEPTH {
            let content = format!("[[pipeline]]\ntype = \"level{}\"", i + 1);
            templates.insert(template(&format!("level{i}"), &content));
        }
        let err = PipelineBuilder::new(&registry)
            .with_templates(&templates)
            .build(&configs("[[pipeline]]\ntype = \"level0\""))
            .unwrap_err();
        assert!(matches!(err, BuildError::PluginTooDeep { max: MAX_PLUGIN_DEPTH, .. }));
    }

    #[test]
    fn deterministic() {
        let registry = OperatorRegistry::with_builtins();
        let config = configs(
            r#"
            [[pipeline]]
            type = "json_parser"
            [[pipeline]]
            type = "add"
            "#,
        );
        let builder = PipelineBuilder::new(&registry);
        let a = builder.build(&config).unwrap();
        let b = builder.build(&config).unwrap();
        assert_eq!(a.describe(), b.describe());
    }
}
