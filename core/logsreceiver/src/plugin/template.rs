//! Parsed representation of a template pipeline, and parameter substitution.
//!
//! The pipeline of a template is parsed once, when the template file is loaded.
//! Each string is split into literal text and `{{parameter}}` placeholders, so that
//! instantiating the template is a simple walk over the tree.

use std::collections::BTreeSet;

/// Maximum length of a placeholder name.
const MAX_PARAM_NAME_LEN: usize = 128;

/// A TOML value in which some strings contain placeholders.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    /// A value without any placeholder.
    Literal(toml::Value),
    /// A string with at least one placeholder.
    Text(Vec<Segment>),
    Array(Vec<Node>),
    Table(Vec<(String, Node)>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TemplateError {
    #[error("unclosed placeholder in \"{0}\"")]
    UnclosedPlaceholder(String),
    #[error("invalid parameter name '{0}'")]
    InvalidParameterName(String),
    #[error("parameter '{0}' is declared both as required and optional")]
    AmbiguousParameter(String),
    #[error("placeholder {{{{{0}}}}} does not refer to a declared parameter")]
    UndeclaredParameter(String),
    #[error("the template does not define any operator")]
    EmptyPipeline,
}

impl Node {
    /// Parses a TOML value, looking for placeholders in strings.
    pub fn parse(value: toml::Value) -> Result<Node, TemplateError> {
        match value {
            toml::Value::String(s) => {
                let segments = parse_text(&s)?;
                if segments.iter().any(|s| matches!(s, Segment::Param(_))) {
                    Ok(Node::Text(segments))
                } else {
                    Ok(Node::Literal(toml::Value::String(s)))
                }
            }
            toml::Value::Array(values) => {
                let nodes = values.into_iter().map(Node::parse).collect::<Result<Vec<_>, _>>()?;
                Ok(Node::Array(nodes))
            }
            toml::Value::Table(table) => Node::parse_table(table),
            scalar => Ok(Node::Literal(scalar)),
        }
    }

    pub fn parse_table(table: toml::Table) -> Result<Node, TemplateError> {
        let mut entries = Vec::with_capacity(table.len());
        for (key, value) in table {
            entries.push((key, Node::parse(value)?));
        }
        Ok(Node::Table(entries))
    }

    /// Collects the names of the parameters used in this node.
    pub fn collect_params<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Node::Literal(_) => (),
            Node::Text(segments) => {
                for s in segments {
                    if let Segment::Param(p) = s {
                        out.insert(p.as_str());
                    }
                }
            }
            Node::Array(nodes) => {
                for n in nodes {
                    n.collect_params(out);
                }
            }
            Node::Table(entries) => {
                for (_, n) in entries {
                    n.collect_params(out);
                }
            }
        }
    }

    /// Produces a new TOML value by replacing the placeholders.
    ///
    /// A string that only contains one placeholder is replaced by the value of
    /// the parameter, which keeps its type. Other strings are interpolated.
    ///
    /// `lookup` must return a value for every parameter of the node.
    pub fn render<'v>(&self, lookup: &impl Fn(&str) -> Option<&'v toml::Value>) -> toml::Value {
        match self {
            Node::Literal(v) => v.clone(),
            Node::Text(segments) => {
                if let [Segment::Param(p)] = segments.as_slice() {
                    if let Some(v) = lookup(p) {
                        return v.clone();
                    }
                }
                let mut res = String::new();
                for s in segments {
                    match s {
                        Segment::Literal(text) => res.push_str(text),
                        Segment::Param(p) => {
                            if let Some(v) = lookup(p) {
                                push_value(&mut res, v);
                            }
                        }
                    }
                }
                toml::Value::String(res)
            }
            Node::Array(nodes) => toml::Value::Array(nodes.iter().map(|n| n.render(lookup)).collect()),
            Node::Table(entries) => {
                let mut table = toml::Table::with_capacity(entries.len());
                for (key, n) in entries {
                    table.insert(key.clone(), n.render(lookup));
                }
                toml::Value::Table(table)
            }
        }
    }
}

fn push_value(out: &mut String, value: &toml::Value) {
    match value {
        toml::Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

/// Splits a string into literal text and placeholders.
///
/// A placeholder is written `{{name}}`, spaces around the name are ignored.
fn parse_text(mut input: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    while let Some(begin) = input.find("{{") {
        let after_open = &input[begin + 2..];
        let end = after_open
            .find("}}")
            .ok_or_else(|| TemplateError::UnclosedPlaceholder(input.to_owned()))?;
        let name = after_open[..end].trim();
        check_param_name(name)?;
        if begin > 0 {
            segments.push(Segment::Literal(input[..begin].to_owned()));
        }
        segments.push(Segment::Param(name.to_owned()));
        input = &after_open[end + 2..];
    }
    if !input.is_empty() {
        segments.push(Segment::Literal(input.to_owned()));
    }
    Ok(segments)
}

/// Checks that a parameter name is made of ASCII letters, digits, `_` and `-`.
pub(crate) fn check_param_name(name: &str) -> Result<(), TemplateError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_PARAM_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TemplateError::InvalidParameterName(name.to_owned()))
    }
}
