//! Typed ViewDefinition model.
//!
//! The JSON wire shape lets one select element carry `column`, `select`,
//! `unionAll` and `forEach`/`forEachOrNull` together. Internally each
//! element becomes exactly one [`SelectNode`] variant; a multi-key element
//! turns into a `Select` (or a `ForEach` body) holding one node per key.
//! Serialization emits the single-key form, so a saved definition loads
//! back into an identical tree.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::fhirpath::FhirPath;
use super::ViewError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    #[serde(default)]
    pub name: String,
    /// FHIR resource type the view runs over, e.g. `Patient`.
    #[serde(default)]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constant: Vec<Constant>,
    #[serde(default)]
    pub select: Vec<SelectNode>,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<WhereClause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub collection: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            collection: false,
            type_: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named constant referenced from paths as `%name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConstant", into = "RawConstant")]
pub struct Constant {
    pub name: String,
    /// The `value[x]` suffix, e.g. `String`, `Integer`, `Code`.
    pub value_type: String,
    pub value: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct RawConstant {
    name: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<RawConstant> for Constant {
    type Error = String;

    fn try_from(raw: RawConstant) -> Result<Self, Self::Error> {
        let (key, value) = raw
            .rest
            .into_iter()
            .find(|(k, _)| k.starts_with("value") && k.len() > 5)
            .ok_or_else(|| format!("constant '{}' has no value[x]", raw.name))?;
        Ok(Constant {
            name: raw.name,
            value_type: key["value".len()..].to_string(),
            value,
        })
    }
}

impl From<Constant> for RawConstant {
    fn from(c: Constant) -> Self {
        let mut rest = serde_json::Map::new();
        rest.insert(format!("value{}", c.value_type), c.value);
        RawConstant { name: c.name, rest }
    }
}

/// One node of the select tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSelect", into = "RawSelect")]
pub enum SelectNode {
    /// Columns evaluated against the current element.
    Column(Vec<Column>),
    /// Children whose rows are cross-joined.
    Select(Vec<SelectNode>),
    /// Children whose rows are concatenated.
    UnionAll(Vec<SelectNode>),
    /// One row set per element of `path`; no rows when it is empty.
    ForEach { path: String, select: Vec<SelectNode> },
    /// Like `ForEach`, but a single all-null row when `path` is empty.
    ForEachOrNull { path: String, select: Vec<SelectNode> },
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSelect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    column: Option<Vec<Column>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    select: Option<Vec<RawSelect>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    union_all: Option<Vec<RawSelect>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_each: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_each_or_null: Option<String>,
}

fn convert_all(raw: Vec<RawSelect>) -> Result<Vec<SelectNode>, String> {
    raw.into_iter().map(SelectNode::try_from).collect()
}

impl TryFrom<RawSelect> for SelectNode {
    type Error = String;

    fn try_from(raw: RawSelect) -> Result<Self, Self::Error> {
        let RawSelect {
            column,
            select,
            union_all,
            for_each,
            for_each_or_null,
        } = raw;

        if for_each.is_some() && for_each_or_null.is_some() {
            return Err("a select element cannot have both forEach and forEachOrNull".to_string());
        }

        let iteration = match (for_each, for_each_or_null) {
            (Some(path), None) => Some((path, false)),
            (None, Some(path)) => Some((path, true)),
            _ => None,
        };

        // Canonical iteration form: {forEach, select}.
        if let Some((path, or_null)) = iteration {
            let body = match (column, select, union_all) {
                (None, Some(children), None) => convert_all(children)?,
                (column, select, union_all) => {
                    let mut body = Vec::new();
                    if let Some(cols) = column {
                        body.push(SelectNode::Column(cols));
                    }
                    if let Some(children) = select {
                        body.extend(convert_all(children)?);
                    }
                    if let Some(branches) = union_all {
                        body.push(SelectNode::UnionAll(convert_all(branches)?));
                    }
                    body
                }
            };
            return Ok(if or_null {
                SelectNode::ForEachOrNull { path, select: body }
            } else {
                SelectNode::ForEach { path, select: body }
            });
        }

        match (column, select, union_all) {
            (Some(cols), None, None) => Ok(SelectNode::Column(cols)),
            (None, Some(children), None) => Ok(SelectNode::Select(convert_all(children)?)),
            (None, None, Some(branches)) => Ok(SelectNode::UnionAll(convert_all(branches)?)),
            (None, None, None) => Err("empty select element".to_string()),
            (column, select, union_all) => {
                let mut parts = Vec::new();
                if let Some(cols) = column {
                    parts.push(SelectNode::Column(cols));
                }
                if let Some(children) = select {
                    parts.extend(convert_all(children)?);
                }
                if let Some(branches) = union_all {
                    parts.push(SelectNode::UnionAll(convert_all(branches)?));
                }
                Ok(SelectNode::Select(parts))
            }
        }
    }
}

impl From<SelectNode> for RawSelect {
    fn from(node: SelectNode) -> Self {
        let to_raw = |nodes: Vec<SelectNode>| nodes.into_iter().map(RawSelect::from).collect();
        match node {
            SelectNode::Column(cols) => RawSelect {
                column: Some(cols),
                ..Default::default()
            },
            SelectNode::Select(children) => RawSelect {
                select: Some(to_raw(children)),
                ..Default::default()
            },
            SelectNode::UnionAll(branches) => RawSelect {
                union_all: Some(to_raw(branches)),
                ..Default::default()
            },
            SelectNode::ForEach { path, select } => RawSelect {
                for_each: Some(path),
                select: Some(to_raw(select)),
                ..Default::default()
            },
            SelectNode::ForEachOrNull { path, select } => RawSelect {
                for_each_or_null: Some(path),
                select: Some(to_raw(select)),
                ..Default::default()
            },
        }
    }
}

/// Columns a list of sibling nodes produces, in output order.
pub fn collect_columns(nodes: &[SelectNode]) -> Vec<&Column> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            SelectNode::Column(cols) => out.extend(cols.iter()),
            SelectNode::Select(children)
            | SelectNode::ForEach { select: children, .. }
            | SelectNode::ForEachOrNull { select: children, .. } => {
                out.extend(collect_columns(children))
            }
            SelectNode::UnionAll(branches) => {
                if let Some(first) = branches.first() {
                    out.extend(collect_columns(std::slice::from_ref(first)));
                }
            }
        }
    }
    out
}

/// Letters, digits and underscores, not starting with a digit.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ViewDefinition {
    pub fn from_json(json: &str) -> Result<Self, ViewError> {
        serde_json::from_str(json).map_err(|e| ViewError::Invalid(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ViewError> {
        serde_json::from_value(value).map_err(|e| ViewError::Invalid(e.to_string()))
    }

    /// Output column names in order.
    pub fn column_names(&self) -> Vec<String> {
        collect_columns(&self.select)
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Check structure, names and that every path parses.
    pub fn validate(&self) -> Result<(), ViewError> {
        if self.name.trim().is_empty() {
            return Err(ViewError::Invalid("name is required".to_string()));
        }
        if !is_identifier(&self.name) {
            return Err(ViewError::Invalid(format!(
                "name '{}' must be letters, digits and underscores",
                self.name
            )));
        }
        if self.resource.trim().is_empty() {
            return Err(ViewError::Invalid("resource is required".to_string()));
        }
        if self.select.is_empty() {
            return Err(ViewError::Invalid("select must not be empty".to_string()));
        }

        for constant in &self.constant {
            if !is_identifier(&constant.name) {
                return Err(ViewError::Invalid(format!(
                    "invalid constant name '{}'",
                    constant.name
                )));
            }
        }
        for clause in &self.where_ {
            FhirPath::parse(&clause.path)?;
        }

        validate_nodes(&self.select)?;

        let mut seen = HashSet::new();
        for column in collect_columns(&self.select) {
            if !seen.insert(column.name.as_str()) {
                return Err(ViewError::Invalid(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
        }
        Ok(())
    }
}

fn validate_nodes(nodes: &[SelectNode]) -> Result<(), ViewError> {
    for node in nodes {
        match node {
            SelectNode::Column(cols) => {
                if cols.is_empty() {
                    return Err(ViewError::Invalid("column list must not be empty".to_string()));
                }
                for col in cols {
                    if !is_identifier(&col.name) {
                        return Err(ViewError::Invalid(format!(
                            "invalid column name '{}'",
                            col.name
                        )));
                    }
                    FhirPath::parse(&col.path)?;
                }
            }
            SelectNode::Select(children) => validate_nodes(children)?,
            SelectNode::ForEach { path, select } | SelectNode::ForEachOrNull { path, select } => {
                FhirPath::parse(path)?;
                validate_nodes(select)?;
            }
            SelectNode::UnionAll(branches) => {
                if branches.is_empty() {
                    return Err(ViewError::Invalid("unionAll must not be empty".to_string()));
                }
                validate_nodes(branches)?;
                let expected: Vec<&str> = collect_columns(&branches[..1])
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect();
                for branch in &branches[1..] {
                    let names: Vec<&str> = collect_columns(std::slice::from_ref(branch))
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect();
                    if names != expected {
                        return Err(ViewError::Invalid(
                            "unionAll branches must produce the same columns".to_string(),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}
