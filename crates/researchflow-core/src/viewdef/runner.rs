//! Runs ViewDefinitions against a [`FhirSource`].
//!
//! Resources are transformed in fixed-size batches on blocking worker
//! threads; batch results are concatenated in fetch order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::cache::{CacheKey, ViewCache};
use super::fhirpath::{EvalContext, FhirPath};
use super::model::{collect_columns, SelectNode, ViewDefinition};
use super::source::FhirSource;
use super::ViewError;

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewResult {
    pub view_name: String,
    pub resource_type: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub resource_count: usize,
    pub from_cache: bool,
    pub elapsed_ms: u64,
}

impl ViewResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

struct CompiledColumn {
    name: String,
    path: FhirPath,
    collection: bool,
}

enum CompiledNode {
    Column(Vec<CompiledColumn>),
    Select(Vec<CompiledNode>),
    UnionAll(Vec<CompiledNode>),
    ForEach {
        path: FhirPath,
        body: Vec<CompiledNode>,
        or_null: bool,
        /// Columns filled with nulls when `or_null` and the path is empty.
        null_columns: Vec<String>,
    },
}

type Row = Vec<(String, Value)>;

/// A validated view with every path parsed once.
pub struct CompiledView {
    resource_type: String,
    columns: Vec<String>,
    select: Vec<CompiledNode>,
    where_: Vec<FhirPath>,
    constants: HashMap<String, Value>,
}

fn compile_nodes(nodes: &[SelectNode]) -> Result<Vec<CompiledNode>, ViewError> {
    nodes.iter().map(compile_node).collect()
}

fn compile_node(node: &SelectNode) -> Result<CompiledNode, ViewError> {
    Ok(match node {
        SelectNode::Column(cols) => CompiledNode::Column(
            cols.iter()
                .map(|c| {
                    Ok(CompiledColumn {
                        name: c.name.clone(),
                        path: FhirPath::parse(&c.path)?,
                        collection: c.collection,
                    })
                })
                .collect::<Result<_, ViewError>>()?,
        ),
        SelectNode::Select(children) => CompiledNode::Select(compile_nodes(children)?),
        SelectNode::UnionAll(branches) => CompiledNode::UnionAll(compile_nodes(branches)?),
        SelectNode::ForEach { path, select } | SelectNode::ForEachOrNull { path, select } => {
            CompiledNode::ForEach {
                path: FhirPath::parse(path)?,
                body: compile_nodes(select)?,
                or_null: matches!(node, SelectNode::ForEachOrNull { .. }),
                null_columns: collect_columns(select).iter().map(|c| c.name.clone()).collect(),
            }
        }
    })
}

impl CompiledView {
    pub fn compile(view: &ViewDefinition) -> Result<Self, ViewError> {
        view.validate()?;
        Ok(Self {
            resource_type: view.resource.clone(),
            columns: view.column_names(),
            select: compile_nodes(&view.select)?,
            where_: view
                .where_
                .iter()
                .map(|w| FhirPath::parse(&w.path))
                .collect::<Result<_, _>>()?,
            constants: view
                .constant
                .iter()
                .map(|c| (c.name.clone(), c.value.clone()))
                .collect(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows for one resource, ordered by `columns`.
    pub fn transform(&self, resource: &Value) -> Result<Vec<Vec<Value>>, ViewError> {
        if resource.get("resourceType").and_then(|t| t.as_str()) != Some(self.resource_type.as_str()) {
            return Ok(Vec::new());
        }
        let ctx = EvalContext {
            resource,
            constants: &self.constants,
        };
        for clause in &self.where_ {
            if !clause.test(resource, &ctx)? {
                return Ok(Vec::new());
            }
        }

        let rows = cross(&self.select, resource, &ctx)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                self.columns
                    .iter()
                    .map(|name| {
                        row.iter()
                            .find(|(n, _)| n == name)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect())
    }

    pub fn transform_batch(&self, resources: &[Value]) -> Result<Vec<Vec<Value>>, ViewError> {
        let mut out = Vec::new();
        for resource in resources {
            out.extend(self.transform(resource)?);
        }
        Ok(out)
    }
}

/// Cross-join the row sets of sibling nodes.
fn cross(nodes: &[CompiledNode], focus: &Value, ctx: &EvalContext<'_>) -> Result<Vec<Row>, ViewError> {
    let mut rows: Vec<Row> = vec![Vec::new()];
    for node in nodes {
        let node_rows = process(node, focus, ctx)?;
        let mut next = Vec::with_capacity(rows.len() * node_rows.len());
        for left in &rows {
            for right in &node_rows {
                let mut combined = left.clone();
                combined.extend(right.iter().cloned());
                next.push(combined);
            }
        }
        rows = next;
        if rows.is_empty() {
            break;
        }
    }
    Ok(rows)
}

fn process(node: &CompiledNode, focus: &Value, ctx: &EvalContext<'_>) -> Result<Vec<Row>, ViewError> {
    match node {
        CompiledNode::Column(cols) => {
            let mut row = Vec::with_capacity(cols.len());
            for col in cols {
                let values = col.path.evaluate(focus, ctx)?;
                let value = if col.collection {
                    Value::Array(values)
                } else {
                    values.into_iter().next().unwrap_or(Value::Null)
                };
                row.push((col.name.clone(), value));
            }
            Ok(vec![row])
        }
        CompiledNode::Select(children) => cross(children, focus, ctx),
        CompiledNode::UnionAll(branches) => {
            let mut rows = Vec::new();
            for branch in branches {
                rows.extend(process(branch, focus, ctx)?);
            }
            Ok(rows)
        }
        CompiledNode::ForEach {
            path,
            body,
            or_null,
            null_columns,
        } => {
            let items = path.evaluate(focus, ctx)?;
            if items.is_empty() {
                return Ok(if *or_null {
                    vec![null_columns.iter().map(|n| (n.clone(), Value::Null)).collect()]
                } else {
                    Vec::new()
                });
            }
            let mut rows = Vec::new();
            for item in &items {
                rows.extend(cross(body, item, ctx)?);
            }
            Ok(rows)
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct ViewRunner {
    source: Arc<dyn FhirSource>,
    cache: Arc<ViewCache>,
    batch_size: usize,
    max_parallel: usize,
}

impl ViewRunner {
    pub fn new(source: Arc<dyn FhirSource>, cache_ttl: Duration) -> Self {
        Self {
            source,
            cache: Arc::new(ViewCache::new(cache_ttl)),
            batch_size: DEFAULT_BATCH_SIZE,
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn cache(&self) -> &ViewCache {
        &self.cache
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub async fn run(
        &self,
        view: &ViewDefinition,
        search_params: &[(String, String)],
    ) -> Result<ViewResult, ViewError> {
        let compiled = Arc::new(CompiledView::compile(view)?);
        let key = CacheKey::for_view(view, search_params);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!("[ViewRunner] Cache hit for view {}", view.name);
            let mut result = (*cached).clone();
            result.from_cache = true;
            return Ok(result);
        }

        let started = Instant::now();
        let resources = self.source.search(&view.resource, search_params).await?;
        let resource_count = resources.len();
        let rows = self.transform_parallel(compiled.clone(), resources).await?;

        let result = ViewResult {
            view_name: view.name.clone(),
            resource_type: view.resource.clone(),
            columns: compiled.columns().to_vec(),
            rows,
            resource_count,
            from_cache: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "[ViewRunner] View {} produced {} rows from {} {} resources in {}ms",
            view.name,
            result.rows.len(),
            resource_count,
            view.resource,
            result.elapsed_ms
        );
        self.cache.insert(key, Arc::new(result.clone()));
        Ok(result)
    }

    async fn transform_parallel(
        &self,
        compiled: Arc<CompiledView>,
        resources: Vec<Value>,
    ) -> Result<Vec<Vec<Value>>, ViewError> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::new();
        let mut remaining = resources;

        while !remaining.is_empty() {
            let rest = remaining.split_off(self.batch_size.min(remaining.len()));
            let batch = std::mem::replace(&mut remaining, rest);
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ViewError::Eval(e.to_string()))?;
            let view = compiled.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let rows = view.transform_batch(&batch);
                drop(permit);
                rows
            }));
        }

        let mut rows = Vec::new();
        for handle in handles {
            let batch_rows = handle
                .await
                .map_err(|e| ViewError::Eval(format!("transform worker failed: {}", e)))??;
            rows.extend(batch_rows);
        }
        Ok(rows)
    }
}
