//! Pipeline definition.
//!
//! A [`Pipeline`] is built explicitly: every step call appends a node to the
//! DAG and hands back an opaque handle carrying the node id. Nothing runs
//! until the pipeline is given to an [`Orchestrator`](crate::Orchestrator).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use orderflow_tools::tools::{Cleanup, DataframeTransform, LoadFile, Merge, SqlTransform};
use orderflow_tools::{Operator, RetryConfig, StepConfig, TableSource};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::schedule::Schedule;

/// When a step may start, given its direct upstream states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every upstream reached success.
    #[default]
    AllSuccess,
    /// Every upstream is finished, whatever the outcome.
    AllDone,
}

impl std::fmt::Display for TriggerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllSuccess => write!(f, "all_success"),
            Self::AllDone => write!(f, "all_done"),
        }
    }
}

/// Anything that names a node in a pipeline.
pub trait NodeRef {
    fn node_id(&self) -> &str;
}

/// Deferred reference to a table a step will produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle {
    node: String,
}

/// Deferred reference to a non-table result (frame, column, report).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataHandle {
    node: String,
}

impl NodeRef for TableHandle {
    fn node_id(&self) -> &str {
        &self.node
    }
}

impl NodeRef for DataHandle {
    fn node_id(&self) -> &str {
        &self.node
    }
}

impl NodeRef for str {
    fn node_id(&self) -> &str {
        self
    }
}

impl NodeRef for String {
    fn node_id(&self) -> &str {
        self
    }
}

impl From<&TableHandle> for TableSource {
    fn from(handle: &TableHandle) -> Self {
        TableSource::Upstream(handle.node.clone())
    }
}

impl From<TableHandle> for TableSource {
    fn from(handle: TableHandle) -> Self {
        TableSource::Upstream(handle.node)
    }
}

impl From<&DataHandle> for TableSource {
    fn from(handle: &DataHandle) -> Self {
        TableSource::Upstream(handle.node.clone())
    }
}

/// A step in the graph.
pub struct Node {
    pub id: String,
    pub operator: Arc<dyn Operator>,
    pub trigger_rule: TriggerRule,
    pub config: StepConfig,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.operator.kind())
            .field("trigger_rule", &self.trigger_rule)
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    id: String,
    start_date: Option<NaiveDate>,
    schedule: String,
    catchup: bool,
    default_retry: Option<RetryConfig>,
    default_timeout: Option<u64>,
}

impl PipelineBuilder {
    pub fn start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = expression.into();
        self
    }

    pub fn catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    /// Retry policy for steps without their own.
    pub fn default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = Some(retry);
        self
    }

    /// Timeout (seconds) for steps without their own.
    pub fn default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout = Some(seconds);
        self
    }

    pub fn build(self) -> EngineResult<Pipeline> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("pipeline id must not be empty".into()));
        }
        let start_date = self
            .start_date
            .ok_or_else(|| EngineError::Validation(format!("pipeline '{}' has no start date", self.id)))?;
        let schedule = Schedule::parse(&self.schedule)?;

        Ok(Pipeline {
            id: self.id,
            start_date,
            schedule,
            catchup: self.catchup,
            default_retry: self.default_retry,
            default_timeout: self.default_timeout,
            graph: DiGraph::new(),
            index: HashMap::new(),
        })
    }
}

/// A declared pipeline: identity, schedule and step graph.
#[derive(Debug)]
pub struct Pipeline {
    pub id: String,
    pub start_date: NaiveDate,
    pub schedule: Schedule,
    pub catchup: bool,
    default_retry: Option<RetryConfig>,
    default_timeout: Option<u64>,
    graph: DiGraph<Node, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Pipeline {
    pub fn builder(id: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            id: id.into(),
            start_date: None,
            schedule: "@daily".to_string(),
            catchup: false,
            default_retry: None,
            default_timeout: None,
        }
    }

    /// Load a file into a table.
    pub fn load_file(&mut self, op: LoadFile) -> EngineResult<TableHandle> {
        let node = self.add_step("load_file", op, TriggerRule::AllSuccess)?;
        Ok(TableHandle { node })
    }

    /// SQL transform; the node id is the transform's name.
    pub fn transform(&mut self, op: SqlTransform) -> EngineResult<TableHandle> {
        let name = op.name.clone();
        let node = self.add_step(&name, op, TriggerRule::AllSuccess)?;
        Ok(TableHandle { node })
    }

    /// Tabular transform; the node id is the transform's name.
    pub fn dataframe(&mut self, op: DataframeTransform) -> EngineResult<DataHandle> {
        let name = op.name.clone();
        let node = self.add_step(&name, op, TriggerRule::AllSuccess)?;
        Ok(DataHandle { node })
    }

    pub fn merge(&mut self, op: Merge) -> EngineResult<TableHandle> {
        let node = self.add_step("merge", op, TriggerRule::AllSuccess)?;
        Ok(TableHandle { node })
    }

    /// Cleanup runs once its upstreams are done, whatever their outcome.
    pub fn cleanup(&mut self, op: Cleanup) -> EngineResult<DataHandle> {
        let node = self.add_step("cleanup", op, TriggerRule::AllDone)?;
        Ok(DataHandle { node })
    }

    /// Append a node. Upstream table sources become edges.
    ///
    /// The operator is validated here so definition errors (such as an
    /// unbound placeholder) surface before anything runs.
    pub fn add_step<O>(&mut self, name: &str, op: O, trigger_rule: TriggerRule) -> EngineResult<String>
    where
        O: Operator + 'static,
    {
        op.validate()?;

        let upstream = op
            .inputs()
            .iter()
            .filter_map(|source| source.upstream_node().map(str::to_string))
            .map(|id| self.lookup(&id))
            .collect::<EngineResult<Vec<_>>>()?;

        let id = self.unique_id(name);
        let idx = self.graph.add_node(Node {
            id: id.clone(),
            operator: Arc::new(op),
            trigger_rule,
            config: StepConfig::default(),
        });
        self.index.insert(id.clone(), idx);
        for up in upstream {
            self.graph.update_edge(up, idx, ());
        }

        tracing::debug!(pipeline = %self.id, node = %id, "Step added");
        Ok(id)
    }

    /// Declare an ordering edge that carries no data.
    pub fn set_downstream<U, D>(&mut self, upstream: &U, downstream: &D) -> EngineResult<()>
    where
        U: NodeRef + ?Sized,
        D: NodeRef + ?Sized,
    {
        let up = self.lookup(upstream.node_id())?;
        let down = self.lookup(downstream.node_id())?;
        if up == down || has_path_connecting(&self.graph, down, up, None) {
            return Err(EngineError::Cycle(format!(
                "{} >> {}",
                upstream.node_id(),
                downstream.node_id()
            )));
        }
        self.graph.update_edge(up, down, ());
        Ok(())
    }

    pub fn set_step_config<N: NodeRef + ?Sized>(&mut self, node: &N, config: StepConfig) -> EngineResult<()> {
        let idx = self.lookup(node.node_id())?;
        self.graph[idx].config = config;
        Ok(())
    }

    pub fn set_trigger_rule<N: NodeRef + ?Sized>(&mut self, node: &N, rule: TriggerRule) -> EngineResult<()> {
        let idx = self.lookup(node.node_id())?;
        self.graph[idx].trigger_rule = rule;
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct upstream node ids, sorted.
    pub fn upstream_of(&self, id: &str) -> EngineResult<Vec<String>> {
        let idx = self.lookup(id)?;
        let mut ids: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|up| self.graph[up].id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Retry policy in effect for a node.
    pub fn retry_for(&self, node: &Node) -> Option<RetryConfig> {
        node.config.retry.clone().or_else(|| self.default_retry.clone())
    }

    /// Timeout (seconds) in effect for a node.
    pub fn timeout_for(&self, node: &Node) -> Option<u64> {
        node.config.timeout.or(self.default_timeout)
    }

    /// Node ids in topological order.
    pub fn topological_order(&self) -> EngineResult<Vec<String>> {
        Ok(self
            .sorted()?
            .into_iter()
            .map(|idx| self.graph[idx].id.clone())
            .collect())
    }

    /// Group nodes into waves: a node's wave is one past its deepest upstream.
    pub fn waves(&self) -> EngineResult<Vec<Vec<String>>> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        for idx in self.sorted()? {
            let depth = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|up| level.get(&up))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(self.graph[idx].id.clone());
        }
        Ok(waves)
    }

    /// Serializable description of the declared graph.
    pub fn graph(&self) -> EngineResult<PipelineGraph> {
        let order = self.sorted()?;
        let nodes = order
            .iter()
            .map(|idx| {
                let node = &self.graph[*idx];
                let mut upstream: Vec<String> = self
                    .graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .map(|up| self.graph[up].id.clone())
                    .collect();
                upstream.sort();
                GraphNode {
                    id: node.id.clone(),
                    kind: node.operator.kind().to_string(),
                    trigger_rule: node.trigger_rule,
                    upstream,
                }
            })
            .collect();

        let mut edges: Vec<GraphEdge> = self
            .graph
            .edge_references()
            .map(|e| GraphEdge {
                from: self.graph[e.source()].id.clone(),
                to: self.graph[e.target()].id.clone(),
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        Ok(PipelineGraph {
            id: self.id.clone(),
            schedule: self.schedule.expression().to_string(),
            start_date: self.start_date,
            catchup: self.catchup,
            nodes,
            edges,
        })
    }

    fn sorted(&self) -> EngineResult<Vec<NodeIndex>> {
        toposort(&self.graph, None)
            .map_err(|cycle| EngineError::Cycle(self.graph[cycle.node_id()].id.clone()))
    }

    fn lookup(&self, id: &str) -> EngineResult<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))
    }

    fn unique_id(&self, base: &str) -> String {
        if !self.index.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}__{}", base, n))
            .find(|candidate| !self.index.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

/// Graph description for display and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub id: String,
    pub schedule: String,
    pub start_date: NaiveDate,
    pub catchup: bool,
    /// Nodes in topological order.
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: String,
    pub trigger_rule: TriggerRule,
    pub upstream: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}
