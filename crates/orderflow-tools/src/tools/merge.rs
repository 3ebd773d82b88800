//! Merge (upsert) a source table into a target table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::context::{RunContext, TableSource};
use crate::error::ToolError;
use crate::registry::Operator;
use crate::result::StepOutput;
use crate::table::{quote_identifier, Table};
use crate::warehouse::Warehouse;

/// What happens to a target row whose conflict columns match a source row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Overwrite the listed columns with the source values.
    #[default]
    Update,
    /// Leave the target row untouched.
    Ignore,
}

impl FromStr for MergeMode {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "update" => Ok(Self::Update),
            "ignore" => Ok(Self::Ignore),
            other => Err(ToolError::Configuration(format!(
                "unknown conflict mode '{}' (expected update or ignore)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Update => write!(f, "update"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

/// Conflict resolution rules for a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    /// Columns that identify a row in the target.
    pub target_conflict_columns: Vec<String>,

    /// Columns overwritten on conflict in `update` mode.
    pub columns: Vec<String>,

    #[serde(default)]
    pub if_conflicts: MergeMode,
}

impl ConflictPolicy {
    pub fn new<K, C>(target_conflict_columns: K, columns: C, if_conflicts: MergeMode) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            target_conflict_columns: target_conflict_columns.into_iter().map(Into::into).collect(),
            columns: columns.into_iter().map(Into::into).collect(),
            if_conflicts,
        }
    }
}

/// Row counts written by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub updated: usize,
    pub inserted: usize,
}

/// Merge step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merge {
    /// Durable target table.
    pub target_table: Table,

    /// Rows to merge in.
    pub source_table: TableSource,

    pub policy: ConflictPolicy,
}

impl Merge {
    pub fn new(target_table: Table, source_table: impl Into<TableSource>, policy: ConflictPolicy) -> Self {
        Self {
            target_table,
            source_table: source_table.into(),
            policy,
        }
    }
}

#[async_trait]
impl Operator for Merge {
    fn kind(&self) -> &'static str {
        "merge"
    }

    fn inputs(&self) -> Vec<TableSource> {
        vec![self.source_table.clone()]
    }

    fn validate(&self) -> Result<(), ToolError> {
        if self.target_table.name.is_none() {
            return Err(ToolError::Configuration(
                "merge target table must be named".to_string(),
            ));
        }
        if self.policy.target_conflict_columns.is_empty() {
            return Err(ToolError::ConflictColumnMissing(
                "at least one target conflict column is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.policy.target_conflict_columns {
            if !seen.insert(col.to_lowercase()) {
                return Err(ToolError::Configuration(format!(
                    "conflict column '{}' listed twice",
                    col
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StepOutput, ToolError> {
        self.validate()?;
        let source = ctx.resolve_table(&self.source_table)?;
        let target = self.target_table.clone();
        if source.conn_id != target.conn_id {
            return Err(ToolError::ConnectionError(format!(
                "merge source {} and target {} are on different connections",
                source, target
            )));
        }

        let warehouse = ctx.connections.warehouse(&target.conn_id)?;
        let source_name = source.require_name()?.to_string();
        let target_name = target.require_name()?.to_string();
        let policy = self.policy.clone();

        let stats = warehouse
            .run_blocking(move |wh| merge_tables(wh, &source_name, &target_name, &policy))
            .await?;

        tracing::info!(
            step = %ctx.step,
            source = %source,
            target = %target,
            mode = %self.policy.if_conflicts,
            updated = stats.updated,
            inserted = stats.inserted,
            "Merge committed"
        );
        Ok(StepOutput::Table(target))
    }
}

/// Upsert `source` into `target` inside one transaction.
///
/// Matching rows get the listed columns overwritten (`update`) or are left
/// alone (`ignore`). Unmatched rows are inserted with every source column
/// the target also has.
pub fn merge_tables(
    wh: &Warehouse,
    source: &str,
    target: &str,
    policy: &ConflictPolicy,
) -> Result<MergeStats, ToolError> {
    if !wh.table_exists(target)? {
        return Err(ToolError::TableNotFound(format!("merge target {}", target)));
    }
    let source_cols = wh.columns(source)?;
    let target_cols = wh.columns(target)?;
    fn has(cols: &[String], name: &str) -> bool {
        cols.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    for key in &policy.target_conflict_columns {
        if !has(&source_cols, key) {
            return Err(ToolError::ConflictColumnMissing(format!(
                "'{}' not in source table {}",
                key, source
            )));
        }
        if !has(&target_cols, key) {
            return Err(ToolError::ConflictColumnMissing(format!(
                "'{}' not in target table {}",
                key, target
            )));
        }
    }
    for col in &policy.columns {
        if !has(&source_cols, col) || !has(&target_cols, col) {
            return Err(ToolError::ColumnNotFound(format!(
                "merge column '{}' must exist in both {} and {}",
                col, source, target
            )));
        }
    }

    let src = quote_identifier(source);
    let tgt = quote_identifier(target);
    let matches = policy
        .target_conflict_columns
        .iter()
        .map(|k| format!("t.{0} = s.{0}", quote_identifier(k)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let insert_cols: Vec<String> = source_cols
        .iter()
        .filter(|c| has(&target_cols, c.as_str()))
        .map(|c| quote_identifier(c))
        .collect();
    let insert_sql = format!(
        "INSERT INTO {tgt} ({cols}) SELECT {src_cols} FROM {src} AS s \
         WHERE NOT EXISTS (SELECT 1 FROM {tgt} AS t WHERE {matches})",
        cols = insert_cols.join(", "),
        src_cols = insert_cols
            .iter()
            .map(|c| format!("s.{}", c))
            .collect::<Vec<_>>()
            .join(", "),
    );

    let update_sql = match policy.if_conflicts {
        MergeMode::Update if !policy.columns.is_empty() => Some(format!(
            "UPDATE {tgt} AS t SET {sets} FROM {src} AS s WHERE {matches}",
            sets = policy
                .columns
                .iter()
                .map(|c| format!("{0} = s.{0}", quote_identifier(c)))
                .collect::<Vec<_>>()
                .join(", "),
        )),
        _ => None,
    };

    tracing::debug!(update = ?update_sql, insert = %insert_sql, "Merge statements");

    wh.with_conn(|conn| {
        let tx = conn.transaction()?;
        let updated = match &update_sql {
            Some(sql) => tx.execute(sql, duckdb::params![])?,
            None => 0,
        };
        let inserted = tx.execute(&insert_sql, duckdb::params![])?;
        tx.commit()?;
        Ok(MergeStats { updated, inserted })
    })
}
