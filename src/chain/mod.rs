//! Path chain store.
//!
//! Every function call owns one linear, append-only chain of nodes, one per
//! branch condition taken, rooted at a node for [`ROOT_CONDITION`]. Reports for
//! the same call arrive incrementally and at different granularities; this
//! module reconciles them against the stored chain:
//!
//! - no chain yet: the whole target sequence is inserted,
//! - stored chain already covers the target: pure reads, nothing is written,
//! - stored chain is a strict prefix of the target: the missing suffix is
//!   inserted and spliced onto the old terminal node with a single update.
//!
//! Nodes are inserted deepest first so every forward link is known when its
//! row is written. The only link ever rewritten is a terminal one, and only to
//! point at a freshly inserted extension.
//!
//! Callers run [`materialize`] inside the insertion's transaction and under
//! the single-writer gate; the read-decide-write sequence is not safe against
//! a concurrent writer on the same call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::storage::{
    ChainLink, ChainNode, ChainNodeId, ConditionAtomId, FunctionCallId, ROOT_CONDITION,
    TERMINAL_SENTINEL,
};

/// How a target sequence was reconciled with the stored chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChainOutcome {
    /// The stored chain already covered the target; nothing was written.
    Matched,
    /// The call had no chain; one was created for the full target.
    Inserted,
    /// The stored chain ended early and was extended.
    Extended {
        /// Depth of the old terminal node whose link now points at the extension.
        splice_depth: usize,
    },
}

/// Node ids for every position of a target sequence, root first.
///
/// Index `n` holds the node at depth `n`, so a monitored point that reported a
/// path of length `n` is attached to `node_at(n)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedChain {
    nodes: Vec<ChainNodeId>,
    outcome: ChainOutcome,
}

impl MaterializedChain {
    /// All node ids, root first.
    pub fn nodes(&self) -> &[ChainNodeId] {
        &self.nodes
    }

    /// How the chain was reconciled.
    pub fn outcome(&self) -> ChainOutcome {
        self.outcome
    }

    /// Length of the materialized path, excluding the root.
    pub fn path_len(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    /// Node reached by a point whose reported path has `reported_length`
    /// conditions.
    pub fn node_at(&self, reported_length: usize) -> StorageResult<ChainNodeId> {
        self.nodes
            .get(reported_length)
            .copied()
            .ok_or_else(|| StorageError::InvalidPayload {
                field: "reported_length".to_string(),
                reason: format!(
                    "length {} exceeds materialized path length {}",
                    reported_length,
                    self.path_len()
                ),
            })
    }

    /// Deepest node of the materialized path.
    pub fn deepest(&self) -> Option<ChainNodeId> {
        self.nodes.last().copied()
    }
}

/// Make sure `function_call`'s stored chain covers `root + path`, extending it
/// if needed, and return the node id at every depth.
///
/// `path` is the reported condition sequence without the root.
pub async fn materialize(
    conn: &mut SqliteConnection,
    function_call: FunctionCallId,
    path: &[ConditionAtomId],
) -> StorageResult<MaterializedChain> {
    let target: Vec<ConditionAtomId> = std::iter::once(ROOT_CONDITION)
        .chain(path.iter().copied())
        .collect();

    let Some(mut current) = fetch_root(conn, function_call).await? else {
        debug!(
            function_call = %function_call,
            length = target.len(),
            "No chain stored, inserting full path"
        );
        let nodes = insert_run(conn, function_call, &target, 0).await?;
        return Ok(MaterializedChain {
            nodes,
            outcome: ChainOutcome::Inserted,
        });
    };

    let mut nodes = Vec::with_capacity(target.len());
    let mut depth = 0;

    loop {
        let reported = target[depth];
        if current.condition_atom != reported {
            return Err(StorageError::ChainDivergence {
                function_call: function_call.0,
                depth,
                stored: current.condition_atom.0,
                reported: reported.0,
            });
        }
        nodes.push(current.id);

        if depth + 1 == target.len() {
            debug!(
                function_call = %function_call,
                length = target.len(),
                "Stored chain covers path"
            );
            return Ok(MaterializedChain {
                nodes,
                outcome: ChainOutcome::Matched,
            });
        }

        match current.next {
            ChainLink::Next(next_id) => {
                current = fetch_linked(conn, function_call, next_id, depth + 1).await?;
                depth += 1;
            }
            ChainLink::Terminal => {
                debug!(
                    function_call = %function_call,
                    splice_depth = depth,
                    added = target.len() - depth - 1,
                    "Stored chain ends early, extending"
                );
                let extension =
                    insert_run(conn, function_call, &target[depth + 1..], depth + 1).await?;
                splice(conn, function_call, current.id, extension[0]).await?;
                nodes.extend(extension);
                return Ok(MaterializedChain {
                    nodes,
                    outcome: ChainOutcome::Extended {
                        splice_depth: depth,
                    },
                });
            }
        }
    }
}

/// Load a call's chain in link order, root first. Empty if the call has none.
///
/// Fails with [`StorageError::ChainIntegrity`] if the stored rows do not form a
/// single linear chain with consecutive depths and one terminal node.
pub async fn load_chain(
    conn: &mut SqliteConnection,
    function_call: FunctionCallId,
) -> StorageResult<Vec<ChainNode>> {
    let rows: Vec<ChainNodeRow> = sqlx::query_as(
        r#"
        SELECT id, condition_atom, next_node, function_call, depth
        FROM path_chain_node
        WHERE function_call = ?
        "#,
    )
    .bind(function_call)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("path_chain_node", e))?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let total = rows.len();
    let mut by_id = HashMap::with_capacity(total);
    let mut root = None;
    for row in rows {
        let node = row.into_node()?;
        if node.depth == 0 {
            root = Some(node.id);
        }
        by_id.insert(node.id, node);
    }

    let integrity = |message: String| StorageError::ChainIntegrity {
        function_call: function_call.0,
        message,
    };

    let mut cursor = root.ok_or_else(|| integrity("no root node".to_string()))?;
    let mut chain = Vec::with_capacity(total);
    loop {
        let node = by_id
            .remove(&cursor)
            .ok_or_else(|| integrity(format!("link to missing or revisited node {}", cursor)))?;
        if node.depth != chain.len() {
            return Err(integrity(format!(
                "node {} at position {} records depth {}",
                node.id,
                chain.len(),
                node.depth
            )));
        }
        let next = node.next;
        chain.push(node);
        match next {
            ChainLink::Next(id) => cursor = id,
            ChainLink::Terminal => break,
        }
    }

    if !by_id.is_empty() {
        return Err(integrity(format!(
            "{} node(s) unreachable from the root",
            by_id.len()
        )));
    }

    Ok(chain)
}

async fn fetch_root(
    conn: &mut SqliteConnection,
    function_call: FunctionCallId,
) -> StorageResult<Option<ChainNode>> {
    let row: Option<ChainNodeRow> = sqlx::query_as(
        r#"
        SELECT id, condition_atom, next_node, function_call, depth
        FROM path_chain_node
        WHERE function_call = ? AND depth = 0
        "#,
    )
    .bind(function_call)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("path_chain_node", e))?;

    row.map(ChainNodeRow::into_node).transpose()
}

/// Follow a forward link, checking the target belongs to the same call at
/// the expected depth.
async fn fetch_linked(
    conn: &mut SqliteConnection,
    function_call: FunctionCallId,
    id: ChainNodeId,
    expected_depth: usize,
) -> StorageResult<ChainNode> {
    let row: Option<ChainNodeRow> = sqlx::query_as(
        r#"
        SELECT id, condition_atom, next_node, function_call, depth
        FROM path_chain_node
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("path_chain_node", e))?;

    let node = row
        .map(ChainNodeRow::into_node)
        .transpose()?
        .ok_or_else(|| StorageError::ChainIntegrity {
            function_call: function_call.0,
            message: format!("forward link to missing node {}", id),
        })?;

    if node.function_call != function_call || node.depth != expected_depth {
        return Err(StorageError::ChainIntegrity {
            function_call: function_call.0,
            message: format!(
                "node {} belongs to call {} at depth {}, expected depth {}",
                node.id, node.function_call, node.depth, expected_depth
            ),
        });
    }

    Ok(node)
}

/// Insert `conditions` as a linked run starting at `first_depth`, the last
/// one terminal. Returns the new ids shallowest first.
async fn insert_run(
    conn: &mut SqliteConnection,
    function_call: FunctionCallId,
    conditions: &[ConditionAtomId],
    first_depth: usize,
) -> StorageResult<Vec<ChainNodeId>> {
    let mut created = Vec::with_capacity(conditions.len());
    let mut next = ChainLink::Terminal;

    for (offset, &condition) in conditions.iter().enumerate().rev() {
        let depth = first_depth + offset;
        let result = sqlx::query(
            r#"
            INSERT INTO path_chain_node (condition_atom, next_node, function_call, depth)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(condition)
        .bind(next.to_column())
        .bind(function_call)
        .bind(depth as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::classify("path_chain_node", e))?;

        let id = ChainNodeId(result.last_insert_rowid());
        next = ChainLink::Next(id);
        created.push(id);
    }

    created.reverse();
    Ok(created)
}

/// Point the terminal `tail` at `extension`. Refuses to touch a node that is
/// no longer terminal.
async fn splice(
    conn: &mut SqliteConnection,
    function_call: FunctionCallId,
    tail: ChainNodeId,
    extension: ChainNodeId,
) -> StorageResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE path_chain_node
        SET next_node = ?
        WHERE id = ? AND function_call = ? AND next_node = ?
        "#,
    )
    .bind(extension)
    .bind(tail)
    .bind(function_call)
    .bind(TERMINAL_SENTINEL)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("path_chain_node", e))?;

    if result.rows_affected() != 1 {
        return Err(StorageError::ChainIntegrity {
            function_call: function_call.0,
            message: format!("tail node {} is no longer terminal", tail),
        });
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct ChainNodeRow {
    id: i64,
    condition_atom: i64,
    next_node: i64,
    function_call: i64,
    depth: i64,
}

impl ChainNodeRow {
    fn into_node(self) -> StorageResult<ChainNode> {
        let corrupt = |message: String| StorageError::ChainIntegrity {
            function_call: self.function_call,
            message,
        };
        let next = ChainLink::from_column(self.next_node)
            .ok_or_else(|| corrupt(format!("node {} has invalid link {}", self.id, self.next_node)))?;
        let depth = usize::try_from(self.depth)
            .map_err(|_| corrupt(format!("node {} has negative depth", self.id)))?;

        Ok(ChainNode {
            id: ChainNodeId(self.id),
            condition_atom: ConditionAtomId(self.condition_atom),
            next,
            function_call: FunctionCallId(self.function_call),
            depth,
        })
    }
}
