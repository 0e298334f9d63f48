//! View query evaluation: key filtering, reduce/grouping, paging.

use super::{View, ViewRow};
use crate::error::{CoreError, CoreResult};
use crate::registry::ReduceFunction;
use crate::revision::Body;
use crate::types::SequenceNumber;
use loredb_codec::{Collation, Value};
use std::cmp::Ordering;

/// When a query refreshes the view's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexUpdateMode {
    /// Update the index synchronously before returning rows.
    #[default]
    Before,
    /// Return current (possibly stale) rows; the caller schedules an
    /// asynchronous reindex afterwards.
    After,
    /// Never reindex automatically.
    Never,
}

/// Conflict visibility for the all-documents query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllDocsMode {
    /// One row per live document, winner only.
    #[default]
    AllDocs,
    /// Also include documents whose winner is a tombstone.
    IncludeDeleted,
    /// Attach the list of conflicting revision ids to each row.
    ShowConflicts,
    /// Only documents that are in conflict.
    OnlyConflicts,
}

/// Options accepted by view queries and the all-documents query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Lower key bound (upper when `descending`).
    pub start_key: Option<Value>,
    /// Upper key bound (lower when `descending`).
    pub end_key: Option<Value>,
    /// Explicit key set; overrides the range bounds.
    pub keys: Option<Vec<Value>>,
    /// Whether a row equal to `start_key` is included.
    pub inclusive_start: bool,
    /// Whether a row equal to `end_key` is included.
    pub inclusive_end: bool,
    /// Reverse the key order.
    pub descending: bool,
    /// Rows to drop after filtering (and reducing).
    pub skip: usize,
    /// Maximum number of rows returned.
    pub limit: Option<usize>,
    /// Run the reduce function. `None` means "reduce when the view has
    /// one"; `Some(true)` on a reduce-less view is an error.
    pub reduce: Option<bool>,
    /// Group reduced results by key.
    pub group: bool,
    /// Number of leading array-key elements to group by (0 = whole key).
    pub group_level: u32,
    /// Attach each row's document body (non-reduced queries only).
    pub include_docs: bool,
    /// Conflict visibility for the all-documents query.
    pub all_docs_mode: AllDocsMode,
    /// Report the store sequence the result was computed at.
    pub update_seq: bool,
    /// Index staleness policy.
    pub index_update_mode: IndexUpdateMode,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            keys: None,
            inclusive_start: true,
            inclusive_end: true,
            descending: false,
            skip: 0,
            limit: None,
            reduce: None,
            group: false,
            group_level: 0,
            include_docs: false,
            all_docs_mode: AllDocsMode::AllDocs,
            update_seq: false,
            index_update_mode: IndexUpdateMode::Before,
        }
    }
}

/// One row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    /// The emitted (or group) key.
    pub key: Value,
    /// The emitted (or reduced) value.
    pub value: Value,
    /// Source document id; absent on reduced rows.
    pub doc_id: Option<String>,
    /// Sequence of the revision that emitted the row; absent on reduced
    /// rows.
    pub sequence: Option<SequenceNumber>,
    /// The document body, when `include_docs` was requested.
    pub doc: Option<Body>,
    /// Conflicting revision ids (all-docs `ShowConflicts` mode only).
    pub conflicts: Vec<String>,
}

impl QueryRow {
    pub(crate) fn from_view_row(row: &ViewRow) -> Self {
        Self {
            key: row.key.clone(),
            value: row.value.clone(),
            doc_id: Some(row.doc_id.clone()),
            sequence: Some(row.sequence),
            doc: None,
            conflicts: Vec::new(),
        }
    }

    pub(crate) fn reduced(key: Value, value: Value) -> Self {
        Self {
            key,
            value,
            doc_id: None,
            sequence: None,
            doc: None,
            conflicts: Vec::new(),
        }
    }
}

/// A query's rows plus bookkeeping.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// The result rows, in query order.
    pub rows: Vec<QueryRow>,
    /// The store sequence observed when the query ran, when requested.
    pub update_seq: Option<SequenceNumber>,
}

impl View {
    /// Runs a query against this view.
    ///
    /// Filters rows by explicit keys or by a collated start/end range,
    /// optionally reduces with grouping, then applies skip and limit.
    /// `IndexUpdateMode::Before` refreshes the index first;
    /// `After`-mode scheduling is the caller's job (see
    /// `Database::query_view`), and `Never` leaves staleness alone.
    pub fn query(&self, options: &QueryOptions) -> CoreResult<QueryResult> {
        if options.index_update_mode == IndexUpdateMode::Before {
            self.update_index()?;
        }

        let state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found(format!(
                "view {} has been deleted",
                self.name()
            )));
        }
        let collation = state.collation;

        let mut selected: Vec<&ViewRow> = if let Some(keys) = &options.keys {
            state
                .rows
                .iter()
                .filter(|row| {
                    keys.iter()
                        .any(|k| collation.cmp_values(k, &row.key) == Ordering::Equal)
                })
                .collect()
        } else {
            // Normalize to an ascending (min, max) window; descending
            // queries swap the bounds and their inclusiveness.
            let (min_key, max_key, inclusive_min, inclusive_max) = if options.descending {
                (
                    options.end_key.as_ref(),
                    options.start_key.as_ref(),
                    options.inclusive_end,
                    options.inclusive_start,
                )
            } else {
                (
                    options.start_key.as_ref(),
                    options.end_key.as_ref(),
                    options.inclusive_start,
                    options.inclusive_end,
                )
            };

            state
                .rows
                .iter()
                .filter(|row| {
                    if let Some(min) = min_key {
                        let ord = collation.cmp_values(&row.key, min);
                        if ord == Ordering::Less
                            || (!inclusive_min && ord == Ordering::Equal)
                        {
                            return false;
                        }
                    }
                    if let Some(max) = max_key {
                        let ord = collation.cmp_values(&row.key, max);
                        if ord == Ordering::Greater
                            || (!inclusive_max && ord == Ordering::Equal)
                        {
                            return false;
                        }
                    }
                    true
                })
                .collect()
        };

        if options.descending {
            selected.reverse();
        }

        let reduce_fn = state.reduce.clone();
        let wants_reduce = match options.reduce {
            Some(explicit) => {
                if explicit && reduce_fn.is_none() {
                    return Err(CoreError::bad_request(format!(
                        "view {} has no reduce function",
                        self.name()
                    )));
                }
                explicit
            }
            None => reduce_fn.is_some(),
        };

        let mut rows: Vec<QueryRow> = match (wants_reduce, reduce_fn) {
            (true, Some(reduce)) => reduce_rows(&selected, &reduce, collation, options),
            _ => selected.iter().map(|r| QueryRow::from_view_row(r)).collect(),
        };

        if options.skip > 0 {
            rows.drain(..options.skip.min(rows.len()));
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }

        if options.include_docs && !wants_reduce {
            for row in &mut rows {
                if let Some(doc_id) = &row.doc_id {
                    if let Ok(rev) = self.store().get_document(doc_id, None) {
                        row.doc = self.store().revision_properties(&rev);
                    }
                }
            }
        }

        let update_seq = options
            .update_seq
            .then(|| self.store().last_sequence());
        Ok(QueryResult { rows, update_seq })
    }
}

/// Groups sorted rows and reduces each group.
fn reduce_rows(
    selected: &[&ViewRow],
    reduce: &ReduceFunction,
    collation: Collation,
    options: &QueryOptions,
) -> Vec<QueryRow> {
    let group = options.group || options.group_level > 0;
    let group_limit = if group { options.group_level as usize } else { 0 };

    let mut out = Vec::new();
    let mut group_keys: Vec<Value> = Vec::new();
    let mut group_values: Vec<Value> = Vec::new();
    let mut group_head: Option<Value> = None;

    for row in selected {
        match &group_head {
            Some(head)
                if group
                    && collation.cmp_limited(head, &row.key, group_limit)
                        != Ordering::Equal =>
            {
                // This row starts a new group: reduce and record the last.
                let key = group_key(head.clone(), group_limit);
                let value = reduce(&group_keys, &group_values, false);
                out.push(QueryRow::reduced(key, value));
                group_keys.clear();
                group_values.clear();
                group_head = Some(row.key.clone());
            }
            Some(_) => {}
            None => group_head = Some(row.key.clone()),
        }
        group_keys.push(row.key.clone());
        group_values.push(row.value.clone());
    }

    if let Some(head) = group_head {
        if !group_keys.is_empty() {
            let value = reduce(&group_keys, &group_values, false);
            let key = if group {
                group_key(head, group_limit)
            } else {
                Value::Null
            };
            out.push(QueryRow::reduced(key, value));
        }
    }
    out
}

/// Truncates an array key to the group level; non-array keys group whole.
fn group_key(key: Value, group_level: usize) -> Value {
    match key {
        Value::Array(mut items) if group_level > 0 && items.len() > group_level => {
            items.truncate(group_level);
            Value::Array(items)
        }
        other => other,
    }
}
