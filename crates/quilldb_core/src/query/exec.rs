//! Query execution.

use super::plan::{Plan, ValueRange};
use super::{Query, SortKey};
use crate::catalog::CollectionMeta;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::index::open_index;
use crate::store;
use chrono::{DateTime, Utc};
use quilldb_codec::sort_cmp;
use quilldb_storage::KvTransaction;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;

/// Visitor receiving result documents; returns `false` to stop.
pub(crate) type DocVisitor<'a> = dyn FnMut(Document) -> CoreResult<bool> + 'a;

/// Runs `query` along `plan`, passing results to `visit` in order.
///
/// Fails with [`CoreError::IndexUnavailable`] before reading anything if
/// the plan reads an index that `meta` no longer declares.
pub(crate) fn execute(
    tx: &dyn KvTransaction,
    meta: &CollectionMeta,
    query: &Query,
    plan: &Plan,
    visit: &mut DocVisitor<'_>,
) -> CoreResult<()> {
    if let Some(criterion) = &query.criterion {
        criterion.validate()?;
    }
    if let Some(field) = plan.index_fields().into_iter().find(|f| !meta.has_index(f)) {
        return Err(CoreError::IndexUnavailable {
            collection: meta.name.clone(),
            field: field.to_string(),
        });
    }

    let run = Execution {
        tx,
        meta,
        query,
        now: Utc::now(),
    };
    run.check_deadline()?;

    let mut window = Window {
        skip: query.skip,
        remaining: (query.limit > 0).then_some(query.limit),
    };
    match run.stream_order(plan) {
        Some(reverse) => {
            run.read(plan, reverse, &mut |doc| window.admit(doc, visit))?;
        }
        None => {
            let mut docs = Vec::new();
            run.read(plan, false, &mut |doc| {
                docs.push(doc);
                Ok(true)
            })?;
            docs.sort_by(|a, b| compare_docs(a, b, &query.sort));
            for doc in docs {
                if !window.admit(doc, visit)? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Applies skip and limit to a result stream.
struct Window {
    skip: usize,
    remaining: Option<usize>,
}

impl Window {
    fn admit(&mut self, doc: Document, visit: &mut DocVisitor<'_>) -> CoreResult<bool> {
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(true);
        }
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Ok(false);
            }
            *remaining -= 1;
        }
        let more = visit(doc)?;
        Ok(more && self.remaining != Some(0))
    }
}

struct Execution<'a> {
    tx: &'a dyn KvTransaction,
    meta: &'a CollectionMeta,
    query: &'a Query,
    now: DateTime<Utc>,
}

impl Execution<'_> {
    fn check_deadline(&self) -> CoreResult<()> {
        match self.query.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CoreError::Canceled),
            _ => Ok(()),
        }
    }

    /// Direction in which `plan` already yields documents in sort order, or
    /// `None` if results must be sorted after reading.
    fn stream_order(&self, plan: &Plan) -> Option<bool> {
        let [key] = self.query.sort.as_slice() else {
            return self.query.sort.is_empty().then_some(false);
        };
        let reverse = key.direction == super::Direction::Descending;
        match plan {
            Plan::IndexScan { field, .. } if *field == key.field => Some(reverse),
            Plan::FullScan if key.field == crate::document::ID_FIELD => Some(reverse),
            _ => None,
        }
    }

    /// Passes a candidate through the expiry check and the criterion.
    fn offer(&self, doc: Document, visit: &mut DocVisitor<'_>) -> CoreResult<bool> {
        self.check_deadline()?;
        if doc.is_expired_at(self.now) {
            return Ok(true);
        }
        match &self.query.criterion {
            Some(criterion) if !criterion.matches(&doc) => Ok(true),
            _ => visit(doc),
        }
    }

    /// Reads the candidates of `plan`. Returns `true` if `visit` stopped.
    fn read(&self, plan: &Plan, reverse: bool, visit: &mut DocVisitor<'_>) -> CoreResult<bool> {
        match plan {
            Plan::FullScan => {
                store::scan(self.tx, &self.meta.name, reverse, &mut |doc| self.offer(doc, visit))
            }
            Plan::IndexScan { field, ranges } => self.read_index(field, ranges, reverse, visit),
            Plan::Union(_) if plan.is_full_scan() => self.read(&Plan::FullScan, reverse, visit),
            Plan::Union(plans) => {
                let mut seen = HashSet::new();
                for branch in plans {
                    let stopped = self.read(branch, reverse, &mut |doc| {
                        let fresh = doc
                            .object_id()
                            .is_none_or(|id| seen.insert(id.to_string()));
                        if fresh {
                            visit(doc)
                        } else {
                            Ok(true)
                        }
                    })?;
                    if stopped {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn read_index(
        &self,
        field: &str,
        ranges: &[ValueRange],
        reverse: bool,
        visit: &mut DocVisitor<'_>,
    ) -> CoreResult<bool> {
        let info = self
            .meta
            .index(field)
            .ok_or_else(|| CoreError::IndexUnavailable {
                collection: self.meta.name.clone(),
                field: field.to_string(),
            })?;
        let index = open_index(info);
        let ordered: Vec<&ValueRange> = if reverse {
            ranges.iter().rev().collect()
        } else {
            ranges.iter().collect()
        };
        for range in ordered {
            let stopped = index.iterate(self.tx, &range.iter_mode(), reverse, &mut |id| {
                self.check_deadline()?;
                match store::load(self.tx, &self.meta.name, id)? {
                    Some(doc) => self.offer(doc, visit),
                    None => {
                        tracing::debug!(collection = %self.meta.name, id, "index entry without document");
                        Ok(true)
                    }
                }
            })?;
            if stopped {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Orders documents by the sort keys, then by `_id` in the direction of the
/// first key. Missing fields sort before every value.
fn compare_docs(a: &Document, b: &Document, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let ord = match (a.get(&key.field), b.get(&key.field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => sort_cmp(x, y),
        };
        let ord = key.direction.apply(ord);
        if ord.is_ne() {
            return ord;
        }
    }
    let ord = a.object_id().cmp(&b.object_id());
    sort.first().map_or(ord, |key| key.direction.apply(ord))
}
