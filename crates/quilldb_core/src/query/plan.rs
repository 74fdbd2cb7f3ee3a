//! Query planning.
//!
//! Planning walks the criterion tree separately from evaluation and picks an
//! access path. A plan only narrows which documents are read; the executor
//! still filters every candidate through the full criterion.
//!
//! - A predicate on an indexed field becomes ranges over that index
//!   (`eq` a point, `lt`/`lte`/`gt`/`gte` one-sided, `is_in` a set of points).
//! - `And` intersects ranges on the same field, otherwise keeps the most
//!   selective index scan (points, then bounded ranges, then one-sided).
//! - `Or` merges ranges on the same field, otherwise becomes a union of the
//!   branch plans.
//! - `Not`, `neq`, `like`, `exists`, `is_nil` and predicates on null or
//!   mapping values need a full scan: documents lacking the field, or holding
//!   null, have no index entry.

use super::criterion::{Criterion, Op};
use crate::catalog::CollectionMeta;
use crate::index::IterMode;
use quilldb_codec::{is_indexable, sort_cmp, Value};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// A contiguous range of values.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRange {
    /// Lower bound.
    pub low: Bound<Value>,
    /// Upper bound.
    pub high: Bound<Value>,
}

impl ValueRange {
    /// The range holding exactly `value`.
    #[must_use]
    pub fn point(value: Value) -> Self {
        Self {
            low: Bound::Included(value.clone()),
            high: Bound::Included(value),
        }
    }

    /// Returns the single value of a point range.
    #[must_use]
    pub fn as_point(&self) -> Option<&Value> {
        match (&self.low, &self.high) {
            (Bound::Included(a), Bound::Included(b)) if sort_cmp(a, b).is_eq() => Some(a),
            _ => None,
        }
    }

    fn is_bounded(&self) -> bool {
        !matches!(self.low, Bound::Unbounded) && !matches!(self.high, Bound::Unbounded)
    }

    fn is_empty(&self) -> bool {
        match (&self.low, &self.high) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
            (Bound::Included(a), Bound::Included(b)) => sort_cmp(a, b).is_gt(),
            (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
                sort_cmp(a, b).is_ge()
            }
        }
    }

    fn intersect(&self, other: &Self) -> Option<Self> {
        let low = match cmp_low(&self.low, &other.low) {
            Ordering::Less => other.low.clone(),
            _ => self.low.clone(),
        };
        let high = match cmp_high(&self.high, &other.high) {
            Ordering::Greater => other.high.clone(),
            _ => self.high.clone(),
        };
        let range = Self { low, high };
        (!range.is_empty()).then_some(range)
    }

    pub(crate) fn iter_mode(&self) -> IterMode {
        match self.as_point() {
            Some(value) => IterMode::Equality(value.clone()),
            None => IterMode::Range {
                low: self.low.clone(),
                high: self.high.clone(),
            },
        }
    }
}

/// Orders lower bounds: unbounded first, then by value, `[v` before `(v`.
fn cmp_low(a: &Bound<Value>, b: &Bound<Value>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            sort_cmp(x, y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => sort_cmp(x, y).then(Ordering::Less),
        (Bound::Excluded(x), Bound::Included(y)) => sort_cmp(x, y).then(Ordering::Greater),
    }
}

/// Orders upper bounds: unbounded last, then by value, `v)` before `v]`.
fn cmp_high(a: &Bound<Value>, b: &Bound<Value>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            sort_cmp(x, y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => sort_cmp(x, y).then(Ordering::Greater),
        (Bound::Excluded(x), Bound::Included(y)) => sort_cmp(x, y).then(Ordering::Less),
    }
}

/// True if a range ending at `high` and one starting at `low` leave no gap.
fn touches(high: &Bound<Value>, low: &Bound<Value>) -> bool {
    match (high, low) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Excluded(h), Bound::Excluded(l)) => sort_cmp(l, h).is_lt(),
        (Bound::Included(h) | Bound::Excluded(h), Bound::Included(l) | Bound::Excluded(l)) => {
            sort_cmp(l, h).is_le()
        }
    }
}

/// Sorts ranges by lower bound and merges overlapping ones.
fn normalize(mut ranges: Vec<ValueRange>) -> Vec<ValueRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by(|a, b| cmp_low(&a.low, &b.low));
    let mut merged: Vec<ValueRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if touches(&last.high, &range.low) => {
                if cmp_high(&range.high, &last.high).is_gt() {
                    last.high = range.high;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// A chosen execution strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Read every document of the collection.
    FullScan,
    /// Read the documents whose indexed `field` lies in one of `ranges`.
    ///
    /// Ranges are disjoint and sorted in ascending value order.
    IndexScan {
        /// Indexed field.
        field: String,
        /// Value ranges to read.
        ranges: Vec<ValueRange>,
    },
    /// Read the documents produced by any of the plans.
    Union(Vec<Plan>),
}

impl Plan {
    /// Returns true if executing the plan reads every document.
    #[must_use]
    pub fn is_full_scan(&self) -> bool {
        match self {
            Plan::FullScan => true,
            Plan::IndexScan { .. } => false,
            Plan::Union(plans) => plans.iter().any(Plan::is_full_scan),
        }
    }

    /// Returns true if the plan reads at least one index.
    #[must_use]
    pub fn uses_index(&self) -> bool {
        match self {
            Plan::FullScan => false,
            Plan::IndexScan { .. } => true,
            Plan::Union(plans) => plans.iter().any(Plan::uses_index),
        }
    }

    /// Fields whose indexes the plan reads.
    pub(crate) fn index_fields(&self) -> Vec<&str> {
        match self {
            Plan::FullScan => Vec::new(),
            Plan::IndexScan { field, .. } => vec![field.as_str()],
            Plan::Union(plans) => plans.iter().flat_map(Plan::index_fields).collect(),
        }
    }

    fn selectivity(&self) -> u8 {
        match self {
            Plan::IndexScan { ranges, .. } if ranges.is_empty() => 4,
            Plan::IndexScan { ranges, .. } if ranges.iter().all(|r| r.as_point().is_some()) => 3,
            Plan::IndexScan { ranges, .. } if ranges.iter().all(ValueRange::is_bounded) => 2,
            Plan::IndexScan { .. } => 1,
            Plan::FullScan | Plan::Union(_) => 0,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::FullScan => write!(f, "FullScan"),
            Plan::IndexScan { field, ranges } => {
                write!(f, "IndexScan({field}")?;
                for range in ranges {
                    write!(f, " ")?;
                    match &range.low {
                        Bound::Unbounded => write!(f, "(-inf")?,
                        Bound::Included(v) => write!(f, "[{v:?}")?,
                        Bound::Excluded(v) => write!(f, "({v:?}")?,
                    }
                    match &range.high {
                        Bound::Unbounded => write!(f, ", +inf)")?,
                        Bound::Included(v) => write!(f, ", {v:?}]")?,
                        Bound::Excluded(v) => write!(f, ", {v:?})")?,
                    }
                }
                write!(f, ")")
            }
            Plan::Union(plans) => {
                write!(f, "Union(")?;
                for (i, plan) in plans.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{plan}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Chooses a plan for `criterion` over the indexes declared in `meta`.
#[must_use]
pub fn plan(criterion: Option<&Criterion>, meta: &CollectionMeta) -> Plan {
    criterion.map_or(Plan::FullScan, |c| plan_node(c, meta))
}

fn plan_node(criterion: &Criterion, meta: &CollectionMeta) -> Plan {
    match criterion {
        Criterion::Predicate(p) => match leaf_ranges(&p.op) {
            Some(ranges) if meta.has_index(&p.field) => Plan::IndexScan {
                field: p.field.clone(),
                ranges: normalize(ranges),
            },
            _ => Plan::FullScan,
        },
        Criterion::And(children) => plan_and(children.iter().map(|c| plan_node(c, meta))),
        Criterion::Or(children) => plan_or(children.iter().map(|c| plan_node(c, meta))),
        Criterion::Not(_) => Plan::FullScan,
    }
}

/// Ranges read by a predicate, if it can be answered from an index.
fn leaf_ranges(op: &Op) -> Option<Vec<ValueRange>> {
    let point = |v: &Value| !v.is_null() && is_indexable(v);
    let ranges = match op {
        Op::Eq(v) if point(v) => vec![ValueRange::point(v.clone())],
        Op::In(values) if values.iter().all(point) => {
            values.iter().cloned().map(ValueRange::point).collect()
        }
        Op::Lt(v) if is_indexable(v) => vec![ValueRange {
            low: Bound::Unbounded,
            high: Bound::Excluded(v.clone()),
        }],
        Op::Lte(v) if is_indexable(v) => vec![ValueRange {
            low: Bound::Unbounded,
            high: Bound::Included(v.clone()),
        }],
        Op::Gt(v) if is_indexable(v) => vec![ValueRange {
            low: Bound::Excluded(v.clone()),
            high: Bound::Unbounded,
        }],
        Op::Gte(v) if is_indexable(v) => vec![ValueRange {
            low: Bound::Included(v.clone()),
            high: Bound::Unbounded,
        }],
        _ => return None,
    };
    Some(ranges)
}

fn plan_and(children: impl Iterator<Item = Plan>) -> Plan {
    let mut scans: Vec<(String, Vec<ValueRange>)> = Vec::new();
    let mut unions = Vec::new();
    for child in children {
        match child {
            Plan::IndexScan { field, ranges } => {
                match scans.iter_mut().find(|(f, _)| *f == field) {
                    Some((_, existing)) => {
                        let both = existing
                            .iter()
                            .flat_map(|a| ranges.iter().filter_map(|b| a.intersect(b)))
                            .collect();
                        *existing = normalize(both);
                    }
                    None => scans.push((field, ranges)),
                }
            }
            union @ Plan::Union(_) if !union.is_full_scan() => unions.push(union),
            _ => {}
        }
    }

    let mut best: Option<Plan> = None;
    for (field, ranges) in scans {
        let candidate = Plan::IndexScan { field, ranges };
        if best
            .as_ref()
            .is_none_or(|b| candidate.selectivity() > b.selectivity())
        {
            best = Some(candidate);
        }
    }
    best.or_else(|| unions.into_iter().next())
        .unwrap_or(Plan::FullScan)
}

fn plan_or(children: impl Iterator<Item = Plan>) -> Plan {
    let mut branches = Vec::new();
    for child in children {
        match child {
            Plan::Union(nested) => branches.extend(nested),
            other => branches.push(other),
        }
    }
    if !branches.is_empty() && branches.iter().all(|b| *b == Plan::FullScan) {
        return Plan::FullScan;
    }

    let mut merged: Option<(String, Vec<ValueRange>)> = None;
    let same_field = branches.iter().all(|branch| match branch {
        Plan::IndexScan { field, ranges } => {
            match &mut merged {
                Some((f, all)) if f == field => all.extend(ranges.iter().cloned()),
                Some(_) => return false,
                None => merged = Some((field.clone(), ranges.clone())),
            }
            true
        }
        _ => false,
    });
    match merged {
        Some((field, ranges)) if same_field => Plan::IndexScan {
            field,
            ranges: normalize(ranges),
        },
        _ => Plan::Union(branches),
    }
}
