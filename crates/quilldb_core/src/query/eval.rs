//! Criterion evaluation against a single document.

use super::criterion::{Criterion, Op, Predicate};
use crate::document::Document;
use quilldb_codec::{compare, is_indexable, values_equal, Value};
use std::cmp::Ordering;

impl Criterion {
    /// Returns true if `doc` satisfies this criterion.
    ///
    /// A missing field fails every predicate except `neq` and `is_nil`.
    /// Ordering predicates also fail on null and on mappings, which have no
    /// position in the value order.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Criterion::Predicate(p) => matches_predicate(p, doc.get(&p.field)),
            Criterion::And(children) => children.iter().all(|c| c.matches(doc)),
            Criterion::Or(children) => children.iter().any(|c| c.matches(doc)),
            Criterion::Not(inner) => !inner.matches(doc),
        }
    }
}

fn matches_predicate(p: &Predicate, value: Option<&Value>) -> bool {
    let Some(value) = value else {
        return matches!(p.op, Op::Ne(_) | Op::IsNil);
    };
    match &p.op {
        Op::Eq(target) => values_equal(value, target),
        Op::Ne(target) => !values_equal(value, target),
        Op::Lt(target) => ordered(value, target, Ordering::is_lt),
        Op::Lte(target) => ordered(value, target, Ordering::is_le),
        Op::Gt(target) => ordered(value, target, Ordering::is_gt),
        Op::Gte(target) => ordered(value, target, Ordering::is_ge),
        Op::In(targets) => targets.iter().any(|t| values_equal(value, t)),
        Op::Like(pattern) => match (value, pattern.regex()) {
            (Value::Text(text), Some(regex)) => regex.is_match(text),
            _ => false,
        },
        Op::Exists => true,
        Op::IsNil => value.is_null(),
    }
}

fn ordered(value: &Value, target: &Value, accept: fn(Ordering) -> bool) -> bool {
    if value.is_null() || !is_indexable(value) || !is_indexable(target) {
        return false;
    }
    compare(value, target).is_some_and(accept)
}
