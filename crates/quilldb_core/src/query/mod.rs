//! Queries over a collection.
//!
//! A [`Query`] binds a collection to an optional [`Criterion`], sort keys,
//! skip, limit and an optional deadline.
//!
//! ```rust
//! use quilldb_core::query::{field, Direction, Query};
//!
//! let query = Query::new("people")
//!     .filter(field("age").gt(20).and(field("age").lt(40)))
//!     .sort("age", Direction::Descending)
//!     .skip(10)
//!     .limit(10);
//! assert_eq!(query.collection(), "people");
//! ```

mod criterion;
mod eval;
pub(crate) mod exec;
mod plan;

pub use criterion::{field, Criterion, Field, Op, Pattern, Predicate};
pub use plan::{plan, Plan, ValueRange};

use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Smallest values first.
    #[default]
    Ascending,
    /// Largest values first.
    Descending,
}

impl Direction {
    pub(crate) fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        }
    }
}

/// A sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field path.
    pub field: String,
    /// Direction.
    pub direction: Direction,
}

/// A query over one collection.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) collection: String,
    pub(crate) criterion: Option<Criterion>,
    pub(crate) sort: Vec<SortKey>,
    pub(crate) skip: usize,
    pub(crate) limit: usize,
    pub(crate) deadline: Option<Instant>,
}

impl Query {
    /// Creates a query matching every document of `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            criterion: None,
            sort: Vec::new(),
            skip: 0,
            limit: 0,
            deadline: None,
        }
    }

    /// Restricts the query to documents matching `criterion`.
    ///
    /// Calling `filter` again requires both criteria to hold.
    #[must_use]
    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.criterion = Some(match self.criterion.take() {
            Some(existing) => existing.and(criterion),
            None => criterion,
        });
        self
    }

    /// Appends a sort key. Earlier keys take precedence; remaining ties are
    /// broken by `_id`.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    /// Skips the first `n` results.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Returns at most `n` results (0 means unlimited).
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = n;
        self
    }

    /// Fails with [`crate::CoreError::Canceled`] once `deadline` passes.
    #[must_use]
    pub const fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fails with [`crate::CoreError::Canceled`] after `timeout`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the criterion, if any.
    #[must_use]
    pub fn criterion(&self) -> Option<&Criterion> {
        self.criterion.as_ref()
    }

    /// Returns the sort keys.
    #[must_use]
    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_accumulate() {
        let q = Query::new("c")
            .filter(field("a").eq(1))
            .filter(field("b").eq(2));
        assert!(matches!(q.criterion(), Some(Criterion::And(c)) if c.len() == 2));
    }

    #[test]
    fn builder_defaults() {
        let q = Query::new("c");
        assert!(q.criterion().is_none());
        assert!(q.sort_keys().is_empty());
        assert_eq!((q.skip, q.limit, q.deadline), (0, 0, None));

        let q = q
            .sort("a", Direction::Descending)
            .sort("b", Direction::default());
        assert_eq!(q.sort_keys()[0].direction, Direction::Descending);
        assert_eq!(q.sort_keys()[1].direction, Direction::Ascending);
    }

    #[test]
    fn direction_reverses() {
        assert_eq!(Direction::Descending.apply(Ordering::Less), Ordering::Greater);
        assert_eq!(Direction::Ascending.apply(Ordering::Less), Ordering::Less);
    }
}
