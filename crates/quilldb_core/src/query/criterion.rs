//! Criterion algebra.
//!
//! A [`Criterion`] is a tree of field predicates joined by `And`, `Or` and
//! `Not`. Criteria are built with [`field`]:
//!
//! ```rust
//! use quilldb_core::query::field;
//!
//! let adults_named_z = field("age").gte(18).and(field("name").eq("Z"));
//! let not_archived = !field("archived").eq(true);
//! # let _ = (adults_named_z, not_archived);
//! ```

use crate::error::{CoreError, CoreResult};
use quilldb_codec::Value;
use regex::Regex;
use std::fmt;

/// Comparison applied by a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Field equals the value.
    Eq(Value),
    /// Field is missing or differs from the value.
    Ne(Value),
    /// Field is less than the value.
    Lt(Value),
    /// Field is less than or equal to the value.
    Lte(Value),
    /// Field is greater than the value.
    Gt(Value),
    /// Field is greater than or equal to the value.
    Gte(Value),
    /// Field equals one of the values.
    In(Vec<Value>),
    /// Field is a string matching the pattern.
    Like(Pattern),
    /// Field is present (possibly null).
    Exists,
    /// Field is missing or null.
    IsNil,
}

/// A `field op value` leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    /// Field path, possibly dotted.
    pub field: String,
    /// The comparison.
    pub op: Op,
}

/// A regular expression used by `like`.
///
/// Compilation errors are kept and reported when the query runs.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    compiled: Result<Regex, String>,
}

impl Pattern {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            compiled: Regex::new(source).map_err(|err| err.to_string()),
        }
    }

    /// Returns the pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub(crate) fn regex(&self) -> Option<&Regex> {
        self.compiled.as_ref().ok()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.source)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// A query criterion.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// A single predicate.
    Predicate(Predicate),
    /// All children hold (an empty list always holds).
    And(Vec<Criterion>),
    /// At least one child holds (an empty list never holds).
    Or(Vec<Criterion>),
    /// The child does not hold.
    Not(Box<Criterion>),
}

impl Criterion {
    /// Both criteria hold.
    #[must_use]
    pub fn and(self, other: Criterion) -> Criterion {
        match (self, other) {
            (Criterion::And(mut left), Criterion::And(right)) => {
                left.extend(right);
                Criterion::And(left)
            }
            (Criterion::And(mut left), right) => {
                left.push(right);
                Criterion::And(left)
            }
            (left, Criterion::And(mut right)) => {
                right.insert(0, left);
                Criterion::And(right)
            }
            (left, right) => Criterion::And(vec![left, right]),
        }
    }

    /// Either criterion holds.
    #[must_use]
    pub fn or(self, other: Criterion) -> Criterion {
        match (self, other) {
            (Criterion::Or(mut left), Criterion::Or(right)) => {
                left.extend(right);
                Criterion::Or(left)
            }
            (Criterion::Or(mut left), right) => {
                left.push(right);
                Criterion::Or(left)
            }
            (left, Criterion::Or(mut right)) => {
                right.insert(0, left);
                Criterion::Or(right)
            }
            (left, right) => Criterion::Or(vec![left, right]),
        }
    }

    /// Every criterion holds.
    pub fn all(criteria: impl IntoIterator<Item = Criterion>) -> Criterion {
        Criterion::And(criteria.into_iter().collect())
    }

    /// At least one criterion holds.
    pub fn any(criteria: impl IntoIterator<Item = Criterion>) -> Criterion {
        Criterion::Or(criteria.into_iter().collect())
    }

    /// Checks that every predicate can be evaluated.
    pub(crate) fn validate(&self) -> CoreResult<()> {
        match self {
            Criterion::Predicate(p) => {
                if p.field.is_empty() {
                    return Err(CoreError::invalid_input("criterion on an empty field name"));
                }
                if let Op::Like(pattern) = &p.op {
                    if let Err(err) = &pattern.compiled {
                        return Err(CoreError::invalid_input(format!(
                            "invalid pattern for {}: {err}",
                            p.field
                        )));
                    }
                }
                Ok(())
            }
            Criterion::And(children) | Criterion::Or(children) => {
                children.iter().try_for_each(Criterion::validate)
            }
            Criterion::Not(inner) => inner.validate(),
        }
    }
}

impl std::ops::Not for Criterion {
    type Output = Criterion;

    fn not(self) -> Criterion {
        match self {
            Criterion::Not(inner) => *inner,
            other => Criterion::Not(Box::new(other)),
        }
    }
}

/// Starts a predicate on `name`.
pub fn field(name: impl Into<String>) -> Field {
    Field { name: name.into() }
}

/// Builder for predicates on one field.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
}

impl Field {
    fn predicate(self, op: Op) -> Criterion {
        Criterion::Predicate(Predicate {
            field: self.name,
            op,
        })
    }

    /// Field equals `value`.
    #[must_use]
    pub fn eq(self, value: impl Into<Value>) -> Criterion {
        self.predicate(Op::Eq(value.into()))
    }

    /// Field is missing or differs from `value`.
    #[must_use]
    pub fn neq(self, value: impl Into<Value>) -> Criterion {
        self.predicate(Op::Ne(value.into()))
    }

    /// Field is less than `value`.
    #[must_use]
    pub fn lt(self, value: impl Into<Value>) -> Criterion {
        self.predicate(Op::Lt(value.into()))
    }

    /// Field is less than or equal to `value`.
    #[must_use]
    pub fn lte(self, value: impl Into<Value>) -> Criterion {
        self.predicate(Op::Lte(value.into()))
    }

    /// Field is greater than `value`.
    #[must_use]
    pub fn gt(self, value: impl Into<Value>) -> Criterion {
        self.predicate(Op::Gt(value.into()))
    }

    /// Field is greater than or equal to `value`.
    #[must_use]
    pub fn gte(self, value: impl Into<Value>) -> Criterion {
        self.predicate(Op::Gte(value.into()))
    }

    /// Field equals one of `values`.
    #[must_use]
    pub fn is_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Criterion {
        self.predicate(Op::In(values.into_iter().map(Into::into).collect()))
    }

    /// Field is a string matching the regular expression `pattern`.
    #[must_use]
    pub fn like(self, pattern: &str) -> Criterion {
        self.predicate(Op::Like(Pattern::new(pattern)))
    }

    /// Field is present.
    #[must_use]
    pub fn exists(self) -> Criterion {
        self.predicate(Op::Exists)
    }

    /// Field is missing or null.
    #[must_use]
    pub fn is_nil(self) -> Criterion {
        self.predicate(Op::IsNil)
    }
}
