//! Write conditions over the current stream version
//!
//! A write condition is either [`WriteCondition::AnyStreamVersion`] (no
//! condition) or a predicate tree over the stream version. Each predicate
//! node carries three surfaces:
//!
//! - [`VersionPredicate::eval`]: pure evaluation against an in-memory
//!   version, used after the version record has been fetched.
//! - [`VersionPredicate::to_filter`]: lowering into a MongoDB filter
//!   document, so the comparison can participate in an atomic conditional
//!   update.
//! - [`fmt::Display`]: the canonical phrase used in failure messages, e.g.
//!   `and(gte(0), lt(100), ne(40))` renders as "to be greater than or equal
//!   to 0 and to be less than 100 and to not be equal to 40".
//!
//! The free functions ([`eq`], [`and`], …) exist for readable composition:
//!
//! ```rust
//! use everstream::condition::{and, gte, lt, ne};
//!
//! let condition = and([gte(0), lt(100), ne(40)]);
//! assert!(condition.eval(1));
//! assert!(!condition.eval(40));
//! ```

use std::fmt;

use mongodb::bson::{doc, Bson, Document};

use crate::errors::EventStoreError;

/// Optimistic-concurrency condition attached to a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Accept the write regardless of the current stream version
    AnyStreamVersion,
    /// Accept the write only if the predicate holds for the current version
    StreamVersion(VersionPredicate),
}

impl WriteCondition {
    /// Shorthand for [`WriteCondition::AnyStreamVersion`]
    pub fn any() -> Self {
        WriteCondition::AnyStreamVersion
    }

    /// Condition a write on the predicate holding for the current version
    pub fn stream_version(predicate: VersionPredicate) -> Self {
        WriteCondition::StreamVersion(predicate)
    }

    /// Whether this condition accepts the given stream version
    pub fn eval(&self, version: u64) -> bool {
        match self {
            WriteCondition::AnyStreamVersion => true,
            WriteCondition::StreamVersion(predicate) => predicate.eval(version),
        }
    }

    /// The error raised when this condition rejected `actual`
    pub(crate) fn not_fulfilled(&self, actual: u64) -> EventStoreError {
        EventStoreError::WriteConditionNotFulfilled {
            expected: self.to_string(),
            actual,
        }
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCondition::AnyStreamVersion => write!(f, "any stream version"),
            WriteCondition::StreamVersion(predicate) => write!(f, "{predicate}"),
        }
    }
}

/// Predicate tree evaluated against an integer stream version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPredicate {
    /// `version == n`
    Eq(u64),
    /// `version != n`
    Ne(u64),
    /// `version < n`
    Lt(u64),
    /// `version > n`
    Gt(u64),
    /// `version <= n`
    Lte(u64),
    /// `version >= n`
    Gte(u64),
    /// All children hold
    And(Vec<VersionPredicate>),
    /// At least one child holds
    Or(Vec<VersionPredicate>),
    /// The child does not hold
    Not(Box<VersionPredicate>),
}

impl VersionPredicate {
    /// Pure evaluation against an in-memory version
    pub fn eval(&self, version: u64) -> bool {
        match self {
            VersionPredicate::Eq(n) => version == *n,
            VersionPredicate::Ne(n) => version != *n,
            VersionPredicate::Lt(n) => version < *n,
            VersionPredicate::Gt(n) => version > *n,
            VersionPredicate::Lte(n) => version <= *n,
            VersionPredicate::Gte(n) => version >= *n,
            VersionPredicate::And(children) => children.iter().all(|p| p.eval(version)),
            VersionPredicate::Or(children) => children.iter().any(|p| p.eval(version)),
            VersionPredicate::Not(child) => !child.eval(version),
        }
    }

    /// Lower the predicate into a MongoDB filter over `field`
    pub fn to_filter(&self, field: &str) -> Document {
        fn comparison(field: &str, operator: &str, n: u64) -> Document {
            let mut inner = Document::new();
            inner.insert(operator, n as i64);
            let mut filter = Document::new();
            filter.insert(field, inner);
            filter
        }

        fn children_to_bson(children: &[VersionPredicate], field: &str) -> Vec<Bson> {
            children
                .iter()
                .map(|p| Bson::Document(p.to_filter(field)))
                .collect()
        }

        match self {
            VersionPredicate::Eq(n) => comparison(field, "$eq", *n),
            VersionPredicate::Ne(n) => comparison(field, "$ne", *n),
            VersionPredicate::Lt(n) => comparison(field, "$lt", *n),
            VersionPredicate::Gt(n) => comparison(field, "$gt", *n),
            VersionPredicate::Lte(n) => comparison(field, "$lte", *n),
            VersionPredicate::Gte(n) => comparison(field, "$gte", *n),
            VersionPredicate::And(children) => doc! { "$and": children_to_bson(children, field) },
            VersionPredicate::Or(children) => doc! { "$or": children_to_bson(children, field) },
            VersionPredicate::Not(child) => doc! { "$nor": [child.to_filter(field)] },
        }
    }
}

impl fmt::Display for VersionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(
            f: &mut fmt::Formatter<'_>,
            children: &[VersionPredicate],
            connective: &str,
        ) -> fmt::Result {
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " {connective} ")?;
                }
                write!(f, "{child}")?;
            }
            Ok(())
        }

        match self {
            VersionPredicate::Eq(n) => write!(f, "to be equal to {n}"),
            VersionPredicate::Ne(n) => write!(f, "to not be equal to {n}"),
            VersionPredicate::Lt(n) => write!(f, "to be less than {n}"),
            VersionPredicate::Gt(n) => write!(f, "to be greater than {n}"),
            VersionPredicate::Lte(n) => write!(f, "to be less than or equal to {n}"),
            VersionPredicate::Gte(n) => write!(f, "to be greater than or equal to {n}"),
            VersionPredicate::And(children) => join(f, children, "and"),
            VersionPredicate::Or(children) => join(f, children, "or"),
            VersionPredicate::Not(child) => write!(f, "not {child}"),
        }
    }
}

/// `version == n`
pub fn eq(n: u64) -> VersionPredicate {
    VersionPredicate::Eq(n)
}

/// `version != n`
pub fn ne(n: u64) -> VersionPredicate {
    VersionPredicate::Ne(n)
}

/// `version < n`
pub fn lt(n: u64) -> VersionPredicate {
    VersionPredicate::Lt(n)
}

/// `version > n`
pub fn gt(n: u64) -> VersionPredicate {
    VersionPredicate::Gt(n)
}

/// `version <= n`
pub fn lte(n: u64) -> VersionPredicate {
    VersionPredicate::Lte(n)
}

/// `version >= n`
pub fn gte(n: u64) -> VersionPredicate {
    VersionPredicate::Gte(n)
}

/// All of the given predicates hold
pub fn and(predicates: impl IntoIterator<Item = VersionPredicate>) -> VersionPredicate {
    VersionPredicate::And(predicates.into_iter().collect())
}

/// At least one of the given predicates holds
pub fn or(predicates: impl IntoIterator<Item = VersionPredicate>) -> VersionPredicate {
    VersionPredicate::Or(predicates.into_iter().collect())
}

/// The given predicate does not hold
pub fn not(predicate: VersionPredicate) -> VersionPredicate {
    VersionPredicate::Not(Box::new(predicate))
}
