use std::fmt;

use serde::{Deserialize, Serialize};

/// An operation on an entity that a macaroon can authorize.
///
/// Entities by convention carry a `type-` prefix (`doc-trip`,
/// `path-/user/bob`); the `login` entity is reserved for
/// authentication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Op {
    pub entity: String,
    pub action: String,
}

impl Op {
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            action: action.into(),
        }
    }

    /// The distinguished operation marking an authentication token.
    pub fn login() -> Self {
        Op::new("login", "login")
    }

    /// The empty sentinel operation. Used by ops authorizers to grant
    /// post-hoc authorization when no macaroon matched directly; it can
    /// never be minted into a macaroon.
    pub fn no_op() -> Self {
        Op::new("", "")
    }

    pub fn is_login(&self) -> bool {
        self.entity == "login" && self.action == "login"
    }

    pub fn is_no_op(&self) -> bool {
        self.entity.is_empty() && self.action.is_empty()
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.action)
    }
}

/// Canonicalizes an operation set: lexicographic sort on
/// `(entity, action)` with duplicates removed.
pub fn canonical_ops(ops: &[Op]) -> Vec<Op> {
    let mut out = ops.to_vec();
    out.sort();
    out.dedup();
    out
}
