//! Role hierarchy and authority ordering.
//!
//! Roles form a strict total order by rank; rank 0 is the most authoritative.
//! Envelope priorities are ranks, so the valid priority range is the range of
//! ranks in the hierarchy.

use crate::{ConfigError, MessageEnvelope, ValidationError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Rank of the orchestrator role.
pub const ORCHESTRATOR_RANK: i32 = 0;

/// Strict total order over role names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleHierarchy {
    ranks: BTreeMap<String, i32>,
}

impl Default for RoleHierarchy {
    fn default() -> Self {
        let mut ranks = BTreeMap::new();
        ranks.insert("orchestrator".to_string(), ORCHESTRATOR_RANK);
        ranks.insert("relay".to_string(), 1);
        ranks.insert("worker".to_string(), 2);
        Self { ranks }
    }
}

impl RoleHierarchy {
    /// Build a hierarchy from `(role, rank)` pairs.
    ///
    /// Ranks must be unique and non-negative so the order is strict.
    pub fn from_ranks<I, S>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let mut ranks = BTreeMap::new();
        let mut seen: BTreeMap<i32, String> = BTreeMap::new();
        for (name, rank) in pairs {
            let name = name.into();
            if rank < 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("roles.{}.priority", name),
                    value: rank.to_string(),
                    reason: "priority must be non-negative".to_string(),
                });
            }
            if let Some(other) = seen.get(&rank) {
                return Err(ConfigError::InvalidValue {
                    field: format!("roles.{}.priority", name),
                    value: rank.to_string(),
                    reason: format!("priority already used by role {}", other),
                });
            }
            seen.insert(rank, name.clone());
            ranks.insert(name, rank);
        }
        if ranks.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "roles".to_string(),
            });
        }
        Ok(Self { ranks })
    }

    /// Rank of a role, if declared.
    pub fn rank(&self, role: &str) -> Option<i32> {
        self.ranks.get(role).copied()
    }

    /// Inclusive `(min, max)` rank bounds.
    pub fn bounds(&self) -> (i32, i32) {
        let min = self.ranks.values().copied().min().unwrap_or(ORCHESTRATOR_RANK);
        let max = self.ranks.values().copied().max().unwrap_or(ORCHESTRATOR_RANK);
        (min, max)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.ranks.contains_key(role)
    }

    /// Validate that a priority falls inside the hierarchy bounds.
    pub fn check_priority(&self, priority: i32) -> Result<(), ValidationError> {
        let (min, max) = self.bounds();
        if priority < min || priority > max {
            return Err(ValidationError::PriorityOutOfBounds { priority, min, max });
        }
        Ok(())
    }

    /// The more authoritative of two declared roles. `None` if either is
    /// undeclared.
    pub fn more_authoritative<'a>(&self, a: &'a str, b: &'a str) -> Option<&'a str> {
        let (rank_a, rank_b) = (self.rank(a)?, self.rank(b)?);
        Some(if rank_b < rank_a { b } else { a })
    }

    /// Role names in authority order, most authoritative first.
    pub fn ordered(&self) -> Vec<(&str, i32)> {
        let mut roles: Vec<_> = self.ranks.iter().map(|(n, r)| (n.as_str(), *r)).collect();
        roles.sort_by_key(|(_, r)| *r);
        roles
    }
}

/// Authority ordering between two envelopes.
///
/// `Ordering::Less` means `a` is more authoritative. Lower priority wins;
/// equal priorities fall back to the earlier `created_at`, then the lower id,
/// so the result is identical on every node.
pub fn authority_order(a: &MessageEnvelope, b: &MessageEnvelope) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Resolve two claims on the same task: the more authoritative envelope wins.
pub fn resolve_task_claim<'a>(
    a: &'a MessageEnvelope,
    b: &'a MessageEnvelope,
) -> &'a MessageEnvelope {
    match authority_order(a, b) {
        Ordering::Greater => b,
        _ => a,
    }
}
