// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Query predicate evaluator.
//!
//! Evaluates a parsed [`Predicate`] against the attribute map of a stream.

use super::parser::{Operator, Predicate};

impl Predicate {
    /// Evaluate the predicate against an attribute lookup.
    ///
    /// `lookup` maps an attribute name (e.g. `type`, `session_id`,
    /// `channel_count`) to its textual value, or `None` when the stream has
    /// no such attribute. A comparison against a missing attribute is false
    /// (and true for `!=`), which makes session-id scoping strict.
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Option<String>) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Comparison {
                attribute,
                op,
                literal,
            } => {
                let value = lookup(attribute);
                match op {
                    Operator::Eq => value.as_deref() == Some(literal.as_str()),
                    Operator::Ne => value.as_deref() != Some(literal.as_str()),
                }
            }
            Predicate::And(l, r) => l.matches(lookup) && r.matches(lookup),
            Predicate::Or(l, r) => l.matches(lookup) || r.matches(lookup),
            Predicate::Not(inner) => !inner.matches(lookup),
        }
    }
}
