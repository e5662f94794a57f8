//! Status transition tables
//!
//! Every persisted entity with a lifecycle carries a status enum implementing
//! [`StateMachine`]. The table is a pure function, so rejections never touch
//! the entity.

use crate::error::{AppError, ErrorCode};
use std::fmt;
use thiserror::Error;

/// Transition-table behaviour shared by every lifecycle status enum
pub trait StateMachine: Copy + Eq + fmt::Display + 'static {
    /// Entity name used in rejection messages
    const ENTITY: &'static str;
    /// Every status, for table conformance checks
    const ALL: &'static [Self];

    /// Check if this state can transition to another state
    fn can_transition_to(&self, target: Self) -> bool;

    /// A terminal state has no outgoing transitions
    fn is_terminal(&self) -> bool {
        Self::ALL.iter().all(|t| !self.can_transition_to(*t))
    }

    /// Get valid next states from current state
    fn valid_transitions(&self) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|t| self.can_transition_to(*t))
            .collect()
    }

    /// Returns the target if the table allows it
    fn transition_to(self, target: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(InvalidTransition {
                entity: Self::ENTITY,
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

/// Apply a transition in place; on rejection `state` is untouched
pub fn advance<S: StateMachine>(state: &mut S, target: S) -> Result<(), InvalidTransition> {
    *state = state.transition_to(target)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity}: invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl From<InvalidTransition> for AppError {
    fn from(err: InvalidTransition) -> Self {
        AppError::with_message(ErrorCode::InvalidStateTransition, err.to_string())
            .with_detail("entity", err.entity)
            .with_detail("from", err.from)
            .with_detail("to", err.to)
    }
}

/// Unknown string value for a status or type enum
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[cfg(test)]
pub(crate) fn assert_table_conformance<S: StateMachine + fmt::Debug>() {
    for from in S::ALL {
        for to in S::ALL {
            let mut state = *from;
            let result = advance(&mut state, *to);
            if from.can_transition_to(*to) {
                assert!(result.is_ok(), "{from} -> {to} should be allowed");
                assert_eq!(state, *to);
            } else {
                let err = result.expect_err("transition outside the table must be rejected");
                assert_eq!(err.entity, S::ENTITY);
                assert_eq!(state, *from, "rejected transition must leave state unchanged");
            }
        }
    }
}
