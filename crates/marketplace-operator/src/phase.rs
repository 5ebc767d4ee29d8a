//! Phase model shared by `OperatorSource` and `CatalogSourceConfig`.
//!
//! Every custom resource managed by the operator carries its reconciliation
//! phase in `status.currentPhase.phase`. Reconcilers only ever propose a
//! [`NextPhase`]; the [`Transitioner`] decides whether that proposal is a real
//! change and stamps the timestamps.

use crate::clock::Clock;
use crate::error::OperatorError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Name of a reconciliation phase
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum PhaseName {
    /// Object has not been looked at yet
    #[default]
    #[serde(rename = "")]
    Initial,
    Validating,
    Downloading,
    Configuring,
    Succeeded,
    Failed,
    Purging,
}

impl PhaseName {
    /// All phase names, in progression order
    pub const ALL: [PhaseName; 7] = [
        PhaseName::Initial,
        PhaseName::Validating,
        PhaseName::Downloading,
        PhaseName::Configuring,
        PhaseName::Succeeded,
        PhaseName::Failed,
        PhaseName::Purging,
    ];

    /// Wire representation of the phase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Initial => "",
            PhaseName::Validating => "Validating",
            PhaseName::Downloading => "Downloading",
            PhaseName::Configuring => "Configuring",
            PhaseName::Succeeded => "Succeeded",
            PhaseName::Failed => "Failed",
            PhaseName::Purging => "Purging",
        }
    }

    /// Canonical message written when no specific message is supplied
    pub fn default_message(&self) -> &'static str {
        match self {
            PhaseName::Initial => "Object is being reconciled",
            PhaseName::Validating => "Scheduled for validation",
            PhaseName::Downloading => "Scheduled for download of operator manifest(s)",
            PhaseName::Configuring => "Scheduled for configuration",
            PhaseName::Succeeded => "The object has been successfully reconciled",
            PhaseName::Failed => "The object has failed reconciliation",
            PhaseName::Purging => "Scheduled for purging",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseName::Initial => f.write_str("Initial"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Persisted phase of an object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    /// Phase name
    #[serde(default)]
    pub name: PhaseName,

    /// Human-readable message describing the phase
    #[serde(default)]
    pub message: String,

    /// Last time the phase name changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Last time the phase name or message changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Wrapper matching the `status.currentPhase` layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPhase {
    #[serde(default)]
    pub phase: Phase,
}

/// A phase proposed by a reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextPhase {
    pub name: PhaseName,
    pub message: String,
}

impl NextPhase {
    /// Propose `name` with its canonical message
    pub fn new(name: PhaseName) -> Self {
        Self {
            name,
            message: name.default_message().to_string(),
        }
    }

    /// Propose `name` with a specific message
    pub fn with_message(name: PhaseName, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }

    /// Propose `Failed`, carrying the error text as the message
    pub fn failed(error: &OperatorError) -> Self {
        Self::with_message(PhaseName::Failed, error.to_string())
    }
}

/// Applies proposed phases to persisted phases
pub trait Transitioner: Send + Sync {
    /// Move `current` to `next`. Returns `true` when `current` was mutated.
    fn transition(&self, current: &mut Phase, next: &NextPhase) -> bool;
}

/// Transitioner that stamps times from an injected clock
#[derive(Clone)]
pub struct PhaseTransitioner {
    clock: Arc<dyn Clock>,
}

impl PhaseTransitioner {
    /// Create a transitioner reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Transitioner for PhaseTransitioner {
    fn transition(&self, current: &mut Phase, next: &NextPhase) -> bool {
        if current.name == next.name && current.message == next.message {
            return false;
        }

        let now = self.clock.now();
        if current.name != next.name {
            current.last_transition_time = Some(now);
        }
        current.name = next.name;
        current.message = next.message.clone();
        current.last_update_time = Some(now);
        true
    }
}
