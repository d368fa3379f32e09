//! Snapshot metadata model.
//!
//! One document per snapshot, keyed by the snapshot id. Phase and
//! end-of-life transitions live here as pure functions so that every store
//! backend enforces the same invariants: phases are append-only, at most one
//! phase is open, and a closed snapshot accepts no further mutation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A labeled interval within a snapshot. Only the tail phase may have an
/// empty `ts_end`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub label: String,
    pub ts_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_end: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn is_open(&self) -> bool {
        self.ts_end.is_none()
    }
}

/// Direction of a phase transition requested through PATCH.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseMode {
    Start,
    End,
}

impl FromStr for PhaseMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PhaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::End => write!(f, "end"),
        }
    }
}

/// Rejected state transitions.
#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("snapshot is closed and cannot be modified")]
    SnapshotClosed,
    #[error("phase '{0}' is still open; end it before starting another")]
    PhaseStillOpen(String),
}

/// The metadata document for one snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub server: String,
    pub ts_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SnapshotMetadata {
    pub fn new(
        snapshot_id: String,
        services: Vec<String>,
        server: String,
        label: Option<String>,
    ) -> Self {
        Self {
            snapshot_id,
            services,
            server,
            ts_start: Utc::now(),
            ts_end: None,
            phases: Vec::new(),
            label,
        }
    }

    /// A snapshot is closed once its `ts_end` is set. Closed is terminal.
    pub fn is_closed(&self) -> bool {
        self.ts_end.is_some()
    }

    /// The tail phase, if it is still open.
    pub fn open_phase(&self) -> Option<&Phase> {
        self.phases.last().filter(|p| p.is_open())
    }

    /// Append a new open phase.
    pub fn start_phase(&mut self, label: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.is_closed() {
            return Err(TransitionError::SnapshotClosed);
        }
        if let Some(open) = self.open_phase() {
            return Err(TransitionError::PhaseStillOpen(open.label.clone()));
        }
        self.phases.push(Phase {
            label: label.to_string(),
            ts_start: now,
            ts_end: None,
        });
        Ok(())
    }

    /// Close the tail phase. A no-op when no phase is open.
    pub fn end_phase(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.is_closed() {
            return Err(TransitionError::SnapshotClosed);
        }
        if let Some(tail) = self.phases.last_mut() {
            if tail.ts_end.is_none() {
                tail.ts_end = Some(now);
            }
        }
        Ok(())
    }

    /// Replace the services set.
    pub fn set_services(&mut self, services: Vec<String>) -> Result<(), TransitionError> {
        if self.is_closed() {
            return Err(TransitionError::SnapshotClosed);
        }
        self.services = services;
        Ok(())
    }

    /// Set the snapshot's `ts_end`. Idempotent: a second call leaves the
    /// first timestamp in place. Returns whether the document changed.
    pub fn end_of_life(&mut self, now: DateTime<Utc>) -> bool {
        if self.ts_end.is_some() {
            return false;
        }
        self.ts_end = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot() -> SnapshotMetadata {
        SnapshotMetadata::new(
            "7e9b3d1c-0000-4000-8000-000000000001".to_string(),
            vec!["kv".to_string(), "index".to_string()],
            "8.0.0-1000-enterprise".to_string(),
            None,
        )
    }

    #[test]
    fn test_phase_sequence_is_monotonic() {
        let mut doc = snapshot();
        let t0 = doc.ts_start;

        doc.start_phase("load", t0 + Duration::milliseconds(5)).unwrap();
        doc.end_phase(t0 + Duration::milliseconds(25)).unwrap();
        doc.start_phase("access", t0 + Duration::milliseconds(30)).unwrap();
        doc.end_phase(t0 + Duration::milliseconds(60)).unwrap();

        assert_eq!(doc.phases.len(), 2);
        for pair in doc.phases.windows(2) {
            assert!(pair[0].ts_start <= pair[0].ts_end.unwrap());
            assert!(pair[0].ts_end.unwrap() <= pair[1].ts_start);
        }
        assert!(doc.ts_start <= doc.phases[0].ts_start);
    }

    #[test]
    fn test_start_rejected_while_phase_open() {
        let mut doc = snapshot();
        let now = Utc::now();

        doc.start_phase("load", now).unwrap();
        let err = doc.start_phase("access", now).unwrap_err();
        assert_eq!(err, TransitionError::PhaseStillOpen("load".to_string()));
        assert_eq!(doc.phases.len(), 1);
    }

    #[test]
    fn test_end_without_open_phase_is_noop() {
        let mut doc = snapshot();
        let now = Utc::now();

        doc.end_phase(now).unwrap();
        assert!(doc.phases.is_empty());

        doc.start_phase("load", now).unwrap();
        let first_end = now + Duration::seconds(1);
        doc.end_phase(first_end).unwrap();
        // a second end leaves the recorded timestamp alone
        doc.end_phase(now + Duration::seconds(5)).unwrap();
        assert_eq!(doc.phases[0].ts_end, Some(first_end));
    }

    #[test]
    fn test_eol_is_idempotent() {
        let mut doc = snapshot();
        let t1 = Utc::now();

        assert!(doc.end_of_life(t1));
        assert!(!doc.end_of_life(t1 + Duration::seconds(10)));
        assert_eq!(doc.ts_end, Some(t1));
    }

    #[test]
    fn test_closed_snapshot_rejects_mutation() {
        let mut doc = snapshot();
        doc.end_of_life(Utc::now());

        assert_eq!(
            doc.start_phase("load", Utc::now()),
            Err(TransitionError::SnapshotClosed)
        );
        assert_eq!(doc.end_phase(Utc::now()), Err(TransitionError::SnapshotClosed));
        assert_eq!(
            doc.set_services(vec!["kv".to_string()]),
            Err(TransitionError::SnapshotClosed)
        );
    }

    #[test]
    fn test_phase_mode_parsing() {
        assert_eq!("start".parse::<PhaseMode>(), Ok(PhaseMode::Start));
        assert_eq!("end".parse::<PhaseMode>(), Ok(PhaseMode::End));
        assert!("restart".parse::<PhaseMode>().is_err());
        assert!("START".parse::<PhaseMode>().is_err());
    }

    #[test]
    fn test_open_fields_are_omitted_from_documents() {
        let mut doc = snapshot();
        doc.start_phase("load", Utc::now()).unwrap();

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("ts_end").is_none());
        assert!(json["phases"][0].get("ts_end").is_none());
        assert!(json.get("label").is_none());

        let back: SnapshotMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
