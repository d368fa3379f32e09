pub mod snapshot;

pub use snapshot::{Phase, PhaseMode, SnapshotMetadata, TransitionError};
