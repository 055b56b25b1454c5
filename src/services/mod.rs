//! Services used by the pipeline and the runtime.

pub mod artifacts;
pub mod scheduler;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use scheduler::{ScheduleEntry, Scheduler};
