//! Memory module for Context Warden
//!
//! Provides the working-memory buffer, checkpoint persistence, and the
//! session-level manager that ties them to the window budget.

mod checkpoint;
mod manager;
pub mod operation;
mod working;

pub use checkpoint::{Checkpoint, CHECKPOINT_VERSION};
pub use manager::{BuiltContext, ManagerStatus, MemoryManager, ModelConfig};
pub use operation::{
    ByteRatioEstimator, Operation, TokenEstimator, APPROX_BYTES_PER_TOKEN, TAG_COMPLETED,
    TAG_DEBUG, TAG_TRANSIENT,
};
pub use working::{WorkingMemory, WorkingMemoryStatus};
