//! CrowdEdge Common - shared types for the edge-device services.
//!
//! Device identity, the offline queue, request signing and the wire
//! protocol live here so the agent daemon and the portal process share
//! one definition of each.

pub mod error;
pub mod identity;
pub mod protocol;
pub mod queue;
pub mod signing;

pub use error::{EdgeError, EdgeResult, RadioError};
pub use identity::{CachedConfig, DeviceIdentity};
pub use queue::{OfflineQueue, QueueItem, QueueKind, QueueLimits, QueueStats};
