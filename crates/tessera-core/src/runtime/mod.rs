//! SPMD execution of per-device programs.
//!
//! The layer and driver code are written against the [`Collectives`] trait, which is the only way a device program
//! communicates with other devices. [`HostRuntime`] implements it by running one thread per mesh device on the host
//! and exchanging [`HostArray`](crate::array::HostArray) buffers in memory.

pub mod collectives;
pub mod host;

pub use collectives::{CollectiveError, CollectiveKind, Collectives};
pub use host::{DeviceContext, HostRuntime};
