//! Daemon-side implementation: the per-device stack allocator, the
//! growable device vector, the index kernels (§4.4), and the RPC dispatch
//! loop that binds them to a [`vsearch_transport::Session`]'s peer side.

pub mod allocator;
pub mod device_vector;
pub mod dispatch;
pub mod kernels;
pub mod resources;

pub use dispatch::{DaemonContext, IndexHandle};
