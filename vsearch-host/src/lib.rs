//! Host-side driver for the multi-device vector search engine (§4.5).
//!
//! [`facade::Index`] is the type applications build against: it owns one
//! [`client::DeviceClient`] per configured device, shards and merges across
//! them, and drives host-side training ([`clustering`]) for the IVF
//! families. [`autotune`] enumerates `nprobe` operating points and
//! [`parallel::call_parallel`] is the fan-out primitive everything else is
//! built on.

pub mod autotune;
pub mod client;
pub mod clustering;
pub mod facade;
pub mod parallel;

pub use client::DeviceClient;
pub use facade::{Family, Index, IndexState};
