//! Client RPC transport: framing, the per-device session, and the
//! ref-counted session registry (§4.1).

pub mod framing;
pub mod loopback;
pub mod registry;
pub mod session;

pub use registry::{Connector, SessionRegistry};
pub use session::{BoxedStream, DuplexByteStream, FastRecvGuard, Session};
