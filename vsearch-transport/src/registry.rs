//! Process-wide, ref-counted session registry (§4.1 "Connect protocol").
//!
//! The first caller for a device opens a session; later callers on the same
//! device increment a ref count and share it; the session is torn down
//! when the last holder releases it. Mirrors a connection pool with
//! explicit `acquire`/`release` rather than relying on `Drop` order across
//! threads, so teardown stays deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};
use vsearch_common::{Error, Result};

use crate::session::{BoxedStream, Session};

pub const MAX_CONNECT_RETRIES: u32 = 5;
pub const CONNECT_RETRY_SPACING: Duration = Duration::from_secs(20);

/// Opens the byte stream to one device's daemon. Production code implements
/// this over TCP (or whatever transport the deployment uses); tests
/// implement it over an in-memory loopback pair.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: u32) -> Result<BoxedStream>;
}

struct Entry {
    session: Arc<Session>,
    ref_count: usize,
}

/// Bounded by `max_sessions`: once that many distinct devices have live
/// sessions, acquiring a new one fails rather than silently growing
/// unbounded.
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    max_sessions: usize,
    sessions: Mutex<HashMap<u32, Entry>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, max_sessions: usize) -> Self {
        Self {
            connector,
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the shared session for `device`, connecting (with retry) if
    /// this is the first acquire for that device.
    pub async fn acquire(&self, device: u32) -> Result<Arc<Session>> {
        {
            let mut sessions = self.sessions.lock();
            if let Some(entry) = sessions.get_mut(&device) {
                entry.ref_count += 1;
                info!(device, ref_count = entry.ref_count, "session ref++");
                return Ok(entry.session.clone());
            }
            if sessions.len() >= self.max_sessions {
                return Err(Error::precondition(format!(
                    "session registry at capacity ({} devices)",
                    self.max_sessions
                )));
            }
        }

        let stream = self.connect_with_retry(device).await?;
        let session = Arc::new(Session::new(device, stream));

        let mut sessions = self.sessions.lock();
        // Another caller may have raced us to create the same device's
        // session while we were connecting; prefer the one already there.
        if let Some(entry) = sessions.get_mut(&device) {
            entry.ref_count += 1;
            return Ok(entry.session.clone());
        }
        sessions.insert(
            device,
            Entry {
                session: session.clone(),
                ref_count: 1,
            },
        );
        Ok(session)
    }

    /// Releases one reference to `device`'s session, tearing it down once
    /// the count reaches zero.
    pub fn release(&self, device: u32) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(&device) {
            entry.ref_count -= 1;
            info!(device, ref_count = entry.ref_count, "session ref--");
            if entry.ref_count == 0 {
                info!(device, "releasing session");
                sessions.remove(&device);
            }
        }
    }

    async fn connect_with_retry(&self, device: u32) -> Result<BoxedStream> {
        let mut last_err = None;
        for attempt in 1..=MAX_CONNECT_RETRIES {
            match self.connector.connect(device).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(device, attempt, error = %e, "connect failed, retrying");
                    last_err = Some(e);
                    if attempt < MAX_CONNECT_RETRIES {
                        tokio::time::sleep(CONNECT_RETRY_SPACING).await;
                    }
                }
            }
        }
        Err(Error::transport(format!(
            "failed to connect to device {device} after {MAX_CONNECT_RETRIES} retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    struct CountingConnector {
        connects: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _device: u32) -> Result<BoxedStream> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(Error::transport("simulated failure"));
            }
            let (a, _b) = duplex(1024);
            Ok(Box::new(a))
        }
    }

    #[tokio::test]
    async fn acquire_shares_and_ref_counts() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let registry = SessionRegistry::new(connector.clone(), 8);

        let s1 = registry.acquire(0).await.unwrap();
        let s2 = registry.acquire(0).await.unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        registry.release(0);
        // still referenced once
        let s3 = registry.acquire(0).await.unwrap();
        assert!(Arc::ptr_eq(&s1, &s3));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        registry.release(0);
        registry.release(0);
        // fully released: next acquire reconnects
        let _s4 = registry.acquire(0).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn acquire_respects_max_sessions() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let registry = SessionRegistry::new(connector, 1);
        let _s0 = registry.acquire(0).await.unwrap();
        let err = registry.acquire(1).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
