use std::fmt;

/// Crate-wide error taxonomy shared by the host façade, the transport, and
/// the daemon-side kernels.
///
/// Every public entry point in this workspace returns `Result<T, Error>`
/// rather than a boxed/dynamic error: callers that need to branch on a
/// precondition failure vs. a transport failure can match on the variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation called in the wrong state: add before train, n outside the
    /// 32-bit range, mismatched dim, empty device list, and similar caller
    /// mistakes.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Framing, serialization, link, or remote-side RPC failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Allocator exhaustion, kernel failure, or model load failure on the
    /// daemon side.
    #[error("device error: {0}")]
    Device(String),

    /// Internal consistency check failed: LIFO violation, size mismatch
    /// between codes and ids, post-remove count mismatch.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Every per-device worker failed; the façade reports the first
    /// message and how many of the fanned-out workers failed.
    #[error("{failed}/{total} device workers failed: {first}")]
    Aggregate {
        first: Box<Error>,
        failed: usize,
        total: usize,
    },
}

impl Error {
    pub fn precondition(msg: impl fmt::Display) -> Self {
        Error::Precondition(msg.to_string())
    }

    pub fn transport(msg: impl fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }

    pub fn device(msg: impl fmt::Display) -> Self {
        Error::Device(msg.to_string())
    }

    pub fn invariant(msg: impl fmt::Display) -> Self {
        Error::Invariant(msg.to_string())
    }

    /// Collects the results of a fan-out across devices into a single
    /// result, preserving the first failure and how many workers failed.
    ///
    /// Mirrors `CALL_PARALLEL_FUNCTOR`'s gather-and-rethrow behavior: partial
    /// success across devices is not a success.
    pub fn aggregate<T>(results: Vec<Result<T, Error>>) -> Result<Vec<T>, Error> {
        let total = results.len();
        let mut oks = Vec::with_capacity(total);
        let mut first_err = None;
        let mut failed = 0usize;
        for r in results {
            match r {
                Ok(v) => oks.push(v),
                Err(e) => {
                    failed += 1;
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            None => Ok(oks),
            Some(first) => Err(Error::Aggregate {
                first: Box::new(first),
                failed,
                total,
            }),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
