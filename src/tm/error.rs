use std::fmt;

use thiserror::Error;

/// Errors produced by the supervision engine and its control plane.
///
/// The `Display` strings of the first four variants (Unknown,
/// AlreadyStarted, NotRunning, ServiceClosed) are wire sentinels: they
/// cross the control socket verbatim and clients compare against them
/// to format user-facing messages. Do not reword them.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("process unknown")]
    Unknown,

    #[error("process already started")]
    AlreadyStarted,

    #[error("process is not running")]
    NotRunning,

    /// The daemon has begun (or finished) shutting down; also the
    /// cancellation cause a clean termination reports.
    #[error("service closed")]
    ServiceClosed,

    /// The record exists but its child slot is empty.
    #[error("process is nil")]
    Nil,

    #[error("unsupported stop signal: {0}")]
    UnsupportedSignal(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait on {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal {name}: {source}")]
    Signal {
        name: String,
        #[source]
        source: nix::Error,
    },

    /// Informational: the grace period elapsed and the child was SIGKILLed.
    /// The instance is still considered stopped.
    #[error("process {0} was forcibly killed after timeout")]
    ForciblyKilled(String),

    #[error("process {name} exited with code {code}")]
    Exited { name: String, code: i32 },

    #[error("config: {0}")]
    ConfigInvalid(String),

    #[error("{0}")]
    Joined(Joined),
}

impl Error {
    /// Collapses a list of per-instance errors into one, the way batch
    /// operations report. Empty list means success.
    pub fn join(mut errs: Vec<Error>) -> Option<Error> {
        match errs.len() {
            0 => None,
            1 => Some(errs.remove(0)),
            _ => Some(Error::Joined(Joined(errs))),
        }
    }

    /// A forcible kill stops the instance; phases that only need the
    /// child gone treat it as success.
    pub fn is_stopped_anyway(&self) -> bool {
        matches!(self, Error::ForciblyKilled(_))
    }
}

#[derive(Debug)]
pub struct Joined(pub Vec<Error>);

impl fmt::Display for Joined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
