use std::{
    cmp::PartialEq,
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::{BlockId, Location};

/// The top-level result type for dealing with
/// the `BlockCache` and `LogSerializer`.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up
/// in both the expected and unexpected operation of the storage engine.
#[derive(Debug)]
pub enum Error {
    /// A read or write error has happened when interacting with the file
    /// system.
    Io(io::Error),
    /// Corruption has been detected in the storage file.
    Corruption {
        /// The log location that corrupted data was found at.
        at: Location,
    },
    /// No valid metablock could be found in an existing store, so
    /// it cannot be recovered without losing data.
    Unrecoverable(String),
    /// The system has been used in an unsupported way, or was
    /// opened with a configuration that does not match the store.
    Unsupported(String),
    /// The requested block has never been written, or was deleted.
    NotFound(BlockId),
    /// The system is shutting down or has been shut down.
    ShutDown,
    /// An unexpected bug has happened.
    ReportableBug(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), ioe.to_string())),
            Corruption { at } => Corruption { at: *at },
            Unrecoverable(why) => Unrecoverable(why.clone()),
            Unsupported(why) => Unsupported(why.clone()),
            NotFound(block_id) => NotFound(*block_id),
            ShutDown => ShutDown,
            ReportableBug(what) => ReportableBug(what.clone()),
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match (self, other) {
            (Corruption { at: l }, Corruption { at: r }) => l == r,
            (Unrecoverable(l), Unrecoverable(r)) => l == r,
            (Unsupported(l), Unsupported(r)) => l == r,
            (NotFound(l), NotFound(r)) => l == r,
            (ShutDown, ShutDown) => true,
            (ReportableBug(l), ReportableBug(r)) => l == r,
            (Io(_), _) => false,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use self::Error::*;

        match error {
            Io(ioe) => ioe,
            ShutDown => io::Error::new(io::ErrorKind::Other, "system shut down"),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { at } => {
                write!(f, "Read corrupted data at log location {}", at)
            }
            Unrecoverable(ref why) => {
                write!(f, "Store cannot be recovered: {}", why)
            }
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            NotFound(block_id) => {
                write!(f, "Block {} does not exist", block_id)
            }
            ShutDown => write!(f, "The system has been shut down"),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
        }
    }
}

/// A shared slot for the first fatal error encountered by any
/// component. Once installed it is never cleared, and every
/// subsequent operation that checks it fails with a clone.
#[derive(Debug, Clone, Default)]
pub(crate) struct GlobalError {
    slot: std::sync::Arc<std::sync::OnceLock<Error>>,
}

impl GlobalError {
    pub(crate) fn check(&self) -> Result<()> {
        if let Some(error) = self.slot.get() {
            Err(error.clone())
        } else {
            Ok(())
        }
    }

    pub(crate) fn set(&self, error: &Error) {
        if self.slot.set(error.clone()).is_err() {
            // global fatal error already installed, drop this one
            log::trace!("ignoring secondary fatal error {:?}", error);
        } else {
            log::error!("installing global fatal error: {}", error);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }
}
