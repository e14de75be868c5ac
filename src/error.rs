//! implementation for [`SRCError`]
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// The category of a failure. Lets callers decide between retrying, skipping a message or
/// giving up without matching on error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure talking to the schema registry or the broker.
    Transport,
    /// The schema registry answered, but not with something usable.
    Registry,
    /// A schema string could not be parsed into an Avro schema.
    Schema,
    /// Registering the schema of an outgoing message failed.
    Registration,
    /// Resolving the schema id found in an incoming message failed.
    SchemaLookup,
    /// The subject does not fit the single length byte of the envelope.
    SubjectTooLong,
    /// Fewer bytes than the envelope header announces.
    TruncatedMessage,
    /// The first byte is not the magic byte.
    BadMagicByte,
    /// The values don't match the schema used to serialize them.
    Encoding,
    /// The payload could not be read with the schema from the registry.
    Decoding,
    /// Storing the consumed offset failed.
    Commit,
}

/// Error struct which makes it easy to know what went wrong, and whether trying it again might
/// not cause an error. Errors are never kept in any of the caches, so every call after a failure
/// gets a fresh attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SRCError {
    pub kind: ErrorKind,
    pub error: String,
    pub cause: Option<String>,
    pub retriable: bool,
}

/// Implements standard error so error handling can be simplified
impl Error for SRCError {}

/// Gives the information from the error in a readable format.
impl fmt::Display for SRCError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(
                f,
                "Error: {}, was caused by {}, it's retriable: {}",
                self.error, &cause, self.retriable
            ),
            None => write!(
                f,
                "Error: {} had no other cause, it's retriable: {}",
                self.error, self.retriable
            ),
        }
    }
}

impl SRCError {
    pub fn new(kind: ErrorKind, error: &str, cause: Option<String>, retriable: bool) -> SRCError {
        SRCError {
            kind,
            error: error.to_owned(),
            cause,
            retriable,
        }
    }
    pub fn retryable_with_cause<T: Display>(kind: ErrorKind, cause: T, error: &str) -> SRCError {
        SRCError::new(kind, error, Some(format!("{}", cause)), true)
    }
    pub fn non_retryable_with_cause<T: Display>(
        kind: ErrorKind,
        cause: T,
        error: &str,
    ) -> SRCError {
        SRCError::new(kind, error, Some(format!("{}", cause)), false)
    }
    pub fn non_retryable_without_cause(kind: ErrorKind, error: &str) -> SRCError {
        SRCError::new(kind, error, None, false)
    }
    /// Re-tags an error from a lower layer, the original error becomes the cause and whether it's
    /// retriable is kept.
    pub fn wrap(kind: ErrorKind, inner: SRCError, error: &str) -> SRCError {
        let retriable = inner.retriable;
        SRCError::new(kind, error, Some(format!("{}", inner)), retriable)
    }
    /// Errors about the framing of a single message. Such a message can't ever be read, so it
    /// should be skipped.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::SubjectTooLong | ErrorKind::TruncatedMessage | ErrorKind::BadMagicByte
        )
    }
}
