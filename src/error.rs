use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The category of an [`Error`].
///
/// The category decides how the enclosing cycle reacts: decode errors skip a single value,
/// node errors abort a whole snapshot cycle, and delivery errors leave a change record unsent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ErrorKind {
    ChecksumMismatch,
    MalformedAddressString,
    TruncatedBuffer,
    InvalidEncoding,
    UnknownVariant(u8),
    ProtocolError,
    NodeCatchingUp,
    NodeUnavailable,
    DeliveryFailure,
    Internal,
}

impl ErrorKind {
    /// Errors which are local to a single decoded value.
    pub fn is_decode(self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch
                | Self::MalformedAddressString
                | Self::TruncatedBuffer
                | Self::InvalidEncoding
                | Self::UnknownVariant(_)
        )
    }

    /// Errors after which no data from the remote node can be trusted for the current cycle.
    pub fn aborts_cycle(self) -> bool {
        matches!(self, Self::NodeCatchingUp | Self::NodeUnavailable)
    }

    /// Errors which may go away on their own if the same operation is attempted again later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NodeCatchingUp | Self::NodeUnavailable | Self::DeliveryFailure | Self::Internal
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::MalformedAddressString => write!(f, "malformed address string"),
            Self::TruncatedBuffer => write!(f, "truncated buffer"),
            Self::InvalidEncoding => write!(f, "invalid encoding"),
            Self::UnknownVariant(ordinal) => write!(f, "unknown variant {ordinal}"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::NodeCatchingUp => write!(f, "node catching up"),
            Self::NodeUnavailable => write!(f, "node unavailable"),
            Self::DeliveryFailure => write!(f, "delivery failure"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    /// Extend an error message with additional context, keeping the same kind.
    pub fn context(self, context: impl Display) -> Self {
        Self {
            message: format!("{context}: {}", self.message),
            kind: self.kind,
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn stock(kind: ErrorKind, message: &str) -> Self {
        Self {
            message: message.to_string(),
            kind,
        }
    }

    /// The checksum embedded in an address string does not match its contents.
    pub fn checksum_mismatch() -> Self {
        Self::stock(ErrorKind::ChecksumMismatch, "checksum mismatch")
    }

    /// An address string which is not shaped like any address we understand.
    ///
    /// This covers bad characters, mixed case, a missing separator, excess length and non-zero
    /// padding bits. A well-formed string with a bad checksum is a
    /// [`checksum_mismatch`](Self::checksum_mismatch) instead.
    pub fn malformed_address() -> Self {
        Self::stock(ErrorKind::MalformedAddressString, "malformed address")
    }

    /// A binary buffer ended before a declared length was satisfied.
    pub fn truncated_buffer() -> Self {
        Self::stock(ErrorKind::TruncatedBuffer, "buffer too short")
    }

    /// Bytes which should have been text (or base64) are not.
    pub fn invalid_encoding() -> Self {
        Self::stock(ErrorKind::InvalidEncoding, "invalid encoding")
    }

    /// A discriminant byte outside the range of the enumeration it encodes.
    pub fn unknown_variant(ordinal: u8) -> Self {
        Self::stock(ErrorKind::UnknownVariant(ordinal), "discriminant out of range")
    }

    /// The remote node answered, but not in the shape we expect.
    pub fn protocol() -> Self {
        Self::stock(ErrorKind::ProtocolError, "unexpected response")
    }

    /// The remote node is still syncing, so its state is not authoritative.
    pub fn catching_up() -> Self {
        Self::stock(ErrorKind::NodeCatchingUp, "node is still catching up")
    }

    /// The remote node could not be reached.
    pub fn unavailable() -> Self {
        Self::stock(ErrorKind::NodeUnavailable, "node unavailable")
    }

    /// A message could not be delivered to a subscriber.
    pub fn delivery_failure() -> Self {
        Self::stock(ErrorKind::DeliveryFailure, "message not delivered")
    }

    /// An error internal to the service, such as a storage fault.
    pub fn internal() -> Self {
        Self::stock(ErrorKind::Internal, "internal error")
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::internal().context(format!("{err:#}"))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::internal().context(err)
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::internal().context(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_status() {
            Self::unavailable().context(err)
        } else if err.is_decode() || err.is_body() {
            Self::protocol().context(err)
        } else {
            Self::internal().context(err)
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Extension functions for converting other result types into [`Result`].
pub trait ResultExt {
    type Ok;

    /// Wrap an error with an error kind, preserving the original error context.
    fn context(self, f: impl FnOnce() -> Error) -> Result<Self::Ok>;
}

impl<T, E> ResultExt for Result<T, E>
where
    E: std::error::Error,
{
    type Ok = T;

    fn context(self, f: impl FnOnce() -> Error) -> Result<<Self as ResultExt>::Ok> {
        self.map_err(|err| f().context(err))
    }
}

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
pub(crate) use ensure;
