//! NA return values and `errno` interoperability.

use std::io;

use thiserror::Error;

/// Result type returned by every fallible NA operation.
///
/// Success is `Ok(..)`; the original `NA_SUCCESS` value has no Rust
/// counterpart.
pub type Result<T> = std::result::Result<T, NaError>;

/// Error values shared by the NA core and every transport plugin.
///
/// Plugins map their native failures (`errno` for the shared-memory plugin)
/// onto this single taxonomy so that callers never see transport-specific
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum NaError {
    /// Operation not permitted.
    #[error("operation not permitted")]
    Permission,

    /// No such file or entry.
    #[error("no such entry")]
    NoEntry,

    /// Operation interrupted.
    #[error("operation interrupted")]
    Interrupt,

    /// Operation must be retried.
    ///
    /// Never surfaced from a submit path: the shared-memory plugin parks the
    /// operation on its retry queue instead and reports completion through
    /// the callback.
    #[error("operation must be retried")]
    Again,

    /// Out of memory.
    #[error("out of memory")]
    NoMem,

    /// Permission denied.
    #[error("permission denied")]
    Access,

    /// Bad address.
    #[error("bad address")]
    Fault,

    /// Device or resource busy.
    #[error("device or resource busy")]
    Busy,

    /// Entry already exists.
    #[error("entry already exists")]
    Exist,

    /// No such device.
    #[error("no such device")]
    NoDev,

    /// Invalid argument.
    #[error("invalid argument")]
    InvalidArg,

    /// Value too large to fit.
    #[error("value too large")]
    Overflow,

    /// Message size too large.
    #[error("message size too large")]
    MsgSize,

    /// Protocol not supported by any registered plugin.
    #[error("protocol not supported")]
    ProtoNoSupport,

    /// Operation not supported by this plugin.
    #[error("operation not supported")]
    OpNotSupported,

    /// Address already in use.
    #[error("address already in use")]
    AddrInUse,

    /// Address not available.
    #[error("address not available")]
    AddrNotAvail,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Operation canceled.
    #[error("operation canceled")]
    Canceled,

    /// Entry was evicted.
    #[error("entry evicted")]
    Evicted,

    /// Unspecified protocol error.
    #[error("protocol error")]
    ProtocolError,
}

impl NaError {
    /// Static string form, mirroring `Display`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NaError::Permission => "operation not permitted",
            NaError::NoEntry => "no such entry",
            NaError::Interrupt => "operation interrupted",
            NaError::Again => "operation must be retried",
            NaError::NoMem => "out of memory",
            NaError::Access => "permission denied",
            NaError::Fault => "bad address",
            NaError::Busy => "device or resource busy",
            NaError::Exist => "entry already exists",
            NaError::NoDev => "no such device",
            NaError::InvalidArg => "invalid argument",
            NaError::Overflow => "value too large",
            NaError::MsgSize => "message size too large",
            NaError::ProtoNoSupport => "protocol not supported",
            NaError::OpNotSupported => "operation not supported",
            NaError::AddrInUse => "address already in use",
            NaError::AddrNotAvail => "address not available",
            NaError::Timeout => "operation timed out",
            NaError::Canceled => "operation canceled",
            NaError::Evicted => "entry evicted",
            NaError::ProtocolError => "protocol error",
        }
    }

    /// Convert an `errno` value into its NA counterpart.
    ///
    /// Values without a direct mapping fold into [`NaError::ProtocolError`].
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM => NaError::Permission,
            libc::ENOENT => NaError::NoEntry,
            libc::EINTR => NaError::Interrupt,
            libc::EAGAIN => NaError::Again,
            libc::ENOMEM => NaError::NoMem,
            libc::EACCES => NaError::Access,
            libc::EFAULT => NaError::Fault,
            libc::EBUSY => NaError::Busy,
            libc::EEXIST => NaError::Exist,
            libc::ENODEV => NaError::NoDev,
            libc::EINVAL => NaError::InvalidArg,
            libc::EOVERFLOW => NaError::Overflow,
            libc::EMSGSIZE => NaError::MsgSize,
            libc::EPROTONOSUPPORT => NaError::ProtoNoSupport,
            libc::EOPNOTSUPP => NaError::OpNotSupported,
            libc::EADDRINUSE => NaError::AddrInUse,
            libc::EADDRNOTAVAIL => NaError::AddrNotAvail,
            libc::ETIMEDOUT => NaError::Timeout,
            libc::ECANCELED => NaError::Canceled,
            _ => NaError::ProtocolError,
        }
    }

    /// Map the calling thread's current `errno`.
    pub(crate) fn last_os_error() -> Self {
        Self::from(&io::Error::last_os_error())
    }
}

impl From<&io::Error> for NaError {
    fn from(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => NaError::from_errno(errno),
            None => NaError::ProtocolError,
        }
    }
}

impl From<io::Error> for NaError {
    fn from(err: io::Error) -> Self {
        NaError::from(&err)
    }
}

/// Return the string form of an NA error value.
pub fn error_to_string(err: NaError) -> &'static str {
    err.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(NaError::from_errno(libc::EAGAIN), NaError::Again);
        assert_eq!(NaError::from_errno(libc::EPERM), NaError::Permission);
        assert_eq!(NaError::from_errno(libc::ENOENT), NaError::NoEntry);
        // Unknown errno values degrade into a generic protocol error.
        assert_eq!(NaError::from_errno(12345), NaError::ProtocolError);
    }

    #[test]
    fn test_io_error_interop() {
        let err = io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(NaError::from(&err), NaError::Busy);
        assert_eq!(error_to_string(NaError::Busy), "device or resource busy");
    }
}
