//! Representations of errors returned by this crate.

use std::io;

/// Convenience alias for `Result` with [`Error`](Error) as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Set of errors that can occur while talking to a datalogger.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The link opened but the node never answered a hello command.
    #[error("no response from the datalogger node")]
    NoDevice,

    /// The peer reported that it could not deliver our command (message
    /// type 0x81).
    #[error("the node reported a delivery failure (code {0:#04x})")]
    DeliveryFailure(u8),

    /// A file upload was refused by the datalogger (response code 1).
    #[error("permission denied for file {0:?}")]
    PermissionDenied(String),

    /// No matching response arrived within the link timeout.
    #[error("timed out waiting for a response to transaction {0}")]
    Timeout(u8),

    /// A response body did not decode against its declared layout.
    #[error("malformed response data: {0}")]
    BadData(String),

    /// A well-formed packet carried a protocol/message-type pair this
    /// crate has no handler for.
    #[error("no handler for protocol {hi_proto:#03x} message type {msg_type:#04x}")]
    Unsupported {
        /// Higher-level protocol code of the offending packet.
        hi_proto: u8,

        /// Message type of the offending packet.
        msg_type: u8,
    },

    /// The requested table is not present in the table definitions.
    #[error("table {0:?} is not defined on the datalogger")]
    TableNotFound(String),

    /// A connection URL could not be understood.
    #[error("unrecognized link url {0:?}")]
    BadUrl(String),

    /// The underlying byte stream failed.
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
}
