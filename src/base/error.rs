use thiserror::Error;

/// Crate-wide error type.
///
/// Most of these never cross the `StreamConnection` boundary: network and
/// transport failures are caught there, logged, and turned into an empty
/// response. The exceptions are the contract violations
/// ([`NetError::ContentLengthOverflow`], [`NetError::UnsupportedOperation`],
/// [`NetError::MethodNotSupported`], [`NetError::InvalidUrl`]), which are
/// always surfaced to the caller.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Connection / transport
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Proxy tunnel failed")]
    ProxyTunnelFailed,

    // Request construction
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Invalid header")]
    InvalidHeader,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Unknown session")]
    UnknownSession,

    // Response handling
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Body read failed")]
    BodyReadFailed,
    #[error("Download write failed")]
    DownloadWriteFailed,

    // Contract violations (always loud, never swallowed)
    #[error("Content length exceeds 32-bit range")]
    ContentLengthOverflow,
    #[error("Unsupported operation")]
    UnsupportedOperation,

    // Startup
    #[error("Engine start failed")]
    EngineStartFailed,
}
