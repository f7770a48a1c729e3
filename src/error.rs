use snafu::Snafu;

/// Errors produced by the client core.
///
/// Mirrors the four kinds this crate's protocol layer can surface: a failing
/// transport, a handshake that never completed, a structurally invalid inbound
/// message, an operation attempted before the pin table exists, plus the
/// underlying UTF-8 conversion the codec needs when decoding device strings.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// transport operation failed: {source}
    Transport { source: std::io::Error },

    /// handshake failed before a connection could be established
    Handshake { source: Box<Error> },

    /// received a malformed message: {reason}
    Malformed { reason: String },

    /// invalid UTF-8 in a decoded device string: {source}
    Utf8 { source: std::str::Utf8Error },

    /// operation requires an active connection
    NotConnected,
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Malformed {
            reason: reason.into(),
        }
    }

    pub(crate) fn into_handshake(self) -> Self {
        Error::Handshake {
            source: Box::new(self),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Transport { source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
