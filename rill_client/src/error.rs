use rill_proto::message::ErrorCode;

/// Errors returned by stream and context operations.
///
/// Validation failures ([`BadState`](Error::BadState), [`Invalid`](Error::Invalid),
/// [`NotSupported`](Error::NotSupported), [`NoData`](Error::NoData)) and
/// [`Exhausted`](Error::Exhausted) are reported synchronously and leave every
/// piece of state untouched.
///
/// [`Protocol`](Error::Protocol), [`Decode`](Error::Decode) and
/// [`Transport`](Error::Transport) are fatal: by the time the caller sees
/// them, the whole connection and every stream bound to it have failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation not valid in the current state")]
    BadState,
    #[error("invalid argument")]
    Invalid,
    #[error("not supported by the negotiated protocol version")]
    NotSupported,
    #[error("no valid timing data")]
    NoData,
    #[error("too many outstanding timing requests")]
    Exhausted,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("malformed message: {0}")]
    Decode(#[from] postcard::Error),
    #[error("server error: {0:?}")]
    Server(ErrorCode),
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    /// The wire error code closest to this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadState => ErrorCode::BadState,
            Self::Invalid => ErrorCode::Invalid,
            Self::NotSupported => ErrorCode::NotSupported,
            Self::NoData => ErrorCode::NoData,
            Self::Exhausted => ErrorCode::Internal,
            Self::Protocol(_) | Self::Decode(_) => ErrorCode::Protocol,
            Self::Server(code) => *code,
            Self::Transport(_) => ErrorCode::ConnectionTerminated,
        }
    }

    /// Whether this error takes the whole connection down.
    #[inline(always)]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Decode(_) | Self::Transport(_))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
