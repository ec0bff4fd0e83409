//! waypoint/src/error.rs
//! Crate-wide error kinds for the dispatch engine (handshakes, rule load,
//! dialing). See spec.md §7 for the propagation policy each variant obeys.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request")]
    BadRequest,

    #[error("proxy authentication required")]
    ProxyAuthenticationRequired,

    #[error("request timeout")]
    RequestTimeout,

    #[error("unsupported address")]
    UnsupportedAddress,

    #[error("channel inactive")]
    ChannelInactive,

    #[error("unacceptable status: {0}")]
    UnacceptableStatus(u16),

    #[error("unacceptable read")]
    UnacceptableRead,

    #[error("cancelled: {0}")]
    UserCancelled(String),

    #[error("dial failed: {0}")]
    DialFailed(#[source] Box<Error>),

    #[error("rejected")]
    Rejected,

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("invalid rule at line {cursor}: {reason}")]
    InvalidRule { cursor: usize, reason: String },

    #[error("external resource fetch failed: {0}")]
    ExternalResourceFetch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a terminal handshake failure onto the HTTP status the recipient
    /// must write before closing, per spec.md §4.E step 7.
    pub fn as_http_status(&self) -> u16 {
        match self {
            Error::ProxyAuthenticationRequired => 407,
            Error::BadRequest => 400,
            Error::RequestTimeout => 408,
            _ => 502,
        }
    }
}
