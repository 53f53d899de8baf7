//! Error type for WebHDFS calls.

use thiserror::Error;

use crate::models::RemoteException;

/// Errors returned by the WebHDFS client.
#[derive(Debug, Error)]
pub enum WebHdfsError {
    /// The name node or data node answered with a Hadoop remote exception.
    #[error("{exception} (http {status}): {message}")]
    Remote {
        status: u16,
        exception: String,
        message: String,
    },

    /// An operation returned `{"boolean": false}` without an exception.
    #[error("{0} was rejected by the name node")]
    Rejected(&'static str),

    /// The redirect handshake with the data node went off script.
    #[error("redirect: {0}")]
    Redirect(String),

    /// Transport-level failure.
    #[error("connection: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("timeout")]
    Timeout,

    /// The response body could not be decoded.
    #[error("decoding response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Anything else.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WebHdfsError {
    pub(crate) fn from_remote(status: u16, e: RemoteException) -> Self {
        Self::Remote {
            status,
            exception: e.exception,
            message: e.message,
        }
    }

    pub(crate) fn from_ureq(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Timeout(_) => Self::Timeout,
            ureq::Error::HostNotFound => Self::Connection("host not found".to_owned()),
            ureq::Error::Io(e) => Self::Connection(e.to_string()),
            e => Self::Other(Box::new(e)),
        }
    }

    /// The path named in the request does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Remote {
                status, exception, ..
            } => *status == 404 || exception == "FileNotFoundException",
            _ => false,
        }
    }

    /// The path named in the request already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::Remote { exception, .. } if exception == "FileAlreadyExistsException"
        )
    }
}
