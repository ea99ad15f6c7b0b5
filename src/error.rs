// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error conditions.

use std::time::Duration;

use http::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Result of a connection-level operation.
pub type Result<T> = std::result::Result<T, Error>;

/// A standard Matrix error payload, as returned in the body of non-2xx
/// responses.
#[derive(Clone, Debug, Deserialize)]
pub struct MatrixError {
    /// The machine-readable `M_*` error code.
    #[serde(default)]
    pub errcode: String,
    /// The human-readable error message.
    #[serde(default)]
    pub error: String,
    /// Time to wait before retrying, sent along with `M_LIMIT_EXCEEDED`.
    pub retry_after_ms: Option<u64>,
}

/// An error that can occur on the HTTP transport layer.
#[derive(Error, Debug)]
pub enum HttpError {
    /// An error at the reqwest level, e.g. a connection failure. These are
    /// the transient errors that the retry policy applies to.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// A request needing authentication was made while no access token is
    /// available.
    #[error("the queried endpoint requires authentication but no access token is set")]
    AuthenticationRequired,
    /// A request was made before a homeserver base URL was configured.
    #[error("no homeserver URL is configured")]
    NoHomeserver,
    /// The server answered with a non-2xx status code and a (possibly
    /// empty) Matrix error body.
    #[error("the server returned {status}: [{}] {}", .error.errcode, .error.error)]
    Api {
        /// The HTTP status code of the response.
        status: StatusCode,
        /// The decoded Matrix error body.
        error: MatrixError,
    },
    /// The response body could not be deserialized.
    #[error("couldn't parse the response body: {0}")]
    Json(#[from] serde_json::Error),
    /// The request couldn't be cloned for a retry.
    #[error("the request cannot be cloned")]
    UnableToCloneRequest,
}

impl HttpError {
    pub(crate) fn api(status: StatusCode, body: &[u8]) -> Self {
        let error = serde_json::from_slice::<MatrixError>(body).unwrap_or(MatrixError {
            errcode: String::new(),
            error: String::from_utf8_lossy(body).into_owned(),
            retry_after_ms: None,
        });
        HttpError::Api { status, error }
    }

    /// The delay the server asked us to honour before resubmitting, if this
    /// is a rate-limit response.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HttpError::Api { status, error } if *status == StatusCode::TOO_MANY_REQUESTS => {
                Some(Duration::from_millis(error.retry_after_ms.unwrap_or(5_000)))
            }
            _ => None,
        }
    }

    /// Whether retrying the request can reasonably lead to a different
    /// outcome. Parse failures and most 4xx responses are final.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Reqwest(e) => !e.is_builder() && !e.is_redirect(),
            HttpError::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// The error taxonomy surfaced by [`Connection`](crate::Connection)
/// operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The homeserver couldn't be located from the given user identifier.
    #[error("failed to resolve the homeserver: {0}")]
    Resolve(String),
    /// The login endpoints rejected us, or a required login flow is not
    /// advertised by the homeserver. Carries the server's raw error text.
    #[error("login failed: {0}")]
    Login(String),
    /// A non-transient failure of the sync loop after retries.
    #[error("sync failed: {0}")]
    Sync(String),
    /// The access token became invalid, e.g. it was revoked remotely.
    #[error("the access token is not valid anymore")]
    Unauthorised,
    /// The queried resource does not exist on the server.
    #[error("not found")]
    NotFound,
    /// The server did not understand the request.
    #[error("incorrect request: {0}")]
    IncorrectRequest(String),
    /// The server sent a response the library cannot make sense of.
    #[error("incorrect response from the server: {0}")]
    IncorrectResponse(String),
    /// Access to the requested content was denied.
    #[error("access to the content was denied")]
    ContentAccess,
    /// A JSON payload could not be parsed.
    #[error("JSON parsing failed: {0}")]
    JsonParse(#[from] serde_json::Error),
    /// A transport-level failure after the retry policy gave up.
    #[error(transparent)]
    Http(HttpError),
    /// The job was abandoned before it produced a result.
    #[error("the request was abandoned")]
    Abandoned,
    /// The operation needs a logged-in connection.
    #[error("the connection is not logged in")]
    NotLoggedIn,
    /// A failure of the local state cache or settings storage.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    /// A failure inside the end-to-end encryption machinery.
    #[cfg(feature = "encryption")]
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        match &e {
            HttpError::Api { status, error } => match *status {
                StatusCode::UNAUTHORIZED => Error::Unauthorised,
                StatusCode::FORBIDDEN if error.errcode == "M_UNKNOWN_TOKEN" => Error::Unauthorised,
                StatusCode::FORBIDDEN => Error::ContentAccess,
                StatusCode::NOT_FOUND => Error::NotFound,
                StatusCode::BAD_REQUEST => Error::IncorrectRequest(error.error.clone()),
                _ => Error::Http(e),
            },
            _ => Error::Http(e),
        }
    }
}

impl Error {
    /// A text sample of the server's raw error response, where one is
    /// available. Used when reporting login and sync errors.
    pub fn raw_data_sample(&self) -> String {
        match self {
            Error::Http(HttpError::Api { error, .. }) => error.error.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_hint_is_exposed() {
        let err = HttpError::api(
            StatusCode::TOO_MANY_REQUESTS,
            br#"{"errcode":"M_LIMIT_EXCEEDED","error":"Too Many Requests","retry_after_ms":2000}"#,
        );
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2000)));
        assert!(err.is_transient());
    }

    #[test]
    fn revoked_token_maps_to_unauthorised() {
        let err = HttpError::api(
            StatusCode::UNAUTHORIZED,
            br#"{"errcode":"M_UNKNOWN_TOKEN","error":"Invalid macaroon"}"#,
        );
        assert!(!err.is_transient());
        assert!(matches!(Error::from(err), Error::Unauthorised));
    }

    #[test]
    fn not_found_maps_through() {
        let err = HttpError::api(StatusCode::NOT_FOUND, br#"{"errcode":"M_NOT_FOUND"}"#);
        assert!(matches!(Error::from(err), Error::NotFound));
    }
}
