//! The HTTP fetcher contract.
//!
//! The consumer needs exactly one transport operation: a blocking POST whose
//! response is a status code and a body. Implementations are free to use any
//! HTTP client; the [`Fetcher`] trait is automatically implemented for
//! closures so tests can script providers inline.
//!
//! # Security Warning
//!
//! To prevent SSRF vulnerabilities, implementations should configure their
//! HTTP client **not to follow redirects** when talking to untrusted
//! provider endpoints.

use http::StatusCode;
use url::Url;

use std::error::Error;

/// An HTTP response returned by a [`Fetcher`].
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status_code: StatusCode,
    /// The raw response body.
    pub body: Vec<u8>,
}

/// A blocking HTTP client capable of POSTing a body to a provider endpoint.
///
/// This trait is implemented for any function or closure of the form:
/// ```rust,ignore
/// Fn(&Url, &[u8]) -> Result<HttpResponse, E>
/// where
///   E: std::error::Error + 'static
/// ```
pub trait Fetcher {
    /// Error type returned by the transport.
    type Error: Error + 'static;

    /// POST `body` to `url` and return the response.
    fn post(&self, url: &Url, body: &[u8]) -> Result<HttpResponse, Self::Error>;
}

impl<E, F> Fetcher for F
where
    E: Error + 'static,
    F: Fn(&Url, &[u8]) -> Result<HttpResponse, E>,
{
    type Error = E;

    fn post(&self, url: &Url, body: &[u8]) -> Result<HttpResponse, E> {
        self(url, body)
    }
}
