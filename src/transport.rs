//! The narrow interface to whatever HTTP client actually talks to the cluster.

use std::fmt::{self, Debug, Display};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::TransportError;

/// The HTTP methods used for document operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    #[allow(missing_docs)]
    Post,
    #[allow(missing_docs)]
    Put,
    #[allow(missing_docs)]
    Delete,
}

/// A request ready to be sent to any endpoint.
///
/// Cheaply cloneable, so it can be resent on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Path and query, relative to the endpoint.
    pub path: String,
    /// Header names and values.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

/// A response from an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

/// Sends requests to a single endpoint.
///
/// Implementations own their connection pool and must enforce their own transport-level
/// timeouts. `send` must never fail synchronously: every failure surfaces through the returned
/// future.
pub trait Transport: Debug + Send + Sync {
    /// Send the request, resolving with the response or the reason none was received.
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, Result<HttpResponse, TransportError>>;

    /// Tear down all connections to the endpoint.
    fn close(&self) -> Result<(), TransportError>;
}

impl HttpRequest {
    /// Size of the body in bytes.
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }
}

impl HttpResponse {
    #[allow(missing_docs)]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// The body as text, for use in result messages.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl Method {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
