//! Network gateway contract.
//!
//! The sync core describes remote calls as plain [`Request`] values and hands
//! them to a [`Gateway`]. Requests are built by composition: start from
//! [`Request::new`] and apply the pure transforms (`with_auth`,
//! `with_query_string`, `with_delta_projection`, `with_id_filter`).

mod auth;
mod http;
mod memory;
mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::Result;
use crate::models::{ID_FIELD, LAST_MODIFIED_FIELD, METADATA_FIELD};
use crate::query::Query;

pub use auth::{AppCredentials, AuthProvider, AuthRequirement, Credentials};
pub use http::HttpGateway;
pub use memory::{FailureKind, MemoryGateway, RecordedRequest};
pub use remote::{FetchedEntities, Remote};

/// Response header carrying the server time the request was received.
pub const REQUEST_START_HEADER: &str = "x-request-start";

/// HTTP method of a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one remote call
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path below the base URL, segments already percent-encoded
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub auth: AuthRequirement,
    /// Resolved credentials, filled in by [`Request::with_auth`]
    pub credentials: Option<Credentials>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            auth: AuthRequirement::Default,
            credentials: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub const fn with_auth_requirement(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Resolve the request's auth requirement against a provider.
    pub fn with_auth(mut self, provider: &dyn AuthProvider) -> Result<Self> {
        self.credentials = auth::resolve(self.auth, provider)?;
        Ok(self)
    }

    /// Encode a query's filter, sort, paging and projection as parameters.
    #[must_use]
    pub fn with_query_string(mut self, query: &Query) -> Self {
        self.query.extend(query.to_params());
        self
    }

    /// Restrict the response to ids and last-modified timestamps.
    ///
    /// Paging and sort are dropped: the projection must cover every id
    /// matching the filter.
    #[must_use]
    pub fn with_delta_projection(mut self) -> Self {
        for key in ["skip", "limit", "sort"] {
            self.query.remove(key);
        }
        self.query.insert(
            "fields".to_string(),
            format!("{ID_FIELD},{METADATA_FIELD}.{LAST_MODIFIED_FIELD}"),
        );
        self
    }

    /// Replace the filter with an `_id $in [...]` match.
    #[must_use]
    pub fn with_id_filter<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids.into_iter().map(Into::into).collect::<Vec<String>>();
        self.query.insert(
            "query".to_string(),
            json!({ ID_FIELD: { "$in": ids } }).to_string(),
        );
        self
    }
}

/// Normalized response of a remote call
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    /// Header names are lower-cased
    pub headers: BTreeMap<String, String>,
    pub data: Value,
}

impl Response {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            data,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Server receipt time, used as the pull cursor
    #[must_use]
    pub fn request_start(&self) -> Option<&str> {
        self.header(REQUEST_START_HEADER)
    }
}

/// Executes requests against the remote service.
///
/// Implementations map failures onto the typed errors of [`crate::Error`]:
/// `NotFound`, `InvalidCredentials`, `Validation`, `Server`, `Timeout`
/// and `Network`.
pub trait Gateway: Send + Sync {
    fn execute(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

impl<G: Gateway> Gateway for Arc<G> {
    fn execute(&self, request: Request) -> impl Future<Output = Result<Response>> + Send {
        self.as_ref().execute(request)
    }
}

/// Path of a collection or one of its entities under `/appdata/{app_key}`.
#[must_use]
pub fn appdata_path(app_key: &str, collection: &str, id: Option<&str>) -> String {
    let mut path = format!(
        "/appdata/{}/{}",
        urlencoding::encode(app_key),
        urlencoding::encode(collection)
    );
    if let Some(id) = id {
        path.push('/');
        path.push_str(&urlencoding::encode(id));
    }
    path
}
