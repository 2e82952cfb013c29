//! `reqwest`-backed gateway.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use super::{Credentials, Gateway, Method, Request, Response};
use crate::error::{Error, Result};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const SESSION_SCHEME: &str = "Kinvey";

/// Gateway speaking HTTP to the backend
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                Error::Config("base_url must include http:// or https://".to_string())
            })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: Request) -> Result<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&request.query);
        builder = match &request.credentials {
            Some(Credentials::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credentials::Session(token)) => builder.header(
                reqwest::header::AUTHORIZATION,
                format!("{SESSION_SCHEME} {token}"),
            ),
            None => builder,
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = %request.method, path = %request.path, "Sending request");
        let response = builder.send().await.map_err(map_transport_error)?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        let data = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body)?
        };
        Ok(Response {
            status: status.as_u16(),
            headers,
            data,
        })
    }
}

impl Gateway for HttpGateway {
    fn execute(
        &self,
        request: Request,
    ) -> impl std::future::Future<Output = Result<Response>> + Send {
        self.send(request)
    }
}

fn map_transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::Network(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    description: Option<String>,
    debug: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        let message = payload
            .description
            .or(payload.error)
            .or(payload.debug)
            .and_then(|message| normalize_text_option(Some(message)));
        if let Some(message) = message {
            return message;
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}

fn map_status_error(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status.as_u16() {
        404 => Error::NotFound(message),
        401 | 403 => Error::InvalidCredentials(message),
        400 | 409 | 422 => Error::Validation(message),
        code @ 500..=599 => Error::Server {
            status: code,
            message,
        },
        code => Error::Network(format!("unexpected HTTP {code}: {message}")),
    }
}
