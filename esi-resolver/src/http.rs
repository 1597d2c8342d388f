use crate::{ExecutionError, Result};
use async_trait::async_trait;
use http::header::{HeaderMap, COOKIE, HOST};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use url::Url;

/// Requests carry no body: fragments are always fetched with `GET`.
pub type Request = http::Request<String>;
pub type Response = http::Response<String>;

/// The network capability used for origin documents and fragments.
///
/// `send` must not block: the returned future is stored during the scan pass and
/// only awaited once the replace pass reaches the corresponding include.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

/// The inbound request of one processing invocation together with the
/// host-config variables (fragment host and header overrides) visible to it.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request: Request,
    /// The absolute URL of `request`.
    pub url: Url,
    variables: HashMap<String, String>,
}

impl RequestContext {
    /// # Errors
    /// If no absolute URL can be built from the request URI and its `host` header.
    pub fn new(request: Request) -> Result<Self> {
        let url = absolute_url(&request)?;
        Ok(Self {
            request,
            url,
            variables: HashMap::new(),
        })
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// The first value of header `name`, if it is visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(self.request.headers(), name)
    }

    /// A context for a nested fragment invocation: same host config, new request.
    pub(crate) fn for_fragment(&self, request: Request, url: Url) -> Self {
        Self {
            request,
            url,
            variables: self.variables.clone(),
        }
    }

    /// Every cookie sent with the request, across all `cookie` headers.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_cookies)
            .collect()
    }
}

pub(crate) fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// Origin-form URIs (`/path?q`) are completed from the `host` header.
fn absolute_url(request: &Request) -> Result<Url> {
    let uri = request.uri();
    let text = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        let host = header_str(request.headers(), HOST.as_str())
            .ok_or_else(|| ExecutionError::InvalidRequestUrl(uri.to_string()))?;
        format!("http://{host}{uri}")
    };
    Url::parse(&text).map_err(|_| ExecutionError::InvalidRequestUrl(text))
}

/// Splits a `Cookie` header into `(name, value)` pairs, percent-decoding values.
pub fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() || value.is_empty() {
                return None;
            }
            let value = percent_decode_str(value)
                .decode_utf8()
                .map_or_else(|_| value.to_string(), |v| v.into_owned());
            Some((name.to_string(), value))
        })
        .collect()
}
