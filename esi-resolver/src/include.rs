//! The two `<esi:include>` handlers.
//!
//! [`IncludeScanner`] runs during the scan pass: it resolves the fragment URL,
//! dispatches the request without waiting for it and keeps the element as a
//! placeholder. [`IncludeReplacer`] runs during the replace pass and swaps each
//! placeholder for its fragment, strictly in the order the requests were queued.

use std::borrow::Cow;

use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, HOST};
use http::StatusCode;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::document::{CompletedInclude, IncludeQueue, IncludeTask, Placeholder};
use crate::http::{Request, RequestContext, Response};
use crate::rewriter::{ElementHandler, ElementView};
use crate::variables::EvalContext;
use crate::{ExecutionError, Processor, Result};

static LOCALE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/([a-z]{2})/([a-z]{2})(?:/|$)").unwrap());
static QUERY_PARAMETER_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\(QUERY_STRING\{'(.*?)'\}\)").unwrap());

/// The region and language of a `/de/en/...` path.
pub fn locale_from_path(path: &str) -> Option<(&str, &str)> {
    let caps = LOCALE_PREFIX.captures(path)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

pub struct IncludeScanner<'p> {
    processor: &'p Processor,
    context: &'p RequestContext,
    queue: IncludeQueue<'p>,
}

impl<'p> IncludeScanner<'p> {
    pub fn new(processor: &'p Processor, context: &'p RequestContext) -> Self {
        Self {
            processor,
            context,
            queue: IncludeQueue::new(),
        }
    }

    /// Substitutes `$(REQUEST_PATH)`, `$(QUERY_STRING{'k'})`, `$(RU)` and `$(LC)`
    /// from the inbound URL. Other references are left alone.
    pub fn rewrite_src(&self, src: &str) -> String {
        let inbound = &self.context.url;
        let src = src.replace("$(REQUEST_PATH)", inbound.path());
        let src = QUERY_PARAMETER_REF.replace_all(&src, |caps: &Captures| {
            inbound
                .query_pairs()
                .find(|(key, _)| key == &caps[1])
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default()
        });
        let (region, language) = locale_from_path(inbound.path()).unwrap_or_default();
        src.replace("$(RU)", region).replace("$(LC)", language)
    }

    /// Decodes entities such as `&amp;` in the `src` attribute as written.
    ///
    /// Text that is not valid escaped markup, like a bare `&`, is used as is.
    pub fn unescape_src<'s>(&self, src: &'s str) -> Cow<'s, str> {
        if !self.processor.configuration.is_escaped_content {
            return Cow::Borrowed(src);
        }
        quick_xml::escape::unescape(src).unwrap_or_else(|err| {
            debug!("using src `{}` as written: {}", src, err);
            Cow::Borrowed(src)
        })
    }

    /// Resolves `src` against the inbound URL, keeping its scheme and port.
    ///
    /// The host is the configured fragment host if there is one, otherwise the inbound host.
    pub fn resolve_url(&self, src: &str) -> Result<Url> {
        let invalid = || ExecutionError::InvalidRequestUrl(src.to_string());
        let inbound = &self.context.url;
        let mut url = inbound.join(src).map_err(|_| invalid())?;
        url.set_scheme(inbound.scheme()).map_err(|_| invalid())?;
        url.set_port(inbound.port()).map_err(|_| invalid())?;
        let host = match self.fragment_host() {
            Some(host) => host,
            None => inbound.host_str().ok_or_else(invalid)?,
        };
        url.set_host(Some(host)).map_err(|_| invalid())?;
        Ok(url)
    }

    /// A `GET` for `url` with the fragment, loop and `host` headers plus any
    /// configured extra headers. Extra headers that are not valid HTTP are skipped.
    pub fn build_request(&self, url: &Url) -> Result<Request> {
        let configuration = &self.processor.configuration;
        let mut request = http::Request::get(url.as_str())
            .header(configuration.fragment_header.as_str(), "true")
            .header(configuration.loop_header.as_str(), configuration.loop_token.as_str())
            .header(HOST, url.host_str().unwrap_or_default())
            .body(String::new())?;
        if let Some(extra) = self
            .context
            .get_variable(&configuration.fragment_headers_variable)
        {
            for (name, value) in extra.split(',').filter_map(|pair| pair.split_once('=')) {
                match (
                    HeaderName::from_bytes(name.trim().as_bytes()),
                    HeaderValue::from_str(value.trim()),
                ) {
                    (Ok(name), Ok(value)) => {
                        request.headers_mut().insert(name, value);
                    }
                    _ => warn!("skipping invalid fragment header `{}`", name.trim()),
                }
            }
        }
        Ok(request)
    }

    fn fragment_host(&self) -> Option<&'p str> {
        self.context
            .get_variable(&self.processor.configuration.fragment_host_variable)
    }

    // A configured fragment host is fetched directly; anything else goes back
    // through the processor as a nested invocation.
    fn dispatch(&self, request: Request, url: Url) -> BoxFuture<'p, Result<Response>> {
        let processor: &'p Processor = self.processor;
        if self.fragment_host().is_some() {
            processor.backend.send(request)
        } else {
            processor.handle(self.context.for_fragment(request, url))
        }
    }

    pub fn into_queue(self) -> IncludeQueue<'p> {
        self.queue
    }
}

impl ElementHandler for IncludeScanner<'_> {
    fn element(&mut self, element: &mut ElementView<'_, '_>, _ctx: &mut EvalContext) -> Result<()> {
        let src = element.required_attribute("src")?;
        let src = self.unescape_src(src);
        let url = self.resolve_url(&self.rewrite_src(&src))?;
        let request = self.build_request(&url)?;
        debug!("dispatching fragment request for {}", url);
        let response = self.dispatch(request.clone(), url.clone());
        self.queue.push(IncludeTask {
            url,
            request,
            response,
        });
        Ok(())
    }
}

/// Substitutes include placeholders with fragment bodies in queue order.
pub struct IncludeReplacer<'p> {
    queue: IncludeQueue<'p>,
}

impl<'p> IncludeReplacer<'p> {
    pub fn new(queue: IncludeQueue<'p>) -> Self {
        Self { queue }
    }

    /// Waits for the next queued fragment and returns the text that replaces `placeholder`.
    ///
    /// With `onerror="continue"` a fragment whose status is not 200 or 204 yields
    /// an empty string. Otherwise the body is used whatever the status.
    pub async fn element(&mut self, placeholder: &Placeholder) -> Result<String> {
        let continue_on_error = placeholder.get_attribute("onerror") == Some("continue");
        let CompletedInclude { url, response } = self
            .queue
            .next()
            .await
            .ok_or_else(|| ExecutionError::IncludeQueueExhausted(placeholder.markup.clone()))?;

        let response = response.unwrap_or_else(|err| {
            warn!("fragment request for {} failed: {}", url, err);
            let mut response = Response::new(String::new());
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            response
        });
        let status = response.status();
        if continue_on_error && status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            debug!("fragment {} returned {}, continuing without it", url, status);
            return Ok(String::new());
        }
        Ok(response.into_body())
    }

    /// Fragments queued but never claimed by a placeholder.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{header_str, Backend};
    use crate::Configuration;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        async fn send(&self, request: Request) -> Result<Response> {
            Ok(Response::new(format!("fetched {}", request.uri().path())))
        }
    }

    fn get(url: &str) -> Request {
        http::Request::get(url).body(String::new()).unwrap()
    }

    fn context(url: &str) -> RequestContext {
        RequestContext::new(get(url)).unwrap()
    }

    fn processor() -> Processor {
        Processor::new(Arc::new(Echo), Configuration::default())
    }

    fn completed(status: u16, body: &'static str) -> IncludeTask<'static> {
        let url = Url::parse("https://example.com/f").unwrap();
        IncludeTask {
            request: get(url.as_str()),
            url,
            response: Box::pin(async move {
                Ok(http::Response::builder()
                    .status(status)
                    .body(body.to_string())
                    .unwrap())
            }),
        }
    }

    fn refused() -> IncludeTask<'static> {
        let url = Url::parse("https://example.com/f").unwrap();
        IncludeTask {
            request: get(url.as_str()),
            url,
            response: Box::pin(async { Err(ExecutionError::RequestError("refused".to_string())) }),
        }
    }

    fn placeholder(onerror: Option<&str>) -> Placeholder {
        Placeholder {
            name: "include".to_string(),
            attributes: onerror
                .map(|value| vec![("onerror".to_string(), value.to_string())])
                .unwrap_or_default(),
            markup: "<esi:include/>".to_string(),
        }
    }

    #[test]
    fn test_locale_from_path() {
        assert_eq!(locale_from_path("/de/en/page"), Some(("de", "en")));
        assert_eq!(locale_from_path("/de/en"), Some(("de", "en")));
        assert_eq!(locale_from_path("/deu/en/"), None);
        assert_eq!(locale_from_path("/x/de/en/"), None);
    }

    #[test]
    fn test_rewrite_src() {
        let processor = processor();
        let ctx = context("https://shop.example.com/de/en/cart?id=42&q=a%20b");
        let scanner = IncludeScanner::new(&processor, &ctx);
        assert_eq!(
            scanner.rewrite_src(
                "/frag$(REQUEST_PATH)?id=$(QUERY_STRING{'id'})&q=$(QUERY_STRING{'q'})&x=$(QUERY_STRING{'none'})"
            ),
            "/frag/de/en/cart?id=42&q=a b&x="
        );
        assert_eq!(scanner.rewrite_src("/$(RU)/$(LC)/header"), "/de/en/header");
        assert_eq!(scanner.rewrite_src("/$(HTTP_HOST)"), "/$(HTTP_HOST)");

        let ctx = context("https://shop.example.com/cart");
        let scanner = IncludeScanner::new(&processor, &ctx);
        assert_eq!(scanner.rewrite_src("/$(RU)/$(LC)/header"), "///header");
    }

    #[test]
    fn test_resolve_url_keeps_scheme_and_port() {
        let processor = processor();
        let ctx = context("http://shop.example.com:8080/de/en/");
        let scanner = IncludeScanner::new(&processor, &ctx);
        let url = scanner
            .resolve_url("https://other.example.org:9443/frag?a=1&b=2")
            .unwrap();
        assert_eq!(url.as_str(), "http://shop.example.com:8080/frag?a=1&b=2");
        let url = scanner.resolve_url("header").unwrap();
        assert_eq!(url.as_str(), "http://shop.example.com:8080/de/en/header");
    }

    #[test]
    fn test_unescape_src() {
        let processor = processor();
        let ctx = context("https://shop.example.com/");
        let scanner = IncludeScanner::new(&processor, &ctx);
        assert_eq!(scanner.unescape_src("/frag?a=1&amp;b=2"), "/frag?a=1&b=2");
        assert_eq!(scanner.unescape_src("/frag?a=1&b=2"), "/frag?a=1&b=2");
        assert_eq!(scanner.unescape_src("/frag"), "/frag");

        let raw = Processor::new(Arc::new(Echo), Configuration::default().with_escaped(false));
        let scanner = IncludeScanner::new(&raw, &ctx);
        assert_eq!(scanner.unescape_src("/frag?a=1&amp;b=2"), "/frag?a=1&amp;b=2");
    }

    #[test]
    fn test_substituted_values_are_not_unescaped() {
        let processor = processor();
        let ctx = context("https://shop.example.com/?q=a%26amp%3Bb");
        let scanner = IncludeScanner::new(&processor, &ctx);
        let src = scanner.unescape_src("/frag?x=$(QUERY_STRING{'q'})&amp;y=1");
        assert_eq!(scanner.rewrite_src(&src), "/frag?x=a&amp;b&y=1");
    }

    #[test]
    fn test_resolve_url_uses_fragment_host() {
        let processor = processor();
        let ctx = context("https://shop.example.com/")
            .with_variable("builtin.ESI_FRAGMENT_HOST", "fragments.internal");
        let scanner = IncludeScanner::new(&processor, &ctx);
        let url = scanner.resolve_url("/frag").unwrap();
        assert_eq!(url.as_str(), "https://fragments.internal/frag");
    }

    #[test]
    fn test_build_request_headers() {
        let processor = processor();
        let ctx = context("https://shop.example.com/").with_variable(
            "builtin.ESI_FRAGMENT_HEADERS",
            "x-a=1, x-b = two,broken,bad name=x",
        );
        let scanner = IncludeScanner::new(&processor, &ctx);
        let url = Url::parse("https://shop.example.com/frag").unwrap();
        let request = scanner.build_request(&url).unwrap();
        let headers = request.headers();
        assert_eq!(request.uri().to_string(), "https://shop.example.com/frag");
        assert_eq!(header_str(headers, "x-esi-fragment"), Some("true"));
        assert_eq!(header_str(headers, "x-esi-loop"), Some("1"));
        assert_eq!(header_str(headers, "host"), Some("shop.example.com"));
        assert_eq!(header_str(headers, "x-a"), Some("1"));
        assert_eq!(header_str(headers, "x-b"), Some("two"));
        assert!(!headers.contains_key("broken"));
        assert_eq!(headers.len(), 5);
    }

    #[tokio::test]
    async fn test_replacer_applies_onerror() {
        let mut queue = IncludeQueue::new();
        queue.push(completed(500, "error page"));
        queue.push(completed(500, "error page"));
        queue.push(completed(204, "error page"));
        let mut replacer = IncludeReplacer::new(queue);

        let continuing = placeholder(Some("continue"));
        let plain = placeholder(None);
        assert_eq!(replacer.element(&continuing).await.unwrap(), "");
        assert_eq!(replacer.element(&plain).await.unwrap(), "error page");
        assert_eq!(replacer.element(&continuing).await.unwrap(), "error page");
        assert_eq!(replacer.remaining(), 0);
        assert!(matches!(
            replacer.element(&plain).await,
            Err(ExecutionError::IncludeQueueExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_bad_gateway() {
        let mut queue = IncludeQueue::new();
        queue.push(refused());
        queue.push(refused());
        let mut replacer = IncludeReplacer::new(queue);
        assert_eq!(replacer.element(&placeholder(Some("continue"))).await.unwrap(), "");
        assert_eq!(replacer.element(&placeholder(None)).await.unwrap(), "");
    }
}
