#![doc = include_str!("../README.md")]

mod config;
mod document;
mod error;
mod expression;
mod functions;
mod http;
mod include;
mod parse;
pub mod resolvers;
mod rewriter;
mod variables;

use std::sync::Arc;

use ::http::header::CONTENT_LENGTH;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, trace};

use crate::include::{locale_from_path, IncludeReplacer, IncludeScanner};
use crate::resolvers::{
    AssignResolver, BreakResolver, ChooseResolver, DeleteResolver, ForeachResolver,
    FunctionResolver, OtherwiseResolver, ReturnResolver, TextResolver, VarsResolver, WhenResolver,
    DELETED_TAGS,
};

pub use crate::config::Configuration;
pub use crate::document::{CompletedInclude, IncludeQueue, IncludeTask, Placeholder, Segment};
pub use crate::error::{ExecutionError, Result};
pub use crate::expression::{
    evaluate_collection, evaluate_concatenation, evaluate_condition, evaluate_expression,
    evaluate_when_condition, interpolate_vars, parse_assignment, parse_collection,
    parse_condition, process_variables, Collection, Condition, Expr,
};
pub use crate::functions::rewrite_builtins;
pub use crate::http::{parse_cookies, Backend, Request, RequestContext, Response};
pub use crate::parse::{DocumentParser, Element, Tag};
pub use crate::rewriter::{ElementHandler, ElementView, Rewriter, TextMode};
pub use crate::variables::{EvalContext, FunctionDef, Value};

/// Country reported through `GEO{'country_code'}` until a geolocation source is wired in.
const DEFAULT_COUNTRY_CODE: &str = "US";

/// A processor for handling ESI responses
///
/// The Processor decides whether a response is an ESI document, runs the scan
/// pass that evaluates directives and launches every fragment request, then the
/// replace pass that substitutes fragments in document order.
///
/// # Fields
/// * `configuration` - Configuration settings controlling ESI processing behavior
/// * `backend` - Fetches origin documents and fragments
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use esi_resolver::{Backend, Configuration, Processor, Request, RequestContext, Response};
///
/// struct Origin;
///
/// #[async_trait]
/// impl Backend for Origin {
///     async fn send(&self, request: Request) -> esi_resolver::Result<Response> {
///         Ok(Response::new(format!("<p>{}</p>", request.uri().path())))
///     }
/// }
///
/// # async fn run() -> esi_resolver::Result<()> {
/// let processor = Processor::new(Arc::new(Origin), Configuration::default());
/// let request = http::Request::get("https://example.com/de/en/").body(String::new())?;
/// let context = RequestContext::new(request)?;
/// let response = processor.handle(context).await?;
/// # Ok(())
/// # }
/// ```
pub struct Processor {
    // The configuration for the processor.
    configuration: Configuration,
    // Where origin and fragment requests are sent.
    backend: Arc<dyn Backend>,
}

impl Processor {
    pub fn new(backend: Arc<dyn Backend>, configuration: Configuration) -> Self {
        Self {
            configuration,
            backend,
        }
    }

    /// Fetches `context.request` from the backend and processes the response.
    ///
    /// Fragments that are not sent to a dedicated fragment host come back through
    /// here, so they are processed with their own evaluation context.
    ///
    /// # Errors
    /// Only if the backend fails to produce the response. Processing failures fall
    /// back to the unprocessed response.
    pub fn handle(&self, context: RequestContext) -> BoxFuture<'_, Result<Response>> {
        async move {
            let response = self.backend.send(context.request.clone()).await?;
            Ok(self.process_response(&context, response).await)
        }
        .boxed()
    }

    /// Whether `response` should be processed at all.
    ///
    /// The body must contain an ESI tag, and processing must be enabled in the
    /// configuration or requested by the opt-in token, and not refused by the
    /// opt-out token.
    pub fn should_process(&self, response: &Response) -> bool {
        if !response.body().contains(&self.configuration.tag_marker()) {
            return false;
        }
        let controls: Vec<&str> = response
            .headers()
            .get_all(self.configuration.control_header.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        let has_token = |token: &str| controls.iter().any(|control| control.contains(token));
        let opted_in = has_token(&self.configuration.opt_in_token);
        let opted_out = has_token(&self.configuration.opt_out_token);
        (self.configuration.enabled || opted_in) && !opted_out
    }

    /// Process a response as an ESI document.
    ///
    /// Never fails: on any processing error the error is logged and the original
    /// response is returned untouched.
    pub async fn process_response(&self, context: &RequestContext, response: Response) -> Response {
        if !self.should_process(&response) {
            trace!("skipping ESI processing for {}", context.url);
            return response;
        }
        match self.process_document(context, response.body()).await {
            Ok(body) => {
                let mut response = response;
                response.headers_mut().remove(CONTENT_LENGTH);
                *response.body_mut() = body;
                response
            }
            Err(err) => {
                error!("error processing ESI document: {}", err);
                response
            }
        }
    }

    /// Runs both passes over `document` and returns the resulting markup.
    ///
    /// # Errors
    /// If the replace pass finds an include that the scan pass did not queue.
    pub async fn process_document(
        &self,
        context: &RequestContext,
        document: &str,
    ) -> Result<String> {
        let (segments, queue) = self.scan(context, document);
        debug!("{} fragment requests in flight", queue.len());

        let mut replacer = IncludeReplacer::new(queue);
        let mut output = String::with_capacity(document.len());
        for segment in segments {
            match segment {
                Segment::Raw(text) => output.push_str(&text),
                Segment::Element(placeholder) if placeholder.name == "include" => {
                    output.push_str(&replacer.element(&placeholder).await?);
                }
                Segment::Element(placeholder) => output.push_str(&placeholder.markup),
            }
        }
        if replacer.remaining() > 0 {
            debug!("{} fragments were never substituted", replacer.remaining());
        }
        Ok(output)
    }

    // The scan pass. Kept synchronous so no handler state is held across an await.
    fn scan<'p>(
        &'p self,
        context: &'p RequestContext,
        document: &str,
    ) -> (Vec<Segment>, IncludeQueue<'p>) {
        let mut ctx = builtin_variables(context);
        let mut includes = IncludeScanner::new(self, context);
        let mut rewriter = Rewriter::new(&self.configuration.namespace)
            .on("include", &mut includes)
            .on("assign", AssignResolver)
            .on("vars", VarsResolver)
            .on("choose", ChooseResolver)
            .on("when", WhenResolver)
            .on("otherwise", OtherwiseResolver)
            .on("foreach", ForeachResolver)
            .on("break", BreakResolver)
            .on("function", FunctionResolver)
            .on("return", ReturnResolver)
            .on("text", TextResolver);
        for name in DELETED_TAGS {
            rewriter = rewriter.on(name, DeleteResolver);
        }
        let segments = rewriter.transform(document, &mut ctx);
        drop(rewriter);
        (segments, includes.into_queue())
    }
}

/// Seeds the variables every document can read from the inbound request.
pub fn builtin_variables(context: &RequestContext) -> EvalContext {
    let url = &context.url;
    let mut ctx = EvalContext::new();
    ctx.set_variable("REQUEST_PATH", Value::from(url.path()));
    ctx.set_variable(
        "HTTP_HOST",
        Value::from(
            context
                .header("host")
                .or_else(|| url.host_str())
                .unwrap_or_default(),
        ),
    );
    for (name, header) in [
        ("HTTP_USER_AGENT", "user-agent"),
        ("HTTP_ACCEPT_LANGUAGE", "accept-language"),
    ] {
        ctx.set_variable(name, Value::from(context.header(header).unwrap_or_default()));
    }
    ctx.set_variable("QUERY_STRING", Value::from(url.query().unwrap_or_default()));
    for (key, value) in url.query_pairs() {
        ctx.set_variable(&format!("QUERY_STRING_{key}"), Value::from(value.into_owned()));
    }
    for (name, value) in context.cookies() {
        ctx.set_variable(&format!("HTTP_COOKIE_{name}"), Value::from(value));
    }
    if let Some((region, language)) = locale_from_path(url.path()) {
        ctx.set_variable("RU", Value::from(region));
        ctx.set_variable("LC", Value::from(language));
    }
    ctx.set_variable("GEO_country_code", Value::from(DEFAULT_COUNTRY_CODE));
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Unused;

    #[async_trait]
    impl Backend for Unused {
        async fn send(&self, _request: Request) -> Result<Response> {
            Err(ExecutionError::RequestError("no origin".to_string()))
        }
    }

    fn context(request: ::http::request::Builder) -> RequestContext {
        RequestContext::new(request.body(String::new()).unwrap()).unwrap()
    }

    #[test]
    fn test_builtin_variables() {
        let ctx = builtin_variables(&context(
            ::http::Request::get("https://shop.example.com/de/en/cart?id=42&q=a+b")
                .header("user-agent", "test-agent")
                .header("cookie", "session=abc; locale=de-en")
                .header("cookie", "theme=dark"),
        ));
        let get = |name: &str| ctx.get_variable(name).map(Value::to_string);
        assert_eq!(get("REQUEST_PATH").as_deref(), Some("/de/en/cart"));
        assert_eq!(get("HTTP_HOST").as_deref(), Some("shop.example.com"));
        assert_eq!(get("HTTP_USER_AGENT").as_deref(), Some("test-agent"));
        assert_eq!(get("HTTP_ACCEPT_LANGUAGE").as_deref(), Some(""));
        assert_eq!(get("QUERY_STRING").as_deref(), Some("id=42&q=a+b"));
        assert_eq!(get("QUERY_STRING_id").as_deref(), Some("42"));
        assert_eq!(get("QUERY_STRING_q").as_deref(), Some("a b"));
        assert_eq!(get("HTTP_COOKIE_session").as_deref(), Some("abc"));
        assert_eq!(get("HTTP_COOKIE_locale").as_deref(), Some("de-en"));
        assert_eq!(get("HTTP_COOKIE_theme").as_deref(), Some("dark"));
        assert_eq!(get("RU").as_deref(), Some("de"));
        assert_eq!(get("LC").as_deref(), Some("en"));
        assert_eq!(get("GEO_country_code").as_deref(), Some("US"));
    }

    #[test]
    fn test_host_header_wins_over_url_host() {
        let ctx = builtin_variables(&context(
            ::http::Request::get("https://10.0.0.1/").header("host", "www.example.com"),
        ));
        assert_eq!(ctx.get_variable("HTTP_HOST"), Some(&Value::from("www.example.com")));
        assert!(!ctx.has_variable("RU"));
    }

    #[test]
    fn test_control_tokens_across_header_values() {
        let processor = Processor::new(
            Arc::new(Unused),
            Configuration::default().with_enabled(false),
        );
        let response = |controls: &[&str]| {
            let mut builder = ::http::Response::builder();
            for control in controls {
                builder = builder.header("edge-control", *control);
            }
            builder.body("<esi:vars/>".to_string()).unwrap()
        };
        assert!(!processor.should_process(&response(&[])));
        assert!(!processor.should_process(&response(&["max-age=60"])));
        assert!(processor.should_process(&response(&["max-age=60", "dca=esi"])));
        assert!(!processor.should_process(&response(&["dca=esi", "dca=noop"])));
    }
}
