use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use log::trace;
use url::Url;

use crate::http::{Request, Response};
use crate::parse::Tag;
use crate::Result;

/// A section of a scanned document, either final text or an element left for the replace pass.
///
/// * `Raw` - Text that needs no further processing.
/// * `Element` - An element kept by a scan-pass handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Raw(String),
    Element(Placeholder),
}

/// An owned copy of an ESI element that survived the scan pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// The element's original source, emitted if no replace-pass handler claims it.
    pub markup: String,
}

impl Placeholder {
    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl From<&Tag<'_>> for Placeholder {
    fn from(tag: &Tag<'_>) -> Self {
        Self {
            name: tag.name.to_string(),
            attributes: tag
                .attributes
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            markup: tag.markup.to_string(),
        }
    }
}

/// A fragment request issued during the scan pass.
///
/// # Fields
///
/// * `url` - The resolved absolute fragment URL.
/// * `request` - The sub-request as it was dispatched.
/// * `response` - The in-flight result. Not polled until the queue is awaited.
pub struct IncludeTask<'a> {
    pub url: Url,
    pub request: Request,
    pub response: BoxFuture<'a, Result<Response>>,
}

impl std::fmt::Debug for IncludeTask<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IncludeTask({})", self.url)
    }
}

/// The outcome of one include, yielded by [`IncludeQueue::next`].
#[derive(Debug)]
pub struct CompletedInclude {
    pub url: Url,
    pub response: Result<Response>,
}

/// FIFO queue of fragment fetches.
///
/// Every queued fetch makes progress whenever the queue is awaited, but results
/// are yielded strictly in the order the tasks were pushed.
#[derive(Default)]
pub struct IncludeQueue<'a> {
    pending: FuturesOrdered<BoxFuture<'a, CompletedInclude>>,
}

impl<'a> IncludeQueue<'a> {
    pub fn new() -> Self {
        Self {
            pending: FuturesOrdered::new(),
        }
    }

    pub fn push(&mut self, task: IncludeTask<'a>) {
        let IncludeTask {
            url,
            request,
            response,
        } = task;
        trace!(
            "queued {} {} with headers {:?}",
            request.method(),
            url,
            request.headers()
        );
        self.pending.push_back(
            async move {
                CompletedInclude {
                    url,
                    response: response.await,
                }
            }
            .boxed(),
        );
    }

    /// Waits for the oldest task. `None` once every pushed task has been yielded.
    pub async fn next(&mut self) -> Option<CompletedInclude> {
        self.pending.next().await
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(path: &str, delay_ms: u64, body: &'static str) -> IncludeTask<'static> {
        let url = Url::parse(&format!("https://example.com{path}")).unwrap();
        IncludeTask {
            request: http::Request::get(url.as_str()).body(String::new()).unwrap(),
            url,
            response: async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(Response::new(body.to_string()))
            }
            .boxed(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_push_order() {
        let mut queue = IncludeQueue::new();
        queue.push(task("/slow", 300, "first"));
        queue.push(task("/fast", 100, "second"));
        assert_eq!(queue.len(), 2);

        let start = tokio::time::Instant::now();
        let first = queue.next().await.unwrap();
        assert_eq!(first.url.path(), "/slow");
        assert_eq!(first.response.unwrap().body(), "first");
        let second = queue.next().await.unwrap();
        assert_eq!(second.response.unwrap().body(), "second");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));

        assert!(queue.is_empty());
        assert!(queue.next().await.is_none());
    }

    #[test]
    fn test_placeholder_from_tag() {
        let elements = crate::parse::DocumentParser::new("esi")
            .parse(r#"<esi:include src="/a" onerror="continue"/>"#);
        let crate::parse::Element::Esi(tag) = &elements[0] else {
            panic!("expected include");
        };
        let placeholder = Placeholder::from(tag);
        assert_eq!(placeholder.name, "include");
        assert_eq!(placeholder.get_attribute("onerror"), Some("continue"));
        assert_eq!(placeholder.get_attribute("alt"), None);
        assert_eq!(placeholder.markup, r#"<esi:include src="/a" onerror="continue"/>"#);
    }
}
