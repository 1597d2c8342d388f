use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use esi_resolver::{
    Backend, Configuration, ExecutionError, Processor, Request, RequestContext, Response,
};
use http::header::{HeaderValue, CONTENT_TYPE, USER_AGENT};
use http::StatusCode;
use log::{error, info};

/// Serves documents and fragments from a directory, keyed by URL path.
struct FileOrigin {
    root: PathBuf,
}

impl FileOrigin {
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl Backend for FileOrigin {
    async fn send(&self, request: Request) -> esi_resolver::Result<Response> {
        info!("{} {}", request.method(), request.uri());
        let Some(path) = self.resolve(request.uri().path()) else {
            return Ok(plain(StatusCode::BAD_REQUEST, "bad path"));
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => {
                let mut response = Response::new(body);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
                Ok(response)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok(plain(StatusCode::NOT_FOUND, "not found"))
            }
            Err(err) => Err(ExecutionError::RequestError(format!(
                "reading {}: {}",
                path.display(),
                err
            ))),
        }
    }
}

fn plain(status: StatusCode, body: &str) -> Response {
    let mut response = Response::new(body.to_string());
    *response.status_mut() = status;
    response
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let root = args.next().unwrap_or_else(|| "site".to_string());
    let path = args.next().unwrap_or_else(|| "/index.html".to_string());

    let context = http::Request::get(format!("http://localhost{path}"))
        .header(USER_AGENT, "esi_file_demo")
        .body(String::new())
        .map_err(ExecutionError::from)
        .and_then(RequestContext::new);
    let context = match context {
        Ok(context) => context,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let processor = Processor::new(
        Arc::new(FileOrigin {
            root: PathBuf::from(root),
        }),
        Configuration::default(),
    );
    match processor.handle(context).await {
        Ok(response) => {
            info!("status {}", response.status());
            println!("{}", response.body());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("error processing ESI document: {err}");
            ExitCode::FAILURE
        }
    }
}
