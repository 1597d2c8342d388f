use thiserror::Error;

/// Describes an error encountered during ESI document processing.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The ESI document contains a tag with a missing parameter.
    #[error("tag `{0}` is missing required parameter `{1}`")]
    MissingRequiredParameter(String, String),

    /// A built-in function was called with arguments it cannot handle.
    #[error("function error: {0}")]
    FunctionError(String),

    /// An `<esi:include>` src could not be resolved into a request URL.
    #[error("invalid request URL provided: `{0}`")]
    InvalidRequestUrl(String),

    /// The backend failed to produce a response for a request.
    #[error("error sending request: {0}")]
    RequestError(String),

    /// A request could not be built from its parts.
    #[error("invalid HTTP request: {0}")]
    HttpError(#[from] http::Error),

    /// The replace pass found more `<esi:include>` tags than the scan pass queued.
    #[error("no pending fragment left for include `{0}`")]
    IncludeQueueExhausted(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
