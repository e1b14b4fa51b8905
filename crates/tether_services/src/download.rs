//! HTTP downloads and one-shot requests

use std::path::{Path, PathBuf};
use tether_core::{AsyncOperation, OperationValue};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid HTTP method {method:?}")]
    Method { method: String },
}

/// Body of an [`HttpRequest`]. Text is sent as UTF-8 `text/plain` unless
/// the request names its own content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    fn names_content_type(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(reqwest::header::CONTENT_TYPE.as_str()))
    }
}

/// Status and raw body of a finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Issue `request` and read the whole response. Error statuses are returned
/// like any other response; only transport failures are errors.
pub async fn send(client: &reqwest::Client, request: HttpRequest) -> Result<HttpResponse, DownloadError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| DownloadError::Method {
        method: request.method.clone(),
    })?;
    let request_error = |source: reqwest::Error| DownloadError::Request {
        url: request.url.clone(),
        source,
    };

    let mut builder = client.request(method, &request.url);
    if matches!(request.body, Some(RequestBody::Text(_))) && !request.names_content_type() {
        builder = builder.header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8");
    }
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = match &request.body {
        Some(RequestBody::Text(text)) => builder.body(text.clone()),
        Some(RequestBody::Bytes(bytes)) => builder.body(bytes.clone()),
        None => builder,
    };

    let response = builder.send().await.map_err(request_error)?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(request_error)?.to_vec();
    tracing::debug!(url = %request.url, status, len = body.len(), "http request finished");
    Ok(HttpResponse { status, body })
}

/// Stream `url` into the file at `path`. Returns the number of bytes written.
pub async fn download(client: &reqwest::Client, url: &str, path: &Path) -> Result<u64, DownloadError> {
    let request_error = |source: reqwest::Error| DownloadError::Request {
        url: url.to_string(),
        source,
    };
    let write_error = |source: std::io::Error| DownloadError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut response = client.get(url).send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status,
        });
    }

    let mut file = tokio::fs::File::create(path).await.map_err(write_error)?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(request_error)? {
        file.write_all(&chunk).await.map_err(write_error)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_error)?;

    tracing::debug!(url, path = %path.display(), bytes = written, "download finished");
    Ok(written)
}

/// Shared HTTP client for background downloads and script requests.
#[derive(Debug, Clone, Default)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a download in the background as a void operation.
    pub fn spawn(&self, handle: &Handle, url: String, path: PathBuf) -> AsyncOperation {
        let (operation, completer) = AsyncOperation::pending();
        let client = self.client.clone();
        handle.spawn(async move {
            match download(&client, &url, &path).await {
                Ok(_) => completer.succeed(OperationValue::Void),
                Err(err) => {
                    tracing::warn!(%err, "download failed");
                    completer.fail(err);
                }
            }
        });
        operation
    }

    /// Run `request` to completion, blocking the calling thread. Must not be
    /// called from inside the runtime behind `handle`.
    pub fn request(&self, handle: &Handle, request: HttpRequest) -> Result<HttpResponse, DownloadError> {
        handle.block_on(send(&self.client, request))
    }
}
