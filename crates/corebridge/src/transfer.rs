//! Outbound HTTP on behalf of the UI: plain requests, file downloads and
//! multipart file uploads.
//!
//! Every operation can be cancelled by a client `emit` of the request's
//! `cancelId`, and never fail at the HTTP layer: transport errors come back
//! as `{ok: false, status: 500, body: <message>}`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{redirect, Body, Method, Proxy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transfers report progress each time this many more bytes are written.
pub const PROGRESS_STEP: u64 = 128 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_FILE_FIELD: &str = "file";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferOptions {
    /// Whole-request timeout in seconds. Zero means none.
    pub timeout: u64,
    pub cancel_id: String,
    pub insecure: bool,
    /// Follow redirects. Off unless asked for.
    pub redirect: bool,
    /// Proxy URL for this call. Empty uses the environment's proxy settings.
    pub proxy: String,
    /// Multipart field name for uploads; `file` when empty.
    pub file_field: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub options: TransferOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpec {
    #[serde(default)]
    pub method: String,
    pub url: String,
    pub path: PathBuf,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Progress event name. Empty disables progress reports.
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub options: TransferOptions,
}

/// Same shape as a download; `path` names the file to send.
pub type UploadSpec = DownloadSpec;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub ok: bool,
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

impl TransferResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: 500,
            headers: BTreeMap::new(),
            body: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error("invalid method {0:?}")]
    Method(String),
    #[error("invalid header {0:?}")]
    Header(String),
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct Transfers {
    bus: Arc<EventBus>,
}

impl Transfers {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub async fn request(&self, spec: RequestSpec) -> TransferResult {
        let cancel = CancellationToken::new();
        let _guard = self.cancel_on(&spec.options.cancel_id, &cancel);

        let outcome = tokio::select! {
            result = send_request(&spec) => result,
            () = cancel.cancelled() => Err(TransferError::Cancelled),
        };
        match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(url = %spec.url, %err, "outbound request failed");
                TransferResult::failed(err.to_string())
            }
        }
    }

    pub async fn download(&self, spec: DownloadSpec) -> TransferResult {
        let cancel = CancellationToken::new();
        let _guard = self.cancel_on(&spec.options.cancel_id, &cancel);

        match self.fetch_to_file(&spec, &cancel).await {
            Ok(result) => {
                info!(url = %spec.url, path = %spec.path.display(), "download finished");
                result
            }
            Err(err) => {
                warn!(url = %spec.url, %err, "download failed");
                TransferResult::failed(err.to_string())
            }
        }
    }

    /// Send the file at `spec.path` as a multipart form. Progress counts file
    /// bytes handed to the connection; the result carries the response body.
    pub async fn upload(&self, spec: UploadSpec) -> TransferResult {
        let cancel = CancellationToken::new();
        let _guard = self.cancel_on(&spec.options.cancel_id, &cancel);

        match self.send_file(&spec, &cancel).await {
            Ok(result) => {
                info!(
                    url = %spec.url,
                    path = %spec.path.display(),
                    status = result.status,
                    "upload finished"
                );
                result
            }
            Err(err) => {
                warn!(url = %spec.url, %err, "upload failed");
                TransferResult::failed(err.to_string())
            }
        }
    }

    fn cancel_on(
        &self,
        cancel_id: &str,
        token: &CancellationToken,
    ) -> Option<event_bus::HandlerGuard> {
        if cancel_id.is_empty() {
            return None;
        }
        let token = token.clone();
        Some(self.bus.on_scoped(cancel_id, move |_| token.cancel()))
    }

    async fn fetch_to_file(
        &self,
        spec: &DownloadSpec,
        cancel: &CancellationToken,
    ) -> Result<TransferResult, TransferError> {
        let request = build(&spec.options, &spec.method, &spec.url, &spec.headers)?;
        let response = tokio::select! {
            response = request.send() => response?,
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let total = response
            .content_length()
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or(-1);

        let mut file = create_file(&spec.path).await?;
        let mut progress = Progress::new(total);
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|source| file_error(&spec.path, source))?;
            if let Some(report) = progress.advance(chunk.len() as u64) {
                self.report(&spec.event, report).await;
            }
        }
        file.flush()
            .await
            .map_err(|source| file_error(&spec.path, source))?;

        // An empty body of unknown length has produced no report yet.
        if let Some(report) = progress.finish() {
            self.report(&spec.event, report).await;
        }

        Ok(TransferResult {
            ok: true,
            status,
            headers,
            body: "Success".to_string(),
        })
    }

    async fn send_file(
        &self,
        spec: &UploadSpec,
        cancel: &CancellationToken,
    ) -> Result<TransferResult, TransferError> {
        let file = tokio::fs::File::open(&spec.path)
            .await
            .map_err(|source| file_error(&spec.path, source))?;
        let len = file
            .metadata()
            .await
            .map_err(|source| file_error(&spec.path, source))?
            .len();

        let part = Part::stream_with_length(self.tracked_body(file, len, &spec.event), len)
            .file_name(file_name(&spec.path))
            .mime_str("application/octet-stream")?;
        let field = match spec.options.file_field.as_str() {
            "" => DEFAULT_FILE_FIELD.to_string(),
            field => field.to_string(),
        };
        let method = match spec.method.as_str() {
            "" => "POST",
            method => method,
        };
        let request = build(&spec.options, method, &spec.url, &spec.headers)?
            .multipart(Form::new().part(field, part));

        let response = tokio::select! {
            response = request.send() => response?,
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = tokio::select! {
            body = response.text() => body?,
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        if len == 0 {
            self.report(&spec.event, [0, 0]).await;
        }
        Ok(TransferResult {
            ok: true,
            status,
            headers,
            body,
        })
    }

    /// Stream `file` as a request body, reporting progress on `event` as
    /// chunks are read.
    fn tracked_body(&self, file: tokio::fs::File, len: u64, event: &str) -> Body {
        let total = i64::try_from(len).unwrap_or(i64::MAX);
        let mut progress = Progress::new(total);
        let bus = Arc::clone(&self.bus);
        let event = event.to_string();

        let chunks = ReaderStream::new(file).then(move |chunk| {
            let report = match &chunk {
                Ok(bytes) if !event.is_empty() => progress.advance(bytes.len() as u64),
                _ => None,
            };
            let bus = Arc::clone(&bus);
            let event = event.clone();
            async move {
                if let Some([sent, total]) = report {
                    bus.emit(&event, vec![Value::from(sent), Value::from(total)])
                        .await;
                }
                chunk
            }
        });
        Body::wrap_stream(chunks)
    }

    async fn report(&self, event: &str, [progress, total]: [i64; 2]) {
        if event.is_empty() {
            return;
        }
        self.bus
            .emit(event, vec![Value::from(progress), Value::from(total)])
            .await;
    }
}

async fn send_request(spec: &RequestSpec) -> Result<TransferResult, TransferError> {
    let mut builder = build(&spec.options, &spec.method, &spec.url, &spec.headers)?;
    if !spec.body.is_empty() {
        builder = builder.body(spec.body.clone());
    }
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = collect_headers(response.headers());
    let body = response.text().await?;
    debug!(url = %spec.url, status, "outbound request completed");
    Ok(TransferResult {
        ok: true,
        status,
        headers,
        body,
    })
}

fn build(
    options: &TransferOptions,
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<reqwest::RequestBuilder, TransferError> {
    let mut client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(options.insecure);
    if options.timeout > 0 {
        client = client.timeout(Duration::from_secs(options.timeout));
    }
    if !options.redirect {
        client = client.redirect(redirect::Policy::none());
    }
    if !options.proxy.is_empty() {
        client = client.proxy(Proxy::all(&options.proxy)?);
    }
    let client = client.build()?;

    let method = if method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransferError::Method(method.to_string()))?
    };
    Ok(client.request(method, url).headers(header_map(headers)?))
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, TransferError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransferError::Header(name.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| TransferError::Header(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        out.entry(name.to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn create_file(path: &Path) -> Result<tokio::fs::File, TransferError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| file_error(parent, source))?;
    }
    tokio::fs::File::create(path)
        .await
        .map_err(|source| file_error(path, source))
}

fn file_error(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::File {
        path: path.to_path_buf(),
        source,
    }
}

/// Decides when a transfer reports `[written, total]`: on every chunk when
/// the total is unknown, once per [`PROGRESS_STEP`] otherwise, and always at
/// completion.
#[derive(Debug)]
struct Progress {
    total: i64,
    written: i64,
    reported: i64,
    reports: usize,
}

impl Progress {
    fn new(total: i64) -> Self {
        Self {
            total,
            written: 0,
            reported: 0,
            reports: 0,
        }
    }

    fn advance(&mut self, n: u64) -> Option<[i64; 2]> {
        self.written = self.written.saturating_add(i64::try_from(n).unwrap_or(i64::MAX));
        let step = PROGRESS_STEP as i64;
        if self.total <= 0 || self.written - self.reported >= step || self.written == self.total {
            self.reported = self.written;
            self.reports += 1;
            return Some([self.written, self.total]);
        }
        None
    }

    fn finish(&mut self) -> Option<[i64; 2]> {
        if self.reports > 0 && self.reported == self.written {
            return None;
        }
        self.reported = self.written;
        self.reports += 1;
        Some([self.written, self.total])
    }
}
