//! Single HTTP exchange as an explicit state machine.
//!
//! A [`TransferRequest`] is driven to exactly one [`TransferResult`]. Redirects
//! are followed as GET, a 401 challenge gets the configured credential once,
//! certificate failures are logged and retried through a lenient client, and
//! the body is either buffered or streamed to the caller chunk by chunk.
//!
//! [`HttpTransfer::run`] drives the exchange on the calling thread.
//! [`HttpTransfer::execute`] moves it to a worker thread and hands back a
//! [`TransferHandle`] that delivers events and the result over channels.

use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, LAST_MODIFIED, LOCATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const CANCELED_CODE: u16 = 10;

const READ_CHUNK: usize = 16 * 1024;
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Cooperative cancellation flag shared between a caller and running work.
///
/// A child token reads as canceled once any ancestor is; canceling the child
/// leaves its ancestors untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .ancestors
                .iter()
                .any(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub method: Method,
    pub credential: Option<Credential>,
    pub body: Option<Value>,
    pub stream_mode: bool,
}

impl TransferRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            credential: None,
            body: None,
            stream_mode: false,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            credential: None,
            body: Some(body),
            stream_mode: false,
        }
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream_mode = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub status: u16,
    pub reason: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    pub final_url: String,
}

impl ResponseHeaders {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .eq_ignore_ascii_case("application/json")
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBody {
    Buffered(Vec<u8>),
    Streamed { byte_count: u64 },
}

#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub headers: ResponseHeaders,
    pub body: TransferBody,
    pub tls_warnings: Vec<String>,
}

impl TransferResponse {
    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            TransferBody::Buffered(bytes) => bytes,
            TransferBody::Streamed { .. } => &[],
        }
    }

    pub fn byte_count(&self) -> u64 {
        match &self.body {
            TransferBody::Buffered(bytes) => bytes.len() as u64,
            TransferBody::Streamed { byte_count } => *byte_count,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    HostNotFound,
    HttpStatus(u16),
    Unauthorized,
    Canceled,
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransferFailure {
    pub kind: FailureKind,
    pub message: String,
    pub http_status: Option<u16>,
}

impl TransferFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Network,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: FailureKind::Canceled,
            message: status_message(CANCELED_CODE).to_string(),
            http_status: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            kind: FailureKind::Unauthorized,
            message: status_message(401).to_string(),
            http_status: Some(401),
        }
    }

    pub fn http_status(code: u16) -> Self {
        Self {
            kind: FailureKind::HttpStatus(code),
            message: status_message(code).to_string(),
            http_status: Some(code),
        }
    }

    fn io(err: io::Error) -> Self {
        Self {
            kind: FailureKind::Io,
            message: err.to_string(),
            http_status: None,
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let chain = error_chain(err);
        let kind = if is_host_not_found(&chain) {
            FailureKind::HostNotFound
        } else {
            FailureKind::Network
        };
        Self {
            kind,
            message: chain,
            http_status: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransferResult {
    Success(TransferResponse),
    Failure(TransferFailure),
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Success(_))
    }

    pub fn into_result(self) -> Result<TransferResponse, TransferFailure> {
        match self {
            TransferResult::Success(response) => Ok(response),
            TransferResult::Failure(failure) => Err(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { received: u64, total: Option<u64> },
    Chunk(Vec<u8>),
    TlsWarning(String),
}

/// Fixed code to message table shared by every exchange.
pub fn status_message(code: u16) -> &'static str {
    match code {
        CANCELED_CODE => "Canceled request",
        400 => "Bad request syntax",
        401 => "Unauthorized",
        402 => "Payment required",
        403 => "Forbidden",
        404 => "Not found",
        500 => "Internal error",
        501 => "Not implemented",
        502 => "Bad Gateway",
        _ => "Error network",
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            accept_invalid_certs: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: format!("catalog-tms/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Clone)]
pub struct HttpTransfer {
    strict: Client,
    lenient: Client,
    accept_invalid_certs: bool,
    max_redirects: usize,
}

impl HttpTransfer {
    pub fn new(config: &TransferConfig) -> Result<Self, TransferFailure> {
        let strict = Self::build_client(config, false)?;
        let lenient = Self::build_client(config, true)?;
        Ok(Self {
            strict,
            lenient,
            accept_invalid_certs: config.accept_invalid_certs,
            max_redirects: config.max_redirects,
        })
    }

    fn build_client(config: &TransferConfig, lenient: bool) -> Result<Client, TransferFailure> {
        Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(lenient)
            .build()
            .map_err(|err| TransferFailure::network(err.to_string()))
    }

    /// Runs the exchange on a worker thread.
    pub fn execute(&self, request: TransferRequest) -> TransferHandle {
        self.execute_with(request, &CancelToken::new())
    }

    /// Runs the exchange on a worker thread that also stops once `parent` is
    /// canceled. Canceling or dropping the handle never touches `parent`.
    pub fn execute_with(&self, request: TransferRequest, parent: &CancelToken) -> TransferHandle {
        let cancel = parent.child();
        let (event_tx, events) = mpsc::channel();
        let (result_tx, result) = mpsc::channel();
        let transfer = self.clone();
        let token = cancel.clone();
        let worker = thread::spawn(move || {
            let mut sink = |event: TransferEvent| -> io::Result<()> {
                // A dropped receiver only means nobody is listening any more.
                let _ = event_tx.send(event);
                Ok(())
            };
            let outcome = transfer.run(&request, &token, &mut sink);
            let _ = result_tx.send(outcome);
        });
        TransferHandle {
            cancel,
            events,
            result,
            worker: Some(worker),
        }
    }

    /// Runs the exchange on a worker thread and forwards its events to `sink`
    /// on the calling thread. Returns as soon as `cancel` fires, even while
    /// the worker is still blocked on the network.
    pub fn exchange(
        &self,
        request: TransferRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TransferEvent) -> io::Result<()>,
    ) -> TransferResult {
        self.execute_with(request, cancel).wait_streaming(sink)
    }

    /// Drives one exchange to completion on the calling thread.
    pub fn run(
        &self,
        request: &TransferRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TransferEvent) -> io::Result<()>,
    ) -> TransferResult {
        let mut url = request.url.clone();
        let mut method = request.method;
        let mut tried_authentication = false;
        let mut insecure = false;
        let mut redirects = 0usize;
        let mut tls_warnings = Vec::new();

        loop {
            if cancel.is_canceled() {
                return TransferResult::Failure(TransferFailure::canceled());
            }

            let client = if insecure { &self.lenient } else { &self.strict };
            let builder = Self::prepare(client, method, &url, request, tried_authentication);
            let response = match builder.send() {
                Ok(response) => response,
                Err(err) => {
                    if !insecure && self.accept_invalid_certs && is_certificate_error(&err) {
                        let warning = format!("{url}: {}", error_chain(&err));
                        warn!(warning = %warning, "ignoring TLS certificate error");
                        if let Err(err) = sink(TransferEvent::TlsWarning(warning.clone())) {
                            return TransferResult::Failure(TransferFailure::io(err));
                        }
                        tls_warnings.push(warning);
                        insecure = true;
                        continue;
                    }
                    return TransferResult::Failure(TransferFailure::from_reqwest(&err));
                }
            };

            let status = response.status();
            if status.is_redirection() {
                if let Some(target) = redirect_target(&url, &response) {
                    if target != url {
                        redirects += 1;
                        if redirects > self.max_redirects {
                            return TransferResult::Failure(TransferFailure::network(format!(
                                "too many redirects (limit {})",
                                self.max_redirects
                            )));
                        }
                        debug!(from = %url, to = %target, "following redirect");
                        url = target;
                        method = Method::Get;
                        continue;
                    }
                }
            }

            if status == StatusCode::UNAUTHORIZED {
                if !tried_authentication && request.credential.is_some() {
                    tried_authentication = true;
                    debug!(url = %url, "authentication required, retrying with credential");
                    continue;
                }
                return TransferResult::Failure(TransferFailure::unauthorized());
            }

            if status != StatusCode::OK {
                return TransferResult::Failure(TransferFailure::http_status(status.as_u16()));
            }

            return Self::consume(response, request.stream_mode, cancel, sink, tls_warnings);
        }
    }

    fn prepare(
        client: &Client,
        method: Method,
        url: &str,
        request: &TransferRequest,
        authenticate: bool,
    ) -> RequestBuilder {
        let mut builder = match (method, &request.body) {
            (Method::Post, Some(body)) => client.post(url).json(body),
            (Method::Post, None) => client.post(url),
            (Method::Get, _) => client.get(url),
        };
        if authenticate {
            if let Some(credential) = &request.credential {
                builder = builder.basic_auth(&credential.user, Some(&credential.password));
            }
        }
        builder
    }

    fn consume(
        mut response: Response,
        stream_mode: bool,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TransferEvent) -> io::Result<()>,
        tls_warnings: Vec<String>,
    ) -> TransferResult {
        let headers = read_headers(&response);
        let total = headers.content_length;
        let mut body = Vec::new();
        let mut received = 0u64;
        let mut buffer = vec![0u8; READ_CHUNK];

        loop {
            if cancel.is_canceled() {
                return TransferResult::Failure(TransferFailure::canceled());
            }
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return TransferResult::Failure(TransferFailure::network(err.to_string()));
                }
            };
            received += read as u64;
            if stream_mode {
                if let Err(err) = sink(TransferEvent::Chunk(buffer[..read].to_vec())) {
                    return TransferResult::Failure(TransferFailure::io(err));
                }
            } else {
                body.extend_from_slice(&buffer[..read]);
            }
            if let Err(err) = sink(TransferEvent::Progress { received, total }) {
                return TransferResult::Failure(TransferFailure::io(err));
            }
        }

        let body = if stream_mode {
            TransferBody::Streamed {
                byte_count: received,
            }
        } else {
            TransferBody::Buffered(body)
        };
        TransferResult::Success(TransferResponse {
            headers,
            body,
            tls_warnings,
        })
    }
}

/// Caller side of an exchange running on a worker thread.
pub struct TransferHandle {
    cancel: CancelToken,
    events: Receiver<TransferEvent>,
    result: Receiver<TransferResult>,
    worker: Option<JoinHandle<()>>,
}

impl TransferHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &Receiver<TransferEvent> {
        &self.events
    }

    pub fn try_result(&self) -> Option<TransferResult> {
        self.result.try_recv().ok()
    }

    /// Like [`TransferHandle::wait`], feeding each event to `sink` as it
    /// arrives. A sink error cancels the worker.
    pub fn wait_streaming(
        self,
        sink: &mut dyn FnMut(TransferEvent) -> io::Result<()>,
    ) -> TransferResult {
        loop {
            if self.cancel.is_canceled() {
                return TransferResult::Failure(TransferFailure::canceled());
            }
            match self.events.recv_timeout(WAIT_POLL) {
                Ok(event) => {
                    if let Err(err) = sink(event) {
                        self.cancel.cancel();
                        return TransferResult::Failure(TransferFailure::io(err));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                // The worker sends its result before the event channel closes.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.wait()
    }

    /// Blocks until the exchange finishes or the handle is canceled.
    ///
    /// A canceled wait returns immediately; the worker drops its response at
    /// its next checkpoint.
    pub fn wait(mut self) -> TransferResult {
        loop {
            match self.result.recv_timeout(WAIT_POLL) {
                Ok(result) => {
                    if let Some(worker) = self.worker.take() {
                        let _ = worker.join();
                    }
                    return result;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_canceled() {
                        return TransferResult::Failure(TransferFailure::canceled());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return TransferResult::Failure(TransferFailure::network(
                        "transfer worker exited without a result",
                    ));
                }
            }
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();
        }
    }
}

fn read_headers(response: &Response) -> ResponseHeaders {
    let header = |name: HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    };
    ResponseHeaders {
        status: response.status().as_u16(),
        reason: response.status().canonical_reason().map(|value| value.to_string()),
        content_type: header(CONTENT_TYPE),
        content_length: header(CONTENT_LENGTH)
            .and_then(|value| value.parse().ok())
            .or_else(|| response.content_length()),
        last_modified: header(LAST_MODIFIED),
        final_url: response.url().to_string(),
    }
}

fn redirect_target(current: &str, response: &Response) -> Option<String> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let base = Url::parse(current).ok()?;
    base.join(location).ok().map(|url| url.to_string())
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !parts.contains(&text) {
            parts.push(text);
        }
        source = cause.source();
    }
    parts.join(": ")
}

fn is_certificate_error(err: &reqwest::Error) -> bool {
    if !err.is_connect() && !err.is_request() {
        return false;
    }
    let chain = error_chain(err).to_lowercase();
    chain.contains("certificate") || chain.contains("unknownissuer")
}

fn is_host_not_found(chain: &str) -> bool {
    let chain = chain.to_lowercase();
    chain.contains("dns error")
        || chain.contains("failed to lookup address")
        || chain.contains("no such host")
        || chain.contains("name or service not known")
        || chain.contains("nodename nor servname")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_covers_known_codes() {
        assert_eq!(status_message(10), "Canceled request");
        assert_eq!(status_message(403), "Forbidden");
        assert_eq!(status_message(502), "Bad Gateway");
        assert_eq!(status_message(418), "Error network");
    }

    #[test]
    fn json_content_type_ignores_parameters() {
        let headers = ResponseHeaders {
            status: 200,
            reason: None,
            content_type: Some("application/json; charset=utf-8".to_string()),
            content_length: None,
            last_modified: None,
            final_url: "http://localhost/".to_string(),
        };
        assert!(headers.is_json());
    }

    #[test]
    fn dns_failures_are_host_not_found() {
        assert!(is_host_not_found(
            "error sending request: client error (Connect): dns error: failed to lookup address information"
        ));
        assert!(!is_host_not_found("connection refused"));
    }

    #[test]
    fn credential_debug_hides_password() {
        let credential = Credential {
            user: "user".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{credential:?}").contains("secret"));
    }
}
