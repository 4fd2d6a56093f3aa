//! Upstream request execution
//!
//! One inbound request becomes at most [`MAX_ATTEMPTS`] upstream attempts.
//! A 401 (or an OAuth token that cannot be refreshed) on the first attempt
//! marks the account failed and retries once on an alternative; anything
//! else is returned to the caller. Streaming responses are forwarded line by
//! line through a bounded channel while usage is extracted on the side.
//! Every request that reaches this module queues exactly one usage record.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use provider::{
    Credential, HeaderInjection, ProviderProfile, build_upstream_headers, classify_status,
    inject_system_prompt, upstream_url,
};
use store::{ApiKeyPrincipal, UpstreamAccount, UsageRecord, now_ms};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, instrument, warn};
use upstream_auth::LifecycleManager;
use upstream_pool::{CredentialPool, SelectionFilter};
use usage::{UsageMeter, UsageWriter};

use crate::error::GatewayError;
use crate::metrics;
use crate::sse::{LineBuffer, ObservedUsage, UsageExtractor, usage_from_response};

/// First try plus one failover.
pub const MAX_ATTEMPTS: usize = 2;

const MESSAGES_PATH: &str = "/v1/messages";

/// Lines buffered between the upstream reader and the client body.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// A validated request bound to its caller and provider profile.
pub struct ProxyRequest {
    pub request_id: String,
    pub principal: ApiKeyPrincipal,
    pub profile: Arc<ProviderProfile>,
    pub client_headers: HeaderMap,
    pub body: serde_json::Value,
    pub model: String,
    pub stream: bool,
}

/// Why one attempt failed.
enum AttemptError {
    /// Upstream rejected the credential; eligible for failover
    Rejected { status: u16, body: String },
    /// OAuth token could not be made valid; eligible for failover
    CredentialExpired(String),
    /// Returned to the client as is
    Fatal(GatewayError),
}

pub struct StreamProxy {
    pool: Arc<CredentialPool>,
    lifecycle: Arc<LifecycleManager>,
    meter: Arc<UsageMeter>,
    writer: Arc<UsageWriter>,
    client: reqwest::Client,
    timeout: Duration,
    injections: Vec<HeaderInjection>,
}

impl StreamProxy {
    pub fn new(
        pool: Arc<CredentialPool>,
        lifecycle: Arc<LifecycleManager>,
        meter: Arc<UsageMeter>,
        writer: Arc<UsageWriter>,
        client: reqwest::Client,
        timeout: Duration,
        injections: Vec<HeaderInjection>,
    ) -> Self {
        Self {
            pool,
            lifecycle,
            meter,
            writer,
            client,
            timeout,
            injections,
        }
    }

    /// Select an account, send, and fail over once on credential rejection.
    #[instrument(skip_all, fields(request_id = %req.request_id, model = %req.model, stream = req.stream))]
    pub async fn forward(&self, req: ProxyRequest) -> Result<Response, GatewayError> {
        let sink = UsageSink {
            meter: self.meter.clone(),
            writer: self.writer.clone(),
            request_id: req.request_id.clone(),
            api_key_id: req.principal.id.clone(),
            owner_id: req.principal.owner_id.clone(),
            model: req.model.clone(),
            started: Instant::now(),
        };
        let owner_id = req.principal.owner_id.as_str();
        let filter = SelectionFilter::provider(req.profile.name.clone());
        let mut visited: HashSet<String> = HashSet::new();

        let mut account = match self.pool.select_account(owner_id, &filter, &visited).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(sink.fail(None, GatewayError::NoAccountAvailable)),
            Err(e) => {
                error!(error = %e, "account selection failed");
                return Err(sink.fail(None, GatewayError::Internal("account selection failed".into())));
            }
        };

        for attempt in 1..=MAX_ATTEMPTS {
            visited.insert(account.id.clone());
            let failure = match self.attempt(&req, &account, &sink).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Fatal(err)) => return Err(sink.fail(Some(&account.id), err)),
                Err(failure) => failure,
            };

            if attempt == MAX_ATTEMPTS {
                return Err(sink.fail(Some(&account.id), failure.into_client_error()));
            }

            warn!(account_id = %account.id, attempt, "credential rejected, failing over");
            match self
                .pool
                .mark_failed_and_select_alternative(&account.id, owner_id, &filter, &visited)
                .await
            {
                Ok(Some(next)) => {
                    info!(from = %account.id, to = %next.id, "retrying on alternative account");
                    account = next;
                }
                Ok(None) => {
                    warn!(account_id = %account.id, "no alternative account for failover");
                    return Err(sink.fail(Some(&account.id), failure.into_client_error()));
                }
                Err(e) => {
                    error!(error = %e, "failover selection failed");
                    return Err(sink.fail(
                        Some(&account.id),
                        GatewayError::Internal("failover selection failed".into()),
                    ));
                }
            }
        }

        Err(sink.fail(
            Some(&account.id),
            GatewayError::Internal("retry loop exhausted".into()),
        ))
    }

    async fn attempt(
        &self,
        req: &ProxyRequest,
        selected: &UpstreamAccount,
        sink: &UsageSink,
    ) -> Result<Response, AttemptError> {
        let account = self
            .lifecycle
            .ensure_valid_token(selected, false)
            .await
            .map_err(|e| {
                warn!(account_id = %selected.id, error = %e, "could not obtain a valid token");
                AttemptError::CredentialExpired(e.to_string())
            })?;
        if account.oauth_expires_at() != selected.oauth_expires_at() {
            self.pool.invalidate(&account.id).await;
        }

        let mut body = req.body.clone();
        if let Credential::OAuth(_) = &account.credential {
            inject_system_prompt(&req.profile, &mut body);
        }
        let headers = build_upstream_headers(
            &req.profile,
            &account.credential,
            &req.client_headers,
            &self.injections,
        )
        .map_err(|e| AttemptError::Fatal(GatewayError::Internal(e.to_string())))?;
        let url = upstream_url(&req.profile, &account.credential, MESSAGES_PATH);

        let mut builder = self.client.post(&url).headers(headers).json(&body);
        // Streams are bounded by the client connection, not a total deadline
        if !req.stream {
            builder = builder.timeout(self.timeout);
        }

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection"
                } else {
                    "request"
                };
                metrics::record_upstream_error(kind);
                error!(account_id = %account.id, error = %e, "upstream request failed");
                self.record_outcome(&account.id, false, started).await;
                return Err(AttemptError::Fatal(GatewayError::Upstream {
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    body: format!("upstream request failed: {e}"),
                }));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            self.record_outcome(&account.id, false, started).await;
            let classification = classify_status(code);
            metrics::record_upstream_error(classification.label());
            warn!(account_id = %account.id, status = code, class = classification.label(), "upstream error");
            return Err(if classification.triggers_failover() {
                AttemptError::Rejected { status: code, body }
            } else {
                AttemptError::Fatal(GatewayError::Upstream { status: code, body })
            });
        }
        self.record_outcome(&account.id, true, started).await;

        if req.stream {
            self.stream_response(response, account.id.clone(), sink.clone())
        } else {
            buffered_response(response, &account.id, sink).await
        }
    }

    fn stream_response(
        &self,
        response: reqwest::Response,
        account_id: String,
        sink: UsageSink,
    ) -> Result<Response, AttemptError> {
        let status = response.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name.as_str()) && *name != axum::http::header::CONTENT_LENGTH {
                builder = builder.header(name, value);
            }
        }

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
        let client_response = builder
            .body(body)
            .map_err(|e| AttemptError::Fatal(GatewayError::Internal(format!("response build error: {e}"))))?;

        let reader = UpstreamReader::new(response, account_id);
        tokio::spawn(pump(reader, tx, sink, status.as_u16()).instrument(tracing::Span::current()));
        Ok(client_response)
    }

    async fn record_outcome(&self, account_id: &str, success: bool, started: Instant) {
        let elapsed = started.elapsed().as_millis() as u64;
        if let Err(e) = self.pool.record_outcome(account_id, success, elapsed).await {
            warn!(account_id, error = %e, "failed to record upstream outcome");
        }
    }
}

impl AttemptError {
    /// Error surfaced when no further attempt will be made.
    fn into_client_error(self) -> GatewayError {
        match self {
            AttemptError::Rejected { status, body } => GatewayError::Upstream { status, body },
            AttemptError::CredentialExpired(_) => GatewayError::NoAccountAvailable,
            AttemptError::Fatal(err) => err,
        }
    }
}

async fn buffered_response(
    response: reqwest::Response,
    account_id: &str,
    sink: &UsageSink,
) -> Result<Response, AttemptError> {
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.bytes().await.map_err(|e| {
        metrics::record_upstream_error("body");
        AttemptError::Fatal(GatewayError::Upstream {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            body: format!("failed to read upstream response: {e}"),
        })
    })?;

    match usage_from_response(&bytes) {
        Some(observed) => sink.submit(Some(account_id), status.as_u16(), &observed, None),
        None => sink.submit(
            Some(account_id),
            status.as_u16(),
            &ObservedUsage::default(),
            Some("response carried no usage".into()),
        ),
    }

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| AttemptError::Fatal(GatewayError::Internal(format!("response build error: {e}"))))
}

/// Holds the upstream body for the lifetime of one stream. Dropping it
/// releases the connection and the active-stream gauge on every exit path.
struct UpstreamReader {
    response: reqwest::Response,
    account_id: String,
}

impl UpstreamReader {
    fn new(response: reqwest::Response, account_id: String) -> Self {
        metrics::stream_opened();
        Self {
            response,
            account_id,
        }
    }

    async fn next_chunk(&mut self) -> reqwest::Result<Option<Bytes>> {
        self.response.chunk().await
    }
}

impl Drop for UpstreamReader {
    fn drop(&mut self) {
        metrics::stream_closed();
        debug!(account_id = %self.account_id, "upstream stream released");
    }
}

/// Forward complete lines to the client until the upstream ends or the
/// client goes away. A closed channel stops reading immediately.
async fn pump(mut reader: UpstreamReader, tx: mpsc::Sender<Bytes>, sink: UsageSink, status: u16) {
    let account_id = reader.account_id.clone();
    let mut lines = LineBuffer::default();
    let mut extractor = UsageExtractor::default();
    let mut failure: Option<String> = None;

    'read: loop {
        let next = tokio::select! {
            next = reader.next_chunk() => next,
            _ = tx.closed() => {
                debug!("client disconnected, stopping upstream read");
                failure = Some("client disconnected before the stream finished".into());
                break 'read;
            }
        };
        match next {
            Ok(Some(chunk)) => {
                for segment in lines.push(&chunk) {
                    if segment.whole
                        && let Some(observed) = extractor.observe_line(&segment.bytes)
                    {
                        sink.submit(Some(&account_id), status, &observed, None);
                    }
                    if tx.send(segment.bytes).await.is_err() {
                        debug!("client disconnected, stopping upstream read");
                        failure = Some("client disconnected before the stream finished".into());
                        break 'read;
                    }
                }
            }
            Ok(None) => {
                if let Some(rest) = lines.finish() {
                    if rest.whole
                        && let Some(observed) = extractor.observe_line(&rest.bytes)
                    {
                        sink.submit(Some(&account_id), status, &observed, None);
                    }
                    let _ = tx.send(rest.bytes).await;
                }
                break;
            }
            Err(e) => {
                metrics::record_upstream_error("stream");
                warn!(error = %e, "upstream stream failed");
                failure = Some(format!("upstream stream failed: {e}"));
                break;
            }
        }
    }
    drop(reader);

    if !extractor.is_complete() {
        let reason = failure.unwrap_or_else(|| "stream ended before usage was reported".into());
        sink.submit(Some(&account_id), status, &extractor.partial(), Some(reason));
    }
}

/// Builds and queues the usage record for one request.
#[derive(Clone)]
struct UsageSink {
    meter: Arc<UsageMeter>,
    writer: Arc<UsageWriter>,
    request_id: String,
    api_key_id: String,
    owner_id: String,
    /// Requested model, used when the upstream did not report one
    model: String,
    started: Instant,
}

impl UsageSink {
    fn submit(
        &self,
        account_id: Option<&str>,
        status: u16,
        observed: &ObservedUsage,
        error: Option<String>,
    ) {
        let model = observed
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        let tokens = observed.tokens;
        let cost_usd = self.meter.calculate_cost_with_cache(&model, &tokens);
        metrics::record_tokens(&tokens);

        self.writer.submit(UsageRecord {
            request_id: self.request_id.clone(),
            api_key_id: self.api_key_id.clone(),
            owner_id: self.owner_id.clone(),
            upstream_account_id: account_id.map(str::to_string),
            model,
            status_code: status,
            response_time_ms: self.started.elapsed().as_millis() as u64,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            cache_creation_tokens: tokens.cache_creation_tokens,
            cache_read_tokens: tokens.cache_read_tokens,
            cost_usd,
            error_message: error.map(|e| common::redact(&e).into_owned()),
            created_at: now_ms(),
        });
    }

    /// Queue a zero-token record for `err` and hand the error back.
    fn fail(&self, account_id: Option<&str>, err: GatewayError) -> GatewayError {
        let status = match &err {
            GatewayError::Upstream { status, .. } => *status,
            other => other.status().as_u16(),
        };
        self.submit(account_id, status, &ObservedUsage::default(), Some(err.to_string()));
        err
    }
}
