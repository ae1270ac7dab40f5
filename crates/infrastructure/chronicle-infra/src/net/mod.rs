use std::sync::Arc;
use std::time::Duration;

use chronicle_core::{TargetId, Timestamp};
use reqwest::header::{HeaderMap, ETAG, EXPIRES, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorInfo, FetchError};
use crate::throttle::RateLimiterRegistry;

pub const HEADER_PAGES: &str = "x-pages";
pub const HEADER_ERROR_REMAIN: &str = "x-esi-error-limit-remain";
pub const HEADER_ERROR_RESET: &str = "x-esi-error-limit-reset";

/// Body of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RawData {
    Json(Value),
    /// A 2xx whose body did not parse; carries the decoder's complaint.
    Undecodable(String),
    /// The remote answered 304 for our continuation token.
    NotModified,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: RawData,
    /// When the remote says this data next changes.
    pub expires_at: Option<Timestamp>,
    /// Token to send as `If-None-Match` next time.
    pub continuation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub url: String,
    /// Rate bucket class.
    pub class: String,
    pub target: TargetId,
    pub bearer: Option<String>,
    pub if_none_match: Option<String>,
    /// Walk `?page=N` even when the remote does not send `X-Pages`.
    pub paged: bool,
}

struct Page {
    body: Result<Value, String>,
    headers: HeaderMap,
}

enum PageResponse {
    Page(Page),
    NotModified(HeaderMap),
}

/// GET client that understands the remote's paging, cache and error headers.
pub struct ApiClient {
    client: Client,
    limiter: Arc<RateLimiterRegistry>,
    retries: u32,
    max_pages: u32,
}

impl ApiClient {
    pub fn new(client: Client, limiter: Arc<RateLimiterRegistry>) -> Self {
        Self {
            client,
            limiter,
            retries: 2,
            max_pages: 1000,
        }
    }

    /// Extra attempts after a transport failure.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiter
    }

    pub async fn fetch(&self, req: &ApiRequest) -> Result<Fetched, FetchError> {
        let first_page = if req.paged { Some(1) } else { None };
        let first = match self.get_with_retry(req, first_page, true).await? {
            PageResponse::NotModified(headers) => {
                debug!("{} not modified", req.url);
                return Ok(Fetched {
                    data: RawData::NotModified,
                    expires_at: parse_expires(&headers),
                    continuation: header_str(&headers, ETAG.as_str())
                        .or_else(|| req.if_none_match.clone()),
                });
            }
            PageResponse::Page(page) => page,
        };

        let expires_at = parse_expires(&first.headers);
        let continuation = header_str(&first.headers, ETAG.as_str());
        let declared_pages = header_str(&first.headers, HEADER_PAGES)
            .and_then(|v| v.trim().parse::<u32>().ok());

        let data = match self.collect(req, first.body, declared_pages).await? {
            Ok(body) => RawData::Json(body),
            Err(complaint) => RawData::Undecodable(complaint),
        };
        Ok(Fetched {
            data,
            expires_at,
            continuation,
        })
    }

    /// Joins the remaining pages onto the first. A snapshot cut short by the page cap
    /// is an error, never a shorter answer.
    async fn collect(
        &self,
        req: &ApiRequest,
        first: Result<Value, String>,
        declared_pages: Option<u32>,
    ) -> Result<Result<Value, String>, FetchError> {
        let first = match first {
            Ok(body) => body,
            Err(complaint) => return Ok(Err(complaint)),
        };
        match (declared_pages, req.paged) {
            (Some(pages), _) if pages > 1 => {
                if pages > self.max_pages {
                    return Err(FetchError::Transport(format!(
                        "{} declares {pages} pages, more than the cap of {}",
                        req.url, self.max_pages
                    )));
                }
                let mut items = into_items(first);
                for n in 2..=pages {
                    match self.expect_page(req, n).await?.body {
                        Ok(body) => items.extend(into_items(body)),
                        Err(complaint) => return Ok(Err(complaint)),
                    }
                }
                Ok(Ok(Value::Array(items)))
            }
            (None, true) => {
                let mut items = into_items(first);
                let mut n = 2;
                loop {
                    let page = match self.expect_page(req, n).await?.body {
                        Ok(body) => into_items(body),
                        Err(complaint) => return Ok(Err(complaint)),
                    };
                    if page.is_empty() {
                        break;
                    }
                    if n > self.max_pages {
                        return Err(FetchError::Transport(format!(
                            "{} still had items past the cap of {} pages",
                            req.url, self.max_pages
                        )));
                    }
                    items.extend(page);
                    n += 1;
                }
                Ok(Ok(Value::Array(items)))
            }
            _ => Ok(Ok(first)),
        }
    }

    async fn expect_page(&self, req: &ApiRequest, n: u32) -> Result<Page, FetchError> {
        match self.get_with_retry(req, Some(n), false).await? {
            PageResponse::Page(page) => Ok(page),
            PageResponse::NotModified(_) => Err(FetchError::Transport(format!(
                "unexpected 304 for page {n} of {}",
                req.url
            ))),
        }
    }

    async fn get_with_retry(
        &self,
        req: &ApiRequest,
        page: Option<u32>,
        conditional: bool,
    ) -> Result<PageResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.get_once(req, page, conditional).await {
                Err(FetchError::Transport(msg)) if attempt < self.retries => {
                    attempt += 1;
                    warn!("{} failed ({}), retry {}/{}", req.url, msg, attempt, self.retries);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                other => return other,
            }
        }
    }

    async fn get_once(
        &self,
        req: &ApiRequest,
        page: Option<u32>,
        conditional: bool,
    ) -> Result<PageResponse, FetchError> {
        self.limiter.record_call(&req.class, req.target);

        let mut builder = self.client.get(&req.url);
        if let Some(n) = page {
            builder = builder.query(&[("page", n)]);
        }
        if let Some(token) = &req.bearer {
            builder = builder.bearer_auth(token);
        }
        if conditional {
            if let Some(etag) = &req.if_none_match {
                builder = builder.header(IF_NONE_MATCH, etag);
            }
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = resp.status();
        let headers = resp.headers().clone();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(PageResponse::NotModified(headers));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if status.is_client_error() {
            return Err(FetchError::Client(ErrorInfo {
                status: status.as_u16(),
                message: error_message(&bytes),
                remaining: header_str(&headers, HEADER_ERROR_REMAIN)
                    .and_then(|v| v.trim().parse().ok()),
                reset_secs: header_str(&headers, HEADER_ERROR_RESET)
                    .and_then(|v| v.trim().parse().ok()),
            }));
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!("{} from {}", status, req.url)));
        }

        let body = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("{} sent a body that is not JSON: {e}", req.url);
            format!("invalid JSON from {}: {e}", req.url)
        });
        Ok(PageResponse::Page(Page { body, headers }))
    }
}

pub fn default_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("chronicle/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `Expires` is an HTTP date; unparseable values count as absent.
pub fn parse_expires(headers: &HeaderMap) -> Option<Timestamp> {
    let raw = header_str(headers, EXPIRES.as_str())?;
    chrono::DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn into_items(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn error_message(bytes: &[u8]) -> String {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).trim().to_string())
}
