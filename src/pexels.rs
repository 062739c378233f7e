// ============================================================================
// Pexels API Integration
// ============================================================================
// Base URL: https://api.pexels.com/v1
// Rate Limit: 200 requests/hour, 20,000 requests/month
// API Key: REQUIRED (free signup at pexels.com/api)
// ============================================================================

use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use clap::ValueEnum;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::{Quota, TokenBucket, DEFAULT_RESERVE};
use crate::retry::RetryPolicy;

pub const API_BASE: &str = "https://api.pexels.com/v1";
pub const MAX_PER_PAGE: u32 = 80;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on buffer space reserved from a Content-Length header
const MAX_PREALLOC: u64 = 32 * 1024 * 1024;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// API Response Structures
// ============================================================================
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub total_results: u32,
    #[serde(default)]
    pub photos: Vec<Photo>,
    pub next_page: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Photo {
    pub id: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub photographer: String,
    #[serde(default)]
    pub photographer_url: String,
    pub avg_color: Option<String>,
    pub src: PhotoSrc,
    pub alt: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PhotoSrc {
    pub original: String,
    #[serde(default)]
    pub large2x: String,
    #[serde(default)]
    pub large: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub small: String,
    #[serde(default)]
    pub portrait: String,
    #[serde(default)]
    pub landscape: String,
    #[serde(default)]
    pub tiny: String,
}

// ============================================================================
// Search Filters
// ============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Square => "square",
        }
    }
}

/// Minimum photo size: large = 24MP, medium = 12MP, small = 4MP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    Large,
    Medium,
    Small,
}

impl Size {
    pub fn as_str(&self) -> &'static str {
        match self {
            Size::Large => "large",
            Size::Medium => "medium",
            Size::Small => "small",
        }
    }
}

/// Which `src` variant gets downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Original,
    Large2x,
    Large,
    Medium,
}

pub const NAMED_COLORS: [&str; 12] = [
    "red", "orange", "yellow", "green", "turquoise", "blue",
    "violet", "pink", "brown", "black", "gray", "white",
];

pub const LOCALES: [&str; 28] = [
    "en-US", "pt-BR", "es-ES", "ca-ES", "de-DE", "it-IT", "fr-FR",
    "sv-SE", "id-ID", "pl-PL", "ja-JP", "zh-TW", "zh-CN", "ko-KR",
    "th-TH", "nl-NL", "hu-HU", "vi-VN", "cs-CZ", "da-DK", "fi-FI",
    "uk-UA", "el-GR", "ro-RO", "nb-NO", "sk-SK", "tr-TR", "ru-RU",
];

/// A Pexels color filter: a named color or a `#rrggbb` hex code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl FromStr for Color {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if NAMED_COLORS.contains(&s.as_str()) {
            return Ok(Color(s));
        }
        let hex = s.strip_prefix('#').unwrap_or(&s);
        if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Color(format!("#{}", hex)));
        }
        Err(Error::invalid_input(format!(
            "unknown color '{}' (use one of {} or #rrggbb)",
            s,
            NAMED_COLORS.join(", ")
        )))
    }
}

impl TryFrom<String> for Color {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Color> for String {
    fn from(c: Color) -> String {
        c.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locale(String);

impl FromStr for Locale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        LOCALES
            .iter()
            .find(|l| l.eq_ignore_ascii_case(s))
            .map(|l| Locale(l.to_string()))
            .ok_or_else(|| Error::invalid_input(format!("unsupported locale '{}'", s)))
    }
}

impl TryFrom<String> for Locale {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Locale> for String {
    fn from(l: Locale) -> String {
        l.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub orientation: Option<Orientation>,
    pub size: Option<Size>,
    pub color: Option<Color>,
    pub locale: Option<Locale>,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Build the search URL. Only filters that are set are emitted.
pub fn build_search_url(base: &str, query: &str, filters: &SearchFilters, page: u32, per_page: u32) -> String {
    let mut url = format!(
        "{}/search?query={}&page={}&per_page={}",
        base.trim_end_matches('/'),
        urlencoding::encode(query),
        page.max(1),
        per_page.clamp(1, MAX_PER_PAGE)
    );
    if let Some(o) = filters.orientation {
        url.push_str(&format!("&orientation={}", o.as_str()));
    }
    if let Some(s) = filters.size {
        url.push_str(&format!("&size={}", s.as_str()));
    }
    if let Some(c) = &filters.color {
        url.push_str(&format!("&color={}", urlencoding::encode(&c.0)));
    }
    if let Some(l) = &filters.locale {
        url.push_str(&format!("&locale={}", l.0));
    }
    url
}

impl Photo {
    pub fn download_url(&self, quality: Quality) -> &str {
        let preferred = match quality {
            Quality::Original => &self.src.original,
            Quality::Large2x => &self.src.large2x,
            Quality::Large => &self.src.large,
            Quality::Medium => &self.src.medium,
        };
        if preferred.is_empty() {
            &self.src.original
        } else {
            preferred
        }
    }

    /// `<id><ext>` with the extension taken from the URL path
    pub fn file_name(&self, url: &str) -> String {
        format!("{}{}", self.id, extension_from_url(url).unwrap_or_else(|| ".jpg".to_string()))
    }
}

fn extension_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?.to_string();
    let dot = last.rfind('.')?;
    let ext = &last[dot + 1..];
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

// ============================================================================
// Client
// ============================================================================
pub struct PexelsClient {
    http: Client,
    api_key: String,
    base_url: String,
    limiter: TokenBucket,
    quota: Quota,
    reserve: u32,
    retry: RetryPolicy,
}

impl fmt::Debug for PexelsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PexelsClient {{ base_url: {:?}, quota: {:?} }}", self.base_url, self.quota)
    }
}

impl PexelsClient {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, API_BASE)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(PexelsClient {
            http,
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: TokenBucket::default(),
            quota: Quota::default(),
            reserve: DEFAULT_RESERVE,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_limiter(mut self, limiter: TokenBucket) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Seed the quota from a previous run.
    pub fn with_quota(mut self, quota: Quota, reserve: u32) -> Self {
        self.quota = quota;
        self.reserve = reserve;
        self
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    pub fn search(&mut self, query: &str, filters: &SearchFilters, page: u32, per_page: u32) -> Result<SearchResponse> {
        let url = build_search_url(&self.base_url, query, filters, page, per_page);
        self.fetch_page(&url)
    }

    /// Fetch one page of search results, e.g. a `next_page` URL.
    pub fn fetch_page(&mut self, url: &str) -> Result<SearchResponse> {
        let retry = self.retry.clone();
        retry.run("search", || self.api_get(url))
    }

    fn api_get(&mut self, url: &str) -> Result<SearchResponse> {
        self.quota.check(self.reserve, Utc::now())?;
        let waited = self.limiter.acquire();
        if !waited.is_zero() {
            tracing::debug!(?waited, "paced API request");
        }

        tracing::debug!(url, "calling Pexels API");
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, &self.api_key)
            .send()?;

        if let Some(quota) = Quota::from_headers(response.headers()) {
            self.quota = quota;
        }

        let response = check_status(response, url)?;
        Ok(response.json::<SearchResponse>()?)
    }

    /// Download raw image bytes. Image hosts are not counted against the API quota.
    pub fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.retry.run("image download", || {
            let response = check_image_status(self.http.get(url).send()?, url)?;
            if let Some(ct) = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
                if !ct.starts_with("image/") && !ct.starts_with("application/octet-stream") {
                    return Err(Error::InvalidImage(format!("content type {}", ct)));
                }
            }
            let expected = response.content_length();
            let mut buffer = Vec::with_capacity(expected.unwrap_or(0).min(MAX_PREALLOC) as usize);
            let mut response = response;
            response.read_to_end(&mut buffer)?;
            if let Some(len) = expected {
                if buffer.len() as u64 != len {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("got {} of {} bytes", buffer.len(), len),
                    )));
                }
            }
            Ok(buffer)
        })
    }
}

fn check_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let delay = retry_after(response.headers());
    tracing::error!(%status, url, "request returned error status");
    Err(Error::from_status(status, url, delay))
}

/// Image hosts don't see the API key, so their 401/403 are plain failures.
fn check_image_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    tracing::error!(%status, url, "image request returned error status");
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
            retry_after: retry_after(response.headers()),
        }),
        _ => Err(Error::Status {
            status,
            url: url.to_string(),
        }),
    }
}
