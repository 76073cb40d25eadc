//! Gemini REST 클라이언트 - 임베딩/생성 프로바이더 공통
//!
//! API 키 로드, 클라이언트 측 요청 간격 조절(Rate Limiter), HTTP 상태 → 에러 분류를 담당합니다.
//! 재시도는 하지 않습니다. 재시도/타임아웃은 게이트웨이의 `RetryPolicy`가 적용합니다.
//!
//! source: https://ai.google.dev/gemini-api/docs

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{RagError, Result};

/// API 베이스 URL
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이 (1000ms = 60 RPM 준수)
const MIN_DELAY_MS: u64 = 1000;

// ============================================================================
// Rate Limiter
// ============================================================================

/// Rate Limiter with minimum delay between requests
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration, min_delay: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay,
            last_request: None,
        }
    }

    /// 요청 가능 여부 확인 및 대기
    async fn acquire(&mut self) {
        // 1. 최소 딜레이 적용 (버스트 방지)
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        // 2. 윈도우 밖의 오래된 요청 제거
        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        // 3. Rate limit 초과 시 대기
        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        // 4. 현재 요청 기록
        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

// ============================================================================
// GeminiClient
// ============================================================================

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

/// 공유 가능한 Gemini HTTP 클라이언트 (복제 시 Rate Limiter 공유)
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_key: String,
    http: reqwest::Client,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl GeminiClient {
    /// 새 클라이언트 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `timeout` - HTTP 요청 타임아웃
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("ragpipe/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            http,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
                Duration::from_millis(MIN_DELAY_MS),
            ))),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    pub fn from_env(timeout: Duration) -> Result<Self> {
        Self::new(get_api_key()?, timeout)
    }

    /// 모델 메서드 URL (`models/<model>:<method>`)
    pub fn model_url(model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", GEMINI_API_BASE, model, method)
    }

    /// JSON POST 호출
    ///
    /// - 429 → `RateLimited`
    /// - 5xx, 전송 실패 → `ModelUnavailable`
    /// - 그 외 실패 (4xx, 응답 파싱) → `rejected(메시지)`
    pub async fn post_json<Req, Resp>(
        &self,
        url: &str,
        request: &Req,
        rejected: fn(String) -> RagError,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        {
            let mut limiter = self.rate_limiter.lock().await;
            limiter.acquire().await;
        }

        // API 키는 URL이 아닌 헤더로 전송
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::ModelUnavailable(format!("request timed out: {}", e))
                } else {
                    RagError::ModelUnavailable(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagError::ModelUnavailable(format!("failed to read response body: {}", e)))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| rejected(format!("unexpected response shape: {}", e)));
        }

        let message = match serde_json::from_str::<GeminiError>(&body) {
            Ok(error) => format!("Gemini API error ({}): {}", error.error.status, error.error.message),
            Err(_) => format!("Gemini API error ({}): {}", status, truncate(&body, 300)),
        };

        Err(classify_status(status.as_u16(), message, rejected))
    }
}

/// HTTP 상태 코드 → 에러 종류
pub(crate) fn classify_status(status: u16, message: String, rejected: fn(String) -> RagError) -> RagError {
    match status {
        429 => RagError::RateLimited(message),
        500..=599 => RagError::ModelUnavailable(message),
        _ => rejected(message),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    for var in ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                tracing::debug!("Using API key from {}", var);
                return Ok(key);
            }
        }
    }

    Err(RagError::InvalidConfig(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable \
         (https://aistudio.google.com/app/apikey), or use the 'local' provider."
            .into(),
    ))
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    get_api_key().is_ok()
}

// ============================================================================
// Tests
// ============================================================================
