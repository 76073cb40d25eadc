//! 재시도 정책 - 외부 모델 호출용 지수 백오프
//!
//! 임베딩 게이트웨이와 답변 생성 게이트웨이가 같은 정책을 공유합니다.
//! 일시적 에러(RateLimited, ModelUnavailable)만 재시도하며,
//! 호출마다 타임아웃을 적용합니다. 타임아웃은 일반 실패와 같은 에러 종류로 노출됩니다.

use std::future::Future;
use std::time::Duration;

use crate::error::{RagError, Result};

/// 백오프 배수
const BACKOFF_MULTIPLIER: u32 = 2;

/// 재시도 정책
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 총 시도 횟수 (최초 호출 포함, 1 이상)
    pub max_attempts: u32,
    /// 첫 재시도 전 대기
    pub initial_backoff: Duration,
    /// 백오프 상한
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// 재시도 없음 (1회 시도)
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// `attempt`번째 실패(0-based) 이후의 대기 시간
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// 작업 실행 (타임아웃 + 지수 백오프 재시도)
    ///
    /// `on_timeout`은 타임아웃을 호출 종류에 맞는 에러로 변환합니다.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        on_timeout: impl Fn(Duration) -> RagError,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(on_timeout(timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let backoff = self.backoff_for(attempt);
                    tracing::warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        operation,
                        e,
                        backoff,
                        attempt + 1,
                        attempts
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!("{} failed after {} attempts: {}", operation, attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn timeout_error(d: Duration) -> RagError {
        RagError::ModelUnavailable(format!("timed out after {:?}", d))
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", Duration::from_secs(1), timeout_error, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(RagError::RateLimited("429".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(3)
            .run("test", Duration::from_secs(1), timeout_error, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RagError::RateLimited("429".into()))
            })
            .await;
        assert!(matches!(result, Err(RagError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(5)
            .run("test", Duration::from_secs(1), timeout_error, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RagError::GenerationError("refused".into()))
            })
            .await;
        assert!(matches!(result, Err(RagError::GenerationError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error_kind() {
        let result: Result<()> = fast_policy(2)
            .run("slow", Duration::from_millis(5), timeout_error, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(RagError::ModelUnavailable(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
