// 分片传输重试策略（指数退避）

use crate::config::RetryConfig;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 重试策略
///
/// # 延迟序列（base=100ms, max=5000ms）
/// - retry=0: 100ms
/// - retry=1: 200ms
/// - retry=2: 400ms
/// - retry=3: 800ms
/// - 最大: 5000ms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含首次）
    pub max_attempts: u32,
    /// 初始退避延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大退避延迟（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// 第 `retry_count` 次重试前的等待时间
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// 执行操作，失败时按指数退避重试
    ///
    /// 达到最大尝试次数后返回最后一次的错误
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "{} 失败，等待 {}ms 后重试 ({}/{}): {:#}",
                        label,
                        delay.as_millis(),
                        attempt + 1,
                        max_attempts - 1,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(200), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = policy
            .run("test", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        return Err(anyhow::anyhow!("timeout"));
                    }
                    Ok::<u32, anyhow::Error>(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 1000,
        };
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<()> = policy
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(anyhow::anyhow!("attempt {} failed", attempt)) }
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "attempt 3 failed");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_no_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::no_retry()
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("boom")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
