// 临时凭证管理
//
// 每个上传会话持有一个 TokenKeeper：
// - 距上次续期超过续期周期时续期
// - 凭证剩余有效期短于一次分片传输的预计耗时也提前续期，
//   避免传输途中凭证过期

use crate::error::{UploadError, UploadResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// 单次传输耗时估计的平滑系数
const TRANSFER_ESTIMATE_ALPHA: f64 = 0.3;

/// 访问凭证
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    /// 过期时间（None 表示由续期周期控制）
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at: Some(expires_at),
        }
    }

    /// 剩余有效期（无过期时间返回 None，已过期返回 0）
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// 凭证签发接口（外部协作者）
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// 签发凭证，`file_name` 为凭证作用的文件（可选）
    async fn issue(&self, file_name: Option<&str>) -> Result<AccessToken>;
}

/// 固定凭证签发器
///
/// 每次签发同一个值，可选设置有效期
#[derive(Debug, Clone)]
pub struct StaticCredentialBroker {
    value: String,
    ttl: Option<Duration>,
}

impl StaticCredentialBroker {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl CredentialBroker for StaticCredentialBroker {
    async fn issue(&self, _file_name: Option<&str>) -> Result<AccessToken> {
        let expires_at = match self.ttl {
            Some(ttl) => Some(Utc::now() + chrono::Duration::from_std(ttl)?),
            None => None,
        };
        Ok(AccessToken {
            value: self.value.clone(),
            expires_at,
        })
    }
}

/// 会话级凭证持有者
///
/// 只由会话的调度任务使用，无需加锁
pub struct TokenKeeper {
    file_name: String,
    token: AccessToken,
    renewed_at: Instant,
    renewal_period: Duration,
    /// 单次分片传输的平滑耗时估计
    expected_transfer: Option<Duration>,
    renewals: u32,
}

impl TokenKeeper {
    /// 签发初始凭证
    pub async fn issue(
        broker: &dyn CredentialBroker,
        file_name: &str,
        renewal_period: Duration,
    ) -> UploadResult<Self> {
        let token = broker
            .issue(Some(file_name))
            .await
            .map_err(UploadError::TokenRefresh)?;

        Ok(Self {
            file_name: file_name.to_string(),
            token,
            renewed_at: Instant::now(),
            renewal_period,
            expected_transfer: None,
            renewals: 0,
        })
    }

    /// 当前凭证
    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    /// 已续期次数
    pub fn renewals(&self) -> u32 {
        self.renewals
    }

    pub fn expected_transfer(&self) -> Option<Duration> {
        self.expected_transfer
    }

    /// 记录一次分片传输耗时
    pub fn record_transfer_duration(&mut self, elapsed: Duration) {
        self.expected_transfer = Some(match self.expected_transfer {
            None => elapsed,
            Some(previous) => previous.mul_f64(1.0 - TRANSFER_ESTIMATE_ALPHA)
                + elapsed.mul_f64(TRANSFER_ESTIMATE_ALPHA),
        });
    }

    /// 是否需要续期
    pub fn needs_renewal(&self) -> bool {
        if self.renewed_at.elapsed() >= self.renewal_period {
            return true;
        }

        match self.token.remaining(Utc::now()) {
            Some(remaining) => remaining <= self.expected_transfer.unwrap_or(Duration::ZERO),
            None => false,
        }
    }

    /// 确保凭证在下一次传输期间有效，必要时续期
    ///
    /// 返回是否发生了续期
    pub async fn ensure_fresh(&mut self, broker: &dyn CredentialBroker) -> UploadResult<bool> {
        if !self.needs_renewal() {
            return Ok(false);
        }

        debug!(
            "[{}] 续期凭证 (距上次续期 {:?}, 预计单次传输 {:?})",
            self.file_name,
            self.renewed_at.elapsed(),
            self.expected_transfer
        );

        self.token = broker
            .issue(Some(&self.file_name))
            .await
            .map_err(UploadError::TokenRefresh)?;
        self.renewed_at = Instant::now();
        self.renewals += 1;

        info!("[{}] 凭证已续期 (第 {} 次)", self.file_name, self.renewals);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 每次签发递增编号的凭证
    struct CountingBroker {
        issued: AtomicU32,
        ttl: Option<chrono::Duration>,
        fail: bool,
    }

    impl CountingBroker {
        fn new(ttl: Option<chrono::Duration>) -> Self {
            Self {
                issued: AtomicU32::new(0),
                ttl,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl CredentialBroker for CountingBroker {
        async fn issue(&self, _file_name: Option<&str>) -> Result<AccessToken> {
            if self.fail {
                anyhow::bail!("issuer unavailable");
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                value: format!("token-{}", n),
                expires_at: self.ttl.map(|ttl| Utc::now() + ttl),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_after_period() {
        let broker = CountingBroker::new(None);
        let mut keeper = TokenKeeper::issue(&broker, "a.bin", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(keeper.token().value, "token-0");

        assert!(!keeper.ensure_fresh(&broker).await.unwrap());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(keeper.ensure_fresh(&broker).await.unwrap());
        assert_eq!(keeper.token().value, "token-1");
        assert_eq!(keeper.renewals(), 1);

        assert!(!keeper.ensure_fresh(&broker).await.unwrap());
    }

    #[tokio::test]
    async fn test_renews_when_validity_shorter_than_transfer() {
        let broker = CountingBroker::new(Some(chrono::Duration::seconds(30)));
        let mut keeper = TokenKeeper::issue(&broker, "a.bin", Duration::from_secs(300))
            .await
            .unwrap();

        keeper.record_transfer_duration(Duration::from_secs(5));
        assert!(!keeper.needs_renewal());

        // 平滑后约 63.5s，超过剩余的 30s 有效期
        keeper.record_transfer_duration(Duration::from_secs(200));
        assert!(keeper.expected_transfer().unwrap() > Duration::from_secs(30));
        assert!(keeper.ensure_fresh(&broker).await.unwrap());
        assert_eq!(keeper.token().value, "token-1");
    }

    #[tokio::test]
    async fn test_issue_failure_maps_to_token_refresh() {
        let mut broker = CountingBroker::new(None);
        broker.fail = true;
        let result = TokenKeeper::issue(&broker, "a.bin", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(UploadError::TokenRefresh(_))));
    }

    #[test]
    fn test_remaining() {
        let now = Utc::now();
        let token = AccessToken::with_expiry("t", now + chrono::Duration::seconds(10));
        assert_eq!(token.remaining(now), Some(Duration::from_secs(10)));
        assert_eq!(
            token.remaining(now + chrono::Duration::seconds(20)),
            Some(Duration::ZERO)
        );
        assert_eq!(AccessToken::new("t").remaining(now), None);
    }

    #[tokio::test]
    async fn test_static_broker_ttl() {
        let broker = StaticCredentialBroker::new("fixed").with_ttl(Duration::from_secs(60));
        let token = broker.issue(Some("a.bin")).await.unwrap();
        assert_eq!(token.value, "fixed");
        assert!(token.expires_at.unwrap() > Utc::now());

        let token = StaticCredentialBroker::new("fixed").issue(None).await.unwrap();
        assert!(token.expires_at.is_none());
    }
}
