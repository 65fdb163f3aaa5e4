//! Delivery channel abstraction.

use crate::errors::DeliveryChannelError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// A destination for the final artifact (email, SMS, webhook, ...).
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `artifact`. The returned string is a human-readable receipt.
    async fn send(&self, artifact: &Value) -> Result<String, DeliveryChannelError>;
}

/// Adapts an async closure into a [`DeliveryChannel`].
pub struct FnChannel<F> {
    name: String,
    f: F,
}

impl<F> FnChannel<F> {
    pub fn new<Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync,
        Fut: Future<Output = Result<String, DeliveryChannelError>> + Send,
    {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> DeliveryChannel for FnChannel<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, DeliveryChannelError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, artifact: &Value) -> Result<String, DeliveryChannelError> {
        (self.f)(artifact.clone()).await
    }
}

/// Retries a single channel under a [`RetryPolicy`].
///
/// `Rejected` errors are final: the destination refused the artifact and
/// sending it again will not help.
pub struct RetryingChannel {
    inner: Arc<dyn DeliveryChannel>,
    policy: RetryPolicy,
}

impl RetryingChannel {
    pub fn new(inner: Arc<dyn DeliveryChannel>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl DeliveryChannel for RetryingChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, artifact: &Value) -> Result<String, DeliveryChannelError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.send(artifact).await {
                Ok(receipt) => return Ok(receipt),
                Err(DeliveryChannelError::Rejected(reason)) => {
                    return Err(DeliveryChannelError::Rejected(reason));
                }
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        channel = %self.inner.name(),
                        attempt,
                        error = %e,
                        "retrying delivery"
                    );
                    tokio::time::sleep(self.policy.backoff.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(
        name: &str,
        fail_times: u32,
        calls: Arc<AtomicU32>,
        reject: bool,
    ) -> Arc<dyn DeliveryChannel> {
        Arc::new(FnChannel::new(name.to_string(), move |_artifact| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if reject {
                    Err(DeliveryChannelError::Rejected("bad payload".into()))
                } else if n <= fail_times {
                    Err(DeliveryChannelError::Unavailable("503".into()))
                } else {
                    Ok(format!("sent on call {}", n))
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_fn_channel_receives_artifact() {
        let channel = FnChannel::new("echo", |artifact| async move { Ok(artifact.to_string()) });
        assert_eq!(channel.name(), "echo");
        assert_eq!(channel.send(&json!({"a": 1})).await.unwrap(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_retrying_channel_recovers_from_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let channel = RetryingChannel::new(
            counting("sms", 2, calls.clone(), false),
            RetryPolicy::new(3),
        );

        let receipt = channel.send(&json!(null)).await.unwrap();
        assert_eq!(receipt, "sent on call 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(channel.name(), "sms");
    }

    #[tokio::test]
    async fn test_retrying_channel_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let channel = RetryingChannel::new(
            counting("sms", 10, calls.clone(), false),
            RetryPolicy::new(2),
        );

        let err = channel.send(&json!(null)).await.unwrap_err();
        assert!(matches!(err, DeliveryChannelError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retrying_channel_does_not_retry_rejections() {
        let calls = Arc::new(AtomicU32::new(0));
        let channel = RetryingChannel::new(
            counting("email", 0, calls.clone(), true),
            RetryPolicy::new(5),
        );

        let err = channel.send(&json!(null)).await.unwrap_err();
        assert!(matches!(err, DeliveryChannelError::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
