use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Returned when the token fires before the future completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelErr {
    #[error("cancelled")]
    Cancelled,
}

#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against `token`. A token that is already cancelled
    /// wins even if the future is immediately ready.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `period` unless `token` fires first. Returns `false` on cancel.
pub async fn sleep_or_cancel(period: Duration, token: &CancellationToken) -> bool {
    tokio::time::sleep(period).or_cancel(token).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    #[tokio::test]
    async fn completes_before_cancel() {
        let token = CancellationToken::new();
        assert_eq!(Ok(42), async { 42 }.or_cancel(&token).await);
    }

    #[tokio::test]
    async fn cancel_wins_over_slow_future() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = async {
            sleep(Duration::from_millis(500)).await;
            7
        }
        .or_cancel(&token)
        .await;

        canceller.await.unwrap();
        assert_eq!(Err(CancelErr::Cancelled), result);
    }

    #[tokio::test]
    async fn pre_cancelled_token_beats_ready_future() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(Err(CancelErr::Cancelled), async { 5 }.or_cancel(&token).await);
    }

    #[tokio::test]
    async fn sleep_or_cancel_reports_outcome() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &token).await);
        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &token).await);
    }
}
