//! External collaborators the core calls out to but never depends on.
//!
//! Both calls are fire-and-forget: a failed dispatch is logged and must
//! not block or roll back the primary state change that triggered it.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
  /// Asks the external timer service to invoke `conclude_auction` for
  /// `auction_id` at (or shortly after) `at`. Delivery is at-least-once;
  /// conclusion itself is idempotent.
  async fn schedule_conclude(&self, auction_id: i64, at: DateTime<Utc>) -> anyhow::Result<()>;
  async fn notify(&self, user_id: i64, event: &str) -> anyhow::Result<()>;
}

/// Discards everything. Useful for tests and embedders that wire their
/// own dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
  async fn schedule_conclude(&self, _auction_id: i64, _at: DateTime<Utc>) -> anyhow::Result<()> {
    Ok(())
  }

  async fn notify(&self, _user_id: i64, _event: &str) -> anyhow::Result<()> {
    Ok(())
  }
}

pub(crate) async fn try_schedule_conclude<N: Notifier>(notifier: &N, auction_id: i64, at: DateTime<Utc>) {
  if let Err(err) = notifier.schedule_conclude(auction_id, at).await {
    warn!(auction_id, at = %at, error = %err, "failed to schedule auction conclusion");
  }
}

pub(crate) async fn try_notify<N: Notifier>(notifier: &N, user_id: i64, event: &str) {
  if let Err(err) = notifier.notify(user_id, event).await {
    warn!(user_id, event, error = %err, "failed to dispatch notification");
  }
}
