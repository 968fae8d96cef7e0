//! Background synchronization: keep a repository's record from going stale.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;
use crate::repo::{RepoInner, Repository};

/// Floor for the sync period. Sub-second (and zero) staleness thresholds
/// would otherwise turn the syncer into a hot loop against the data source.
pub const MIN_SYNC_PERIOD: Duration = Duration::from_secs(1);

impl<T> Repository<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Start background synchronization with no completion callback.
  pub async fn init_syncer(&self) -> Result<()> {
    self.init_syncer_with(|| {}).await
  }

  /// Start background synchronization, invoking `on_fetched` after every
  /// successful background fetch.
  ///
  /// If the record is already stale (or absent) one fetch happens before
  /// this returns, and its error is propagated; either way the periodic
  /// schedule is armed, so a failed first fetch gets retried one period
  /// later. If the record is still fresh, the first tick is deferred until
  /// the moment it goes stale, then the regular cadence takes over.
  ///
  /// Calling this on a repository that is already syncing replaces the
  /// running schedule.
  pub async fn init_syncer_with(
    &self,
    on_fetched: impl Fn() + Send + Sync + 'static,
  ) -> Result<()> {
    self.destroy_syncer();

    let period = sync_period(self.inner.stale_after);

    let status = self.get_data_up_to_date_status().await?;
    let (first_tick_in, immediate) = match (status.is_data_up_to_date, status.last_fetched) {
      (true, Some(last_fetched)) => {
        let elapsed = Utc::now() - last_fetched;
        let remaining = (self.inner.stale_after - elapsed)
          .to_std()
          .unwrap_or(Duration::ZERO)
          .max(MIN_SYNC_PERIOD);
        (remaining, Ok(()))
      }
      _ => {
        let result = self.refresh().await.map(|_| ());
        if result.is_ok() {
          on_fetched();
        }
        (period, result)
      }
    };

    debug!(
      name = %self.inner.name,
      first_tick_in_ms = first_tick_in.as_millis() as u64,
      period_ms = period.as_millis() as u64,
      "starting syncer"
    );

    // The task holds only a weak handle so an abandoned repository can be
    // dropped; the next tick then finds it gone and exits.
    let weak: Weak<RepoInner<T>> = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      sleep(first_tick_in).await;
      loop {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let repo = Repository { inner };
        match repo.refresh().await {
          Ok(_) => on_fetched(),
          Err(e) => warn!(name = %repo.inner.name, error = %e, "background sync failed"),
        }
        drop(repo);
        sleep(period).await;
      }
    });

    *self.inner.lock_syncer() = Some(handle);

    immediate
  }

  /// Stop background synchronization. A no-op when none is running.
  pub fn destroy_syncer(&self) {
    if let Some(handle) = self.inner.lock_syncer().take() {
      handle.abort();
      debug!(name = %self.inner.name, "stopped syncer");
    }
  }
}

fn sync_period(stale_after: chrono::Duration) -> Duration {
  stale_after
    .to_std()
    .unwrap_or(Duration::ZERO)
    .max(MIN_SYNC_PERIOD)
}
