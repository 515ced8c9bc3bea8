//! Background expiration sweeper driven by a tokio interval.

use std::sync::Arc;
use std::time::Duration;

use domain::expiry::ExpirationSweeper;
use domain::{Clock, LinkRepository};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Run a sweep every `every` until `shutdown` flips to `true` or its sender
/// is dropped.
///
/// Sweeps run one at a time on the blocking pool. A failed sweep is logged
/// and retried on the next tick. Shutdown is checked between sweeps, never
/// mid-sweep.
pub async fn run_sweeper<L, C>(
    sweeper: Arc<ExpirationSweeper<L, C>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    L: LinkRepository + 'static,
    C: Clock + 'static,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    info!(interval_ms = every.as_millis() as u64, "expiration sweeper started");

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let s = sweeper.clone();
                match tokio::task::spawn_blocking(move || s.sweep()).await {
                    Ok(Ok(0)) => debug!("no links to expire"),
                    Ok(Ok(count)) => info!(count, "processed expired links"),
                    Ok(Err(e)) => error!(err = ?e, "error processing expired links"),
                    Err(e) => error!(err = ?e, "sweep task failed"),
                }
            }
        }
    }
    info!("expiration sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::adapters::memory_repo::InMemoryRepo;
    use domain::{Link, ShortToken, SystemClock};
    use std::time::SystemTime;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweeps_on_tick_and_stops_on_signal() {
        let repo = Arc::new(InMemoryRepo::new());
        let link = Link::new(
            ShortToken::new("old").unwrap(),
            "https://example.com/".into(),
            Some(SystemTime::now() - Duration::from_secs(60)),
            Uuid::new_v4(),
            SystemTime::now(),
        );
        repo.insert(link.clone()).unwrap();

        let sweeper = Arc::new(ExpirationSweeper::new(repo.clone(), SystemClock));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(sweeper, Duration::from_millis(10), rx));

        let mut swept = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if repo.get(&link.shortened).unwrap().is_none() {
                swept = true;
                break;
            }
        }
        assert!(swept, "link was not swept");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn stops_when_sender_dropped() {
        let repo = Arc::new(InMemoryRepo::new());
        let sweeper = Arc::new(ExpirationSweeper::new(repo, SystemClock));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(sweeper, Duration::from_secs(3600), rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
