//! Inter-cycle wait shared by the scan and probe loops

use log::warn;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

/// Wait until one refresh period after `cycle_start`.
///
/// The period is re-read whenever the settings change, so a new refresh
/// frequency takes effect during the current wait. A cycle that already ran
/// past its period is logged and the next one starts immediately.
///
/// Returns false once `cancel` fires.
pub async fn wait_for_next_cycle(
    name: &str,
    cycle_start: Instant,
    settings: &mut watch::Receiver<Settings>,
    cancel: &CancellationToken,
) -> bool {
    let mut overrun_checked = false;
    loop {
        if cancel.is_cancelled() {
            return false;
        }

        let period = settings.borrow_and_update().refresh_period();
        let Some(deadline) = cycle_start.checked_add(period) else {
            warn!("{name} refresh period {period:?} is out of range, waiting for a new one");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                changed = settings.changed() => {
                    if changed.is_err() {
                        cancel.cancelled().await;
                        return false;
                    }
                }
            }
            continue;
        };
        if !overrun_checked {
            let elapsed = cycle_start.elapsed();
            if elapsed > period {
                warn!("{name} cycle overran refresh period ({elapsed:?} > {period:?})");
            }
            overrun_checked = true;
        }
        if Instant::now() >= deadline {
            return true;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            changed = settings.changed() => {
                if changed.is_err() {
                    // Settings owner is gone; finish out the current period.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return false,
                        _ = sleep_until(deadline) => return true,
                    }
                }
            }
            _ = sleep_until(deadline) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(seconds: u64) -> Settings {
        Settings {
            refresh_frequency_seconds: seconds,
            ..Settings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_remaining_period() {
        let (_tx, mut rx) = watch::channel(settings(10));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(wait_for_next_cycle("test", start, &mut rx, &cancel).await);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_starts_immediately() {
        let (_tx, mut rx) = watch::channel(settings(1));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(5)).await;

        let before = Instant::now();
        assert!(wait_for_next_cycle("test", start, &mut rx, &cancel).await);
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_period_applies_mid_wait() {
        let (tx, mut rx) = watch::channel(settings(60));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let waiter = tokio::spawn(async move { wait_for_next_cycle("test", start, &mut rx, &cancel).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send_modify(|s| s.refresh_frequency_seconds = 2);

        assert!(waiter.await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_period_waits_for_a_new_one() {
        let (tx, mut rx) = watch::channel(settings(u64::MAX));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let waiter = tokio::spawn(async move { wait_for_next_cycle("test", start, &mut rx, &cancel).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        tx.send_modify(|s| s.refresh_frequency_seconds = 3);

        assert!(waiter.await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let (_tx, mut rx) = watch::channel(settings(60));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { wait_for_next_cycle("test", start, &mut rx, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert!(!waiter.await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
