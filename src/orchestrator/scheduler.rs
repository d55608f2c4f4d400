//! Background loops around the orchestrator: the cycle ticker and queue
//! maintenance (command expiry, lapsed lock reaping).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::coordination::ExecutionLock;
use crate::persistence::Store;

use super::cycle::Orchestrator;

/// Delay before the next cycle tick. Normal mode aligns ticks to wall-clock
/// multiples of the interval so restarts and multiple instances tick
/// together; aggressive mode just runs flat-out on its shorter interval.
pub fn delay_until_next_cycle(now: DateTime<Utc>, interval_secs: u64, aligned: bool) -> Duration {
    let interval_ms = (interval_secs.max(1) * 1000) as i64;
    if !aligned {
        return Duration::from_millis(interval_ms as u64);
    }
    let rem = now.timestamp_millis().rem_euclid(interval_ms);
    Duration::from_millis((interval_ms - rem) as u64)
}

/// Trading cycle ticker; runs until the task is aborted.
pub async fn run_cycle_loop(orchestrator: Arc<Orchestrator>, config: Arc<AppConfig>) {
    let interval_secs = config.cycle_interval_secs();
    let aligned = !config.trading.aggressive;
    info!(
        "Cycle loop started: every {}s{}",
        interval_secs,
        if aligned { ", wall-clock aligned" } else { "" }
    );

    loop {
        let delay = delay_until_next_cycle(Utc::now(), interval_secs, aligned);
        tokio::time::sleep(delay).await;
        if let Err(e) = orchestrator.run_cycle().await {
            error!("Trading cycle failed: {}", e);
        }
    }
}

/// Queue maintenance: flip overdue PENDING/SENT commands to EXPIRED and drop
/// long-lapsed lock rows.
pub async fn run_maintenance_loop(
    store: Arc<dyn Store>,
    lock: Arc<ExecutionLock>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Maintenance loop started: every {:?}", period);

    loop {
        ticker.tick().await;

        match store.expire_overdue_commands().await {
            Ok(n) if n > 0 => info!("Expired {} overdue command(s)", n),
            Ok(_) => {}
            Err(e) => warn!("Command expiry sweep failed: {}", e),
        }

        match lock.reap_expired().await {
            Ok(n) if n > 0 => info!("Reaped {} lapsed lock row(s)", n),
            Ok(_) => {}
            Err(e) => warn!("Lock reaping failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_aligned_delay_hits_boundary() {
        // 12:00:02 with a 15s interval: 13s to 12:00:15
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 2).unwrap();
        assert_eq!(
            delay_until_next_cycle(now, 15, true),
            Duration::from_secs(13)
        );
    }

    #[test]
    fn test_aligned_delay_on_boundary_waits_full_interval() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 15).unwrap();
        assert_eq!(
            delay_until_next_cycle(now, 15, true),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_unaligned_delay_is_flat_interval() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 7).unwrap();
        assert_eq!(
            delay_until_next_cycle(now, 5, false),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_zero_interval_never_busy_loops() {
        let now = Utc::now();
        assert!(delay_until_next_cycle(now, 0, true) > Duration::ZERO);
    }
}
