//! Periodic overdue sweep

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use super::ledger::BorrowLedger;

pub struct OverdueSweeper {
    ledger: BorrowLedger,
    every: Duration,
}

impl OverdueSweeper {
    pub fn new(ledger: BorrowLedger, every: Duration) -> Self {
        Self { ledger, every }
    }

    /// Run one sweep. Failures are logged and reported as `None`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Option<u64> {
        match self.ledger.sweep_overdue(now).await {
            Ok(changed) => {
                tracing::debug!(changed, "Overdue sweep finished");
                Some(changed)
            }
            Err(e) => {
                tracing::error!("Overdue sweep failed: {}", e);
                None
            }
        }
    }

    /// Sweep on every tick, starting immediately
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once(Utc::now()).await;
            }
        })
    }
}
