//! Automation scheduler: periodic sweeps for deferred epilogues and pending
//! referrals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::channels::{MessageSink, deliver_all};
use crate::flow::FlowEngine;
use crate::flow::messages::OutboundMessage;
use crate::store::Database;

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Due epilogue contexts looked at.
    pub due_processed: usize,
    /// Pending referral profiles looked at.
    pub pending_processed: usize,
    pub messages: Vec<OutboundMessage>,
}

pub struct AutomationScheduler {
    engine: Arc<FlowEngine>,
    db: Arc<dyn Database>,
    running: AtomicBool,
}

/// Clears the running flag when a tick ends, including on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AutomationScheduler {
    pub fn new(engine: Arc<FlowEngine>, db: Arc<dyn Database>) -> Self {
        Self {
            engine,
            db,
            running: AtomicBool::new(false),
        }
    }

    /// Run both sweeps now. Returns `None` if another tick is still running.
    pub async fn tick(&self) -> Option<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run both sweeps as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Option<TickReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Automation tick skipped, previous tick still running");
            return None;
        }
        let _running = RunningGuard(&self.running);

        let mut report = TickReport::default();
        self.sweep_due_epilogues(now, &mut report).await;
        self.sweep_pending_referrals(&mut report).await;

        if report.due_processed + report.pending_processed > 0 {
            info!(
                due = report.due_processed,
                pending = report.pending_processed,
                messages = report.messages.len(),
                "Automation tick finished"
            );
        }
        Some(report)
    }

    async fn sweep_due_epilogues(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let due = match self.db.list_due_contexts(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!("Failed to list due epilogues: {}", e);
                return;
            }
        };

        for ctx in due {
            report.due_processed += 1;
            match self.engine.resume_due_epilogue(ctx.user_id, now).await {
                Ok(messages) => report.messages.extend(messages),
                Err(e) => warn!(user_id = ctx.user_id, "Deferred epilogue failed: {}", e),
            }
        }
    }

    async fn sweep_pending_referrals(&self, report: &mut TickReport) {
        let pending = match self.db.list_pending_referrals().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to list pending referrals: {}", e);
                return;
            }
        };

        for profile in pending {
            report.pending_processed += 1;
            match self.engine.recheck_pending_referral(profile.user_id).await {
                Ok(messages) => report.messages.extend(messages),
                Err(e) => warn!(user_id = profile.user_id, "Pending referral recheck failed: {}", e),
            }
        }
    }
}

/// Drive `scheduler` every `interval` and hand produced messages to `sink`
/// without waiting for delivery.
pub fn spawn_ticker(
    scheduler: Arc<AutomationScheduler>,
    sink: Arc<dyn MessageSink>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(report) = scheduler.tick().await else {
                continue;
            };
            if report.messages.is_empty() {
                continue;
            }
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                deliver_all(sink.as_ref(), report.messages).await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::store::LibSqlBackend;
    use crate::subscription::{MembershipStatus, StaticOracle};

    async fn scheduler() -> AutomationScheduler {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let oracle = Arc::new(StaticOracle::new(MembershipStatus::NotSubscribed));
        let engine = Arc::new(FlowEngine::new(Arc::clone(&db), oracle, BotConfig::default()));
        AutomationScheduler::new(engine, db)
    }

    #[tokio::test]
    async fn empty_tick_reports_nothing() {
        let scheduler = scheduler().await;
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.due_processed, 0);
        assert_eq!(report.pending_processed, 0);
        assert!(report.messages.is_empty());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let scheduler = scheduler().await;
        scheduler.running.store(true, Ordering::SeqCst);
        assert!(scheduler.tick().await.is_none());

        scheduler.running.store(false, Ordering::SeqCst);
        assert!(scheduler.tick().await.is_some());
        assert!(!scheduler.running.load(Ordering::SeqCst), "flag is cleared after a tick");
    }
}
