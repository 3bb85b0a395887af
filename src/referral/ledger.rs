//! Idempotent referral crediting.
//!
//! A referrer earns exactly one point per invitee, no matter how many times
//! or from how many places (user callback, channel update, scheduler) the
//! crediting is triggered. The read-check-write runs under the referrer's
//! exclusive profile lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::ReferralUsage;
use crate::store::Database;

use super::idempotency_key;

/// One attempt to credit `referrer_id` for `invitee_id`.
#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub event_id: Uuid,
    pub referrer_id: i64,
    pub invitee_id: i64,
    pub idempotency_key: String,
    /// Which path triggered the crediting, for the ledger row.
    pub trigger_source: String,
    pub triggered_at: DateTime<Utc>,
    pub referral_link: String,
}

impl CreditRequest {
    /// A fresh event with the canonical idempotency key.
    pub fn new(
        referrer_id: i64,
        invitee_id: i64,
        trigger_source: impl Into<String>,
        referral_link: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            referrer_id,
            invitee_id,
            idempotency_key: idempotency_key(referrer_id, invitee_id),
            trigger_source: trigger_source.into(),
            triggered_at: Utc::now(),
            referral_link: referral_link.into(),
        }
    }

    /// Reason the request cannot be processed, if any.
    fn invalid_reason(&self) -> Option<&'static str> {
        if self.event_id.is_nil() {
            Some("missing event id")
        } else if self.referrer_id <= 0 || self.invitee_id <= 0 {
            Some("non-positive user id")
        } else if self.idempotency_key.trim().is_empty() {
            Some("blank idempotency key")
        } else if self.trigger_source.trim().is_empty() {
            Some("blank trigger source")
        } else if self.referrer_id == self.invitee_id {
            Some("self-referral")
        } else {
            None
        }
    }
}

/// What a crediting attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditOutcome {
    pub payload_valid: bool,
    /// A counted ledger row exists for this pair (before or after the call).
    pub already_counted: bool,
    /// This call added the point. Only then is the referrer notified.
    pub newly_counted: bool,
    pub referrer_points: i64,
    /// A ledger row exists but is not counted. Needs manual attention.
    pub anomaly: bool,
}

impl CreditOutcome {
    fn invalid() -> Self {
        Self {
            payload_valid: false,
            already_counted: false,
            newly_counted: false,
            referrer_points: 0,
            anomaly: false,
        }
    }
}

/// Credits referrers through the persistent store.
pub struct ReferralLedger {
    db: Arc<dyn Database>,
}

impl ReferralLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Credit the referrer for the invitee at most once.
    ///
    /// Invalid requests are reported in the outcome and change nothing.
    /// Storage failures are returned as errors.
    pub async fn credit(&self, req: &CreditRequest) -> Result<CreditOutcome, DatabaseError> {
        if let Some(reason) = req.invalid_reason() {
            warn!(
                referrer_id = req.referrer_id,
                invitee_id = req.invitee_id,
                reason,
                "Rejected referral credit request"
            );
            return Ok(CreditOutcome::invalid());
        }

        let lock = self.db.lock_profile_for_update(req.referrer_id).await?;
        let Some(referrer) = lock.profile.as_ref() else {
            warn!(referrer_id = req.referrer_id, "Referral credit for unknown referrer");
            return Ok(CreditOutcome::invalid());
        };
        if self.db.get_profile(req.invitee_id).await?.is_none() {
            warn!(invitee_id = req.invitee_id, "Referral credit for unknown invitee");
            return Ok(CreditOutcome::invalid());
        }

        let existing = match self.db.find_usage_by_key(&req.idempotency_key).await? {
            Some(usage) => Some(usage),
            None => {
                self.db
                    .find_usage_by_pair(req.referrer_id, req.invitee_id)
                    .await?
            }
        };

        if let Some(usage) = existing {
            if usage.already_counted {
                // Heal an invitee left PENDING by an earlier partial run.
                self.db
                    .mark_referral_counted(req.invitee_id, usage.counted_at.unwrap_or_else(Utc::now))
                    .await?;
                return Ok(CreditOutcome {
                    payload_valid: true,
                    already_counted: true,
                    newly_counted: false,
                    referrer_points: referrer.referral_points,
                    anomaly: false,
                });
            }

            warn!(
                referrer_id = req.referrer_id,
                invitee_id = req.invitee_id,
                event_id = %usage.event_id,
                "Uncounted referral usage found; manual remediation required"
            );
            return Ok(CreditOutcome {
                payload_valid: true,
                already_counted: false,
                newly_counted: false,
                referrer_points: referrer.referral_points,
                anomaly: true,
            });
        }

        let now = Utc::now();
        let usage = ReferralUsage {
            event_id: req.event_id,
            referral_link: req.referral_link.clone(),
            referrer_id: req.referrer_id,
            invitee_id: req.invitee_id,
            idempotency_key: req.idempotency_key.clone(),
            already_counted: true,
            counted_at: Some(now),
            trigger_source: req.trigger_source.clone(),
            triggered_at: req.triggered_at,
            created_at: now,
        };
        let points = self.db.record_referral_credit(&usage).await?;
        drop(lock);

        info!(
            referrer_id = req.referrer_id,
            invitee_id = req.invitee_id,
            points,
            trigger = %req.trigger_source,
            "Referral credited"
        );
        Ok(CreditOutcome {
            payload_valid: true,
            already_counted: true,
            newly_counted: true,
            referrer_points: points,
            anomaly: false,
        })
    }
}
