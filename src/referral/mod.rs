//! Referral program: invitation links and the crediting ledger.

pub mod ledger;

pub use ledger::{CreditOutcome, CreditRequest, ReferralLedger};

/// Longest referral link the profile column accepts.
pub const MAX_REFERRAL_LINK_LEN: usize = 512;

/// Deterministic key of the one crediting event for a referrer/invitee pair.
pub fn idempotency_key(referrer_id: i64, invitee_id: i64) -> String {
    format!("ref:{referrer_id}:{invitee_id}")
}

/// Personal invitation link: opening it sends `/start <referrer_id>`.
pub fn referral_link(bot_username: &str, referrer_id: i64) -> String {
    format!(
        "https://t.me/{}?start={referrer_id}",
        bot_username.trim_start_matches('@')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_link_format() {
        assert_eq!(idempotency_key(100, 200), "ref:100:200");
        assert_eq!(referral_link("@tajwid_bot", 7), "https://t.me/tajwid_bot?start=7");
        assert!(referral_link("tajwid_bot", i64::MAX).len() <= MAX_REFERRAL_LINK_LEN);
    }
}
