//! Flow engine: applies inbound events to a user's conversation context.
//!
//! Every entry point takes the per-user lock, loads the context, mutates it,
//! persists it and only then hands the produced messages back for delivery.
//! Referral crediting additionally serializes on the referrer's profile lock
//! inside the ledger.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::error::{DatabaseError, Result};
use crate::flow::input::{self, CallbackAction, Contact, InboundEvent, Input};
use crate::flow::messages::{self as msg, Button, OutboundMessage, Outbox};
use crate::flow::route::{Route, route};
use crate::flow::state::{FlowState, Track};
use crate::model::{ConversationContext, ReadingLevel, ReferralStatus, UserProfile};
use crate::referral::{self, CreditRequest, MAX_REFERRAL_LINK_LEN, ReferralLedger};
use crate::store::{Database, KeyedMutex};
use crate::subscription::{ChannelKind, MembershipStatus, SubscriptionOracle, check_with_timeout};

const REFERRAL_SOURCE_LINK: &str = "referral_link";

/// What caused a course-subscription confirmation. Recorded as the trigger
/// source of ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmTrigger {
    /// The user pressed the course "I've subscribed" button.
    CourseCheckCallback(Track),
    /// The transport reported the user joining the course channel.
    MembershipUpdate,
    /// Checked right after registration (zero delay or already confirmed).
    Registration,
    /// The scheduler picked up an elapsed deferred epilogue.
    ScheduledEpilogue,
    /// The scheduler re-checked a pending referral.
    PeriodicRecheck,
}

impl ConfirmTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CourseCheckCallback(Track::Normal) => "flow_normal_course_recheck",
            Self::CourseCheckCallback(Track::Referral) => "flow_referral_course_click",
            Self::MembershipUpdate => "course_channel_membership_update",
            Self::Registration => "course_check_on_registration",
            Self::ScheduledEpilogue => "course_check_scheduled",
            Self::PeriodicRecheck => "course_channel_periodic_recheck",
        }
    }

    /// Background confirmations leave a running epilogue delay alone.
    fn overrides_delay(&self) -> bool {
        !matches!(self, Self::MembershipUpdate | Self::PeriodicRecheck)
    }
}

/// Why a referral entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryRejection {
    InvalidLink,
    SelfReferral,
    UnknownReferrer,
    AlreadyReferred,
}

impl EntryRejection {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidLink => "invalid_link",
            Self::SelfReferral => "self_referral",
            Self::UnknownReferrer => "unknown_referrer",
            Self::AlreadyReferred => "already_referred",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::InvalidLink => msg::REJECT_INVALID_LINK,
            Self::SelfReferral => msg::REJECT_SELF_REFERRAL,
            Self::UnknownReferrer => msg::REJECT_UNKNOWN_REFERRER,
            Self::AlreadyReferred => msg::REJECT_REPLAY,
        }
    }
}

/// Outcome of validating a referral entry.
enum EntryCheck {
    Accepted(i64),
    Rejected(EntryRejection),
}

pub struct FlowEngine {
    db: Arc<dyn Database>,
    oracle: Arc<dyn SubscriptionOracle>,
    ledger: ReferralLedger,
    config: BotConfig,
    user_locks: KeyedMutex,
}

impl FlowEngine {
    pub fn new(
        db: Arc<dyn Database>,
        oracle: Arc<dyn SubscriptionOracle>,
        config: BotConfig,
    ) -> Self {
        Self {
            ledger: ReferralLedger::new(Arc::clone(&db)),
            db,
            oracle,
            config,
            user_locks: KeyedMutex::new(),
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Apply one inbound event and return the messages to deliver.
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<Vec<OutboundMessage>> {
        if event.user_id <= 0 {
            warn!(user_id = event.user_id, "Ignoring event without a valid sender");
            return Ok(Vec::new());
        }

        let _guard = self.user_locks.lock(event.user_id).await;
        let mut ctx = self
            .db
            .get_context(event.user_id)
            .await?
            .unwrap_or_else(|| ConversationContext::new(event.user_id));
        ctx.remember_sender(&event.display_name, event.username.as_deref());

        let input = Input::classify(event);
        debug!(
            user_id = ctx.user_id,
            state = %ctx.state,
            track = %ctx.track,
            input = input.kind(),
            "Handling event"
        );

        let mut out = Outbox::new();
        match &input {
            Input::Start { payload } => {
                match payload.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                    Some(payload) => self.start_referral(&mut ctx, payload, &mut out).await?,
                    None => self.start_organic(&mut ctx, &mut out).await,
                }
            }
            Input::Empty => out.push(ctx.user_id, msg::START_HINT),
            other => {
                let next = route(ctx.state, ctx.track, other);
                self.dispatch(&mut ctx, next, &mut out).await?;
            }
        }

        ctx.updated_at = Utc::now();
        self.db.upsert_context(&ctx).await?;
        Ok(out.into_messages())
    }

    /// The transport reported `user_id` joining the course channel.
    ///
    /// The notification itself is proof of membership, so no oracle check is
    /// made.
    pub async fn handle_course_membership(&self, user_id: i64) -> Result<Vec<OutboundMessage>> {
        let _guard = self.user_locks.lock(user_id).await;
        let mut ctx = self.db.get_context(user_id).await?;
        let mut out = Outbox::new();

        self.confirm_course_subscription(
            user_id,
            ctx.as_mut(),
            ConfirmTrigger::MembershipUpdate,
            &mut out,
        )
        .await?;

        if let Some(ctx) = ctx.as_mut() {
            ctx.updated_at = Utc::now();
            self.db.upsert_context(ctx).await?;
        }
        Ok(out.into_messages())
    }

    /// Deliver an elapsed deferred epilogue if the course subscription is
    /// confirmed, otherwise push it back by the fallback interval.
    pub async fn resume_due_epilogue(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboundMessage>> {
        let _guard = self.user_locks.lock(user_id).await;
        let Some(mut ctx) = self.db.get_context(user_id).await? else {
            return Ok(Vec::new());
        };
        let mut out = Outbox::new();

        if !ctx.state.awaits_course_confirmation() || ctx.epilogue_sent {
            debug!(user_id, state = %ctx.state, "Deferred epilogue is stale, clearing it");
            ctx.epilogue_due_at = None;
        } else if ctx.epilogue_due_at.is_some_and(|due| due > now) {
            return Ok(Vec::new());
        } else {
            let already_confirmed = self
                .db
                .get_profile(user_id)
                .await?
                .is_some_and(|p| p.course_channel_subscribed);
            let subscribed = already_confirmed
                || self.check(ChannelKind::Course, user_id).await == MembershipStatus::Subscribed;
            if subscribed {
                self.confirm_course_subscription(
                    user_id,
                    Some(&mut ctx),
                    ConfirmTrigger::ScheduledEpilogue,
                    &mut out,
                )
                .await?;
            }
            if !ctx.epilogue_sent {
                let retry = self.config.fallback_retry_interval();
                ctx.epilogue_due_at = Some(after(now, retry));
                debug!(user_id, ?retry, "Course subscription not confirmed, epilogue rescheduled");
            }
        }

        ctx.updated_at = Utc::now();
        self.db.upsert_context(&ctx).await?;
        Ok(out.into_messages())
    }

    /// Re-check a PENDING invitee and credit their referrer once the course
    /// subscription is confirmed.
    pub async fn recheck_pending_referral(&self, user_id: i64) -> Result<Vec<OutboundMessage>> {
        let _guard = self.user_locks.lock(user_id).await;
        let Some(profile) = self.db.get_profile(user_id).await? else {
            return Ok(Vec::new());
        };
        if profile.referral_status != ReferralStatus::Pending
            || profile.referrer_id <= 0
            || !profile.registration_completed
        {
            return Ok(Vec::new());
        }
        if !profile.course_channel_subscribed
            && self.check(ChannelKind::Course, user_id).await != MembershipStatus::Subscribed
        {
            return Ok(Vec::new());
        }

        let mut ctx = self.db.get_context(user_id).await?;
        let mut out = Outbox::new();
        self.confirm_course_subscription(
            user_id,
            ctx.as_mut(),
            ConfirmTrigger::PeriodicRecheck,
            &mut out,
        )
        .await?;
        if let Some(ctx) = ctx.as_mut() {
            ctx.updated_at = Utc::now();
            self.db.upsert_context(ctx).await?;
        }
        Ok(out.into_messages())
    }

    // ── Entry ───────────────────────────────────────────────────────

    async fn start_organic(&self, ctx: &mut ConversationContext, out: &mut Outbox) {
        ctx.reset(Track::Normal);
        let uid = ctx.user_id;

        match self.check(ChannelKind::School, uid).await {
            MembershipStatus::Subscribed => {
                ctx.school_channel_subscribed = true;
                ctx.transition(FlowState::AwaitConsent);
                out.push_with(uid, msg::intro_subscribed(), continue_button(Track::Normal));
            }
            MembershipStatus::NotSubscribed => {
                ctx.transition(FlowState::AwaitSchoolRecheck);
                out.push_with(
                    uid,
                    msg::intro_school_gate(),
                    self.school_gate_buttons(Track::Normal, msg::BTN_SUBSCRIBED),
                );
            }
            MembershipStatus::Error => {
                debug!(user_id = uid, "School check failed on entry, offering a recheck");
                ctx.transition(FlowState::AwaitSchoolRecheck);
                out.push_with(
                    uid,
                    msg::intro_check_failed(),
                    self.school_gate_buttons(Track::Normal, msg::BTN_SUBSCRIBED),
                );
            }
        }
    }

    async fn start_referral(
        &self,
        ctx: &mut ConversationContext,
        payload: &str,
        out: &mut Outbox,
    ) -> Result<()> {
        let uid = ctx.user_id;
        let referrer_id = match self.validate_referral_entry(uid, payload).await? {
            EntryCheck::Accepted(referrer_id) => referrer_id,
            EntryCheck::Rejected(rejection) => {
                info!(
                    user_id = uid,
                    payload,
                    reason = rejection.as_str(),
                    "Referral entry rejected"
                );
                ctx.reset(Track::Normal);
                out.push(uid, rejection.message());
                return Ok(());
            }
        };

        ctx.reset(Track::Referral);
        ctx.referrer_id = referrer_id;
        ctx.referral_source = Some(REFERRAL_SOURCE_LINK.to_string());
        ctx.referral_entered_at = Some(Utc::now());
        ctx.transition(FlowState::AwaitSchoolRecheck);
        info!(user_id = uid, referrer_id, "Referral entry accepted");

        out.push_with(
            uid,
            msg::intro_invited(),
            self.school_gate_buttons(Track::Referral, msg::BTN_SUBSCRIBED),
        );
        Ok(())
    }

    async fn validate_referral_entry(
        &self,
        invitee_id: i64,
        payload: &str,
    ) -> std::result::Result<EntryCheck, DatabaseError> {
        let Some(referrer_id) = input::parse_referrer_id(payload) else {
            return Ok(EntryCheck::Rejected(EntryRejection::InvalidLink));
        };
        if referrer_id == invitee_id {
            return Ok(EntryCheck::Rejected(EntryRejection::SelfReferral));
        }
        if self.db.get_profile(referrer_id).await?.is_none() {
            return Ok(EntryCheck::Rejected(EntryRejection::UnknownReferrer));
        }
        let already_referred = self
            .db
            .get_profile(invitee_id)
            .await?
            .is_some_and(|p| p.referral_status.is_referred());
        if already_referred || self.db.usage_exists_for_invitee(invitee_id).await? {
            return Ok(EntryCheck::Rejected(EntryRejection::AlreadyReferred));
        }
        Ok(EntryCheck::Accepted(referrer_id))
    }

    // ── Registration steps ──────────────────────────────────────────

    async fn dispatch(
        &self,
        ctx: &mut ConversationContext,
        next: Route,
        out: &mut Outbox,
    ) -> Result<()> {
        let uid = ctx.user_id;
        let track = ctx.track;

        match next {
            Route::SchoolRecheck => self.school_recheck(ctx, out).await,
            Route::Consent => {
                ctx.consent_given = true;
                ctx.transition(FlowState::AwaitName);
                out.push(uid, msg::ASK_NAME);
            }
            Route::Name(raw) => match input::parse_name(&raw) {
                Some(name) => {
                    ctx.full_name = Some(name);
                    ctx.transition(FlowState::AwaitAge);
                    out.push(uid, msg::ASK_AGE);
                }
                None => out.push(uid, msg::INVALID_NAME),
            },
            Route::Age(raw) => match input::parse_age(&raw) {
                Some(age) => {
                    ctx.age = Some(age);
                    ctx.transition(FlowState::AwaitHasChildren);
                    let name = ctx.full_name.as_deref().unwrap_or(ctx.display_name.as_str());
                    out.push(uid, msg::nice_to_meet(name));
                    out.push_with(
                        uid,
                        msg::ASK_HAS_CHILDREN,
                        yes_no_buttons(track, CallbackAction::HasChildren),
                    );
                }
                None => out.push(uid, msg::INVALID_AGE),
            },
            Route::HasChildren(Some(true)) => {
                ctx.has_children = Some(true);
                ctx.transition(FlowState::AwaitChildrenStudy);
                out.push_with(
                    uid,
                    msg::ASK_CHILDREN_STUDY,
                    yes_no_buttons(track, CallbackAction::ChildrenStudy),
                );
            }
            Route::HasChildren(Some(false)) => {
                ctx.has_children = Some(false);
                ctx.children_study_quran = None;
                ctx.transition(FlowState::AwaitPhone);
                out.push_with(uid, msg::ASK_PHONE, vec![phone_button()]);
            }
            Route::HasChildren(None) => out.push_with(
                uid,
                msg::PICK_OPTION,
                yes_no_buttons(track, CallbackAction::HasChildren),
            ),
            Route::ChildrenStudy(Some(study)) => {
                ctx.children_study_quran = Some(study);
                ctx.transition(FlowState::AwaitPhone);
                out.push_with(uid, msg::ASK_PHONE, vec![phone_button()]);
            }
            Route::ChildrenStudy(None) => out.push_with(
                uid,
                msg::PICK_OPTION,
                yes_no_buttons(track, CallbackAction::ChildrenStudy),
            ),
            Route::Phone(contact) => accept_phone(ctx, &contact, out),
            Route::PhoneViaButton => out.push_with(uid, msg::PHONE_VIA_BUTTON, vec![phone_button()]),
            Route::ContactNotRequested => out.push(uid, msg::CONTACT_NOT_REQUESTED),
            Route::ReadingLevel(Some(level)) => self.complete_registration(ctx, level, out).await?,
            Route::ReadingLevel(None) => {
                out.push_with(uid, msg::PICK_READING_LEVEL, level_buttons(track))
            }
            Route::CourseCheck => self.course_check(ctx, out).await?,
            Route::Terms => {
                ctx.transition(FlowState::AwaitLinkRequest);
                out.push_with(uid, msg::TERMS, vec![show_link_button(msg::BTN_SHOW_LINK)]);
            }
            Route::ShowLink => self.show_link(ctx, out).await?,
            Route::EpiloguePending => out.push(uid, msg::EPILOGUE_PENDING),
            Route::Stale => {
                debug!(user_id = uid, state = %ctx.state, "Stale button pressed");
                out.push(uid, msg::STALE_BUTTON);
            }
            Route::Nudge => out.push(uid, msg::NUDGE),
        }
        Ok(())
    }

    async fn school_recheck(&self, ctx: &mut ConversationContext, out: &mut Outbox) {
        let uid = ctx.user_id;
        let track = ctx.track;
        ctx.add_pending_tag(msg::TAG_CLICKED_SUBSCRIBED);

        match self.check(ChannelKind::School, uid).await {
            MembershipStatus::Subscribed => {
                ctx.school_channel_subscribed = true;
                ctx.add_pending_tag(msg::TAG_SUBSCRIBED_VIA_BOT);
                ctx.transition(FlowState::AwaitConsent);
                out.push_with(uid, msg::CONSENT_NOTICE, continue_button(track));
            }
            MembershipStatus::NotSubscribed => out.push_with(
                uid,
                msg::SCHOOL_NOT_SUBSCRIBED,
                self.school_gate_buttons(track, msg::BTN_CHECK_AGAIN),
            ),
            MembershipStatus::Error => out.push_with(
                uid,
                msg::SUBSCRIPTION_CHECK_FAILED,
                vec![Button::callback(
                    msg::BTN_CHECK_AGAIN,
                    CallbackAction::SchoolRecheck.token(track),
                )],
            ),
        }
    }

    async fn complete_registration(
        &self,
        ctx: &mut ConversationContext,
        level: ReadingLevel,
        out: &mut Outbox,
    ) -> Result<()> {
        let uid = ctx.user_id;
        ctx.reading_level = Some(level);
        ctx.add_pending_tag(level.label());

        let profile = self.save_profile(ctx).await?;
        for tag in std::mem::take(&mut ctx.pending_tags) {
            self.db.insert_tag(uid, &tag).await?;
        }
        info!(
            user_id = uid,
            track = %ctx.track,
            referrer_id = profile.referrer_id,
            "Registration completed"
        );

        self.notify_registration(&profile, out).await;
        out.push_with(uid, msg::REGISTERED, self.course_gate_buttons(ctx.track));

        match ctx.track {
            Track::Normal => self.schedule_epilogue(ctx, &profile, out).await?,
            Track::Referral => ctx.transition(FlowState::AwaitCourseConfirm),
        }
        Ok(())
    }

    /// Persist the answers collected in `ctx` as the user's profile.
    async fn save_profile(&self, ctx: &ConversationContext) -> Result<UserProfile> {
        let now = Utc::now();
        let mut profile = self
            .db
            .get_profile(ctx.user_id)
            .await?
            .unwrap_or_else(|| UserProfile::new(ctx.user_id, ctx.display_name.clone()));

        if !ctx.display_name.is_empty() {
            profile.display_name = ctx.display_name.clone();
        }
        if ctx.username.is_some() {
            profile.username = ctx.username.clone();
        }
        profile.full_name = ctx.full_name.clone();
        profile.age = ctx.age;
        profile.phone = ctx.phone.clone();
        profile.has_children = ctx.has_children;
        profile.children_study_quran = ctx.children_study_quran;
        profile.reading_level = ctx.reading_level;
        profile.consent_given = true;
        profile.school_channel_subscribed = ctx.school_channel_subscribed;
        profile.registration_completed = true;
        profile.registered_at = profile.registered_at.or(Some(now));
        profile.updated_at = now;

        if ctx.track == Track::Referral && ctx.referrer_id > 0 {
            profile.referrer_id = ctx.referrer_id;
            profile.referral_status = ReferralStatus::Pending;
        } else if !profile.referral_status.is_referred() {
            profile.referrer_id = 0;
            profile.referral_status = ReferralStatus::NotApplicable;
        }

        self.db.upsert_profile(&profile).await?;
        Ok(profile)
    }

    async fn notify_registration(&self, profile: &UserProfile, out: &mut Outbox) {
        if !self.config.notifications.enabled {
            return;
        }

        let recipients = self.notification_recipients().await;
        if recipients.is_empty() {
            debug!(user_id = profile.user_id, "No registration notification recipients");
            return;
        }

        let text = msg::registration_notice(profile, &self.inviter_label(profile).await);
        for recipient in recipients {
            out.push(recipient, text.clone());
        }
    }

    /// Configured ids plus active stored admins plus every configured or
    /// stored username that resolves to a known user. The fallback username
    /// is used only when no username is named anywhere. Stored admins found
    /// by username get their id saved for next time.
    async fn notification_recipients(&self) -> BTreeSet<i64> {
        let cfg = &self.config.notifications;
        let mut recipients: BTreeSet<i64> =
            cfg.recipient_ids.iter().copied().filter(|id| *id > 0).collect();

        let admins = self
            .db
            .list_active_notification_admins()
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to load notification admins: {}", e);
                Vec::new()
            });

        let mut usernames: BTreeSet<String> = cfg
            .recipient_usernames
            .iter()
            .map(|u| u.to_lowercase())
            .collect();
        for admin in &admins {
            recipients.extend(admin.user_id);
            usernames.insert(admin.username.clone());
        }
        if usernames.is_empty() {
            usernames.extend(cfg.fallback_username.iter().map(|u| u.to_lowercase()));
        }

        if !usernames.is_empty() {
            let usernames: Vec<String> = usernames.into_iter().collect();
            match self.db.find_user_ids_by_usernames(&usernames).await {
                Ok(ids) => recipients.extend(ids),
                Err(e) => warn!("Failed to resolve notification recipients: {}", e),
            }
        }

        for admin in admins.iter().filter(|a| a.user_id.is_none()) {
            self.bind_admin(admin.id, &admin.username).await;
        }
        recipients
    }

    async fn bind_admin(&self, admin_id: i64, username: &str) {
        let ids = match self
            .db
            .find_user_ids_by_usernames(&[username.to_string()])
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(username, "Failed to resolve notification admin: {}", e);
                return;
            }
        };
        // Ambiguous usernames stay unbound.
        let [user_id] = ids.as_slice() else {
            return;
        };
        match self.db.bind_notification_admin(admin_id, *user_id).await {
            Ok(()) => info!(username, user_id, "Notification admin bound"),
            Err(e) => warn!(username, "Failed to bind notification admin: {}", e),
        }
    }

    async fn inviter_label(&self, profile: &UserProfile) -> String {
        if profile.referrer_id <= 0 {
            return "nobody".to_string();
        }
        match self.db.get_profile(profile.referrer_id).await {
            Ok(Some(referrer)) => match referrer.username {
                Some(username) => format!("@{username} (id {})", referrer.user_id),
                None => format!("{} (id {})", referrer.display_name, referrer.user_id),
            },
            _ => format!("id {}", profile.referrer_id),
        }
    }

    // ── Course gate and epilogue ────────────────────────────────────

    async fn schedule_epilogue(
        &self,
        ctx: &mut ConversationContext,
        profile: &UserProfile,
        out: &mut Outbox,
    ) -> Result<()> {
        let uid = ctx.user_id;
        let now = Utc::now();
        ctx.transition(FlowState::AwaitEpilogue);
        ctx.epilogue_sent = false;
        ctx.epilogue_due_at = None;

        let delay = self.config.epilogue_delay;
        let confirmed_now = profile.course_channel_subscribed
            || (delay.is_zero()
                && self.check(ChannelKind::Course, uid).await == MembershipStatus::Subscribed);
        if confirmed_now {
            self.confirm_course_subscription(uid, Some(&mut *ctx), ConfirmTrigger::Registration, out)
                .await?;
            if ctx.epilogue_sent {
                return Ok(());
            }
        }

        let wait = if delay.is_zero() {
            self.config.fallback_retry_interval()
        } else {
            delay
        };
        ctx.epilogue_due_at = Some(after(now, wait));
        debug!(user_id = uid, ?wait, "Epilogue deferred");
        out.push(uid, msg::EPILOGUE_PENDING);
        Ok(())
    }

    async fn course_check(&self, ctx: &mut ConversationContext, out: &mut Outbox) -> Result<()> {
        let uid = ctx.user_id;
        let track = ctx.track;
        let already_confirmed = self
            .db
            .get_profile(uid)
            .await?
            .is_some_and(|p| p.course_channel_subscribed);
        let status = if already_confirmed {
            MembershipStatus::Subscribed
        } else {
            self.check(ChannelKind::Course, uid).await
        };

        match status {
            MembershipStatus::Subscribed => {
                self.confirm_course_subscription(
                    uid,
                    Some(&mut *ctx),
                    ConfirmTrigger::CourseCheckCallback(track),
                    out,
                )
                .await?;
            }
            MembershipStatus::NotSubscribed => {
                out.push_with(uid, msg::COURSE_NOT_SUBSCRIBED, self.course_gate_buttons(track))
            }
            MembershipStatus::Error => out.push_with(
                uid,
                msg::SUBSCRIPTION_CHECK_FAILED,
                vec![Button::callback(
                    msg::BTN_CHECK_SUBSCRIPTION,
                    CallbackAction::CourseCheck.token(track),
                )],
            ),
        }
        Ok(())
    }

    /// Record a confirmed course subscription: set the flag, tag the user,
    /// credit a pending referrer and release the epilogue if the context is
    /// waiting for it.
    ///
    /// Returns `false` when there is no registered profile to confirm.
    async fn confirm_course_subscription(
        &self,
        user_id: i64,
        ctx: Option<&mut ConversationContext>,
        trigger: ConfirmTrigger,
        out: &mut Outbox,
    ) -> std::result::Result<bool, DatabaseError> {
        let Some(profile) = self
            .db
            .get_profile(user_id)
            .await?
            .filter(|p| p.registration_completed)
        else {
            debug!(user_id, trigger = trigger.as_str(), "No registered profile to confirm");
            return Ok(false);
        };

        if self.db.set_course_subscribed(user_id).await? {
            info!(user_id, trigger = trigger.as_str(), "Course channel subscription confirmed");
        }
        self.db.insert_tag(user_id, msg::TAG_COURSE_CONFIRMED).await?;

        if profile.referral_status == ReferralStatus::Pending && profile.referrer_id > 0 {
            self.credit_referrer(&profile, trigger, out).await;
        }

        if let Some(ctx) = ctx {
            let due_elapsed = ctx.epilogue_due_at.is_none_or(|due| due <= Utc::now());
            if ctx.state.awaits_course_confirmation()
                && !ctx.epilogue_sent
                && (trigger.overrides_delay() || due_elapsed)
            {
                emit_epilogue(ctx, out);
            }
        }
        Ok(true)
    }

    async fn credit_referrer(&self, invitee: &UserProfile, trigger: ConfirmTrigger, out: &mut Outbox) {
        let link = referral::referral_link(&self.config.bot_username, invitee.referrer_id);
        let req = CreditRequest::new(invitee.referrer_id, invitee.user_id, trigger.as_str(), link);

        match self.ledger.credit(&req).await {
            Ok(outcome) if outcome.newly_counted => out.push(
                invitee.referrer_id,
                msg::referral_credited(outcome.referrer_points),
            ),
            Ok(outcome) if !outcome.already_counted => warn!(
                referrer_id = invitee.referrer_id,
                invitee_id = invitee.user_id,
                payload_valid = outcome.payload_valid,
                anomaly = outcome.anomaly,
                "Referral was not counted"
            ),
            Ok(_) => debug!(
                referrer_id = invitee.referrer_id,
                invitee_id = invitee.user_id,
                "Referral already counted"
            ),
            Err(e) => warn!(
                referrer_id = invitee.referrer_id,
                invitee_id = invitee.user_id,
                "Referral crediting failed: {}",
                e
            ),
        }
    }

    async fn show_link(&self, ctx: &mut ConversationContext, out: &mut Outbox) -> Result<()> {
        let uid = ctx.user_id;
        let registered = self
            .db
            .get_profile(uid)
            .await?
            .is_some_and(|p| p.registration_completed);
        if !registered {
            out.push(uid, msg::FINISH_REGISTRATION_FIRST);
            return Ok(());
        }

        match self.issue_link(uid).await {
            Ok(link) => {
                ctx.transition(FlowState::LinkIssued);
                out.push(uid, link);
                out.push(uid, msg::LINK_CLOSING);
            }
            Err(e) => {
                warn!(user_id = uid, "Failed to issue referral link: {}", e);
                out.push_with(uid, msg::LINK_FAILED, vec![show_link_button(msg::BTN_TRY_AGAIN)]);
            }
        }
        Ok(())
    }

    async fn issue_link(&self, user_id: i64) -> std::result::Result<String, DatabaseError> {
        let link = referral::referral_link(&self.config.bot_username, user_id);
        if link.chars().count() > MAX_REFERRAL_LINK_LEN {
            return Err(DatabaseError::Constraint(format!(
                "referral link is {} characters long",
                link.chars().count()
            )));
        }
        self.db.set_referral_link(user_id, &link).await?;
        self.db.insert_tag(user_id, msg::TAG_REFERRER_GOT_LINK).await?;
        Ok(link)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn check(&self, channel: ChannelKind, user_id: i64) -> MembershipStatus {
        let status =
            check_with_timeout(self.oracle.as_ref(), channel, user_id, self.config.oracle_timeout)
                .await;
        debug!(user_id, %channel, ?status, "Membership checked");
        status
    }

    fn school_gate_buttons(&self, track: Track, recheck_label: &str) -> Vec<Button> {
        vec![
            Button::url(msg::BTN_SCHOOL_CHANNEL, &self.config.school_channel_url),
            Button::callback(recheck_label, CallbackAction::SchoolRecheck.token(track)),
        ]
    }

    fn course_gate_buttons(&self, track: Track) -> Vec<Button> {
        vec![
            Button::url(msg::BTN_COURSE_CHANNEL, &self.config.course_channel_url),
            Button::callback(msg::BTN_SUBSCRIBED, CallbackAction::CourseCheck.token(track)),
        ]
    }
}

fn accept_phone(ctx: &mut ConversationContext, contact: &Contact, out: &mut Outbox) {
    let uid = ctx.user_id;
    if contact.owner_id != uid {
        out.push_with(uid, msg::NOT_OWN_PHONE, vec![phone_button()]);
        return;
    }
    ctx.phone = Some(input::normalize_phone(&contact.phone_number));
    ctx.transition(FlowState::AwaitReadingLevel);
    out.push_with(uid, msg::ASK_READING_LEVEL, level_buttons(ctx.track));
}

fn emit_epilogue(ctx: &mut ConversationContext, out: &mut Outbox) {
    ctx.epilogue_due_at = None;
    ctx.epilogue_sent = true;
    ctx.transition(FlowState::AwaitTerms);
    out.push_with(
        ctx.user_id,
        msg::EPILOGUE,
        vec![Button::callback(msg::BTN_TERMS, CallbackAction::Terms.token(ctx.track))],
    );
    info!(user_id = ctx.user_id, track = %ctx.track, "Referral epilogue sent");
}

/// Longest wait a due time is scheduled out; stays within the range the
/// store's timestamp text can hold.
const MAX_WAIT: TimeDelta = TimeDelta::days(100 * 365);

/// `now + wait`, with `wait` clamped to [`MAX_WAIT`].
fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(wait).map_or(MAX_WAIT, |d| d.min(MAX_WAIT));
    now.checked_add_signed(delta).unwrap_or(now)
}

fn continue_button(track: Track) -> Vec<Button> {
    vec![Button::callback(
        msg::BTN_CONTINUE,
        CallbackAction::ConsentContinue.token(track),
    )]
}

fn yes_no_buttons(track: Track, action: fn(bool) -> CallbackAction) -> Vec<Button> {
    vec![
        Button::callback(msg::BTN_YES, action(true).token(track)),
        Button::callback(msg::BTN_NO, action(false).token(track)),
    ]
}

fn level_buttons(track: Track) -> Vec<Button> {
    ReadingLevel::ALL
        .into_iter()
        .map(|level| Button::callback(level.label(), CallbackAction::ReadingLevel(level).token(track)))
        .collect()
}

fn phone_button() -> Button {
    Button::request_contact(msg::BTN_SEND_PHONE)
}

fn show_link_button(label: &str) -> Button {
    Button::callback(label, CallbackAction::ShowLink.token(Track::Normal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::subscription::StaticOracle;

    async fn engine(oracle: Arc<StaticOracle>) -> (Arc<dyn Database>, FlowEngine) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = FlowEngine::new(Arc::clone(&db), oracle, BotConfig::default());
        (db, engine)
    }

    fn text(user_id: i64, text: &str) -> InboundEvent {
        InboundEvent {
            user_id,
            display_name: "Ali".into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[test]
    fn trigger_labels_and_delay_rules() {
        assert_eq!(
            ConfirmTrigger::CourseCheckCallback(Track::Normal).as_str(),
            "flow_normal_course_recheck"
        );
        assert_eq!(
            ConfirmTrigger::CourseCheckCallback(Track::Referral).as_str(),
            "flow_referral_course_click"
        );
        assert!(ConfirmTrigger::CourseCheckCallback(Track::Normal).overrides_delay());
        assert!(ConfirmTrigger::ScheduledEpilogue.overrides_delay());
        assert!(!ConfirmTrigger::MembershipUpdate.overrides_delay());
        assert!(!ConfirmTrigger::PeriodicRecheck.overrides_delay());
    }

    #[test]
    fn show_link_token_is_shared_by_tracks() {
        let button = show_link_button(msg::BTN_SHOW_LINK);
        assert_eq!(
            button.kind,
            msg::ButtonKind::Callback {
                token: "epilogue:show_link".into()
            }
        );
    }

    #[test]
    fn huge_delays_are_clamped_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(30)), now + TimeDelta::seconds(30));
        assert_eq!(
            after(now, Duration::from_secs(10_000_000_000_000)),
            now + MAX_WAIT
        );
        assert_eq!(after(now, Duration::MAX), now + MAX_WAIT);
    }

    #[tokio::test]
    async fn invalid_sender_is_ignored() {
        let oracle = Arc::new(StaticOracle::new(MembershipStatus::Subscribed));
        let (db, engine) = engine(oracle).await;
        let out = engine.handle_event(&text(0, "/start")).await.unwrap();
        assert!(out.is_empty());
        assert!(db.get_context(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_event_only_nudges() {
        let oracle = Arc::new(StaticOracle::new(MembershipStatus::Subscribed));
        let (db, engine) = engine(Arc::clone(&oracle)).await;
        let out = engine
            .handle_event(&InboundEvent {
                user_id: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, msg::START_HINT);
        assert_eq!(oracle.calls(), 0);
        let ctx = db.get_context(5).await.unwrap().unwrap();
        assert_eq!(ctx.state, FlowState::Idle);
    }

    #[tokio::test]
    async fn invalid_answers_keep_the_step() {
        let oracle = Arc::new(StaticOracle::new(MembershipStatus::Subscribed));
        let (db, engine) = engine(oracle).await;
        engine.handle_event(&text(5, "/start")).await.unwrap();
        engine
            .handle_event(&InboundEvent {
                user_id: 5,
                callback: Some("normal:consent".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let out = engine.handle_event(&text(5, "4li")).await.unwrap();
        assert_eq!(out[0].text, msg::INVALID_NAME);
        engine.handle_event(&text(5, "Ali")).await.unwrap();
        let out = engine.handle_event(&text(5, "150")).await.unwrap();
        assert_eq!(out[0].text, msg::INVALID_AGE);

        let ctx = db.get_context(5).await.unwrap().unwrap();
        assert_eq!(ctx.state, FlowState::AwaitAge);
        assert_eq!(ctx.full_name.as_deref(), Some("Ali"));
        assert!(ctx.age.is_none());
    }

    #[tokio::test]
    async fn foreign_contact_is_refused() {
        let oracle = Arc::new(StaticOracle::new(MembershipStatus::Subscribed));
        let (db, engine) = engine(oracle).await;
        let mut ctx = ConversationContext::new(5);
        ctx.state = FlowState::AwaitPhone;
        db.upsert_context(&ctx).await.unwrap();

        let out = engine
            .handle_event(&InboundEvent {
                user_id: 5,
                contact: Some(Contact {
                    owner_id: 6,
                    phone_number: "+7900".into(),
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out[0].text, msg::NOT_OWN_PHONE);
        assert_eq!(out[0].buttons[0].kind, msg::ButtonKind::RequestContact);
        let ctx = db.get_context(5).await.unwrap().unwrap();
        assert_eq!(ctx.state, FlowState::AwaitPhone);
        assert!(ctx.phone.is_none());
    }
}
