//! Per-user message quotas: eligibility checks, usage increments and display snapshots.
//!
//! Daily counters reset lazily. A check treats `today_messages` as zero once `now` has passed
//! `daily_reset_at`; the stored document is only rewritten by `increment`.

use crate::config::{QuotaSettings, TierRule};
use crate::error::AppError;
use crate::models::{
    DenialReason, EligibilityDecision, QuotaSnapshot, Tier, UsageRecord, UserAccount,
};
use crate::storage::DocumentStore;
use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// First midnight strictly after `now` in the given offset.
pub fn next_local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    now.with_timezone(&offset)
        .date_naive()
        .succ_opt()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| now + Duration::days(1))
}

fn host_offset() -> FixedOffset {
    *Local::now().offset()
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub struct QuotaLedger {
    store: Arc<dyn DocumentStore>,
    rules: QuotaSettings,
    offset: FixedOffset,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn DocumentStore>, rules: QuotaSettings) -> Self {
        let offset = rules
            .timezone_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
            .unwrap_or_else(host_offset);
        Self {
            store,
            rules,
            offset,
        }
    }

    fn zeroed(&self, now: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            total_messages: 0,
            today_messages: 0,
            last_message_at: None,
            daily_reset_at: next_local_midnight(now, self.offset),
            updated_at: now,
        }
    }

    /// Store failures degrade to a zeroed record so a broken store never blocks a user.
    async fn load_for_check(
        &self,
        uid: &str,
        now: DateTime<Utc>,
    ) -> (UsageRecord, Option<UserAccount>) {
        let usage = match self.store.get_usage(uid).await {
            Ok(Some(record)) => record,
            Ok(None) => self.zeroed(now),
            Err(err) => {
                warn!(uid, error = %err, "usage lookup failed, using zeroed record");
                self.zeroed(now)
            }
        };
        let account = match self.store.get_account(uid).await {
            Ok(account) => account,
            Err(err) => {
                warn!(uid, error = %err, "account lookup failed, treating as new user");
                None
            }
        };
        (usage, account)
    }

    fn effective_today(record: &UsageRecord, now: DateTime<Utc>) -> u64 {
        if now >= record.daily_reset_at {
            0
        } else {
            record.today_messages
        }
    }

    pub async fn check(&self, uid: &str, tier: Tier, now: DateTime<Utc>) -> EligibilityDecision {
        let (usage, account) = self.load_for_check(uid, now).await;
        let decision = evaluate(
            self.rules.rule_for(tier),
            tier,
            &usage,
            account.as_ref(),
            now,
        );
        debug!(uid, tier = tier.as_label(), allowed = decision.allowed, reason = ?decision.reason, "quota check");
        decision
    }

    /// Records one delivered message. Creates the account on first use without touching an
    /// existing one.
    pub async fn increment(&self, uid: &str, now: DateTime<Utc>) -> Result<UsageRecord, AppError> {
        self.store
            .create_account_if_absent(
                uid,
                &UserAccount {
                    created_at: now,
                    tier: Tier::Free,
                },
            )
            .await?;

        let next = match self.store.get_usage(uid).await? {
            Some(stored) if now < stored.daily_reset_at => UsageRecord {
                total_messages: stored.total_messages + 1,
                today_messages: stored.today_messages + 1,
                last_message_at: Some(now),
                daily_reset_at: stored.daily_reset_at,
                updated_at: now,
            },
            Some(stored) => UsageRecord {
                total_messages: stored.total_messages + 1,
                today_messages: 1,
                last_message_at: Some(now),
                daily_reset_at: next_local_midnight(now, self.offset),
                updated_at: now,
            },
            None => UsageRecord {
                total_messages: 1,
                today_messages: 1,
                last_message_at: Some(now),
                daily_reset_at: next_local_midnight(now, self.offset),
                updated_at: now,
            },
        };

        self.store.put_usage(uid, &next).await?;
        Ok(next)
    }

    pub async fn remaining_quota(
        &self,
        uid: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> QuotaSnapshot {
        if tier.is_paid() {
            return QuotaSnapshot {
                remaining_total: -1,
                remaining_today: -1,
                unlimited: true,
            };
        }

        let (usage, _) = self.load_for_check(uid, now).await;
        let rule = self.rules.rule_for(tier);
        let today = Self::effective_today(&usage, now);
        QuotaSnapshot {
            remaining_total: signed(rule.total_message_cap.saturating_sub(usage.total_messages)),
            remaining_today: signed(rule.daily_message_cap.saturating_sub(today)),
            unlimited: false,
        }
    }
}

fn evaluate(
    rule: TierRule,
    tier: Tier,
    usage: &UsageRecord,
    account: Option<&UserAccount>,
    now: DateTime<Utc>,
) -> EligibilityDecision {
    let today = QuotaLedger::effective_today(usage, now);

    if tier.is_paid() {
        let cap = rule.daily_cap_paid.unwrap_or(0);
        if cap > 0 && today >= cap {
            return EligibilityDecision::deny(DenialReason::DailyCapReachedPaid, -1, 0);
        }
        let remaining_today = if cap > 0 { signed(cap - today) } else { -1 };
        return EligibilityDecision::allow(-1, remaining_today);
    }

    let age_days = account
        .map(|a| (now - a.created_at).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY)
        .unwrap_or(0.0);
    let trial_days = rule.trial_duration_days as f64;
    if age_days > trial_days {
        let mut decision = EligibilityDecision::deny(DenialReason::FreeTierExpired, 0, 0);
        decision.days_expired = Some((age_days - trial_days).floor() as i64);
        return decision;
    }

    let total = usage.total_messages;
    let total_cap = rule.total_message_cap;
    let daily_cap = rule.daily_message_cap;

    if total >= total_cap {
        return EligibilityDecision::deny(
            DenialReason::TotalCapReached,
            0,
            signed(daily_cap.saturating_sub(today)),
        );
    }

    if today >= daily_cap {
        return EligibilityDecision::deny(DenialReason::DailyCapReached, signed(total_cap - total), 0);
    }

    if let Some(last) = usage.last_message_at {
        let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
        let cooldown = rule.cooldown_seconds as f64;
        if elapsed < cooldown {
            let mut decision = EligibilityDecision::deny(
                DenialReason::CooldownActive,
                signed(total_cap - total),
                signed(daily_cap - today),
            );
            decision.wait_seconds = Some((cooldown - elapsed).ceil() as i64);
            return decision;
        }
    }

    EligibilityDecision::allow(
        signed(total_cap - total) - 1,
        signed(daily_cap - today) - 1,
    )
}
