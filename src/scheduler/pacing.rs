//! Queue admission pacing.
//!
//! When many pending listings are admitted at once their scheduled times
//! are spread uniformly across the business window starting from the next
//! business-day morning, respecting each account's daily upload limit.
//! Accounts are paced independently.

use crate::accounts::AccountManager;
use crate::models::Platform;
use crate::store::MasterDb;
use anyhow::Result;
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::info;

pub const BUSINESS_HOURS_START: u32 = 6;
pub const BUSINESS_HOURS_END: u32 = 23;

/// The next business-window opening strictly after `now` (tomorrow
/// morning).
pub fn next_business_start(now: DateTime<Local>) -> DateTime<Local> {
    let next_day = now.date_naive() + Duration::days(1);
    let opening = next_day.and_time(
        NaiveTime::from_hms_opt(BUSINESS_HOURS_START, 0, 0).expect("valid opening time"),
    );
    Local
        .from_local_datetime(&opening)
        .single()
        .unwrap_or(now + Duration::days(1))
}

/// Uniform slots across the business window, rolling into following days
/// once `daily_limit` is reached.
pub fn calculate_time_slots(
    items_count: usize,
    start: DateTime<Local>,
    business_start: u32,
    business_end: u32,
    daily_limit: usize,
) -> Vec<DateTime<Local>> {
    let mut slots = Vec::with_capacity(items_count);
    if items_count == 0 {
        return slots;
    }

    let business_minutes = (business_end.saturating_sub(business_start)) as i64 * 60;
    let daily_limit = daily_limit.max(1);
    let mut day = start.date_naive();
    let mut remaining = items_count;

    while remaining > 0 {
        let today = remaining.min(daily_limit);
        for i in 0..today {
            let minutes_from_open = business_minutes * i as i64 / today as i64;
            let time = NaiveTime::from_hms_opt(business_start, 0, 0)
                .expect("valid opening time")
                + Duration::minutes(minutes_from_open);
            let slot = Local
                .from_local_datetime(&day.and_time(time))
                .single()
                .unwrap_or(start);
            slots.push(slot);
        }
        remaining -= today;
        day += Duration::days(1);
    }

    slots
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleStats {
    pub queued: usize,
    pub skipped: usize,
}

/// Admit every pending listing without a queue row, spreading schedules
/// per account from the next business morning.
pub async fn schedule_pending(
    db: &MasterDb,
    account_manager: &AccountManager,
    platform: Platform,
    priority: i64,
) -> Result<ScheduleStats> {
    let pending = db.pending_listings_without_queue(platform).await?;
    let mut stats = ScheduleStats::default();
    if pending.is_empty() {
        return Ok(stats);
    }

    let mut by_account: HashMap<String, Vec<String>> = HashMap::new();
    for listing in pending {
        by_account
            .entry(listing.account_id.clone())
            .or_default()
            .push(listing.asin.clone());
    }

    let start = next_business_start(Local::now());

    for (account_id, asins) in by_account {
        let daily_limit = account_manager
            .get_account(&account_id)
            .map(|a| a.daily_upload_limit as usize)
            .unwrap_or(1000);

        // Rows already scheduled on the starting day consume its budget
        let already_scheduled = db
            .upload_count_for_date(&account_id, start.date_naive())
            .await? as usize;
        let daily_limit = daily_limit.saturating_sub(already_scheduled).max(1);

        let slots = calculate_time_slots(
            asins.len(),
            start,
            BUSINESS_HOURS_START,
            BUSINESS_HOURS_END,
            daily_limit,
        );

        for (asin, slot) in asins.iter().zip(slots) {
            let scheduled: DateTime<Utc> = slot.with_timezone(&Utc);
            if db
                .add_to_queue(asin, platform, &account_id, scheduled, priority)
                .await?
            {
                stats.queued += 1;
            } else {
                stats.skipped += 1;
            }
        }

        info!(
            "scheduled {} items for {} starting {}",
            asins.len(),
            account_id,
            start.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(stats)
}
