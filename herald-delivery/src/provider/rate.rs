//! Fixed hourly and daily send ceilings for a single provider.
//!
//! Each window counts sends since it opened and resets once its length has
//! passed. A slot is taken before dialing and given back unless the relay
//! accepts the message, so only accepted messages stay counted. That holds
//! even when the attempt is abandoned mid-session.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use super::QuotaInfo;

#[derive(Debug)]
struct Window {
    length: TimeDelta,
    limit: Option<u32>,
    started: DateTime<Utc>,
    used: u32,
}

impl Window {
    const fn new(length: TimeDelta, limit: Option<u32>, now: DateTime<Utc>) -> Self {
        Self {
            length,
            limit,
            started: now,
            used: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.resets_at() {
            self.started = now;
            self.used = 0;
        }
    }

    fn resets_at(&self) -> DateTime<Utc> {
        self.started + self.length
    }

    fn remaining(&self) -> Option<u32> {
        self.limit.map(|limit| limit.saturating_sub(self.used))
    }

    fn is_full(&self) -> bool {
        self.remaining() == Some(0)
    }
}

/// The ceiling that refused a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exceeded {
    pub window: &'static str,
    pub limit: u32,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RateWindows {
    windows: Mutex<[Window; 2]>,
}

impl RateWindows {
    pub fn new(per_hour: Option<u32>, per_day: Option<u32>, now: DateTime<Utc>) -> Self {
        Self {
            windows: Mutex::new([
                Window::new(TimeDelta::hours(1), per_hour, now),
                Window::new(TimeDelta::days(1), per_day, now),
            ]),
        }
    }

    /// Take a slot in both windows, or report the first full one.
    pub fn acquire(&self, now: DateTime<Utc>) -> Result<Slot<'_>, Exceeded> {
        let mut windows = self.windows.lock();

        for (window, name) in windows.iter_mut().zip(["hourly", "daily"]) {
            window.roll(now);
            if window.is_full() {
                return Err(Exceeded {
                    window: name,
                    limit: window.limit.unwrap_or_default(),
                    resets_at: window.resets_at(),
                });
            }
        }

        for window in windows.iter_mut() {
            window.used += 1;
        }
        Ok(Slot {
            rate: self,
            committed: false,
        })
    }

    fn release(&self) {
        for window in self.windows.lock().iter_mut() {
            window.used = window.used.saturating_sub(1);
        }
    }

    pub fn quota(&self, provider: &str, now: DateTime<Utc>) -> QuotaInfo {
        let mut windows = self.windows.lock();
        for window in windows.iter_mut() {
            window.roll(now);
        }
        let [hourly, daily] = &*windows;

        let remaining = match (hourly.remaining(), daily.remaining()) {
            (Some(h), Some(d)) => Some(h.min(d)),
            (h, d) => h.or(d),
        };

        QuotaInfo {
            provider: provider.to_string(),
            daily_limit: daily.limit,
            daily_used: daily.used,
            hourly_limit: hourly.limit,
            hourly_used: hourly.used,
            remaining,
            reset_time: Some(hourly.resets_at()),
        }
    }
}

/// A slot held in both windows.
///
/// Dropped without [`Slot::commit`], it is given back.
#[derive(Debug)]
#[must_use = "an uncommitted slot is released on drop"]
pub struct Slot<'a> {
    rate: &'a RateWindows,
    committed: bool,
}

impl Slot<'_> {
    /// Keep the slot counted: the message was accepted.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rate.release();
        }
    }
}
