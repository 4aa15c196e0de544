//! Round countdowns.
//!
//! The host owns a [`RoundTimer`] stamped with its own clock and is the only
//! side that acts on expiry. The guest keeps a [`TimerMirror`]: on receipt of
//! a host stamp it fixes a local reference point and counts down from
//! `duration - host_elapsed` with its own clock. Later one-way delay is
//! ignored so the countdown stays visually stable.

/// Ceiling of `ms` in whole seconds.
fn ceil_secs(ms: u64) -> u32 {
    u32::try_from(ms.div_ceil(1_000)).unwrap_or(u32::MAX)
}

/// Host-side timer for one betting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTimer {
    start_ms: u64,
    duration_secs: u32,
}

impl RoundTimer {
    pub fn start(now_ms: u64, duration_secs: u32) -> Self {
        Self {
            start_ms: now_ms,
            duration_secs,
        }
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_ms
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    /// Recomputed from the start stamp on every call.
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.start_ms);
        (u64::from(self.duration_secs) * 1_000).saturating_sub(elapsed)
    }

    pub fn remaining_secs(&self, now_ms: u64) -> u32 {
        ceil_secs(self.remaining_ms(now_ms))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.remaining_ms(now_ms) == 0
    }
}

/// Guest-side countdown fixed at the moment a host stamp was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncedCountdown {
    host_start_ms: u64,
    duration_secs: u32,
    processed_at_ms: u64,
    initial_remaining_ms: u64,
}

impl SyncedCountdown {
    pub fn from_sync(host_start_ms: u64, duration_secs: u32, now_ms: u64) -> Self {
        let host_elapsed = now_ms.saturating_sub(host_start_ms);
        Self {
            host_start_ms,
            duration_secs,
            processed_at_ms: now_ms,
            initial_remaining_ms: (u64::from(duration_secs) * 1_000).saturating_sub(host_elapsed),
        }
    }

    pub fn host_start_ms(&self) -> u64 {
        self.host_start_ms
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        let local_elapsed = now_ms.saturating_sub(self.processed_at_ms);
        self.initial_remaining_ms.saturating_sub(local_elapsed)
    }

    pub fn remaining_secs(&self, now_ms: u64) -> u32 {
        ceil_secs(self.remaining_ms(now_ms))
    }
}

/// Guest timer state across rounds.
///
/// Keeps the newest host stamp ever applied so a delayed or duplicated sync
/// can never move the countdown backwards.
#[derive(Debug, Clone, Default)]
pub struct TimerMirror {
    latest_start_ms: Option<u64>,
    countdown: Option<SyncedCountdown>,
}

impl TimerMirror {
    /// Whether a stamp would be accepted by [`TimerMirror::apply`].
    pub fn is_newer(&self, host_start_ms: u64) -> bool {
        self.latest_start_ms.is_none_or(|latest| host_start_ms > latest)
    }

    /// Returns `false` when the stamp is not newer than the last one applied.
    pub fn apply(&mut self, host_start_ms: u64, duration_secs: u32, now_ms: u64) -> bool {
        if !self.is_newer(host_start_ms) {
            return false;
        }
        self.latest_start_ms = Some(host_start_ms);
        self.countdown = Some(SyncedCountdown::from_sync(host_start_ms, duration_secs, now_ms));
        true
    }

    /// Drop the running countdown, keeping the high-water mark.
    pub fn clear(&mut self) {
        self.countdown = None;
    }

    pub fn countdown(&self) -> Option<&SyncedCountdown> {
        self.countdown.as_ref()
    }

    pub fn remaining_secs(&self, now_ms: u64) -> Option<u32> {
        self.countdown.map(|c| c.remaining_secs(now_ms))
    }
}
