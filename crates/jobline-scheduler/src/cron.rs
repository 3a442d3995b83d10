//! Deterministic daily cron slots.
//!
//! Spreads per-tenant schedules over the day so tenants sharing one broker
//! do not all fire at once. A slot depends only on the identifier: the
//! minute comes from the first 8 bytes of its SHA-256 digest and the hour
//! from the next 8, so the two are independent and the day has 1440 slots.

use std::fmt;

use sha2::{Digest, Sha256};

/// A minute of the day, fired daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DailySlot {
    minute: u8,
    hour: u8,
}

fn word(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

impl DailySlot {
    /// Slot at `hour:minute`. Out-of-range values wrap.
    pub fn new(minute: u8, hour: u8) -> Self {
        Self {
            minute: minute % 60,
            hour: hour % 24,
        }
    }

    /// Slot derived from `id`.
    pub fn for_id(id: &str) -> Self {
        let digest = Sha256::digest(id.as_bytes());
        Self {
            minute: (word(&digest[0..8]) % 60) as u8,
            hour: (word(&digest[8..16]) % 24) as u8,
        }
    }

    /// Same minute, `hours` later, wrapping past midnight.
    pub fn offset_hours(self, hours: u32) -> Self {
        Self {
            minute: self.minute,
            hour: ((self.hour as u32 + hours) % 24) as u8,
        }
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// Five-field cron pattern firing daily at this slot.
    pub fn to_cron(&self) -> String {
        format!("{} {} * * *", self.minute, self.hour)
    }
}

impl fmt::Display for DailySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Daily cron pattern for `id`.
pub fn daily_cron(id: &str) -> String {
    DailySlot::for_id(id).to_cron()
}

/// Daily cron pattern for `id`, shifted by `hours`.
pub fn daily_cron_with_offset(id: &str, hours: u32) -> String {
    DailySlot::for_id(id).offset_hours(hours).to_cron()
}
