//! Expiration sweep: deactivates links that are past their expiry or have
//! not been visited for [`STALE_AFTER`], and rewrites their tokens so the
//! original value can be reused.

use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{Clock, CoreError, LinkRepository};

/// Links whose last visit is older than this are swept.
pub const STALE_AFTER: Duration = Duration::from_secs(90 * 24 * 60 * 60);
/// How often the background worker runs a sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const TOMBSTONE_TAG: &str = "expired_";

/// `expired_` + 12 URL-safe characters + `_`. The link id is appended per row.
pub fn tombstone_prefix() -> String {
    let mut buf = [0u8; 12];
    OsRng.fill_bytes(&mut buf);
    let encoded = URL_SAFE.encode(buf);
    format!("{TOMBSTONE_TAG}{}_", &encoded[..12])
}

pub fn is_tombstone(token: &str) -> bool {
    token.starts_with(TOMBSTONE_TAG)
}

pub struct ExpirationSweeper<L: LinkRepository, C: Clock> {
    links: L,
    clock: C,
}

impl<L: LinkRepository, C: Clock> ExpirationSweeper<L, C> {
    pub fn new(links: L, clock: C) -> Self {
        Self { links, clock }
    }

    /// Run one sweep and return how many links were deactivated.
    ///
    /// Safe to run concurrently with itself: a row already swept is inactive
    /// and no longer matches.
    pub fn sweep(&self) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let stale_before = now.checked_sub(STALE_AFTER).unwrap_or(SystemTime::UNIX_EPOCH);
        self.links.sweep_expired(now, stale_before, &tombstone_prefix())
    }
}
