//! Conflict resolution policies.
//!
//! A conflict is a document whose local and remote content both moved since
//! the last sync, to different content. A [`ConflictResolver`] picks a
//! winner or defers; deferred conflicts keep their sync record untouched and
//! are detected again every cycle until someone settles them.

use chrono::Duration;

use crate::config::ConflictPolicy;
use crate::models::Fingerprint;
use crate::remote::Capabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    TakeLocal,
    TakeRemote,
    Defer,
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &Fingerprint, remote: &Fingerprint) -> Resolution;
}

/// Most recent modification wins when both timestamps can be trusted and
/// they are further apart than the clock-skew tolerance.
///
/// A remote time reported at `r` may stand for any edit in
/// `[r, r + remote_resolution)`, so the local side needs that much more
/// margin to win.
pub struct NewestWins {
    pub clock_skew: Duration,
    pub remote_resolution: Duration,
    pub trust_remote_timestamps: bool,
}

impl ConflictResolver for NewestWins {
    fn resolve(&self, local: &Fingerprint, remote: &Fingerprint) -> Resolution {
        if !self.trust_remote_timestamps {
            return Resolution::Defer;
        }
        let (Some(local_mtime), Some(remote_mtime)) = (local.modified, remote.modified) else {
            return Resolution::Defer;
        };

        let gap = local_mtime - remote_mtime;
        if gap > self.clock_skew + self.remote_resolution {
            Resolution::TakeLocal
        } else if -gap > self.clock_skew {
            Resolution::TakeRemote
        } else {
            Resolution::Defer
        }
    }
}

pub struct AlwaysLocal;

impl ConflictResolver for AlwaysLocal {
    fn resolve(&self, _local: &Fingerprint, _remote: &Fingerprint) -> Resolution {
        Resolution::TakeLocal
    }
}

pub struct AlwaysRemote;

impl ConflictResolver for AlwaysRemote {
    fn resolve(&self, _local: &Fingerprint, _remote: &Fingerprint) -> Resolution {
        Resolution::TakeRemote
    }
}

/// Never resolves; every conflict waits for an operator.
pub struct Manual;

impl ConflictResolver for Manual {
    fn resolve(&self, _local: &Fingerprint, _remote: &Fingerprint) -> Resolution {
        Resolution::Defer
    }
}

/// Resolver for a mapping's configured policy.
pub fn for_policy(
    policy: ConflictPolicy,
    capabilities: Capabilities,
    clock_skew_secs: u64,
) -> Box<dyn ConflictResolver> {
    match policy {
        ConflictPolicy::Newest => Box::new(NewestWins {
            clock_skew: Duration::seconds(clock_skew_secs as i64),
            remote_resolution: Duration::milliseconds(
                capabilities.timestamp_resolution.as_millis() as i64,
            ),
            trust_remote_timestamps: capabilities.trustworthy_timestamps,
        }),
        ConflictPolicy::Local => Box::new(AlwaysLocal),
        ConflictPolicy::Remote => Box::new(AlwaysRemote),
        ConflictPolicy::Manual => Box::new(Manual),
    }
}
