//! In-memory per-user presence tracking with multi-connection support.
//!
//! Presence is per-**user**, not per-connection.  A user counts as online
//! while at least one of their sockets is open and transitions to offline
//! only when the last one closes.  The map holds online users exclusively;
//! an entry whose count reaches zero is removed.

use dashmap::DashMap;

use rencontre_shared::UserId;

/// Thread-safe, DashMap-backed presence tracker.
pub struct PresenceTracker {
    counts: DashMap<UserId, usize>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    /// Register one more open connection for `user`.
    ///
    /// Returns `true` when this was the user's first connection, i.e. the
    /// user just came online and the caller should broadcast the change.
    pub fn connect(&self, user: UserId) -> bool {
        let mut entry = self.counts.entry(user).or_insert(0);
        *entry += 1;
        *entry == 1
    }

    /// Register one connection closing for `user`.
    ///
    /// Returns `true` when this was the user's last connection, i.e. the
    /// user just went offline.  Unknown users are a no-op, so the count can
    /// never go negative.
    pub fn disconnect(&self, user: UserId) -> bool {
        let now_offline = match self.counts.get_mut(&user) {
            Some(mut entry) => {
                *entry = entry.saturating_sub(1);
                *entry == 0
            }
            None => return false,
        };

        if now_offline {
            // A reconnect may have raced us between the two locks; only
            // remove the entry if the count is still zero.
            self.counts.remove_if(&user, |_, count| *count == 0);
        }
        now_offline
    }

    /// Whether `user` has at least one open connection.
    pub fn is_online(&self, user: UserId) -> bool {
        self.counts.get(&user).map(|c| *c > 0).unwrap_or(false)
    }

    /// Every user with at least one open connection, in no particular order.
    pub fn online_users(&self) -> Vec<UserId> {
        self.counts
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of distinct online users.
    pub fn online_count(&self) -> usize {
        self.counts.len()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_iff_count_positive() {
        let tracker = PresenceTracker::new();
        let user = UserId::new();

        assert!(!tracker.is_online(user));

        // First connection reports the transition, the second does not.
        assert!(tracker.connect(user));
        assert!(!tracker.connect(user));
        assert!(tracker.is_online(user));

        // First disconnect keeps the user online.
        assert!(!tracker.disconnect(user));
        assert!(tracker.is_online(user));

        // Last disconnect takes them offline and drops the entry.
        assert!(tracker.disconnect(user));
        assert!(!tracker.is_online(user));
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn disconnect_of_unknown_user_is_harmless() {
        let tracker = PresenceTracker::new();
        let user = UserId::new();

        assert!(!tracker.disconnect(user));
        assert!(!tracker.disconnect(user));
        assert!(!tracker.is_online(user));

        // The tracker still behaves after the spurious disconnects.
        assert!(tracker.connect(user));
        assert!(tracker.is_online(user));
    }

    #[test]
    fn online_users_lists_exactly_the_online() {
        let tracker = PresenceTracker::new();
        let a = UserId::new();
        let b = UserId::new();

        tracker.connect(a);
        tracker.connect(b);
        tracker.connect(b);
        tracker.disconnect(a);

        let online = tracker.online_users();
        assert_eq!(online, vec![b]);
        assert_eq!(tracker.online_count(), 1);
    }
}
