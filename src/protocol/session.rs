//! Session generations and key lifecycle
//!
//! A peer holds at most two session generations: the current one and the
//! previous one, kept briefly so in-flight packets sealed under the old keys
//! still open during a rekey. Timing constants are the published protocol
//! values; interoperability depends on not inventing new ones.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::protocol::handshake::HandshakeOutcome;
use crate::protocol::transport::SessionTransport;

/// Initiate a rekey once the current session is this old
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Refuse traffic on sessions older than this
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Retry interval for unanswered handshake initiations
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Passive keepalive: answer receive-only traffic within this time
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Give up initiating after this long
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Initiation attempts before a peer is declared unreachable
pub const MAX_HANDSHAKE_ATTEMPTS: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;

/// One established session generation
pub struct Session {
    /// Our receiver index, unique engine-wide
    pub local_index: u32,
    /// Peer's receiver index; goes into outgoing headers
    pub remote_index: u32,
    /// Keys, send counter and replay window
    pub transport: SessionTransport,
    /// True if we initiated the handshake that produced this session
    pub is_initiator: bool,
    created_at: Instant,
    last_sent: Instant,
    last_received: Instant,
}

impl Session {
    pub fn from_outcome(outcome: &HandshakeOutcome) -> Self {
        let now = Instant::now();
        Self {
            local_index: outcome.local_index,
            remote_index: outcome.remote_index,
            transport: SessionTransport::new(outcome.sending_key, outcome.receiving_key),
            is_initiator: outcome.is_initiator,
            created_at: now,
            last_sent: now,
            last_received: now,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    /// Rekey is due when the session is old enough while traffic is flowing,
    /// or the send counter passed REKEY_AFTER_MESSAGES. Only the initiator
    /// rekeys on time alone; the responder waits for the peer or for its own
    /// outbound traffic to trigger it, as the protocol prescribes.
    pub fn wants_rekey(&self) -> bool {
        let traffic_active = self.last_sent.elapsed() < KEEPALIVE_TIMEOUT
            || self.last_received.elapsed() < KEEPALIVE_TIMEOUT;
        let by_time = self.is_initiator && self.age() >= REKEY_AFTER_TIME && traffic_active;
        by_time || self.transport.needs_rekey_by_counter()
    }

    /// Passive keepalive is owed after receiving without sending
    pub fn wants_passive_keepalive(&self) -> bool {
        self.last_received > self.last_sent && self.last_sent.elapsed() >= KEEPALIVE_TIMEOUT
    }

    /// Persistent keepalive is owed after an idle send path
    pub fn wants_persistent_keepalive(&self, interval: Duration) -> bool {
        self.last_sent.elapsed() >= interval
    }

    pub fn mark_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    pub fn mark_received(&mut self) {
        self.last_received = Instant::now();
    }

    pub fn last_received_elapsed(&self) -> Duration {
        self.last_received.elapsed()
    }

    /// Shift the session's clocks backwards so the time-based rules can be
    /// exercised without waiting them out
    #[cfg(test)]
    pub(crate) fn age_artificially(&mut self, created: Duration, idle: Duration) {
        let now = Instant::now();
        self.created_at = now - created;
        self.last_sent = now - idle;
        self.last_received = now - idle;
    }
}

/// The at-most-two session generations of one peer
#[derive(Default)]
pub struct SessionSet {
    current: Option<Session>,
    previous: Option<Session>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current session, if present and unexpired
    pub fn current(&mut self) -> Option<&mut Session> {
        match &self.current {
            Some(s) if !s.is_expired() => self.current.as_mut(),
            _ => None,
        }
    }

    pub fn has_current(&self) -> bool {
        matches!(&self.current, Some(s) if !s.is_expired())
    }

    /// Install a fresh generation; the old current becomes previous and the
    /// third generation (if any) is discarded, keys zeroized on drop.
    /// Returns the discarded generation's local index so the caller can
    /// release it.
    pub fn install(&mut self, session: Session) -> Option<u32> {
        let displaced = self.previous.take().map(|s| s.local_index);
        self.previous = self.current.take();
        self.current = Some(session);
        displaced
    }

    /// Find an unexpired generation by our receiver index
    pub fn find_by_index(&mut self, index: u32) -> Option<&mut Session> {
        // Split borrows keep this awkward; check current first
        if matches!(&self.current, Some(s) if s.local_index == index && !s.is_expired()) {
            return self.current.as_mut();
        }
        if matches!(&self.previous, Some(s) if s.local_index == index && !s.is_expired()) {
            return self.previous.as_mut();
        }
        None
    }

    /// Drop expired generations; returns the freed local indices
    pub fn expire(&mut self) -> Vec<u32> {
        let mut freed = Vec::new();
        if matches!(&self.previous, Some(s) if s.is_expired()) {
            if let Some(s) = self.previous.take() {
                freed.push(s.local_index);
            }
        }
        if matches!(&self.current, Some(s) if s.is_expired()) {
            if let Some(s) = self.current.take() {
                freed.push(s.local_index);
            }
        }
        freed
    }

    /// Tear down everything; returns the freed local indices
    pub fn clear(&mut self) -> Vec<u32> {
        let mut freed = Vec::new();
        if let Some(s) = self.previous.take() {
            freed.push(s.local_index);
        }
        if let Some(s) = self.current.take() {
            freed.push(s.local_index);
        }
        freed
    }

    pub fn local_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.current
            .iter()
            .chain(self.previous.iter())
            .map(|s| s.local_index)
    }
}

/// Random session index; engine-wide uniqueness is enforced by the registry
pub fn random_index() -> u32 {
    rand::thread_rng().gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(local: u32, remote: u32, initiator: bool) -> HandshakeOutcome {
        HandshakeOutcome {
            local_index: local,
            remote_index: remote,
            sending_key: [1u8; 32],
            receiving_key: [2u8; 32],
            is_initiator: initiator,
        }
    }

    #[test]
    fn test_fresh_session_needs_nothing() {
        let s = Session::from_outcome(&outcome(1, 2, true));
        assert!(!s.is_expired());
        assert!(!s.wants_rekey());
        assert!(!s.wants_passive_keepalive());
    }

    #[test]
    fn test_install_keeps_two_generations() {
        let mut set = SessionSet::new();
        set.install(Session::from_outcome(&outcome(10, 20, true)));
        set.install(Session::from_outcome(&outcome(11, 21, true)));

        assert_eq!(set.current().unwrap().local_index, 11);
        assert!(set.find_by_index(10).is_some());
        assert!(set.find_by_index(11).is_some());

        // Third generation pushes out the first
        set.install(Session::from_outcome(&outcome(12, 22, true)));
        assert!(set.find_by_index(10).is_none());
        assert!(set.find_by_index(11).is_some());
        assert!(set.find_by_index(12).is_some());
    }

    #[test]
    fn test_clear_returns_indices() {
        let mut set = SessionSet::new();
        set.install(Session::from_outcome(&outcome(10, 20, true)));
        set.install(Session::from_outcome(&outcome(11, 21, true)));

        let mut freed = set.clear();
        freed.sort_unstable();
        assert_eq!(freed, vec![10, 11]);
        assert!(!set.has_current());
    }

    #[test]
    fn test_initiator_rekeys_after_time_with_active_traffic() {
        let mut s = Session::from_outcome(&outcome(1, 2, true));
        s.age_artificially(REKEY_AFTER_TIME, Duration::from_secs(1));
        assert!(s.wants_rekey());
    }

    #[test]
    fn test_old_but_idle_session_does_not_rekey() {
        let mut s = Session::from_outcome(&outcome(1, 2, true));
        s.age_artificially(REKEY_AFTER_TIME, KEEPALIVE_TIMEOUT);
        assert!(!s.wants_rekey());
    }

    #[test]
    fn test_responder_does_not_rekey_on_time() {
        // The responder waits for the initiator even with active traffic
        let mut s = Session::from_outcome(&outcome(1, 2, false));
        s.age_artificially(REKEY_AFTER_TIME, Duration::from_secs(1));
        assert!(!s.wants_rekey());
    }

    #[test]
    fn test_session_expires_after_reject_time() {
        let mut s = Session::from_outcome(&outcome(1, 2, true));
        s.age_artificially(REJECT_AFTER_TIME, Duration::from_secs(1));
        assert!(s.is_expired());
    }

    #[test]
    fn test_max_attempts_from_published_constants() {
        assert_eq!(MAX_HANDSHAKE_ATTEMPTS, 18);
    }
}
