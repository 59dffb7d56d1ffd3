//! Candidate selection, the single in-flight attempt and the cooldown set.
//!
//! The matchmaker only keeps bookkeeping. The engine drives it: it asks for
//! a candidate, arms the jitter timer, dials, and reports how the attempt
//! ended. Attempts are numbered so timers from an abandoned attempt can be
//! recognised and ignored.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use pairchat_net::Snapshot;
use pairchat_shared::types::{ConnectionId, PeerAddress};

use crate::scheduler::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Waiting out the pre-dial jitter.
    Jitter { timer: TimerHandle },
    /// Dialed, waiting for the link to open.
    Dialing {
        conn: ConnectionId,
        timer: TimerHandle,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub id: u64,
    pub candidate: PeerAddress,
    pub phase: AttemptPhase,
}

impl Attempt {
    pub fn timer(&self) -> TimerHandle {
        match self.phase {
            AttemptPhase::Jitter { timer } | AttemptPhase::Dialing { timer, .. } => timer,
        }
    }

    pub fn conn(&self) -> Option<ConnectionId> {
        match self.phase {
            AttemptPhase::Dialing { conn, .. } => Some(conn),
            AttemptPhase::Jitter { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Matchmaker {
    cooldown: HashSet<PeerAddress>,
    attempt: Option<Attempt>,
    generation: u64,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a waiting counterpart uniformly at random, skipping ourselves
    /// and everyone in cooldown.
    pub fn pick_candidate<R: Rng + ?Sized>(
        &self,
        snapshot: &Snapshot,
        own: &PeerAddress,
        rng: &mut R,
    ) -> Option<PeerAddress> {
        let candidates: Vec<&PeerAddress> = snapshot
            .values()
            .filter(|record| record.is_waiting())
            .map(|record| &record.address)
            .filter(|addr| *addr != own && !self.cooldown.contains(*addr))
            .collect();
        candidates.choose(rng).map(|addr| (*addr).clone())
    }

    /// Whether `candidate` is still a legal target.
    pub fn still_eligible(&self, snapshot: &Snapshot, candidate: &PeerAddress) -> bool {
        !self.cooldown.contains(candidate)
            && snapshot
                .get(candidate)
                .is_some_and(|record| record.is_waiting())
    }

    /// Reserve the next attempt id. The caller arms the jitter timer and
    /// then calls [`Matchmaker::begin`].
    pub fn next_attempt_id(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Set the in-flight guard.
    pub fn begin(&mut self, id: u64, candidate: PeerAddress, jitter_timer: TimerHandle) {
        self.attempt = Some(Attempt {
            id,
            candidate,
            phase: AttemptPhase::Jitter {
                timer: jitter_timer,
            },
        });
    }

    pub fn dialing(&mut self, conn: ConnectionId, timeout_timer: TimerHandle) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.phase = AttemptPhase::Dialing {
                conn,
                timer: timeout_timer,
            };
        }
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        self.attempt.as_ref()
    }

    pub fn in_flight(&self) -> bool {
        self.attempt.is_some()
    }

    /// The attempt with this id, if it is still the one in flight.
    pub fn current(&self, id: u64) -> Option<&Attempt> {
        self.attempt.as_ref().filter(|a| a.id == id)
    }

    /// The attempt dialing on `conn`, if any.
    pub fn dialing_on(&self, conn: ConnectionId) -> Option<&Attempt> {
        self.attempt.as_ref().filter(|a| a.conn() == Some(conn))
    }

    /// Clear the guard without penalising the candidate.
    pub fn abandon(&mut self) -> Option<Attempt> {
        self.attempt.take()
    }

    /// Clear the guard and put the candidate in cooldown.
    pub fn fail(&mut self) -> Option<Attempt> {
        let attempt = self.attempt.take()?;
        self.cooldown.insert(attempt.candidate.clone());
        Some(attempt)
    }

    /// A primary link opened: clear the guard and the cooldown set.
    pub fn connected(&mut self) -> Option<Attempt> {
        self.cooldown.clear();
        self.attempt.take()
    }

    pub fn is_cooling_down(&self, addr: &PeerAddress) -> bool {
        self.cooldown.contains(addr)
    }

    pub fn clear_cooldown(&mut self) -> usize {
        let n = self.cooldown.len();
        self.cooldown.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use pairchat_shared::types::{PresenceRecord, PresenceStatus, Profile};

    use super::*;

    fn snapshot(entries: &[(&str, PresenceStatus)]) -> Snapshot {
        let records: BTreeMap<PeerAddress, PresenceRecord> = entries
            .iter()
            .map(|(addr, status)| {
                let addr = PeerAddress::new(*addr);
                (addr.clone(), PresenceRecord::new(addr, *status, Profile::default()))
            })
            .collect();
        Arc::new(records)
    }

    #[test]
    fn test_only_waiting_others_are_candidates() {
        let snap = snapshot(&[
            ("me", PresenceStatus::Waiting),
            ("paired", PresenceStatus::Paired),
            ("idle", PresenceStatus::Idle),
            ("w", PresenceStatus::Waiting),
        ]);
        let mm = Matchmaker::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(
                mm.pick_candidate(&snap, &PeerAddress::new("me"), &mut rng),
                Some(PeerAddress::new("w"))
            );
        }
    }

    #[test]
    fn test_choice_is_spread_across_waiters() {
        let snap = snapshot(&[
            ("a", PresenceStatus::Waiting),
            ("b", PresenceStatus::Waiting),
            ("c", PresenceStatus::Waiting),
        ]);
        let mm = Matchmaker::new();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<PeerAddress, u32> = HashMap::new();
        for _ in 0..3000 {
            let pick = mm.pick_candidate(&snap, &PeerAddress::new("me"), &mut rng).unwrap();
            *counts.entry(pick).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|n| (800..1200).contains(n)), "{counts:?}");
    }

    #[test]
    fn test_cooldown_excludes_until_cleared() {
        let snap = snapshot(&[("b", PresenceStatus::Waiting)]);
        let me = PeerAddress::new("me");
        let mut rng = StdRng::seed_from_u64(1);
        let mut mm = Matchmaker::new();

        let id = mm.next_attempt_id();
        mm.begin(id, PeerAddress::new("b"), TimerHandle(1));
        assert!(mm.in_flight());
        mm.fail();
        assert!(!mm.in_flight());
        assert!(mm.is_cooling_down(&PeerAddress::new("b")));
        assert_eq!(mm.pick_candidate(&snap, &me, &mut rng), None);
        assert!(!mm.still_eligible(&snap, &PeerAddress::new("b")));

        assert_eq!(mm.clear_cooldown(), 1);
        assert_eq!(mm.pick_candidate(&snap, &me, &mut rng), Some(PeerAddress::new("b")));
    }

    #[test]
    fn test_stale_attempt_ids_do_not_match() {
        let mut mm = Matchmaker::new();
        let first = mm.next_attempt_id();
        mm.begin(first, PeerAddress::new("b"), TimerHandle(1));
        mm.abandon();
        let second = mm.next_attempt_id();
        mm.begin(second, PeerAddress::new("c"), TimerHandle(2));
        mm.dialing(ConnectionId(9), TimerHandle(3));

        assert!(mm.current(first).is_none());
        assert_eq!(mm.current(second).unwrap().conn(), Some(ConnectionId(9)));
        assert_eq!(mm.dialing_on(ConnectionId(9)).unwrap().timer(), TimerHandle(3));
        assert!(!mm.is_cooling_down(&PeerAddress::new("b")));

        mm.connected();
        assert!(!mm.in_flight());
    }
}
