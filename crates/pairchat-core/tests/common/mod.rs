//! Deterministic multi-participant harness: several engines over one
//! in-process network and presence directory, each with its own manual clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use pairchat_core::{Engine, EngineEvent, ManualScheduler, Ports, SessionState};
use pairchat_net::{MemoryDirectory, MemoryNetwork, Snapshot, TransportEvent};
use pairchat_shared::config::EngineConfig;
use pairchat_shared::identity::Identity;
use pairchat_shared::types::{PeerAddress, Profile};
use pairchat_store::{KeyValueStore, MemoryStore};

pub struct Peer {
    pub engine: Engine,
    pub transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    pub clock: ManualScheduler,
    pub events: Vec<EngineEvent>,
    last_snapshot: Option<Snapshot>,
}

impl Peer {
    pub fn address(&self) -> &PeerAddress {
        self.engine.address()
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn partner(&self) -> Option<&PeerAddress> {
        self.engine.session().partner()
    }
}

pub struct World {
    pub net: MemoryNetwork,
    pub dir: MemoryDirectory,
    pub peers: Vec<Peer>,
    pub now: DateTime<Utc>,
    pub config: EngineConfig,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            net: MemoryNetwork::new(),
            dir: MemoryDirectory::new(),
            peers: Vec::new(),
            now: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            config,
        }
    }

    /// Add a started engine at `addr`. Returns its index.
    pub fn add(&mut self, addr: &str, name: &str, seed: u64) -> usize {
        let mut profile = Profile::named(name);
        profile.stable_id = Some(format!("stable-{name}"));
        self.add_with_profile(addr, profile, seed)
    }

    pub fn add_with_profile(&mut self, addr: &str, profile: Profile, seed: u64) -> usize {
        self.add_with_store(addr, profile, seed, Box::new(MemoryStore::new()))
    }

    pub fn add_with_store(
        &mut self,
        addr: &str,
        profile: Profile,
        seed: u64,
        store: Box<dyn KeyValueStore>,
    ) -> usize {
        let address = PeerAddress::new(addr);
        let (transport, transport_rx) = self.net.endpoint(address.clone());
        let presence = self.dir.client(address.clone());
        let clock = ManualScheduler::new(self.now);
        let identity = Identity::new(format!("client-{addr}"), address, profile);

        let ports = Ports {
            transport: Box::new(transport),
            presence: Box::new(presence),
            store,
            scheduler: Box::new(clock.clone()),
        };
        let mut engine =
            Engine::new(self.config.clone(), identity, ports).with_rng(StdRng::seed_from_u64(seed));
        engine.start();

        self.peers.push(Peer {
            engine,
            transport_rx,
            clock,
            events: Vec::new(),
            last_snapshot: None,
        });
        self.settle();
        self.peers.len() - 1
    }

    pub fn engine(&mut self, i: usize) -> &mut Engine {
        &mut self.peers[i].engine
    }

    pub fn state(&self, i: usize) -> SessionState {
        self.peers[i].engine.state()
    }

    /// Deliver transport events and presence snapshots until nothing moves.
    pub fn settle(&mut self) {
        loop {
            let mut moved = false;
            let snapshot = self.dir.snapshot();
            for peer in &mut self.peers {
                let fresh = peer
                    .last_snapshot
                    .as_ref()
                    .map_or(true, |last| !Arc::ptr_eq(last, &snapshot));
                if fresh {
                    peer.last_snapshot = Some(snapshot.clone());
                    peer.engine.on_presence_snapshot(snapshot.clone());
                    moved = true;
                }
                while let Ok(event) = peer.transport_rx.try_recv() {
                    peer.engine.on_transport_event(event);
                    moved = true;
                }
                let drained = peer.engine.drain_events();
                peer.events.extend(drained);
            }
            if !moved {
                break;
            }
        }
    }

    fn earliest_due(&self, until: DateTime<Utc>) -> Option<(DateTime<Utc>, usize)> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(i, peer)| peer.clock.next_due().map(|at| (at, i)))
            .filter(|(at, _)| *at <= until)
            .min()
    }

    /// Move every clock forward by `by`, firing due timers in global order
    /// and settling after each one.
    pub fn advance(&mut self, by: Duration) {
        let until = self.now + chrono::Duration::from_std(by).unwrap();
        while let Some((at, i)) = self.earliest_due(until) {
            for peer in &self.peers {
                peer.clock.advance_clock(at);
            }
            if let Some(timer) = self.peers[i].clock.pop_due(until) {
                self.peers[i].engine.on_timer(timer);
            }
            self.settle();
        }
        for peer in &self.peers {
            peer.clock.advance_clock(until);
        }
        self.now = until;
        self.settle();
    }

    /// Fire every timer due by `now + by` on every engine *before* any
    /// transport event is delivered, then settle. Used to force crossed dials.
    pub fn advance_without_interleaving(&mut self, by: Duration) {
        let until = self.now + chrono::Duration::from_std(by).unwrap();
        for peer in &mut self.peers {
            while let Some(timer) = peer.clock.pop_due(until) {
                peer.engine.on_timer(timer);
            }
            peer.clock.advance_clock(until);
        }
        self.now = until;
        self.settle();
    }
}

pub fn addr(s: &str) -> PeerAddress {
    PeerAddress::new(s)
}

pub fn connected_to(world: &World, i: usize, j: usize) -> bool {
    world.state(i) == SessionState::Connected
        && world.peers[i].partner() == Some(world.peers[j].address())
}

/// A world holding two engines already paired with each other, with their
/// event logs emptied.
pub fn paired() -> (World, usize, usize) {
    let mut world = World::new();
    let a = world.add("aaaa", "ana", 1);
    let b = world.add("bbbb", "bo", 2);
    world.engine(a).connect().unwrap();
    world.engine(b).connect().unwrap();
    world.settle();
    world.advance(Duration::from_millis(300));
    assert!(connected_to(&world, a, b));
    for peer in &mut world.peers {
        peer.take_events();
    }
    (world, a, b)
}

/// Messages delivered to `conversation` among `events`.
pub fn received(
    events: &[EngineEvent],
    conversation: &pairchat_core::ConversationKey,
) -> Vec<pairchat_shared::message::Message> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::MessageReceived {
                conversation: key,
                message,
                ..
            } if key == conversation => Some(message.clone()),
            _ => None,
        })
        .collect()
}
