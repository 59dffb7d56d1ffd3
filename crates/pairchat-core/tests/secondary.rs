mod common;

use chrono::{TimeZone, Utc};

use pairchat_core::{ConversationKey, EngineError, EngineEvent, SessionState};
use pairchat_net::{PendingMessage, Transport, TransportEvent};
use pairchat_shared::error::Fault;
use pairchat_shared::message::{Content, Sender};
use pairchat_shared::types::ConnectionRole;

use common::{addr, connected_to, paired, received, World};

fn secondary(s: &str) -> ConversationKey {
    ConversationKey::Secondary(addr(s))
}

fn open_pair() -> (World, usize, usize) {
    let mut world = World::new();
    let a = world.add("aaaa", "ana", 1);
    let b = world.add("bbbb", "bo", 2);
    world.engine(a).open_secondary(&addr("bbbb")).unwrap();
    world.settle();
    (world, a, b)
}

#[test]
fn test_open_secondary_exchanges_profiles() {
    let (mut world, a, b) = open_pair();

    let a_events = world.peers[a].take_events();
    assert!(a_events.contains(&EngineEvent::SecondaryOpened(addr("bbbb"))));
    assert!(a_events.iter().any(|e| matches!(
        e,
        EngineEvent::SecondaryProfile { peer, profile } if peer == &addr("bbbb") && profile.name == "bo"
    )));
    assert!(world.peers[b]
        .take_events()
        .contains(&EngineEvent::SecondaryOpened(addr("aaaa"))));

    let link = world.peers[b].engine.secondary(&addr("aaaa")).unwrap();
    assert_eq!(link.profile.as_ref().unwrap().name, "ana");
    assert_eq!(world.state(a), SessionState::Idle);
    assert_eq!(world.net.open_connections(&addr("aaaa")), 1);

    // Opening again while the link is up does nothing.
    world.engine(a).open_secondary(&addr("bbbb")).unwrap();
    world.settle();
    assert_eq!(world.net.open_connections(&addr("aaaa")), 1);
}

#[test]
fn test_secondary_messages_carry_sender_profile_and_are_persisted() {
    let (mut world, a, b) = open_pair();
    world.peers[b].take_events();

    let id = world
        .engine(a)
        .send_message(&secondary("bbbb"), Content::Text("hey friend".into()), None)
        .unwrap();
    world.settle();

    let events = world.peers[b].take_events();
    let sender = events.iter().find_map(|e| match e {
        EngineEvent::MessageReceived {
            conversation,
            sender_profile,
            ..
        } if conversation == &secondary("aaaa") => sender_profile.clone(),
        _ => None,
    });
    assert_eq!(sender.unwrap().name, "ana");
    assert_eq!(received(&events, &secondary("aaaa"))[0].id, id);

    let key = world.peers[b].engine.history_key(&addr("aaaa"));
    assert_eq!(key, "stable-ana");
    let history = world.peers[b].engine.stored_history(&key).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender, Sender::Stranger);

    let own = world.peers[a].engine.stored_history("stable-bo").unwrap();
    assert_eq!(own[0].sender, Sender::Me);
}

#[test]
fn test_secondary_runs_alongside_primary_session() {
    let (mut world, a, b) = paired();
    let c = world.add("cccc", "cy", 3);

    world.engine(c).open_secondary(&addr("aaaa")).unwrap();
    world.settle();
    assert!(world.peers[a].engine.secondary(&addr("cccc")).is_some());
    assert!(connected_to(&world, a, b));
    assert_eq!(world.net.open_connections(&addr("aaaa")), 2);

    // A disconnect frame on the secondary link closes only that link.
    world.engine(c).close_secondary(&addr("aaaa")).unwrap();
    world.settle();
    assert!(world.peers[a]
        .take_events()
        .contains(&EngineEvent::SecondaryClosed(addr("cccc"))));
    assert!(world.peers[a].engine.secondary(&addr("cccc")).is_none());
    assert!(connected_to(&world, a, b));
    assert_eq!(world.net.open_connections(&addr("aaaa")), 1);
}

#[test]
fn test_inbound_secondary_replaces_the_old_link() {
    let mut world = World::new();
    let a = world.add("aaaa", "ana", 1);
    let (mut raw, mut raw_rx) = world.net.endpoint(addr("cccc"));

    let first = raw.connect(&addr("aaaa"), ConnectionRole::Secondary).unwrap();
    world.settle();
    let second = raw.connect(&addr("aaaa"), ConnectionRole::Secondary).unwrap();
    world.settle();

    let link = world.peers[a].engine.secondary(&addr("cccc")).unwrap();
    assert_ne!(link.conn, first);
    assert_eq!(world.net.open_connections(&addr("aaaa")), 1);

    let raw_events: Vec<TransportEvent> = std::iter::from_fn(|| raw_rx.try_recv().ok()).collect();
    assert!(raw_events.contains(&TransportEvent::Closed { conn: first }));
    assert!(raw_events.contains(&TransportEvent::Opened {
        conn: second,
        peer: addr("aaaa"),
    }));
}

#[test]
fn test_close_secondary_notifies_the_peer() {
    let (mut world, a, b) = open_pair();

    world.engine(a).close_secondary(&addr("bbbb")).unwrap();
    world.settle();

    assert!(world.peers[a]
        .take_events()
        .contains(&EngineEvent::SecondaryClosed(addr("bbbb"))));
    assert!(world.peers[b]
        .take_events()
        .contains(&EngineEvent::SecondaryClosed(addr("aaaa"))));
    assert!(world.peers[b].engine.secondary_peers().is_empty());
    assert!(matches!(
        world.engine(a).close_secondary(&addr("bbbb")),
        Err(EngineError::NotConnected(_))
    ));
    assert!(matches!(
        world
            .engine(a)
            .send_message(&secondary("bbbb"), Content::Text("gone".into()), None),
        Err(EngineError::NotConnected(_))
    ));
}

#[test]
fn test_secondary_to_missing_peer_faults() {
    let mut world = World::new();
    let a = world.add("aaaa", "ana", 1);

    world.engine(a).open_secondary(&addr("nobody")).unwrap();
    world.settle();

    assert!(world.peers[a]
        .take_events()
        .contains(&EngineEvent::Fault(Fault::PeerUnreachable(addr("nobody")))));
    assert!(world.peers[a].engine.secondary(&addr("nobody")).is_none());
    assert!(world.engine(a).open_secondary(&addr("aaaa")).is_err());
}

#[test]
fn test_friend_request_over_secondary() {
    let (mut world, a, b) = open_pair();

    world.engine(a).send_friend_request(&secondary("bbbb")).unwrap();
    world.settle();
    assert_eq!(world.peers[b].engine.friends().requests().len(), 1);

    world.engine(b).accept_friend_request("stable-ana").unwrap();
    world.settle();
    assert!(world.peers[a].engine.friends().get("stable-bo").is_some());
}

#[test]
fn test_relay_batches_are_deduplicated() {
    let mut world = World::new();
    let a = world.add("aaaa", "ana", 1);
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let pending = |id: &str, kind: &str, content: &str| PendingMessage {
        id: id.into(),
        sender_id: "stable-zed".into(),
        kind: kind.into(),
        content: content.into(),
        created_at: at,
    };

    world.engine(a).on_relay_messages(vec![
        pending("r1", "text", "while you were away"),
        pending("r2", "image", "data:image/png;base64,AAAA"),
        pending("r1", "text", "while you were away"),
    ]);
    world
        .engine(a)
        .on_relay_messages(vec![pending("r2", "image", "data:image/png;base64,AAAA")]);

    let delivered: Vec<_> = world
        .engine(a)
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::RelayMessage { sender_id, message } => Some((sender_id, message)),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].0, "stable-zed");
    assert_eq!(delivered[0].1.timestamp, at);
    assert!(matches!(delivered[1].1.content, Content::Image(_)));

    let history = world.peers[a].engine.stored_history("stable-zed").unwrap();
    assert_eq!(history.len(), 2);
}
