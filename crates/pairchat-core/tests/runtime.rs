use std::time::Duration;

use tokio::sync::mpsc;

use pairchat_core::{
    spawn_engine, ConversationKey, Engine, EngineEvent, EngineHandle, EngineInputs, Ports,
    SessionState, TokioScheduler,
};
use pairchat_net::{MemoryDirectory, MemoryNetwork};
use pairchat_shared::config::EngineConfig;
use pairchat_shared::identity::Identity;
use pairchat_shared::message::Content;
use pairchat_shared::types::{PeerAddress, PresenceStatus, Profile};
use pairchat_store::MemoryStore;

fn spawn(
    net: &MemoryNetwork,
    dir: &MemoryDirectory,
    addr: &str,
    name: &str,
) -> (EngineHandle, mpsc::Receiver<EngineEvent>) {
    let address = PeerAddress::new(addr);
    let (transport, transport_rx) = net.endpoint(address.clone());
    let (scheduler, timers) = TokioScheduler::new();
    let ports = Ports {
        transport: Box::new(transport),
        presence: Box::new(dir.client(address.clone())),
        store: Box::new(MemoryStore::new()),
        scheduler: Box::new(scheduler),
    };
    let identity = Identity::new(format!("client-{addr}"), address, Profile::named(name));
    let engine = Engine::new(EngineConfig::default(), identity, ports);
    let inputs = EngineInputs {
        transport: transport_rx,
        presence: dir.subscribe(),
        timers,
        relay: None,
    };
    let (handle, events, _task) = spawn_engine(engine, inputs);
    (handle, events)
}

async fn wait_for<T>(
    events: &mut mpsc::Receiver<EngineEvent>,
    mut pick: impl FnMut(EngineEvent) -> Option<T>,
) -> T {
    let found = async {
        while let Some(event) = events.recv().await {
            if let Some(value) = pick(event) {
                return Some(value);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(30), found)
        .await
        .expect("timed out waiting for event")
        .expect("engine stopped")
}

fn connected(event: EngineEvent) -> Option<()> {
    (event == EngineEvent::StateChanged(SessionState::Connected)).then_some(())
}

#[tokio::test(start_paused = true)]
async fn test_two_spawned_engines_pair_and_chat() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let (a, mut a_events) = spawn(&net, &dir, "aaaa", "ana");
    let (b, mut b_events) = spawn(&net, &dir, "bbbb", "bo");

    a.connect().await.unwrap();
    b.connect().await.unwrap();
    wait_for(&mut a_events, connected).await;
    wait_for(&mut b_events, connected).await;
    assert_eq!(a.state().await.unwrap(), SessionState::Connected);

    let id = a
        .send_message(ConversationKey::Primary, Content::Text("hello".into()), None)
        .await
        .unwrap();
    let message = wait_for(&mut b_events, |event| match event {
        EngineEvent::MessageReceived { message, .. } if message.id == id => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message.content, Content::Text("hello".into()));

    let visible = b.visible_messages(ConversationKey::Primary).await.unwrap();
    assert!(visible.iter().any(|m| m.id == id));

    a.disconnect().await.unwrap();
    wait_for(&mut b_events, |event| {
        matches!(event, EngineEvent::StateChanged(SessionState::Disconnected(_))).then_some(())
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_handle_reports_invalid_commands() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let (a, _events) = spawn(&net, &dir, "aaaa", "ana");

    assert!(a.reset().await.is_err());
    assert!(a
        .send_message(ConversationKey::Primary, Content::Text("x".into()), None)
        .await
        .is_err());
    assert!(!a.remove_friend("nobody").await.unwrap());

    a.shutdown().await;
    assert!(a.state().await.is_err(), "commands fail once the task is gone");
}

#[tokio::test(start_paused = true)]
async fn test_closed_transport_channel_puts_engine_in_error() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let address = PeerAddress::new("aaaa");
    let (transport, _live_rx) = net.endpoint(address.clone());
    let (scheduler, timers) = TokioScheduler::new();
    let ports = Ports {
        transport: Box::new(transport),
        presence: Box::new(dir.client(address.clone())),
        store: Box::new(MemoryStore::new()),
        scheduler: Box::new(scheduler),
    };
    let identity = Identity::new("client-aaaa", address.clone(), Profile::named("ana"));
    let engine = Engine::new(EngineConfig::default(), identity, ports);

    let (dead_tx, dead_rx) = mpsc::unbounded_channel();
    drop(dead_tx);
    let inputs = EngineInputs {
        transport: dead_rx,
        presence: dir.subscribe(),
        timers,
        relay: None,
    };
    let (handle, mut events, _task) = spawn_engine(engine, inputs);

    wait_for(&mut events, |event| {
        (event == EngineEvent::StateChanged(SessionState::Error)).then_some(())
    })
    .await;
    assert_eq!(handle.state().await.unwrap(), SessionState::Error);
    assert_eq!(dir.snapshot()[&address].status, PresenceStatus::Busy);

    handle.reset().await.unwrap();
    assert_eq!(handle.state().await.unwrap(), SessionState::Idle);
    assert_eq!(dir.snapshot()[&address].status, PresenceStatus::Idle);
    handle.shutdown().await;
}
