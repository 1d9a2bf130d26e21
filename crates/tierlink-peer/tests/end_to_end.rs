//! Two sessions over the in-process transport and store

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::timeout;

use tierlink_core::types::{PeerRole, SessionStatus};
use tierlink_core::{Config, SessionError};
use tierlink_peer::{
    CrdtNetworkAdapter, CreateRoomOptions, MemoryNetwork, NetworkEvent, PeerSession,
    PeerSessionOptions, RepoMessage, SessionEvent,
};
use tierlink_signal::{MemoryStore, SignalingStore};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> Config {
    let mut config = Config::default();
    config.session.answer_poll_ms = 10;
    config.session.candidate_poll_ms = 10;
    config.session.offer_poll_interval_ms = 10;
    config.session.offer_poll_attempts = 50;
    config.transfer.inter_chunk_delay_ms = 1;
    config
}

struct Pair {
    network: Arc<MemoryNetwork>,
    store: Arc<MemoryStore>,
    host: PeerSession,
    client: PeerSession,
}

fn pair() -> Pair {
    pair_with(MemoryNetwork::new(), fast_config())
}

fn pair_with(network: MemoryNetwork, config: Config) -> Pair {
    let network = Arc::new(network);
    let store = Arc::new(MemoryStore::new());
    let session = |name: &str| {
        PeerSession::new(
            network.clone(),
            store.clone(),
            PeerSessionOptions {
                display_name: name.to_string(),
                capabilities: vec!["sync".into()],
                config: config.clone(),
            },
        )
    };
    let host = session("host");
    let client = session("client");
    Pair {
        network,
        store,
        host,
        client,
    }
}

async fn connect(pair: &Pair) -> String {
    let code = pair
        .host
        .create_room(CreateRoomOptions::default())
        .await
        .unwrap();
    pair.client.join_room(&code.to_string(), None).await.unwrap();

    pair.host.wait_connected(WAIT).await.unwrap();
    pair.client.wait_connected(WAIT).await.unwrap();
    code.short_code().to_string()
}

async fn next_matching<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_host_and_client_connect() {
    let pair = pair();
    let mut host_events = pair.host.subscribe();
    connect(&pair).await;

    assert!(pair.host.is_host());
    assert_eq!(pair.client.role(), Some(PeerRole::Client));

    let joined = next_matching(&mut host_events, |e| matches!(e, SessionEvent::PeerJoined(_))).await;
    match joined {
        SessionEvent::PeerJoined(peer) => {
            assert_eq!(peer.id, pair.client.local_id());
            assert_eq!(peer.name, "client");
            assert_eq!(peer.role, PeerRole::Client);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_gathering_still_connects() {
    let mut config = fast_config();
    config.session.gathering_timeout_ms = 20;
    config.session.connect_timeout_ms = 1;
    let pair = pair_with(
        MemoryNetwork::new().with_gathering_delay(Duration::from_secs(2)),
        config,
    );

    connect(&pair).await;
    assert_eq!(pair.host.status(), SessionStatus::Connected);
    assert_eq!(pair.client.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn test_unanswered_room_times_out() {
    let mut config = fast_config();
    config.session.answer_timeout_ms = 100;
    let pair = pair_with(MemoryNetwork::new(), config);
    let mut events = pair.host.subscribe();

    let code = pair
        .host
        .create_room(CreateRoomOptions::default())
        .await
        .unwrap();
    let error = next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    match error {
        SessionEvent::Error(e) => assert_eq!(e, SessionError::Timeout("answer".into())),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(pair.host.status(), SessionStatus::Failed);

    // The abandoned room is removed from the store
    timeout(WAIT, async {
        while pair.store.get_room(code.short_code()).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_sync_delivered_with_sender() {
    let pair = pair();
    let mut client_events = pair.client.subscribe();
    connect(&pair).await;

    assert!(pair.host.send_sync("b1", vec![1u8, 2, 3]));

    let event = next_matching(&mut client_events, |e| {
        matches!(e, SessionEvent::SyncReceived { .. })
    })
    .await;
    match event {
        SessionEvent::SyncReceived {
            sender_id,
            board_id,
            delta,
            sequence,
        } => {
            assert_eq!(sender_id, pair.host.local_id());
            assert_eq!(board_id, "b1");
            assert_eq!(delta, Bytes::from_static(&[1, 2, 3]));
            assert_eq!(sequence, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_image_reassembled_once() {
    let pair = pair();
    let mut host_events = pair.host.subscribe();
    connect(&pair).await;

    let image: Vec<u8> = (0..50_000).map(|i| (i % 251) as u8).collect();
    assert!(pair.client.send_image("img-1", image.clone()).await);

    let event = next_matching(&mut host_events, |e| {
        matches!(e, SessionEvent::ImageReceived { .. })
    })
    .await;
    match event {
        SessionEvent::ImageReceived {
            sender_id,
            transfer_id,
            data,
        } => {
            assert_eq!(sender_id, pair.client.local_id());
            assert_eq!(transfer_id, "img-1");
            assert_eq!(data.len(), 50_000);
            assert_eq!(data.as_ref(), image.as_slice());
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Nothing else completes for the same transfer
    pair.client.send_chat("b1", "done");
    next_matching(&mut host_events, |e| matches!(e, SessionEvent::Chat { .. })).await;
    while let Ok(event) = host_events.try_recv() {
        assert!(!matches!(event, SessionEvent::ImageReceived { .. }));
    }
}

#[tokio::test]
async fn test_sends_while_disconnected_are_noops() {
    let pair = pair();
    assert_eq!(pair.host.status(), SessionStatus::Disconnected);

    assert!(!pair.host.send_sync("b1", vec![1u8]));
    assert!(!pair.host.request_sync("b1"));
    assert!(!pair.host.send_full_document("b1", vec![1u8], None));
    assert!(!pair.host.send_chat("b1", "hello"));
    assert!(!pair.host.send_image("img", vec![0u8; 100]).await);
    assert!(!pair.host.request_image("img"));
    assert!(!pair.host.send_crdt("peer", vec![1u8]));
    assert_eq!(pair.network.frames_sent(), 0);
}

#[tokio::test]
async fn test_host_only_operations() {
    let pair = pair();

    // No room at all
    assert!(matches!(
        pair.host.kick_peer("anyone"),
        Err(SessionError::Unauthorized(_))
    ));
    assert!(matches!(
        pair.host.close_room().await,
        Err(SessionError::Unauthorized(_))
    ));

    connect(&pair).await;
    assert!(matches!(
        pair.client.kick_peer(pair.host.local_id()),
        Err(SessionError::Unauthorized(_))
    ));
    assert!(matches!(
        pair.client.close_room().await,
        Err(SessionError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_kicked_client_disconnects() {
    let pair = pair();
    let mut client_events = pair.client.subscribe();
    connect(&pair).await;

    // Make sure the host knows the client before kicking it
    timeout(WAIT, async {
        while pair.host.peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    pair.host.kick_peer(pair.client.local_id()).unwrap();
    next_matching(&mut client_events, |e| matches!(e, SessionEvent::Kicked)).await;
    assert_eq!(pair.client.status(), SessionStatus::Disconnected);
    assert!(pair.client.peers().is_empty());
}

#[tokio::test]
async fn test_close_room_notifies_client() {
    let pair = pair();
    let mut client_events = pair.client.subscribe();
    let code = connect(&pair).await;

    // Wait until the host's join has reached the client
    next_matching(&mut client_events, |e| matches!(e, SessionEvent::PeerJoined(_))).await;

    pair.host.close_room().await.unwrap();
    next_matching(&mut client_events, |e| matches!(e, SessionEvent::RoomClosed)).await;

    assert_eq!(pair.host.status(), SessionStatus::Disconnected);
    assert_eq!(pair.client.status(), SessionStatus::Disconnected);
    assert!(pair.store.get_room(&code).await.unwrap().is_none());
}

#[tokio::test]
async fn test_leave_resets_session_for_reuse() {
    let pair = pair();
    connect(&pair).await;
    pair.host.send_sync("b1", vec![1u8]);

    pair.client.leave_room().await;
    assert_eq!(pair.client.status(), SessionStatus::Disconnected);
    assert!(pair.client.room_code().is_none());

    // The host sees the channel close and resets as well
    let mut status = pair.host.watch_status();
    timeout(WAIT, status.wait_for(|s| *s == SessionStatus::Disconnected))
        .await
        .unwrap()
        .unwrap();

    // A fresh room starts sequences from 1 again
    let mut client_events = pair.client.subscribe();
    connect(&pair).await;
    pair.host.send_sync("b1", vec![9u8]);
    let event = next_matching(&mut client_events, |e| {
        matches!(e, SessionEvent::SyncReceived { .. })
    })
    .await;
    assert!(matches!(event, SessionEvent::SyncReceived { sequence: 1, .. }));
}

#[tokio::test]
async fn test_join_unknown_room_fails() {
    let pair = pair();
    let mut events = pair.client.subscribe();

    let err = pair.client.join_room("TIER-ZZZZZZ", None).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    assert_eq!(pair.client.status(), SessionStatus::Failed);
    next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
}

#[tokio::test]
async fn test_third_peer_rejected() {
    let pair = pair();
    let code = pair
        .host
        .create_room(CreateRoomOptions::default())
        .await
        .unwrap();
    pair.client.join_room(&code.to_string(), None).await.unwrap();

    let third = PeerSession::new(
        pair.network.clone(),
        pair.store.clone(),
        PeerSessionOptions {
            config: fast_config(),
            ..Default::default()
        },
    );
    let err = third.join_room(&code.to_string(), None).await.unwrap_err();
    assert!(matches!(err, SessionError::RoomFull(_)));
}

#[tokio::test]
async fn test_retry_after_failed_open() {
    let pair = pair();
    pair.network.fail_next_opens(1);

    let err = pair
        .host
        .create_room(CreateRoomOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
    assert_eq!(pair.host.status(), SessionStatus::Failed);

    let code = pair.host.retry().await.unwrap();
    tokio_test::assert_ok!(pair.client.join_room(&code.to_string(), None).await);
    pair.host.wait_connected(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_document_url_travels_in_code() {
    let pair = pair();
    let code = pair
        .host
        .create_room(CreateRoomOptions {
            document_url: Some("https://boards.example/b/42".into()),
            password: None,
        })
        .await
        .unwrap();

    let joined = pair.client.join_room(&code.to_string(), None).await.unwrap();
    assert_eq!(
        joined.document_url.as_deref(),
        Some("https://boards.example/b/42")
    );
    assert_eq!(joined.host_id, pair.host.local_id());
}

#[tokio::test]
async fn test_adapter_routes_envelopes() {
    let pair = pair();
    connect(&pair).await;

    // Both sides have seen each other's join
    timeout(WAIT, async {
        while pair.host.peers().is_empty() || pair.client.peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let host_adapter = CrdtNetworkAdapter::new(pair.host.clone());
    let client_adapter = CrdtNetworkAdapter::new(pair.client.clone());
    let mut host_net = host_adapter.connect(pair.host.local_id());
    let _client_net = client_adapter.connect(pair.client.local_id());

    // Late attach replays the known peer, then reports ready
    assert_eq!(
        host_net.recv().await,
        Some(NetworkEvent::PeerCandidate {
            peer_id: pair.client.local_id().to_string(),
            peer_name: "client".into(),
        })
    );
    assert_eq!(host_net.recv().await, Some(NetworkEvent::Ready));
    assert!(host_adapter.is_ready());

    // Addressed elsewhere: dropped by the receiving adapter
    assert!(client_adapter.send(RepoMessage {
        sender_id: pair.client.local_id().to_string(),
        target_id: "somebody-else".into(),
        data: Bytes::from_static(b"skip"),
    }));
    assert!(client_adapter.send(RepoMessage {
        sender_id: pair.client.local_id().to_string(),
        target_id: pair.host.local_id().to_string(),
        data: Bytes::from_static(b"change"),
    }));

    let delivered = timeout(WAIT, host_net.recv()).await.unwrap();
    assert_eq!(
        delivered,
        Some(NetworkEvent::Message(RepoMessage {
            sender_id: pair.client.local_id().to_string(),
            target_id: pair.host.local_id().to_string(),
            data: Bytes::from_static(b"change"),
        }))
    );

    pair.client.leave_room().await;
    let gone = timeout(WAIT, host_net.recv()).await.unwrap();
    assert_eq!(
        gone,
        Some(NetworkEvent::PeerDisconnected {
            peer_id: pair.client.local_id().to_string(),
        })
    );
}
