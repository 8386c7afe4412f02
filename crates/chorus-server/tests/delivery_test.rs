//! End-to-end delivery scenarios driven through `ServerDriver`.
//!
//! These tests exercise the full event-to-action path: handshake and
//! credential verification, subscription authorization, message posting
//! with fan-out snapshots, resync pulls, and notification delivery to
//! multi-device user channels.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chorus_core::{auth, auth::TokenVerifier, env::Environment};
use chorus_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::{
        ErrorPayload,
        notify::{Notification, NotificationKind},
        room::{ChatMessage, PostMessage, SyncRequest},
        session::Hello,
    },
};
use chorus_server::{
    DriverConfig, ServerAction, ServerDriver, ServerEvent,
    stores::{MembershipStore, MemoryStore, MessageLog, NotificationStore, StoreError},
};

const SECRET: &[u8] = b"delivery-test-secret";

#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_ms(&self) -> u64 {
        u64::try_from(
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis(),
        )
        .unwrap_or(u64::MAX)
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn driver_with_store(
    store: MemoryStore,
    allow_guest: bool,
) -> ServerDriver<TestEnv, MemoryStore> {
    let verifier = TokenVerifier::new(SECRET, allow_guest);
    ServerDriver::new(TestEnv, store, verifier, DriverConfig::default())
}

/// Accept a connection and complete the Hello handshake for `user_id`.
fn connect_and_auth(
    driver: &mut ServerDriver<TestEnv, MemoryStore>,
    session_id: u64,
    user_id: u64,
) {
    driver.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();

    let token = auth::sign_token(SECRET, user_id, unix_now() + 3600).unwrap();
    let hello = Payload::Hello(Hello { version: FrameHeader::VERSION, credential: token });
    let frame = hello.into_frame(FrameHeader::new(Opcode::Hello)).unwrap();

    let actions = driver.process_event(ServerEvent::FrameReceived { session_id, frame }).unwrap();

    let reply = expect_send(&actions, session_id, Opcode::HelloReply);
    match Payload::from_frame(&reply).unwrap() {
        Payload::HelloReply(reply) => {
            assert_eq!(reply.user_id, user_id);
            assert_eq!(reply.session_id, session_id);
        },
        other => panic!("expected HelloReply, got {other:?}"),
    }
}

fn subscribe(driver: &mut ServerDriver<TestEnv, MemoryStore>, session_id: u64, room_id: u64) {
    let mut header = FrameHeader::new(Opcode::Subscribe);
    header.set_room_id(room_id);
    let frame = Payload::Subscribe.into_frame(header).unwrap();

    let actions = driver.process_event(ServerEvent::FrameReceived { session_id, frame }).unwrap();
    expect_send(&actions, session_id, Opcode::SubscribeAck);
    assert!(driver.is_subscribed(session_id, room_id));
}

fn post(
    driver: &mut ServerDriver<TestEnv, MemoryStore>,
    session_id: u64,
    room_id: u64,
    body: &str,
) -> Vec<ServerAction> {
    let mut header = FrameHeader::new(Opcode::PostMessage);
    header.set_room_id(room_id);
    let frame = Payload::PostMessage(PostMessage { body: body.to_string() })
        .into_frame(header)
        .unwrap();

    driver.process_event(ServerEvent::FrameReceived { session_id, frame }).unwrap()
}

/// Find the SendToSession action carrying the given opcode for a session.
fn expect_send(actions: &[ServerAction], session_id: u64, opcode: Opcode) -> Frame {
    actions
        .iter()
        .find_map(|action| match action {
            ServerAction::SendToSession { session_id: sid, frame }
                if *sid == session_id && frame.header.opcode_enum() == Some(opcode) =>
            {
                Some(frame.clone())
            },
            _ => None,
        })
        .unwrap_or_else(|| panic!("no SendToSession with {opcode:?} for session {session_id}"))
}

fn expect_error(actions: &[ServerAction], session_id: u64) -> ErrorPayload {
    let frame = expect_send(actions, session_id, Opcode::Error);
    match Payload::from_frame(&frame).unwrap() {
        Payload::Error(payload) => payload,
        other => panic!("expected Error payload, got {other:?}"),
    }
}

#[test]
fn posted_message_reaches_other_subscriber() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    store.add_member(7, 2).unwrap();
    let mut driver = driver_with_store(store, false);

    connect_and_auth(&mut driver, 10, 1);
    connect_and_auth(&mut driver, 20, 2);
    subscribe(&mut driver, 10, 7);
    subscribe(&mut driver, 20, 7);

    let actions = post(&mut driver, 10, 7, "hello room");

    // Poster gets a synchronous ack with the assigned id
    let ack = expect_send(&actions, 10, Opcode::MessageAck);
    let ack_message = match Payload::from_frame(&ack).unwrap() {
        Payload::MessageAck(message) => message,
        other => panic!("expected MessageAck, got {other:?}"),
    };
    assert_eq!(ack_message.message_id, 1);
    assert_eq!(ack_message.room_id, 7);
    assert_eq!(ack_message.author_id, 1);
    assert_eq!(ack_message.body, "hello room");

    // Fan-out targets the other subscriber, not the poster
    let broadcast = actions
        .iter()
        .find_map(|action| match action {
            ServerAction::Broadcast { targets, frame } => Some((targets.clone(), frame.clone())),
            _ => None,
        })
        .expect("expected a Broadcast action");

    assert_eq!(broadcast.0, vec![20]);
    assert_eq!(broadcast.1.header.opcode_enum(), Some(Opcode::MessageEvent));
    match Payload::from_frame(&broadcast.1).unwrap() {
        Payload::MessageEvent(message) => assert_eq!(message, ack_message),
        other => panic!("expected MessageEvent, got {other:?}"),
    }
}

#[test]
fn non_member_subscribe_is_forbidden() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    let mut driver = driver_with_store(store, false);

    connect_and_auth(&mut driver, 10, 99);

    let mut header = FrameHeader::new(Opcode::Subscribe);
    header.set_room_id(7);
    let frame = Payload::Subscribe.into_frame(header).unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 10, frame }).unwrap();

    let error = expect_error(&actions, 10);
    assert_eq!(error.code, ErrorPayload::FORBIDDEN);
    assert!(!driver.is_subscribed(10, 7));
}

#[test]
fn non_member_post_rejected_and_nothing_persisted() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    let mut driver = driver_with_store(store.clone(), false);

    connect_and_auth(&mut driver, 10, 99);

    let actions = post(&mut driver, 10, 7, "intruder message");
    let error = expect_error(&actions, 10);
    assert_eq!(error.code, ErrorPayload::FORBIDDEN);

    // No row was written and nothing fanned out
    assert_eq!(store.total_message_count(), 0);
    assert!(!actions.iter().any(|a| matches!(a, ServerAction::Broadcast { .. })));
}

#[test]
fn empty_body_is_invalid_argument() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    let mut driver = driver_with_store(store.clone(), false);

    connect_and_auth(&mut driver, 10, 1);

    let actions = post(&mut driver, 10, 7, "   ");
    let error = expect_error(&actions, 10);
    assert_eq!(error.code, ErrorPayload::INVALID_ARGUMENT);
    assert_eq!(store.total_message_count(), 0);
}

#[test]
fn operations_require_authentication() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    let mut driver = driver_with_store(store, false);

    // Accepted but never sent Hello
    driver.process_event(ServerEvent::ConnectionAccepted { session_id: 10 }).unwrap();

    let actions = post(&mut driver, 10, 7, "too early");
    let error = expect_error(&actions, 10);
    assert_eq!(error.code, ErrorPayload::UNAUTHENTICATED);
}

#[test]
fn bad_credential_is_rejected_and_closed() {
    let mut driver = driver_with_store(MemoryStore::new(), false);
    driver.process_event(ServerEvent::ConnectionAccepted { session_id: 10 }).unwrap();

    let hello = Payload::Hello(Hello {
        version: FrameHeader::VERSION,
        credential: "not a token".to_string(),
    });
    let frame = hello.into_frame(FrameHeader::new(Opcode::Hello)).unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 10, frame }).unwrap();

    let error = expect_error(&actions, 10);
    assert_eq!(error.code, ErrorPayload::AUTH_FAILED);
    assert!(actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { .. })));
}

#[test]
fn guest_sentinel_gated_by_config() {
    // Disabled: rejected
    let mut driver = driver_with_store(MemoryStore::new(), false);
    driver.process_event(ServerEvent::ConnectionAccepted { session_id: 10 }).unwrap();

    let hello = Payload::Hello(Hello {
        version: FrameHeader::VERSION,
        credential: auth::GUEST_SENTINEL.to_string(),
    });
    let frame = hello.into_frame(FrameHeader::new(Opcode::Hello)).unwrap();
    let actions = driver
        .process_event(ServerEvent::FrameReceived { session_id: 10, frame: frame.clone() })
        .unwrap();
    assert_eq!(expect_error(&actions, 10).code, ErrorPayload::AUTH_FAILED);

    // Enabled: binds the fixed guest identity
    let mut driver = driver_with_store(MemoryStore::new(), true);
    driver.process_event(ServerEvent::ConnectionAccepted { session_id: 10 }).unwrap();

    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 10, frame }).unwrap();
    let reply = expect_send(&actions, 10, Opcode::HelloReply);
    match Payload::from_frame(&reply).unwrap() {
        Payload::HelloReply(reply) => {
            assert_eq!(reply.user_id, auth::GUEST_USER_ID);
            assert!(reply.guest);
        },
        other => panic!("expected HelloReply, got {other:?}"),
    }
}

#[test]
fn offline_subscriber_catches_up_via_sync() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    store.add_member(7, 2).unwrap();
    let mut driver = driver_with_store(store, false);

    // User 1 posts while user 2 is offline
    connect_and_auth(&mut driver, 10, 1);
    subscribe(&mut driver, 10, 7);
    for i in 0..5 {
        post(&mut driver, 10, 7, &format!("msg {i}"));
    }

    // User 2 connects later; the subscribe ack carries the resync hint
    connect_and_auth(&mut driver, 20, 2);
    let mut header = FrameHeader::new(Opcode::Subscribe);
    header.set_room_id(7);
    let frame = Payload::Subscribe.into_frame(header).unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 20, frame }).unwrap();

    let ack = expect_send(&actions, 20, Opcode::SubscribeAck);
    match Payload::from_frame(&ack).unwrap() {
        Payload::SubscribeAck(ack) => assert_eq!(ack.latest_message_id, Some(5)),
        other => panic!("expected SubscribeAck, got {other:?}"),
    }

    // Pull the history in two pages
    let mut header = FrameHeader::new(Opcode::SyncRequest);
    header.set_room_id(7);
    let frame = Payload::SyncRequest(SyncRequest { from_message_id: 0, limit: 3 })
        .into_frame(header)
        .unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 20, frame }).unwrap();

    let response = expect_send(&actions, 20, Opcode::SyncResponse);
    let page = match Payload::from_frame(&response).unwrap() {
        Payload::SyncResponse(page) => page,
        other => panic!("expected SyncResponse, got {other:?}"),
    };
    assert_eq!(page.messages.len(), 3);
    assert!(page.has_more);
    assert_eq!(page.messages[0].message_id, 1);

    let mut header = FrameHeader::new(Opcode::SyncRequest);
    header.set_room_id(7);
    let frame = Payload::SyncRequest(SyncRequest { from_message_id: 3, limit: 100 })
        .into_frame(header)
        .unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 20, frame }).unwrap();

    let response = expect_send(&actions, 20, Opcode::SyncResponse);
    let page = match Payload::from_frame(&response).unwrap() {
        Payload::SyncResponse(page) => page,
        other => panic!("expected SyncResponse, got {other:?}"),
    };
    assert_eq!(page.messages.len(), 2);
    assert!(!page.has_more);
    assert_eq!(page.messages[1].message_id, 5);
}

#[test]
fn unsubscribe_is_idempotent_and_always_acked() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    let mut driver = driver_with_store(store, false);

    connect_and_auth(&mut driver, 10, 1);
    subscribe(&mut driver, 10, 7);

    for _ in 0..2 {
        let mut header = FrameHeader::new(Opcode::Unsubscribe);
        header.set_room_id(7);
        let frame = Payload::Unsubscribe.into_frame(header).unwrap();
        let actions =
            driver.process_event(ServerEvent::FrameReceived { session_id: 10, frame }).unwrap();
        expect_send(&actions, 10, Opcode::UnsubscribeAck);
    }

    assert!(!driver.is_subscribed(10, 7));
}

#[test]
fn connection_closed_twice_is_harmless() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    store.add_member(7, 2).unwrap();
    let mut driver = driver_with_store(store, false);

    connect_and_auth(&mut driver, 10, 1);
    connect_and_auth(&mut driver, 20, 2);
    subscribe(&mut driver, 10, 7);
    subscribe(&mut driver, 20, 7);

    let close = ServerEvent::ConnectionClosed { session_id: 10, reason: "test".to_string() };
    driver.process_event(close.clone()).unwrap();
    driver.process_event(close).unwrap();

    // The other session is untouched and still receives fan-out targeting
    assert!(driver.is_subscribed(20, 7));
    assert_eq!(driver.connection_count(), 1);

    let actions = post(&mut driver, 20, 7, "still here");
    expect_send(&actions, 20, Opcode::MessageAck);
}

#[test]
fn notification_reaches_every_device_and_persists() {
    let store = MemoryStore::new();
    let mut driver = driver_with_store(store.clone(), false);

    // User 2 is connected on two devices
    connect_and_auth(&mut driver, 20, 2);
    connect_and_auth(&mut driver, 21, 2);

    let actions = driver
        .notify(2, NotificationKind::JoinRequest { group_id: 7, requester_id: 3 })
        .unwrap();

    let (mut targets, frame) = actions
        .iter()
        .find_map(|action| match action {
            ServerAction::Broadcast { targets, frame } => Some((targets.clone(), frame.clone())),
            _ => None,
        })
        .expect("expected a Broadcast action");

    targets.sort_unstable();
    assert_eq!(targets, vec![20, 21]);
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::Notification));
    assert_eq!(frame.header.recipient_id(), 2);

    // Persisted row is readable through the pull path
    let rows = store.read_for(2, 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(matches!(
        rows[0].kind,
        NotificationKind::JoinRequest { group_id: 7, requester_id: 3 }
    ));
}

#[test]
fn notification_for_offline_user_only_persists() {
    let store = MemoryStore::new();
    let mut driver = driver_with_store(store.clone(), false);

    let actions =
        driver.notify(5, NotificationKind::Announcement { text: "maintenance".into() }).unwrap();

    assert!(actions.is_empty());
    assert_eq!(store.read_for(5, 10).unwrap().len(), 1);
}

#[test]
fn max_connections_admission_limit() {
    let store = MemoryStore::new();
    let verifier = TokenVerifier::new(SECRET, false);
    let config = DriverConfig { max_connections: 2, ..Default::default() };
    let mut driver = ServerDriver::new(TestEnv, store, verifier, config);

    driver.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();
    driver.process_event(ServerEvent::ConnectionAccepted { session_id: 2 }).unwrap();

    let actions = driver.process_event(ServerEvent::ConnectionAccepted { session_id: 3 }).unwrap();
    assert!(matches!(actions[0], ServerAction::CloseConnection { session_id: 3, .. }));
    assert_eq!(driver.connection_count(), 2);
}

/// Store wrapper that injects transient append failures.
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    fail_appends: Arc<AtomicBool>,
}

impl FlakyStore {
    fn new(inner: MemoryStore) -> Self {
        Self { inner, fail_appends: Arc::new(AtomicBool::new(false)) }
    }
}

impl MembershipStore for FlakyStore {
    fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, StoreError> {
        self.inner.is_member(room_id, user_id)
    }

    fn add_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError> {
        self.inner.add_member(room_id, user_id)
    }

    fn remove_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError> {
        self.inner.remove_member(room_id, user_id)
    }

    fn list_members(&self, room_id: u64) -> Result<Vec<u64>, StoreError> {
        self.inner.list_members(room_id)
    }
}

impl MessageLog for FlakyStore {
    fn append(
        &self,
        room_id: u64,
        author_id: u64,
        body: &str,
        created_at_ms: u64,
    ) -> Result<ChatMessage, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected failure".to_string()));
        }
        self.inner.append(room_id, author_id, body, created_at_ms)
    }

    fn read_from(
        &self,
        room_id: u64,
        from_message_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.inner.read_from(room_id, from_message_id, limit)
    }

    fn latest_message_id(&self, room_id: u64) -> Result<Option<u64>, StoreError> {
        self.inner.latest_message_id(room_id)
    }
}

impl NotificationStore for FlakyStore {
    fn append_notification(
        &self,
        recipient_id: u64,
        kind: NotificationKind,
        created_at_ms: u64,
    ) -> Result<Notification, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected failure".to_string()));
        }
        self.inner.append_notification(recipient_id, kind, created_at_ms)
    }

    fn read_for(&self, recipient_id: u64, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.inner.read_for(recipient_id, limit)
    }
}

#[test]
fn failed_persist_yields_retryable_error_and_no_fanout() {
    let memory = MemoryStore::new();
    memory.add_member(7, 1).unwrap();
    memory.add_member(7, 2).unwrap();

    let store = FlakyStore::new(memory.clone());
    let verifier = TokenVerifier::new(SECRET, false);
    let mut driver = ServerDriver::new(TestEnv, store.clone(), verifier, DriverConfig::default());

    for (session_id, user_id) in [(10, 1), (20, 2)] {
        driver.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();

        let token = auth::sign_token(SECRET, user_id, unix_now() + 3600).unwrap();
        let hello = Payload::Hello(Hello { version: FrameHeader::VERSION, credential: token });
        let frame = hello.into_frame(FrameHeader::new(Opcode::Hello)).unwrap();
        driver.process_event(ServerEvent::FrameReceived { session_id, frame }).unwrap();

        let mut header = FrameHeader::new(Opcode::Subscribe);
        header.set_room_id(7);
        let frame = Payload::Subscribe.into_frame(header).unwrap();
        driver.process_event(ServerEvent::FrameReceived { session_id, frame }).unwrap();
    }

    store.fail_appends.store(true, Ordering::SeqCst);

    let mut header = FrameHeader::new(Opcode::PostMessage);
    header.set_room_id(7);
    let frame = Payload::PostMessage(PostMessage { body: "doomed".to_string() })
        .into_frame(header)
        .unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 10, frame }).unwrap();

    // Sender is told to retry; nobody else hears anything
    let error = expect_error(&actions, 10);
    assert_eq!(error.code, ErrorPayload::STORE_UNAVAILABLE);
    assert!(error.retryable);
    assert!(!actions.iter().any(|a| matches!(a, ServerAction::Broadcast { .. })));
    assert_eq!(memory.total_message_count(), 0);

    // Store recovers; the retry goes through with the first id
    store.fail_appends.store(false, Ordering::SeqCst);

    let mut header = FrameHeader::new(Opcode::PostMessage);
    header.set_room_id(7);
    let frame = Payload::PostMessage(PostMessage { body: "retry".to_string() })
        .into_frame(header)
        .unwrap();
    let actions = driver.process_event(ServerEvent::FrameReceived { session_id: 10, frame }).unwrap();

    let ack = expect_send(&actions, 10, Opcode::MessageAck);
    match Payload::from_frame(&ack).unwrap() {
        Payload::MessageAck(message) => assert_eq!(message.message_id, 1),
        other => panic!("expected MessageAck, got {other:?}"),
    }
}

#[test]
fn membership_revocation_applies_to_live_subscriber() {
    let store = MemoryStore::new();
    store.add_member(7, 1).unwrap();
    let mut driver = driver_with_store(store.clone(), false);

    connect_and_auth(&mut driver, 10, 1);
    subscribe(&mut driver, 10, 7);
    post(&mut driver, 10, 7, "as a member");

    // Revoked out of band; the next post is checked fresh and refused
    store.remove_member(7, 1).unwrap();

    let actions = post(&mut driver, 10, 7, "after revocation");
    assert_eq!(expect_error(&actions, 10).code, ErrorPayload::FORBIDDEN);
    assert_eq!(store.total_message_count(), 1);
}
