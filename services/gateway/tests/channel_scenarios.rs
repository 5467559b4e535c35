// End-to-end channel scenarios against an in-process hub: the same paths the
// WebSocket session and the broadcast endpoint drive, asserted at the wire
// frame level.
use async_trait::async_trait;
use serde_json::{Value, json};
use sluice_auth::{AuthResult, Claims, TopicAuthorizer};
use sluice_common::TenantQuotas;
use sluice_common::ids::SessionRef;
use sluice_hub::{
    BroadcastRequest, ChannelHub, HubConfig, SessionReceiver, SubscribeRequest, session_channel,
};
use sluice_wire::JoinConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct AllowAll;

#[async_trait]
impl TopicAuthorizer for AllowAll {
    async fn can_read(&self, _: &str, _: &str, _: &Claims) -> AuthResult<bool> {
        Ok(true)
    }
    async fn can_write(&self, _: &str, _: &str, _: &Claims) -> AuthResult<bool> {
        Ok(true)
    }
}

struct DenyAll;

#[async_trait]
impl TopicAuthorizer for DenyAll {
    async fn can_read(&self, _: &str, _: &str, _: &Claims) -> AuthResult<bool> {
        Ok(false)
    }
    async fn can_write(&self, _: &str, _: &str, _: &Claims) -> AuthResult<bool> {
        Ok(false)
    }
}

fn hub(authorizer: Arc<dyn TopicAuthorizer>) -> ChannelHub {
    ChannelHub::new(
        HubConfig {
            shard_count: 4,
            queue_capacity: 64,
            queue_max_bytes: 256 * 1024,
            force_private: false,
        },
        authorizer,
    )
}

fn anon_claims() -> Arc<Claims> {
    Arc::new(Claims::from_raw(
        json!({"role": "anon", "exp": 2_000_000_000})
            .as_object()
            .cloned()
            .unwrap(),
    ))
}

async fn join(
    hub: &ChannelHub,
    topic: &str,
    config: JoinConfig,
) -> (sluice_hub::SessionHandle, SessionReceiver) {
    let (handle, receiver) = session_channel(SessionRef::new(), 64, 256 * 1024);
    hub.subscribe(SubscribeRequest {
        tenant: "acme".into(),
        quotas: TenantQuotas::default(),
        topic: topic.into(),
        session: handle.clone(),
        config,
        claims: Some(anon_claims()),
        channels_opened: 0,
    })
    .await
    .expect("join");
    (handle, receiver)
}

async fn next_frame(receiver: &mut SessionReceiver) -> Value {
    let text = timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open");
    serde_json::from_str(&text).expect("json frame")
}

// A client joining with broadcast.self receives its own message.
#[tokio::test]
async fn self_broadcast_round_trips() {
    let hub = hub(Arc::new(AllowAll));
    let mut config = JoinConfig::default();
    config.broadcast.self_send = true;
    let (handle, mut receiver) = join(&hub, "topic:X", config).await;

    hub.broadcast(BroadcastRequest {
        tenant: "acme".into(),
        quotas: TenantQuotas::default(),
        topic: "topic:X".into(),
        event: "E".into(),
        payload: json!({"m": "v"}),
        sender: Some(handle.session()),
        claims: Some(anon_claims()),
        assume_private: false,
    })
    .await
    .expect("broadcast")
    .expect("delivered");

    let frame = next_frame(&mut receiver).await;
    assert_eq!(frame["event"], "broadcast");
    assert_eq!(frame["payload"]["event"], "E");
    assert_eq!(frame["payload"]["payload"]["m"], "v");
}

// Two subscribers each receive exactly one copy of an anonymous (HTTP-style)
// publish.
#[tokio::test]
async fn http_fan_in_reaches_all_subscribers() {
    let hub = hub(Arc::new(AllowAll));
    let (_a, mut rx_a) = join(&hub, "topic:Y", JoinConfig::default()).await;
    let (_b, mut rx_b) = join(&hub, "topic:Y", JoinConfig::default()).await;

    let outcome = hub
        .broadcast(BroadcastRequest {
            tenant: "acme".into(),
            quotas: TenantQuotas::default(),
            topic: "topic:Y".into(),
            event: "E".into(),
            payload: json!({"m": "v"}),
            sender: None,
            claims: None,
            assume_private: false,
        })
        .await
        .expect("broadcast")
        .expect("delivered");
    assert_eq!(outcome.delivered, 2);

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = next_frame(rx).await;
        assert_eq!(frame["payload"]["payload"]["m"], "v");
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "exactly one delivery per subscriber"
        );
    }
}

// Joining a private topic with an unauthorized token fails with the exact
// client-facing reason.
#[tokio::test]
async fn private_topic_rejection_reason() {
    let hub = hub(Arc::new(DenyAll));
    let (handle, _receiver) = session_channel(SessionRef::new(), 64, 256 * 1024);
    let mut config = JoinConfig::default();
    config.private = true;
    let err = hub
        .subscribe(SubscribeRequest {
            tenant: "acme".into(),
            quotas: TenantQuotas::default(),
            topic: "topic:Z".into(),
            session: handle,
            config,
            claims: Some(anon_claims()),
            channels_opened: 0,
        })
        .await
        .expect_err("denied");
    assert_eq!(
        err.to_string(),
        "You do not have permissions to read from this Channel topic: topic:Z"
    );
}

// Presence monotonicity: once tracked and not untracked, the key survives in
// every later subscriber's state.
#[tokio::test]
async fn presence_tracks_are_monotonic_until_untrack() {
    let hub = hub(Arc::new(AllowAll));
    let (tracker, mut tracker_rx) = join(&hub, "room:1", JoinConfig::default()).await;
    hub.track("acme", "room:1", tracker.session(), json!({"s": 1}))
        .await
        .expect("track");
    let diff = next_frame(&mut tracker_rx).await;
    assert_eq!(diff["event"], "presence_diff");

    // A later joiner observes the tracked meta in its initial state.
    let hub_ref = &hub;
    let (_later, _rx) = join(hub_ref, "room:1", JoinConfig::default()).await;
    let snapshots = hub.presence_snapshots("acme").await;
    let (_, state) = snapshots
        .iter()
        .find(|(topic, _)| topic == "room:1")
        .expect("tracked topic");
    let key = tracker.session().to_string();
    assert_eq!(state[&key]["metas"][0]["s"], 1);
}

// Per-topic ordering: frames arrive in dispatch order.
#[tokio::test]
async fn dispatch_order_is_preserved() {
    let hub = hub(Arc::new(AllowAll));
    let (_s, mut receiver) = join(&hub, "ordered", JoinConfig::default()).await;
    for n in 0..20 {
        hub.broadcast(BroadcastRequest {
            tenant: "acme".into(),
            quotas: TenantQuotas::default(),
            topic: "ordered".into(),
            event: "seq".into(),
            payload: json!({"n": n}),
            sender: None,
            claims: None,
            assume_private: false,
        })
        .await
        .expect("broadcast");
    }
    for n in 0..20 {
        let frame = next_frame(&mut receiver).await;
        assert_eq!(frame["payload"]["payload"]["n"], n);
    }
}
