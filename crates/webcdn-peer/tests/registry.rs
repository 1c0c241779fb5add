//! Registry integration tests over the in-memory network
//!
//! Two or more registries share a MockRelay and MockNetwork, so the whole
//! offer/answer/candidate exchange and the chunked transfer run for real.

use bytes::Bytes;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use webcdn_config::PeerConfig;
use webcdn_peer::mock::{MockNetwork, MockRelay};
use webcdn_peer::{
    ChannelState, IceCandidate, NodeContext, PeerId, PeerRegistry, PeerState, RelayEnvelope,
    RelayKind, ResourceId, SignalingPayload, TransferMessage,
};

struct Node {
    id: PeerId,
    registry: PeerRegistry,
}

async fn spawn_node(relay: &Arc<MockRelay>, network: &MockNetwork, id: &str, config: &PeerConfig) -> Node {
    let id = PeerId::from(id);
    let (signal, inbound) = relay.join(id.clone()).await;
    let registry = PeerRegistry::new(
        NodeContext::new(id.clone()),
        config,
        signal,
        network.factory(&id),
    );
    registry.attach(inbound);
    Node { id, registry }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(Duration::from_secs(3), async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

async fn fetch(node: &Node, from: &Node, resource_id: &ResourceId) -> Result<Bytes, oneshot::error::RecvError> {
    let (tx, rx) = oneshot::channel();
    node.registry.fetch(&from.id, resource_id, tx);
    timeout(Duration::from_secs(3), rx)
        .await
        .expect("fetch timed out")
}

fn content(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>())
}

fn parse(frames: &[Bytes]) -> Vec<TransferMessage> {
    frames
        .iter()
        .map(|f| TransferMessage::parse(f).unwrap())
        .collect()
}

#[tokio::test]
async fn test_fetch_streams_cached_resource() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let data = content(60_000);
    let rid = ResourceId::from("a1b2c3");
    holder.registry.publish(&rid, data.clone(), "a1b2c3".to_string());

    let received = fetch(&requester, &holder, &rid).await.unwrap();
    assert_eq!(received, data);

    // One request out, three chunks plus the end sentinel back
    let requests = parse(&network.channel(&requester.id, &holder.id).await.unwrap().sent().await);
    assert_eq!(requests.len(), 1);
    assert!(matches!(requests[0], TransferMessage::FetchRequest { .. }));

    let responses = parse(&network.channel(&holder.id, &requester.id).await.unwrap().sent().await);
    assert_eq!(responses.len(), 4);
    assert!(matches!(responses[3], TransferMessage::FetchEnd { .. }));

    // The end sentinel drops the partial transfer
    assert_eq!(requester.registry.pending_count().await, 0);
    assert!(requester.registry.context().stats.snapshot().bytes_received >= 60_000);
}

#[tokio::test]
async fn test_repeat_fetch_is_byte_identical_and_reuses_peer() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let data = content(51_200);
    let rid = ResourceId::from("feed");
    holder.registry.publish(&rid, data.clone(), "feed".to_string());

    let first = fetch(&requester, &holder, &rid).await.unwrap();
    let second = fetch(&requester, &holder, &rid).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 51_200);
    assert_eq!(requester.registry.peer_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_peer_and_flush_in_order() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let ids: Vec<ResourceId> = ["r1", "r2", "r3"].iter().map(|s| ResourceId::from(*s)).collect();
    for (i, rid) in ids.iter().enumerate() {
        holder.registry.publish(rid, content(1000 * (i + 1)), rid.to_string());
    }

    // All three are submitted before the channel can possibly be open
    let mut receivers = Vec::new();
    for rid in &ids {
        let (tx, rx) = oneshot::channel();
        requester.registry.fetch(&holder.id, rid, tx);
        receivers.push(rx);
    }
    for (i, rx) in receivers.into_iter().enumerate() {
        let data = timeout(Duration::from_secs(3), rx).await.unwrap().unwrap();
        assert_eq!(data.len(), 1000 * (i + 1));
    }

    assert_eq!(requester.registry.peer_count().await, 1);

    let requested: Vec<String> = parse(&network.channel(&requester.id, &holder.id).await.unwrap().sent().await)
        .iter()
        .map(|m| m.resource_id().to_string())
        .collect();
    assert_eq!(requested, vec!["r1", "r2", "r3"]);
}

#[tokio::test]
async fn test_missing_resource_gets_no_response() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let (tx, rx) = oneshot::channel();
    requester.registry.fetch(&holder.id, &ResourceId::from("nothere"), tx);
    assert!(timeout(Duration::from_millis(300), rx).await.is_err());

    let holder_channel = network.channel(&holder.id, &requester.id).await.unwrap();
    assert_eq!(holder_channel.sent_count().await, 0);
}

#[tokio::test]
async fn test_fetch_on_closing_channel_is_silent() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let rid = ResourceId::from("warm");
    holder.registry.publish(&rid, content(10), "warm".to_string());
    fetch(&requester, &holder, &rid).await.unwrap();

    let channel = network.channel(&requester.id, &holder.id).await.unwrap();
    let before = channel.sent_count().await;
    channel.set_state(ChannelState::Closing);

    let (tx, rx) = oneshot::channel();
    requester.registry.fetch(&holder.id, &rid, tx);
    assert!(timeout(Duration::from_millis(200), rx).await.is_err());
    assert_eq!(channel.sent_count().await, before);
}

#[tokio::test]
async fn test_failed_negotiation_is_replaced_on_next_fetch() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let rid = ResourceId::from("retry");
    holder.registry.publish(&rid, content(100), "retry".to_string());

    network.fail_negotiation(&requester.id).await;
    // Callback is dropped when the peer fails, so the caller can fall back early
    assert!(fetch(&requester, &holder, &rid).await.is_err());
    eventually("failed peer removal", || async {
        requester.registry.peer_count().await == 0
    })
    .await;

    network.heal(&requester.id).await;
    let data = fetch(&requester, &holder, &rid).await.unwrap();
    assert_eq!(data.len(), 100);
    assert!(matches!(
        requester.registry.peer_state(&holder.id).await,
        Some(PeerState::Connected) | Some(PeerState::Transferring)
    ));
}

#[tokio::test]
async fn test_candidates_before_offer_are_applied_in_order() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let node = spawn_node(&relay, &network, "bob", &config).await;
    let remote = PeerId::from("zed");

    let candidate = |n: u32| IceCandidate {
        candidate: format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    };
    let relay_from_remote = |payload: &SignalingPayload| {
        RelayEnvelope::signaling(remote.clone(), node.id.clone(), payload).unwrap()
    };

    node.registry
        .route_relay(relay_from_remote(&SignalingPayload::Candidate(candidate(1))));
    node.registry
        .route_relay(relay_from_remote(&SignalingPayload::Candidate(candidate(2))));
    node.registry.route_relay(relay_from_remote(&SignalingPayload::Offer {
        sdp: "mock-offer zed->bob #99".to_string(),
    }));

    eventually("buffered candidates applied", || async {
        network.applied_candidates(&node.id, &remote).await.len() == 2
    })
    .await;
    assert_eq!(
        network.applied_candidates(&node.id, &remote).await,
        vec![candidate(1), candidate(2)]
    );

    // The offer was answered back through the relay
    eventually("answer relayed", || async {
        relay.sent_of(RelayKind::Relay).await.iter().any(|env| {
            env.from.as_ref() == Some(&node.id)
                && env.to.as_ref() == Some(&remote)
                && env.data["type"] == "answer"
        })
    })
    .await;
    assert_eq!(
        node.registry.peer_state(&remote).await,
        Some(PeerState::Negotiating)
    );
}

#[tokio::test]
async fn test_simultaneous_offers_resolve() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let alice = spawn_node(&relay, &network, "alice", &config).await;
    let bob = spawn_node(&relay, &network, "bob", &config).await;

    let from_alice = ResourceId::from("aa");
    let from_bob = ResourceId::from("bb");
    alice.registry.publish(&from_alice, content(30_000), "aa".to_string());
    bob.registry.publish(&from_bob, content(40_000), "bb".to_string());

    let (tx_a, rx_a) = oneshot::channel();
    let (tx_b, rx_b) = oneshot::channel();
    alice.registry.fetch(&bob.id, &from_bob, tx_a);
    bob.registry.fetch(&alice.id, &from_alice, tx_b);

    let got_a = timeout(Duration::from_secs(3), rx_a).await.unwrap().unwrap();
    let got_b = timeout(Duration::from_secs(3), rx_b).await.unwrap().unwrap();
    assert_eq!(got_a.len(), 40_000);
    assert_eq!(got_b.len(), 30_000);
    assert_eq!(alice.registry.peer_count().await, 1);
    assert_eq!(bob.registry.peer_count().await, 1);
}

#[tokio::test]
async fn test_finish_download_caches_and_announces() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let node = spawn_node(&relay, &network, "node", &PeerConfig::default()).await;

    let rid = ResourceId::from("c0ffee");
    let (tx, rx) = oneshot::channel();
    node.registry
        .finish_download(&rid, content(1234), "c0ffee".to_string(), move |bytes| {
            let _ = tx.send(bytes);
        });

    let delivered = timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    assert_eq!(delivered.len(), 1234);

    let cached = node.registry.cached(&rid).await.unwrap();
    assert_eq!(cached.content, delivered);
    assert_eq!(cached.content_hash, "c0ffee");

    let updates = relay.sent_of(RelayKind::Update).await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].data, json!([{"hash": "c0ffee", "size": 1234}]));
    assert!(updates[0].to.is_none());
}

#[tokio::test]
async fn test_mismatch_marks_peer_untrusted_for_that_hash() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let node = spawn_node(&relay, &network, "node", &PeerConfig::default()).await;
    let liar = PeerId::from("liar");
    let rid = ResourceId::from("abcd");

    assert!(node.registry.is_trusted(&liar, &rid).await);
    node.registry.report_mismatch(&liar, &rid);
    assert!(!node.registry.is_trusted(&liar, &rid).await);
    assert!(node.registry.is_trusted(&liar, &ResourceId::from("other")).await);
}

#[tokio::test]
async fn test_upload_report_reaches_coordinator() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let node = spawn_node(&relay, &network, "node", &PeerConfig::default()).await;

    node.registry
        .report_upload(&PeerId::from("seeder"), &ResourceId::from("abcd"), 4096);

    eventually("upload_ratio sent", || async {
        !relay.sent_of(RelayKind::UploadRatio).await.is_empty()
    })
    .await;
    let reports = relay.sent_of(RelayKind::UploadRatio).await;
    assert_eq!(
        reports[0].data,
        json!({"from": "seeder", "to": "node", "hash": "abcd", "size": 4096})
    );
}

#[tokio::test]
async fn test_stalled_transfer_is_evicted() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig {
        pending_ttl_ms: 200,
        ..PeerConfig::default()
    };
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let warm = ResourceId::from("warm");
    let big = ResourceId::from("big");
    holder.registry.publish(&warm, content(10), "warm".to_string());
    holder
        .registry
        .publish(&big, content(config.chunk_size * 10), "big".to_string());
    fetch(&requester, &holder, &warm).await.unwrap();

    // Holder's buffer never drains: five chunks go out, then nothing
    let holder_channel = network.channel(&holder.id, &requester.id).await.unwrap();
    holder_channel.accumulate_buffered(true);

    let (tx, rx) = oneshot::channel();
    requester.registry.fetch(&holder.id, &big, tx);
    let result = timeout(Duration::from_secs(3), rx).await.unwrap();
    assert!(result.is_err());

    assert_eq!(requester.registry.pending_count().await, 0);
    assert_eq!(
        requester.registry.context().stats.snapshot().evicted_transfers,
        1
    );
    // Warmup end sentinel plus five chunks of the stalled resource
    assert_eq!(holder_channel.sent_count().await, 2 + 5);
}

#[tokio::test]
async fn test_shutdown_says_bye() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let rid = ResourceId::from("bye");
    holder.registry.publish(&rid, content(10), "bye".to_string());
    fetch(&requester, &holder, &rid).await.unwrap();
    assert_eq!(requester.registry.peer_count().await, 1);

    holder.registry.shutdown().await;

    eventually("requester drops closed peer", || async {
        requester.registry.peer_count().await == 0
    })
    .await;
    let byes = relay.sent_of(RelayKind::Relay).await;
    assert!(byes
        .iter()
        .any(|env| env.from.as_ref() == Some(&holder.id) && env.data["type"] == "bye"));
}

#[tokio::test]
async fn test_stalled_peer_does_not_block_another_holder() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig::default();
    let slow = spawn_node(&relay, &network, "slow", &config).await;
    let fast = spawn_node(&relay, &network, "fast", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let warm = ResourceId::from("warm");
    let big = ResourceId::from("big");
    let data = content(config.chunk_size * 10);
    slow.registry.publish(&warm, content(10), "warm".to_string());
    slow.registry.publish(&big, data.clone(), "big".to_string());
    fast.registry.publish(&big, data.clone(), "big".to_string());
    fetch(&requester, &slow, &warm).await.unwrap();

    // Slow holder stalls after five chunks of the big resource
    let slow_channel = network.channel(&slow.id, &requester.id).await.unwrap();
    slow_channel.accumulate_buffered(true);
    let (tx, rx) = oneshot::channel();
    requester.registry.fetch(&slow.id, &big, tx);
    eventually("slow holder stalls", || async {
        slow_channel.sent_count().await == 2 + 5
    })
    .await;
    // Caller gives up long before the pending ttl
    assert!(timeout(Duration::from_millis(300), rx).await.is_err());

    let received = fetch(&requester, &fast, &big).await.unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_unanswered_fetch_is_forgotten() {
    let relay = MockRelay::new();
    let network = MockNetwork::new();
    let config = PeerConfig {
        pending_ttl_ms: 200,
        ..PeerConfig::default()
    };
    let holder = spawn_node(&relay, &network, "holder", &config).await;
    let requester = spawn_node(&relay, &network, "requester", &config).await;

    let warm = ResourceId::from("warm");
    holder.registry.publish(&warm, content(10), "warm".to_string());
    fetch(&requester, &holder, &warm).await.unwrap();

    let (tx, rx) = oneshot::channel();
    requester
        .registry
        .fetch(&holder.id, &ResourceId::from("nothere"), tx);
    let result = timeout(Duration::from_secs(3), rx).await.unwrap();
    assert!(result.is_err());

    eventually("peer idle again", || async {
        requester.registry.peer_state(&holder.id).await == Some(PeerState::Connected)
    })
    .await;
    assert_eq!(requester.registry.peer_count().await, 1);
    assert_eq!(
        requester.registry.context().stats.snapshot().evicted_transfers,
        0
    );
}
