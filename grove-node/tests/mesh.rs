//! End-to-end scenarios over loopback TLS: registration, query, gossip
//! replication, loop prevention, disconnect propagation, peer sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use grove_core::wire::MAX_FRAME_LEN;
use grove_core::{Identity, Message};
use grove_node::config::Config;
use grove_node::events::PeerEvent;
use grove_node::framing::{read_frame, write_frame};
use grove_node::leaf::Leaf;
use grove_node::tls;
use grove_node::ultrapeer::Ultrapeer;

const SETTLE_POLLS: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn test_config(siblings: Vec<String>) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        leaf_port: 0,
        gossip_port: Some(0),
        siblings,
        max_frame_len: MAX_FRAME_LEN,
    }
}

async fn start_ultrapeer(siblings: Vec<String>) -> Ultrapeer {
    let identity = Arc::new(Identity::generate("127.0.0.1").expect("identity"));
    Ultrapeer::start(identity, test_config(siblings))
        .await
        .expect("ultrapeer start")
}

fn new_identity() -> Arc<Identity> {
    Arc::new(Identity::generate("127.0.0.1").expect("identity"))
}

async fn wait_for_key(up: &Ultrapeer, key: &str, present: bool) -> bool {
    for _ in 0..SETTLE_POLLS {
        if up.registry_snapshot().await.contains_key(key) == present {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

async fn wait_for_links(up: &Ultrapeer, n: usize) -> bool {
    for _ in 0..SETTLE_POLLS {
        if up.link_count().await == n {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

fn count_found(rx: &mut broadcast::Receiver<PeerEvent>, key: &str) -> usize {
    let mut n = 0;
    while let Ok(ev) = rx.try_recv() {
        if let PeerEvent::Found(info) = ev {
            if info.public_key == key {
                n += 1;
            }
        }
    }
    n
}

#[tokio::test]
async fn register_query_and_disconnect() {
    let up = start_ultrapeer(vec![]).await;

    let target = new_identity();
    let target_key = target.public_key_pem().to_string();
    let registered = Leaf::connect(target.clone(), up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register target leaf");

    let mut querier = Leaf::connect(new_identity(), up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register querier leaf");

    let info = querier
        .query(&target_key)
        .await
        .expect("query")
        .expect("registered peer should be found");
    assert_eq!(info.public_key, target_key);
    assert_eq!(info.p2p_port, target.p2p_port());
    assert_eq!(info.ip, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());

    // Closing the owning connection removes the entry.
    drop(registered);
    let mut gone = false;
    for _ in 0..SETTLE_POLLS {
        if querier.query(&target_key).await.expect("query").is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert!(gone, "deregistration should make the query miss");

    up.shutdown().await;
}

#[tokio::test]
async fn query_for_unknown_key_is_a_miss_not_an_error() {
    let up = start_ultrapeer(vec![]).await;
    let mut leaf = Leaf::connect(new_identity(), up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register leaf");
    let miss = leaf.query("no such key").await.expect("query must not fail");
    assert!(miss.is_none());
    // The connection is still usable afterwards.
    assert!(leaf.query("still no such key").await.expect("query").is_none());
    up.shutdown().await;
}

#[tokio::test]
async fn invalid_registration_gets_failure_ack_and_close() {
    let up = start_ultrapeer(vec![]).await;

    let connector = tls::connector().expect("connector");
    let mut stream = tls::connect(&connector, up.leaf_addr())
        .await
        .expect("dial ultrapeer");

    // REGISTER_LEAF with no p2p_port.
    let msg = Message::RegisterLeaf {
        public_key: Some("K-broken".to_string()),
        p2p_port: None,
    };
    write_frame(&mut stream, &msg, MAX_FRAME_LEN).await.expect("send");

    let reply = read_frame(&mut stream, MAX_FRAME_LEN)
        .await
        .expect("read ack")
        .expect("ack before close");
    match reply {
        Message::RegisterAck {
            status: grove_core::AckStatus::Failure,
            reason,
        } => assert!(reason.is_some()),
        other => panic!("expected failure ack, got {}", other.kind()),
    }

    // The ultrapeer closes the connection after the failure ack.
    let next = read_frame(&mut stream, MAX_FRAME_LEN).await.expect("read eof");
    assert!(next.is_none());

    // And the registry is untouched.
    assert!(up.registry_snapshot().await.is_empty());

    up.shutdown().await;
}

#[tokio::test]
async fn unexpected_message_does_not_close_the_connection() {
    let up = start_ultrapeer(vec![]).await;

    let connector = tls::connector().expect("connector");
    let mut stream = tls::connect(&connector, up.leaf_addr())
        .await
        .expect("dial ultrapeer");

    // A PONG makes no sense on a leaf link; the ultrapeer must ignore it.
    write_frame(&mut stream, &Message::Pong { data: None }, MAX_FRAME_LEN)
        .await
        .expect("send pong");

    let id = new_identity();
    let register = Message::RegisterLeaf {
        public_key: Some(id.public_key_pem().to_string()),
        p2p_port: Some(serde_json::Value::from(id.p2p_port())),
    };
    write_frame(&mut stream, &register, MAX_FRAME_LEN)
        .await
        .expect("send register");

    let reply = read_frame(&mut stream, MAX_FRAME_LEN)
        .await
        .expect("read ack")
        .expect("connection must survive the pong");
    assert!(matches!(
        reply,
        Message::RegisterAck {
            status: grove_core::AckStatus::Success,
            ..
        }
    ));

    up.shutdown().await;
}

#[tokio::test]
async fn new_sibling_gets_full_sync_then_increments_without_echo() {
    // A holds K1 before B ever connects.
    let a = start_ultrapeer(vec![]).await;
    let k1_identity = new_identity();
    let k1 = k1_identity.public_key_pem().to_string();
    let _leaf1 = Leaf::connect(k1_identity, a.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register K1 at A");

    // B dials A and must receive the snapshot containing K1.
    let b = start_ultrapeer(vec![a.gossip_addr().expect("gossip enabled").to_string()]).await;
    assert!(wait_for_key(&b, &k1, true).await, "B should learn K1 from the full sync");

    // A new registration at B reaches A exactly once and is not echoed back.
    let mut a_events = a.subscribe();
    let k2_identity = new_identity();
    let k2 = k2_identity.public_key_pem().to_string();
    let _leaf2 = Leaf::connect(k2_identity, b.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register K2 at B");

    assert!(wait_for_key(&a, &k2, true).await, "A should learn K2 via gossip");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count_found(&mut a_events, &k2), 1, "A must apply K2 exactly once");

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn ring_applies_a_join_exactly_once_per_node() {
    // Triangle: B dials A; C dials A and B.
    let a = start_ultrapeer(vec![]).await;
    let b = start_ultrapeer(vec![a.gossip_addr().unwrap().to_string()]).await;
    let c = start_ultrapeer(vec![
        a.gossip_addr().unwrap().to_string(),
        b.gossip_addr().unwrap().to_string(),
    ])
    .await;

    assert!(wait_for_links(&a, 2).await, "A should hold two links");
    assert!(wait_for_links(&b, 2).await, "B should hold two links");
    assert!(wait_for_links(&c, 2).await, "C should hold two links");

    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    let identity = new_identity();
    let k1 = identity.public_key_pem().to_string();
    let _leaf = Leaf::connect(identity, a.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register K1 at A");

    assert!(wait_for_key(&b, &k1, true).await);
    assert!(wait_for_key(&c, &k1, true).await);

    // Let any echo that loop prevention failed to stop arrive, then count.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count_found(&mut b_events, &k1), 1, "B must apply the join once");
    assert_eq!(count_found(&mut c_events, &k1), 1, "C must apply the join once");

    c.shutdown().await;
    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn deregistration_propagates_to_siblings() {
    let a = start_ultrapeer(vec![]).await;
    let b = start_ultrapeer(vec![a.gossip_addr().unwrap().to_string()]).await;
    assert!(wait_for_links(&a, 1).await);

    let identity = new_identity();
    let k1 = identity.public_key_pem().to_string();
    let leaf = Leaf::connect(identity, a.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register K1 at A");
    assert!(wait_for_key(&b, &k1, true).await);

    drop(leaf);
    assert!(wait_for_key(&b, &k1, false).await, "B should drop K1 after gossip settles");

    // A query anywhere in the mesh now misses.
    let mut querier = Leaf::connect(new_identity(), b.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register querier at B");
    assert!(querier.query(&k1).await.expect("query").is_none());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn located_peers_talk_directly() {
    let up = start_ultrapeer(vec![]).await;

    let host_identity = new_identity();
    let host_key = host_identity.public_key_pem().to_string();
    let host_leaf = Leaf::connect(host_identity, up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register host leaf");
    let listener = host_leaf.listen("127.0.0.1").await.expect("bind derived port");

    let mut caller = Leaf::connect(new_identity(), up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register caller");
    let info = caller
        .query(&host_key)
        .await
        .expect("query")
        .expect("host should be registered");
    assert_eq!(info.p2p_port, listener.addr().port());

    let mut session = caller.connect_to_peer(&info).await.expect("direct session");
    write_frame(
        &mut session,
        &Message::Ping {
            data: Some("hello grove".to_string()),
        },
        MAX_FRAME_LEN,
    )
    .await
    .expect("ping");
    let reply = read_frame(&mut session, MAX_FRAME_LEN)
        .await
        .expect("read pong")
        .expect("session open");
    assert!(matches!(reply, Message::Pong { data: Some(d) } if d == "hello grove"));

    listener.shutdown().await;
    up.shutdown().await;
}

#[tokio::test]
async fn standalone_ultrapeer_runs_without_gossip() {
    let identity = Arc::new(Identity::generate("127.0.0.1").expect("identity"));
    let mut cfg = test_config(vec![]);
    cfg.gossip_port = None;
    let up = Ultrapeer::start(identity, cfg).await.expect("start");
    assert!(up.gossip_addr().is_none());

    let target = new_identity();
    let key = target.public_key_pem().to_string();
    let _leaf = Leaf::connect(target, up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register");
    let mut querier = Leaf::connect(new_identity(), up.leaf_addr(), MAX_FRAME_LEN)
        .await
        .expect("register querier");
    assert!(querier.query(&key).await.expect("query").is_some());

    up.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_listeners() {
    let up = start_ultrapeer(vec![]).await;
    let addr = up.leaf_addr();
    up.shutdown().await;
    assert!(
        Leaf::connect(new_identity(), addr, MAX_FRAME_LEN).await.is_err(),
        "a stopped node must not accept new leaves"
    );
}
