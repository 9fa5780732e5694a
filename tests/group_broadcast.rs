//! Group messaging scenarios: broadcasts reach exactly the joined members,
//! and membership bookkeeping rejects double joins and absent leaves.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tangor::{BootstrapEntry, ChatMessage, Client, Config, Digest, Keypair, NodeId, PortRange};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

static PORT_BASE: AtomicU16 = AtomicU16::new(44400);

fn claim_block(len: u16) -> PortRange {
    let start = PORT_BASE.fetch_add(len, Ordering::SeqCst);
    PortRange {
        start,
        end: start + len - 1,
    }
}

fn config_for(block: PortRange) -> Config {
    Config {
        ports: block,
        bootstrap: vec![BootstrapEntry {
            host: "127.0.0.1".to_string(),
            ports: block,
        }],
    }
}

async fn chat_client(
    config: &Config,
) -> (Arc<Client>, Keypair, mpsc::UnboundedReceiver<(NodeId, ChatMessage)>) {
    let keypair = Keypair::generate();
    let client = Arc::new(Client::bind(&keypair, config.clone()).await.unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    client.handle_messages(move |src, msg| {
        let _ = tx.send((src, msg));
    });
    (client, keypair, rx)
}

#[tokio::test]
async fn group_broadcast_reaches_members_only() {
    let config = config_for(claim_block(8));

    let (c1, k1, mut rx1) = chat_client(&config).await;
    let (c2, _k2, mut rx2) = chat_client(&config).await;
    let (c3, k3, mut rx3) = chat_client(&config).await;
    let (c4, _k4, mut rx4) = chat_client(&config).await;
    let (c5, _k5, mut rx5) = chat_client(&config).await;

    let group_g = Digest::random();
    let group_other = Digest::random();

    c1.join(group_g).unwrap();
    c2.join(group_g).unwrap();
    c3.join(group_g).unwrap();
    c4.join(group_other).unwrap();
    c5.join(group_other).unwrap();

    for client in [&c1, &c2, &c3, &c4, &c5] {
        let client = Arc::clone(client);
        tokio::spawn(async move { client.run().await });
    }

    // Give the group tables a moment to converge through the join probes.
    sleep(Duration::from_secs(2)).await;

    c3.send_message(NodeId::group(group_g), ChatMessage { body: "msg".into() })
        .await
        .unwrap();

    for (name, rx) in [("peer1", &mut rx1), ("peer2", &mut rx2)] {
        let (src, msg) = timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("{name} missed the broadcast"))
            .expect("channel open");
        assert_eq!(src.digest, k3.digest(), "{name} saw the wrong source");
        assert_eq!(msg.body, "msg");
    }

    // Members of the other group and the sender itself stay silent.
    sleep(Duration::from_secs(2)).await;
    assert!(rx3.try_recv().is_err(), "sender must not self-deliver");
    assert!(rx4.try_recv().is_err(), "peer4 is not a member of G");
    assert!(rx5.try_recv().is_err(), "peer5 is not a member of G");

    // A member can address another member directly as well.
    c2.send_message(k1.node_id(), ChatMessage { body: "direct".into() })
        .await
        .unwrap();
    let (_, msg) = timeout(Duration::from_secs(30), rx1.recv())
        .await
        .expect("direct message within timeout")
        .expect("channel open");
    assert_eq!(msg.body, "direct");

    for client in [&c1, &c2, &c3, &c4, &c5] {
        client.close().await;
    }
}

#[tokio::test]
async fn join_and_leave_bookkeeping() {
    let config = config_for(claim_block(2));
    let keypair = Keypair::generate();
    let client = Client::bind(&keypair, config).await.unwrap();

    let group = Digest::random();
    client.join(group).unwrap();
    assert!(client.join(group).is_err(), "double join must be rejected");

    client.leave(group).unwrap();
    assert!(client.leave(group).is_err(), "absent leave must be rejected");

    // After a leave, joining again is fine.
    client.join(group).unwrap();
    client.close().await;
}
