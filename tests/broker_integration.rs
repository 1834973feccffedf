//! End-to-end scenario: register over a real control socket, receive a
//! fanned-out transaction, then get evicted once the lease runs out.
//!
//! Grounded on `mem_etcd/tests/watch_test.rs`'s style of driving the
//! server's components directly and asserting on datagrams received on a
//! real socket, rather than mocking the transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use txstream_broker::codec::{decode_commands, decode_notice, encode_commands, Command, Notice};
use txstream_broker::registry::Registry;
use txstream_broker::types::{Mode, SubscriberName, Transaction};
use txstream_broker::upstream::{TransactionSource, VecSource};

async fn bind_udp() -> tokio::net::UdpSocket {
    tokio::net::UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap()
}

#[tokio::test]
async fn register_stream_and_evict_round_trip() {
    let registry = Arc::new(Registry::new());
    let control_socket = Arc::new(bind_udp().await);
    let control_addr = control_socket.local_addr().unwrap();

    let subscriber_socket = bind_udp().await;
    let subscriber_addr = subscriber_socket.local_addr().unwrap();
    let name = SubscriberName::new("watcher").unwrap();

    // Register directly against the control socket, as a real client would.
    let frame = encode_commands(&[Command::Register {
        name: name.clone(),
        mode: Mode::Head,
    }])
    .unwrap();
    subscriber_socket.send_to(&frame, control_addr).await.unwrap();

    let mut buf = vec![0u8; 512];
    let (n, from) = control_socket.recv_from(&mut buf).await.unwrap();
    let commands = decode_commands(&buf[..n]).unwrap();
    assert_eq!(
        commands,
        vec![Command::Register {
            name: name.clone(),
            mode: Mode::Head
        }]
    );
    registry
        .register(name.clone(), Mode::Head, from, 2)
        .unwrap();
    // An empty filter matches nothing (spec: opt-in fan-out), so the
    // subscriber must set its subs before any transaction reaches it.
    registry.set_subs(&name, vec!["transfer".into()]).unwrap();

    // Drive two blocks through the stream worker: the first carries a
    // transaction (should be fanned out), the second exhausts the lease
    // (ttl=2) and should trigger eviction.
    let source: Box<dyn TransactionSource> = Box::new(VecSource::new(vec![
        Transaction(serde_json::json!({"block_num": 1, "type": "transfer"})),
        Transaction(serde_json::json!({"block_num": 2, "type": "transfer"})),
        Transaction(serde_json::json!({"block_num": 3, "type": "transfer"})),
    ]));
    let (_stop_tx, stop_rx) = tokio::sync::broadcast::channel(1);

    tokio::time::timeout(
        Duration::from_secs(2),
        txstream_broker::stream_worker::run(
            Mode::Head,
            registry.clone(),
            control_socket.clone(),
            source,
            1,
            stop_rx,
        ),
    )
    .await
    .unwrap();

    // Drain every notice the worker sent and check the scenario holds
    // across the whole set: the block_num=1 transaction was fanned out,
    // and the subscriber was eventually evicted with a client_delete.
    let mut buf = vec![0u8; 4096];
    let mut saw_stream_data = false;
    let mut saw_delete = false;
    loop {
        let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(200), subscriber_socket.recv(&mut buf)).await
        else {
            break;
        };
        match decode_notice(&buf[..n]).unwrap() {
            Notice::StreamData { name: got, data } if data.block_num() == Some(1) => {
                assert_eq!(got, name);
                saw_stream_data = true;
            }
            Notice::ClientDelete { name: got } => {
                assert_eq!(got, name);
                saw_delete = true;
            }
            _ => {}
        }
    }
    assert!(saw_stream_data, "expected the block_num=1 transaction to be fanned out");
    assert!(saw_delete, "expected a client_delete notice on eviction");
    assert!(!registry.is_registered(&name));
}
