//! Exercises the self-test state machine against a tiny hand-rolled broker
//! stub, covering the "broker forgot us" re-registration path.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use txstream_broker::codec::{decode_commands, encode_notice, Command, Notice};
use txstream_broker::types::{Mode, SubscriberName};
use txstream_client::{SelfTest, SelfTestOutcome, StreamClient};

async fn respond_once(server: &tokio::net::UdpSocket, reply: Notice) {
    let mut buf = vec![0u8; 512];
    let (n, from) = server.recv_from(&mut buf).await.unwrap();
    let _ = decode_commands(&buf[..n]).unwrap();
    let bytes = encode_notice(&reply).unwrap();
    server.send_to(&bytes, from).await.unwrap();
}

#[tokio::test]
async fn reregisters_when_broker_reports_not_registered() {
    let server = tokio::net::UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();
    let name = SubscriberName::new("watcher").unwrap();

    let client = StreamClient::connect(server_addr, name, Mode::Head)
        .await
        .unwrap();

    let mut probe = SelfTest::new(Duration::from_millis(0), Duration::from_secs(1));

    let server_task = tokio::spawn(async move {
        respond_once(&server, Notice::PingAnswer { name: None }).await;
        respond_once(&server, Notice::Registered { data: false }).await;
        respond_once(&server, Notice::Registered { data: true }).await;
    });

    let outcome = probe.tick(&client).await;
    assert!(matches!(outcome, SelfTestOutcome::Reregistered));

    server_task.await.unwrap();
}

#[tokio::test]
async fn stays_healthy_when_still_registered() {
    let server = tokio::net::UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();
    let name = SubscriberName::new("watcher").unwrap();

    let client = StreamClient::connect(server_addr, name, Mode::Head)
        .await
        .unwrap();
    let mut probe = SelfTest::new(Duration::from_millis(0), Duration::from_secs(1));

    let server_task = tokio::spawn(async move {
        respond_once(&server, Notice::PingAnswer { name: None }).await;
        respond_once(&server, Notice::Registered { data: true }).await;
    });

    let outcome = probe.tick(&client).await;
    assert!(matches!(outcome, SelfTestOutcome::Healthy));

    server_task.await.unwrap();
}

#[tokio::test]
async fn command_batch_round_trip_helpers_compose() {
    // Sanity check that the client's register/set_subs/info calls produce
    // frames the broker's own codec accepts symmetrically.
    let cmd = Command::SetSubs {
        name: SubscriberName::new("x").unwrap(),
        subs: vec!["transfer".into()],
    };
    let bytes = txstream_broker::codec::encode_commands(&[cmd.clone()]).unwrap();
    assert_eq!(decode_commands(&bytes).unwrap(), vec![cmd]);
}
