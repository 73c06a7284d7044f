//! Relay self-healing against a hand-driven fake server

use std::time::Duration;

use pretty_assertions::assert_eq;
use pulse::collector;
use pulse::relay::{Relay, RelayOptions};
use tokio::net::TcpListener;

use super::helpers::*;

async fn fake_server() -> (TcpListener, RelayOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let options = RelayOptions::new(listener.local_addr().unwrap().to_string(), "r1")
        .reconnect_delay(Duration::from_millis(100));
    (listener, options)
}

#[tokio::test]
async fn test_reannounces_collectors_before_answering_get() {
    let (listener, options) = fake_server().await;
    let (relay, mut peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();

    relay
        .add_collector("cpu", vec!["role:web".into()], collector::point(|| 42.0))
        .await
        .unwrap();
    relay
        .add_collector("ram", vec![], collector::point(|| 1.0))
        .await
        .unwrap();
    assert_eq!(peer.recv().await.as_deref(), Some("add cpu:role:web"));
    assert_eq!(peer.recv().await.as_deref(), Some("add ram"));

    // forcibly drop the session
    drop(peer);

    let mut peer = accept_relay(&listener, "r1").await;
    let mut announced = vec![peer.recv().await.unwrap(), peer.recv().await.unwrap()];
    announced.sort();
    assert_eq!(announced, vec!["add cpu:role:web", "add ram"]);

    peer.send("get cpu,gpu").await;
    assert_eq!(peer.recv().await.as_deref(), Some("got cpu:42.0000"));

    assert_eq!(relay.info().await.unwrap()["_connected"], 1.0);
    relay.close().await.unwrap();
    assert_eq!(peer.recv().await.as_deref(), Some("close"));
}

#[tokio::test]
async fn test_missing_pong_triggers_reconnect() {
    let (listener, options) = fake_server().await;
    let (relay, mut peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();

    peer.send("beat 1").await;
    assert_eq!(peer.recv().await.as_deref(), Some("ping"));

    // never answer; the relay gives up after half an interval and redials
    let _second = accept_relay(&listener, "r1").await;

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_answered_pings_keep_the_session() {
    let (listener, options) = fake_server().await;
    let (relay, mut peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();

    peer.send("beat 1").await;
    for _ in 0..2 {
        assert_eq!(peer.recv().await.as_deref(), Some("ping"));
        peer.send("pong").await;
    }

    let redial = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(redial.is_err(), "relay must not reconnect while pongs arrive");

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_server_close_triggers_reconnect() {
    let (listener, options) = fake_server().await;
    let (relay, mut peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();

    peer.send("close").await;
    let _second = accept_relay(&listener, "r1").await;

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_terminal() {
    let (listener, options) = fake_server().await;
    let (relay, mut peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();

    relay.close().await.unwrap();
    assert_eq!(peer.recv().await.as_deref(), Some("close"));
    assert_eq!(peer.recv().await, None);

    let redial = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(redial.is_err(), "closed relay must not reconnect");
}

#[tokio::test]
async fn test_collectors_added_while_disconnected_are_announced() {
    let (listener, options) = fake_server().await;
    let options = options.reconnect_delay(Duration::from_millis(300));
    let (relay, peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();

    drop(peer);
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay
        .add_collector("disk", vec![], collector::point(|| 3.0))
        .await
        .unwrap();
    assert_eq!(relay.info().await.unwrap()["_connected"], 0.0);

    let mut peer = accept_relay(&listener, "r1").await;
    assert_eq!(peer.recv().await.as_deref(), Some("add disk"));

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_beat_is_ignored() {
    let (listener, options) = fake_server().await;
    let (relay, mut peer) = tokio::join!(Relay::connect_with(options), accept_relay(&listener, "r1"));
    let relay = relay.unwrap();
    relay
        .add_collector("cpu", vec![], collector::point(|| 7.0))
        .await
        .unwrap();
    assert_eq!(peer.recv().await.as_deref(), Some("add cpu"));

    peer.send(&format!("beat {}", u64::MAX)).await;
    peer.send("get cpu").await;
    assert_eq!(peer.recv().await.as_deref(), Some("got cpu:7.0000"));

    // the relay keeps serving on its previous interval
    peer.send("beat 1").await;
    assert_eq!(peer.recv().await.as_deref(), Some("ping"));
    peer.send("pong").await;
    assert_eq!(relay.info().await.unwrap()["_connected"], 1.0);

    relay.close().await.unwrap();
}
