//! Relay ↔ server round trips over real sockets

use std::collections::HashMap;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use pulse::collector;
use pulse::{Relay, RelayError};

use super::helpers::*;

#[tokio::test]
async fn test_poll_publishes_formatted_reading() {
    let (server, mut sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "web-1")
        .await
        .unwrap();
    relay
        .add_collector("cpu", vec!["role:web".into()], collector::point(|| 42.0))
        .await
        .unwrap();
    wait_for_collector(&server, "web-1", "cpu").await;

    let sent = server.poll(Some(vec!["cpu".into()])).await.unwrap();
    assert_eq!(sent, 1);

    let set = next_set(&mut sets).await;
    assert_eq!(set.tags, vec!["metrics", "host:web-1"]);
    assert_eq!(set.messages.len(), 1);
    assert_eq!(set.messages[0].id, "cpu");
    assert_eq!(set.messages[0].data, "42.0000");
    assert_eq!(set.messages[0].tags, vec!["role:web"]);

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_set_collector_readings_are_keyed_by_sub_name() {
    let (server, mut sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "db-1")
        .await
        .unwrap();
    relay
        .add_collector(
            "mem",
            vec![],
            collector::set(|| HashMap::from([("used".to_string(), 1.5), ("total".to_string(), 4.0)])),
        )
        .await
        .unwrap();
    wait_for_collector(&server, "db-1", "mem").await;

    server.poll(None).await.unwrap();
    let set = next_set(&mut sets).await;
    let mut readings: Vec<_> = set
        .messages
        .iter()
        .map(|m| (m.id.as_str(), m.data.as_str()))
        .collect();
    readings.sort();
    assert_eq!(readings, vec![("mem-total", "4.0000"), ("mem-used", "1.5000")]);

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_info_reports_connection_and_readings() {
    let (server, _sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "web-1")
        .await
        .unwrap();
    relay
        .add_collector("cpu", vec![], collector::point(|| 7.0))
        .await
        .unwrap();

    let info = relay.info().await.unwrap();
    assert_eq!(info["_connected"], 1.0);
    assert_eq!(info["cpu"], 7.0);
    assert_eq!(info.len(), 2);

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_and_duplicate_names_are_rejected() {
    let (server, _sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "web-1")
        .await
        .unwrap();

    for name in ["_connected", "cpu-used", "cpu:used", "a,b", ""] {
        let result = relay
            .add_collector(name, vec![], collector::point(|| 0.0))
            .await;
        assert_matches!(result, Err(RelayError::ReservedName(_)));
    }

    relay
        .add_collector("cpu", vec![], collector::point(|| 1.0))
        .await
        .unwrap();
    let result = relay
        .add_collector("cpu", vec![], collector::point(|| 2.0))
        .await;
    assert_matches!(result, Err(RelayError::DuplicateCollector(name)) if name == "cpu");

    assert_eq!(relay.info().await.unwrap()["cpu"], 1.0, "existing entry untouched");
    assert_eq!(relay.collectors().await.unwrap(), vec!["cpu"]);

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_collector_deregisters_on_server() {
    let (server, _sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "web-1")
        .await
        .unwrap();
    relay
        .add_collector("cpu", vec![], collector::point(|| 1.0))
        .await
        .unwrap();
    wait_for_collector(&server, "web-1", "cpu").await;

    relay.remove_collector("cpu").await.unwrap();
    relay.remove_collector("never-added").await.unwrap();
    wait_for_clients(&server, |clients| {
        clients.len() == 1 && clients[0].collectors.is_empty()
    })
    .await;

    relay.close().await.unwrap();
    wait_for_clients(&server, |clients| clients.is_empty()).await;
}

#[tokio::test]
async fn test_malformed_got_entry_is_skipped() {
    let (server, mut sets) = start_server().await;
    let mut peer = Peer::identify(server.local_addr(), "raw").await;
    peer.send("add cpu:role:web").await;
    wait_for_collector(&server, "raw", "cpu").await;

    peer.send("got cpu:1.0000,badentry,cpu-idle:NaNa").await;

    let set = next_set(&mut sets).await;
    assert_eq!(set.messages.len(), 2);
    assert_eq!(set.messages[0].id, "cpu");
    assert_eq!(set.messages[0].tags, vec!["role:web"]);
    assert_eq!(set.messages[1].id, "cpu-idle");
    assert_eq!(set.messages[1].data, "-1");
    assert_eq!(set.messages[1].tags, vec!["role:web"]);
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Relay::connect(addr.to_string(), "nobody").await;
    assert_matches!(result, Err(RelayError::Connection(_)));
}

#[tokio::test]
async fn test_handshake_reply_other_than_ok_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let fake = async {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream);
        peer.recv().await;
        peer.send("go away").await;
        peer
    };
    let (result, _peer) = tokio::join!(Relay::connect(addr.to_string(), "web-1"), fake);
    assert_matches!(result, Err(RelayError::UnableToIdentify(reply)) if reply == "go away");
}

#[tokio::test]
async fn test_non_finite_reading_is_published_as_unparsable() {
    let (server, mut sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "broken-sensor")
        .await
        .unwrap();
    relay
        .add_collector("temp", vec![], collector::point(|| f64::NAN))
        .await
        .unwrap();
    wait_for_collector(&server, "broken-sensor", "temp").await;

    server.poll_all().await.unwrap();
    let set = next_set(&mut sets).await;
    assert_eq!(set.messages[0].id, "temp");
    assert_eq!(set.messages[0].data, "-1");

    relay.close().await.unwrap();
}
