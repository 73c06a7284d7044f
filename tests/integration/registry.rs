//! Server-side registry behaviour: addressing, replacement and protocol errors

use std::time::Duration;

use pretty_assertions::assert_eq;
use pulse::collector;
use pulse::scheduler::TagPoller;
use pulse::server::ServerOptions;
use pulse::{MessageSet, Relay};
use tokio::sync::oneshot;

use super::helpers::*;

fn ids_by_host(sets: &[MessageSet], host: &str) -> Vec<String> {
    sets.iter()
        .filter(|set| set.tags.iter().any(|tag| tag == &format!("host:{host}")))
        .flat_map(|set| set.messages.iter().map(|m| m.id.clone()))
        .collect()
}

#[tokio::test]
async fn test_poll_shares_one_get_while_poll_all_personalises() {
    let (server, mut sets) = start_server().await;
    let addr = server.local_addr().to_string();

    let small = Relay::connect(addr.clone(), "small").await.unwrap();
    small
        .add_collector("cpu", vec![], collector::point(|| 1.0))
        .await
        .unwrap();

    let large = Relay::connect(addr, "large").await.unwrap();
    large
        .add_collector("cpu", vec![], collector::point(|| 2.0))
        .await
        .unwrap();
    large
        .add_collector("ram", vec![], collector::point(|| 3.0))
        .await
        .unwrap();

    wait_for_collector(&server, "small", "cpu").await;
    wait_for_collector(&server, "large", "ram").await;

    // shared `get ram,cpu`; "small" only answers what it has
    let sent = server
        .poll(Some(vec!["ram".into(), "cpu".into()]))
        .await
        .unwrap();
    assert_eq!(sent, 2);
    let polled = vec![next_set(&mut sets).await, next_set(&mut sets).await];
    assert_eq!(ids_by_host(&polled, "small"), vec!["cpu"]);
    assert_eq!(ids_by_host(&polled, "large"), vec!["ram", "cpu"]);

    // a name nobody has reaches nobody
    assert_eq!(server.poll(Some(vec!["gpu".into()])).await.unwrap(), 0);

    // personalised `get` listing each relay's own names, sorted
    let sent = server.poll_all().await.unwrap();
    assert_eq!(sent, 2);
    let polled = vec![next_set(&mut sets).await, next_set(&mut sets).await];
    assert_eq!(ids_by_host(&polled, "small"), vec!["cpu"]);
    assert_eq!(ids_by_host(&polled, "large"), vec!["cpu", "ram"]);

    // only the listed id
    let sent = server
        .poll_ids(vec!["large".into()], Some(vec!["ram".into()]))
        .await
        .unwrap();
    assert_eq!(sent, 1);
    let set = next_set(&mut sets).await;
    assert_eq!(ids_by_host(&[set], "large"), vec!["ram"]);

    small.close().await.unwrap();
    large.close().await.unwrap();
}

#[tokio::test]
async fn test_same_id_replaces_and_closes_previous_connection() {
    let (server, _sets) = start_server().await;

    let mut first = Peer::identify(server.local_addr(), "dup").await;
    first.send("add cpu").await;
    wait_for_collector(&server, "dup", "cpu").await;

    let mut second = Peer::identify(server.local_addr(), "dup").await;
    assert_eq!(first.recv().await, None, "superseded connection is closed");

    let clients = wait_for_clients(&server, |clients| {
        clients.len() == 1 && clients[0].collectors.is_empty()
    })
    .await;
    assert_eq!(clients[0].id, "dup");

    second.send("ping").await;
    assert_eq!(second.recv().await.as_deref(), Some("pong"));
}

#[tokio::test]
async fn test_handshake_diagnostics() {
    let (server, _sets) = start_server().await;

    let mut peer = Peer::connect(server.local_addr()).await;
    peer.send("hello").await;
    assert_eq!(
        peer.recv().await.as_deref(),
        Some("identify first with the 'id' command")
    );
    assert_eq!(peer.recv().await, None);

    let mut peer = Peer::connect(server.local_addr()).await;
    peer.send("id").await;
    assert_eq!(peer.recv().await.as_deref(), Some("missing id"));
    assert_eq!(peer.recv().await, None);

    assert!(server.clients().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_command_closes_connection() {
    let (server, _sets) = start_server().await;
    let mut peer = Peer::identify(server.local_addr(), "chatty").await;

    peer.send("ping").await;
    assert_eq!(peer.recv().await.as_deref(), Some("pong"));

    peer.send("dance").await;
    assert_eq!(peer.recv().await.as_deref(), Some("unknown command"));
    assert_eq!(peer.recv().await, None);

    wait_for_clients(&server, |clients| clients.is_empty()).await;
}

#[tokio::test]
async fn test_scheduler_polls_immediately_and_on_every_tick() {
    let (server, mut sets) = start_server().await;
    let relay = Relay::connect(server.local_addr().to_string(), "ticker")
        .await
        .unwrap();
    relay
        .add_collector("cpu", vec![], collector::point(|| 5.0))
        .await
        .unwrap();
    wait_for_collector(&server, "ticker", "cpu").await;

    let (done_tx, done_rx) = oneshot::channel();
    let scheduler = server.start_polling(None, None, Duration::from_secs(3600), done_rx);

    // first poll does not wait for the interval
    let set = next_set(&mut sets).await;
    assert_eq!(set.messages[0].data, "5.0000");

    done_tx.send(()).unwrap();
    tokio::time::timeout(WAIT, scheduler).await.unwrap().unwrap();

    let (done_tx, done_rx) = oneshot::channel();
    let scheduler = server.start_polling(
        None,
        Some(vec!["cpu".into()]),
        Duration::from_millis(50),
        done_rx,
    );
    next_set(&mut sets).await;
    next_set(&mut sets).await;
    next_set(&mut sets).await;
    drop(done_tx);
    tokio::time::timeout(WAIT, scheduler).await.unwrap().unwrap();

    relay.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_two_heartbeats() {
    let options = ServerOptions::new("127.0.0.1:0").heartbeat(Duration::from_secs(1));
    let (server, _sets) = start_server_with(options).await;

    let mut peer = Peer::connect(server.local_addr()).await;
    peer.send("id quiet").await;
    assert_eq!(peer.recv().await.as_deref(), Some("ok"));
    assert_eq!(peer.recv().await.as_deref(), Some("beat 1"));
    wait_for_clients(&server, |clients| clients.len() == 1).await;

    // never ping; the server gives up after 2s of silence
    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.clients().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("silent client was never dropped");
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn test_tag_poller_polls_subscribed_names() {
    let (server, _sets) = start_server().await;
    let mut peer = Peer::identify(server.local_addr(), "tagged").await;
    peer.send("add cpu").await;
    peer.send("add ram").await;
    wait_for_collector(&server, "tagged", "ram").await;

    let poller = TagPoller::spawn(server.registry());
    let client = poller.client().await.unwrap();
    client.subscribe("cpu", 1).await.unwrap();

    // due every second; only the subscribed name is asked for
    assert_eq!(peer.recv().await.as_deref(), Some("get cpu"));

    client.close().await;
    poller.close().await;
}
