mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{proxy_config, Client, TestBackend};
use slotgate::coordination::{Action, CoordinationStore, ProxyState, SlotStatus};
use slotgate::lifecycle::TerminationReason;
use slotgate::protocol::RespValue;
use slotgate::server::{embedded_store, Server};
use slotgate::ProxyInstance;

async fn wait_for_state(instance: &ProxyInstance, state: ProxyState) {
    let mut rx = instance.lifecycle().subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("state reached in time")
        .unwrap();
}

#[tokio::test]
async fn test_cluster_work() {
    let redis1 = TestBackend::start().await;
    let redis2 = TestBackend::start().await;
    let mut config = proxy_config(
        "proxy_test",
        vec![vec![redis1.addr.clone(), redis2.addr.clone()]],
    );
    config.lifecycle.auto_online = false;

    let store = embedded_store(&config).unwrap();
    let server = Server::bind(
        config,
        Arc::clone(&store) as Arc<dyn CoordinationStore>,
        Box::new(|_: TerminationReason| {}),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let instance = server.instance();
    tokio::spawn(server.run());

    // the control plane brings the proxy online once it has registered
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.get_proxy_record("proxy_test").await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(instance.lifecycle().state(), ProxyState::Registering);
    store
        .set_proxy_state("proxy_test", ProxyState::Online)
        .unwrap();
    wait_for_state(&instance, ProxyState::Online).await;

    let mut client = Client::connect(addr).await.unwrap();
    assert_eq!(client.command(&["SET", "foo", "bar"]).await, RespValue::ok());
    assert_eq!(client.command(&["get", "foo"]).await, RespValue::bulk("bar"));
    assert_eq!(client.command(&["SET", "bar", "foo"]).await, RespValue::ok());
    assert_eq!(client.command(&["get", "bar"]).await, RespValue::bulk("foo"));

    // the first master of the group serves traffic
    assert_eq!(redis1.get(b"foo").unwrap(), "bar");
    assert!(redis2.get(b"foo").is_none());

    instance.shutdown();
}

#[tokio::test]
async fn test_routes_by_slot_across_groups() {
    let group1 = TestBackend::start().await;
    let group2 = TestBackend::start().await;
    let config = proxy_config(
        "proxy_routes",
        vec![vec![group1.addr.clone()], vec![group2.addr.clone()]],
    );
    let store = embedded_store(&config).unwrap();
    let server = Server::bind(
        config,
        Arc::clone(&store) as Arc<dyn CoordinationStore>,
        Box::new(|_: TerminationReason| {}),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let instance = server.instance();
    tokio::spawn(server.run());
    wait_for_state(&instance, ProxyState::Online).await;

    let mut client = Client::connect(addr).await.unwrap();
    for i in 0..50 {
        let key = format!("key:{}", i);
        assert_eq!(client.command(&["SET", &key, "v"]).await, RespValue::ok());
        let slot = instance.slots().slot_for_key(key.as_bytes());
        let owner = instance.slots().owner(slot).unwrap().group_id;
        let (hit, miss) = if owner == 1 {
            (&group1, &group2)
        } else {
            (&group2, &group1)
        };
        assert!(hit.get(key.as_bytes()).is_some());
        assert!(miss.get(key.as_bytes()).is_none());
    }

    // keys that share a hash tag may be combined; others may not
    assert_eq!(
        client.command(&["SET", "{user1}.a", "1"]).await,
        RespValue::ok()
    );
    // forwarded: the test backend itself rejects MGET
    let tagged = client.command(&["MGET", "{user1}.a", "{user1}.b"]).await;
    assert!(matches!(tagged, RespValue::Error(ref e) if e.contains("unknown command 'MGET'")));
    let cross = client.command(&["MGET", "key:1", "key:2", "key:3", "key:4"]).await;
    assert!(matches!(cross, RespValue::Error(ref e) if e.starts_with("CROSSSLOT")));

    // moving every slot to group 2 through the action log redirects traffic
    store
        .assign_slots(0, 1023, 2, SlotStatus::Online, None)
        .unwrap();
    store
        .append_action(&Action::SlotRangeSet {
            lo: 0,
            hi: 1023,
            group_id: 2,
            status: SlotStatus::Online,
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while instance.slots().owner(0).unwrap().group_id != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.command(&["SET", "moved", "x"]).await, RespValue::ok());
    assert_eq!(group2.get(b"moved").unwrap(), "x");

    instance.shutdown();
}

#[tokio::test]
async fn test_mark_offline() {
    let backend = TestBackend::start().await;
    let mut config = proxy_config("proxy_offline", vec![vec![backend.addr.clone()]]);
    config.lifecycle.drain_grace_ms = 1000;

    let store = embedded_store(&config).unwrap();
    let suicide = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&suicide);
    let server = Server::bind(
        config,
        Arc::clone(&store) as Arc<dyn CoordinationStore>,
        Box::new(move |_: TerminationReason| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let instance = server.instance();
    let task = tokio::spawn(server.run());
    wait_for_state(&instance, ProxyState::Online).await;

    let mut client = Client::connect(addr).await.unwrap();
    assert_eq!(client.command(&["PING"]).await, RespValue::SimpleString("PONG".to_string()));

    // a request in flight when the proxy is marked offline still completes
    client.send(&["SET", "slow:key", "v"]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .set_proxy_state("proxy_offline", ProxyState::MarkOffline)
        .unwrap();
    wait_for_state(&instance, ProxyState::MarkOffline).await;
    assert_eq!(client.reply().await, RespValue::ok());
    assert_eq!(backend.get(b"slow:key").unwrap(), "v");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(Client::connect(addr).await.is_err());
    assert_eq!(suicide.load(Ordering::SeqCst), 0);

    let outcome = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("terminated within grace")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Some(TerminationReason::Drained));
    assert_eq!(suicide.load(Ordering::SeqCst), 1);

    let record = store.get_proxy_record("proxy_offline").await.unwrap().unwrap();
    assert_eq!(record.state, ProxyState::Offline);
}
