use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use wirecall_discovery_memory::MemoryRegistry;
use wirecall_rpc::{
    BodyCodec, CallContext, Client, ClientConfig, Error, MethodRouter, RouteResolver, Server,
    ServerConfig,
};

async fn serve(label: &'static str) -> (Arc<Server>, SocketAddr) {
    let router = MethodRouter::new(label).raw("Whoami", |label: Arc<&'static str>, _, _, _| async move {
        Ok::<_, Error>(label.as_bytes().to_vec())
    });
    let server = Server::new(ServerConfig::new("greeter", "127.0.0.1", 0), router);
    tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });
    let addr = server.ready().await.unwrap();
    (server, addr)
}

fn fast_refresh() -> ClientConfig {
    ClientConfig {
        refresh_endpoint_interval_ms: 20,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_client_follows_discovery() {
    let (server_a, addr_a) = serve("a").await;
    let (server_b, addr_b) = serve("b").await;

    let registry = MemoryRegistry::new();
    registry.set_routes("greeter", [addr_a.to_string()]);

    let resolver: Arc<dyn RouteResolver> = Arc::new(registry.clone());
    let client = Client::builder("greeter")
        .config(fast_refresh())
        .discovery(resolver)
        .build()
        .await;

    // Resolved before build returns
    assert_eq!(client.hosts(), vec![addr_a.to_string()]);
    let out = client
        .call(&CallContext::new(), None, BodyCodec::Json, "Whoami", Vec::new())
        .await
        .unwrap();
    assert_eq!(out, b"a");

    registry.set_routes("greeter", [addr_b.to_string()]);
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.hosts() != vec![addr_b.to_string()] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The pool of the removed host is gone
    assert!(!client.active_hosts().contains(&addr_a.to_string()));
    let out = client
        .call(&CallContext::new(), None, BodyCodec::Json, "Whoami", Vec::new())
        .await
        .unwrap();
    assert_eq!(out, b"b");

    client.close().await;
    server_a.stop().await;
    server_b.stop().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_hosts() {
    let registry = MemoryRegistry::new();
    registry.set_routes("greeter", ["127.0.0.1:7001", "127.0.0.1:7002"]);

    let client = Client::builder("greeter")
        .config(ClientConfig {
            refresh_endpoint_interval_ms: 0,
            ..ClientConfig::default()
        })
        .discovery(Arc::new(registry.clone()))
        .build()
        .await;
    assert_eq!(client.hosts().len(), 2);

    registry.set_unavailable(true);
    assert!(!client.refresh_hosts().await);
    assert_eq!(client.hosts(), vec!["127.0.0.1:7001", "127.0.0.1:7002"]);

    registry.set_unavailable(false);
    registry.set_routes("greeter", ["127.0.0.1:7002", "127.0.0.1:7003"]);
    assert!(client.refresh_hosts().await);
    assert_eq!(client.hosts(), vec!["127.0.0.1:7002", "127.0.0.1:7003"]);

    client.close().await;
}

#[tokio::test]
async fn test_refresh_without_discovery() {
    let client = Client::builder("greeter")
        .hosts(["127.0.0.1:7001"])
        .build()
        .await;

    assert!(!client.refresh_hosts().await);
    assert_eq!(client.hosts(), vec!["127.0.0.1:7001"]);

    client.close().await;
}
