use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::Router;
use axum::routing::get;
use wirecall_app::{AppConfig, Application, Error, STOP_PATH, SharedRegistry};
use wirecall_discovery::Discovery;
use wirecall_discovery_memory::MemoryRegistry;
use wirecall_rpc::{BodyCodec, CallContext, MethodRouter, ServerState};

fn echo() -> MethodRouter<()> {
    MethodRouter::new(()).raw("Echo", |_, _, _, body| async move {
        Ok::<_, wirecall_rpc::Error>(body)
    })
}

async fn explode() -> &'static str {
    panic!("boom")
}

fn web() -> Router {
    Router::new()
        .route("/hello", get(|| async { "hello wirecall" }))
        .route("/explode", get(explode))
}

fn config(extra: &str) -> AppConfig {
    format!(
        r#"
        service = "demo"
        keep_alive_ms = 20
        drain_grace_ms = 500
        {extra}

        [[server]]
        name = "Echo"
        ip = "127.0.0.1"
        port = 0
        "#
    )
    .parse()
    .unwrap()
}

async fn wait_for_routes(registry: &MemoryRegistry, service: &str, expected: usize) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let routes = registry.query_route(service).await.unwrap();
            if routes.len() == expected {
                return routes;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_full_lifecycle() {
    let registry = MemoryRegistry::new();
    let mut app = Application::new(config("admin_listen = \"127.0.0.1:0\""))
        .with_registry(SharedRegistry::new(registry.clone()));
    let server = app.add_service("Echo", echo()).unwrap();
    let app = Arc::new(app);

    let run = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.run().await }
    });

    let addr = server.ready().await.unwrap().to_string();
    assert_eq!(wait_for_routes(&registry, "Echo", 1).await, vec![addr.clone()]);

    // Clients built from the application find the server through the registry
    let client = app.client("Echo").build().await;
    let out = client
        .call(&CallContext::new(), None, BodyCodec::Json, "Echo", b"hi".to_vec())
        .await
        .unwrap();
    assert_eq!(out, b"hi");

    // Keep-alive refreshes the registration
    let first = registry.last_seen("Echo", &addr).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(registry.last_seen("Echo", &addr).unwrap() > first);

    let admin = app.admin_addr().await.unwrap();
    let response = reqwest::Client::new()
        .post(format!("http://{admin}{STOP_PATH}"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    run.await.unwrap().unwrap();
    assert!(registry.query_route("Echo").await.unwrap().is_empty());
    assert_eq!(server.state(), ServerState::Stopped);

    client.close().await;
}

#[tokio::test]
async fn test_stop_without_admin_endpoint() {
    let mut app = Application::new(config(""));
    let server = app.add_service("Echo", echo()).unwrap();
    let app = Arc::new(app);

    let run = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.run().await }
    });
    server.ready().await.unwrap();
    assert!(app.admin_addr().await.is_none());

    // A second run is refused while the first is active
    assert_matches!(app.run().await, Err(Error::AlreadyStarted));

    app.stop();
    run.await.unwrap().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_server_bind_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let config: AppConfig = format!(
        r#"
        service = "demo"

        [[server]]
        name = "Echo"
        ip = "127.0.0.1"
        port = {port}
        "#
    )
    .parse()
    .unwrap();

    let registry = MemoryRegistry::new();
    let mut app = Application::new(config).with_registry(SharedRegistry::new(registry.clone()));
    app.add_service("Echo", echo()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), app.run())
        .await
        .unwrap();
    assert_matches!(result, Err(Error::Rpc(_)));
    assert!(registry.query_route("Echo").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_failure_stops_servers() {
    let registry = MemoryRegistry::new();
    registry.set_unavailable(true);

    let mut app = Application::new(config("")).with_registry(SharedRegistry::new(registry));
    let server = app.add_service("Echo", echo()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), app.run())
        .await
        .unwrap();
    assert_matches!(result, Err(Error::Registry(_)));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_add_service_checks_names() {
    let mut app = Application::new(config(""));

    assert_matches!(
        app.add_service("Missing", echo()),
        Err(Error::UnknownServer(name)) if name == "Missing"
    );
    app.add_service("Echo", echo()).unwrap();
    assert_matches!(app.add_service("Echo", echo()), Err(Error::DuplicateServer(_)));
    assert_matches!(app.add_http("Echo", web()), Err(Error::DuplicateServer(_)));
    assert_matches!(app.add_http("Missing", web()), Err(Error::UnknownServer(_)));
    assert_eq!(app.servers().len(), 1);
    assert!(app.http_servers().is_empty());
}

#[tokio::test]
async fn test_http_server_lifecycle() {
    let registry = MemoryRegistry::new();
    let mut app = Application::new(config(
        r#"
        [[server]]
        name = "Web"
        ip = "127.0.0.1"
        port = 0
        "#,
    ))
    .with_registry(SharedRegistry::new(registry.clone()));
    let rpc = app.add_service("Echo", echo()).unwrap();
    let web = app.add_http("Web", web()).unwrap();
    let app = Arc::new(app);

    let run = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.run().await }
    });

    let addr = web.ready().await.unwrap();
    assert_eq!(wait_for_routes(&registry, "Web", 1).await, vec![addr.to_string()]);

    let http = reqwest::Client::new();
    let hello = |http: &reqwest::Client| http.get(format!("http://{addr}/hello")).send();
    assert_eq!(hello(&http).await.unwrap().text().await.unwrap(), "hello wirecall");

    // A panicking handler answers 500 and the server keeps serving
    let response = http
        .get(format!("http://{addr}/explode"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().await.unwrap().contains("boom"));
    assert_eq!(hello(&http).await.unwrap().text().await.unwrap(), "hello wirecall");

    app.stop();
    run.await.unwrap().unwrap();
    assert_eq!(web.state(), ServerState::Stopped);
    assert_eq!(rpc.state(), ServerState::Stopped);
    assert!(registry.query_route("Web").await.unwrap().is_empty());
    assert!(hello(&reqwest::Client::new()).await.is_err());
}

#[tokio::test]
async fn test_http_bind_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let config: AppConfig = format!(
        r#"
        service = "demo"

        [[server]]
        name = "Web"
        ip = "127.0.0.1"
        port = {port}
        "#
    )
    .parse()
    .unwrap();

    let mut app = Application::new(config);
    let web = app.add_http("Web", web()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), app.run())
        .await
        .unwrap();
    assert_matches!(result, Err(Error::HttpBind { .. }));
    assert_eq!(web.state(), ServerState::Stopped);
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "service = \"demo\"\n\n[registry]\nkind = \"memory\"\n\n[[server]]\nname = \"Echo\"\nport = 7000"
    )
    .unwrap();

    let config = AppConfig::from_file(file.path()).unwrap();
    assert_eq!(config.service, "demo");
    assert_eq!(config.server("Echo").unwrap().port, 7000);

    let app = Application::new(config);
    assert!(app.registry().is_some());

    let missing = AppConfig::from_file(file.path().with_extension("missing"));
    assert_matches!(missing, Err(Error::ReadConfig { .. }));
}
