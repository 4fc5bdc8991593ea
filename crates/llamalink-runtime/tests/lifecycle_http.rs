//! HTTP-level lifecycle tests: the supervisor wired to the real proxy
//! server, exercised over loopback sockets.

use llamalink_core::Config;
use llamalink_runtime::ServiceSupervisor;
use tokio::net::TcpListener;

/// Config on an ephemeral port whose upstream points at nothing — `/health`
/// must not care.
fn test_config(port: u16) -> Config {
    Config {
        port,
        ollama_base_url: url::Url::parse("http://127.0.0.1:1").unwrap(),
        ..Default::default()
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_health_reflects_lifecycle_without_upstream_probe() {
    let supervisor = ServiceSupervisor::new(test_config(0));
    let addr = supervisor.start().await.unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/health");

    // Healthy while running, with no Ollama server anywhere in sight.
    for _ in 0..3 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    supervisor.stop().await.unwrap();

    // The listener is gone after stop.
    assert!(client.get(&url).send().await.is_err());
}

#[tokio::test]
async fn test_reconfigure_moves_the_listener() {
    let supervisor = ServiceSupervisor::new(test_config(0));
    let old_addr = supervisor.start().await.unwrap();

    let new_port = free_port().await;
    let new_addr = supervisor
        .reconfigure(test_config(new_port))
        .await
        .unwrap()
        .expect("restart while running");

    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{new_addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // No connection may be accepted against the stale config.
    assert!(client
        .get(format!("http://{old_addr}/health"))
        .send()
        .await
        .is_err());

    supervisor.stop().await.unwrap();
}
