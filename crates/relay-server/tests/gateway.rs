//! End-to-end gateway behaviour over a real socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::ids::UserId;
use relay_pool::ConnectionPool;
use relay_runtime::{
    AgentFailure, AgentInvocation, AgentLogic, AgentRegistry, ExecutionEngineFactory, FactoryWiring,
    PooledEmitterFactory,
};
use relay_server::{RelayServer, ServerConfig};
use relay_settings::{EmitterSettings, FactorySettings, PoolSettings};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Echo;

#[async_trait]
impl AgentLogic for Echo {
    async fn run(&self, invocation: AgentInvocation) -> Result<Value, AgentFailure> {
        let _ = invocation.emitter.notify_agent_thinking("echoing").await;
        Ok(invocation.input)
    }
}

async fn boot(pool_settings: PoolSettings) -> (RelayServer, String, tokio::task::JoinHandle<()>) {
    let pool = ConnectionPool::start(pool_settings);
    let emitter_settings = EmitterSettings::default();
    let factory = ExecutionEngineFactory::new(FactorySettings::default(), emitter_settings.clone());
    let mut registry = AgentRegistry::new();
    let _ = registry.register("echo", Arc::new(Echo));
    factory
        .configure(FactoryWiring {
            agent_registry: Some(Arc::new(registry)),
            emitter_factory: Arc::new(PooledEmitterFactory::new(Arc::clone(&pool), emitter_settings)),
            pool: Some(Arc::clone(&pool)),
            db: None,
        })
        .unwrap();

    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let server = RelayServer::new(config, pool, factory, None);
    let (addr, handle) = server.listen().await.unwrap();
    (server, format!("ws://{addr}/ws"), handle)
}

async fn wait_for_connections(server: &RelayServer, expected: usize) {
    for _ in 0..100 {
        if server.state().pool.stats().active_connections == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pool never reached {expected} connections");
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn kind(frame: &Value) -> &str {
    frame["event_type"]
        .as_str()
        .or_else(|| frame["type"].as_str())
        .unwrap_or("")
}

#[tokio::test]
async fn run_frame_streams_lifecycle_events() {
    let (server, url, handle) = boot(PoolSettings::default()).await;
    let (mut client, _) = connect_async(format!("{url}?user_id=alice&connection_id=c1"))
        .await
        .unwrap();

    let run = json!({"type": "run", "agent": "echo", "input": {"n": 7}, "request_id": "r1"});
    client.send(Message::text(run.to_string())).await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let frame = next_json(&mut client).await;
        let k = kind(&frame).to_owned();
        if k == "run_finished" {
            assert_eq!(frame["status"], "completed");
            assert_eq!(frame["request_id"], "r1");
            break;
        }
        if k == "agent_completed" {
            assert_eq!(frame["data"]["result"]["n"], 7);
            assert_eq!(frame["user_id"], "alice");
        }
        kinds.push(k);
    }

    let events: Vec<&str> = kinds
        .iter()
        .map(String::as_str)
        .filter(|k| k.starts_with("agent_"))
        .collect();
    assert_eq!(events, vec!["agent_started", "agent_thinking", "agent_completed"]);
    assert!(kinds.iter().any(|k| k == "run_accepted"));

    server.shutdown().shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn over_limit_socket_is_closed_with_1013() {
    let (server, url, handle) = boot(PoolSettings {
        max_connections_per_user: 1,
        ..PoolSettings::default()
    })
    .await;

    let (_first, _) = connect_async(format!("{url}?user_id=alice&connection_id=c1"))
        .await
        .unwrap();
    wait_for_connections(&server, 1).await;
    let (mut second, _) = connect_async(format!("{url}?user_id=alice&connection_id=c2"))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Close(Some(frame)) = msg else {
        panic!("expected close frame, got {msg:?}");
    };
    assert_eq!(u16::from(frame.code), 1013);
    assert_eq!(server.state().pool.connection_count_for_user(&UserId::from_raw("alice")), 1);

    server.shutdown().shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (server, url, handle) = boot(PoolSettings::default()).await;
    let (mut client, _) = connect_async(format!("{url}?user_id=bob")).await.unwrap();

    wait_for_connections(&server, 1).await;

    server.shutdown().shutdown();
    let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Close(Some(frame)) = msg else {
        panic!("expected close frame, got {msg:?}");
    };
    assert_eq!(u16::from(frame.code), 1001);
    let _ = handle.await;
}
