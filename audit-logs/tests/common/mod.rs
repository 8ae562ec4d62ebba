#![allow(dead_code)]

use audit_logs::prelude::*;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process audit sink collecting posted records
#[derive(Clone)]
pub struct Sink {
    pub url: String,
    records: Arc<Mutex<Vec<Value>>>,
}

impl Sink {
    pub async fn start() -> Self {
        let records = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/records",
                post(
                    |State(records): State<Arc<Mutex<Vec<Value>>>>, Json(record): Json<Value>| async move {
                        records.lock().unwrap().push(record);
                        StatusCode::CREATED
                    },
                ),
            )
            .with_state(records.clone());

        let url = format!("http://{}/records", serve(app).await);
        Self { url, records }
    }

    /// Records received so far, waiting up to a second for `count` of them
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            if self.records.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.records()
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.lock().unwrap().clone()
    }
}

/// Serve an app on an ephemeral local port
pub async fn serve(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Generator adding `foo = bar`
#[derive(Default)]
pub struct FooBar;

impl CustomFieldsGenerator for FooBar {
    fn generate(&self, _entity: &Value) -> CustomFields {
        CustomFields::from([("foo".to_string(), json!("bar"))])
    }
}

/// Configuration sending server and client records to the sink
pub fn config(sink: &Sink) -> AuditLogsConfig {
    let mut config = AuditLogsConfig::default();
    config.server.endpoint = Some(sink.url.clone());
    config.clients.endpoint = Some(sink.url.clone());
    config
}
