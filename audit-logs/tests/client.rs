mod common;

use audit_logs::prelude::*;
use axum::{
    body::Body,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::Sink;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io;
use std::time::Duration;

async fn upstream() -> String {
    let app = Router::new()
        .route("/invoices", get(|| async { Json(json!([{ "id": 1 }])) }))
        .route("/echo", post(|Json(body): Json<Value>| async move { Json(body) }))
        .route("/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "fail") }))
        .route(
            "/fail/large",
            get(|| async {
                let chunks = futures::stream::iter(
                    (0..8).map(|_| Ok::<_, Infallible>("0123456789")),
                );
                (StatusCode::INTERNAL_SERVER_ERROR, Body::from_stream(chunks))
            }),
        )
        .route(
            "/fail/broken",
            get(|| async {
                let part = futures::stream::iter(vec![Ok::<_, io::Error>("part")]);
                let crash = futures::stream::once(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream crashed"))
                });
                (StatusCode::BAD_GATEWAY, Body::from_stream(part.chain(crash)))
            }),
        )
        .route(
            "/stream",
            get(|| async {
                let chunks = futures::stream::iter(vec![Ok::<_, Infallible>("a"), Ok("b")]);
                Body::from_stream(chunks)
            }),
        );
    format!("http://{}", common::serve(app).await)
}

async fn setup() -> (AuditLogs, AuditedClient, Sink, String) {
    let sink = Sink::start().await;
    let mut config = common::config(&sink);
    config.server.enabled = false;
    config.client.insert(
        "muted".to_string(),
        audit_logs::config::ClientOverride {
            enabled: Some(false),
            endpoint: None,
        },
    );

    let audit = AuditLogs::builder()
        .config(config)
        .group("legacy", GroupPolicy::disabled())
        .route(
            "create-invoice",
            RoutePolicy::new().with_options(CaptureOptions::default().with_action("CREATE_INVOICE")),
        )
        .build()
        .unwrap();
    let client = audit.client(reqwest::Client::new());
    (audit, client, sink, upstream().await)
}

#[tokio::test]
async fn test_get_is_recorded_under_client_name() {
    let (audit, client, sink, base) = setup().await;

    let response = client
        .send(
            "billing",
            "list-invoices",
            client.get(format!("{}/invoices?page=2", base)),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!([{ "id": 1 }]));

    let records = sink.wait_for(1).await;
    let record = &records[0];
    assert_eq!(record["customFields"]["rest-client"], "billing");
    assert_eq!(record["request"]["method"], "GET");
    assert_eq!(record["request"]["uri"], format!("{}/invoices", base));
    assert_eq!(record["request"]["queryParams"]["page"], json!(["2"]));
    assert_eq!(record["response"]["status"], 200);
    assert_eq!(record["response"]["body"], json!([{ "id": 1 }]));
    assert_eq!(record["invokedMethodSignature"], "billing.list-invoices");
    assert_eq!(audit.capture().in_flight(), 0);
}

#[tokio::test]
async fn test_request_body_and_action() {
    let (_audit, client, sink, base) = setup().await;

    let response = client
        .send(
            "billing",
            "create-invoice",
            client
                .post(format!("{}/echo", base))
                .json(&json!({ "amount": 10 })),
        )
        .await
        .unwrap();
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "amount": 10 }));

    let records = sink.wait_for(1).await;
    assert_eq!(records[0]["request"]["body"], json!({ "amount": 10 }));
    assert_eq!(records[0]["response"]["body"], json!({ "amount": 10 }));
    assert_eq!(records[0]["action"], "CREATE_INVOICE");
}

#[tokio::test]
async fn test_error_response_body_is_read() {
    let (_audit, client, sink, base) = setup().await;

    let response = client
        .send("billing", "fail", client.get(format!("{}/fail", base)))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "fail");

    let records = sink.wait_for(1).await;
    assert_eq!(records[0]["response"]["status"], 500);
    assert_eq!(records[0]["response"]["body"], "fail");
}

#[tokio::test]
async fn test_streaming_response_is_not_captured() {
    let (_audit, client, sink, base) = setup().await;

    let response = client
        .send("billing", "stream", client.get(format!("{}/stream", base)))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "ab");

    let records = sink.wait_for(1).await;
    assert_eq!(records[0]["response"]["status"], 200);
    assert!(records[0]["response"].get("body").is_none());
}

#[tokio::test]
async fn test_transport_error_discards_exchange() {
    let (audit, client, sink, _) = setup().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let result = client
        .send("billing", "down", client.get(format!("http://{}/", closed)))
        .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.records().is_empty());
    assert_eq!(audit.capture().in_flight(), 0);
}

#[tokio::test]
async fn test_disabled_clients_are_not_recorded() {
    let (_audit, client, sink, base) = setup().await;

    for name in ["muted", "legacy"] {
        let response = client
            .send(name, "list-invoices", client.get(format!("{}/invoices", base)))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_large_chunked_error_is_not_buffered() {
    let sink = Sink::start().await;
    let mut config = common::config(&sink);
    config.server.enabled = false;
    config.max_body_bytes = 32;
    let audit = AuditLogs::builder().config(config).build().unwrap();
    let client = audit.client(reqwest::Client::new());
    let base = upstream().await;

    let response = client
        .send("billing", "fail", client.get(format!("{}/fail/large", base)))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "0123456789".repeat(8));

    let records = sink.wait_for(1).await;
    assert_eq!(records[0]["response"]["status"], 500);
    assert!(records[0]["response"].get("body").is_none());
    assert_eq!(audit.capture().in_flight(), 0);
}

#[tokio::test]
async fn test_broken_body_error_reaches_caller_on_read() {
    let (audit, client, sink, base) = setup().await;

    let response = client
        .send("billing", "fail", client.get(format!("{}/fail/broken", base)))
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert!(response.text().await.is_err());

    let records = sink.wait_for(1).await;
    assert_eq!(records[0]["response"]["status"], 502);
    assert!(records[0]["response"].get("body").is_none());
    assert_eq!(audit.capture().in_flight(), 0);
}
