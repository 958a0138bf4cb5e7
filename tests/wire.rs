use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use rentd::auth::Gatekeeper;
use rentd::engine::Engine;
use rentd::notify::NotifyHub;
use rentd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("rentd.wal"), Arc::new(NotifyHub::new())).unwrap(),
    );
    let gate = Arc::new(Gatekeeper::new("rentd".to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, gate).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    id: Ulid,
}

impl Client {
    async fn connect(addr: SocketAddr, role: &str) -> Client {
        let id = Ulid::new();
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, LinesCodec::new());
        framed
            .send(
                json!({"op": "hello", "password": "rentd", "principal": {"id": id, "role": role}})
                    .to_string(),
            )
            .await
            .unwrap();
        let line = framed.next().await.unwrap().unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert!(reply.get("ok").is_some(), "hello rejected: {line}");
        Client { framed, id }
    }

    async fn request(&mut self, req: Value) -> Value {
        self.framed.send(req.to_string()).await.unwrap();
        let line = self.framed.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Wait for an unsolicited line (watch event) with a timeout.
    async fn next_event(&mut self, timeout: Duration) -> Option<Value> {
        let line = tokio::time::timeout(timeout, self.framed.next())
            .await
            .ok()
            .flatten()?
            .ok()?;
        serde_json::from_str(&line).ok()
    }
}

fn date(offset: i64) -> String {
    (Utc::now().date_naive() + chrono::Duration::days(offset))
        .format("%Y-%m-%d")
        .to_string()
}

fn error_kind(reply: &Value) -> &str {
    reply["error"]["kind"].as_str().unwrap_or("")
}

/// Seed a category + item through a manager connection; returns the item id.
async fn seed_item(addr: SocketAddr) -> String {
    let mut boss = Client::connect(addr, "manager").await;
    let category = boss
        .request(json!({"op": "add_category", "name": "Heavy Equipment"}))
        .await;
    let category_id = category["ok"]["id"].as_str().unwrap().to_string();
    let item = boss
        .request(json!({
            "op": "add_item",
            "name": "Excavator",
            "description": "3.5t mini excavator",
            "category": category_id,
            "daily_rate": 50,
            "condition": "good",
        }))
        .await;
    item["ok"]["id"].as_str().unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn bad_password_is_rejected() {
    let addr = start_test_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(socket, LinesCodec::new());
    framed
        .send(
            json!({"op": "hello", "password": "wrong", "principal": {"id": Ulid::new(), "role": "customer"}})
                .to_string(),
        )
        .await
        .unwrap();
    let reply: Value =
        serde_json::from_str(&framed.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(error_kind(&reply), "unauthorized");
    // Server hangs up after a failed hello.
    assert!(framed.next().await.is_none());
}

#[tokio::test]
async fn booking_conflict_and_cancel_flow() {
    let addr = start_test_server().await;
    let item = seed_item(addr).await;

    let mut alice = Client::connect(addr, "customer").await;
    let booked = alice
        .request(json!({"op": "reserve", "item": item, "start": date(1), "end": date(4)}))
        .await;
    assert_eq!(booked["ok"]["status"], "active");
    assert_eq!(booked["ok"]["total_cost"], "200");
    let reservation = booked["ok"]["id"].as_str().unwrap().to_string();

    // Overlapping request from another customer bounces.
    let mut bob = Client::connect(addr, "customer").await;
    let clash = bob
        .request(json!({"op": "reserve", "item": item, "start": date(3), "end": date(5)}))
        .await;
    assert_eq!(error_kind(&clash), "conflict");

    // Bob cannot cancel Alice's reservation; Alice can.
    let steal = bob.request(json!({"op": "cancel", "reservation": reservation})).await;
    assert_eq!(error_kind(&steal), "forbidden");
    let cancel = alice
        .request(json!({"op": "cancel", "reservation": reservation}))
        .await;
    assert_eq!(cancel["ok"]["already_cancelled"], false);

    // The dates are free again.
    let retry = bob
        .request(json!({"op": "reserve", "item": item, "start": date(3), "end": date(5)}))
        .await;
    assert_eq!(retry["ok"]["status"], "active");
}

#[tokio::test]
async fn validation_errors_over_the_wire() {
    let addr = start_test_server().await;
    let item = seed_item(addr).await;
    let mut client = Client::connect(addr, "customer").await;

    let missing = client
        .request(json!({"op": "reserve", "item": item, "start": date(1)}))
        .await;
    assert_eq!(error_kind(&missing), "validation");

    let garbled = client
        .request(json!({"op": "reserve", "item": item, "start": "06/01/2030", "end": date(4)}))
        .await;
    assert_eq!(error_kind(&garbled), "validation");

    let past = client
        .request(json!({"op": "reserve", "item": item, "start": date(-1), "end": date(1)}))
        .await;
    assert_eq!(error_kind(&past), "validation");

    let malformed = client.request(json!({"op": "no_such_op"})).await;
    assert_eq!(error_kind(&malformed), "bad_request");

    // The connection survives all of the above.
    let fine = client
        .request(json!({"op": "reserve", "item": item, "start": date(1), "end": date(1)}))
        .await;
    assert_eq!(fine["ok"]["total_cost"], "50");
}

#[tokio::test]
async fn role_gates_apply_over_the_wire() {
    let addr = start_test_server().await;
    let mut customer = Client::connect(addr, "customer").await;

    let denied = customer
        .request(json!({"op": "add_category", "name": "Lifts"}))
        .await;
    assert_eq!(error_kind(&denied), "forbidden");

    let report = customer.request(json!({"op": "report"})).await;
    assert_eq!(error_kind(&report), "forbidden");
}

#[tokio::test]
async fn return_processing_flow() {
    let addr = start_test_server().await;
    let item = seed_item(addr).await;

    let mut renter = Client::connect(addr, "customer").await;
    let booked = renter
        .request(json!({"op": "reserve", "item": item, "start": date(0), "end": date(0)}))
        .await;
    let reservation = booked["ok"]["id"].as_str().unwrap().to_string();

    let mut clerk = Client::connect(addr, "staff").await;
    let feed = clerk.request(json!({"op": "due_back"})).await;
    assert_eq!(feed["ok"].as_array().unwrap().len(), 1);

    let done = clerk
        .request(json!({"op": "process_return", "reservation": reservation, "status": "completed"}))
        .await;
    assert_eq!(done["ok"]["status"], "completed");

    let empty = clerk.request(json!({"op": "due_back"})).await;
    assert!(empty["ok"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn watch_streams_booking_events() {
    let addr = start_test_server().await;
    let item = seed_item(addr).await;

    let mut watcher = Client::connect(addr, "staff").await;
    let ack = watcher.request(json!({"op": "watch", "item": item})).await;
    assert_eq!(ack["ok"]["watching"].as_str().unwrap(), item);

    let mut renter = Client::connect(addr, "customer").await;
    renter
        .request(json!({"op": "reserve", "item": item, "start": date(1), "end": date(2)}))
        .await;

    let event = watcher
        .next_event(Duration::from_secs(5))
        .await
        .expect("watcher should see the booking");
    assert!(
        event["event"].get("ReservationBooked").is_some(),
        "unexpected event: {event}"
    );
}

#[tokio::test]
async fn my_reservations_is_scoped_to_the_principal() {
    let addr = start_test_server().await;
    let item = seed_item(addr).await;

    let mut alice = Client::connect(addr, "customer").await;
    let booked = alice
        .request(json!({"op": "reserve", "item": item, "start": date(1), "end": date(2)}))
        .await;
    assert_eq!(
        booked["ok"]["customer"].as_str().unwrap(),
        alice.id.to_string()
    );

    let mine = alice.request(json!({"op": "my_reservations"})).await;
    assert_eq!(mine["ok"].as_array().unwrap().len(), 1);

    let mut bob = Client::connect(addr, "customer").await;
    let theirs = bob.request(json!({"op": "my_reservations"})).await;
    assert!(theirs["ok"].as_array().unwrap().is_empty());
}
