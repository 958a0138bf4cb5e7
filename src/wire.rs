use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::auth::Gatekeeper;
use crate::engine::{Engine, EngineError, LineRequest};
use crate::limits::MAX_WIRE_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::policy::{Principal, Role};

/// First line of every connection: shared secret plus the resolved principal
/// on whose behalf all further requests run.
#[derive(Debug, Deserialize)]
struct Hello {
    op: String,
    password: String,
    principal: Principal,
}

#[derive(Debug, Deserialize)]
pub struct WireLine {
    pub item: Ulid,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// One request per line, newline-delimited JSON, discriminated by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Reserve {
        item: Ulid,
        start: Option<String>,
        end: Option<String>,
    },
    ReserveMany {
        lines: Vec<WireLine>,
        start: Option<String>,
        end: Option<String>,
    },
    Cancel {
        reservation: Ulid,
    },
    ProcessReturn {
        reservation: Ulid,
        status: ReservationStatus,
    },
    ScheduleMaintenance {
        item: Ulid,
        date: DateTime<Utc>,
        description: String,
    },
    SetMaintenanceStatus {
        maintenance: Ulid,
        status: MaintenanceStatus,
    },
    AddCategory {
        name: String,
        #[serde(default)]
        description: String,
    },
    UpdateCategory {
        category: Ulid,
        name: String,
        #[serde(default)]
        description: String,
    },
    DeleteCategory {
        category: Ulid,
    },
    AddItem {
        name: String,
        #[serde(default)]
        description: String,
        category: Ulid,
        daily_rate: Money,
        condition: String,
    },
    UpdateItem {
        item: Ulid,
        name: String,
        #[serde(default)]
        description: String,
        category: Ulid,
        daily_rate: Money,
        condition: String,
    },
    DeleteItem {
        item: Ulid,
    },
    SetAvailable {
        item: Ulid,
        available: bool,
    },
    ProvisionProfile {
        user: Ulid,
        username: String,
        role: Role,
    },
    ChangeRole {
        user: Ulid,
        role: Role,
    },
    DeleteProfile {
        user: Ulid,
    },
    GetItem {
        item: Ulid,
    },
    ListItems {
        #[serde(default)]
        category: Option<Ulid>,
        #[serde(default)]
        available_only: bool,
    },
    ListCategories,
    MyReservations,
    DueBack,
    MaintenanceSchedule,
    Report,
    Watch {
        item: Ulid,
    },
}

/// Serve one authenticated connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    gate: Arc<Gatekeeper>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN));

    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let principal = match serde_json::from_str::<Hello>(&first?) {
        Ok(hello) if hello.op == "hello" => {
            match gate.authenticate(&hello.password, hello.principal) {
                Ok(principal) => principal,
                Err(e) => {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    send_error(&mut framed, "unauthorized", &e.to_string()).await?;
                    return Ok(());
                }
            }
        }
        _ => {
            send_error(&mut framed, "bad_request", "expected a hello message").await?;
            return Ok(());
        }
    };
    send_ok(
        &mut framed,
        json!({"server": "rentd", "version": env!("CARGO_PKG_VERSION")}),
    )
    .await?;

    let mut watch_rx: Option<broadcast::Receiver<Event>> = None;
    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else { break };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let req: Request = match serde_json::from_str(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        send_error(&mut framed, "bad_request", &format!("malformed request: {e}")).await?;
                        continue;
                    }
                };
                // Watch swaps the connection's subscription; everything else
                // is a plain request/response round trip.
                if let Request::Watch { item } = &req {
                    let item = *item;
                    watch_rx = Some(engine.notify.subscribe(item));
                    send_ok(&mut framed, json!({"watching": item})).await?;
                    continue;
                }
                let op = observability::op_label(&req);
                let started = Instant::now();
                let outcome = handle_request(&engine, &principal, req).await;
                metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
                    .record(started.elapsed().as_secs_f64());
                match outcome {
                    Ok(value) => {
                        metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => "ok")
                            .increment(1);
                        send_ok(&mut framed, value).await?;
                    }
                    Err(e) => {
                        metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => e.kind())
                            .increment(1);
                        send_error(&mut framed, e.kind(), &e.to_string()).await?;
                    }
                }
            }
            event = watch_recv(&mut watch_rx) => {
                match event {
                    Some(event) => {
                        framed.send(json!({"event": event}).to_string()).await?;
                    }
                    None => watch_rx = None,
                }
            }
        }
    }
    Ok(())
}

/// Await the next watched event, or park forever when nothing is watched.
async fn watch_recv(rx: &mut Option<broadcast::Receiver<Event>>) -> Option<Event> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

async fn handle_request(
    engine: &Engine,
    principal: &Principal,
    req: Request,
) -> Result<serde_json::Value, EngineError> {
    match req {
        Request::Reserve { item, start, end } => {
            let range = parse_range(start.as_deref(), end.as_deref())?;
            let reservation = engine.reserve(principal, item, range).await?;
            Ok(to_value(reservation))
        }
        Request::ReserveMany { lines, start, end } => {
            let range = parse_range(start.as_deref(), end.as_deref())?;
            let lines: Vec<LineRequest> = lines
                .iter()
                .map(|l| LineRequest {
                    item_id: l.item,
                    quantity: l.quantity,
                })
                .collect();
            let reservation = engine.reserve_many(principal, &lines, range).await?;
            Ok(to_value(reservation))
        }
        Request::Cancel { reservation } => {
            let outcome = engine.cancel(principal, reservation).await?;
            Ok(json!({
                "reservation": reservation,
                "cancelled": true,
                "already_cancelled": matches!(outcome, crate::engine::CancelOutcome::AlreadyCancelled),
            }))
        }
        Request::ProcessReturn {
            reservation,
            status,
        } => {
            let reservation = engine.process_return(principal, reservation, status).await?;
            Ok(to_value(reservation))
        }
        Request::ScheduleMaintenance {
            item,
            date,
            description,
        } => {
            let record = engine
                .schedule_maintenance(principal, item, date, &description)
                .await?;
            Ok(to_value(record))
        }
        Request::SetMaintenanceStatus {
            maintenance,
            status,
        } => {
            let record = engine
                .update_maintenance_status(principal, maintenance, status)
                .await?;
            Ok(to_value(record))
        }
        Request::AddCategory { name, description } => {
            let category = engine.create_category(principal, &name, &description).await?;
            Ok(to_value(category))
        }
        Request::UpdateCategory {
            category,
            name,
            description,
        } => {
            let category = engine
                .update_category(principal, category, &name, &description)
                .await?;
            Ok(to_value(category))
        }
        Request::DeleteCategory { category } => {
            engine.delete_category(principal, category).await?;
            Ok(json!({"deleted": category}))
        }
        Request::AddItem {
            name,
            description,
            category,
            daily_rate,
            condition,
        } => {
            let item = engine
                .register_item(principal, &name, &description, category, daily_rate, &condition)
                .await?;
            Ok(to_value(item))
        }
        Request::UpdateItem {
            item,
            name,
            description,
            category,
            daily_rate,
            condition,
        } => {
            let item = engine
                .update_item(principal, item, &name, &description, category, daily_rate, &condition)
                .await?;
            Ok(to_value(item))
        }
        Request::DeleteItem { item } => {
            engine.delete_item(principal, item).await?;
            Ok(json!({"deleted": item}))
        }
        Request::SetAvailable { item, available } => {
            let item = engine.set_available(principal, item, available).await?;
            Ok(to_value(item))
        }
        Request::ProvisionProfile {
            user,
            username,
            role,
        } => {
            let profile = engine
                .provision_profile(principal, user, &username, role)
                .await?;
            Ok(to_value(profile))
        }
        Request::ChangeRole { user, role } => {
            let profile = engine.change_role(principal, user, role).await?;
            Ok(to_value(profile))
        }
        Request::DeleteProfile { user } => {
            engine.delete_profile(principal, user).await?;
            Ok(json!({"deleted": user}))
        }
        Request::GetItem { item } => match engine.get_item(item).await {
            Some(item) => Ok(to_value(item)),
            None => Err(EngineError::NotFound(item)),
        },
        Request::ListItems {
            category,
            available_only,
        } => Ok(to_value(engine.list_items(category, available_only).await)),
        Request::ListCategories => Ok(to_value(engine.list_categories())),
        Request::MyReservations => Ok(to_value(engine.my_reservations(principal))),
        Request::DueBack => Ok(to_value(engine.reservations_due_back(principal)?)),
        Request::MaintenanceSchedule => Ok(to_value(engine.maintenance_schedule(principal)?)),
        Request::Report => Ok(to_value(engine.report_summary(principal).await?)),
        Request::Watch { .. } => unreachable!("watch is handled by the connection loop"),
    }
}

/// Both dates must be present and `YYYY-MM-DD`; everything else about the
/// range is the engine's to judge.
fn parse_range(start: Option<&str>, end: Option<&str>) -> Result<DateRange, EngineError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(EngineError::Validation("start and end dates are required"));
    };
    DateRange::parse(start, end)
        .map_err(|_| EngineError::Validation("dates must be YYYY-MM-DD"))
}

fn to_value<T: Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

async fn send_ok(
    framed: &mut Framed<TcpStream, LinesCodec>,
    data: serde_json::Value,
) -> Result<(), LinesCodecError> {
    framed.send(json!({"ok": data}).to_string()).await
}

async fn send_error(
    framed: &mut Framed<TcpStream, LinesCodec>,
    kind: &str,
    message: &str,
) -> Result<(), LinesCodecError> {
    framed
        .send(json!({"error": {"kind": kind, "message": message}}).to_string())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parsing() {
        let req: Request = serde_json::from_str(
            r#"{"op":"reserve","item":"01ARZ3NDEKTSV4RRFFQ69G5FAV","start":"2030-06-01","end":"2030-06-04"}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::Reserve { .. }));

        let req: Request = serde_json::from_str(
            r#"{"op":"set_maintenance_status","maintenance":"01ARZ3NDEKTSV4RRFFQ69G5FAV","status":"in_progress"}"#,
        )
        .unwrap();
        assert!(matches!(
            req,
            Request::SetMaintenanceStatus {
                status: MaintenanceStatus::InProgress,
                ..
            }
        ));

        assert!(serde_json::from_str::<Request>(r#"{"op":"no_such_op"}"#).is_err());
    }

    #[test]
    fn reserve_line_defaults_quantity() {
        let req: Request = serde_json::from_str(
            r#"{"op":"reserve_many","lines":[{"item":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}],"start":"2030-06-01","end":"2030-06-02"}"#,
        )
        .unwrap();
        match req {
            Request::ReserveMany { lines, .. } => assert_eq!(lines[0].quantity, 1),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_range_requires_both_dates() {
        assert!(matches!(
            parse_range(Some("2030-06-01"), None),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            parse_range(None, Some("2030-06-04")),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            parse_range(Some("junk"), Some("2030-06-04")),
            Err(EngineError::Validation(_))
        ));
        assert!(parse_range(Some("2030-06-01"), Some("2030-06-04")).is_ok());
    }
}
