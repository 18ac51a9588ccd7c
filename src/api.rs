//! HTTP API.
//!
//! Requests are served in parallel; the only serialization point is the
//! per-probe lock inside the dispatcher. Mutating endpoints answer JSON
//! with a `status` field and, where tool output exists, a `log` field.

use crate::config::{HubConfig, Mode};
use crate::dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::DispatchError;
use crate::inventory::{self, ProbeStatus, SearchQuery};
use crate::session::{SessionInfo, SessionKind, StopKind};
use crate::staging::{StagedFirmware, StagingArea};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

/// Abort uploads that stall for this long between chunks.
pub const UPLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handler state.
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub dispatcher: Dispatcher,
    pub staging: StagingArea,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = (state.config.server.max_upload_mb as usize + 1) * 1024 * 1024;
    Router::new()
        .route("/status", get(handler_status))
        .route("/probes", get(handler_probes))
        .route("/probes/search", get(handler_probe_search))
        .route("/targets", get(handler_targets))
        .route("/dispatch", post(handler_dispatch))
        .route("/session/stop", post(handler_session_stop))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// One `/status` row: catalog join plus the live session, if any.
#[derive(Serialize)]
struct StatusRecord {
    #[serde(flatten)]
    status: ProbeStatus,
    busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionInfo>,
}

/// GET /status
async fn handler_status(State(state): State<Arc<AppState>>) -> Json<Vec<StatusRecord>> {
    let devices = inventory::scan();
    let table = state.dispatcher.table();
    let records = inventory::all_probe_status(&state.config.probes, &devices)
        .into_iter()
        .map(|status| {
            let session = table.snapshot(status.id);
            StatusRecord {
                busy: session.is_some(),
                session,
                status,
            }
        })
        .collect();
    Json(records)
}

/// GET /probes
async fn handler_probes(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "probes": state.config.probes }))
}

/// GET /probes/search
async fn handler_probe_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Json<Value> {
    let result = inventory::search_probes(&state.config.probes, &query);
    Json(serde_json::to_value(result).unwrap_or(Value::Null))
}

#[derive(Serialize)]
struct TargetView {
    description: String,
    compatible_probes: BTreeMap<&'static str, Vec<String>>,
    container: crate::config::ContainerSelect,
    transports: BTreeMap<String, crate::config::TransportPolicy>,
}

/// GET /targets
async fn handler_targets(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut targets = BTreeMap::new();
    for (name, target) in &state.config.targets {
        let mut compatible = BTreeMap::new();
        for mode in [Mode::Debug, Mode::Flash, Mode::Print] {
            compatible.insert(
                mode.as_str(),
                target.compatible_probes.for_mode(mode).to_vec(),
            );
        }
        let transports = target
            .compatible_probes
            .all_interfaces()
            .into_iter()
            .map(|iface| {
                (
                    iface.to_string(),
                    state.config.transport_policy(name, iface),
                )
            })
            .collect();
        targets.insert(
            name.clone(),
            TargetView {
                description: target.description.clone(),
                compatible_probes: compatible,
                container: target.container.clone(),
                transports,
            },
        );
    }
    Json(json!({ "targets": targets }))
}

/// POST /dispatch (multipart/form)
async fn handler_dispatch(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut target: Option<String> = None;
    let mut probe: Option<String> = None;
    let mut mode: Option<String> = None;
    let mut transport: Option<String> = None;
    let mut firmware: Option<StagedFirmware> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "target" => target = Some(field.text().await.map_err(invalid)?),
            "probe" => probe = Some(field.text().await.map_err(invalid)?),
            "mode" => mode = Some(field.text().await.map_err(invalid)?),
            "transport" => {
                let value = field.text().await.map_err(invalid)?;
                if !value.trim().is_empty() {
                    transport = Some(value);
                }
            }
            "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("firmware.bin")
                    .to_string();
                let mut upload = state
                    .staging
                    .begin(&filename)
                    .await
                    .map_err(DispatchError::from)?;
                loop {
                    let chunk = tokio::time::timeout(UPLOAD_IDLE_TIMEOUT, field.chunk())
                        .await
                        .map_err(|_| {
                            DispatchError::InvalidRequest(
                                "upload stalled, aborting".to_string(),
                            )
                        })?
                        .map_err(invalid)?;
                    match chunk {
                        Some(bytes) => upload
                            .write_chunk(&bytes)
                            .await
                            .map_err(DispatchError::from)?,
                        None => break,
                    }
                }
                firmware = Some(upload.finish().await.map_err(DispatchError::from)?);
            }
            other => {
                return Err(DispatchError::InvalidRequest(format!(
                    "unknown field '{other}'"
                ))
                .into());
            }
        }
    }

    let target = target
        .ok_or_else(|| DispatchError::InvalidRequest("missing field 'target'".to_string()))?;
    let probe_id: u32 = probe
        .ok_or_else(|| DispatchError::InvalidRequest("missing field 'probe'".to_string()))?
        .trim()
        .parse()
        .map_err(|_| DispatchError::InvalidRequest("field 'probe' must be an integer".to_string()))?;
    let mode: Mode = mode
        .ok_or_else(|| DispatchError::InvalidRequest("missing field 'mode'".to_string()))?
        .trim()
        .parse()
        .map_err(DispatchError::InvalidRequest)?;

    let request = DispatchRequest {
        target,
        probe_id,
        mode,
        transport,
        firmware,
    };

    let devices = inventory::scan();
    let outcome = state.dispatcher.dispatch(request, &devices).await?;
    Ok(Json(dispatch_response(outcome)))
}

fn dispatch_response(outcome: DispatchOutcome) -> Value {
    match outcome {
        DispatchOutcome::Flash {
            exit_code,
            log,
            duration_ms,
        } => json!({
            "status": "ok",
            "exit_code": exit_code,
            "log": log,
            "duration_ms": duration_ms,
        }),
        DispatchOutcome::Started { kind, ports } => match kind {
            SessionKind::Print => json!({
                "status": "started",
                "mode": kind,
                "print_port": ports.print,
            }),
            _ => json!({
                "status": "started",
                "mode": kind,
                "gdb_port": ports.gdb,
                "telnet_port": ports.telnet,
                "rtt_port": ports.rtt,
            }),
        },
    }
}

#[derive(Deserialize)]
struct StopForm {
    probe: String,
    #[serde(default)]
    kind: Option<String>,
}

/// POST /session/stop (form)
async fn handler_session_stop(
    State(state): State<Arc<AppState>>,
    Form(form): Form<StopForm>,
) -> Result<Response, ApiError> {
    let probe_id: u32 = form.probe.trim().parse().map_err(|_| {
        DispatchError::InvalidRequest("field 'probe' must be an integer".to_string())
    })?;
    let kind: StopKind = match form.kind.as_deref() {
        None | Some("") => StopKind::All,
        Some(s) => s.parse().map_err(DispatchError::InvalidRequest)?,
    };

    let stopped = state.dispatcher.table().stop(probe_id, kind).await;
    if stopped.is_empty() {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "no_session",
                "log": format!("no matching session on probe {probe_id}"),
            })),
        )
            .into_response());
    }

    let log = stopped
        .iter()
        .map(|kind| format!("stopped {kind} session on probe {probe_id}"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok((StatusCode::OK, Json(json!({ "status": "ok", "log": log }))).into_response())
}

/// Error wrapper mapping dispatch errors onto the wire contract.
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.http_status() >= 500 {
            error!(kind = err.kind(), error = %err, "dispatch failed");
        }
        let status = StatusCode::from_u16(err.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "status": err.kind(),
            "error": err.to_string(),
        });
        if let Some(log) = err.log() {
            body["log"] = Value::String(log.to_string());
        }
        (status, Json(body)).into_response()
    }
}

fn invalid(e: axum::extract::multipart::MultipartError) -> DispatchError {
    DispatchError::InvalidRequest(format!("malformed multipart body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_reaches_the_wire() {
        let response = ApiError(DispatchError::ProbeBusy(1)).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError(DispatchError::UnknownTarget("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(DispatchError::ProbeNotConnected(1)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn flash_response_shape() {
        let value = dispatch_response(DispatchOutcome::Flash {
            exit_code: 0,
            log: "done".into(),
            duration_ms: 1200,
        });
        assert_eq!(value["status"], "ok");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["log"], "done");
    }

    #[test]
    fn started_response_carries_ports() {
        let ports = crate::ports::PortBases::default().plan(1);
        let value = dispatch_response(DispatchOutcome::Started {
            kind: SessionKind::Debug,
            ports,
        });
        assert_eq!(value["status"], "started");
        assert_eq!(value["gdb_port"], 3331);
        assert_eq!(value["telnet_port"], 3431);
        assert_eq!(value["rtt_port"], 3531);

        let value = dispatch_response(DispatchOutcome::Started {
            kind: SessionKind::Print,
            ports,
        });
        assert_eq!(value["status"], "started");
        assert_eq!(value["print_port"], 3631);
        assert!(value.get("gdb_port").is_none());
    }
}
