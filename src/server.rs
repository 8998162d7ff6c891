//! HTTP polling surface over the coordination core.
//!
//! A thin read-mostly API for dashboards and workers that cannot hold a
//! subscription open. Event delivery here is the polling fallback: clients
//! fetch the bounded recent-event window with `GET /api/events`.

use crate::cli::output::CliResponse;
use crate::core::bus::LivenessConfig;
use crate::core::conflict::FileClaim;
use crate::core::coordinator::Coordinator;
use crate::core::error::{ErrorCategory, Result, WeaverError};
use crate::core::store::TaskFilter;
use crate::core::task::TaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Interval between background maintenance passes while serving.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub events_limit: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            events_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Options,
}

impl ApiMethod {
    fn from_http(method: &tiny_http::Method) -> Option<Self> {
        match method {
            tiny_http::Method::Get => Some(Self::Get),
            tiny_http::Method::Post => Some(Self::Post),
            tiny_http::Method::Options => Some(Self::Options),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status_code: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub extra_headers: Vec<tiny_http::Header>,
}

impl ApiResponse {
    fn json<T: Serialize>(status_code: u16, value: &T) -> Result<Self> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| {
            WeaverError::system("json_serialize_failed", e.to_string(), "server:json")
        })?;
        Ok(Self {
            status_code,
            content_type: "application/json",
            body,
            extra_headers: Vec::new(),
        })
    }

    fn text(status_code: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            content_type,
            body: body.into(),
            extra_headers: Vec::new(),
        }
    }
}

fn ok_json<T: Serialize>(value: T) -> Result<ApiResponse> {
    let wrapped = CliResponse::success(value);
    let mut resp = ApiResponse::json(200, &wrapped)?;
    resp.extra_headers.extend(cors_headers());
    Ok(resp)
}

fn error_status(err: &WeaverError) -> u16 {
    match err.category {
        ErrorCategory::Validation => 400,
        ErrorCategory::NotFound => 404,
        ErrorCategory::Conflict => 409,
        ErrorCategory::Storage | ErrorCategory::System => 500,
    }
}

fn parse_query(url: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some((_path, qs)) = url.split_once('?') else {
        return out;
    };

    for part in qs.split('&') {
        if part.trim().is_empty() {
            continue;
        }

        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        out.insert(k.to_string(), v.to_string());
    }

    out
}

fn cors_headers() -> Vec<tiny_http::Header> {
    vec![
        tiny_http::Header::from_bytes(&b"Access-Control-Allow-Origin"[..], &b"*"[..])
            .expect("static header"),
        tiny_http::Header::from_bytes(
            &b"Access-Control-Allow-Methods"[..],
            &b"GET, POST, OPTIONS"[..],
        )
        .expect("static header"),
        tiny_http::Header::from_bytes(&b"Access-Control-Allow-Headers"[..], &b"Content-Type"[..])
            .expect("static header"),
    ]
}

fn parse_json_body<T: for<'de> Deserialize<'de>>(body: Option<&[u8]>, origin: &str) -> Result<T> {
    let raw = body.ok_or_else(|| {
        WeaverError::validation("request_body_required", "Request body is required", origin)
    })?;

    serde_json::from_slice(raw).map_err(|e| {
        WeaverError::validation(
            "invalid_json_body",
            format!("Invalid JSON body: {e}"),
            origin,
        )
    })
}

/// Combined snapshot for dashboards: everything in one poll.
#[derive(Debug, Serialize)]
pub struct UiState {
    pub streams: Vec<crate::core::stream::Stream>,
    pub tasks: Vec<crate::core::task::Task>,
    pub agents: Vec<crate::core::coordinator::AgentActivity>,
    pub events: Vec<crate::core::events::Event>,
}

#[derive(Debug, Deserialize)]
struct ConflictCheckRequest {
    files: Vec<String>,
    #[serde(default)]
    excluding_stream: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConflictCheckResponse {
    clear: bool,
    claims: Vec<FileClaim>,
}

fn task_filter_from_query(query: &HashMap<String, String>, origin: &str) -> Result<TaskFilter> {
    let status = match query.get("status") {
        Some(raw) => Some(TaskStatus::from_str(raw).map_err(|_| {
            WeaverError::validation(
                "invalid_status",
                format!("Invalid task status '{raw}'"),
                origin,
            )
            .with_hint("Use pending, in_progress, blocked, completed, or cancelled")
        })?),
        None => None,
    };
    let parent = match query.get("parent") {
        Some(raw) => Some(uuid::Uuid::parse_str(raw).map_err(|_| {
            WeaverError::validation(
                "invalid_parent_id",
                format!("Invalid parent id '{raw}'"),
                origin,
            )
        })?),
        None => None,
    };

    Ok(TaskFilter {
        stream: query.get("stream").cloned(),
        status,
        agent: query.get("agent").cloned(),
        parent,
    })
}

pub fn handle_api_request(
    method: ApiMethod,
    url: &str,
    default_events_limit: usize,
    body: Option<&[u8]>,
    coordinator: &Coordinator,
) -> Result<ApiResponse> {
    if method == ApiMethod::Options {
        let mut resp = ApiResponse::text(204, "text/plain", "");
        resp.extra_headers.extend(cors_headers());
        return Ok(resp);
    }

    let (path, _qs) = url.split_once('?').unwrap_or((url, ""));

    match path {
        "/health" if method == ApiMethod::Get => {
            let mut resp = ApiResponse::text(200, "text/plain", "ok\n");
            resp.extra_headers.extend(cors_headers());
            Ok(resp)
        }
        "/api/version" if method == ApiMethod::Get => {
            ok_json(serde_json::json!({"version": env!("CARGO_PKG_VERSION")}))
        }
        "/api/state" if method == ApiMethod::Get => {
            let query = parse_query(url);
            let events_limit = query
                .get("events_limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default_events_limit);
            ok_json(UiState {
                streams: coordinator.list_streams(),
                tasks: coordinator.list_tasks(&TaskFilter::default()),
                agents: coordinator.agent_activity(),
                events: coordinator.bus().recent(events_limit),
            })
        }
        "/api/streams" if method == ApiMethod::Get => ok_json(coordinator.list_streams()),
        "/api/tasks" if method == ApiMethod::Get => {
            let query = parse_query(url);
            let filter = task_filter_from_query(&query, "server:tasks")?;
            ok_json(coordinator.list_tasks(&filter))
        }
        "/api/agents" if method == ApiMethod::Get => ok_json(coordinator.agent_activity()),
        "/api/events" if method == ApiMethod::Get => {
            let query = parse_query(url);
            let limit = query
                .get("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default_events_limit);
            ok_json(coordinator.bus().recent(limit))
        }
        "/api/conflicts/check" if method == ApiMethod::Post => {
            let req: ConflictCheckRequest = parse_json_body(body, "server:conflicts")?;
            let claims =
                coordinator.check_conflicts(&req.files, req.excluding_stream.as_deref());
            ok_json(ConflictCheckResponse {
                clear: claims.is_empty(),
                claims,
            })
        }
        _ => {
            if let Some(stream_id) = path
                .strip_prefix("/api/streams/")
                .filter(|rest| method == ApiMethod::Get && !rest.is_empty())
            {
                let (stream, tasks) = coordinator.get_stream(stream_id)?;
                return ok_json(serde_json::json!({
                    "stream": stream,
                    "tasks": tasks,
                }));
            }

            let err = WeaverError::not_found(
                "endpoint_not_found",
                format!("No such endpoint: {path}"),
                "server:dispatch",
            );
            let wrapped = CliResponse::<()>::error(&err);
            let mut resp = ApiResponse::json(404, &wrapped)?;
            resp.extra_headers.extend(cors_headers());
            Ok(resp)
        }
    }
}

/// Runs [`Coordinator::maintenance`] on an interval.
///
/// Holds only a weak reference; the loop exits once every other holder has
/// dropped the coordinator, so tests and embedders can shut it down by
/// dropping their `Arc`.
pub fn spawn_maintenance(
    coordinator: &Arc<Coordinator>,
    interval: Duration,
) -> thread::JoinHandle<()> {
    let weak: Weak<Coordinator> = Arc::downgrade(coordinator);
    thread::spawn(move || loop {
        thread::sleep(interval);
        let Some(coordinator) = weak.upgrade() else {
            break;
        };
        if let Err(e) = coordinator.maintenance(LivenessConfig::default()) {
            eprintln!("maintenance pass failed: {e}");
        }
    })
}

pub fn serve(config: &ServeConfig) -> Result<()> {
    let coordinator = Arc::new(Coordinator::open()?);
    let addr = format!("{}:{}", config.host, config.port);
    let server = tiny_http::Server::http(&addr)
        .map_err(|e| WeaverError::system("server_bind_failed", e.to_string(), "server:serve"))?;

    let _maintenance = spawn_maintenance(&coordinator, MAINTENANCE_INTERVAL);
    eprintln!("weaver serve listening on http://{addr}");

    for mut req in server.incoming_requests() {
        let Some(method) = ApiMethod::from_http(req.method()) else {
            let _ = req.respond(tiny_http::Response::empty(405));
            continue;
        };

        let mut request_body = Vec::new();
        if method == ApiMethod::Post {
            let _ = req.as_reader().read_to_end(&mut request_body);
        }

        let response = match handle_api_request(
            method,
            req.url(),
            config.events_limit,
            if request_body.is_empty() {
                None
            } else {
                Some(request_body.as_slice())
            },
            &coordinator,
        ) {
            Ok(r) => r,
            Err(e) => {
                let wrapped = CliResponse::<()>::error(&e);
                match ApiResponse::json(error_status(&e), &wrapped) {
                    Ok(mut r) => {
                        r.extra_headers.extend(cors_headers());
                        r
                    }
                    Err(_) => ApiResponse::text(500, "text/plain", "internal error\n"),
                }
            }
        };

        let mut tiny = tiny_http::Response::from_data(response.body)
            .with_status_code(response.status_code)
            .with_header(
                tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    response.content_type.as_bytes(),
                )
                .expect("content-type header"),
            );

        for h in response.extra_headers {
            tiny = tiny.with_header(h);
        }

        let _ = req.respond(tiny);
    }

    Ok(())
}
