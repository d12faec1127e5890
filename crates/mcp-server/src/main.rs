use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chronoedge::{
    BiTemporalStore, ContextWindowParams, EdgeId, EdgeOptions, FileChange, MaintenanceScheduler,
    Node, RedbGraphStore, TemporalConfig, TemporalQuery, TemporalType,
};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_ID_BYTES: usize = 1024;
const MAX_REASON_BYTES: usize = 8 * 1024;
const MAX_EVIDENCE_ITEMS: usize = 64;

struct AppState {
    store: Arc<BiTemporalStore>,
    graph: Arc<RedbGraphStore>,
}

impl AppState {
    fn open() -> Result<Self> {
        let db_path = env::var("CHRONOEDGE_DB_PATH")
            .unwrap_or_else(|_| "./chronoedge-graph.redb".to_string());
        let config = match env::var("CHRONOEDGE_CONFIG") {
            Ok(path) => TemporalConfig::from_path(&path)
                .with_context(|| format!("failed to load config {path}"))?,
            Err(_) => TemporalConfig::default(),
        };
        let graph = Arc::new(RedbGraphStore::open(&db_path)?);
        Self::with_graph(graph, config)
    }

    fn with_graph(graph: Arc<RedbGraphStore>, config: TemporalConfig) -> Result<Self> {
        let store = Arc::new(BiTemporalStore::new(graph.clone(), config)?);
        Ok(Self { store, graph })
    }
}

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let state = AppState::open().context("failed to open chronoedge store")?;
    let scheduler = MaintenanceScheduler::start(state.store.clone())?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing gets a -32700 reply; the server keeps reading.
                tracing::warn!(error = %e, "unreadable message");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    scheduler.shutdown()?;
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "chronoedge-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    tracing::debug!(error = %err, "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    let time = json!({"type": "string", "format": "date-time"});
    vec![
        json!({
            "name": "upsert_node",
            "description": "Register or replace a code entity in the graph.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "name": {"type": "string"},
                    "kind": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["id", "kind"]
            }
        }),
        json!({
            "name": "create_edge",
            "description": "Record a relationship with its valid-time start.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "source": {"type": "string"},
                    "target": {"type": "string"},
                    "relation": {"type": "string"},
                    "valid_from": time,
                    "valid_to": time,
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                    "evidence": {"type": "array", "items": {"type": "string"}},
                    "reason": {"type": "string"},
                    "temporal_type": {"enum": ["snapshot", "continuous", "periodic", "event-driven"]}
                },
                "required": ["source", "target", "relation"]
            }
        }),
        json!({
            "name": "invalidate_edge",
            "description": "Close an edge's valid time, preserving its history.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "edge_id": {"type": "string"},
                    "at": time,
                    "reason": {"type": "string"},
                    "evidence": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["edge_id"]
            }
        }),
        json!({
            "name": "restore_edge",
            "description": "Reopen a previously invalidated edge.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "edge_id": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["edge_id"]
            }
        }),
        json!({
            "name": "get_edge",
            "description": "Return one edge with its full revision ledger.",
            "inputSchema": {
                "type": "object",
                "properties": { "edge_id": {"type": "string"} },
                "required": ["edge_id"]
            }
        }),
        json!({
            "name": "create_context_window",
            "description": "Define a named project epoch.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "valid_from": time,
                    "valid_to": time,
                    "description": {"type": "string"},
                    "project_phase": {"type": "string"},
                    "framework_versions": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["name"]
            }
        }),
        json!({
            "name": "set_context_window",
            "description": "Make a context window active for new edges.",
            "inputSchema": {
                "type": "object",
                "properties": { "id": {"type": "string"} },
                "required": ["id"]
            }
        }),
        json!({
            "name": "context_windows_at",
            "description": "List context windows covering an instant.",
            "inputSchema": {
                "type": "object",
                "properties": { "at": time }
            }
        }),
        json!({
            "name": "query",
            "description": "Bi-temporal query over edges.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "as_of": time,
                    "valid_at": time,
                    "valid_during": {
                        "type": "object",
                        "properties": { "start": time, "end": time },
                        "required": ["start"]
                    },
                    "context_window": {"type": "string"},
                    "temporal_operator": {"type": "string"},
                    "resolve_entities": {"type": "boolean"}
                }
            }
        }),
        json!({
            "name": "file_changed",
            "description": "Report a file change; invalidates edges of entities in that file.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "change": {"enum": ["created", "modified", "deleted"]}
                },
                "required": ["path", "change"]
            }
        }),
        json!({
            "name": "snapshot",
            "description": "Capture the full temporal state.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "stats",
            "description": "Summary statistics for the store.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "export",
            "description": "Export all edges, context windows and snapshots.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "run_maintenance",
            "description": "Run one maintenance cycle immediately.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "upsert_node" => {
            let id = required_str(&args, "id")?;
            let kind = required_str(&args, "kind")?;
            let name = optional_str(&args, "name")?.unwrap_or(id);
            let mut node = Node::new(id, name, kind);
            if let Some(path) = optional_str(&args, "path")? {
                node = node.with_path(path);
            }
            state.graph.upsert_node(&node)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("stored node {id}") }],
                "structuredContent": { "node": node }
            }))
        }
        "create_edge" => {
            let source = required_str(&args, "source")?;
            let target = required_str(&args, "target")?;
            let relation = required_str(&args, "relation")?;
            let valid_from = optional_time(&args, "valid_from")?.unwrap_or_else(Utc::now);
            let temporal_type = match args.get("temporal_type") {
                Some(v) => serde_json::from_value::<TemporalType>(v.clone())
                    .context("temporal_type must be snapshot, continuous, periodic or event-driven")?,
                None => TemporalType::default(),
            };
            let options = EdgeOptions {
                valid_end: optional_time(&args, "valid_to")?,
                confidence: match args.get("confidence") {
                    Some(v) => Some(v.as_f64().context("confidence must be a number")? as f32),
                    None => None,
                },
                evidence: evidence(&args)?,
                reason: optional_str(&args, "reason")?.map(str::to_string),
                temporal_type,
                discovered_by: Some("mcp".to_string()),
                ..EdgeOptions::default()
            };
            let edge = state
                .store
                .create_bitemporal_edge(source, target, relation, valid_from, options)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("created edge {}", edge.id) }],
                "structuredContent": { "edge": edge }
            }))
        }
        "invalidate_edge" => {
            let edge_id = EdgeId::from(required_str(&args, "edge_id")?);
            let at = optional_time(&args, "at")?;
            let reason = optional_str(&args, "reason")?;
            let edge = state
                .store
                .invalidate_relationship(&edge_id, at, reason, evidence(&args)?)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("invalidated edge {edge_id}") }],
                "structuredContent": { "edge": edge }
            }))
        }
        "restore_edge" => {
            let edge_id = EdgeId::from(required_str(&args, "edge_id")?);
            let reason = optional_str(&args, "reason")?;
            let edge = state.store.restore_relationship(&edge_id, reason)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("restored edge {edge_id}") }],
                "structuredContent": { "edge": edge }
            }))
        }
        "get_edge" => {
            let edge_id = EdgeId::from(required_str(&args, "edge_id")?);
            let edge = state.store.get_edge(&edge_id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("edge {edge_id}: {} revision(s)", edge.transaction_time.revisions.len()) }],
                "structuredContent": { "edge": edge }
            }))
        }
        "create_context_window" => {
            let name = required_str(&args, "name")?;
            let start = optional_time(&args, "valid_from")?.unwrap_or_else(Utc::now);
            let mut params = ContextWindowParams::new(name, start);
            params.valid_end = optional_time(&args, "valid_to")?;
            params.description = optional_str(&args, "description")?
                .unwrap_or_default()
                .to_string();
            params.project_phase = optional_str(&args, "project_phase")?.map(str::to_string);
            if let Some(versions) = args.get("framework_versions") {
                params.framework_versions =
                    serde_json::from_value::<BTreeMap<String, String>>(versions.clone())
                        .context("framework_versions must map names to version strings")?;
            }
            let window = state.store.create_context_window(params)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("created context window {}", window.id) }],
                "structuredContent": { "context_window": window }
            }))
        }
        "set_context_window" => {
            let id = required_str(&args, "id")?;
            state.store.set_current_context_window(id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("active context window is {id}") }],
                "structuredContent": { "active": id }
            }))
        }
        "context_windows_at" => {
            let at = optional_time(&args, "at")?.unwrap_or_else(Utc::now);
            let windows = state.store.context_windows_at(at)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} context window(s) at {}", windows.len(), at.to_rfc3339()) }],
                "structuredContent": { "context_windows": windows }
            }))
        }
        "query" => {
            let resolve = args
                .get("resolve_entities")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            let mut query_args = args.clone();
            if let Some(obj) = query_args.as_object_mut() {
                obj.remove("resolve_entities");
            }
            let query: TemporalQuery =
                serde_json::from_value(query_args).context("invalid query arguments")?;
            let result = state.store.query_bitemporal(&query)?;
            let entities = if resolve {
                state.store.resolve_entities(&result.related_entities)?
            } else {
                Vec::new()
            };
            Ok(json!({
                "content": [{ "type": "text", "text": format!("found {} edge(s)", result.edges.len()) }],
                "structuredContent": { "result": result, "entities": entities }
            }))
        }
        "file_changed" => {
            let path = required_str(&args, "path")?;
            let change: FileChange = required_str(&args, "change")?.parse()?;
            let invalidated = state.store.on_file_changed(path, change)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{path} {change}: invalidated {} edge(s)", invalidated.len()) }],
                "structuredContent": { "invalidated": invalidated }
            }))
        }
        "snapshot" => {
            let snapshot = state.store.create_temporal_snapshot()?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("snapshot {} with {} edge(s)", snapshot.id, snapshot.edges.len()) }],
                "structuredContent": { "snapshot_id": snapshot.id, "taken_at": snapshot.taken_at }
            }))
        }
        "stats" => {
            let stats = state.store.get_bitemporal_stats()?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} edge(s), {} currently valid", stats.total_edges, stats.currently_valid_edges) }],
                "structuredContent": { "stats": stats }
            }))
        }
        "export" => {
            let export = state.store.export_temporal_data()?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("exported {} edge(s)", export.edges.len()) }],
                "structuredContent": { "export": export }
            }))
        }
        "run_maintenance" => {
            let report = state.store.run_maintenance()?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("maintenance: {} decayed, {} pruned", report.edges_decayed, report.edges_pruned) }],
                "structuredContent": { "report": report }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn required_str<'a>(args: &'a JsonValue, key: &str) -> Result<&'a str> {
    optional_str(args, key)?.with_context(|| format!("{key} is required"))
}

fn optional_str<'a>(args: &'a JsonValue, key: &str) -> Result<Option<&'a str>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    let s = v
        .as_str()
        .with_context(|| format!("{key} must be a string"))?;
    let limit = if key == "reason" || key == "description" {
        MAX_REASON_BYTES
    } else {
        MAX_ID_BYTES
    };
    if s.len() > limit {
        anyhow::bail!("{key} exceeds max allowed size ({limit} bytes)");
    }
    Ok(Some(s))
}

fn optional_time(args: &JsonValue, key: &str) -> Result<Option<DateTime<Utc>>> {
    match optional_str(args, key)? {
        Some(s) => Ok(Some(
            s.parse::<DateTime<Utc>>()
                .with_context(|| format!("{key} must be RFC3339"))?,
        )),
        None => Ok(None),
    }
}

fn evidence(args: &JsonValue) -> Result<Vec<String>> {
    let Some(v) = args.get("evidence") else {
        return Ok(Vec::new());
    };
    let items: Vec<String> =
        serde_json::from_value(v.clone()).context("evidence must be an array of strings")?;
    if items.len() > MAX_EVIDENCE_ITEMS {
        anyhow::bail!("evidence exceeds max allowed items ({MAX_EVIDENCE_ITEMS})");
    }
    Ok(items)
}
