//! MCP tool server: JSON-RPC 2.0 over `POST /mcp`, plus `GET /healthz`.

use std::{collections::BTreeMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    ingest::{IngestCounts, IngestStats},
    link::LinkState,
    pool::RelayStatus,
    query::{QueryService, SearchParams},
};

const PROTOCOL_VERSION: &str = "2024-11-05";
const LATEST_URI: &str = "jobs://latest";
const STATS_URI: &str = "jobs://stats";
const LATEST_COUNT: usize = 20;
const PROMPT_EXAMPLES: usize = 3;
const PROMPT_TOP: usize = 5;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const RESOURCE_NOT_FOUND: i64 = -32002;

/// Everything the tool surface reads from.
#[derive(Clone)]
pub struct McpState {
    pub query: QueryService,
    pub relays: Vec<RelayStatus>,
    pub ingest: Arc<IngestStats>,
    pub ready: watch::Receiver<bool>,
}

pub fn router(state: McpState) -> Router {
    Router::new()
        .route("/mcp", post(rpc))
        .route("/healthz", get(healthz))
        .with_state(Arc::new(state))
}

/// Serve the tool surface until `shutdown` resolves.
pub async fn serve_mcp(
    addr: SocketAddr,
    state: McpState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "mcp server listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    caught_up: bool,
    listings: usize,
    relays: Vec<RelayHealth>,
    ingest: IngestCounts,
}

#[derive(Serialize)]
struct RelayHealth {
    url: String,
    state: LinkState,
}

fn relay_health(relays: &[RelayStatus]) -> Vec<RelayHealth> {
    relays
        .iter()
        .map(|r| RelayHealth {
            url: r.url.clone(),
            state: *r.state.borrow(),
        })
        .collect()
}

async fn healthz(State(state): State<Arc<McpState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        caught_up: *state.ready.borrow(),
        listings: state.query.listing_count(),
        relays: relay_health(&state.relays),
        ingest: state.ingest.counts(),
    })
}

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC error object.
#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn reply(id: Value, outcome: std::result::Result<Value, RpcError>) -> Response {
    let body = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(e) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": e.code, "message": e.message},
        }),
    };
    Json(body).into_response()
}

async fn rpc(State(state): State<Arc<McpState>>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return reply(Value::Null, Err(RpcError::new(PARSE_ERROR, e.to_string()))),
    };
    let req: RpcRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            return reply(
                Value::Null,
                Err(RpcError::new(INVALID_REQUEST, e.to_string())),
            )
        }
    };
    let Some(id) = req.id else {
        debug!(method = %req.method, "notification");
        return StatusCode::ACCEPTED.into_response();
    };
    debug!(method = %req.method, "rpc request");
    let outcome = match req.method.as_str() {
        "initialize" => Ok(initialize(&req.params)),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_definitions() })),
        "tools/call" => call_tool(&state, &req.params),
        "resources/list" => Ok(json!({ "resources": resource_definitions() })),
        "resources/read" => read_resource(&state, &req.params),
        "prompts/list" => Ok(json!({ "prompts": prompt_definitions() })),
        "prompts/get" => get_prompt(&state, &req.params),
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    };
    reply(id, outcome)
}

fn initialize(params: &Value) -> Value {
    let version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
        "serverInfo": { "name": "jobstr", "version": env!("CARGO_PKG_VERSION") },
        "instructions": "Search job listings published on Nostr relays. \
            Use search_jobs to find listings by skill, get_job_details for the \
            full posting and get_stats for skill co-occurrence counts. \
            The job_search_assistant and analyze_job_market prompts start a \
            search or a market overview from the current listings.",
    })
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "search_jobs",
            "description": "Search current job listings requiring a skill, most recent first. \
                Optionally filter by company or employment type.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "skill": { "type": "string", "description": "Required skill, case-insensitive" },
                    "company": { "type": "string", "description": "Company name substring" },
                    "employment_type": { "type": "string", "description": "e.g. full-time, contract" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 100, "default": 20 }
                },
                "required": ["skill"]
            }
        },
        {
            "name": "get_job_details",
            "description": "Get the full listing for a job by its event id or job id",
            "inputSchema": {
                "type": "object",
                "properties": { "job_id": { "type": "string" } },
                "required": ["job_id"]
            }
        },
        {
            "name": "get_stats",
            "description": "Listing statistics. With a skill, also the skills most often required together with it.",
            "inputSchema": {
                "type": "object",
                "properties": { "skill": { "type": "string" } }
            }
        },
        {
            "name": "list_relays",
            "description": "List the relays jobs are collected from and their connection state",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

fn resource_definitions() -> Value {
    json!([
        {
            "uri": LATEST_URI,
            "name": "Latest job listings",
            "description": "The most recently published job listings",
            "mimeType": "application/json"
        },
        {
            "uri": STATS_URI,
            "name": "Job listing statistics",
            "description": "Counts by skill, company and employment type",
            "mimeType": "application/json"
        }
    ])
}

fn prompt_definitions() -> Value {
    json!([
        {
            "name": "job_search_assistant",
            "description": "Help searching for jobs matching a query and optional skills",
            "arguments": [
                { "name": "query", "description": "What kind of job to look for", "required": true },
                { "name": "skills", "description": "Required skills, comma separated", "required": false }
            ]
        },
        {
            "name": "analyze_job_market",
            "description": "Overview of trending skills, hiring companies and employment types",
            "arguments": []
        }
    ])
}

#[derive(Deserialize)]
struct PromptRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Skills arrive as a list or, from string-only clients, comma separated.
#[derive(Deserialize)]
#[serde(untagged)]
enum SkillsArg {
    List(Vec<String>),
    Csv(String),
}

impl SkillsArg {
    fn into_vec(self) -> Vec<String> {
        let raw = match self {
            SkillsArg::List(list) => list,
            SkillsArg::Csv(csv) => csv.split(',').map(str::to_string).collect(),
        };
        raw.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Deserialize)]
struct JobSearchArgs {
    query: String,
    #[serde(default)]
    skills: Option<SkillsArg>,
}

fn prompt_message(role: &str, text: String) -> Value {
    json!({ "role": role, "content": { "type": "text", "text": text } })
}

fn get_prompt(state: &McpState, params: &Value) -> std::result::Result<Value, RpcError> {
    let req: PromptRequest = serde_json::from_value(params.clone())
        .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))?;
    let invalid = |e: Error| RpcError::new(INVALID_PARAMS, e.to_string());
    let (description, messages) = match req.name.as_str() {
        "job_search_assistant" => {
            let args = arguments::<JobSearchArgs>(&req.arguments).map_err(invalid)?;
            let skills = args.skills.map(SkillsArg::into_vec).unwrap_or_default();
            let context = skill_context(&state.query, &skills).map_err(invalid)?;
            let mut request = format!("Search query: {}\n", args.query);
            if !skills.is_empty() {
                request.push_str(&format!("Required skills: {}\n", skills.join(", ")));
            }
            request.push_str(&context);
            request.push_str(
                "\nPlease help me find relevant job listings and recommend where to start.",
            );
            (
                format!("Job search assistance for: {}", args.query),
                vec![
                    prompt_message(
                        "assistant",
                        "I'm your Nostr job search assistant. I'll help you find relevant \
                         job listings published on Nostr relays."
                            .to_string(),
                    ),
                    prompt_message("user", request),
                ],
            )
        }
        "analyze_job_market" => {
            let summary = market_summary(&state.query).map_err(invalid)?;
            (
                "Analysis of the Nostr job market".to_string(),
                vec![
                    prompt_message(
                        "assistant",
                        "I'll analyze the current job market on Nostr and provide insights."
                            .to_string(),
                    ),
                    prompt_message(
                        "user",
                        format!(
                            "{summary}\nPlease analyze these job listings. What are the \
                             trending skills? Which companies are hiring? Which skills \
                             are asked for together?"
                        ),
                    ),
                ],
            )
        }
        other => {
            return Err(RpcError::new(
                INVALID_PARAMS,
                format!("unknown prompt: {other}"),
            ))
        }
    };
    debug!(prompt = %req.name, "prompt rendered");
    Ok(json!({ "description": description, "messages": messages }))
}

/// Listing counts and a few recent titles for each requested skill.
fn skill_context(query: &QueryService, skills: &[String]) -> Result<String, Error> {
    let mut out = String::new();
    for skill in skills {
        let stats = query.get_stats(Some(skill))?;
        let key = stats.skill.unwrap_or_default();
        let count = stats.skill_counts.get(&key).copied().unwrap_or(0);
        out.push_str(&format!("- {key}: {count} current listings\n"));
        let recent = query.search_jobs(&SearchParams {
            limit: Some(PROMPT_EXAMPLES),
            ..SearchParams::skill(skill.as_str())
        })?;
        for job in recent.listings {
            let title = job.title.as_deref().unwrap_or("untitled");
            match job.company.as_deref() {
                Some(company) => out.push_str(&format!("  * {title} at {company} ({})\n", job.id)),
                None => out.push_str(&format!("  * {title} ({})\n", job.id)),
            }
        }
    }
    Ok(out)
}

fn top_counts(counts: &BTreeMap<String, usize>) -> String {
    let mut ranked: Vec<(&String, &usize)> = counts.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    if ranked.is_empty() {
        return "  (none)\n".to_string();
    }
    ranked
        .into_iter()
        .take(PROMPT_TOP)
        .map(|(name, count)| format!("  - {name}: {count}\n"))
        .collect()
}

fn market_summary(query: &QueryService) -> Result<String, Error> {
    let stats = query.get_stats(None)?;
    let mut out = format!("Current listings: {}\n", stats.total_listings);
    out.push_str("Top skills:\n");
    out.push_str(&top_counts(&stats.skill_counts));
    out.push_str("Hiring companies:\n");
    out.push_str(&top_counts(&stats.company_counts));
    out.push_str("Employment types:\n");
    out.push_str(&top_counts(&stats.job_type_counts));
    Ok(out)
}

#[derive(Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct JobIdArgs {
    job_id: String,
}

#[derive(Deserialize, Default)]
struct StatsArgs {
    #[serde(default)]
    skill: Option<String>,
}

fn arguments<T: DeserializeOwned>(args: &Value) -> Result<T, Error> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|e| Error::InvalidArgument(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn call_tool(state: &McpState, params: &Value) -> std::result::Result<Value, RpcError> {
    let call: ToolCall = serde_json::from_value(params.clone())
        .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))?;
    let query = &state.query;
    let outcome = match call.name.as_str() {
        "search_jobs" => arguments::<SearchParams>(&call.arguments)
            .and_then(|p| query.search_jobs(&p))
            .map(|r| to_value(&r)),
        "get_job_details" => arguments::<JobIdArgs>(&call.arguments)
            .and_then(|a| query.get_job_details(&a.job_id))
            .map(|l| to_value(&l)),
        "get_stats" => arguments::<StatsArgs>(&call.arguments)
            .and_then(|a| query.get_stats(a.skill.as_deref()))
            .map(|r| to_value(&r)),
        "list_relays" => Ok(json!({ "relays": to_value(&relay_health(&state.relays)) })),
        other => {
            return Err(RpcError::new(
                INVALID_PARAMS,
                format!("unknown tool: {other}"),
            ))
        }
    };
    Ok(match outcome {
        Ok(result) => json!({
            "content": [{ "type": "text", "text": result.to_string() }],
            "structuredContent": result,
            "isError": false,
        }),
        Err(e) => {
            warn!(tool = %call.name, kind = e.kind(), error = %e, "tool call failed");
            json!({
                "content": [{ "type": "text", "text": e.to_string() }],
                "structuredContent": { "error": { "kind": e.kind(), "message": e.to_string() } },
                "isError": true,
            })
        }
    })
}

fn read_resource(state: &McpState, params: &Value) -> std::result::Result<Value, RpcError> {
    let uri = params
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing uri"))?;
    let body = match uri {
        LATEST_URI => json!({ "listings": to_value(&state.query.latest(LATEST_COUNT)) }),
        STATS_URI => state
            .query
            .get_stats(None)
            .map(|r| to_value(&r))
            .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))?,
        other => {
            return Err(RpcError::new(
                RESOURCE_NOT_FOUND,
                format!("resource not found: {other}"),
            ))
        }
    };
    Ok(json!({
        "contents": [{ "uri": uri, "mimeType": "application/json", "text": body.to_string() }]
    }))
}
