use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::SharedState;
use crate::analytics::{
    event_type_labels, severity_labels, summarize_events, summarize_flows, summarize_recent,
    EventFilter,
};
use crate::cache::{CacheOutcome, CallerContext, MAX_RECENT_HOURS, MIN_RECENT_HOURS};
use crate::error::{McpError, McpResult, ToolError};
use crate::geo::{BoundingBox, IncidentType, Severity};

/// Hours looked back by `events_recent` when none are given.
pub const DEFAULT_RECENT_HOURS: i64 = 24;

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
    token: &CancellationToken,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "traffic_area" => handle_traffic_area(state, arguments, token).await,
        "traffic_refresh" => handle_traffic_refresh(state, arguments, token).await,
        "events_area" => handle_events_area(state, arguments, token).await,
        "events_recent" => handle_events_recent(state, arguments, token).await,
        "events_types" => to_json(json!({ "types": event_type_labels() })),
        "events_severities" => to_json(json!({ "severities": severity_labels() })),
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Two opposite corners of a query rectangle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaParams {
    pub lat1: f64,
    pub lon1: f64,
    pub lat2: f64,
    pub lon2: f64,
    /// Opaque caller identity, only logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
}

impl AreaParams {
    fn bounding_box(&self, tool_name: &str) -> McpResult<BoundingBox> {
        BoundingBox::new(self.lat1, self.lon1, self.lat2, self.lon2)
            .map_err(|e| invalid_parameters(tool_name, e))
    }

    fn caller(&self) -> CallerContext {
        CallerContext {
            caller_id: self.caller_id.clone(),
        }
    }
}

/// Area plus optional event filters, as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaEventsParams {
    #[serde(flatten)]
    pub area: AreaParams,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub from_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to_date: Option<DateTime<Utc>>,
}

impl AreaEventsParams {
    /// Check enum membership. Date order is not checked.
    fn filter(&self, tool_name: &str) -> McpResult<EventFilter> {
        let event_type = self
            .event_type
            .as_deref()
            .map(str::parse::<IncidentType>)
            .transpose()
            .map_err(|reason| invalid_parameters(tool_name, ToolError::validation("event_type", reason)))?;
        let severity = self
            .severity
            .as_deref()
            .map(str::parse::<Severity>)
            .transpose()
            .map_err(|reason| invalid_parameters(tool_name, ToolError::validation("severity", reason)))?;

        Ok(EventFilter {
            event_type,
            severity,
            from_date: self.from_date,
            to_date: self.to_date,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentEventsParams {
    #[serde(default = "default_recent_hours")]
    pub hours: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
}

fn default_recent_hours() -> i64 {
    DEFAULT_RECENT_HOURS
}

async fn handle_traffic_area(
    state: &SharedState,
    arguments: Option<Value>,
    token: &CancellationToken,
) -> McpResult<Value> {
    const TOOL: &str = "traffic_area";
    let params: AreaParams = parse_arguments(TOOL, arguments)?;
    let bbox = params.bounding_box(TOOL)?;

    let (records, outcome) = state.cache.query_flows(&bbox, &params.caller(), token).await?;
    to_json(summarize_flows(&bbox, &records, Utc::now()).with_cache_status(outcome))
}

async fn handle_traffic_refresh(
    state: &SharedState,
    arguments: Option<Value>,
    token: &CancellationToken,
) -> McpResult<Value> {
    const TOOL: &str = "traffic_refresh";
    let params: AreaParams = parse_arguments(TOOL, arguments)?;
    let bbox = params.bounding_box(TOOL)?;

    let (records, source) = state.cache.force_refresh(&bbox, &params.caller(), token).await?;
    info!(bbox = %bbox, source = source.as_str(), "Forced refresh completed");

    to_json(summarize_flows(&bbox, &records, Utc::now()).with_cache_status(CacheOutcome::Refreshed))
}

async fn handle_events_area(
    state: &SharedState,
    arguments: Option<Value>,
    token: &CancellationToken,
) -> McpResult<Value> {
    const TOOL: &str = "events_area";
    let params: AreaEventsParams = parse_arguments(TOOL, arguments)?;
    let bbox = params.area.bounding_box(TOOL)?;
    let filter = params.filter(TOOL)?;

    let (events, outcome) = state
        .cache
        .query_incidents(&bbox, &params.area.caller(), token)
        .await?;
    to_json(summarize_events(&bbox, &filter, events, Utc::now()).with_cache_status(outcome))
}

async fn handle_events_recent(
    state: &SharedState,
    arguments: Option<Value>,
    token: &CancellationToken,
) -> McpResult<Value> {
    const TOOL: &str = "events_recent";
    let params: RecentEventsParams =
        parse_arguments(TOOL, Some(arguments.unwrap_or_else(|| json!({}))))?;

    if !(MIN_RECENT_HOURS..=MAX_RECENT_HOURS).contains(&params.hours) {
        return Err(invalid_parameters(
            TOOL,
            ToolError::validation(
                "hours",
                format!(
                    "must be between {} and {}, got {}",
                    MIN_RECENT_HOURS, MAX_RECENT_HOURS, params.hours
                ),
            ),
        ));
    }

    let caller = CallerContext {
        caller_id: params.caller_id.clone(),
    };
    let events = state
        .cache
        .recent_incidents(params.hours, &caller, token)
        .await?;
    to_json(summarize_recent(params.hours, &events, Utc::now()))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Helper to parse arguments with consistent error handling
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

fn invalid_parameters(tool_name: &str, err: ToolError) -> McpError {
    McpError::InvalidParameters {
        tool_name: tool_name.to_string(),
        message: err.to_string(),
    }
}

fn to_json<T: Serialize>(value: T) -> McpResult<Value> {
    serde_json::to_value(value).map_err(McpError::Json)
}
