//! `status` subcommand: a plain-text view of what the daemon is tracking.

use crate::daemon_client;
use crate::error::{HookError, HookResult};
use chrono::NaiveDate;
use claude_monitor_protocol::Method;
use monitor_core::time_validation::{format_duration_secs, safe_format_local};
use monitor_core::{Session, SessionState, WorkBlock};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write as _;

#[derive(Debug, Deserialize)]
pub struct ActiveSessionView {
    #[serde(flatten)]
    pub session: Session,
    pub state: SessionState,
    pub remaining_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct OpenBlockView {
    #[serde(flatten)]
    pub block: WorkBlock,
    pub elapsed_seconds: i64,
    pub processing: bool,
}

#[derive(Debug, Deserialize)]
pub struct DaySummaryView {
    pub date: NaiveDate,
    pub headline: String,
    pub efficiency_label: String,
    pub block_count: usize,
    pub total_work_seconds: i64,
}

pub fn run(user: Option<&str>, with_summary: bool, json: bool) -> HookResult<()> {
    let params = user.map(|user| serde_json::json!({ "user_id": user }));
    let session_data = fetch(Method::GetActiveSession, params)?;
    let blocks_data = fetch(Method::ListOpenWorkBlocks, None)?;
    let summary_data = if with_summary {
        Some(fetch(Method::GetSummary, None)?)
    } else {
        None
    };

    if json {
        let combined = serde_json::json!({
            "active_session": session_data,
            "open_work_blocks": blocks_data,
            "summary": summary_data,
        });
        println!("{}", combined);
        return Ok(());
    }

    let session: Option<ActiveSessionView> = decode(session_data)?;
    let blocks: Vec<OpenBlockView> = decode(blocks_data)?;
    let summary: Option<DaySummaryView> = match summary_data {
        Some(data) => Some(decode(data)?),
        None => None,
    };
    print!("{}", render(session.as_ref(), &blocks, summary.as_ref()));
    Ok(())
}

fn fetch(method: Method, params: Option<Value>) -> HookResult<Value> {
    daemon_client::query(method, params).map_err(HookError::Daemon)
}

fn decode<T: DeserializeOwned>(data: Value) -> HookResult<T> {
    serde_json::from_value(data).map_err(HookError::from)
}

pub fn render(
    session: Option<&ActiveSessionView>,
    blocks: &[OpenBlockView],
    summary: Option<&DaySummaryView>,
) -> String {
    let mut out = String::new();

    match session {
        Some(view) if view.state == SessionState::Active => {
            let _ = writeln!(
                out,
                "Session {} for {}: {} activities, {} remaining (ends {})",
                short_id(&view.session.id),
                view.session.user_id,
                view.session.activity_count,
                format_duration_secs(view.remaining_seconds),
                safe_format_local(Some(&view.session.end_time), "%H:%M"),
            );
        }
        _ => {
            let _ = writeln!(out, "No active session");
        }
    }

    if blocks.is_empty() {
        let _ = writeln!(out, "No open work blocks");
    } else {
        let _ = writeln!(out, "Open work blocks:");
        for view in blocks {
            let _ = writeln!(
                out,
                "  {:<24} since {}  {:>8}{}",
                view.block.project,
                safe_format_local(Some(&view.block.start_time), "%H:%M"),
                format_duration_secs(view.elapsed_seconds),
                if view.processing { "  [claude working]" } else { "" },
            );
        }
    }

    if let Some(summary) = summary {
        let _ = writeln!(
            out,
            "{}: {} ({} blocks, {} worked, {})",
            summary.date,
            summary.headline,
            summary.block_count,
            format_duration_secs(summary.total_work_seconds),
            summary.efficiency_label,
        );
    }

    out
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
