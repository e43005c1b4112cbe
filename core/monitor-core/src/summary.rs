//! Reporting aggregation over closed work blocks.
//!
//! Blocks are re-validated here even though the tracker never stores an
//! out-of-bounds block: rows written by older builds or edited by hand are
//! skipped rather than summed.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::time_validation::{
    efficiency_percent, format_duration_secs, is_valid_duration, is_valid_time, safe_format,
};
use crate::workblock::WorkBlock;

/// Longest plausible first-start to last-end span for one report.
pub const MAX_SCHEDULE_SECS: i64 = 18 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkSummary {
    pub block_count: usize,
    pub skipped_blocks: usize,
    pub total_work_seconds: i64,
    pub claude_processing_seconds: i64,
    pub first_start: Option<DateTime<Utc>>,
    pub last_end: Option<DateTime<Utc>>,
    pub schedule_seconds: i64,
    /// True when first start to last end exceeded [`MAX_SCHEDULE_SECS`].
    pub schedule_rejected: bool,
    pub efficiency_percent: f64,
    pub project_seconds: BTreeMap<String, i64>,
}

impl WorkSummary {
    pub fn from_blocks(blocks: &[WorkBlock], max_block: Duration) -> Self {
        let mut summary = WorkSummary::default();
        let max_secs = max_block.num_seconds();

        for block in blocks {
            let (Some(end), Some(seconds)) = (block.end_time, block.duration_seconds) else {
                summary.skipped_blocks += 1;
                continue;
            };
            // Zero-length blocks are real (a single signal) and still count.
            if !is_valid_time(&block.start_time)
                || !is_valid_time(&end)
                || !is_valid_duration(&block.start_time, &end, max_block)
                || !(0..=max_secs).contains(&seconds)
            {
                tracing::debug!(block_id = %block.id, seconds, "Skipping implausible work block");
                summary.skipped_blocks += 1;
                continue;
            }

            summary.block_count += 1;
            summary.total_work_seconds += seconds;
            summary.claude_processing_seconds += block.claude_processing_seconds.clamp(0, seconds);
            *summary
                .project_seconds
                .entry(block.project.clone())
                .or_default() += seconds;
            summary.first_start = Some(
                summary
                    .first_start
                    .map_or(block.start_time, |t| t.min(block.start_time)),
            );
            summary.last_end = Some(summary.last_end.map_or(end, |t| t.max(end)));
        }

        if let (Some(first), Some(last)) = (summary.first_start, summary.last_end) {
            let span = (last - first).num_seconds();
            if span > MAX_SCHEDULE_SECS {
                tracing::warn!(
                    first_start = %first,
                    last_end = %last,
                    span_secs = span,
                    "Unreasonable schedule span; reporting work time only"
                );
                summary.schedule_rejected = true;
            } else {
                summary.schedule_seconds = span.max(0);
            }
        }

        summary.efficiency_percent =
            efficiency_percent(summary.total_work_seconds, summary.schedule_seconds);
        summary
    }

    pub fn efficiency_label(&self) -> &'static str {
        match self.efficiency_percent {
            e if e >= 80.0 => "Excellent focus",
            e if e >= 60.0 => "Great productivity",
            e if e >= 40.0 => "Good work pace",
            e if e >= 20.0 => "Room for improvement",
            _ => "Consider longer focus blocks",
        }
    }

    /// One-line human summary, safe against any stored value.
    pub fn headline(&self) -> String {
        format!(
            "{} worked across {} blocks ({} - {}), {:.1}% efficiency",
            format_duration_secs(self.total_work_seconds),
            self.block_count,
            safe_format(self.first_start.as_ref(), "%H:%M"),
            safe_format(self.last_end.as_ref(), "%H:%M"),
            self.efficiency_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::workblock::{finalize, CloseReason};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()
    }

    fn closed(project: &str, start_min: i64, end_min: i64) -> WorkBlock {
        let session = Session::new("alice", t0(), Duration::hours(5));
        let mut block = WorkBlock::open(&session, project, t0() + Duration::minutes(start_min));
        finalize(
            &mut block,
            t0() + Duration::minutes(end_min),
            session.end_time,
            Duration::hours(12),
            CloseReason::IdleTimeout,
        );
        block
    }

    #[test]
    fn sums_valid_blocks() {
        let blocks = vec![closed("api", 0, 60), closed("web", 90, 120), closed("api", 150, 180)];
        let summary = WorkSummary::from_blocks(&blocks, Duration::hours(12));
        assert_eq!(summary.block_count, 3);
        assert_eq!(summary.total_work_seconds, 2 * 3600);
        assert_eq!(summary.schedule_seconds, 3 * 3600);
        assert!((summary.efficiency_percent - 66.666).abs() < 0.01);
        assert_eq!(summary.project_seconds.get("api"), Some(&5400));
        assert_eq!(summary.efficiency_label(), "Great productivity");
        assert_eq!(summary.headline(), "2h 00m worked across 3 blocks (09:00 - 12:00), 66.7% efficiency");
    }

    #[test]
    fn skips_open_and_oversized_blocks() {
        let session = Session::new("alice", t0(), Duration::hours(5));
        let open = WorkBlock::open(&session, "api", t0());
        let mut corrupt = closed("api", 40, 50);
        corrupt.duration_seconds = Some(24 * 3600);
        let mut negative = closed("api", 50, 55);
        negative.duration_seconds = Some(-60);
        let mut inverted = closed("api", 55, 58);
        inverted.end_time = Some(inverted.start_time - Duration::minutes(1));
        let valid = closed("api", 60, 90);

        let summary = WorkSummary::from_blocks(
            &[open, corrupt, negative, inverted, valid],
            Duration::hours(12),
        );
        assert_eq!(summary.block_count, 1);
        assert_eq!(summary.skipped_blocks, 4);
        assert_eq!(summary.total_work_seconds, 1800);
        assert_eq!(summary.efficiency_percent, 100.0);
    }

    #[test]
    fn zero_length_blocks_count_without_adding_time() {
        let zero = closed("api", 30, 30);
        assert_eq!(zero.duration_seconds, Some(0));
        let summary =
            WorkSummary::from_blocks(&[closed("api", 0, 20), zero], Duration::hours(12));
        assert_eq!(summary.block_count, 2);
        assert_eq!(summary.skipped_blocks, 0);
        assert_eq!(summary.total_work_seconds, 1200);
        assert_eq!(summary.schedule_seconds, 1800);
        assert_eq!(summary.project_seconds.get("api"), Some(&1200));
    }

    #[test]
    fn rejects_day_long_schedule() {
        let mut late = closed("api", 0, 30);
        late.start_time = t0() + Duration::hours(20);
        late.end_time = Some(t0() + Duration::hours(20) + Duration::minutes(30));
        let summary = WorkSummary::from_blocks(&[closed("api", 0, 30), late], Duration::hours(12));
        assert!(summary.schedule_rejected);
        assert_eq!(summary.schedule_seconds, 0);
        assert_eq!(summary.efficiency_percent, 0.0);
        assert!(summary.efficiency_percent <= 100.0);
    }

    #[test]
    fn empty_summary_is_safe() {
        let summary = WorkSummary::from_blocks(&[], Duration::hours(12));
        assert_eq!(summary.headline(), "0m worked across 0 blocks (--:-- - --:--), 0.0% efficiency");
    }
}
