//! Run statistics, the run summary and step write-through.

use crate::model::{CaseResult, Status, StepResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl StepStats {
    pub fn record(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Success => self.success += 1,
            Status::Failed => self.failed += 1,
            Status::Errored => self.errored += 1,
            Status::Skipped => self.skipped += 1,
            Status::Pending | Status::Running => {}
        }
    }

    pub fn from_steps(steps: &[StepResult]) -> Self {
        let mut stats = Self::default();
        for step in steps {
            stats.record(step.status);
        }
        stats
    }

    fn add(&mut self, other: &StepStats) {
        self.total += other.total;
        self.success += other.success;
        self.failed += other.failed;
        self.errored += other.errored;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseStats {
    pub total: usize,
    pub success: usize,
    pub fail: usize,
    pub skipped: usize,
}

impl CaseStats {
    fn record(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Success => self.success += 1,
            Status::Skipped => self.skipped += 1,
            _ => self.fail += 1,
        }
    }

    fn add(&mut self, other: &CaseStats) {
        self.total += other.total;
        self.success += other.success;
        self.fail += other.fail;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub cases: CaseStats,
    pub steps: StepStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTime {
    pub start_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Final report of a run, handed to the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub success: bool,
    pub stats: RunStats,
    pub time: RunTime,
    pub details: Vec<CaseResult>,
}

impl RunSummary {
    /// Merge summaries of workers that ran concurrently. `parts` must
    /// already be in case index order.
    pub fn merge_parallel(run_id: impl Into<String>, parts: Vec<RunSummary>) -> RunSummary {
        let mut merged = RunSummary {
            run_id: run_id.into(),
            success: true,
            stats: RunStats::default(),
            time: RunTime {
                start_at: parts
                    .iter()
                    .map(|p| p.time.start_at)
                    .min()
                    .unwrap_or_else(Utc::now),
                duration_ms: parts.iter().map(|p| p.time.duration_ms).max().unwrap_or(0),
            },
            details: Vec::new(),
        };
        for part in parts {
            merged.success &= part.success;
            merged.stats.cases.add(&part.stats.cases);
            merged.stats.steps.add(&part.stats.steps);
            merged.details.extend(part.details);
        }
        merged
    }

    pub fn failed_cases(&self) -> impl Iterator<Item = &CaseResult> {
        self.details.iter().filter(|c| c.status.is_failure())
    }
}

/// Folds case results into a [`RunSummary`].
#[derive(Debug)]
pub struct SummaryBuilder {
    run_id: String,
    start_at: DateTime<Utc>,
    started: Instant,
    success: bool,
    stats: RunStats,
    details: Vec<CaseResult>,
}

impl SummaryBuilder {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            start_at: Utc::now(),
            started: Instant::now(),
            success: true,
            stats: RunStats::default(),
            details: Vec::new(),
        }
    }

    pub fn with_case(mut self, case: CaseResult) -> Self {
        self.success &= case.success;
        self.stats.cases.record(case.status);
        self.stats.steps.add(&case.stats);
        debug!(case = %case.name, status = ?case.status, "Case folded into summary");
        self.details.push(case);
        self
    }

    pub fn finish(self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            success: self.success,
            stats: self.stats,
            time: RunTime {
                start_at: self.start_at,
                duration_ms: self.started.elapsed().as_millis() as u64,
            },
            details: self.details,
        }
    }
}

/// A completed step, written through while the run is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: String,
    pub case_index: usize,
    pub case_id: String,
    pub step: StepResult,
}

/// Receives every completed step.
pub trait ResultSink: Send + Sync {
    fn step_completed(&self, event: StepEvent);
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn step_completed(&self, _event: StepEvent) {}
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StepEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StepEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResultSink for ChannelSink {
    fn step_completed(&self, event: StepEvent) {
        if self.tx.send(event).is_err() {
            debug!("Step event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VariableMap;
    use chrono::Duration;

    fn case(name: &str, status: Status, steps: &[Status]) -> CaseResult {
        let steps: Vec<StepResult> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut r = StepResult::new(format!("s{i}"), i);
                r.status = *s;
                r
            })
            .collect();
        CaseResult {
            case_id: name.into(),
            name: name.into(),
            status,
            success: !status.is_failure(),
            error: None,
            stats: StepStats::from_steps(&steps),
            steps,
            variables: VariableMap::new(),
            started_at: Utc::now(),
            duration_ms: 5,
        }
    }

    #[test]
    fn test_builder_counts_cases_and_steps() {
        let summary = SummaryBuilder::new("r1")
            .with_case(case("a", Status::Success, &[Status::Success, Status::Skipped]))
            .with_case(case("b", Status::Failed, &[Status::Success, Status::Failed]))
            .with_case(case("c", Status::Skipped, &[]))
            .finish();
        assert!(!summary.success);
        assert_eq!(
            summary.stats.cases,
            CaseStats {
                total: 3,
                success: 1,
                fail: 1,
                skipped: 1
            }
        );
        assert_eq!(summary.stats.steps.total, 4);
        assert_eq!(summary.stats.steps.success, 2);
        assert_eq!(summary.failed_cases().count(), 1);
    }

    #[test]
    fn test_merge_parallel_takes_min_start_and_max_duration() {
        let mut first = SummaryBuilder::new("w0")
            .with_case(case("a", Status::Success, &[Status::Success]))
            .finish();
        let mut second = SummaryBuilder::new("w1")
            .with_case(case("b", Status::Errored, &[Status::Errored]))
            .finish();
        let early = Utc::now() - Duration::seconds(10);
        first.time = RunTime {
            start_at: Utc::now(),
            duration_ms: 100,
        };
        second.time = RunTime {
            start_at: early,
            duration_ms: 250,
        };

        let merged = RunSummary::merge_parallel("run", vec![first, second]);
        assert_eq!(merged.run_id, "run");
        assert!(!merged.success);
        assert_eq!(merged.time.start_at, early);
        assert_eq!(merged.time.duration_ms, 250);
        assert_eq!(merged.stats.cases.total, 2);
        assert_eq!(merged.stats.steps.errored, 1);
        let names: Vec<&str> = merged.details.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_summary_serialises_camel_case_time() {
        let summary = SummaryBuilder::new("r").finish();
        let value = serde_json::to_value(&summary).unwrap();
        assert!(value["time"]["startAt"].is_string());
        assert!(value["time"]["durationMs"].is_u64());
        assert_eq!(value["success"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.step_completed(StepEvent {
            run_id: "r".into(),
            case_index: 0,
            case_id: "a".into(),
            step: StepResult::new("s", 0),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.step.name, "s");
    }
}
