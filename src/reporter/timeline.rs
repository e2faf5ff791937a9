//! Execution Timeline
//!
//! A downstream reporter that keeps workflow and step events in memory,
//! per execution, for status queries and Gantt charts. Only the most
//! recent executions are retained.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DownstreamReporter, ReportError, ReportEvent};
use crate::execution::RunStatus;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
}

/// A single step event in the execution timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Track {
    playbook_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    events: Vec<TimelineEvent>,
}

/// One completed step visit: (step ID, start ms, end ms) relative to the run start.
type Span = (String, i64, i64);

/// Executions kept by [`ExecutionTimeline::new`].
pub const DEFAULT_RETENTION: usize = 256;

/// Records the lifecycle of the executions it is told about.
///
/// Once `retention` executions are tracked, a new one evicts the oldest
/// finished execution, or the oldest running one if none has finished.
#[derive(Debug)]
pub struct ExecutionTimeline {
    tracks: Mutex<HashMap<Uuid, Track>>,
    retention: usize,
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Track>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one lifecycle event.
    pub fn record(&self, event: &ReportEvent) {
        let mut tracks = self.lock();
        match event {
            ReportEvent::WorkflowStart {
                execution_id,
                playbook_id,
                at,
            } => {
                if !tracks.contains_key(execution_id) {
                    evict(&mut tracks, self.retention - 1);
                }
                tracks.insert(
                    *execution_id,
                    Track {
                        playbook_id: playbook_id.clone(),
                        started_at: *at,
                        finished_at: None,
                        error: None,
                        events: Vec::new(),
                    },
                );
            }
            ReportEvent::WorkflowEnd {
                execution_id,
                error,
                at,
                ..
            } => {
                if let Some(track) = tracks.get_mut(execution_id) {
                    track.finished_at = Some(*at);
                    track.error = error.clone();
                }
            }
            ReportEvent::StepStart {
                execution_id,
                step_id,
                at,
                ..
            } => {
                if let Some(track) = tracks.get_mut(execution_id) {
                    track.events.push(TimelineEvent {
                        step_id: step_id.clone(),
                        event_type: EventType::Started,
                        timestamp: *at,
                    });
                }
            }
            ReportEvent::StepEnd {
                execution_id,
                step_id,
                error,
                at,
                ..
            } => {
                if let Some(track) = tracks.get_mut(execution_id) {
                    let event_type = if error.is_some() {
                        EventType::Failed
                    } else {
                        EventType::Completed
                    };
                    track.events.push(TimelineEvent {
                        step_id: step_id.clone(),
                        event_type,
                        timestamp: *at,
                    });
                }
            }
        }
    }

    /// IDs of every execution seen so far.
    pub fn executions(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    pub fn playbook_id(&self, execution_id: Uuid) -> Option<String> {
        self.lock().get(&execution_id).map(|t| t.playbook_id.clone())
    }

    /// Status as observed through reported events.
    pub fn status(&self, execution_id: Uuid) -> Option<RunStatus> {
        self.lock().get(&execution_id).map(|track| {
            match (&track.finished_at, &track.error) {
                (None, _) => RunStatus::Running,
                (Some(_), None) => RunStatus::Succeeded,
                (Some(_), Some(_)) => RunStatus::Failed,
            }
        })
    }

    /// The error message reported at workflow end, if any.
    pub fn error(&self, execution_id: Uuid) -> Option<String> {
        self.lock().get(&execution_id).and_then(|t| t.error.clone())
    }

    /// All step events of an execution, in arrival order.
    pub fn get_events(&self, execution_id: Uuid) -> Vec<TimelineEvent> {
        self.lock()
            .get(&execution_id)
            .map(|t| t.events.clone())
            .unwrap_or_default()
    }

    /// Forgets an execution. Returns false if it was not tracked.
    pub fn remove(&self, execution_id: Uuid) -> bool {
        self.lock().remove(&execution_id).is_some()
    }

    /// Total milliseconds spent per step, summed over visits.
    pub fn get_durations(&self, execution_id: Uuid) -> HashMap<String, i64> {
        let mut durations = HashMap::new();
        if let Some(track) = self.lock().get(&execution_id) {
            for (step_id, start, end) in spans(track) {
                *durations.entry(step_id).or_insert(0) += end - start;
            }
        }
        durations
    }

    /// Generates an ASCII Gantt chart for one execution.
    ///
    /// Each step visit is shown as a bar indicating when it ran relative
    /// to the total run time.
    pub fn gantt_chart(&self, execution_id: Uuid) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let tracks = self.lock();
        let track = match tracks.get(&execution_id) {
            Some(track) => track,
            None => return output,
        };

        let total_time = (track.finished_at.unwrap_or_else(Utc::now) - track.started_at)
            .num_milliseconds();
        if total_time <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut visits = spans(track);
        visits.sort_by_key(|(_, start, _)| *start);

        for (step_id, start, end) in visits {
            let start_pos = (start.max(0) as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} |{}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

/// Drops tracks until at most `keep` remain, finished ones first.
fn evict(tracks: &mut HashMap<Uuid, Track>, keep: usize) {
    while tracks.len() > keep {
        let oldest = tracks
            .iter()
            .min_by_key(|(_, t)| (t.finished_at.is_none(), t.started_at))
            .map(|(id, _)| *id);
        match oldest {
            Some(id) => tracks.remove(&id),
            None => return,
        };
    }
}

/// Pairs each end event with the most recent open start of the same step.
fn spans(track: &Track) -> Vec<Span> {
    let mut open: HashMap<&str, Vec<i64>> = HashMap::new();
    let mut spans = Vec::new();

    for event in &track.events {
        let offset = (event.timestamp - track.started_at).num_milliseconds();
        match event.event_type {
            EventType::Started => open.entry(event.step_id.as_str()).or_default().push(offset),
            EventType::Completed | EventType::Failed => {
                if let Some(start) = open.get_mut(event.step_id.as_str()).and_then(Vec::pop) {
                    spans.push((event.step_id.clone(), start, offset));
                }
            }
        }
    }
    spans
}

#[async_trait]
impl DownstreamReporter for ExecutionTimeline {
    fn name(&self) -> &str {
        "timeline"
    }

    async fn report(&self, event: &ReportEvent) -> Result<(), ReportError> {
        self.record(event);
        Ok(())
    }
}

/// Pads or truncates a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{StepType, Variables};
    use chrono::Duration;

    fn step_event(id: Uuid, step: &str, start: bool, at: DateTime<Utc>) -> ReportEvent {
        if start {
            ReportEvent::StepStart {
                execution_id: id,
                step_id: step.into(),
                step_type: StepType::Action,
                variables: Variables::new(),
                at,
            }
        } else {
            ReportEvent::StepEnd {
                execution_id: id,
                step_id: step.into(),
                step_type: StepType::Action,
                variables: Variables::new(),
                error: None,
                at,
            }
        }
    }

    fn recorded_run() -> (ExecutionTimeline, Uuid) {
        let timeline = ExecutionTimeline::new();
        let id = Uuid::new_v4();
        let t0 = Utc::now();

        timeline.record(&ReportEvent::WorkflowStart {
            execution_id: id,
            playbook_id: "playbook--1".into(),
            at: t0,
        });
        timeline.record(&step_event(id, "step1", true, t0));
        timeline.record(&step_event(id, "step1", false, t0 + Duration::milliseconds(50)));
        timeline.record(&step_event(id, "step2", true, t0 + Duration::milliseconds(50)));
        timeline.record(&step_event(id, "step2", false, t0 + Duration::milliseconds(100)));
        timeline.record(&ReportEvent::WorkflowEnd {
            execution_id: id,
            playbook_id: "playbook--1".into(),
            error: None,
            at: t0 + Duration::milliseconds(100),
        });

        (timeline, id)
    }

    #[test]
    fn test_status_transitions() {
        let timeline = ExecutionTimeline::new();
        let id = Uuid::new_v4();
        assert_eq!(timeline.status(id), None);

        timeline.record(&ReportEvent::WorkflowStart {
            execution_id: id,
            playbook_id: "pb".into(),
            at: Utc::now(),
        });
        assert_eq!(timeline.status(id), Some(RunStatus::Running));

        timeline.record(&ReportEvent::WorkflowEnd {
            execution_id: id,
            playbook_id: "pb".into(),
            error: Some("boom".into()),
            at: Utc::now(),
        });
        assert_eq!(timeline.status(id), Some(RunStatus::Failed));
        assert_eq!(timeline.error(id).as_deref(), Some("boom"));
    }

    #[test]
    fn test_get_durations() {
        let (timeline, id) = recorded_run();
        let durations = timeline.get_durations(id);

        assert_eq!(durations.get("step1"), Some(&50));
        assert_eq!(durations.get("step2"), Some(&50));
        assert_eq!(timeline.get_events(id).len(), 4);
    }

    #[test]
    fn test_repeated_visits_summed() {
        let timeline = ExecutionTimeline::new();
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        timeline.record(&ReportEvent::WorkflowStart {
            execution_id: id,
            playbook_id: "pb".into(),
            at: t0,
        });
        for i in 0..3 {
            let start = t0 + Duration::milliseconds(i * 20);
            timeline.record(&step_event(id, "while--1", true, start));
            timeline.record(&step_event(id, "while--1", false, start + Duration::milliseconds(10)));
        }

        assert_eq!(timeline.get_durations(id).get("while--1"), Some(&30));
    }

    #[test]
    fn test_gantt_chart_generation() {
        let (timeline, id) = recorded_run();
        let chart = timeline.gantt_chart(id);

        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_unknown_execution() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart(Uuid::new_v4());
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_events_for_unknown_execution_ignored() {
        let timeline = ExecutionTimeline::new();
        timeline.record(&step_event(Uuid::new_v4(), "step1", true, Utc::now()));
        assert!(timeline.executions().is_empty());
    }

    #[test]
    fn test_retention_evicts_finished_first() {
        let timeline = ExecutionTimeline::with_retention(2);
        let t0 = Utc::now();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        for (i, id) in ids.iter().take(2).enumerate() {
            timeline.record(&ReportEvent::WorkflowStart {
                execution_id: *id,
                playbook_id: "pb".into(),
                at: t0 + Duration::milliseconds(i as i64),
            });
        }
        // The newer run finishes, the older one is still running
        timeline.record(&ReportEvent::WorkflowEnd {
            execution_id: ids[1],
            playbook_id: "pb".into(),
            error: None,
            at: t0 + Duration::milliseconds(5),
        });
        timeline.record(&ReportEvent::WorkflowStart {
            execution_id: ids[2],
            playbook_id: "pb".into(),
            at: t0 + Duration::milliseconds(10),
        });

        let mut kept = timeline.executions();
        kept.sort();
        let mut expected = vec![ids[0], ids[2]];
        expected.sort();
        assert_eq!(kept, expected);
        assert_eq!(timeline.status(ids[1]), None);
    }

    #[test]
    fn test_remove() {
        let (timeline, id) = recorded_run();
        assert!(timeline.remove(id));
        assert!(!timeline.remove(id));
        assert!(timeline.get_events(id).is_empty());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("action--block-ip", 12), "action--b...");
        assert_eq!(truncate("ééééééééééééééé", 12).chars().count(), 12);
    }

    #[tokio::test]
    async fn test_downstream_report() {
        let timeline = ExecutionTimeline::new();
        let id = Uuid::new_v4();
        timeline
            .report(&ReportEvent::WorkflowStart {
                execution_id: id,
                playbook_id: "pb".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(timeline.playbook_id(id).as_deref(), Some("pb"));
    }
}
