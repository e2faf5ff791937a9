//! Fan-out Reporter
//!
//! Implements [`LifecycleReporter`] by queuing owned events onto an
//! unbounded channel. A background task drains the queue in order and calls
//! every registered downstream reporter in turn, so the engine never waits
//! on a slow sink.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{DownstreamReporter, LifecycleReporter, ReportError, ReportEvent};
use crate::execution::EngineError;
use crate::playbook::{Playbook, Step, Variables};

type Downstream = Arc<RwLock<Vec<Arc<dyn DownstreamReporter>>>>;

enum Message {
    Event(ReportEvent),
    Flush(oneshot::Sender<()>),
}

/// Queues lifecycle events for a capped set of downstream reporters.
///
/// Cloning is cheap; every clone feeds the same queue.
#[derive(Clone)]
pub struct Reporter {
    sender: mpsc::UnboundedSender<Message>,
    downstream: Downstream,
    max_reporters: usize,
}

impl Reporter {
    /// Starts the fan-out task. Must be called inside a tokio runtime.
    pub fn start(
        downstream: Vec<Arc<dyn DownstreamReporter>>,
        max_reporters: usize,
    ) -> Result<Self, ReportError> {
        if downstream.len() > max_reporters {
            return Err(ReportError::TooManyReporters(max_reporters));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let downstream: Downstream = Arc::new(RwLock::new(downstream));

        tokio::spawn(process(receiver, Arc::clone(&downstream)));

        Ok(Self {
            sender,
            downstream,
            max_reporters,
        })
    }

    /// Adds a downstream reporter for subsequent events.
    pub fn register(&self, reporter: Arc<dyn DownstreamReporter>) -> Result<(), ReportError> {
        let mut downstream = self
            .downstream
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if downstream.len() >= self.max_reporters {
            return Err(ReportError::TooManyReporters(self.max_reporters));
        }

        debug!("Registered downstream reporter '{}'", reporter.name());
        downstream.push(reporter);
        Ok(())
    }

    /// Number of registered downstream reporters.
    pub fn len(&self) -> usize {
        self.downstream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until every event queued before this call has been delivered.
    pub async fn flush(&self) -> Result<(), ReportError> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(Message::Flush(done))
            .map_err(|_| ReportError::Closed)?;
        wait.await.map_err(|_| ReportError::Closed)
    }

    fn queue(&self, event: ReportEvent) {
        if self.sender.send(Message::Event(event)).is_err() {
            warn!("Reporter queue closed, dropping lifecycle event");
        }
    }
}

async fn process(mut receiver: mpsc::UnboundedReceiver<Message>, downstream: Downstream) {
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Event(event) => {
                let reporters: Vec<Arc<dyn DownstreamReporter>> = downstream
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();

                for reporter in reporters {
                    if let Err(e) = reporter.report(&event).await {
                        warn!("Downstream reporter '{}' failed: {}", reporter.name(), e);
                    }
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Reporter queue drained, fan-out task exiting");
}

impl LifecycleReporter for Reporter {
    fn report_workflow_start(&self, execution_id: Uuid, playbook: &Playbook, at: DateTime<Utc>) {
        self.queue(ReportEvent::WorkflowStart {
            execution_id,
            playbook_id: playbook.id.clone(),
            at,
        });
    }

    fn report_workflow_end(
        &self,
        execution_id: Uuid,
        playbook: &Playbook,
        error: Option<&EngineError>,
        at: DateTime<Utc>,
    ) {
        self.queue(ReportEvent::WorkflowEnd {
            execution_id,
            playbook_id: playbook.id.clone(),
            error: error.map(ToString::to_string),
            at,
        });
    }

    fn report_step_start(
        &self,
        execution_id: Uuid,
        step: &Step,
        variables: &Variables,
        at: DateTime<Utc>,
    ) {
        self.queue(ReportEvent::StepStart {
            execution_id,
            step_id: step.id.clone(),
            step_type: step.step_type,
            variables: variables.clone(),
            at,
        });
    }

    fn report_step_end(
        &self,
        execution_id: Uuid,
        step: &Step,
        variables: &Variables,
        error: Option<&EngineError>,
        at: DateTime<Utc>,
    ) {
        self.queue(ReportEvent::StepEnd {
            execution_id,
            step_id: step.id.clone(),
            step_type: step.step_type,
            variables: variables.clone(),
            error: error.map(ToString::to_string),
            at,
        });
    }
}
