//! In-process pub/sub for job progress events.
//!
//! One broadcast channel per running job. A subscriber that falls behind
//! loses the oldest progress events, never the terminal one: the terminal
//! event is the last message sent on the channel. Publishing it closes the
//! job's channel and moves the event into a bounded replay buffer, so late
//! subscribers still see how a recently finished job ended while the hub
//! itself stays bounded.
//!
//! # Usage
//!
//! ```ignore
//! let hub = EventHub::new();
//! let orchestrator = Orchestrator::builder(model, authority)
//!     .with_publisher(Arc::new(hub.clone()))
//!     .build()?;
//! let job_id = orchestrator.start(request).await?;
//! let mut events = Box::pin(hub.subscribe(job_id));
//! while let Some(event) = events.next().await { ... }
//! ```

use futures::Stream;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::traits::publisher::EventPublisher;
use crate::types::event::ProgressEvent;
use crate::types::ids::JobId;

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_RETAINED: usize = 1024;

#[derive(Default)]
struct HubState {
    /// Channels of jobs that have not published a terminal event yet.
    live: HashMap<JobId, broadcast::Sender<ProgressEvent>>,

    /// Terminal events of finished jobs, oldest first.
    finished: IndexMap<JobId, ProgressEvent>,
}

/// Job-keyed event hub. Thread-safe and cloneable.
#[derive(Clone)]
pub struct EventHub {
    state: Arc<RwLock<HubState>>,
    capacity: usize,
    retained: usize,
}

impl EventHub {
    /// Create a hub with the default capacity (256 events per job).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub with the given per-job channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            capacity: capacity.max(1),
            retained: DEFAULT_RETAINED,
        }
    }

    /// Keep at most `retained` terminal events of finished jobs for replay.
    pub fn with_retained_terminals(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    /// Stream of a job's events, ending after the terminal event.
    ///
    /// Subscribing after the job finished yields just the terminal event,
    /// as long as it is still in the replay buffer.
    pub fn subscribe(&self, job_id: JobId) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let (rx, terminal) = {
            let mut state = self.write();
            match state.finished.get(&job_id) {
                Some(event) => (None, Some(event.clone())),
                None => {
                    let capacity = self.capacity;
                    let tx = state
                        .live
                        .entry(job_id)
                        .or_insert_with(|| broadcast::channel(capacity).0);
                    (Some(tx.subscribe()), None)
                }
            }
        };

        async_stream::stream! {
            if let Some(event) = terminal {
                yield event;
                return;
            }
            let Some(mut rx) = rx else {
                return;
            };
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let done = event.is_terminal();
                        yield event;
                        if done {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(%job_id, skipped, "subscriber lagged, oldest events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// The retained terminal event for a job, if it finished recently.
    pub fn terminal_event(&self, job_id: JobId) -> Option<ProgressEvent> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.finished.get(&job_id).cloned()
    }

    /// Drop a finished job's retained terminal event.
    pub fn forget(&self, job_id: JobId) {
        self.write().finished.shift_remove(&job_id);
    }

    /// Number of jobs with an open channel.
    pub fn live_count(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).live.len()
    }

    /// Number of finished jobs whose terminal event is retained.
    pub fn retained_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .finished
            .len()
    }

    fn write(&self) -> RwLockWriteGuard<'_, HubState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventHub {
    fn publish(&self, event: ProgressEvent) {
        let mut state = self.write();
        if state.finished.contains_key(&event.job_id) {
            debug!(job_id = %event.job_id, "event after terminal event dropped");
            return;
        }

        if !event.is_terminal() {
            let capacity = self.capacity;
            let tx = state
                .live
                .entry(event.job_id)
                .or_insert_with(|| broadcast::channel(capacity).0);
            // No receivers is fine.
            let _ = tx.send(event);
            return;
        }

        // Receivers drain what is buffered, terminal event last, then see
        // the channel close.
        if let Some(tx) = state.live.remove(&event.job_id) {
            let _ = tx.send(event.clone());
        }
        state.finished.insert(event.job_id, event);
        while state.finished.len() > self.retained {
            state.finished.shift_remove_index(0);
        }
    }
}
