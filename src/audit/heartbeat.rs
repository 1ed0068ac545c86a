//! Periodic liveness entries for long runs.

use super::{LogEntry, LogSink};
use crate::state::CancelFlag;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Longest single sleep, so stop and cancel are noticed promptly.
const TICK: Duration = Duration::from_millis(100);

/// Background task emitting a `heartbeat` entry every interval.
pub struct Heartbeat {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

impl Heartbeat {
    pub fn start(
        sink: Arc<dyn LogSink>,
        session_id: &str,
        trace_id: &str,
        interval: Duration,
        cancel: CancelFlag,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let session_id = session_id.to_string();
        let trace_id = trace_id.to_string();

        let handle = tokio::spawn(async move {
            let mut beats = 0u64;
            let mut waited = Duration::ZERO;
            loop {
                if stop_flag.load(Ordering::SeqCst) || cancel.is_cancelled() {
                    break;
                }
                let step = TICK.min(interval.saturating_sub(waited)).max(Duration::from_millis(1));
                tokio::time::sleep(step).await;
                waited += step;
                if waited >= interval {
                    beats += 1;
                    waited = Duration::ZERO;
                    sink.record(
                        LogEntry::new(&session_id, &trace_id, "heartbeat")
                            .with_content(json!({"beat": beats})),
                    );
                }
            }
            beats
        });

        Self { stop, handle }
    }

    /// Stop the task and return how many beats it emitted.
    pub async fn stop(self) -> u64 {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.await.unwrap_or(0)
    }
}
