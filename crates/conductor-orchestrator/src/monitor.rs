use crate::types::{FailedRequest, PerformanceMetrics};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

struct MonitorState {
    in_flight: HashMap<String, (Instant, Option<String>)>,
    metrics: PerformanceMetrics,
    max_recent_failures: usize,
}

/// Tracks request timings, outcomes, and per-agent processing times.
///
/// All counters live behind one lock, so a snapshot never observes a
/// half-applied update and `reset` is atomic.
#[derive(Clone)]
pub struct PerformanceMonitor {
    state: Arc<RwLock<MonitorState>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with_capacity(50)
    }

    /// A monitor that keeps at most `max_recent_failures` failed requests.
    pub fn with_capacity(max_recent_failures: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MonitorState {
                in_flight: HashMap::new(),
                metrics: PerformanceMetrics::default(),
                max_recent_failures,
            })),
        }
    }

    /// Begin timing a request.
    pub async fn start_request(&self, request_id: &str, endpoint: Option<&str>) {
        let mut state = self.state.write().await;
        state.in_flight.insert(
            request_id.to_string(),
            (Instant::now(), endpoint.map(str::to_string)),
        );
    }

    /// Finish timing a request and fold it into the aggregates.
    ///
    /// Returns the elapsed time, or `None` when `request_id` was never started.
    pub async fn end_request(
        &self,
        request_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> Option<Duration> {
        let mut state = self.state.write().await;
        let Some((started, endpoint)) = state.in_flight.remove(request_id) else {
            debug!(request_id = %request_id, "end_request for unknown request");
            return None;
        };
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        state.metrics.record_response(elapsed_ms, success);
        if !success {
            let limit = state.max_recent_failures;
            let failures = &mut state.metrics.recent_failures;
            failures.push(FailedRequest {
                request_id: request_id.to_string(),
                endpoint,
                error: error.map(str::to_string),
                duration: elapsed_ms,
                timestamp: Utc::now(),
            });
            if failures.len() > limit {
                let excess = failures.len() - limit;
                failures.drain(..excess);
            }
        }
        Some(elapsed)
    }

    /// Record how long an agent spent handling one message.
    pub async fn record_agent_time(&self, agent_id: &str, elapsed: Duration) {
        let mut state = self.state.write().await;
        state
            .metrics
            .agent_processing_times
            .entry(agent_id.to_string())
            .or_default()
            .record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Snapshot of the aggregate metrics.
    pub async fn get_metrics(&self) -> PerformanceMetrics {
        self.state.read().await.metrics.clone()
    }

    /// Clear all aggregates and in-flight timers.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.in_flight.clear();
        state.metrics = PerformanceMetrics::default();
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.read().await.in_flight.len()
    }

    /// Serialize the current metrics as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let state = self.state.read().await;
        serde_json::json!({
            "metrics": state.metrics,
            "inFlight": state.in_flight.len(),
        })
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
