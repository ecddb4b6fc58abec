//! Observability metrics for bridge operations.
//!
//! Prometheus-compatible counters and histograms for LLM requests,
//! token usage, and MCP tool invocations.

use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

const MODEL_LABEL: &str = "model";
const STATUS_LABEL: &str = "status";
const TOOL_LABEL: &str = "tool";
const DIRECTION_LABEL: &str = "direction";

/// Metrics collector for bridge operations
pub struct MetricsCollector {
    registry: Registry,

    /// Total LLM requests by model and status
    llm_requests_total: CounterVec,

    /// LLM request duration in milliseconds
    llm_duration_ms: HistogramVec,

    /// Total tokens by model and direction (input/output)
    tokens_total: CounterVec,

    /// Total tool invocations by tool and status
    tool_calls_total: CounterVec,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let registry = Registry::new();

        let llm_requests_total = CounterVec::new(
            Opts::new("bridge_llm_requests_total", "Total LLM requests"),
            &[MODEL_LABEL, STATUS_LABEL],
        )
        .expect("Failed to create LLM requests counter");
        registry
            .register(Box::new(llm_requests_total.clone()))
            .expect("Failed to register LLM requests counter");

        let llm_duration_ms = HistogramVec::new(
            HistogramOpts::new("bridge_llm_duration_ms", "LLM request duration (ms)").buckets(
                vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0],
            ),
            &[MODEL_LABEL],
        )
        .expect("Failed to create LLM duration histogram");
        registry
            .register(Box::new(llm_duration_ms.clone()))
            .expect("Failed to register LLM duration histogram");

        let tokens_total = CounterVec::new(
            Opts::new("bridge_tokens_total", "Total tokens by direction"),
            &[MODEL_LABEL, DIRECTION_LABEL],
        )
        .expect("Failed to create tokens counter");
        registry
            .register(Box::new(tokens_total.clone()))
            .expect("Failed to register tokens counter");

        let tool_calls_total = CounterVec::new(
            Opts::new("bridge_tool_calls_total", "Total MCP tool invocations"),
            &[TOOL_LABEL, STATUS_LABEL],
        )
        .expect("Failed to create tool calls counter");
        registry
            .register(Box::new(tool_calls_total.clone()))
            .expect("Failed to register tool calls counter");

        Self {
            registry,
            llm_requests_total,
            llm_duration_ms,
            tokens_total,
            tool_calls_total,
        }
    }

    pub fn record_llm_request(&self, model: &str, status: &str, duration_ms: f64) {
        self.llm_requests_total
            .with_label_values(&[model, status])
            .inc();
        self.llm_duration_ms
            .with_label_values(&[model])
            .observe(duration_ms);
    }

    pub fn record_tokens(&self, model: &str, input: u64, output: u64) {
        self.tokens_total
            .with_label_values(&[model, "input"])
            .inc_by(input as f64);
        self.tokens_total
            .with_label_values(&[model, "output"])
            .inc_by(output as f64);
    }

    pub fn record_tool_call(&self, tool: &str, status: &str) {
        self.tool_calls_total
            .with_label_values(&[tool, status])
            .inc();
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide collector shared by all sessions
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
