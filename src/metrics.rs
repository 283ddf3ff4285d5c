//! Stack Metrics
//!
//! Prometheus counters and histograms of the stack engine, kept in a
//! registry owned by the engine instead of the global default registry.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::kinds::DeviceLayerKind;

/// Metrics of stack application
#[derive(Clone)]
pub struct StackMetrics {
    registry: Registry,
    stacks_applied: IntCounter,
    stack_aborts: IntCounterVec,
    config_rejections: IntCounter,
    ext_commands: IntCounterVec,
    ext_command_duration: HistogramVec,
}

impl std::fmt::Debug for StackMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackMetrics").finish_non_exhaustive()
    }
}

impl StackMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let stacks_applied = IntCounter::new(
            "layerstack_stacks_applied_total",
            "Resource stacks applied successfully",
        )
        .map_err(metrics_err)?;
        let stack_aborts = IntCounterVec::new(
            Opts::new(
                "layerstack_stack_aborts_total",
                "Resource stacks aborted, by failing layer kind",
            ),
            &["layer"],
        )
        .map_err(metrics_err)?;
        let config_rejections = IntCounter::new(
            "layerstack_config_rejections_total",
            "Resource stacks rejected during size negotiation",
        )
        .map_err(metrics_err)?;
        let ext_commands = IntCounterVec::new(
            Opts::new(
                "layerstack_external_commands_total",
                "External commands executed, by program and outcome",
            ),
            &["program", "outcome"],
        )
        .map_err(metrics_err)?;
        let ext_command_duration = HistogramVec::new(
            HistogramOpts::new(
                "layerstack_external_command_duration_seconds",
                "Duration of external commands",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["program"],
        )
        .map_err(metrics_err)?;

        registry
            .register(Box::new(stacks_applied.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(stack_aborts.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(config_rejections.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(ext_commands.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(ext_command_duration.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            stacks_applied,
            stack_aborts,
            config_rejections,
            ext_commands,
            ext_command_duration,
        })
    }

    pub fn record_applied(&self) {
        self.stacks_applied.inc();
    }

    pub fn record_abort(&self, layer: Option<DeviceLayerKind>) {
        let label = layer.map(|k| k.to_string()).unwrap_or_else(|| "none".to_string());
        self.stack_aborts.with_label_values(&[&label]).inc();
    }

    pub fn record_config_rejection(&self) {
        self.config_rejections.inc();
    }

    pub fn record_command(&self, program: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.ext_commands
            .with_label_values(&[program, outcome])
            .inc();
        self.ext_command_duration
            .with_label_values(&[program])
            .observe(elapsed.as_secs_f64());
    }

    pub fn stacks_applied(&self) -> u64 {
        self.stacks_applied.get()
    }

    pub fn aborts(&self, layer: DeviceLayerKind) -> u64 {
        self.stack_aborts
            .with_label_values(&[&layer.to_string()])
            .get()
    }

    pub fn config_rejections(&self) -> u64 {
        self.config_rejections.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics error: {}", e))
}
