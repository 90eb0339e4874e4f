use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::collections::HashSet;

pub struct Metrics {
    passes: IntCounterVec,
    pass_duration: HistogramVec,
    inference_failures: IntCounter,
    publish_failures: IntCounter,
    commands: IntCounterVec,
    frames_received: IntCounter,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("visual_query".to_string()), None)
            .unwrap_or_default();

        let passes = IntCounterVec::new(
            Opts::new("passes_total", "Total number of inference passes"),
            &["trigger"],
        )
        .expect("valid passes_total metric");

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));
        let pass_duration = HistogramVec::new(
            HistogramOpts::new(
                "pass_duration_ms",
                "Duration of inference passes in milliseconds",
            )
            .buckets(boundaries),
            &["trigger"],
        )
        .expect("valid pass_duration_ms metric");

        let inference_failures = IntCounter::new(
            "inference_failures_total",
            "Passes whose model call failed",
        )
        .expect("valid inference_failures_total metric");

        let publish_failures =
            IntCounter::new("publish_failures_total", "Passes that could not be published")
                .expect("valid publish_failures_total metric");

        let commands = IntCounterVec::new(
            Opts::new("commands_total", "Total number of commands"),
            &["verb"],
        )
        .expect("valid commands_total metric");

        let frames_received = IntCounter::new("frames_received_total", "Frames accepted")
            .expect("valid frames_received_total metric");

        for collector in [
            Box::new(passes.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(pass_duration.clone()),
            Box::new(inference_failures.clone()),
            Box::new(publish_failures.clone()),
            Box::new(commands.clone()),
            Box::new(frames_received.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                tracing::error!("Failed to register metric: {}", e);
            }
        }

        Metrics {
            passes,
            pass_duration,
            inference_failures,
            publish_failures,
            commands,
            frames_received,
            registry,
        }
    }

    pub fn record_pass(&self, trigger: &str, duration_ms: u64) {
        self.passes.with_label_values(&[trigger]).inc();
        self.pass_duration
            .with_label_values(&[trigger])
            .observe(duration_ms as f64);
    }

    pub fn record_inference_failure(&self) {
        self.inference_failures.inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn record_command(&self, verb: &str) {
        self.commands.with_label_values(&[verb]).inc();
    }

    pub fn record_frame(&self) {
        self.frames_received.inc();
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
