use std::fmt;
use std::time::Instant;

/// Floor for the generation window so TPS never divides by zero.
pub const MIN_GENERATION_SECONDS: f64 = 1e-6;

/// Latency and throughput of one streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamMetrics {
    pub ttft_seconds: Option<f64>,
    pub total_tokens: usize,
    pub tps: f64,
    pub generation_seconds: f64,
}

impl StreamMetrics {
    /// Metrics for a request that produced no content (empty or failed).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derives metrics from the timestamps of one stream.
    ///
    /// `now` is the arrival time of the latest chunk while streaming, or the
    /// completion time for the final figures.
    pub fn compute(
        request_start: Instant,
        first_token_time: Option<Instant>,
        tokens_so_far: usize,
        now: Instant,
    ) -> Self {
        let Some(first_token_time) = first_token_time else {
            return Self::empty();
        };

        let generation_seconds = now
            .saturating_duration_since(first_token_time)
            .as_secs_f64()
            .max(MIN_GENERATION_SECONDS);
        let ttft_seconds = first_token_time
            .saturating_duration_since(request_start)
            .as_secs_f64();

        Self {
            ttft_seconds: Some(ttft_seconds),
            total_tokens: tokens_so_far,
            tps: tokens_so_far as f64 / generation_seconds,
            generation_seconds,
        }
    }

    pub fn ttft_millis(&self) -> Option<f64> {
        self.ttft_seconds.map(|seconds| seconds * 1000.0)
    }
}

impl fmt::Display for StreamMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ttft_millis() {
            Some(ttft) => write!(f, "TTFT: {ttft:.0} ms")?,
            None => f.write_str("TTFT: n/a")?,
        }
        write!(
            f,
            " | tokens: {} | avg TPS: {:.2}",
            self.total_tokens, self.tps
        )
    }
}

/// The single "last response" slot. Each completed request overwrites it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsRecorder {
    last: Option<StreamMetrics>,
}

impl MetricsRecorder {
    pub fn record(&mut self, metrics: StreamMetrics) {
        self.last = Some(metrics);
    }

    pub fn last(&self) -> Option<&StreamMetrics> {
        self.last.as_ref()
    }
}
