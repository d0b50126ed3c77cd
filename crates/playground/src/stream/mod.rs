//! Streaming response consumption: token estimation, timing and the
//! per-response state machine.

pub mod clock;
pub mod consumer;
pub mod metrics;
pub mod tokens;

pub use clock::{Clock, ScriptedClock, SystemClock};
pub use consumer::{
    CURSOR_GLYPH, ERROR_MARKER, StreamConsumer, StreamOutcome, StreamPhase, StreamTransition,
    StreamTransitionRejection, format_error_text,
};
pub use metrics::{MIN_GENERATION_SECONDS, MetricsRecorder, StreamMetrics};
pub use tokens::{TokenEstimator, Tokenizer, heuristic_count, shared_estimator};
