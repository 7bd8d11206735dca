//! Structured per-stage telemetry.
//!
//! Every record is a single-line JSON object logged under [`TELEMETRY_TARGET`]. Stage
//! spans report how long one pipeline stage took; events carry a named payload such
//! as per-call face statistics. Nothing is built or logged until [`configure`] has
//! switched telemetry on with a level that admits the record.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};
use serde_json::{Map, Value, json};

use crate::config::TelemetrySettings;

/// Log target used for every telemetry record.
pub const TELEMETRY_TARGET: &str = "facemesh::telemetry";

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);
static TELEMETRY_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Off as usize);

/// Times one phase of a pipeline stage and logs a JSON record when dropped.
#[must_use = "the span reports when it is dropped"]
pub struct StageSpan {
    stage: &'static str,
    phase: &'static str,
    level: Level,
    start: Instant,
    active: bool,
}

impl Drop for StageSpan {
    fn drop(&mut self) {
        if self.active {
            let record = stage_record(self.stage, self.phase, self.start.elapsed());
            log!(target: TELEMETRY_TARGET, self.level, "{record}");
        }
    }
}

/// Open a span for `phase` of `stage`, reported at `level`.
pub fn stage_span(stage: &'static str, phase: &'static str, level: Level) -> StageSpan {
    StageSpan {
        stage,
        phase,
        level,
        start: Instant::now(),
        active: allows(level),
    }
}

/// Log a named event. `fields` is only evaluated when the record will be emitted.
pub fn record_event(level: Level, event: &str, fields: impl FnOnce() -> Value) {
    if allows(level) {
        let record = event_record(event, fields());
        log!(target: TELEMETRY_TARGET, level, "{record}");
    }
}

/// Apply the telemetry switches from `settings`.
pub fn configure(settings: &TelemetrySettings) {
    TELEMETRY_ENABLED.store(settings.enabled, Ordering::Relaxed);
    TELEMETRY_LEVEL.store(settings.level_filter() as usize, Ordering::Relaxed);
}

pub fn telemetry_enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// Most verbose level telemetry records are emitted at.
pub fn telemetry_level() -> LevelFilter {
    let index = TELEMETRY_LEVEL.load(Ordering::Relaxed);
    LevelFilter::iter()
        .nth(index)
        .unwrap_or(LevelFilter::Off)
}

fn allows(level: Level) -> bool {
    telemetry_enabled()
        && level <= telemetry_level()
        && log_enabled!(target: TELEMETRY_TARGET, level)
}

fn stage_record(stage: &str, phase: &str, elapsed: Duration) -> Value {
    json!({
        "event": "stage",
        "stage": stage,
        "phase": phase,
        "elapsed_ms": elapsed.as_secs_f64() * 1_000.0,
    })
}

fn event_record(event: &str, fields: Value) -> Value {
    let mut record = Map::new();
    record.insert("event".to_string(), Value::from(event));
    match fields {
        Value::Object(fields) => record.extend(fields),
        Value::Null => {}
        other => {
            record.insert("value".to_string(), other);
        }
    }
    Value::Object(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_records_name_stage_and_phase() {
        let record = stage_record("detection", "decode", Duration::from_millis(12));
        assert_eq!(record["event"], "stage");
        assert_eq!(record["stage"], "detection");
        assert_eq!(record["phase"], "decode");
        let elapsed = record["elapsed_ms"].as_f64().expect("elapsed_ms");
        assert!((elapsed - 12.0).abs() < 1e-9);
    }

    #[test]
    fn event_records_flatten_object_fields() {
        let record = event_record("detect", json!({"faces": 2, "mode": "standard"}));
        assert_eq!(
            record.to_string(),
            r#"{"event":"detect","faces":2,"mode":"standard"}"#
        );

        let scalar = event_record("released", json!(3));
        assert_eq!(scalar["value"], 3);
        assert_eq!(event_record("noop", Value::Null), json!({"event": "noop"}));
    }

    #[test]
    fn level_filter_index_matches_iteration_order() {
        for filter in LevelFilter::iter() {
            assert_eq!(LevelFilter::iter().nth(filter as usize), Some(filter));
        }
    }
}
