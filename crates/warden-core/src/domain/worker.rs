//! Worker output protocol.
//!
//! The training worker writes one JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"step","step":3,"loss":0.82,"elapsedMs":2400,"params":{"w":0.41,"b":0.02}}
//! {"type":"info","message":"epoch 1 done"}
//! {"type":"error","message":"nan detected"}
//! ```
//!
//! Step records may carry parameters either in a `params` object or as extra
//! top-level fields (`"w": 0.41, "b": 0.02`); both land in [`StepParams`].

use std::collections::BTreeMap;

use serde_json::Value;
use warden_state::StepParams;

/// One measurement reported by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub loss: f64,
    pub elapsed_ms: u64,
    pub params: StepParams,
}

/// A parsed worker output line.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Step(StepReport),
    Info(String),
    Error(String),
}

/// Why a worker line could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum WorkerLineError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a json object")]
    NotAnObject,

    #[error("unknown record type: {0}")]
    UnknownType(String),

    #[error("step record missing or invalid field: {0}")]
    InvalidField(&'static str),

    #[error("loss must be a finite non-negative number, got {0}")]
    InvalidLoss(f64),
}

const STEP_KEYS: [&str; 5] = ["type", "step", "loss", "elapsedMs", "elapsed_ms"];

/// Parse a single worker output line.
pub fn parse_worker_line(line: &str) -> Result<WorkerMessage, WorkerLineError> {
    let value: Value = serde_json::from_str(line.trim())?;
    let obj = value.as_object().ok_or(WorkerLineError::NotAnObject)?;

    let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    let message = || {
        obj.get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match kind {
        "info" => Ok(WorkerMessage::Info(message())),
        "error" => Ok(WorkerMessage::Error(message())),
        "step" => {
            let step = obj
                .get("step")
                .and_then(Value::as_u64)
                .ok_or(WorkerLineError::InvalidField("step"))?;
            let loss = obj
                .get("loss")
                .and_then(Value::as_f64)
                .ok_or(WorkerLineError::InvalidField("loss"))?;
            if !loss.is_finite() || loss < 0.0 {
                return Err(WorkerLineError::InvalidLoss(loss));
            }
            let elapsed_ms = obj
                .get("elapsedMs")
                .or_else(|| obj.get("elapsed_ms"))
                .and_then(Value::as_u64)
                .ok_or(WorkerLineError::InvalidField("elapsedMs"))?;

            let values: BTreeMap<String, Value> = match obj.get("params") {
                Some(Value::Object(map)) => map.clone().into_iter().collect(),
                Some(_) => return Err(WorkerLineError::InvalidField("params")),
                None => obj
                    .iter()
                    .filter(|(k, _)| !STEP_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };

            Ok(WorkerMessage::Step(StepReport {
                step,
                loss,
                elapsed_ms,
                params: StepParams::new(values),
            }))
        }
        other => Err(WorkerLineError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_with_params_object() {
        let line = r#"{"type":"step","step":3,"loss":0.82,"elapsedMs":2400,"params":{"w":0.41,"b":0.02}}"#;
        let WorkerMessage::Step(step) = parse_worker_line(line).unwrap() else {
            panic!("expected step");
        };
        assert_eq!(step.step, 3);
        assert_eq!(step.elapsed_ms, 2400);
        assert_eq!(step.params.number("w"), Some(0.41));
        assert_eq!(step.params.values.len(), 2);
    }

    #[test]
    fn test_parse_step_with_flat_params() {
        let line = r#"{"type":"step","step":1,"loss":1.0,"elapsedMs":10,"w":0.5,"b":-0.1}"#;
        let WorkerMessage::Step(step) = parse_worker_line(line).unwrap() else {
            panic!("expected step");
        };
        assert_eq!(step.params.number("b"), Some(-0.1));
        assert!(!step.params.values.contains_key("type"));
        assert!(!step.params.values.contains_key("loss"));
    }

    #[test]
    fn test_parse_info_and_error() {
        assert_eq!(
            parse_worker_line(r#"{"type":"info","message":"warming up"}"#).unwrap(),
            WorkerMessage::Info("warming up".into())
        );
        assert_eq!(
            parse_worker_line(r#"{"type":"error","message":"nan"}"#).unwrap(),
            WorkerMessage::Error("nan".into())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_worker_line("Loading dataset..."),
            Err(WorkerLineError::Json(_))
        ));
        assert!(matches!(
            parse_worker_line(r#"{"type":"metric"}"#),
            Err(WorkerLineError::UnknownType(_))
        ));
        assert!(matches!(
            parse_worker_line(r#"{"type":"step","loss":1.0,"elapsedMs":1}"#),
            Err(WorkerLineError::InvalidField("step"))
        ));
        assert!(matches!(
            parse_worker_line(r#"{"type":"step","step":1,"loss":-0.5,"elapsedMs":1}"#),
            Err(WorkerLineError::InvalidLoss(_))
        ));
        assert!(matches!(
            parse_worker_line("[1,2]"),
            Err(WorkerLineError::NotAnObject)
        ));
    }
}
