//! Stage output record produced by a back-end.

use super::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The outcome of executing one stage.
///
/// `outputs` maps output port names to JSON values, usually file paths or
/// lists of file paths written below the stage's work directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Output port values (for successful executions).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, serde_json::Value>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Skip reason (for skipped executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: f64,
}

impl StageOutput {
    /// Creates a successful output.
    #[must_use]
    pub fn ok(outputs: HashMap<String, serde_json::Value>) -> Self {
        Self {
            status: StageStatus::Ok,
            outputs,
            error: None,
            skip_reason: None,
            duration_ms: 0.0,
        }
    }

    /// Creates a skip output with a reason.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skip,
            outputs: HashMap::new(),
            error: None,
            skip_reason: Some(reason.into()),
            duration_ms: 0.0,
        }
    }

    /// Creates a failure output with an error message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            outputs: HashMap::new(),
            error: Some(error.into()),
            skip_reason: None,
            duration_ms: 0.0,
        }
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Gets an output port value.
    #[must_use]
    pub fn get(&self, port: &str) -> Option<&serde_json::Value> {
        self.outputs.get(port)
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_output() {
        let mut outputs = HashMap::new();
        outputs.insert("mask".to_string(), json!("/work/mask.nii"));
        let output = StageOutput::ok(outputs).with_duration_ms(12.5);

        assert!(output.is_success());
        assert_eq!(output.get("mask"), Some(&json!("/work/mask.nii")));
        assert!((output.duration_ms - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_skip_and_fail() {
        let skipped = StageOutput::skip("upstream 'qsm.rts.e0' failed");
        assert_eq!(skipped.status, StageStatus::Skip);
        assert!(!skipped.is_success());
        assert!(!skipped.is_failure());

        let failed = StageOutput::fail("exit status 1");
        assert!(failed.is_failure());
        assert_eq!(failed.error.as_deref(), Some("exit status 1"));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(StageOutput::fail("boom")).unwrap();
        assert!(json.get("outputs").is_none());
        assert_eq!(json["status"], "fail");
    }
}
