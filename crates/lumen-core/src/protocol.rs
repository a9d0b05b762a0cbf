use crate::model::{
    CheckResult, CommandKind, Diagnostic, FileChangeEvent, HealthSnapshot, Region,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Server to client envelope: `{"type": ..., "data": ..., "timestamp": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WireMsg {
    Snapshot(HealthSnapshot),
    FileChange(FileChangeEvent),
    CheckResult(CheckResult),
    Diagnostic(Diagnostic),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Snapshot(_) => "snapshot",
            WireMsg::FileChange(_) => "file_change",
            WireMsg::CheckResult(_) => "check_result",
            WireMsg::Diagnostic(_) => "diagnostic",
        }
    }
}

impl WireMessage {
    pub fn new(msg: WireMsg) -> Self {
        Self {
            timestamp: Utc::now(),
            msg,
        }
    }

    pub fn snapshot(snapshot: HealthSnapshot) -> Self {
        Self::new(WireMsg::Snapshot(snapshot))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match &self.msg {
            WireMsg::Snapshot(snapshot) => validate_snapshot(snapshot),
            WireMsg::FileChange(event) => validate_file_change(event),
            WireMsg::CheckResult(result) => validate_check_result(result),
            WireMsg::Diagnostic(diagnostic) => validate_diagnostic(diagnostic),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientCommand {
    pub command: String,
}

impl ClientCommand {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            command: kind.as_str().to_string(),
        }
    }

    pub fn kind(&self) -> Result<CommandKind, String> {
        self.command.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

pub fn encode_message(message: &WireMessage) -> Result<String, ProtocolError> {
    message.validate()?;
    let encoded =
        serde_json::to_string(message).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > DEFAULT_MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized {
            size: encoded.len(),
            max: DEFAULT_MAX_MESSAGE_BYTES,
        });
    }
    Ok(encoded)
}

pub fn decode_message(raw: &str) -> Result<WireMessage, ProtocolError> {
    if raw.len() > DEFAULT_MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized {
            size: raw.len(),
            max: DEFAULT_MAX_MESSAGE_BYTES,
        });
    }
    let message: WireMessage =
        serde_json::from_str(raw).map_err(|err| ProtocolError::Decode(err.to_string()))?;
    message.validate()?;
    Ok(message)
}

pub fn encode_command(command: &ClientCommand) -> Result<String, ProtocolError> {
    serde_json::to_string(command).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_command(raw: &str) -> Result<ClientCommand, ProtocolError> {
    if raw.len() > DEFAULT_MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized {
            size: raw.len(),
            max: DEFAULT_MAX_MESSAGE_BYTES,
        });
    }
    let command: ClientCommand =
        serde_json::from_str(raw).map_err(|err| ProtocolError::Decode(err.to_string()))?;
    if command.command.trim().is_empty() {
        return Err(invalid("command", "empty"));
    }
    Ok(command)
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ProtocolError> {
    if !value.is_finite() {
        return Err(invalid(field, "not a finite number"));
    }
    if value < min || value > max {
        return Err(invalid(field, format!("{value} outside [{min}, {max}]")));
    }
    Ok(())
}

pub fn validate_snapshot(snapshot: &HealthSnapshot) -> Result<(), ProtocolError> {
    check_range("illumination", snapshot.illumination, 0.0, 1.0)?;
    for (name, region) in &snapshot.regions {
        if name.trim().is_empty() {
            return Err(invalid("regions", "empty region key"));
        }
        validate_region(name, region)?;
    }
    for diagnostic in &snapshot.diagnostics {
        validate_diagnostic(diagnostic)?;
    }
    Ok(())
}

pub fn validate_region(name: &str, region: &Region) -> Result<(), ProtocolError> {
    check_range(&format!("regions.{name}.coverage"), region.coverage, 0.0, 100.0)?;
    let observed = u64::from(region.passing_tests) + u64::from(region.failing_tests);
    if observed > u64::from(region.test_count) {
        return Err(invalid(
            format!("regions.{name}.testCount"),
            format!(
                "passing ({}) + failing ({}) exceeds test count ({})",
                region.passing_tests, region.failing_tests, region.test_count
            ),
        ));
    }
    Ok(())
}

pub fn validate_check_result(result: &CheckResult) -> Result<(), ProtocolError> {
    check_range("coveragePercentage", result.coverage_percentage, 0.0, 100.0)?;
    if !result.duration.is_finite() || result.duration < 0.0 {
        return Err(invalid("duration", "must be a non-negative number"));
    }
    for (path, percent) in &result.file_coverage {
        check_range(&format!("fileCoverage.{path}"), *percent, 0.0, 100.0)?;
    }
    Ok(())
}

pub fn validate_diagnostic(diagnostic: &Diagnostic) -> Result<(), ProtocolError> {
    if diagnostic.region.trim().is_empty() {
        return Err(invalid("diagnostic.region", "empty"));
    }
    if diagnostic.message.trim().is_empty() {
        return Err(invalid("diagnostic.message", "empty"));
    }
    Ok(())
}

pub fn validate_file_change(event: &FileChangeEvent) -> Result<(), ProtocolError> {
    if event.file_path.trim().is_empty() {
        return Err(invalid("filePath", "empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailedTest, FileEventKind, RegionStatus, TestCase, TestOutcome};
    use serde_json::json;

    fn snapshot_json(illumination: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "snapshot",
            "timestamp": "2026-02-07T21:00:00Z",
            "data": {
                "illumination": illumination,
                "regions": {
                    "core-logic": {
                        "status": "healthy",
                        "coverage": 88.0,
                        "testCount": 10,
                        "passingTests": 10,
                        "failingTests": 0,
                        "fileCount": 12
                    }
                },
                "diagnostics": [],
                "timestamp": "2026-02-07T21:00:00+02:00",
                "hasLicense": true,
                "hasReadme": true
            }
        })
    }

    #[test]
    fn accepts_boundary_illumination_values() {
        for value in [json!(0.0), json!(1.0), json!(1)] {
            let raw = snapshot_json(value).to_string();
            let message = decode_message(&raw).expect("boundary value accepted");
            let WireMsg::Snapshot(snapshot) = message.msg else {
                panic!("expected snapshot");
            };
            assert_eq!(snapshot.regions["core-logic"].status, RegionStatus::Healthy);
        }
    }

    #[test]
    fn rejects_out_of_range_illumination() {
        let raw = snapshot_json(json!(1.5)).to_string();
        let err = decode_message(&raw).expect_err("1.5 must be rejected");
        assert!(matches!(err, ProtocolError::Invalid { ref field, .. } if field == "illumination"));

        let raw = snapshot_json(json!(-0.01)).to_string();
        assert!(decode_message(&raw).is_err());
    }

    #[test]
    fn rejects_snapshot_tag_with_file_change_payload() {
        let raw = json!({
            "type": "snapshot",
            "timestamp": "2026-02-07T21:00:00Z",
            "data": {
                "eventType": "modified",
                "filePath": "src/lib.rs",
                "isTestFile": false,
                "timestamp": "2026-02-07T21:00:00Z"
            }
        })
        .to_string();
        assert!(matches!(
            decode_message(&raw),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn rejects_unknown_type_and_missing_fields() {
        let unknown = json!({
            "type": "git_pulse",
            "timestamp": "2026-02-07T21:00:00Z",
            "data": {}
        })
        .to_string();
        assert!(decode_message(&unknown).is_err());

        let missing_timestamp = json!({
            "type": "diagnostic",
            "data": {
                "level": "alert",
                "region": "tests",
                "message": "boom",
                "timestamp": "2026-02-07T21:00:00Z"
            }
        })
        .to_string();
        assert!(decode_message(&missing_timestamp).is_err());
    }

    #[test]
    fn rejects_timestamp_without_offset() {
        let raw = json!({
            "type": "file_change",
            "timestamp": "2026-02-07T21:00:00",
            "data": {
                "eventType": "created",
                "filePath": "src/main.rs",
                "isTestFile": false,
                "timestamp": "2026-02-07T21:00:00Z"
            }
        })
        .to_string();
        assert!(decode_message(&raw).is_err());
    }

    #[test]
    fn rejects_region_counts_that_break_invariant() {
        let mut value = snapshot_json(json!(0.5));
        value["data"]["regions"]["core-logic"]["failingTests"] = json!(3);
        assert!(matches!(
            decode_message(&value.to_string()),
            Err(ProtocolError::Invalid { .. })
        ));

        let mut value = snapshot_json(json!(0.5));
        value["data"]["regions"]["core-logic"]["coverage"] = json!(100.5);
        assert!(decode_message(&value.to_string()).is_err());

        let mut value = snapshot_json(json!(0.5));
        value["data"]["regions"]["core-logic"]["testCount"] = json!(-1);
        assert!(matches!(
            decode_message(&value.to_string()),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn rejects_check_result_with_negative_duration() {
        let raw = json!({
            "type": "check_result",
            "timestamp": "2026-02-07T21:00:00Z",
            "data": {
                "totalTests": 2,
                "passed": 2,
                "failed": 0,
                "skipped": 0,
                "errors": 0,
                "coveragePercentage": 50.0,
                "duration": -1.0,
                "timestamp": "2026-02-07T21:00:00Z",
                "failedTests": []
            }
        })
        .to_string();
        assert!(decode_message(&raw).is_err());
    }

    #[test]
    fn encode_refuses_invalid_snapshot() {
        let mut snapshot = HealthSnapshot::empty("demo", Utc::now());
        snapshot.illumination = 2.0;
        assert!(encode_message(&WireMessage::snapshot(snapshot)).is_err());
    }

    #[test]
    fn encoded_file_change_uses_type_and_data_keys() {
        let message = WireMessage::new(WireMsg::FileChange(FileChangeEvent {
            event_type: FileEventKind::Deleted,
            file_path: "tests/test_api.py".to_string(),
            is_test_file: true,
            timestamp: Utc::now(),
        }));
        let raw = encode_message(&message).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["type"], "file_change");
        assert_eq!(value["data"]["eventType"], "deleted");
        assert_eq!(value["data"]["isTestFile"], true);
        assert_eq!(decode_message(&raw).expect("decode"), message);
    }

    #[test]
    fn command_frames_parse_known_and_unknown_commands() {
        let request = decode_command(r#"{"command":"request_check"}"#).expect("parse");
        assert_eq!(request.kind(), Ok(CommandKind::RequestCheck));

        let unknown = decode_command(r#"{"command":"self_destruct"}"#).expect("parse");
        assert!(unknown.kind().is_err());

        assert!(decode_command(r#"{"command":""}"#).is_err());
        assert!(decode_command("not json").is_err());

        let raw = encode_command(&ClientCommand::new(CommandKind::Refresh)).expect("encode");
        assert_eq!(raw, r#"{"command":"refresh"}"#);
    }

    fn large_suite(n: usize, outcome: TestOutcome) -> CheckResult {
        let mut result = CheckResult::empty(Utc::now());
        result.total_tests = n as u32;
        result.tests = (0..n)
            .map(|i| TestCase {
                name: format!("tests/test_suite_{}.py::test_case_number_{i}", i / 50),
                file_path: Some(format!("tests/test_suite_{}.py", i / 50)),
                outcome,
            })
            .collect();
        if outcome.is_failing() {
            result.failed = n as u32;
            result.failed_tests = result
                .tests
                .iter()
                .map(|case| FailedTest {
                    test_name: Some(case.name.clone()),
                    file_path: case.file_path.clone(),
                    error_message: Some("x".repeat(200)),
                })
                .collect();
        } else {
            result.passed = n as u32;
        }
        result
    }

    #[test]
    fn large_suite_result_fits_in_one_frame() {
        for outcome in [TestOutcome::Passed, TestOutcome::Failed] {
            let result = large_suite(3000, outcome);
            let message = WireMessage::new(WireMsg::CheckResult(result.for_broadcast()));
            let raw = encode_message(&message).expect("encodes under the limit");
            let decoded = decode_message(&raw).expect("client accepts hub output");
            let WireMsg::CheckResult(decoded) = decoded.msg else {
                panic!("expected check_result");
            };
            assert_eq!(decoded.total_tests, 3000);
            assert!(decoded.tests.is_empty());
        }
    }

    #[test]
    fn encode_refuses_oversized_messages() {
        let mut result = large_suite(3000, TestOutcome::Failed);
        result.tests.clear();
        let raw = encode_message(&WireMessage::new(WireMsg::CheckResult(result)));
        assert!(matches!(raw, Err(ProtocolError::Oversized { .. })));
    }
}
