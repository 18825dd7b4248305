pub mod config;
pub mod replay;

use serde_json::json;

/// Why a subcommand stopped before producing its normal output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    ConfigValidation,
    FixtureRead,
    FixtureParse,
    Runtime,
    Serialization,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigValidation => "config_validation",
            Self::FixtureRead => "fixture_read",
            Self::FixtureParse => "fixture_parse",
            Self::Runtime => "runtime",
            Self::Serialization => "serialization",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::ConfigValidation => 2,
            Self::FixtureRead | Self::FixtureParse => 3,
            Self::Runtime | Self::Serialization => 1,
        }
    }
}

/// What a subcommand prints and the process exit code that goes with it.
#[derive(Debug, Clone)]
pub struct CommandReport {
    pub exit_code: u8,
    pub output: String,
}

impl CommandReport {
    pub fn printed(output: impl Into<String>, exit_code: u8) -> Self {
        Self { exit_code, output: output.into() }
    }

    pub fn failed(command: &str, kind: FailureKind, detail: impl Into<String>) -> Self {
        let body = json!({
            "command": command,
            "status": "error",
            "error_class": kind.as_str(),
            "detail": detail.into(),
        });
        Self { exit_code: kind.exit_code(), output: body.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn failed_report_carries_kind_and_exit_code() {
        let report = CommandReport::failed("replay", FailureKind::FixtureParse, "bad \"input\"");

        assert_eq!(report.exit_code, 3);
        let body: Value = serde_json::from_str(&report.output).expect("json body");
        assert_eq!(body["command"], "replay");
        assert_eq!(body["status"], "error");
        assert_eq!(body["error_class"], "fixture_parse");
        assert_eq!(body["detail"], "bad \"input\"");
    }
}
