//! Controller error taxonomy.
//!
//! Every failure the controller can report falls into one of three classes:
//! - user errors (bad key, conflicting run, invalid setting), reported as-is
//! - collaborator failures (external program or runtime misbehaved), never fatal
//! - infrastructure faults (cannot spawn, cannot write), logged and surfaced
//!   separately from a normal demo failure

use crate::model::DemoKey;
use serde::Serialize;

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    User,
    Collaborator,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("unknown demo key: {0}")]
    UnknownDemo(String),

    #[error("unknown log source: {0}")]
    UnknownLog(String),

    /// The key (or another key writing to the same log source) is mid-run.
    #[error("demo `{key}` is already running (held by `{holder}`)")]
    AlreadyRunning { key: DemoKey, holder: DemoKey },

    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("service restart not permitted: {0}")]
    ServiceNotAllowed(String),

    #[error("{0}")]
    Collaborator(String),

    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` did not expose an output stream")]
    NoOutput { program: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration is corrupt: {0}")]
    Config(String),

    #[error("internal task failed: {0}")]
    Internal(String),
}

impl ControllerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid_setting(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownDemo(_)
            | Self::UnknownLog(_)
            | Self::AlreadyRunning { .. }
            | Self::InvalidSetting { .. }
            | Self::ServiceNotAllowed(_) => ErrorClass::User,
            Self::Collaborator(_) => ErrorClass::Collaborator,
            Self::Launch { .. }
            | Self::NoOutput { .. }
            | Self::Io { .. }
            | Self::Config(_)
            | Self::Internal(_) => ErrorClass::Infrastructure,
        }
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Collaborator(format!("model runtime request failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        let conflict = ControllerError::AlreadyRunning {
            key: DemoKey::Poisoning,
            holder: DemoKey::Poisoning,
        };
        assert_eq!(conflict.class(), ErrorClass::User);

        let launch = ControllerError::Launch {
            program: "python".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(launch.class(), ErrorClass::Infrastructure);
        assert!(launch.to_string().contains("python"));

        assert_eq!(
            ControllerError::Collaborator("pull failed".into()).class(),
            ErrorClass::Collaborator
        );
    }
}
