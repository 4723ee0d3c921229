use std::fmt;
use thiserror::Error;

/// 使用者函式回傳的錯誤型別
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Transform / flush 函式的回傳結果
pub type TransformResult<T> = std::result::Result<T, BoxError>;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Construction error in stage '{stage}': {message}")]
    ConstructionError { stage: String, message: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error in {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Stage task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl StageError {
    pub fn construction(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConstructionError {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StageError::Plugin(_) => ErrorSeverity::Medium,
            StageError::IoError(_) | StageError::SerializationError(_) => ErrorSeverity::High,
            StageError::TaskError(_) => ErrorSeverity::Critical,
            StageError::ConstructionError { .. }
            | StageError::TomlError(_)
            | StageError::ConfigValidationError { .. }
            | StageError::InvalidConfigValueError { .. }
            | StageError::MissingConfigError { .. } => ErrorSeverity::Critical,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            StageError::ConstructionError { stage, message } => {
                format!("無法建立 stage '{}': {}", stage, message)
            }
            StageError::Plugin(err) => {
                format!("Stage '{}' 處理失敗: {}", err.plugin(), err.message())
            }
            StageError::IoError(e) => format!("讀寫失敗: {}", e),
            StageError::TaskError(e) => format!("Stage 任務異常終止: {}", e),
            other => format!("配置錯誤: {}", other),
        }
    }
}

/// 錯誤發生的階段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Transform,
    Flush,
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Transform => write!(f, "transform"),
            Phase::Flush => write!(f, "flush"),
            Phase::Validation => write!(f, "validation"),
        }
    }
}

/// 跨越 stage 邊界的統一錯誤外殼: stage 名稱 + 原始錯誤
#[derive(Error, Debug)]
#[error("[{plugin}] {phase} failed: {cause}")]
pub struct PluginError {
    plugin: String,
    phase: Phase,
    #[source]
    cause: BoxError,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, phase: Phase, cause: impl Into<BoxError>) -> Self {
        Self {
            plugin: plugin.into(),
            phase,
            cause: cause.into(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// 原始錯誤訊息，不含 stage 前綴
    pub fn message(&self) -> String {
        self.cause.to_string()
    }

    pub fn into_cause(self) -> BoxError {
        self.cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_keeps_cause_message() {
        let err = PluginError::new("my-stage", Phase::Transform, "uh-oh!");
        assert_eq!(err.plugin(), "my-stage");
        assert_eq!(err.phase(), Phase::Transform);
        assert_eq!(err.message(), "uh-oh!");
        assert_eq!(err.to_string(), "[my-stage] transform failed: uh-oh!");
    }

    #[test]
    fn test_plugin_error_exposes_source() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = PluginError::new("io-stage", Phase::Flush, io);
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "disk gone");
    }

    #[test]
    fn test_severity_mapping() {
        let plugin: StageError = PluginError::new("s", Phase::Flush, "boom").into();
        assert_eq!(plugin.severity(), ErrorSeverity::Medium);
        assert_eq!(
            StageError::construction("s", "bad").severity(),
            ErrorSeverity::Critical
        );
        assert!(plugin.user_friendly_message().contains("boom"));
    }
}
