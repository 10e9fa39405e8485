use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Classified error categories surfaced to the error sink.
///
/// The split between fatal, recoverable and warning drives the control
/// loop's reaction; the sink only ever sees the category plus a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCategory {
    CameraNotFound,
    CameraPermissionDenied,
    CameraDisconnected,
    PipelineBuildFailed,
    PipelineStateChangeFailed,
    NegotiationFailed,
    ElementMissing,
    ResourceExhausted,
    RecordingBufferFull,
    FrameDropDetected,
    HighMemoryUsage,
    DeadlockDetected,
    UnknownFatal,
}

impl ErrorCategory {
    /// Warnings carry no state change and never terminate the pipeline.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RecordingBufferFull
                | ErrorCategory::FrameDropDetected
                | ErrorCategory::HighMemoryUsage
        )
    }

    /// Recoverable categories get an in-place recovery attempt before
    /// anything is torn down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::CameraDisconnected
                | ErrorCategory::PipelineStateChangeFailed
                | ErrorCategory::DeadlockDetected
                | ErrorCategory::ResourceExhausted
        ) || self.is_warning()
    }

    /// Process exit code when this category terminates the core.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCategory::CameraNotFound
            | ErrorCategory::CameraPermissionDenied
            | ErrorCategory::CameraDisconnected
            | ErrorCategory::NegotiationFailed => 1,
            ErrorCategory::PipelineBuildFailed
            | ErrorCategory::PipelineStateChangeFailed
            | ErrorCategory::DeadlockDetected
            | ErrorCategory::ElementMissing => 2,
            _ => 4,
        }
    }
}

/// Typed errors produced by the pipeline stages.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("no camera device found")]
    CameraNotFound,

    #[error("camera access denied")]
    PermissionDenied,

    #[error("camera disconnected: {0}")]
    CameraDisconnected(String),

    #[error("failed to build pipeline: {0}")]
    PipelineBuildFailed(String),

    #[error("pipeline state change to {target} failed: {reason}")]
    StateChangeFailed { target: String, reason: String },

    #[error("no compatible camera format")]
    NegotiationFailed,

    #[error("pipeline element missing: {0}")]
    ElementMissing(String),

    #[error("memory budget exhausted: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: u64, available: u64 },

    #[error("pipeline deadlock: state change to {target} exceeded {timeout_ms} ms")]
    DeadlockDetected { target: String, timeout_ms: u64 },

    #[error("window surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Process exit code for a fatal error. Mostly the category mapping,
    /// except surface failures which get their own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::SurfaceUnavailable(_) => 3,
            other => other.category().exit_code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::CameraNotFound => ErrorCategory::CameraNotFound,
            EngineError::PermissionDenied => ErrorCategory::CameraPermissionDenied,
            EngineError::CameraDisconnected(_) => ErrorCategory::CameraDisconnected,
            EngineError::PipelineBuildFailed(_) => ErrorCategory::PipelineBuildFailed,
            EngineError::StateChangeFailed { .. } => ErrorCategory::PipelineStateChangeFailed,
            EngineError::NegotiationFailed => ErrorCategory::NegotiationFailed,
            EngineError::ElementMissing(_) => ErrorCategory::ElementMissing,
            EngineError::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            EngineError::DeadlockDetected { .. } => ErrorCategory::DeadlockDetected,
            EngineError::SurfaceUnavailable(_) => ErrorCategory::UnknownFatal,
            EngineError::Internal(_) => ErrorCategory::UnknownFatal,
        }
    }
}

/// One classified error event, as delivered to the error sink.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub component: String,
    pub unix_time_ns: u128,
    pub recoverable: bool,
    pub retry_count: u32,
}

impl ErrorRecord {
    pub fn new(category: ErrorCategory, component: &str, message: impl Into<String>) -> Self {
        let unix_time_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        ErrorRecord {
            category,
            message: message.into(),
            component: component.to_string(),
            unix_time_ns,
            recoverable: category.is_recoverable(),
            retry_count: 0,
        }
    }

    pub fn from_error(err: &EngineError, component: &str) -> Self {
        Self::new(err.category(), component, err.to_string())
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Receives classified error events. Out-of-core collaborator; the engine
/// only decides the category, never the presentation.
pub trait ErrorSink: Send + Sync {
    fn report(&self, record: &ErrorRecord);
}

/// Default sink: structured log lines with the serialized record attached.
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn report(&self, record: &ErrorRecord) {
        let payload = serde_json::to_string(record).unwrap_or_else(|_| record.message.clone());
        if record.category.is_warning() {
            warn!(category = ?record.category, component = %record.component, %payload, "pipeline warning");
        } else {
            error!(category = ?record.category, component = %record.component, %payload, "pipeline error");
        }
    }
}

/// Mutex-protected diagnostic cell holding the most recent error record.
#[derive(Default)]
pub struct LastError {
    slot: Mutex<Option<ErrorRecord>>,
}

impl LastError {
    pub fn set(&self, record: ErrorRecord) {
        *self.slot.lock() = Some(record);
    }

    pub fn get(&self) -> Option<ErrorRecord> {
        self.slot.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_are_recoverable_and_nonfatal() {
        for category in [
            ErrorCategory::RecordingBufferFull,
            ErrorCategory::FrameDropDetected,
            ErrorCategory::HighMemoryUsage,
        ] {
            assert!(category.is_warning());
            assert!(category.is_recoverable());
        }
    }

    #[test]
    fn camera_fatals_map_to_exit_code_1() {
        assert_eq!(ErrorCategory::CameraNotFound.exit_code(), 1);
        assert_eq!(ErrorCategory::CameraPermissionDenied.exit_code(), 1);
        assert_eq!(ErrorCategory::NegotiationFailed.exit_code(), 1);
    }

    #[test]
    fn pipeline_fatals_map_to_exit_code_2() {
        assert_eq!(ErrorCategory::PipelineBuildFailed.exit_code(), 2);
        assert_eq!(ErrorCategory::DeadlockDetected.exit_code(), 2);
    }

    #[test]
    fn record_classification_follows_category() {
        let err = EngineError::ResourceExhausted {
            requested: 100,
            available: 10,
        };
        let record = ErrorRecord::from_error(&err, "record-bin");
        assert_eq!(record.category, ErrorCategory::ResourceExhausted);
        assert!(record.recoverable);
        assert_eq!(record.component, "record-bin");
    }

    #[test]
    fn last_error_keeps_most_recent() {
        let cell = LastError::default();
        assert!(cell.get().is_none());

        cell.set(ErrorRecord::new(ErrorCategory::CameraNotFound, "camera", "a"));
        cell.set(ErrorRecord::new(ErrorCategory::DeadlockDetected, "pipeline", "b"));

        let last = cell.get().unwrap();
        assert_eq!(last.category, ErrorCategory::DeadlockDetected);
    }
}
