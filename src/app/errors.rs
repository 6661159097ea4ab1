// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt;

/// Error taxonomy for the whole core. Transport errors are wrapped into this
/// exactly once, at the SSH adapter boundary; everything above only annotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Invalid state transition or a path that fails sanitization/containment.
    /// Never retried.
    Validation,
    /// Unreachable host, timeout, dropped connection. Retryable.
    Network,
    /// Bad credentials or rejected auth. Never retried; the caller must
    /// supply new credentials.
    Authentication,
    /// Remote filesystem failure (not found, permission denied). Fatal unless
    /// explicitly constructed as transient I/O.
    FileOperation,
    /// Scheduler rejected the request or produced unparsable output. Fatal;
    /// carries raw stderr for diagnostics.
    Scheduler,
    /// Operation stopped by a cancellation signal between attempts/stages.
    Cancelled,
    Internal,
}

impl AppErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppErrorKind::Validation => "validation",
            AppErrorKind::Network => "network",
            AppErrorKind::Authentication => "authentication",
            AppErrorKind::FileOperation => "file_operation",
            AppErrorKind::Scheduler => "scheduler",
            AppErrorKind::Cancelled => "cancelled",
            AppErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    message: String,
    retryable: bool,
    suggestion: Option<String>,
    stage: Option<String>,
    retries_exhausted: bool,
}

impl AppError {
    fn build(kind: AppErrorKind, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            suggestion: None,
            stage: None,
            retries_exhausted: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::Validation, false, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::Network, true, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::Authentication, false, message)
    }

    pub fn file_operation(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::FileOperation, false, message)
    }

    /// Narrow whitelist escape hatch: a file operation that failed with a
    /// transient I/O condition and may be retried.
    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::FileOperation, true, message)
    }

    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::Scheduler, false, message)
    }

    pub fn cancelled() -> Self {
        Self::build(AppErrorKind::Cancelled, false, "operation cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::build(AppErrorKind::Internal, false, message)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Annotate with the lifecycle stage that was running when the error
    /// surfaced. First annotation wins; the orchestrator never re-wraps.
    pub fn at_stage(mut self, stage: &str) -> Self {
        if self.stage.is_none() {
            self.stage = Some(stage.to_string());
        }
        self
    }

    pub fn exhausted_after(mut self, attempts: u32) -> Self {
        self.retries_exhausted = true;
        self.message = format!("{} (retries exhausted after {attempts} attempts)", self.message);
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries_exhausted
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if let Some(stage) = &self.stage {
            write!(f, " (stage: {stage})")?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "; {suggestion}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;
