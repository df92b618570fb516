//! Compositor error taxonomy
//!
//! Whole-pipeline failures (extensions, overlay, GPU, dead server) are fatal and
//! only the session loop decides to terminate on them. Per-window failures
//! never leave the registry.

use thiserror::Error;
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};

#[derive(Debug, Error)]
pub enum CompositorError {
    /// A required server extension is missing or refused the version handshake
    #[error("X11 extension {name} unavailable: {reason}")]
    ExtensionUnavailable { name: &'static str, reason: String },

    /// The server did not grant a composite overlay window
    #[error("failed to create overlay window: {0}")]
    OverlayCreationFailed(String),

    /// GL context, framebuffer or shader setup failed
    #[error("GPU initialization failed: {0}")]
    GpuInit(String),

    /// Redirecting a single window into an off-screen buffer failed
    #[error("redirection failed for window 0x{window:x}: {reason}")]
    RedirectionFailed { window: u32, reason: String },

    /// A request referenced a window the server already destroyed
    #[error("window 0x{0:x} no longer exists")]
    StaleHandle(u32),

    /// The connection to the X server broke or stopped answering
    #[error("X server unresponsive: {0}")]
    ServerUnresponsive(String),

    /// A request that should never fail was rejected by the server
    #[error("unexpected X11 error: {0}")]
    Protocol(String),

    /// Another compositing manager owns the _NET_WM_CM selection
    #[error("another compositing manager is already running on screen {screen}")]
    CompositorAlreadyRunning { screen: usize },
}

impl CompositorError {
    /// Whether the error ends the session
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CompositorError::RedirectionFailed { .. } | CompositorError::StaleHandle(_)
        )
    }

    /// Classify a reply error for a request about `window`
    ///
    /// Protocol errors mean the window vanished underneath us; anything on the
    /// connection itself is fatal.
    pub fn for_window(window: u32, err: ReplyError) -> Self {
        match err {
            ReplyError::X11Error(_) => CompositorError::StaleHandle(window),
            ReplyError::ConnectionError(e) => e.into(),
        }
    }
}

impl From<ConnectionError> for CompositorError {
    fn from(err: ConnectionError) -> Self {
        CompositorError::ServerUnresponsive(err.to_string())
    }
}

impl From<ReplyError> for CompositorError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => CompositorError::Protocol(format!("{:?}", e.error_kind)),
        }
    }
}

impl From<ReplyOrIdError> for CompositorError {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::ConnectionError(e) => e.into(),
            other => CompositorError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_window_errors_are_not_fatal() {
        assert!(!CompositorError::StaleHandle(7).is_fatal());
        assert!(
            !CompositorError::RedirectionFailed {
                window: 7,
                reason: "BadMatch".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_pipeline_errors_are_fatal() {
        assert!(CompositorError::GpuInit("no context".into()).is_fatal());
        assert!(CompositorError::OverlayCreationFailed("denied".into()).is_fatal());
        assert!(
            CompositorError::ExtensionUnavailable {
                name: "Composite",
                reason: "missing".into()
            }
            .is_fatal()
        );
        assert!(CompositorError::from(ConnectionError::UnknownError).is_fatal());
    }

    #[test]
    fn test_connection_reply_error_is_unresponsive() {
        let err = CompositorError::for_window(3, ReplyError::ConnectionError(ConnectionError::UnknownError));
        assert!(matches!(err, CompositorError::ServerUnresponsive(_)));
    }
}
