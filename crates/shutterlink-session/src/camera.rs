//! Capture-hardware boundary.
//!
//! The camera is exclusively owned by at most one of {the media session, a
//! local hardware-capture path} at any time. The manager sequences the
//! hand-off; the actual hardware access lives behind this trait in the host
//! app.

use async_trait::async_trait;

use shutterlink_core::NegotiationError;

/// Idempotent acquire/release of the local camera for hardware capture.
#[async_trait]
pub trait CameraControl: Send + Sync {
    /// Claim the camera for local preview/capture. Fails with
    /// `NotReadable` when the hardware is still held elsewhere, or
    /// `PermissionDenied` when the user never authorised it.
    async fn acquire(&self) -> Result<(), NegotiationError>;

    /// Return the camera. Safe to call when not held.
    async fn release(&self) -> Result<(), NegotiationError>;
}

/// No-op camera for consuming roles, tests, and the demo app.
#[derive(Debug, Default)]
pub struct NullCamera;

#[async_trait]
impl CameraControl for NullCamera {
    async fn acquire(&self) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn release(&self) -> Result<(), NegotiationError> {
        Ok(())
    }
}
