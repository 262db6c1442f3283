//! Media gate: holds the local capture stream and the playback context.
//!
//! Audio itself is handled by the platform media stack. The gate only makes
//! sure a microphone was granted before registration and that playback is
//! running before a call needs it.
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(feature = "audio-devices")]
pub mod cpal_backend;
pub mod headless;

pub use headless::HeadlessMedia;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: 48000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStream {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Created but blocked until the user interacts with the page
    Suspended,
    Running,
    Closed,
}

/// Platform seam for audio devices.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Ask for the microphone. Fails with [`crate::error::PhoneError::Media`]
    /// when the user or platform denies it.
    async fn acquire_capture(&self, constraints: &MediaConstraints) -> Result<CaptureStream>;

    fn playback_state(&self) -> PlaybackState;

    async fn resume_playback(&self) -> Result<()>;

    fn input_devices(&self) -> Vec<String>;
}

pub struct MediaGate {
    backend: Arc<dyn MediaBackend>,
    constraints: MediaConstraints,
    capture: Option<CaptureStream>,
    resume_armed: bool,
}

impl MediaGate {
    pub fn new(backend: Arc<dyn MediaBackend>, constraints: MediaConstraints) -> Self {
        Self {
            backend,
            constraints,
            capture: None,
            resume_armed: false,
        }
    }

    /// Acquire the capture stream once; later calls return the held one.
    pub async fn acquire(&mut self) -> Result<&CaptureStream> {
        let stream = match self.capture.take() {
            Some(stream) => stream,
            None => {
                let stream = self.backend.acquire_capture(&self.constraints).await?;
                info!(
                    device = stream.device,
                    sample_rate = stream.sample_rate,
                    channels = stream.channels,
                    "media permissions granted"
                );
                stream
            }
        };
        Ok(self.capture.insert(stream))
    }

    pub fn capture(&self) -> Option<&CaptureStream> {
        self.capture.as_ref()
    }

    /// Playback must be resumed before audio of a call can be heard.
    pub fn needs_resume(&self) -> bool {
        self.backend.playback_state() == PlaybackState::Suspended
    }

    /// Resume playback if it is suspended. Returns whether a resume happened.
    pub async fn ensure_playback(&self) -> Result<bool> {
        if !self.needs_resume() {
            return Ok(false);
        }
        self.backend.resume_playback().await?;
        info!("audio context resumed");
        Ok(true)
    }

    /// From now on every user interaction resumes a suspended playback context.
    pub fn arm_resume_on_interaction(&mut self) {
        self.resume_armed = true;
    }

    pub fn resume_armed(&self) -> bool {
        self.resume_armed
    }

    pub async fn on_user_interaction(&self) -> Result<bool> {
        if !self.resume_armed {
            return Ok(false);
        }
        match self.ensure_playback().await {
            Ok(resumed) => Ok(resumed),
            Err(e) => {
                warn!("failed to resume audio context: {}", e);
                Err(e)
            }
        }
    }

    pub fn input_devices(&self) -> Vec<String> {
        self.backend.input_devices()
    }
}
