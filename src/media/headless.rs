use super::{CaptureStream, MediaBackend, MediaConstraints, PlaybackState};
use crate::error::{PhoneError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Media backend without audio hardware. Capture is a virtual device and the
/// playback context starts suspended, like a freshly loaded page.
pub struct HeadlessMedia {
    deny_capture: bool,
    running: AtomicBool,
    capture_requests: AtomicUsize,
}

impl HeadlessMedia {
    pub fn new() -> Self {
        Self {
            deny_capture: false,
            running: AtomicBool::new(false),
            capture_requests: AtomicUsize::new(0),
        }
    }

    /// Behaves like a user who refused microphone access.
    pub fn denied() -> Self {
        Self {
            deny_capture: true,
            ..Self::new()
        }
    }

    pub fn capture_requests(&self) -> usize {
        self.capture_requests.load(Ordering::Relaxed)
    }
}

impl Default for HeadlessMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for HeadlessMedia {
    async fn acquire_capture(&self, constraints: &MediaConstraints) -> Result<CaptureStream> {
        self.capture_requests.fetch_add(1, Ordering::Relaxed);
        if self.deny_capture {
            return Err(PhoneError::Media("permission denied".to_string()));
        }
        Ok(CaptureStream {
            device: "virtual".to_string(),
            sample_rate: constraints.sample_rate,
            channels: 1,
        })
    }

    fn playback_state(&self) -> PlaybackState {
        if self.running.load(Ordering::Relaxed) {
            PlaybackState::Running
        } else {
            PlaybackState::Suspended
        }
    }

    async fn resume_playback(&self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn input_devices(&self) -> Vec<String> {
        vec!["virtual".to_string()]
    }
}
