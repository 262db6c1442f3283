use super::{CaptureStream, MediaBackend, MediaConstraints, PlaybackState};
use crate::error::{PhoneError, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

const SUSPENDED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Media backend on the system audio devices.
///
/// Streams are opened by the media stack that carries the call; this backend
/// only checks that the default devices exist and support the constraints.
pub struct CpalMedia {
    host: cpal::Host,
    playback: AtomicU8,
}

impl CpalMedia {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            playback: AtomicU8::new(SUSPENDED),
        }
    }
}

impl Default for CpalMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for CpalMedia {
    async fn acquire_capture(&self, constraints: &MediaConstraints) -> Result<CaptureStream> {
        let device = self
            .host
            .default_input_device()
            .ok_or_else(|| PhoneError::Media("no input device".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());
        let configs = device
            .supported_input_configs()
            .map_err(|e| PhoneError::Media(format!("{}: {}", name, e)))?;

        let rate = constraints.sample_rate;
        let supported = configs
            .filter(|c| c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate)
            .min_by_key(|c| c.channels())
            .ok_or_else(|| {
                PhoneError::Media(format!("{} does not support {} Hz capture", name, rate))
            })?;

        info!(device = name, rate, "input device selected");
        Ok(CaptureStream {
            device: name,
            sample_rate: rate,
            channels: supported.channels(),
        })
    }

    fn playback_state(&self) -> PlaybackState {
        match self.playback.load(Ordering::Relaxed) {
            RUNNING => PlaybackState::Running,
            CLOSED => PlaybackState::Closed,
            _ => PlaybackState::Suspended,
        }
    }

    async fn resume_playback(&self) -> Result<()> {
        match self.host.default_output_device() {
            Some(device) => {
                debug!(device = device.name().unwrap_or_default(), "output device");
                self.playback.store(RUNNING, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.playback.store(CLOSED, Ordering::Relaxed);
                Err(PhoneError::Media("no output device".to_string()))
            }
        }
    }

    fn input_devices(&self) -> Vec<String> {
        match self.host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(_) => vec![],
        }
    }
}
