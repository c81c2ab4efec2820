//! CPAL device discovery.
//!
//! ```no_run
//! use tapegraph::output::CpalDevice;
//!
//! for (i, device) in CpalDevice::list_outputs().iter().enumerate() {
//!     println!("[{}] {}", i, device);
//! }
//! let device = CpalDevice::find("USB").or_else(CpalDevice::default_output);
//! ```

use std::fmt;

#[cfg(feature = "cpal_sink")]
use cpal::traits::{DeviceTrait, HostTrait};

use crate::context::RenderContext;

/// An output device and the stream format it prefers.
///
/// Without the `cpal_sink` feature no device is ever found, so hosts can
/// call the discovery functions unconditionally.
pub struct CpalDevice {
    name: String,
    sample_rate: u32,
    channels: u16,
    #[cfg(feature = "cpal_sink")]
    handle: (cpal::Device, cpal::SupportedStreamConfig),
}

impl CpalDevice {
    /// The host's default output device.
    pub fn default_output() -> Option<Self> {
        #[cfg(feature = "cpal_sink")]
        {
            cpal::default_host()
                .default_output_device()
                .and_then(Self::probe)
        }
        #[cfg(not(feature = "cpal_sink"))]
        {
            None
        }
    }

    /// Every output device that reports a usable default format.
    pub fn list_outputs() -> Vec<Self> {
        #[cfg(feature = "cpal_sink")]
        {
            match cpal::default_host().output_devices() {
                Ok(devices) => devices.filter_map(Self::probe).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to enumerate output devices");
                    Vec::new()
                }
            }
        }
        #[cfg(not(feature = "cpal_sink"))]
        {
            Vec::new()
        }
    }

    /// First output device whose name contains `pattern`, ignoring case.
    pub fn find(pattern: &str) -> Option<Self> {
        let pattern = pattern.to_lowercase();
        Self::list_outputs()
            .into_iter()
            .find(|d| d.name.to_lowercase().contains(&pattern))
    }

    #[cfg(feature = "cpal_sink")]
    fn probe(device: cpal::Device) -> Option<Self> {
        let config = match device.default_output_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(error = %e, "skipping output device without default config");
                return None;
            }
        };
        Some(Self {
            name: device.name().unwrap_or_else(|_| String::from("<unnamed>")),
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            handle: (device, config),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// A render context running at the device's rate and channel count.
    pub fn render_context(&self, frames_per_block: usize) -> RenderContext {
        RenderContext::new(self.sample_rate, frames_per_block).with_channels(self.channels as usize)
    }

    /// Open the device for blocks carrying `source_channels` channels.
    #[cfg(feature = "cpal_sink")]
    pub fn create_output(&self, source_channels: usize) -> Result<super::CpalOutput, super::OutputError> {
        let (device, config) = &self.handle;
        super::CpalOutput::new(device, config, source_channels)
    }
}

impl fmt::Display for CpalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} Hz, {} ch)", self.name, self.sample_rate, self.channels)
    }
}
