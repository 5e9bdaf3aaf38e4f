/*!
 # Engine configuration

 Timing and geometry constants for the animation engine. They are fixed
 once the engine is built; nothing mutates them at runtime.
*/

use std::time::Duration;

use crate::device::DeviceConfig;
use crate::{Error, Result};

/// Configuration for the animation engine and its strip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Strip geometry and output channel
    pub device: DeviceConfig,
    /// How long a solid fill is held
    pub fill_delay: Duration,
    /// How long each pixel stays lit during a scan
    pub scan_delay: Duration,
    /// Levels stepped through by the brightness ramp, ascending
    pub ramp_levels: Vec<u8>,
    /// Brightness increment of each sunrise step
    pub sunrise_step: u8,
    /// Highest brightness the sunrise ramp reaches
    pub sunrise_ceiling: u8,
    /// How long each sunrise step is held
    pub sunrise_step_hold: Duration,
    /// How long full brightness is held once the ramp is done
    pub sunrise_full_hold: Duration,
    /// Longest single sleep inside any hold; bounds cancellation latency
    pub poll_interval: Duration,
    /// Number of trailing pixels turned blue when rain is forecast
    pub rain_pixels: usize,
    /// How long the weather query may take before it is treated as no rain
    pub weather_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            fill_delay: Duration::from_millis(500),
            scan_delay: Duration::from_millis(20),
            ramp_levels: vec![25, 128, 255],
            sunrise_step: 25,
            sunrise_ceiling: 250,
            sunrise_step_hold: Duration::from_secs(120),
            sunrise_full_hold: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(1),
            rain_pixels: 20,
            weather_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Checks the invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.device.led_count == 0 {
            return Err(Error::InvalidConfig("LED count must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be non-zero".into()));
        }
        if self.sunrise_step == 0 {
            return Err(Error::InvalidConfig("sunrise step must be non-zero".into()));
        }
        if self.sunrise_step > self.sunrise_ceiling {
            return Err(Error::ValueOutOfRange(
                self.sunrise_step as u32,
                1,
                self.sunrise_ceiling as u32,
            ));
        }
        if self.ramp_levels.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::InvalidConfig("ramp levels must be ascending".into()));
        }
        Ok(())
    }

    /// Brightness levels the sunrise ramp walks through
    pub fn sunrise_levels(&self) -> impl Iterator<Item = u8> {
        (self.sunrise_step..=self.sunrise_ceiling).step_by(self.sunrise_step.max(1) as usize)
    }
}
