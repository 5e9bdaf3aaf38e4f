//! Shared helpers for the engine integration tests

#![allow(dead_code)] // Each test file uses a different subset

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sunrise_alarm::{
    AnimationEngine, EngineConfig, MemoryStrip, RainSource, RunStateGuard, WeatherError,
};

/// Short sunrise timings so complete runs stay readable in assertions
pub fn fast_config(leds: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.device.led_count = leds;
    config.sunrise_step_hold = Duration::from_secs(10);
    config.sunrise_full_hold = Duration::from_secs(60);
    config.weather_timeout = Duration::from_secs(5);
    config
}

/// Engine over a memory strip, plus a handle to observe the strip
pub fn engine_with(
    config: EngineConfig,
    weather: Arc<dyn RainSource>,
) -> (AnimationEngine, MemoryStrip) {
    let strip = MemoryStrip::new(config.device.led_count);
    let engine = AnimationEngine::new(
        Box::new(strip.clone()),
        config,
        RunStateGuard::new(),
        weather,
    )
    .expect("valid test config");
    (engine, strip)
}

/// Rain source that answers after a delay
pub struct DelayedRain {
    pub delay: Duration,
    pub probability: u8,
}

impl RainSource for DelayedRain {
    fn rain_probability(&self) -> BoxFuture<'_, Result<u8, WeatherError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(self.probability)
        })
    }
}

/// Waits (on virtual time) until the engine is idle
pub async fn wait_idle(engine: &AnimationEngine) {
    tokio::time::timeout(Duration::from_secs(3600), async {
        while engine.is_running() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("engine never went idle");
}
