/*!
 # Sunrise alarm

 A wake-up light for addressable LED strips. The strip slowly brightens
 on a weekly timetable, can run diagnostic patterns on demand and shows
 a blue tail when rain is forecast.

 ## Features

 * Single-flight animation engine with cooperative cancellation
 * Sunrise ramp with one-second cancellation granularity
 * Color fill, pixel scan, brightness ramp and diagnostic patterns
 * Weekly schedule persisted as JSON
 * Rain overlay from the National Weather Service forecast
 * Small HTTP API for triggering and scheduling

 ## Example

 ```rust,no_run
 use std::sync::Arc;
 use sunrise_alarm::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let config = EngineConfig::default();
     let strip = device::open(DeviceKind::Memory, &config.device)?;
     let engine = AnimationEngine::new(strip, config, RunStateGuard::new(), Arc::new(NoRain))?;

     // Run the diagnostic suite and wait for it
     if let Some(handle) = engine.trigger_test().into_handle() {
         handle.await.expect("animation task panicked")?;
     }

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the sunrise alarm
#[derive(Error, Debug)]
pub enum Error {
    /// The LED device failed outside of an animation
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// An animation stopped because of a device failure
    #[error(transparent)]
    Animation(#[from] AnimationError),

    /// Another animation already holds the strip
    #[error("An animation is already running")]
    AlreadyRunning,

    /// Value out of range
    #[error("Value {0} out of range ({1}..{2})")]
    ValueOutOfRange(u32, u32, u32),

    /// Engine configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Schedule entry is unusable
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Reading or writing the schedule file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A background task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The schedule file is not valid JSON
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod color;
pub mod config;
pub mod device;
pub mod engine;
pub mod guard;
pub mod schedule;
pub mod server;
pub mod weather;

// Re-export key types
pub use color::{Color, BLACK, BLUE, GREEN, RED, WHITE};
pub use config::EngineConfig;
pub use device::{DeviceConfig, DeviceError, DeviceKind, LedStrip, MemoryStrip};
pub use engine::{AnimationEngine, AnimationError, AnimationRequest, RunOutcome, Trigger};
pub use guard::{Acquire, RunKind, RunPermit, RunStateGuard};
pub use schedule::{
    AlarmControl, DaySchedule, Decision, ScheduleEvaluator, ScheduleStore, SharedSchedule,
    WeekSchedule,
};
pub use weather::{FixedRain, NoRain, NoaaForecast, RainSource, WeatherError};
