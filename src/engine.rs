/*!
 # Animation engine

 Runs one animation at a time against the LED strip. Every entry point
 first acquires the [`RunStateGuard`]; the permit travels into
 [`AnimationEngine::run`] and is released on every exit path.

 Cancellation is cooperative. Routines only look at their token at poll
 points (before each scan pixel, between diagnostic steps and between
 the short sleeps every hold is split into), so the worst-case latency
 of a cancel is one poll interval.
*/

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::color::{self, Color, BLACK, RED, WHITE};
use crate::config::EngineConfig;
use crate::device::{DeviceError, LedStrip};
use crate::guard::{Acquire, RunKind, RunPermit, RunStateGuard};
use crate::schedule::AlarmControl;
use crate::weather::{self, RainSource};
use crate::Result;

/// Base color of the sunrise; the rain overlay is painted over it
const SUNRISE_COLOR: Color = WHITE;

/// An animation the engine can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnimationRequest {
    /// Fill the strip with one color and hold it
    ColorFill(Color),
    /// Light each pixel in turn
    PixelScan(Color),
    /// Step through brightness levels on a white strip
    BrightnessRamp(Vec<u8>),
    /// The wake-up sequence
    SunriseAlarm,
    /// Turn every pixel off
    Clear,
    /// Red fill, red scan, clear
    DiagnosticSuite,
}

impl AnimationRequest {
    /// How this request is tracked by the guard
    pub fn kind(&self) -> RunKind {
        match self {
            AnimationRequest::SunriseAlarm => RunKind::Alarm,
            _ => RunKind::Pattern,
        }
    }
}

impl fmt::Display for AnimationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnimationRequest::ColorFill(c) => write!(f, "color fill {}", c),
            AnimationRequest::PixelScan(c) => write!(f, "pixel scan {}", c),
            AnimationRequest::BrightnessRamp(levels) => write!(f, "brightness ramp {:?}", levels),
            AnimationRequest::SunriseAlarm => write!(f, "sunrise alarm"),
            AnimationRequest::Clear => write!(f, "clear"),
            AnimationRequest::DiagnosticSuite => write!(f, "diagnostic suite"),
        }
    }
}

/// Why an animation stopped early
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnimationError {
    /// Writing to or rendering the strip failed
    #[error("LED device failure: {0}")]
    DeviceFailure(#[from] DeviceError),
}

/// How an animation that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ran to the end
    Completed,
    /// Stopped at a poll point after a cancel request
    Cancelled,
}

/// Result of the animation task behind an accepted trigger
pub type RunResult = std::result::Result<RunOutcome, AnimationError>;

/// Answer to a trigger request
#[derive(Debug)]
pub enum Trigger {
    /// The animation was started on its own task
    Accepted(JoinHandle<RunResult>),
    /// Another animation holds the strip
    Busy,
}

impl Trigger {
    /// Whether the request was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Trigger::Accepted(_))
    }

    /// The running task, if accepted
    pub fn into_handle(self) -> Option<JoinHandle<RunResult>> {
        match self {
            Trigger::Accepted(handle) => Some(handle),
            Trigger::Busy => None,
        }
    }
}

/// Owns the strip and runs animations on it, one at a time
#[derive(Clone)]
pub struct AnimationEngine {
    strip: Arc<Mutex<Box<dyn LedStrip>>>,
    guard: RunStateGuard,
    weather: Arc<dyn RainSource>,
    config: Arc<EngineConfig>,
}

impl AnimationEngine {
    /// Creates an engine over an opened strip
    pub fn new(
        strip: Box<dyn LedStrip>,
        config: EngineConfig,
        guard: RunStateGuard,
        weather: Arc<dyn RainSource>,
    ) -> Result<Self> {
        config.validate()?;
        if strip.len() != config.device.led_count {
            warn!(
                "Strip has {} LEDs but {} are configured",
                strip.len(),
                config.device.led_count
            );
        }
        Ok(Self {
            strip: Arc::new(Mutex::new(strip)),
            guard,
            weather,
            config: Arc::new(config),
        })
    }

    /// The guard shared with every trigger source
    pub fn guard(&self) -> &RunStateGuard {
        &self.guard
    }

    /// The engine's configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether an animation is running
    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Asks the running animation to stop; no-op when idle
    pub fn cancel_running(&self) -> bool {
        let cancelled = self.guard.request_cancel();
        if cancelled {
            info!("Cancel requested for running animation");
        }
        cancelled
    }

    /// Runs `request` to completion on the caller's task
    ///
    /// The permit is consumed and released however the routine ends.
    #[instrument(skip(self, permit), fields(run = permit.id()))]
    pub async fn run(&self, permit: RunPermit, request: AnimationRequest) -> RunResult {
        let mut strip = self.strip.lock().await;
        let started = Instant::now();
        info!("Starting {}", request);

        let result = {
            let mut animator = Animator {
                strip: &mut **strip,
                token: permit.token().clone(),
                config: &self.config,
                overlay: None,
            };
            animator.run(request.clone(), &self.weather).await
        };

        match &result {
            Ok(RunOutcome::Completed) => info!("Finished {} in {:?}", request, started.elapsed()),
            Ok(RunOutcome::Cancelled) => info!("Cancelled {} after {:?}", request, started.elapsed()),
            Err(e) => error!("{} failed: {}", request, e),
        }

        drop(strip);
        permit.release();
        result
    }

    /// Starts `request` on a new task if the strip is free
    pub fn trigger(&self, request: AnimationRequest) -> Trigger {
        match self.guard.try_acquire(request.kind()) {
            Acquire::Granted(permit) => {
                let engine = self.clone();
                Trigger::Accepted(tokio::spawn(async move { engine.run(permit, request).await }))
            }
            Acquire::Busy => {
                info!("Rejected {}: another animation is running", request);
                Trigger::Busy
            }
        }
    }

    /// Starts the hardware diagnostic suite
    pub fn trigger_test(&self) -> Trigger {
        self.trigger(AnimationRequest::DiagnosticSuite)
    }

    /// Starts the sunrise alarm
    pub fn trigger_alarm(&self) -> Trigger {
        self.trigger(AnimationRequest::SunriseAlarm)
    }

    /// Cancels whatever runs, waits for it to let go, and releases the strip
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.guard.request_cancel();
        let mut strip = self.strip.lock().await;
        strip.shutdown();
        info!("LED strip shut down");
    }
}

impl fmt::Debug for AnimationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationEngine")
            .field("guard", &self.guard)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AlarmControl for AnimationEngine {
    fn start_alarm_if_needed(&self) -> bool {
        if self.guard.running_kind() == Some(RunKind::Alarm) {
            debug!("Sunrise alarm already running");
            return true;
        }
        self.trigger_alarm().is_accepted()
    }

    fn stop_alarm_if_active(&self) -> bool {
        let stopped = self.guard.request_cancel_kind(RunKind::Alarm);
        if stopped {
            info!("Stopping sunrise alarm");
        }
        stopped
    }
}

/// Borrowed view of the strip for the duration of one run
struct Animator<'a> {
    strip: &'a mut dyn LedStrip,
    token: CancellationToken,
    config: &'a EngineConfig,
    /// Pending rain query, applied at the next poll point after it finishes
    overlay: Option<JoinHandle<u8>>,
}

impl Animator<'_> {
    async fn run(&mut self, request: AnimationRequest, weather: &Arc<dyn RainSource>) -> RunResult {
        // A finished sunrise leaves the strip at 0; patterns start from the baseline
        if !matches!(request, AnimationRequest::SunriseAlarm) {
            let (channel, baseline) = (self.channel(), self.config.device.brightness);
            self.strip.set_brightness(channel, baseline);
        }

        match request {
            AnimationRequest::ColorFill(color) => self.color_fill(color).await,
            AnimationRequest::PixelScan(color) => self.pixel_scan(color).await,
            AnimationRequest::BrightnessRamp(levels) => self.brightness_ramp(&levels).await,
            AnimationRequest::SunriseAlarm => self.sunrise(weather.clone()).await,
            AnimationRequest::Clear => self.clear(),
            AnimationRequest::DiagnosticSuite => self.diagnostic_suite().await,
        }
    }

    fn channel(&self) -> u8 {
        self.config.device.channel
    }

    /// Sleeps for `duration` in slices no longer than the poll interval
    async fn hold(&mut self, duration: Duration) -> RunResult {
        let deadline = Instant::now() + duration;
        loop {
            self.poll_overlay()?;
            if self.token.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(RunOutcome::Completed);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Paints the rain overlay once the weather query has answered
    fn poll_overlay(&mut self) -> std::result::Result<(), AnimationError> {
        let handle = match self.overlay.take() {
            Some(handle) if handle.is_finished() => handle,
            pending => {
                self.overlay = pending;
                return Ok(());
            }
        };

        let probability = match handle.now_or_never() {
            Some(Ok(probability)) => probability,
            Some(Err(e)) => {
                warn!("Weather task failed: {}", e);
                0
            }
            None => 0,
        };

        if self.token.is_cancelled() {
            debug!("Discarding rain overlay for a cancelled run");
            return Ok(());
        }
        if probability == 0 {
            debug!("No rain forecast, keeping base color");
            return Ok(());
        }

        let len = self.strip.len();
        info!(
            "Rain forecast at {}%, marking pixels {:?}",
            probability,
            weather::overlay_range(len, self.config.rain_pixels)
        );
        let overlay =
            weather::rain_overlay(SUNRISE_COLOR, len, self.config.rain_pixels, probability);
        for (index, color) in overlay.into_iter().enumerate() {
            if color != SUNRISE_COLOR {
                color::set_pixel(self.strip, index, color)?;
            }
        }
        self.strip.render()?;
        Ok(())
    }

    async fn color_fill(&mut self, color: Color) -> RunResult {
        debug!("Color fill: {}", color);
        color::fill(self.strip, color)?;
        self.strip.render()?;
        self.hold(self.config.fill_delay).await
    }

    async fn pixel_scan(&mut self, color: Color) -> RunResult {
        debug!("Pixel scan: {}", color);
        for index in 0..self.strip.len() {
            if self.token.is_cancelled() {
                debug!("Pixel scan cancelled at index {}", index);
                return Ok(RunOutcome::Cancelled);
            }
            color::set_pixel(self.strip, index, color)?;
            self.strip.render()?;
            if self.hold(self.config.scan_delay).await? == RunOutcome::Cancelled {
                debug!("Pixel scan cancelled at index {}", index);
                return Ok(RunOutcome::Cancelled);
            }
            color::set_pixel(self.strip, index, BLACK)?;
            self.strip.render()?;
        }
        Ok(RunOutcome::Completed)
    }

    async fn brightness_ramp(&mut self, levels: &[u8]) -> RunResult {
        let result = self.ramp_through(levels).await;
        // Baseline comes back however the loop ended
        let (channel, baseline) = (self.channel(), self.config.device.brightness);
        self.strip.set_brightness(channel, baseline);
        result
    }

    async fn ramp_through(&mut self, levels: &[u8]) -> RunResult {
        for &level in levels {
            debug!("Brightness ramp: {}", level);
            self.strip.set_brightness(self.channel(), level);
            color::fill(self.strip, WHITE)?;
            self.strip.render()?;
            if self.hold(self.config.fill_delay).await? == RunOutcome::Cancelled {
                return Ok(RunOutcome::Cancelled);
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn clear(&mut self) -> RunResult {
        debug!("Turning LEDs off");
        color::fill(self.strip, BLACK)?;
        self.strip.render()?;
        Ok(RunOutcome::Completed)
    }

    async fn diagnostic_suite(&mut self) -> RunResult {
        info!("Starting diagnostic suite");
        if self.color_fill(RED).await? == RunOutcome::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }
        if self.token.is_cancelled() || self.pixel_scan(RED).await? == RunOutcome::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }
        if self.token.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        self.clear()
    }

    async fn sunrise(&mut self, weather: Arc<dyn RainSource>) -> RunResult {
        let result = self.sunrise_sequence(weather).await;

        if let Some(handle) = self.overlay.take() {
            trace!("Abandoning unfinished weather query");
            handle.abort();
        }

        // Off on every exit, including device failures
        let channel = self.channel();
        self.strip.set_brightness(channel, 0);
        match (self.strip.render(), result) {
            (Ok(()), result) => result,
            (Err(e), Ok(_)) => Err(e.into()),
            (Err(e), Err(first)) => {
                warn!("Could not turn strip off after failure: {}", e);
                Err(first)
            }
        }
    }

    async fn sunrise_sequence(&mut self, weather: Arc<dyn RainSource>) -> RunResult {
        let channel = self.channel();
        color::fill(self.strip, SUNRISE_COLOR)?;
        self.strip.set_brightness(channel, 0);
        self.strip.render()?;

        // The base fill is already out; rain only refines it later
        self.overlay = Some(tokio::spawn(weather::query_rain(
            weather,
            self.config.weather_timeout,
        )));

        for level in self.config.sunrise_levels() {
            if self.token.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            info!("Sunrise brightness {}", level);
            self.strip.set_brightness(channel, level);
            self.strip.render()?;
            if self.hold(self.config.sunrise_step_hold).await? == RunOutcome::Cancelled {
                return Ok(RunOutcome::Cancelled);
            }
        }

        info!("Sunrise complete, holding for {:?}", self.config.sunrise_full_hold);
        self.hold(self.config.sunrise_full_hold).await
    }
}
