/*!
 # LED device abstraction

 The engine never speaks a wire protocol directly. It writes packed
 colors into a pixel buffer, sets a device-wide brightness and asks the
 device to render. [`LedStrip`] is that seam; [`MemoryStrip`] is an
 in-process implementation used for dry runs and tests, and `SpiStrip`
 (behind the `pi` feature) pushes WS2812 frames out of the Raspberry Pi
 SPI bus.
*/

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::color::{Color, BLACK};

/// Errors raised by an LED device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not be opened or configured
    #[error("Failed to initialize LED device: {0}")]
    Init(String),

    /// Pushing the buffer to the hardware failed
    #[error("Failed to write to LED device: {0}")]
    Write(String),

    /// A pixel index past the end of the strip was addressed
    #[error("Pixel index {index} out of range for a strip of {len} LEDs")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A fixed-size addressable strip of RGB pixels
///
/// Implementations are not expected to tolerate concurrent writers; the
/// engine serializes all access through its run-state guard.
pub trait LedStrip: Send {
    /// Number of pixels on the strip
    fn len(&self) -> usize;

    /// Whether the strip has no pixels at all
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores a packed `0x00RRGGBB` value in the pixel buffer
    fn set_pixel(&mut self, index: usize, packed: u32) -> Result<(), DeviceError>;

    /// Sets the device-wide brightness of a channel, applied on the next render
    fn set_brightness(&mut self, channel: u8, level: u8);

    /// Current brightness of a channel
    fn brightness(&self, channel: u8) -> u8;

    /// Flushes the pixel buffer and brightness to the physical output
    fn render(&mut self) -> Result<(), DeviceError>;

    /// Releases the hardware; the strip must not be used afterwards
    fn shutdown(&mut self) {}
}

/// Static configuration of the attached strip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// GPIO pin the strip's data line is wired to
    pub gpio_pin: u8,
    /// Output channel the brightness applies to
    pub channel: u8,
    /// Number of LEDs on the strip
    pub led_count: usize,
    /// Brightness applied at initialization
    pub brightness: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 18,
            channel: 0,
            led_count: 380,
            brightness: 255,
        }
    }
}

/// Which driver backs the strip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// In-process buffer, nothing leaves the machine
    Memory,
    /// WS2812 over the Raspberry Pi SPI bus
    Spi,
}

/// Opens the configured device
///
/// Failure here is fatal for the daemon: it cannot do anything useful
/// without a working strip.
#[instrument]
pub fn open(kind: DeviceKind, config: &DeviceConfig) -> Result<Box<dyn LedStrip>, DeviceError> {
    if config.led_count == 0 {
        return Err(DeviceError::Init("LED count must be at least 1".into()));
    }

    let mut strip: Box<dyn LedStrip> = match kind {
        DeviceKind::Memory => Box::new(MemoryStrip::with_channel(config.led_count, config.channel)),
        #[cfg(feature = "pi")]
        DeviceKind::Spi => Box::new(spi::SpiStrip::init(config)?),
        #[cfg(not(feature = "pi"))]
        DeviceKind::Spi => {
            return Err(DeviceError::Init(
                "SPI output requires building with the `pi` feature".into(),
            ))
        }
    };

    strip.set_brightness(config.channel, config.brightness);
    info!(
        "Opened {:?} strip with {} LEDs on GPIO {}",
        kind, config.led_count, config.gpio_pin
    );
    Ok(strip)
}

/// A rendered frame captured by [`MemoryStrip`]
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Brightness at render time
    pub brightness: u8,
    /// Pixel colors at render time, before brightness scaling
    pub pixels: Vec<Color>,
    /// When the frame was rendered
    pub at: tokio::time::Instant,
}

#[derive(Debug)]
struct MemoryState {
    channel: u8,
    pixels: Vec<u32>,
    brightness: u8,
    writes: Vec<u32>,
    frames: VecDeque<Frame>,
    history_limit: usize,
    render_count: usize,
    renders_before_failure: Option<usize>,
    shut_down: bool,
}

/// In-memory strip whose state is shared between clones
///
/// Hand one clone to the engine and keep another to observe what was
/// rendered.
#[derive(Debug, Clone)]
pub struct MemoryStrip {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStrip {
    /// Maximum number of frames kept by default
    pub const DEFAULT_HISTORY: usize = 4096;

    /// Creates a dark strip of `len` pixels on channel 0
    pub fn new(len: usize) -> Self {
        Self::with_channel(len, 0)
    }

    /// Creates a dark strip of `len` pixels on the given channel
    pub fn with_channel(len: usize, channel: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                channel,
                pixels: vec![0; len],
                brightness: 255,
                writes: vec![0; len],
                frames: VecDeque::new(),
                history_limit: Self::DEFAULT_HISTORY,
                render_count: 0,
                renders_before_failure: None,
                shut_down: false,
            })),
        }
    }

    /// Limits how many rendered frames are remembered
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = limit;
        self
    }

    /// Makes every render after the next `n` successful ones fail
    pub fn fail_renders_after(&self, n: usize) {
        self.state.lock().renders_before_failure = Some(n);
    }

    /// Current pixel buffer
    pub fn pixels(&self) -> Vec<Color> {
        self.state
            .lock()
            .pixels
            .iter()
            .map(|p| Color::from_packed(*p))
            .collect()
    }

    /// Current brightness
    pub fn brightness_level(&self) -> u8 {
        self.state.lock().brightness
    }

    /// How many times a pixel has been written
    pub fn writes(&self, index: usize) -> u32 {
        self.state.lock().writes.get(index).copied().unwrap_or(0)
    }

    /// Number of successful renders
    pub fn render_count(&self) -> usize {
        self.state.lock().render_count
    }

    /// Remembered frames, oldest first
    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.iter().cloned().collect()
    }

    /// Most recently rendered frame
    pub fn last_frame(&self) -> Option<Frame> {
        self.state.lock().frames.back().cloned()
    }

    /// Whether [`LedStrip::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

impl LedStrip for MemoryStrip {
    fn len(&self) -> usize {
        self.state.lock().pixels.len()
    }

    fn set_pixel(&mut self, index: usize, packed: u32) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let len = state.pixels.len();
        if index >= len {
            return Err(DeviceError::IndexOutOfRange { index, len });
        }
        state.pixels[index] = packed;
        state.writes[index] += 1;
        Ok(())
    }

    fn set_brightness(&mut self, channel: u8, level: u8) {
        let mut state = self.state.lock();
        if channel != state.channel {
            warn!("Ignoring brightness for unknown channel {}", channel);
            return;
        }
        state.brightness = level;
    }

    fn brightness(&self, channel: u8) -> u8 {
        let state = self.state.lock();
        if channel == state.channel {
            state.brightness
        } else {
            0
        }
    }

    fn render(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(DeviceError::Write("strip has been shut down".into()));
        }

        match state.renders_before_failure {
            Some(0) => return Err(DeviceError::Write("injected render failure".into())),
            Some(remaining) => state.renders_before_failure = Some(remaining - 1),
            None => {}
        }

        let frame = Frame {
            brightness: state.brightness,
            pixels: state.pixels.iter().map(|p| Color::from_packed(*p)).collect(),
            at: tokio::time::Instant::now(),
        };
        if state.history_limit > 0 {
            if state.frames.len() == state.history_limit {
                state.frames.pop_front();
            }
            state.frames.push_back(frame);
        }
        state.render_count += 1;
        trace!("Rendered frame {} at brightness {}", state.render_count, state.brightness);
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.state.lock();
        let black = BLACK.packed();
        state.pixels.iter_mut().for_each(|p| *p = black);
        state.shut_down = true;
        debug!("Memory strip shut down");
    }
}

#[cfg(feature = "pi")]
mod spi {
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
    use tracing::{debug, error, info, warn};

    use super::{DeviceConfig, DeviceError, LedStrip};
    use crate::color::{Color, BLACK};

    /// 3.2 MHz gives 312.5 ns per SPI bit, four SPI bits per WS2812 bit
    const SPI_CLOCK_HZ: u32 = 3_200_000;
    /// Low time after a frame that latches the data (> 50 us)
    const LATCH_BYTES: usize = 40;
    const ZERO: u8 = 0b1000;
    const ONE: u8 = 0b1110;

    /// WS2812 strip driven from the SPI0 MOSI pin
    ///
    /// The kernel's `spidev.bufsiz` must be large enough for one frame
    /// (`12 * led_count + 40` bytes).
    pub(super) struct SpiStrip {
        spi: Spi,
        channel: u8,
        pixels: Vec<u32>,
        brightness: u8,
        buffer: Vec<u8>,
    }

    impl SpiStrip {
        pub(super) fn init(config: &DeviceConfig) -> Result<Self, DeviceError> {
            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)
                .map_err(|e| DeviceError::Init(e.to_string()))?;
            if config.gpio_pin != 10 {
                warn!(
                    "SPI output always uses GPIO 10 (MOSI), configured pin {} is ignored",
                    config.gpio_pin
                );
            }
            info!("SPI bus opened at {} Hz", SPI_CLOCK_HZ);

            Ok(Self {
                spi,
                channel: config.channel,
                pixels: vec![BLACK.packed(); config.led_count],
                brightness: config.brightness,
                buffer: Vec::with_capacity(config.led_count * 12 + LATCH_BYTES),
            })
        }

        fn encode_byte(buffer: &mut Vec<u8>, byte: u8) {
            for pair in (0..4).rev() {
                let hi = if byte & (1 << (pair * 2 + 1)) != 0 { ONE } else { ZERO };
                let lo = if byte & (1 << (pair * 2)) != 0 { ONE } else { ZERO };
                buffer.push(hi << 4 | lo);
            }
        }
    }

    impl LedStrip for SpiStrip {
        fn len(&self) -> usize {
            self.pixels.len()
        }

        fn set_pixel(&mut self, index: usize, packed: u32) -> Result<(), DeviceError> {
            let len = self.pixels.len();
            let pixel = self
                .pixels
                .get_mut(index)
                .ok_or(DeviceError::IndexOutOfRange { index, len })?;
            *pixel = packed;
            Ok(())
        }

        fn set_brightness(&mut self, channel: u8, level: u8) {
            if channel == self.channel {
                self.brightness = level;
            }
        }

        fn brightness(&self, channel: u8) -> u8 {
            if channel == self.channel {
                self.brightness
            } else {
                0
            }
        }

        fn render(&mut self) -> Result<(), DeviceError> {
            self.buffer.clear();
            for packed in &self.pixels {
                let color = Color::from_packed(*packed).scaled(self.brightness);
                // WS2812 expects green first
                Self::encode_byte(&mut self.buffer, color.g);
                Self::encode_byte(&mut self.buffer, color.r);
                Self::encode_byte(&mut self.buffer, color.b);
            }
            self.buffer.extend(std::iter::repeat(0).take(LATCH_BYTES));

            self.spi.write(&self.buffer).map_err(|e| {
                error!("SPI write failed: {}", e);
                DeviceError::Write(e.to_string())
            })?;
            Ok(())
        }

        fn shutdown(&mut self) {
            debug!("Blanking strip before releasing SPI bus");
            self.pixels.iter_mut().for_each(|p| *p = BLACK.packed());
            if let Err(e) = self.render() {
                warn!("Could not blank strip on shutdown: {}", e);
            }
        }
    }
}
