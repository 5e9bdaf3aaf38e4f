/*!
 # Colors and pixel buffer operations

 This module defines the RGB color value type used throughout the crate
 together with the handful of buffer operations every animation is built
 from: filling the strip, setting a single pixel and packing a color into
 the 24-bit form the device accepts.
*/

use crate::device::{DeviceError, LedStrip};

/// An RGB color with 8-bit channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

/// Pure red
pub const RED: Color = Color::new(255, 0, 0);
/// Pure green
pub const GREEN: Color = Color::new(0, 255, 0);
/// Pure blue
pub const BLUE: Color = Color::new(0, 0, 255);
/// Full white
pub const WHITE: Color = Color::new(255, 255, 255);
/// Off
pub const BLACK: Color = Color::new(0, 0, 0);

impl Color {
    /// Creates a color from its three channels
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Packs the color as `0x00RRGGBB`
    pub const fn packed(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }

    /// Unpacks a `0x00RRGGBB` value, ignoring the top byte
    pub const fn from_packed(value: u32) -> Self {
        Self {
            r: (value >> 16) as u8,
            g: (value >> 8) as u8,
            b: value as u8,
        }
    }

    /// Scales every channel by a device-wide brightness (255 = unchanged)
    pub fn scaled(self, brightness: u8) -> Self {
        let scale = |c: u8| ((c as u16 * (brightness as u16 + 1)) >> 8) as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RGB({}, {}, {})", self.r, self.g, self.b)
    }
}

/// Writes `color` to every pixel of the strip without rendering
pub fn fill(strip: &mut dyn LedStrip, color: Color) -> Result<(), DeviceError> {
    let packed = color.packed();
    for index in 0..strip.len() {
        strip.set_pixel(index, packed)?;
    }
    Ok(())
}

/// Writes `color` to a single pixel without rendering
pub fn set_pixel(strip: &mut dyn LedStrip, index: usize, color: Color) -> Result<(), DeviceError> {
    strip.set_pixel(index, color.packed())
}
