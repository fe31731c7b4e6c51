#![no_std]
//! Driver to write characters to 16x2 LCD displays with a HD44780 controller behind a
//! PCF8574-family i2c expander. It requires an I2C instance implementing
//! [`embedded_hal::i2c::I2c`] and an instance to delay execution with
//! [`embedded_hal::delay::DelayNs`].
//!
//! The driver keeps a shadow copy of all 32 character cells and compares every requested
//! cell against it: a cell whose content did not change costs no bus traffic at all, and
//! sequential writes within a row skip the explicit cursor-set command because the
//! controller auto-advances after each data byte. On a 100 kHz bus where every byte takes
//! six i2c writes, this is the difference between a flickering and a quiet display.
//!
//! Usage:
//! ```ignore
//! // Create an I2C instance and a delay, e.g. with the arduino_hal crate for avr
//! // microcontrollers like the arduinos.
//! let dp = arduino_hal::Peripherals::take().unwrap();
//! let pins = arduino_hal::pins!(dp);
//! let mut i2c = arduino_hal::I2c::new(
//!     dp.TWI,
//!     pins.a4.into_pull_up_input(),
//!     pins.a5.into_pull_up_input(),
//!     50000,
//! );
//! let mut delay = arduino_hal::Delay::new();
//!
//! let mut lcd = lcd_lcm1602_shadow::Lcd::new(&mut i2c, &mut delay);
//! lcd.connect(lcd_lcm1602_shadow::PCF8574)?;
//! lcd.show_text("Hello", 0, 15)?;
//! lcd.show_number(42, 16, 31)?;
//! ```
//!
//! Alternatively, skip `connect` entirely: the first display call probes the two widely
//! used expander addresses ([`PCF8574`], then [`PCF8574A`]) once and connects to whichever
//! answers. If neither does, all display calls stay no-ops until [`Lcd::connect`] succeeds
//! or [`Lcd::reset_auto_connect`] re-arms the probe.
//!
//! This [site][lcd address] describes how to find the address of your LCD devices.
//!
//! [lcd address]: https://www.ardumotive.com/i2clcden.html

pub mod sync_lcd;

#[cfg(feature = "async")]
pub mod async_lcd;

pub use sync_lcd::Lcd;

use ufmt_write::uWrite;

/// Number of display rows.
pub const ROWS: u8 = 2;
/// Number of character cells per row.
pub const COLUMNS: u8 = 16;
/// Total number of character cells, addressed by flat indices `0..32`.
pub const CELLS: u8 = ROWS * COLUMNS;

/// Default address of PCF8574 expander backpacks.
pub const PCF8574: u8 = 0x27;
/// Default address of PCF8574A expander backpacks.
pub const PCF8574A: u8 = 0x3F;

/// Outcome of a display operation.
///
/// Bus errors surface through the `Err` arm of the enclosing `Result`; this type only
/// distinguishes work done from the silent no-op of a missing device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// The operation ran against a connected display.
    Done,
    /// No display is connected and auto-discovery did not find one; nothing was sent.
    NotConnected,
}

#[derive(Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Backlight {
    Off = 0x00,
    On = 0x08,
}

#[repr(u8)]
#[derive(Copy, Clone)]
pub(crate) enum Mode {
    Cmd = 0x00,
    Data = 0x01,
    EntrySet = 0x04,
    DisplayControl = 0x08,
    FunctionSet = 0x20,
    DDRAMAddr = 0x80,
}

#[repr(u8)]
#[derive(Copy, Clone)]
pub(crate) enum BitMode {
    Bit4 = 0x0 << 4,
    Bit8 = 0x1 << 4,
}

// Function set flags.
pub(crate) const LCD_2LINE: u8 = 0x08;
pub(crate) const LCD_5X8_DOTS: u8 = 0x00;

// Display control flags.
pub(crate) const LCD_DISPLAY_ON: u8 = 0x04;
pub(crate) const LCD_CURSOR_OFF: u8 = 0x00;
pub(crate) const LCD_BLINK_OFF: u8 = 0x00;

// Entry mode flags.
pub(crate) const LCD_ENTRY_LEFT: u8 = 0x02;
pub(crate) const LCD_ENTRY_SHIFT_DECREMENT: u8 = 0x00;

/// Enable line of the expander, pulsed to latch a nibble.
pub(crate) const ENABLE: u8 = 0b0000_0100;

/// Fill character for range positions past the end of the text.
pub(crate) const BLANK: u8 = b' ';

/// Pre-clear fill for the shadow buffer. Differs from [`BLANK`] so the clear that ends the
/// init sequence transmits every cell instead of skipping them as already correct.
pub(crate) const REFRESH_MARKER: u8 = b'x';

/// Cursor sentinel: not a valid cell index, forces the first write to reposition.
pub(crate) const CURSOR_UNKNOWN: u8 = CELLS + 1;

/// Last content known to be on the physical screen, plus where the controller's cursor is.
pub(crate) struct DisplayState {
    pub(crate) address: u8,
    pub(crate) backlight: Backlight,
    pub(crate) characters: [u8; CELLS as usize],
    pub(crate) cursor: u8,
}

impl DisplayState {
    pub(crate) fn new(address: u8) -> Self {
        Self {
            address,
            backlight: Backlight::On,
            // Zero differs from every character the init sequence will render.
            characters: [0; CELLS as usize],
            cursor: CURSOR_UNKNOWN,
        }
    }
}

/// Stack buffer holding the decimal representation of an i32, written through ufmt.
pub(crate) struct NumberBuffer {
    bytes: [u8; Self::CAPACITY],
    length: usize,
}

impl NumberBuffer {
    /// "-2147483648" is 11 bytes.
    const CAPACITY: usize = 12;

    pub(crate) fn format(value: i32) -> Self {
        let mut buffer = Self {
            bytes: [0; Self::CAPACITY],
            length: 0,
        };
        // Writing to the buffer cannot fail.
        let _ = ufmt::uwrite!(buffer, "{}", value);
        buffer
    }

    pub(crate) fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.length]).unwrap_or("")
    }
}

impl uWrite for NumberBuffer {
    type Error = core::convert::Infallible;

    fn write_str(&mut self, s: &str) -> Result<(), Self::Error> {
        for &byte in s.as_bytes() {
            if self.length < Self::CAPACITY {
                self.bytes[self.length] = byte;
                self.length += 1;
            }
        }
        Ok(())
    }
}
