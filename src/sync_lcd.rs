use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use ufmt_write::uWrite;

use crate::{
    Backlight, BitMode, DisplayState, Mode, NumberBuffer, Status, BLANK, CELLS, COLUMNS,
    ENABLE, LCD_2LINE, LCD_5X8_DOTS, LCD_BLINK_OFF, LCD_CURSOR_OFF, LCD_DISPLAY_ON,
    LCD_ENTRY_LEFT, LCD_ENTRY_SHIFT_DECREMENT, PCF8574, PCF8574A, REFRESH_MARKER,
};

/// API to write to the LCD.
///
/// Holds the connection state of one display: nothing is transmitted while no device is
/// connected, and the first display call performs a one-shot probe of the well known
/// expander addresses.
pub struct Lcd<'a, I, D>
where
    I: I2c,
    D: DelayNs,
{
    i2c: &'a mut I,
    delay: &'a mut D,
    state: Option<DisplayState>,
    auto_connect_attempted: bool,
}

impl<'a, I, D> Lcd<'a, I, D>
where
    I: I2c,
    D: DelayNs,
{
    /// Create new instance with only the I2C and delay instance.
    pub fn new(i2c: &'a mut I, delay: &'a mut D) -> Self {
        Self {
            i2c,
            delay,
            state: None,
            auto_connect_attempted: false,
        }
    }

    /// Connects to the LCD at the given address and initializes the hardware.
    ///
    /// The device is probed with a read first; a missing or unpowered device leaves the
    /// driver unconnected and returns [`Status::NotConnected`]. The init procedure is a
    /// bit obscure. This one was compiled from the [datasheet] and this [blog post].
    ///
    /// [datasheet]: https://www.openhacks.com/uploadsproductos/eone-1602a1.pdf
    /// [blog post]: https://badboi.dev/rust,/microcontrollers/2020/11/09/i2c-hello-world.html
    pub fn connect(&mut self, address: u8) -> Result<Status, I::Error> {
        let mut probe = [0u8; 1];
        if self.i2c.read(address, &mut probe).is_err() || probe[0] == 0 {
            return Ok(Status::NotConnected);
        }
        self.state = Some(DisplayState::new(address));

        // Wait for the controller to settle after power on.
        self.delay.delay_ms(50);
        // Pull RS, R/W and E low while keeping the backlight bit, so the controller sees
        // known line states before the first command.
        self.i2c.write(address, &[Backlight::On as u8])?;
        self.delay.delay_ms(50);

        // Force 4 bit mode. The controller may still be in 8 bit mode or stuck mid-byte
        // after a partial transmission; the datasheet's triple 0x30 with long gaps
        // recovers from both.
        let mode_8bit = Mode::FunctionSet as u8 | BitMode::Bit8 as u8;
        for _ in 0..3 {
            self.write_nibble(mode_8bit)?;
            self.delay.delay_us(4100);
        }
        let mode_4bit = Mode::FunctionSet as u8 | BitMode::Bit4 as u8;
        self.write_nibble(mode_4bit)?;
        self.delay.delay_us(1000);

        self.send(
            Mode::FunctionSet as u8 | BitMode::Bit4 as u8 | LCD_2LINE | LCD_5X8_DOTS,
            Mode::Cmd,
        )?;
        self.delay.delay_us(1000);
        self.send(
            Mode::DisplayControl as u8 | LCD_DISPLAY_ON | LCD_CURSOR_OFF | LCD_BLINK_OFF,
            Mode::Cmd,
        )?;
        self.delay.delay_us(1000);
        self.send(
            Mode::EntrySet as u8 | LCD_ENTRY_LEFT | LCD_ENTRY_SHIFT_DECREMENT,
            Mode::Cmd,
        )?;
        self.delay.delay_us(1000);

        // Mark every shadow cell dirty so the blank paint below repaints the whole screen
        // and resynchronizes the cursor tracking.
        if let Some(state) = &mut self.state {
            state.characters = [REFRESH_MARKER; CELLS as usize];
        }
        self.paint("", 0, CELLS as i32 - 1)?;
        Ok(Status::Done)
    }

    /// Returns true if a LCD is connected, probing the well known addresses once if not.
    pub fn is_connected(&mut self) -> Result<bool, I::Error> {
        self.ensure_connected()
    }

    /// Re-arms the one-shot auto-discovery, e.g. after a display was plugged in late.
    pub fn reset_auto_connect(&mut self) {
        self.auto_connect_attempted = false;
    }

    /// Displays a text in the given cell range, filling leftover cells with whitespace.
    ///
    /// Cells are addressed by flat indices: 0..16 is the top row, 16..32 the bottom row.
    /// Indices outside `0..32` are skipped without effect. Text longer than the range is
    /// cropped. Only cells whose content actually changes are transmitted.
    pub fn show_text(&mut self, text: &str, start: i32, end: i32) -> Result<Status, I::Error> {
        if !self.ensure_connected()? {
            return Ok(Status::NotConnected);
        }
        self.paint(text, start, end)?;
        Ok(Status::Done)
    }

    /// Displays a number in decimal in the given cell range.
    pub fn show_number(&mut self, value: i32, start: i32, end: i32) -> Result<Status, I::Error> {
        let digits = NumberBuffer::format(value);
        self.show_text(digits.as_str(), start, end)
    }

    /// Clears the display.
    pub fn clear(&mut self) -> Result<Status, I::Error> {
        self.show_text("", 0, CELLS as i32 - 1)
    }

    /// Switches the backlight and applies it to the device immediately.
    pub fn set_backlight(&mut self, backlight: Backlight) -> Result<Status, I::Error> {
        if !self.ensure_connected()? {
            return Ok(Status::NotConnected);
        }
        if let Some(state) = &mut self.state {
            state.backlight = backlight;
        }
        // A zero command carries no payload but transmits the new backlight bit.
        self.send(0, Mode::Cmd)?;
        Ok(Status::Done)
    }

    /// Render core shared by the public entry points and the init sequence. Does not
    /// auto-connect; a missing device makes every cell update a no-op.
    fn paint(&mut self, text: &str, start: i32, end: i32) -> Result<(), I::Error> {
        // Cells past the bottom row never display anything; clamping the end bounds the
        // loop without changing which character lands on which cell.
        let end = end.min(CELLS as i32 - 1);
        let mut characters = text.chars();
        // Negative cells consume a character each but never transmit, so the whole
        // prefix collapses into one iterator skip instead of a per-cell scan.
        let start = if start < 0 {
            characters.nth(start.unsigned_abs() as usize - 1);
            0
        } else {
            start
        };
        for position in start..=end {
            let character = match characters.next() {
                Some(c) => c as u8,
                None => BLANK,
            };
            self.update_cell(character, position)?;
        }
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<bool, I::Error> {
        if self.state.is_some() {
            return Ok(true);
        }
        if self.auto_connect_attempted {
            return Ok(false);
        }
        self.auto_connect_attempted = true;
        self.connect(PCF8574)?;
        if self.state.is_none() {
            self.connect(PCF8574A)?;
        }
        Ok(self.state.is_some())
    }

    /// Transmits one character if the shadow buffer disagrees with it, repositioning the
    /// cursor only when the controller's auto-advance does not already point at the cell.
    fn update_cell(&mut self, character: u8, position: i32) -> Result<(), I::Error> {
        if position < 0 || position >= CELLS as i32 {
            return Ok(());
        }
        let position = position as u8;
        let (current, cursor) = match &self.state {
            Some(state) => (state.characters[position as usize], state.cursor),
            None => return Ok(()),
        };
        if current == character {
            return Ok(());
        }
        // Row starts are non-contiguous DDRAM addresses, so a new row always repositions
        // even when the cursor nominally continues from the previous cell.
        if cursor != position || position % COLUMNS == 0 {
            self.set_cursor(position / COLUMNS, position % COLUMNS)?;
        }
        self.send(character, Mode::Data)?;
        if let Some(state) = &mut self.state {
            state.characters[position as usize] = character;
            state.cursor = position + 1;
        }
        Ok(())
    }

    /// Set the cursor to (row, col). Coordinates are zero-based.
    fn set_cursor(&mut self, row: u8, column: u8) -> Result<(), I::Error> {
        let offset = if row == 0 { 0x00 } else { 0x40 };
        self.send(Mode::DDRAMAddr as u8 | (offset + column), Mode::Cmd)
    }

    fn send(&mut self, data: u8, mode: Mode) -> Result<(), I::Error> {
        let backlight = match &self.state {
            Some(state) => state.backlight as u8,
            None => return Ok(()),
        };
        let flags = backlight | mode as u8;
        let high_bits = data & 0xf0;
        let low_bits = (data << 4) & 0xf0;
        self.write_nibble(high_bits | flags)?;
        self.write_nibble(low_bits | flags)
    }

    fn write_nibble(&mut self, value: u8) -> Result<(), I::Error> {
        let address = match &self.state {
            Some(state) => state.address,
            None => return Ok(()),
        };
        self.i2c.write(address, &[value])?;
        self.i2c.write(address, &[value | ENABLE])?;
        self.delay.delay_us(1);
        self.i2c.write(address, &[value & !ENABLE])?;
        self.delay.delay_us(50);
        Ok(())
    }
}

impl<'a, I, D> uWrite for Lcd<'a, I, D>
where
    I: I2c,
    D: DelayNs,
{
    type Error = I::Error;

    /// Write string to display, starting at the current cursor cell (or the top left
    /// corner if it is unknown). No whitespace padding, unlike [`Lcd::show_text`].
    fn write_str(&mut self, s: &str) -> Result<(), Self::Error> {
        if !self.ensure_connected()? {
            return Ok(());
        }
        let mut position = match &self.state {
            Some(state) if state.cursor < CELLS => state.cursor as i32,
            _ => 0,
        };
        for c in s.chars() {
            self.update_cell(c as u8, position)?;
            position += 1;
        }
        Ok(())
    }
}
