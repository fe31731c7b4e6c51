use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::{
    Backlight, BitMode, DisplayState, Mode, NumberBuffer, Status, BLANK, CELLS, COLUMNS,
    ENABLE, LCD_2LINE, LCD_5X8_DOTS, LCD_BLINK_OFF, LCD_CURSOR_OFF, LCD_DISPLAY_ON,
    LCD_ENTRY_LEFT, LCD_ENTRY_SHIFT_DECREMENT, PCF8574, PCF8574A, REFRESH_MARKER,
};

/// API to write to the LCD, async twin of [`crate::sync_lcd::Lcd`].
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
    /// See [`crate::sync_lcd::Lcd::connect`] for the probe semantics and the init
    /// procedure this follows.
    pub async fn connect(&mut self, address: u8) -> Result<Status, I::Error> {
        let mut probe = [0u8; 1];
        let responded = self.i2c.read(address, &mut probe).await.is_ok();
        if !responded || probe[0] == 0 {
            return Ok(Status::NotConnected);
        }
        self.state = Some(DisplayState::new(address));

        // Wait for the controller to settle after power on.
        self.delay.delay_ms(50).await;
        // Pull RS, R/W and E low while keeping the backlight bit.
        self.i2c.write(address, &[Backlight::On as u8]).await?;
        self.delay.delay_ms(50).await;

        // Force 4 bit mode, recovering from 8 bit mode or a half-transmitted byte.
        let mode_8bit = Mode::FunctionSet as u8 | BitMode::Bit8 as u8;
        for _ in 0..3 {
            self.write_nibble(mode_8bit).await?;
            self.delay.delay_us(4100).await;
        }
        let mode_4bit = Mode::FunctionSet as u8 | BitMode::Bit4 as u8;
        self.write_nibble(mode_4bit).await?;
        self.delay.delay_us(1000).await;

        self.send(
            Mode::FunctionSet as u8 | BitMode::Bit4 as u8 | LCD_2LINE | LCD_5X8_DOTS,
            Mode::Cmd,
        )
        .await?;
        self.delay.delay_us(1000).await;
        self.send(
            Mode::DisplayControl as u8 | LCD_DISPLAY_ON | LCD_CURSOR_OFF | LCD_BLINK_OFF,
            Mode::Cmd,
        )
        .await?;
        self.delay.delay_us(1000).await;
        self.send(
            Mode::EntrySet as u8 | LCD_ENTRY_LEFT | LCD_ENTRY_SHIFT_DECREMENT,
            Mode::Cmd,
        )
        .await?;
        self.delay.delay_us(1000).await;

        // Mark every shadow cell dirty so the blank paint below repaints the whole screen
        // and resynchronizes the cursor tracking.
        if let Some(state) = &mut self.state {
            state.characters = [REFRESH_MARKER; CELLS as usize];
        }
        self.paint("", 0, CELLS as i32 - 1).await?;
        Ok(Status::Done)
    }

    /// Returns true if a LCD is connected, probing the well known addresses once if not.
    pub async fn is_connected(&mut self) -> Result<bool, I::Error> {
        self.ensure_connected().await
    }

    /// Re-arms the one-shot auto-discovery.
    pub fn reset_auto_connect(&mut self) {
        self.auto_connect_attempted = false;
    }

    /// Displays a text in the given cell range, filling leftover cells with whitespace.
    ///
    /// Cells are addressed by flat indices: 0..16 is the top row, 16..32 the bottom row.
    /// Indices outside `0..32` are skipped without effect. Text longer than the range is
    /// cropped. Only cells whose content actually changes are transmitted.
    pub async fn show_text(
        &mut self,
        text: &str,
        start: i32,
        end: i32,
    ) -> Result<Status, I::Error> {
        if !self.ensure_connected().await? {
            return Ok(Status::NotConnected);
        }
        self.paint(text, start, end).await?;
        Ok(Status::Done)
    }

    /// Displays a number in decimal in the given cell range.
    pub async fn show_number(
        &mut self,
        value: i32,
        start: i32,
        end: i32,
    ) -> Result<Status, I::Error> {
        let digits = NumberBuffer::format(value);
        self.show_text(digits.as_str(), start, end).await
    }

    /// Clears the display.
    pub async fn clear(&mut self) -> Result<Status, I::Error> {
        self.show_text("", 0, CELLS as i32 - 1).await
    }

    /// Switches the backlight and applies it to the device immediately.
    pub async fn set_backlight(&mut self, backlight: Backlight) -> Result<Status, I::Error> {
        if !self.ensure_connected().await? {
            return Ok(Status::NotConnected);
        }
        if let Some(state) = &mut self.state {
            state.backlight = backlight;
        }
        self.send(0, Mode::Cmd).await?;
        Ok(Status::Done)
    }

    /// Render core shared by the public entry points and the init sequence. Does not
    /// auto-connect, which also keeps `connect` free of async recursion.
    async fn paint(&mut self, text: &str, start: i32, end: i32) -> Result<(), I::Error> {
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
            self.update_cell(character, position).await?;
        }
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<bool, I::Error> {
        if self.state.is_some() {
            return Ok(true);
        }
        if self.auto_connect_attempted {
            return Ok(false);
        }
        self.auto_connect_attempted = true;
        self.connect(PCF8574).await?;
        if self.state.is_none() {
            self.connect(PCF8574A).await?;
        }
        Ok(self.state.is_some())
    }

    async fn update_cell(&mut self, character: u8, position: i32) -> Result<(), I::Error> {
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
        if cursor != position || position % COLUMNS == 0 {
            self.set_cursor(position / COLUMNS, position % COLUMNS).await?;
        }
        self.send(character, Mode::Data).await?;
        if let Some(state) = &mut self.state {
            state.characters[position as usize] = character;
            state.cursor = position + 1;
        }
        Ok(())
    }

    /// Set the cursor to (row, col). Coordinates are zero-based.
    async fn set_cursor(&mut self, row: u8, column: u8) -> Result<(), I::Error> {
        let offset = if row == 0 { 0x00 } else { 0x40 };
        self.send(Mode::DDRAMAddr as u8 | (offset + column), Mode::Cmd).await
    }

    async fn send(&mut self, data: u8, mode: Mode) -> Result<(), I::Error> {
        let backlight = match &self.state {
            Some(state) => state.backlight as u8,
            None => return Ok(()),
        };
        let flags = backlight | mode as u8;
        let high_bits = data & 0xf0;
        let low_bits = (data << 4) & 0xf0;
        self.write_nibble(high_bits | flags).await?;
        self.write_nibble(low_bits | flags).await
    }

    async fn write_nibble(&mut self, value: u8) -> Result<(), I::Error> {
        let address = match &self.state {
            Some(state) => state.address,
            None => return Ok(()),
        };
        self.i2c.write(address, &[value]).await?;
        self.i2c.write(address, &[value | ENABLE]).await?;
        self.delay.delay_us(1).await;
        self.i2c.write(address, &[value & !ENABLE]).await?;
        self.delay.delay_us(50).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use super::*;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};

    const ADDR: u8 = PCF8574;

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    fn nibble(address: u8, value: u8) -> Vec<I2cTransaction> {
        vec![
            I2cTransaction::write(address, vec![value]),
            I2cTransaction::write(address, vec![value | 0x04]),
            I2cTransaction::write(address, vec![value & !0x04]),
        ]
    }

    fn transmission(address: u8, flags: u8, byte: u8) -> Vec<I2cTransaction> {
        let mut writes = nibble(address, (byte & 0xf0) | flags);
        writes.extend(nibble(address, ((byte << 4) & 0xf0) | flags));
        writes
    }

    fn command(address: u8, byte: u8) -> Vec<I2cTransaction> {
        transmission(address, 0x08, byte)
    }

    fn data(address: u8, byte: u8) -> Vec<I2cTransaction> {
        transmission(address, 0x09, byte)
    }

    fn connect_sequence(address: u8) -> Vec<I2cTransaction> {
        let mut writes = vec![
            I2cTransaction::read(address, vec![0xff]),
            I2cTransaction::write(address, vec![0x08]),
        ];
        for _ in 0..3 {
            writes.extend(nibble(address, 0x30));
        }
        writes.extend(nibble(address, 0x20));
        writes.extend(command(address, 0x28));
        writes.extend(command(address, 0x0c));
        writes.extend(command(address, 0x06));
        writes.extend(command(address, 0x80));
        for _ in 0..16 {
            writes.extend(data(address, b' '));
        }
        writes.extend(command(address, 0xc0));
        for _ in 0..16 {
            writes.extend(data(address, b' '));
        }
        writes
    }

    #[tokio::test]
    async fn connect_runs_documented_init_sequence() {
        let expectations = connect_sequence(ADDR);
        let mut i2c = I2cMock::new(&expectations);
        let mut delay = NoDelay;
        {
            let mut lcd = Lcd::new(&mut i2c, &mut delay);
            assert_eq!(lcd.connect(ADDR).await.unwrap(), Status::Done);
        }
        i2c.done();
    }

    #[tokio::test]
    async fn repeated_text_costs_no_bus_traffic() {
        let mut expectations = connect_sequence(ADDR);
        expectations.extend(command(ADDR, 0x80));
        for &byte in b"HELLO" {
            expectations.extend(data(ADDR, byte));
        }
        let mut i2c = I2cMock::new(&expectations);
        let mut delay = NoDelay;
        {
            let mut lcd = Lcd::new(&mut i2c, &mut delay);
            lcd.connect(ADDR).await.unwrap();
            assert_eq!(lcd.show_text("HELLO", 0, 4).await.unwrap(), Status::Done);
            assert_eq!(lcd.show_text("HELLO", 0, 4).await.unwrap(), Status::Done);
        }
        i2c.done();
    }

    #[tokio::test]
    async fn extreme_negative_start_completes_immediately() {
        let mut expectations = connect_sequence(ADDR);
        // The entire text lands on the negative prefix; only the blank fill for cells 0
        // and 1 differs from the screen after "AB" was shown there.
        expectations.extend(command(ADDR, 0x80));
        for &byte in b"AB" {
            expectations.extend(data(ADDR, byte));
        }
        expectations.extend(command(ADDR, 0x80));
        expectations.extend(data(ADDR, b' '));
        expectations.extend(data(ADDR, b' '));
        let mut i2c = I2cMock::new(&expectations);
        let mut delay = NoDelay;
        {
            let mut lcd = Lcd::new(&mut i2c, &mut delay);
            lcd.connect(ADDR).await.unwrap();
            lcd.show_text("AB", 0, 1).await.unwrap();
            // Must not walk the prefix cell by cell.
            assert_eq!(
                lcd.show_text("HI", i32::MIN, 1).await.unwrap(),
                Status::Done
            );
        }
        i2c.done();
    }

    #[tokio::test]
    async fn auto_discovery_probes_each_address_once() {
        use embedded_hal::i2c::ErrorKind;

        let expectations = [
            I2cTransaction::read(PCF8574, vec![0]).with_error(ErrorKind::Other),
            I2cTransaction::read(PCF8574A, vec![0]).with_error(ErrorKind::Other),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut delay = NoDelay;
        {
            let mut lcd = Lcd::new(&mut i2c, &mut delay);
            assert_eq!(lcd.show_text("HI", 0, 1).await.unwrap(), Status::NotConnected);
            assert_eq!(lcd.show_text("HI", 0, 1).await.unwrap(), Status::NotConnected);
            assert!(!lcd.is_connected().await.unwrap());
        }
        i2c.done();
    }
}
