//! LED and 7-segment panels with keys
//!
//! Drives TM1638-style "LED & key" boards over three board pins: strobe,
//! clock and a bidirectional data line. Bytes go out LSB first, one data
//! bit per rising clock edge, framed by strobe held low. Each panel has
//! eight digits, eight LEDs and up to eight keys. The module keeps a shadow
//! of the chip's display memory so hosts can see what is shown.

use tracing::{debug, info, warn};

use crate::core::{CommandError, HardwareError, ModuleKind};
use crate::hal::{Board, PinMode};
use crate::protocol::{ArgReader, CommandEnvelope, Reply};
use super::{allocate, unit_mut, ModuleContext, ModuleHandler};

/// Command ids of the display module
pub mod cmd {
    pub const ATTACH: u8 = 0;
    pub const SEND_COMMAND: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const READ_BUTTONS: u8 = 3;
    pub const SET_LED: u8 = 4;
    pub const DISPLAY_SEGMENTS: u8 = 5;
    pub const DISPLAY_ASCII: u8 = 6;
    pub const DISPLAY_HEX: u8 = 7;
    pub const DETACH: u8 = 8;
}

/// Digits (and LEDs) per panel
pub const DIGITS: u8 = 8;

/// Bytes of display memory: even addresses digits, odd addresses LEDs
pub const MEMORY_LEN: usize = 2 * DIGITS as usize;

const CMD_AUTO_INCREMENT: u8 = 0x40;
const CMD_READ_KEYS: u8 = 0x42;
const CMD_FIXED_ADDRESS: u8 = 0x44;
const CMD_DISPLAY_ON: u8 = 0x8F;
const ADDRESS_BASE: u8 = 0xC0;

/// Segment pattern for a character, bit 0 = segment a, bit 7 = point
pub fn glyph(c: u8) -> u8 {
    const DIGIT_GLYPHS: [u8; 10] = [0x3F, 0x06, 0x5B, 0x4F, 0x66, 0x6D, 0x7D, 0x07, 0x7F, 0x6F];
    const LETTER_GLYPHS: [u8; 26] = [
        0x77, 0x7C, 0x39, 0x5E, 0x79, 0x71, 0x3D, 0x76, 0x30, 0x1E, 0x75, 0x38, 0x15, 0x54, 0x3F, 0x73,
        0x67, 0x50, 0x6D, 0x78, 0x3E, 0x1C, 0x2A, 0x76, 0x6E, 0x5B,
    ];
    match c {
        b'0'..=b'9' => DIGIT_GLYPHS[(c - b'0') as usize],
        b'A'..=b'Z' => LETTER_GLYPHS[(c - b'A') as usize],
        b'a'..=b'z' => LETTER_GLYPHS[(c - b'a') as usize],
        b'-' => 0x40,
        b'_' => 0x08,
        b'.' => 0x80,
        b'=' => 0x48,
        b'"' => 0x22,
        b'\'' => 0x02,
        b'?' => 0x53,
        _ => 0,
    }
}

#[derive(Debug)]
struct Panel {
    strobe: u8,
    clock: u8,
    data: u8,
    memory: [u8; MEMORY_LEN],
}

impl Panel {
    fn shift_out<B: Board>(&self, board: &mut B, value: u8) -> Result<(), HardwareError> {
        for bit in 0..8 {
            board.digital_write(self.data, value >> bit & 1 == 1)?;
            board.digital_write(self.clock, true)?;
            board.digital_write(self.clock, false)?;
        }
        Ok(())
    }

    fn shift_in<B: Board>(&self, board: &mut B) -> Result<u8, HardwareError> {
        let mut value = 0;
        for bit in 0..8 {
            board.digital_write(self.clock, true)?;
            value |= (board.digital_read(self.data)? as u8) << bit;
            board.digital_write(self.clock, false)?;
        }
        Ok(value)
    }

    /// Runs `body` with strobe held low, raising it again even on error
    fn framed<B, T, F>(&self, board: &mut B, body: F) -> Result<T, HardwareError>
    where
        B: Board,
        F: FnOnce(&Self, &mut B) -> Result<T, HardwareError>,
    {
        board.digital_write(self.strobe, false)?;
        let result = body(self, board);
        let released = board.digital_write(self.strobe, true);
        let value = result?;
        released?;
        Ok(value)
    }

    fn send_command<B: Board>(&self, board: &mut B, value: u8) -> Result<(), HardwareError> {
        self.framed(board, |panel, board| panel.shift_out(board, value))
    }

    fn write_at<B: Board>(&mut self, board: &mut B, address: u8, value: u8) -> Result<(), HardwareError> {
        self.send_command(board, CMD_FIXED_ADDRESS)?;
        self.framed(board, |panel, board| {
            panel.shift_out(board, ADDRESS_BASE | address)?;
            panel.shift_out(board, value)
        })?;
        self.memory[address as usize] = value;
        Ok(())
    }

    /// Blanks every digit and LED
    fn clear<B: Board>(&mut self, board: &mut B) -> Result<(), HardwareError> {
        self.send_command(board, CMD_AUTO_INCREMENT)?;
        self.framed(board, |panel, board| {
            panel.shift_out(board, ADDRESS_BASE)?;
            for _ in 0..MEMORY_LEN {
                panel.shift_out(board, 0)?;
            }
            Ok(())
        })?;
        self.memory = [0; MEMORY_LEN];
        Ok(())
    }

    /// Bit `n` set while key `n` is held
    fn read_buttons<B: Board>(&self, board: &mut B) -> Result<u8, HardwareError> {
        self.framed(board, |panel, board| {
            panel.shift_out(board, CMD_READ_KEYS)?;
            // The chip drives the open-drain data line while keys are read
            board.pin_mode(panel.data, PinMode::InputPullup)?;
            let mut read = || -> Result<u8, HardwareError> {
                let mut buttons = 0;
                for i in 0..4 {
                    buttons |= panel.shift_in(board)? << i;
                }
                Ok(buttons)
            };
            let buttons = read();
            board.pin_mode(panel.data, PinMode::Output)?;
            buttons
        })
    }

    fn release<B: Board>(&mut self, board: &mut B) {
        if let Err(e) = self.clear(board) {
            warn!("failed to blank display: {}", e);
        }
        for pin in [self.strobe, self.clock, self.data] {
            if let Err(e) = board.pin_mode(pin, PinMode::Input) {
                warn!("failed to release display pin {}: {}", pin, e);
            }
        }
    }
}

fn read_position(args: &mut ArgReader<'_>) -> Result<u8, CommandError> {
    let position = args.u8()?;
    if position >= DIGITS {
        return Err(CommandError::invalid(format!(
            "position {} outside 0..{}",
            position, DIGITS
        )));
    }
    Ok(position)
}

/// Up to `max_displays` panels
#[derive(Debug)]
pub struct DisplayModule {
    panels: Vec<Option<Panel>>,
}

impl DisplayModule {
    pub fn new(max_displays: usize) -> Self {
        DisplayModule {
            panels: (0..max_displays).map(|_| None).collect(),
        }
    }

    /// Shadow of a unit's display memory
    pub fn memory(&self, unit: u8) -> Option<&[u8; MEMORY_LEN]> {
        self.panels.get(unit as usize)?.as_ref().map(|panel| &panel.memory)
    }

    fn attach<B: Board>(&mut self, strobe: u8, clock: u8, data: u8, board: &mut B) -> Result<Reply, CommandError> {
        if strobe == clock || clock == data || strobe == data {
            return Err(CommandError::invalid("display pins must be distinct"));
        }
        if !self.panels.iter().any(Option::is_none) {
            return Err(CommandError::invalid("no free display unit"));
        }
        for pin in [strobe, clock, data] {
            board.check_pin(pin)?;
        }
        for pin in [strobe, clock, data] {
            board.pin_mode(pin, PinMode::Output)?;
        }
        board.digital_write(strobe, true)?;
        board.digital_write(clock, false)?;

        let mut panel = Panel {
            strobe,
            clock,
            data,
            memory: [0; MEMORY_LEN],
        };
        panel.send_command(board, CMD_DISPLAY_ON)?;
        panel.clear(board)?;

        let unit = allocate(&mut self.panels, panel)?;
        info!("display {} attached (strobe {}, clock {}, data {})", unit, strobe, clock, data);
        Ok(Reply::ok().u8(unit))
    }
}

impl ModuleHandler for DisplayModule {
    const KIND: ModuleKind = ModuleKind::Display;

    fn handle<B: Board>(
        &mut self,
        command: &CommandEnvelope,
        ctx: &mut ModuleContext<'_, B>,
    ) -> Result<Reply, CommandError> {
        if command.command_id > cmd::DETACH {
            return Err(CommandError::UnknownCommand(command.command_id));
        }
        let mut args = ArgReader::new(&command.args);
        if command.command_id == cmd::ATTACH {
            let strobe = args.u8()?;
            let clock = args.u8()?;
            let data = args.u8()?;
            args.finish()?;
            return self.attach(strobe, clock, data, ctx.board);
        }

        let unit = command.unit;
        let panel = unit_mut(&mut self.panels, unit)?;
        match command.command_id {
            cmd::SEND_COMMAND => {
                let value = args.u8()?;
                args.finish()?;
                debug!("display {} raw command {:#04x}", unit, value);
                panel.send_command(ctx.board, value)?;
            }
            cmd::CLEAR => {
                args.finish()?;
                panel.clear(ctx.board)?;
            }
            cmd::READ_BUTTONS => {
                args.finish()?;
                return Ok(Reply::ok().u8(panel.read_buttons(ctx.board)?));
            }
            cmd::SET_LED => {
                let position = read_position(&mut args)?;
                let on = args.bool()?;
                args.finish()?;
                panel.write_at(ctx.board, position << 1 | 1, on as u8)?;
            }
            cmd::DISPLAY_SEGMENTS => {
                let position = read_position(&mut args)?;
                let segments = args.u8()?;
                args.finish()?;
                panel.write_at(ctx.board, position << 1, segments)?;
            }
            cmd::DISPLAY_ASCII => {
                let position = read_position(&mut args)?;
                let c = args.u8()?;
                args.finish()?;
                if !c.is_ascii() {
                    return Err(CommandError::invalid(format!("{:#04x} is not ASCII", c)));
                }
                panel.write_at(ctx.board, position << 1, glyph(c))?;
            }
            cmd::DISPLAY_HEX => {
                let position = read_position(&mut args)?;
                let digit = args.u8()?;
                args.finish()?;
                let c = char::from_digit(digit as u32, 16)
                    .ok_or_else(|| CommandError::invalid(format!("{} is not a hex digit", digit)))?;
                panel.write_at(ctx.board, position << 1, glyph(c as u8))?;
            }
            cmd::DETACH => {
                args.finish()?;
                panel.release(ctx.board);
                self.panels[unit as usize] = None;
                info!("display {} detached", unit);
            }
            other => return Err(CommandError::UnknownCommand(other)),
        }
        Ok(Reply::ok())
    }

    fn reset<B: Board>(&mut self, ctx: &mut ModuleContext<'_, B>) {
        for slot in self.panels.iter_mut() {
            if let Some(mut panel) = slot.take() {
                panel.release(ctx.board);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StatusCode;
    use crate::modules::test_support::{data, Bench};

    const STROBE: u8 = 10;
    const CLOCK: u8 = 11;
    const DATA: u8 = 12;

    /// Bytes clocked out in each strobe frame, rebuilt from the write log
    fn frames(writes: &[(u8, bool)]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut bits: Option<Vec<bool>> = None;
        let mut data = false;
        for &(pin, high) in writes {
            match (pin, high) {
                (STROBE, false) => bits = Some(Vec::new()),
                (STROBE, true) => {
                    if let Some(bits) = bits.take() {
                        let bytes: Vec<u8> = bits
                            .chunks(8)
                            .map(|byte| byte.iter().enumerate().fold(0u8, |acc, (i, &b)| acc | (b as u8) << i))
                            .collect();
                        frames.push(bytes);
                    }
                }
                (DATA, level) => data = level,
                (CLOCK, true) => {
                    if let Some(bits) = bits.as_mut() {
                        bits.push(data);
                    }
                }
                _ => {}
            }
        }
        frames
    }

    fn attached() -> (Bench, DisplayModule) {
        let mut bench = Bench::new();
        let mut display = DisplayModule::new(2);
        let reply = bench
            .call(&mut display, cmd::ATTACH, 0, &[STROBE, CLOCK, DATA])
            .unwrap();
        assert_eq!(data(reply), vec![0]);
        bench.board.record_writes();
        (bench, display)
    }

    #[test]
    fn test_attach_switches_on_and_blanks() {
        let mut bench = Bench::new();
        let mut display = DisplayModule::new(2);
        bench.board.record_writes();
        bench
            .call(&mut display, cmd::ATTACH, 0, &[STROBE, CLOCK, DATA])
            .unwrap();

        let mut blank = vec![ADDRESS_BASE];
        blank.extend_from_slice(&[0; MEMORY_LEN]);
        assert_eq!(
            frames(&bench.board.take_writes()),
            vec![vec![CMD_DISPLAY_ON], vec![CMD_AUTO_INCREMENT], blank]
        );
        for pin in [STROBE, CLOCK, DATA] {
            assert_eq!(bench.board.mode(pin), Some(PinMode::Output));
        }
        assert!(bench.board.level(STROBE));
    }

    #[test]
    fn test_digits_and_leds() {
        let (mut bench, mut display) = attached();

        bench.call(&mut display, cmd::DISPLAY_HEX, 0, &[0, 0xA]).unwrap();
        assert_eq!(
            frames(&bench.board.take_writes()),
            vec![vec![CMD_FIXED_ADDRESS], vec![0xC0, 0x77]]
        );

        bench.call(&mut display, cmd::SET_LED, 0, &[3, 1]).unwrap();
        assert_eq!(
            frames(&bench.board.take_writes()),
            vec![vec![CMD_FIXED_ADDRESS], vec![0xC7, 0x01]]
        );

        bench.call(&mut display, cmd::DISPLAY_ASCII, 0, &[7, b'5']).unwrap();
        bench.call(&mut display, cmd::DISPLAY_SEGMENTS, 0, &[1, 0x80]).unwrap();

        let memory = display.memory(0).unwrap();
        assert_eq!(memory[0], 0x77);
        assert_eq!(memory[2], 0x80);
        assert_eq!(memory[7], 0x01);
        assert_eq!(memory[14], 0x6D);

        bench.call(&mut display, cmd::CLEAR, 0, &[]).unwrap();
        assert_eq!(display.memory(0).unwrap(), &[0; MEMORY_LEN]);
    }

    #[test]
    fn test_raw_command() {
        let (mut bench, mut display) = attached();
        // Lowest brightness
        bench.call(&mut display, cmd::SEND_COMMAND, 0, &[0x88]).unwrap();
        assert_eq!(frames(&bench.board.take_writes()), vec![vec![0x88]]);
    }

    #[test]
    fn test_read_buttons() {
        let (mut bench, mut display) = attached();
        // Nothing pulls the line low, every key reads as held
        let reply = bench.call(&mut display, cmd::READ_BUTTONS, 0, &[]).unwrap();
        assert_eq!(data(reply), vec![0xFF]);

        let sent = frames(&bench.board.take_writes());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], CMD_READ_KEYS);
        assert_eq!(bench.board.mode(DATA), Some(PinMode::Output));
        assert!(bench.board.level(STROBE));
    }

    #[test]
    fn test_glyphs() {
        assert_eq!(glyph(b'8'), 0x7F);
        assert_eq!(glyph(b'b'), glyph(b'B'));
        assert_eq!(glyph(b' '), 0);
        assert_eq!(glyph(b'~'), 0);
    }

    #[test]
    fn test_argument_validation() {
        let (mut bench, mut display) = attached();

        let err = bench.call(&mut display, cmd::DISPLAY_SEGMENTS, 0, &[8, 0xFF]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        let err = bench.call(&mut display, cmd::DISPLAY_HEX, 0, &[0, 16]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        let err = bench.call(&mut display, cmd::DISPLAY_ASCII, 0, &[0, 0xB0]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        let err = bench.call(&mut display, cmd::SET_LED, 1, &[0, 1]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        assert!(bench.board.take_writes().is_empty());

        let err = bench.call(&mut display, cmd::ATTACH, 0, &[1, 1, 2]).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
        let err = bench.call(&mut display, cmd::ATTACH, 0, &[1, 2, 30]).unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidArgument);
        assert_eq!(
            bench.call(&mut display, 9, 0, &[]).unwrap_err(),
            CommandError::UnknownCommand(9)
        );
    }

    #[test]
    fn test_hardware_fault_keeps_shadow() {
        let (mut bench, mut display) = attached();
        bench.call(&mut display, cmd::DISPLAY_SEGMENTS, 0, &[2, 0x3F]).unwrap();
        bench.board.inject_fault(CLOCK, "shorted");

        let err = bench.call(&mut display, cmd::DISPLAY_SEGMENTS, 0, &[2, 0x06]).unwrap_err();
        assert_eq!(err.status(), StatusCode::HardwareFault);
        assert_eq!(display.memory(0).unwrap()[4], 0x3F);
        // Strobe is released even though the frame failed
        assert!(bench.board.level(STROBE));
    }

    #[test]
    fn test_detach_and_reset() {
        let (mut bench, mut display) = attached();
        bench.call(&mut display, cmd::DISPLAY_HEX, 0, &[0, 1]).unwrap();
        bench.call(&mut display, cmd::DETACH, 0, &[]).unwrap();
        assert!(display.memory(0).is_none());
        for pin in [STROBE, CLOCK, DATA] {
            assert_eq!(bench.board.mode(pin), Some(PinMode::Input));
        }

        let reply = bench.call(&mut display, cmd::ATTACH, 0, &[1, 2, 3]).unwrap();
        assert_eq!(data(reply), vec![0]);
        bench.reset(&mut display);
        assert!(display.memory(0).is_none());
        assert_eq!(bench.board.mode(1), Some(PinMode::Input));
    }
}
