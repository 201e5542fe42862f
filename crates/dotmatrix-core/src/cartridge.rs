use std::{
    fs, io,
    path::Path,
    time::{Duration, SystemTime},
};

use log::info;
use thiserror::Error;

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;

/// A valid image must at least cover the header checksum area.
const MIN_ROM_SIZE: usize = 0x150;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("ROM image too small: {0} bytes (need at least 0x150)")]
    TooSmall(usize),
    #[error("unsupported cartridge type {0:#04X}")]
    UnsupportedCartridge(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcKind {
    Mbc0,
    Mbc1,
    Mbc3,
    Mbc5,
}

impl MbcKind {
    /// Maximum external RAM the controller can address. The backing vector is
    /// always sized to this, independent of the header's RAM-size code.
    const fn ram_capacity(self) -> usize {
        match self {
            MbcKind::Mbc0 => 0,
            MbcKind::Mbc1 | MbcKind::Mbc3 => 4 * RAM_BANK_SIZE,
            MbcKind::Mbc5 => 16 * RAM_BANK_SIZE,
        }
    }
}

#[derive(Debug)]
enum MbcState {
    Mbc0,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }
}

/// MBC3 real-time clock. The counter is wall-clock derived: elapsed whole
/// seconds are folded in whenever the game latches, so the machine never has
/// to step the cartridge.
#[derive(Debug)]
struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    last_sync: SystemTime,
}

impl Rtc {
    fn new(now: SystemTime) -> Self {
        let regs = RtcRegisters::default();
        Self {
            regs,
            latched: regs,
            last_sync: now,
        }
    }

    fn latch(&mut self, now: SystemTime) {
        self.sync_wall(now);
        self.latched = self.regs;
    }

    fn sync_wall(&mut self, now: SystemTime) {
        let elapsed = now
            .duration_since(self.last_sync)
            .unwrap_or_default()
            .as_secs();
        if elapsed == 0 {
            return;
        }
        // Only whole seconds are consumed; the remainder stays pending.
        self.last_sync += Duration::from_secs(elapsed);
        if self.regs.halt {
            return;
        }

        let total = u64::from(self.regs.days) * 86_400
            + u64::from(self.regs.hours) * 3_600
            + u64::from(self.regs.minutes) * 60
            + u64::from(self.regs.seconds)
            + elapsed;
        self.regs.seconds = (total % 60) as u8;
        self.regs.minutes = (total / 60 % 60) as u8;
        self.regs.hours = (total / 3_600 % 24) as u8;
        let days = total / 86_400;
        if days > 0x01FF {
            self.regs.carry = true;
        }
        self.regs.days = (days & 0x01FF) as u16;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds & 0x3F,
            0x09 => self.latched.minutes & 0x3F,
            0x0A => self.latched.hours & 0x1F,
            0x0B => (self.latched.days & 0x00FF) as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, val: u8, now: SystemTime) {
        self.sync_wall(now);
        match reg {
            0x08 => {
                self.regs.seconds = val & 0x3F;
                // Writing seconds restarts the current second.
                self.last_sync = now;
            }
            0x09 => self.regs.minutes = val & 0x3F,
            0x0A => self.regs.hours = val & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | u16::from(val),
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (u16::from(val & 0x01) << 8);
                self.regs.halt = val & 0x40 != 0;
                self.regs.carry = val & 0x80 != 0;
            }
            _ => {}
        }
        self.latched = self.regs;
    }
}

#[derive(Debug)]
pub struct Cartridge {
    rom: Vec<u8>,
    ram: Vec<u8>,
    kind: MbcKind,
    title: String,
    state: MbcState,
}

impl Cartridge {
    /// Parse the header and wrap `data` in the matching controller.
    ///
    /// On error the image is dropped and the caller's state is untouched.
    pub fn load(data: Vec<u8>) -> Result<Self, LoadError> {
        if data.len() < MIN_ROM_SIZE {
            return Err(LoadError::TooSmall(data.len()));
        }

        let header = Header::parse(&data);
        let cart_type = header.cart_type();
        let kind = match cart_type {
            0x00 => MbcKind::Mbc0,
            0x01..=0x03 => MbcKind::Mbc1,
            0x0F..=0x13 => MbcKind::Mbc3,
            0x19..=0x1E => MbcKind::Mbc5,
            other => return Err(LoadError::UnsupportedCartridge(other)),
        };
        let title = header.title();
        let has_rtc = header.has_rtc();

        info!(
            "cartridge \"{}\": type {:#04X} ({:?}), ROM {} KiB (code {:#04X}), RAM code {:#04X}",
            title,
            cart_type,
            kind,
            32 << header.rom_size_code(),
            header.rom_size_code(),
            header.ram_size_code(),
        );

        let state = Self::initial_state(kind, has_rtc);
        Ok(Self {
            rom: data,
            ram: vec![0; kind.ram_capacity()],
            kind,
            title,
            state,
        })
    }

    fn initial_state(kind: MbcKind, has_rtc: bool) -> MbcState {
        match kind {
            MbcKind::Mbc0 => MbcState::Mbc0,
            MbcKind::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcKind::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc.then(|| Rtc::new(SystemTime::now())),
                latch_pending: false,
            },
            MbcKind::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        }
    }

    /// Return the banking registers to their power-on values. ROM, RAM
    /// contents and the RTC counter are preserved.
    pub fn reset(&mut self) {
        let old = std::mem::replace(&mut self.state, Self::initial_state(self.kind, false));
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = old
            && let MbcState::Mbc3 { rtc: slot, .. } = &mut self.state
        {
            *slot = Some(rtc);
        }
    }

    pub fn kind(&self) -> MbcKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// ROM-region read (0x0000-0x7FFF).
    pub fn read(&self, addr: u16) -> u8 {
        match (&self.state, addr) {
            // The fixed window always maps raw ROM bank 0.
            (_, 0x0000..=0x3FFF) => self.rom.get(addr as usize).copied().unwrap_or(0xFF),
            (MbcState::Mbc0, 0x4000..=0x7FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (
                MbcState::Mbc1 {
                    rom_bank, ram_bank, ..
                },
                0x4000..=0x7FFF,
            ) => {
                let bank = (usize::from(*ram_bank & 0x03) << 5) | usize::from(*rom_bank & 0x1F);
                self.read_banked(bank, addr)
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.read_banked(usize::from(*rom_bank), addr)
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.read_banked(usize::from(*rom_bank), addr)
            }
            _ => 0xFF,
        }
    }

    fn read_banked(&self, bank: usize, addr: u16) -> u8 {
        let offset = bank * ROM_BANK_SIZE + (addr as usize - 0x4000);
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    /// ROM-region write (0x0000-0x7FFF): banking control registers.
    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.state, addr) {
            (MbcState::Mbc0, _) => {}
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x1F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val;
            }
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                // A 0 followed by a 1 captures the live counter.
                if val == 0 {
                    *latch_pending = true;
                } else if val == 1 && *latch_pending {
                    if let Some(rtc) = rtc {
                        rtc.latch(SystemTime::now());
                    }
                    *latch_pending = false;
                } else {
                    *latch_pending = false;
                }
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | u16::from(val);
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0x0FF) | (u16::from(val & 0x01) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            _ => {}
        }
    }

    /// External RAM read (0xA000-0xBFFF).
    pub fn read_ram(&self, addr: u16) -> u8 {
        match &self.state {
            MbcState::Mbc0 => 0xFF,
            MbcState::Mbc1 {
                ram_enable,
                ram_bank,
                mode,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                let bank = if *mode == 1 { *ram_bank & 0x03 } else { 0 };
                self.ram_at(bank, addr)
            }
            MbcState::Mbc3 {
                ram_enable,
                ram_bank,
                rtc,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                match *ram_bank {
                    0x00..=0x03 => self.ram_at(*ram_bank, addr),
                    0x08..=0x0C => rtc
                        .as_ref()
                        .map(|r| r.read_latched(*ram_bank))
                        .unwrap_or(0xFF),
                    _ => 0xFF,
                }
            }
            MbcState::Mbc5 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                self.ram_at(*ram_bank & 0x0F, addr)
            }
        }
    }

    /// External RAM write (0xA000-0xBFFF).
    pub fn write_ram(&mut self, addr: u16, val: u8) {
        let idx = match &mut self.state {
            MbcState::Mbc0 => return,
            MbcState::Mbc1 {
                ram_enable,
                ram_bank,
                mode,
                ..
            } => {
                if !*ram_enable {
                    return;
                }
                let bank = if *mode == 1 { *ram_bank & 0x03 } else { 0 };
                Self::ram_index(bank, addr)
            }
            MbcState::Mbc3 {
                ram_enable,
                ram_bank,
                rtc,
                ..
            } => {
                if !*ram_enable {
                    return;
                }
                match *ram_bank {
                    0x00..=0x03 => Self::ram_index(*ram_bank, addr),
                    0x08..=0x0C => {
                        if let Some(rtc) = rtc.as_mut() {
                            rtc.write_register(*ram_bank, val, SystemTime::now());
                        }
                        return;
                    }
                    _ => return,
                }
            }
            MbcState::Mbc5 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if !*ram_enable {
                    return;
                }
                Self::ram_index(*ram_bank & 0x0F, addr)
            }
        };
        if let Some(b) = self.ram.get_mut(idx) {
            *b = val;
        }
    }

    fn ram_index(bank: u8, addr: u16) -> usize {
        usize::from(bank) * RAM_BANK_SIZE + (addr as usize - 0xA000)
    }

    fn ram_at(&self, bank: u8, addr: u16) -> u8 {
        self.ram
            .get(Self::ram_index(bank, addr))
            .copied()
            .unwrap_or(0xFF)
    }

    /// Persist the RAM image as a raw byte stream sized to the controller's
    /// capacity. No header, no versioning.
    pub fn save_ram<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        fs::write(path, &self.ram)
    }

    /// Load a RAM image previously written by [`Cartridge::save_ram`]. Short
    /// files fill a prefix; excess bytes are ignored.
    pub fn load_ram<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let bytes = fs::read(path)?;
        for (d, s) in self.ram.iter_mut().zip(bytes.iter()) {
            *d = *s;
        }
        Ok(())
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let end = 0x0144.min(self.data.len());
        let mut slice = &self.data[0x0134.min(self.data.len())..end];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cart_type(&self) -> u8 {
        self.data.get(0x0147).copied().unwrap_or(0)
    }

    fn rom_size_code(&self) -> u8 {
        self.data.get(0x0148).copied().unwrap_or(0)
    }

    fn ram_size_code(&self) -> u8 {
        self.data.get(0x0149).copied().unwrap_or(0)
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type(), 0x0F | 0x10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with_type(cart_type: u8, banks: usize) -> Vec<u8> {
        let mut rom = vec![0u8; banks * ROM_BANK_SIZE];
        rom[0x0147] = cart_type;
        for bank in 0..banks {
            rom[bank * ROM_BANK_SIZE] = bank as u8;
        }
        rom
    }

    #[test]
    fn too_small_and_unknown_types_are_rejected() {
        assert!(matches!(
            Cartridge::load(vec![0u8; 0x100]),
            Err(LoadError::TooSmall(0x100))
        ));
        let mut rom = vec![0u8; 0x8000];
        rom[0x0147] = 0x05; // MBC2, not supported
        assert!(matches!(
            Cartridge::load(rom),
            Err(LoadError::UnsupportedCartridge(0x05))
        ));
    }

    #[test]
    fn mbc1_bank_switch_with_zero_redirect() {
        let mut cart = Cartridge::load(rom_with_type(0x01, 8)).unwrap();

        cart.write(0x2000, 0x05);
        assert_eq!(cart.read(0x4000), 5);

        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 1);

        // The fixed window stays on bank 0 in either banking mode.
        cart.write(0x6000, 0x01);
        assert_eq!(cart.read(0x0000), 0);
    }

    #[test]
    fn mbc1_high_bits_extend_the_switched_bank() {
        let mut cart = Cartridge::load(rom_with_type(0x01, 64)).unwrap();
        cart.write(0x2000, 0x02);
        cart.write(0x4000, 0x01); // high bits -> bank 0x22
        assert_eq!(cart.read(0x4000), 0x22);
    }

    #[test]
    fn out_of_range_bank_reads_open_bus() {
        let mut cart = Cartridge::load(rom_with_type(0x01, 2)).unwrap();
        cart.write(0x2000, 0x1F);
        assert_eq!(cart.read(0x4000), 0xFF);
    }

    #[test]
    fn ram_enable_gates_external_ram() {
        let mut cart = Cartridge::load(rom_with_type(0x03, 2)).unwrap();

        cart.write_ram(0xA000, 0x55);
        assert_eq!(cart.read_ram(0xA000), 0xFF);

        cart.write(0x0000, 0x0A);
        cart.write_ram(0xA000, 0x55);
        assert_eq!(cart.read_ram(0xA000), 0x55);

        cart.write(0x0000, 0x00);
        assert_eq!(cart.read_ram(0xA000), 0xFF);
    }

    #[test]
    fn mbc5_nine_bit_rom_bank() {
        let mut cart = Cartridge::load(rom_with_type(0x19, 4)).unwrap();
        cart.write(0x2000, 0x02);
        assert_eq!(cart.read(0x4000), 2);

        // Bank 0 is reachable in the switched window on MBC5.
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 0);

        // Bit 8 pushes the bank out of this small image: open bus.
        cart.write(0x3000, 0x01);
        assert_eq!(cart.read(0x4000), 0xFF);
    }

    #[test]
    fn mbc3_rtc_latch_requires_zero_one_edge() {
        let mut cart = Cartridge::load(rom_with_type(0x0F, 2)).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x08); // RTC seconds register

        // Writes through the RAM window reach the RTC.
        cart.write_ram(0xA000, 0x2A);
        assert_eq!(cart.read_ram(0xA000), 0x2A);

        // A lone 1 write does not latch; 0 then 1 does.
        cart.write(0x6000, 0x01);
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01);
        assert_eq!(cart.read_ram(0xA000), 0x2A);
    }

    #[test]
    fn save_then_load_round_trips_ram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cart.sav");

        let mut cart = Cartridge::load(rom_with_type(0x03, 2)).unwrap();
        cart.write(0x0000, 0x0A);
        for i in 0..32u16 {
            cart.write_ram(0xA000 + i, i as u8 ^ 0x5A);
        }
        cart.save_ram(&path).unwrap();

        let mut other = Cartridge::load(rom_with_type(0x03, 2)).unwrap();
        other.load_ram(&path).unwrap();
        assert_eq!(cart.ram(), other.ram());
    }

    #[test]
    fn reset_restores_banking_but_keeps_ram() {
        let mut cart = Cartridge::load(rom_with_type(0x03, 8)).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write_ram(0xA000, 0x77);
        cart.write(0x2000, 0x05);
        assert_eq!(cart.read(0x4000), 5);

        cart.reset();
        assert_eq!(cart.read(0x4000), 1);
        cart.write(0x0000, 0x0A);
        assert_eq!(cart.read_ram(0xA000), 0x77);
    }
}
