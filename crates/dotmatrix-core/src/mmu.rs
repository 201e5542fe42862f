use log::warn;

use crate::{cartridge::Cartridge, joypad::Joypad, ppu::Ppu, timer::Timer};

// Software fastmem configuration: the 16-bit bus is split into 256-byte pages.
const PAGE_COUNT: usize = 256;
/// Page-table entry for addresses that take the dispatching slow path.
const NO_PAGE: u32 = u32::MAX;

const VRAM_SIZE: usize = 0x2000;
const WRAM_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0xA0;
const HRAM_SIZE: usize = 0x7F;
const IO_SIZE: usize = 0x80;

// Arena layout: VRAM first, then WRAM.
const VRAM_BASE: usize = 0;
const WRAM_BASE: usize = VRAM_SIZE;

pub type IoReadHandler = Box<dyn FnMut(u16) -> u8>;
pub type IoWriteHandler = Box<dyn FnMut(u16, u8)>;

/// The 16-bit memory bus.
///
/// Most accesses resolve through the page tables: each of the 256 pages is
/// either an offset into the internal byte arena (VRAM, WRAM and the echo
/// region, which shares WRAM's backing) or [`NO_PAGE`], in which case the
/// access dispatches by range to the owning component. The tables are built
/// once and stay consistent with the arena layout: a fast entry always points
/// at 256 contiguous arena bytes.
pub struct Mmu {
    arena: Vec<u8>,
    page_read: [u32; PAGE_COUNT],
    page_write: [u32; PAGE_COUNT],

    oam: [u8; OAM_SIZE],
    hram: [u8; HRAM_SIZE],
    io: [u8; IO_SIZE],
    pub if_reg: u8,
    pub ie_reg: u8,

    pub cart: Option<Cartridge>,
    pub ppu: Ppu,
    pub timer: Timer,
    pub joypad: Joypad,

    // Per-byte I/O overrides for registers no component claims. Handlers
    // manipulate their own captured state and must not call back into the bus
    // for their own address.
    io_read_handlers: [Option<IoReadHandler>; IO_SIZE],
    io_write_handlers: [Option<IoWriteHandler>; IO_SIZE],
}

impl Mmu {
    pub fn new() -> Self {
        let mut mmu = Self {
            arena: vec![0; VRAM_SIZE + WRAM_SIZE],
            page_read: [NO_PAGE; PAGE_COUNT],
            page_write: [NO_PAGE; PAGE_COUNT],
            oam: [0; OAM_SIZE],
            hram: [0; HRAM_SIZE],
            io: [0; IO_SIZE],
            if_reg: 0xE1,
            ie_reg: 0,
            cart: None,
            ppu: Ppu::new(),
            timer: Timer::new(),
            joypad: Joypad::new(),
            io_read_handlers: std::array::from_fn(|_| None),
            io_write_handlers: std::array::from_fn(|_| None),
        };
        mmu.init_page_tables();
        mmu
    }

    /// Map the always-safe regions. Everything else (ROM, cartridge RAM,
    /// OAM, I/O, HRAM, IE) stays on the slow path.
    fn init_page_tables(&mut self) {
        // VRAM: 0x8000-0x9FFF
        for page in 0x80..=0x9F {
            let base = (VRAM_BASE + (page - 0x80) * 0x100) as u32;
            self.page_read[page] = base;
            self.page_write[page] = base;
        }
        // WRAM: 0xC000-0xDFFF
        for page in 0xC0..=0xDF {
            let base = (WRAM_BASE + (page - 0xC0) * 0x100) as u32;
            self.page_read[page] = base;
            self.page_write[page] = base;
        }
        // Echo RAM: 0xE000-0xFDFF mirrors 0xC000-0xDDFF
        for page in 0xE0..=0xFD {
            let base = (WRAM_BASE + (page - 0xE0) * 0x100) as u32;
            self.page_read[page] = base;
            self.page_write[page] = base;
        }
    }

    pub fn read_byte(&mut self, addr: u16) -> u8 {
        let base = self.page_read[usize::from(addr >> 8)];
        if base != NO_PAGE {
            return self.arena[base as usize + usize::from(addr & 0xFF)];
        }
        self.read_slow(addr)
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        let base = self.page_write[usize::from(addr >> 8)];
        if base != NO_PAGE {
            self.arena[base as usize + usize::from(addr & 0xFF)] = val;
            return;
        }
        self.write_slow(addr, val);
    }

    /// Little-endian 16-bit read, low byte first.
    pub fn read_word(&mut self, addr: u16) -> u16 {
        let lo = u16::from(self.read_byte(addr));
        let hi = u16::from(self.read_byte(addr.wrapping_add(1)));
        (hi << 8) | lo
    }

    /// Little-endian 16-bit write, low byte first.
    pub fn write_word(&mut self, addr: u16, val: u16) {
        self.write_byte(addr, val as u8);
        self.write_byte(addr.wrapping_add(1), (val >> 8) as u8);
    }

    fn read_slow(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => self.cart.as_ref().map(|c| c.read(addr)).unwrap_or(0xFF),
            0xA000..=0xBFFF => self.cart.as_ref().map(|c| c.read_ram(addr)).unwrap_or(0xFF),
            0xFE00..=0xFE9F => self.oam[usize::from(addr - 0xFE00)],
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00..=0xFF7F => self.io_read(addr),
            0xFF80..=0xFFFE => self.hram[usize::from(addr - 0xFF80)],
            0xFFFF => self.ie_reg,
            _ => {
                warn!("read from unmapped address {addr:#06X}");
                0xFF
            }
        }
    }

    fn write_slow(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write_ram(addr, val);
                }
            }
            0xFE00..=0xFE9F => self.oam[usize::from(addr - 0xFE00)] = val,
            0xFEA0..=0xFEFF => {}
            0xFF00..=0xFF7F => self.io_write(addr, val),
            0xFF80..=0xFFFE => self.hram[usize::from(addr - 0xFF80)] = val,
            0xFFFF => self.ie_reg = val,
            _ => warn!("write to unmapped address {addr:#06X} = {val:#04X}"),
        }
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        match addr {
            0xFF00 => self.joypad.read(),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg | 0xE0,
            0xFF40..=0xFF4B => self.ppu.read_reg(addr),
            _ => {
                let offset = usize::from(addr - 0xFF00);
                if let Some(handler) = self.io_read_handlers[offset].as_mut() {
                    handler(addr)
                } else {
                    self.io[offset]
                }
            }
        }
    }

    fn io_write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF00 => self.joypad.write(val),
            0xFF04..=0xFF07 => self.timer.write(addr, val),
            0xFF0F => self.if_reg = val & 0x1F,
            0xFF46 => {
                self.ppu.dma = val;
                self.oam_dma(val);
            }
            0xFF40..=0xFF4B => self.ppu.write_reg(addr, val),
            _ => {
                let offset = usize::from(addr - 0xFF00);
                if let Some(handler) = self.io_write_handlers[offset].as_mut() {
                    handler(addr, val);
                } else {
                    self.io[offset] = val;
                }
            }
        }
    }

    /// Copy 160 bytes from `source << 8` into OAM.
    fn oam_dma(&mut self, source: u8) {
        let src = u16::from(source) << 8;
        for i in 0..OAM_SIZE as u16 {
            let byte = self.read_byte(src.wrapping_add(i));
            self.oam[usize::from(i)] = byte;
        }
    }

    /// Override a single I/O byte's read and write. Registers owned by a
    /// component (joypad, timer, IF, PPU) are dispatched before the handler
    /// table and cannot be overridden.
    pub fn register_io_handler(&mut self, addr: u16, read: IoReadHandler, write: IoWriteHandler) {
        if !(0xFF00..=0xFF7F).contains(&addr) {
            warn!("io handler registration for non-I/O address {addr:#06X} ignored");
            return;
        }
        let offset = usize::from(addr - 0xFF00);
        self.io_read_handlers[offset] = Some(read);
        self.io_write_handlers[offset] = Some(write);
    }

    /// OR `mask` into the interrupt-flag register.
    pub fn request_interrupt(&mut self, mask: u8) {
        self.if_reg |= mask & 0x1F;
    }

    /// Push a new joypad state (active-low, 1 = released).
    pub fn set_joypad(&mut self, state: u8) {
        self.joypad.set_state(state, &mut self.if_reg);
    }

    /// Fan `cycles` out to the bus-owned components, picture unit first.
    pub fn tick(&mut self, cycles: u32) {
        self.ppu.step(
            cycles,
            &self.arena[VRAM_BASE..VRAM_BASE + VRAM_SIZE],
            &self.oam,
            &mut self.if_reg,
        );
        self.timer.step(cycles, &mut self.if_reg);
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
