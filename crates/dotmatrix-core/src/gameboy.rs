use std::io;
use std::path::Path;

use log::info;

use crate::{
    cartridge::{Cartridge, LoadError},
    cpu::Cpu,
    mmu::Mmu,
    ppu::{SCREEN_HEIGHT, SCREEN_WIDTH},
    scheduler::Scheduler,
};

/// T-cycles per frame (~59.73 Hz).
pub const CYCLES_PER_FRAME: u32 = 70_224;

/// The wired machine: CPU, bus (which owns cartridge, PPU, timer and joypad)
/// and the event scheduler. The machine is the single owner of all state;
/// components receive references at operation time, never store them.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub scheduler: Scheduler,
    total_cycles: u64,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            mmu: Mmu::new(),
            scheduler: Scheduler::new(),
            total_cycles: 0,
        }
    }

    /// Parse and install a ROM image, then reset to the post-boot state.
    /// On error the machine is left untouched.
    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), LoadError> {
        let cart = Cartridge::load(data)?;
        self.mmu.cart = Some(cart);
        self.reset();
        Ok(())
    }

    pub fn load_rom_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), LoadError> {
        let data = std::fs::read(path)?;
        self.load_rom(data)
    }

    /// Reset to the post-boot state, preserving the loaded cartridge (its
    /// banking registers return to power-on values; RAM and RTC survive).
    pub fn reset(&mut self) {
        let mut cart = self.mmu.cart.take();
        if let Some(cart) = cart.as_mut() {
            cart.reset();
        }
        self.cpu = Cpu::new();
        self.mmu = Mmu::new();
        self.mmu.cart = cart;
        self.scheduler.reset();
        self.total_cycles = 0;
        info!("machine reset");
    }

    /// Execute a single instruction and fan its cycles out to the picture
    /// unit, timer and scheduler. Returns the cycles consumed.
    pub fn step(&mut self) -> u32 {
        let cycles = self.cpu.step(&mut self.mmu);
        self.mmu.tick(cycles);
        self.scheduler.advance(u64::from(cycles));
        self.scheduler.process_events();
        self.total_cycles += u64::from(cycles);
        cycles
    }

    /// Run until a full frame's worth of cycles has elapsed. The frame-ready
    /// flag is set when the picture unit entered VBlank along the way.
    pub fn run_frame(&mut self) {
        let mut frame_cycles = 0u32;
        while frame_cycles < CYCLES_PER_FRAME {
            frame_cycles += self.step();
        }
    }

    /// Push the joypad state, active-low (1 = released): bit 0 Right,
    /// 1 Left, 2 Up, 3 Down, 4 A, 5 B, 6 Select, 7 Start.
    pub fn set_joypad(&mut self, state: u8) {
        self.mmu.set_joypad(state);
    }

    pub fn framebuffer(&self) -> &[u32; SCREEN_WIDTH * SCREEN_HEIGHT] {
        self.mmu.ppu.framebuffer()
    }

    pub fn frame_ready(&self) -> bool {
        self.mmu.ppu.frame_ready()
    }

    pub fn clear_frame_ready(&mut self) {
        self.mmu.ppu.clear_frame_ready();
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Persist cartridge RAM to `path`. A machine without a cartridge (or
    /// with a RAM-less one) writes an empty image.
    pub fn save_ram<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        match &self.mmu.cart {
            Some(cart) => cart.save_ram(path),
            None => Ok(()),
        }
    }

    /// Load cartridge RAM previously written by [`GameBoy::save_ram`].
    pub fn load_ram<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        match &mut self.mmu.cart {
            Some(cart) => cart.load_ram(path),
            None => Ok(()),
        }
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}
