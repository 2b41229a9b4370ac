//! Memory-mapped GPIO output driver.
//!
//! # Register layout
//!
//! Modeled on the AM335x GPIO port block (see the reference manual,
//! §25.4 "GPIO Registers"): a 4 KiB-aligned, `GPIO_MEM_SIZE`-byte window per
//! port, with dedicated write-one-to-set and write-one-to-clear registers so
//! that `set`/`clear` never need a read-modify-write. `toggle` has no
//! dedicated register on this family; it reads the data-output register and
//! writes the complement through `set`/`clear`.
//!
//! All four actuation pins this crate drives (SIG1, SIG2, nRST, PPS) must
//! live on the same port — the hardware register block is per-port, and
//! splitting a single logical actuation across two mmap'd windows buys
//! nothing but complexity.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapMut, MmapOptions};

/// Data-output register offset (read current pin levels).
const GPIO_DATAOUT_OFS: usize = 0x13C;
/// Write-one-to-clear register offset.
const GPIO_CLEARDATAOUT_OFS: usize = 0x190;
/// Write-one-to-set register offset.
const GPIO_SETDATAOUT_OFS: usize = 0x194;
/// Per-port register window size.
pub const GPIO_MEM_SIZE: usize = 0x2000;

/// Physical base addresses of the four AM335x GPIO ports, indexed by port
/// number (pin / 32).
pub const GPIO_PORT_BASES: [u64; 4] = [0x44E0_7000, 0x4804_C000, 0x481A_C000, 0x481A_E000];

/// Returns the physical base address of the port pin `pin` lives on.
pub fn port_base_for_pin(pin: u32) -> u64 {
    GPIO_PORT_BASES[(pin / 32) as usize % GPIO_PORT_BASES.len()]
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("failed to open GPIO memory device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to map GPIO register block: {0}")]
    Map(#[source] std::io::Error),
    #[error("actuation pins span more than one GPIO port: pin {0} is not on port base 0x{1:08x}")]
    PortMismatch(u32, u64),
}

/// A single memory-mapped GPIO port's write-one-to-set/clear registers.
///
/// Every pin number passed to [`GpioWriter`]'s methods is a *global* pin
/// index; it's reduced to a bit position within the port via `% 32`, and
/// the caller is responsible for ensuring all such pins actually live on
/// the port this instance was opened against (checked once at
/// construction for the fixed actuation pin set via [`GpioWriter::open`]).
pub struct GpioWriter {
    mmap: MmapMut,
    port_base: u64,
}

impl GpioWriter {
    /// Maps the GPIO port containing `pins[0]` through `mem_path`
    /// (typically `/dev/mem`), and verifies every other pin in `pins`
    /// reduces to the same port.
    pub fn open(mem_path: &str, pins: &[u32]) -> Result<Self, GpioError> {
        let port_base = pins.first().map(|&p| port_base_for_pin(p)).unwrap_or(GPIO_PORT_BASES[0]);
        for &pin in pins {
            let base = port_base_for_pin(pin);
            if base != port_base {
                return Err(GpioError::PortMismatch(pin, port_base));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(mem_path)
            .map_err(|source| GpioError::Open {
                path: mem_path.to_string(),
                source,
            })?;

        let mmap = unsafe {
            MmapOptions::new()
                .offset(port_base)
                .len(GPIO_MEM_SIZE)
                .map_mut(&file)
                .map_err(GpioError::Map)?
        };

        Ok(GpioWriter { mmap, port_base })
    }

    #[inline]
    fn bit(pin: u32) -> u32 {
        pin % 32
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        let ptr = self.mmap.as_mut_ptr().wrapping_add(offset) as *mut u32;
        fence(Ordering::SeqCst);
        unsafe { std::ptr::write_volatile(ptr, value) };
        fence(Ordering::SeqCst);
    }

    fn read_reg(&self, offset: usize) -> u32 {
        let ptr = self.mmap.as_ptr().wrapping_add(offset) as *const u32;
        fence(Ordering::SeqCst);
        let value = unsafe { std::ptr::read_volatile(ptr) };
        fence(Ordering::SeqCst);
        value
    }

    /// Drives `pin` high.
    pub fn set(&mut self, pin: u32) {
        self.write_reg(GPIO_SETDATAOUT_OFS, 1 << Self::bit(pin));
    }

    /// Drives `pin` low.
    pub fn clear(&mut self, pin: u32) {
        self.write_reg(GPIO_CLEARDATAOUT_OFS, 1 << Self::bit(pin));
    }

    /// Flips `pin`'s current level. Requires a read-modify-write since this
    /// register block has no dedicated toggle register.
    pub fn toggle(&mut self, pin: u32) {
        let bit = 1u32 << Self::bit(pin);
        let current = self.read_reg(GPIO_DATAOUT_OFS);
        if current & bit != 0 {
            self.write_reg(GPIO_CLEARDATAOUT_OFS, bit);
        } else {
            self.write_reg(GPIO_SETDATAOUT_OFS, bit);
        }
    }

    /// Sets `pin` to an explicit level: `true` = high, `false` = low.
    pub fn update(&mut self, pin: u32, level: bool) {
        if level {
            self.set(pin);
        } else {
            self.clear(pin);
        }
    }

    pub fn port_base(&self) -> u64 {
        self.port_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `GpioWriter::open` requires a real mmappable device, so these tests
    // exercise only the bit-arithmetic helper, matching the teacher's own
    // practice of unit-testing register math without real hardware.
    #[test]
    fn bit_reduces_modulo_32() {
        assert_eq!(GpioWriter::bit(89), 25);
        assert_eq!(GpioWriter::bit(88), 24);
        assert_eq!(GpioWriter::bit(32), 0);
        assert_eq!(GpioWriter::bit(0), 0);
    }

    #[test]
    fn reference_actuation_pins_share_one_port() {
        // SIG1, SIG2, nRST and PPS all live on the same port on the
        // reference hardware wiring this driver targets.
        assert_eq!(port_base_for_pin(89), port_base_for_pin(88));
        assert_eq!(port_base_for_pin(88), port_base_for_pin(77));
        assert_eq!(port_base_for_pin(77), port_base_for_pin(66));
    }
}
