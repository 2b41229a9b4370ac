//! Coprocessor buffer mapping, firmware selection, and the start/stop
//! interrupt handshake.
//!
//! The coprocessor writes samples into a physically contiguous buffer
//! without any notion of the host's memory model: every access from this
//! side is bracketed with an explicit fence, and the buffer is exposed as
//! raw bytes behind a `memmap2::MmapMut`, never as owned Rust data. The
//! "interrupt" is a Linux UIO device (`/dev/uioN`); a read of 4 bytes
//! returns the driver's interrupt count and blocks (or, under `poll`, waits)
//! until the next one.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::poll::{poll, PollFd, PollFlags};

/// Which half of the double-buffer was just filled.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BufferHalf {
    First,
    Second,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to open coprocessor event channel {path}: {source}")]
    OpenEventChannel {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to map coprocessor shared buffer: {0}")]
    MapBuffer(#[source] std::io::Error),
    #[error("failed to map coprocessor data memory: {0}")]
    MapDataRam(#[source] std::io::Error),
    #[error("poll on coprocessor event channel failed: {0}")]
    Poll(#[source] nix::Error),
    #[error("handshake with coprocessor timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("i/o error on coprocessor event channel: {0}")]
    Io(#[from] std::io::Error),
}

/// Firmware images the coprocessor can run, selected by capability flags.
/// Each name is a file under the platform's firmware search path.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Firmware {
    Standard10MHz,
    CycleCounter6_25MHz,
    Medium1MHz,
    Low100kHz,
    DualCoreScratchpad,
}

impl Firmware {
    pub fn file_name(&self) -> &'static str {
        match self {
            Firmware::Standard10MHz => "fl_pru1_logic.bin",
            Firmware::CycleCounter6_25MHz => "fl_pru1_logic_cyclecounter.bin",
            Firmware::Medium1MHz => "fl_pru1_logic_medium.bin",
            Firmware::Low100kHz => "fl_pru1_logic_low.bin",
            Firmware::DualCoreScratchpad => "fl_pru1_logic_dualcore.bin",
        }
    }

    pub fn sampling_rate_hz(&self) -> u64 {
        match self {
            Firmware::Standard10MHz => 10_000_000,
            Firmware::CycleCounter6_25MHz => 6_250_000,
            Firmware::Medium1MHz => 1_000_000,
            Firmware::Low100kHz => 100_000,
            Firmware::DualCoreScratchpad => 10_000_000,
        }
    }
}

/// Selects a firmware image from configuration flags, falling back to the
/// standard 10 MHz image if the requested one isn't present under
/// `firmware_dir` (a stand-in for the legacy fixed `/lib/firmware` path).
pub fn select_firmware(requested: Firmware, firmware_dir: &Path) -> Firmware {
    if firmware_dir.join(requested.file_name()).exists() {
        requested
    } else {
        log::warn!(
            "firmware image {} not found under {}, falling back to the standard image",
            requested.file_name(),
            firmware_dir.display()
        );
        Firmware::Standard10MHz
    }
}

/// If the pin-mask configuration disables PPS sampling, bit 7 is forced on
/// anyway: the decode layer always needs it for timestamp anchoring.
pub fn effective_pin_mask(requested_mask: u8, pps_enabled: bool) -> u8 {
    if pps_enabled {
        requested_mask
    } else {
        requested_mask | (1 << trace_proto::PPS_BIT)
    }
}

/// The 16-byte configuration record written into the coprocessor's data
/// memory before its firmware starts running.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ConfigRecord {
    pub buffer_physical_address: u32,
    pub buffer_size: u32,
    pub offset: u32,
    pub pin_mask: u32,
}

impl ConfigRecord {
    pub fn to_le_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.buffer_physical_address.to_le_bytes());
        out[4..8].copy_from_slice(&self.buffer_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.pin_mask.to_le_bytes());
        out
    }
}

/// Offset, within the mapped data-RAM window, of the host-ready handshake
/// flag byte that follows the 16-byte config record.
const HANDSHAKE_FLAG_OFFSET: usize = 16;

pub struct BridgeConfig<'a> {
    pub event_channel_path: &'a str,
    pub mem_device_path: &'a str,
    pub buffer_physical_address: u64,
    pub buffer_size: usize,
    pub data_ram_physical_address: u64,
    pub data_ram_size: usize,
    pub pin_mask: u8,
    pub offset_s: u64,
}

/// A mapped coprocessor: its shared sample buffer, its data-memory
/// configuration window, and its interrupt-equivalent event channel.
pub struct CoprocessorBridge {
    event_fd: File,
    buffer: MmapMut,
    data_ram: MmapMut,
    readout_count: u64,
}

impl CoprocessorBridge {
    /// Maps the shared buffer and data RAM, writes the config record, and
    /// leaves the coprocessor ready to be started with `handshake()`.
    /// Firmware *loading* (copying the selected image into the
    /// coprocessor's program memory and starting execution) is a platform
    /// action outside this crate's reach; callers are expected to have
    /// already triggered it via the selected [`Firmware`]'s file name.
    pub fn init(cfg: &BridgeConfig<'_>) -> Result<Self, BridgeError> {
        let event_fd =
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(cfg.event_channel_path)
                .map_err(|source| BridgeError::OpenEventChannel {
                    path: cfg.event_channel_path.to_string(),
                    source,
                })?;

        let mem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(cfg.mem_device_path)
            .map_err(|source| BridgeError::OpenEventChannel {
                path: cfg.mem_device_path.to_string(),
                source,
            })?;

        let buffer = unsafe {
            MmapOptions::new()
                .offset(cfg.buffer_physical_address)
                .len(cfg.buffer_size)
                .map_mut(&mem_file)
                .map_err(BridgeError::MapBuffer)?
        };

        let mut data_ram = unsafe {
            MmapOptions::new()
                .offset(cfg.data_ram_physical_address)
                .len(cfg.data_ram_size)
                .map_mut(&mem_file)
                .map_err(BridgeError::MapDataRam)?
        };

        let record = ConfigRecord {
            buffer_physical_address: cfg.buffer_physical_address as u32,
            buffer_size: cfg.buffer_size as u32,
            offset: cfg.offset_s as u32,
            pin_mask: cfg.pin_mask as u32,
        };
        data_ram[0..16].copy_from_slice(&record.to_le_bytes());
        fence(Ordering::SeqCst);

        Ok(CoprocessorBridge {
            event_fd,
            buffer,
            data_ram,
            readout_count: 0,
        })
    }

    /// Clears any stale event count without blocking.
    fn clear_event(&mut self) -> Result<(), BridgeError> {
        let flags = nix::fcntl::fcntl(self.event_fd.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL)
            .map_err(BridgeError::Poll)?;
        let flags = nix::fcntl::OFlag::from_bits_truncate(flags);
        nix::fcntl::fcntl(
            self.event_fd.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(flags | nix::fcntl::OFlag::O_NONBLOCK),
        )
        .map_err(BridgeError::Poll)?;

        let mut buf = [0u8; 4];
        loop {
            match self.event_fd.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }

        nix::fcntl::fcntl(
            self.event_fd.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(flags),
        )
        .map_err(BridgeError::Poll)?;
        Ok(())
    }

    fn raise_host_ready(&mut self) {
        self.data_ram[HANDSHAKE_FLAG_OFFSET] = 1;
        fence(Ordering::SeqCst);
    }

    /// Waits up to `timeout` for an event on the coprocessor's channel.
    /// Returns `true` if one arrived, `false` on timeout.
    pub fn wait_event(&self, timeout: Duration) -> Result<bool, BridgeError> {
        let mut fds = [PollFd::new(self.event_fd.as_raw_fd(), PollFlags::POLLIN)];
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let n = poll(&mut fds, millis).map_err(BridgeError::Poll)?;
        Ok(n > 0)
    }

    /// Clears any stale event, signals the coprocessor to start, and waits
    /// up to `timeout` (reference: 10s) for its acknowledgement.
    pub fn handshake(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        self.clear_event()?;
        self.raise_host_ready();

        if !self.wait_event(timeout)? {
            return Err(BridgeError::HandshakeTimeout(timeout));
        }
        self.clear_event()?;
        Ok(())
    }

    /// Returns which half was just filled: the one opposite the
    /// currently-active producer half, tracked by a readout-count parity
    /// bit so the drain loop never reads the half still being written.
    pub fn filled_half(&self) -> BufferHalf {
        if self.readout_count % 2 == 0 {
            BufferHalf::First
        } else {
            BufferHalf::Second
        }
    }

    fn half_range(&self, half: BufferHalf) -> std::ops::Range<usize> {
        let half_len = self.buffer.len() / 2;
        match half {
            BufferHalf::First => 0..half_len,
            BufferHalf::Second => half_len..2 * half_len,
        }
    }

    /// Reads the just-filled half, issuing the required read-side memory
    /// barrier first, and advances the readout count.
    pub fn read_filled_half(&mut self) -> &[u8] {
        fence(Ordering::Acquire);
        let half = self.filled_half();
        let range = self.half_range(half);
        self.readout_count += 1;
        &self.buffer[range]
    }

    /// Zeroes the just-read half so a subsequent partial fill's `delta`
    /// field is distinguishable from stale data, with the matching
    /// write-side barrier.
    pub fn zero_last_read_half(&mut self) {
        // readout_count was already advanced by read_filled_half, so the
        // half we just consumed is the *previous* parity.
        let half = if self.readout_count % 2 == 1 {
            BufferHalf::First
        } else {
            BufferHalf::Second
        };
        let range = self.half_range(half);
        self.buffer[range].fill(0);
        fence(Ordering::Release);
    }

    /// Reads the currently-active half plus `trailing` extra bytes, used
    /// once at stop time to capture any in-flight samples after a wrap.
    pub fn read_active_half_with_trailing(&self, trailing: usize) -> &[u8] {
        fence(Ordering::Acquire);
        let active = match self.filled_half() {
            BufferHalf::First => BufferHalf::Second,
            BufferHalf::Second => BufferHalf::First,
        };
        let range = self.half_range(active);
        let end = (range.end + trailing).min(self.buffer.len());
        &self.buffer[range.start..end]
    }

    pub fn readout_count(&self) -> u64 {
        self.readout_count
    }

    /// Disables the coprocessor and releases mapped state. Consumes `self`
    /// so the bridge cannot be reused after deinit.
    pub fn deinit(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_record_round_trips_fields() {
        let record = ConfigRecord {
            buffer_physical_address: 0x9F00_0000,
            buffer_size: 8192,
            offset: 5,
            pin_mask: 0b1010_1010,
        };
        let bytes = record.to_le_bytes();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0x9F00_0000);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 8192);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0b1010_1010);
    }

    #[test]
    fn effective_pin_mask_forces_pps_bit_when_disabled() {
        assert_eq!(effective_pin_mask(0b0000_0001, false), 0b1000_0001);
        assert_eq!(effective_pin_mask(0b0000_0001, true), 0b0000_0001);
    }

    #[test]
    fn firmware_sampling_rates_match_reference_values() {
        assert_eq!(Firmware::Standard10MHz.sampling_rate_hz(), 10_000_000);
        assert_eq!(Firmware::Low100kHz.sampling_rate_hz(), 100_000);
        assert_eq!(Firmware::CycleCounter6_25MHz.sampling_rate_hz(), 6_250_000);
    }
}
