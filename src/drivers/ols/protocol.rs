//! SUMP command set as spoken by the Openbench Logic Sniffer.
//!
//! Short commands are a single opcode byte. Long commands are the opcode
//! followed by a 32-bit little-endian argument.

use crate::device::{Probe, ProbeKind};
use crate::error::{LabError, Result};

pub const CMD_RESET: u8 = 0x00;
pub const CMD_RUN: u8 = 0x01;
pub const CMD_ID: u8 = 0x02;
pub const CMD_METADATA: u8 = 0x04;
pub const CMD_SET_DIVIDER: u8 = 0x80;
pub const CMD_CAPTURE_SIZE: u8 = 0x81;
pub const CMD_SET_FLAGS: u8 = 0x82;
pub const CMD_SET_TRIGGER_MASK: u8 = 0xc0;
pub const CMD_SET_TRIGGER_VALUE: u8 = 0xc1;
pub const CMD_SET_TRIGGER_CONFIG: u8 = 0xc2;

/// Both answers to `CMD_ID` ("SLA1"/"OLS1" sent backwards).
pub const ID_REPLIES: [&[u8; 4]; 2] = [b"1SLO", b"1ALS"];

pub const FLAG_DEMUX: u16 = 0x01;
pub const FLAG_FILTER: u16 = 0x02;
/// Bits 2..=5: channel group `i` disabled when bit `2 + i` is set.
pub const FLAG_GROUPS_DISABLED: u16 = 0x3c;
pub const FLAG_RLE: u16 = 0x0100;

/// Starts the capture when the stage matches.
const TRIGGER_START: u32 = 1 << 27;

pub const CLOCK_RATE: u64 = 100_000_000;
pub const MIN_SAMPLERATE: u64 = 10;
pub const MAX_SAMPLERATE: u64 = 2 * CLOCK_RATE;
pub const MIN_NUM_SAMPLES: u64 = 4;
/// The capture size register counts groups of four in 16 bits.
pub const MAX_NUM_SAMPLES: u64 = 4 * 0x1_0000;
pub const NUM_PROBES: usize = 32;
pub const NUM_TRIGGER_STAGES: usize = 4;

pub fn long_command(cmd: u8, value: u32) -> [u8; 5] {
    let v = value.to_le_bytes();
    [cmd, v[0], v[1], v[2], v[3]]
}

/// Clock divider and demux flag for `samplerate`, plus the rate the
/// divider actually yields.
pub fn samplerate_divider(samplerate: u64) -> Result<(u32, bool, u64)> {
    if !(MIN_SAMPLERATE..=MAX_SAMPLERATE).contains(&samplerate) {
        return Err(LabError::Samplerate(samplerate));
    }
    let demux = samplerate > CLOCK_RATE;
    let clock = if demux { CLOCK_RATE * 2 } else { CLOCK_RATE };
    let divider = clock / samplerate - 1;
    let actual = clock / (divider + 1);
    Ok((divider as u32, demux, actual))
}

/// Argument of `CMD_CAPTURE_SIZE`: read and delay counts, both minus one,
/// in 16-bit halves.
pub fn capture_size(readcount: u32, delaycount: u32) -> u32 {
    let read = readcount.saturating_sub(1) & 0xffff;
    let delay = delaycount.saturating_sub(1) & 0xffff;
    (delay << 16) | read
}

/// Device description returned by `CMD_METADATA`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    pub num_probes: Option<usize>,
    pub max_samples: Option<u32>,
    pub max_samplerate: Option<u64>,
    pub protocol_version: Option<u32>,
}

impl Metadata {
    fn add_version(&mut self, label: &str, value: &str) {
        if !self.version.is_empty() {
            self.version.push_str(", ");
        }
        self.version.push_str(label);
        self.version.push(' ');
        self.version.push_str(value);
    }
}

/// Parse metadata tokens until the end key or until `bytes` runs dry.
///
/// Each key byte carries its value type in the top three bits: a
/// NUL-terminated string, a big-endian u32, or a single byte.
pub fn parse_metadata(bytes: &mut impl Iterator<Item = u8>) -> Metadata {
    let mut meta = Metadata::default();
    while let Some(key) = bytes.next() {
        if key == 0x00 {
            break;
        }
        let token = key & 0x1f;
        match key >> 5 {
            0 => {
                let raw: Vec<u8> = bytes.by_ref().take_while(|b| *b != 0).collect();
                let value = String::from_utf8_lossy(&raw);
                log::debug!("ols: metadata key {key:#04x} = '{value}'");
                match token {
                    0x01 => meta.name.push_str(&value),
                    0x02 => meta.add_version("FPGA version", &value),
                    0x03 => meta.add_version("Ancillary version", &value),
                    _ => log::info!("ols: unknown metadata token {token:#04x}: '{value}'"),
                }
            }
            1 => {
                let raw: Vec<u8> = bytes.by_ref().take(4).collect();
                let Ok(raw) = <[u8; 4]>::try_from(raw) else {
                    break;
                };
                let value = u32::from_be_bytes(raw);
                log::debug!("ols: metadata key {key:#04x} = {value:#010x}");
                match token {
                    0x00 => meta.num_probes = Some(value as usize),
                    0x01 => meta.max_samples = Some(value),
                    0x02 => {}
                    0x03 => meta.max_samplerate = Some(u64::from(value)),
                    0x04 => meta.protocol_version = Some(value),
                    _ => log::info!("ols: unknown metadata token {token:#04x}: {value:#010x}"),
                }
            }
            2 => {
                let Some(value) = bytes.next() else {
                    break;
                };
                log::debug!("ols: metadata key {key:#04x} = {value:#04x}");
                match token {
                    0x00 => meta.num_probes = Some(usize::from(value)),
                    0x01 => meta.protocol_version = Some(u32::from(value)),
                    _ => log::info!("ols: unknown metadata token {token:#04x}: {value:#04x}"),
                }
            }
            _ => log::info!("ols: unknown metadata type in key {key:#04x}"),
        }
    }
    meta
}

/// Probe mask and hardware trigger stages derived from the probe list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSetup {
    pub probe_mask: u32,
    pub trigger_mask: [u32; NUM_TRIGGER_STAGES],
    pub trigger_value: [u32; NUM_TRIGGER_STAGES],
    pub num_stages: usize,
}

impl ProbeSetup {
    pub fn from_probes(probes: &[Probe]) -> Result<Self> {
        let mut setup = Self::default();
        for probe in probes
            .iter()
            .filter(|p| p.enabled && p.kind == ProbeKind::Logic)
        {
            if probe.index >= NUM_PROBES {
                return Err(LabError::argument(format!(
                    "ols: no probe {} on a {NUM_PROBES}-probe device",
                    probe.index
                )));
            }
            let bit = 1u32 << probe.index;
            setup.probe_mask |= bit;
            let Some(trigger) = &probe.trigger else {
                continue;
            };
            if trigger.chars().count() > NUM_TRIGGER_STAGES {
                return Err(LabError::argument(format!(
                    "ols: at most {NUM_TRIGGER_STAGES} trigger stages"
                )));
            }
            for (stage, c) in trigger.chars().enumerate() {
                match c {
                    '1' => setup.trigger_value[stage] |= bit,
                    '0' => {}
                    _ => {
                        return Err(LabError::argument(format!(
                            "ols: unsupported trigger type '{c}' on probe {}",
                            probe.name
                        )))
                    }
                }
                setup.trigger_mask[stage] |= bit;
            }
            setup.num_stages = setup.num_stages.max(trigger.chars().count());
        }
        Ok(setup)
    }

    pub fn has_trigger(&self) -> bool {
        self.num_stages > 0
    }

    /// Enabled-group bits, one per byte lane of the 32-bit sample.
    pub fn channel_groups(&self) -> u8 {
        (0..4)
            .filter(|i| self.probe_mask & (0xff << (i * 8)) != 0)
            .fold(0, |mask, i| mask | (1 << i))
    }

    /// Trigger mask/value/config commands for every stage.
    pub fn trigger_commands(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NUM_TRIGGER_STAGES * 15);
        if !self.has_trigger() {
            out.extend(long_command(CMD_SET_TRIGGER_MASK, 0));
            out.extend(long_command(CMD_SET_TRIGGER_VALUE, 0));
            out.extend(long_command(CMD_SET_TRIGGER_CONFIG, TRIGGER_START));
            return out;
        }
        for stage in 0..NUM_TRIGGER_STAGES {
            let config = if stage + 1 == self.num_stages {
                TRIGGER_START
            } else {
                0
            };
            let offset = (stage as u8) * 4;
            out.extend(long_command(CMD_SET_TRIGGER_MASK + offset, self.trigger_mask[stage]));
            out.extend(long_command(CMD_SET_TRIGGER_VALUE + offset, self.trigger_value[stage]));
            out.extend(long_command(CMD_SET_TRIGGER_CONFIG + offset, config));
        }
        out
    }
}

/// Bytes per sample on the wire for the given flags.
pub fn bytes_per_sample(flags: u16) -> usize {
    (0..4).filter(|i| flags & (1 << (2 + i)) == 0).count()
}

/// Reassembles samples as they arrive. The device sends its buffer newest
/// first, so samples are stored from the back.
#[derive(Debug)]
pub struct SampleCollector {
    flags: u16,
    width: usize,
    capacity: usize,
    buf: Vec<u8>,
    received: usize,
    partial: Vec<u8>,
    rle_count: usize,
}

impl SampleCollector {
    pub fn new(capacity: usize, flags: u16) -> Self {
        Self {
            flags,
            width: bytes_per_sample(flags).max(1),
            capacity,
            buf: vec![0; capacity * 4],
            received: 0,
            partial: Vec::with_capacity(4),
            rle_count: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.is_full() {
                return;
            }
            self.partial.push(byte);
            if self.partial.len() == self.width {
                self.complete_sample();
            }
        }
    }

    fn complete_sample(&mut self) {
        let mut raw = std::mem::take(&mut self.partial);
        if self.flags & FLAG_RLE != 0 {
            if let Some(last) = raw.last_mut() {
                if *last & 0x80 != 0 {
                    *last &= 0x7f;
                    let mut count = [0u8; 4];
                    count[..raw.len()].copy_from_slice(&raw);
                    self.rle_count = u32::from_le_bytes(count) as usize;
                    self.partial = raw;
                    self.partial.clear();
                    return;
                }
            }
        }

        let mut sample = [0u8; 4];
        let mut lanes = raw.iter();
        for (i, lane) in sample.iter_mut().enumerate() {
            if self.flags & (1 << (2 + i)) == 0 {
                *lane = lanes.next().copied().unwrap_or(0);
            }
        }

        let repeat = (self.rle_count + 1).min(self.capacity - self.received);
        for _ in 0..repeat {
            self.received += 1;
            let at = (self.capacity - self.received) * 4;
            self.buf[at..at + 4].copy_from_slice(&sample);
        }
        self.rle_count = 0;
        raw.clear();
        self.partial = raw;
    }

    pub fn is_full(&self) -> bool {
        self.received >= self.capacity
    }

    pub fn num_samples(&self) -> usize {
        self.received
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Received samples, oldest first.
    pub fn samples(&self) -> &[u8] {
        &self.buf[(self.capacity - self.received) * 4..]
    }
}
