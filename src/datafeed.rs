//! Datafeed packets: the typed stream every driver produces and every
//! consumer receives.
//!
//! Payloads borrow from the producer. A consumer sees a packet only for the
//! duration of its callback and must copy anything it wants to keep.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::capability::ConfigOption;

pub const FEED_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Header = 10000,
    End = 10001,
    Meta = 10002,
    Trigger = 10003,
    Logic = 10004,
    Analog = 10005,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub feed_version: i32,
    pub start_time: SystemTime,
    pub samplerate: u64,
    pub num_logic_probes: i32,
    pub num_analog_probes: i32,
}

impl Header {
    pub fn new(samplerate: u64, num_logic_probes: usize, num_analog_probes: usize) -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
            samplerate,
            num_logic_probes: num_logic_probes as i32,
            num_analog_probes: num_analog_probes as i32,
        }
    }

    /// Start time as `(seconds, microseconds)` since the Unix epoch.
    pub fn start_time_parts(&self) -> (u64, u32) {
        let since = self.start_time.duration_since(UNIX_EPOCH).unwrap_or_default();
        (since.as_secs(), since.subsec_micros())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Logic<'a> {
    /// Bytes per sample slice.
    pub unitsize: u16,
    pub data: &'a [u8],
}

impl<'a> Logic<'a> {
    pub fn new(unitsize: u16, data: &'a [u8]) -> Self {
        Self { unitsize, data }
    }

    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn num_samples(&self) -> u64 {
        if self.unitsize == 0 {
            return 0;
        }
        self.length() / u64::from(self.unitsize)
    }
}

impl fmt::Debug for Logic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logic")
            .field("length", &self.data.len())
            .field("unitsize", &self.unitsize)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasuredQuantity {
    Voltage,
    Current,
    Resistance,
    Capacitance,
    Temperature,
    Frequency,
    DutyCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Kelvin,
    Celsius,
    Hertz,
    Percentage,
}

#[derive(Clone, Copy, PartialEq)]
pub struct Analog<'a> {
    pub mq: MeasuredQuantity,
    pub unit: Unit,
    pub data: &'a [f32],
}

impl<'a> Analog<'a> {
    pub fn new(mq: MeasuredQuantity, unit: Unit, data: &'a [f32]) -> Self {
        Self { mq, unit, data }
    }

    pub fn num_samples(&self) -> u32 {
        self.data.len() as u32
    }
}

impl fmt::Debug for Analog<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analog")
            .field("num_samples", &self.data.len())
            .field("mq", &self.mq)
            .field("unit", &self.unit)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet<'a> {
    Header(Header),
    Meta(&'a [ConfigOption]),
    Trigger,
    Logic(Logic<'a>),
    Analog(Analog<'a>),
    End,
}

impl Packet<'_> {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Header(_) => PacketType::Header,
            Self::Meta(_) => PacketType::Meta,
            Self::Trigger => PacketType::Trigger,
            Self::Logic(_) => PacketType::Logic,
            Self::Analog(_) => PacketType::Analog,
            Self::End => PacketType::End,
        }
    }

    /// Trigger, Logic and Analog carry acquisition data; the rest frame it.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Trigger | Self::Logic(_) | Self::Analog(_))
    }
}

impl fmt::Display for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(h) => write!(
                f,
                "HEADER (feed version {}, samplerate {}, {} logic / {} analog probes)",
                h.feed_version, h.samplerate, h.num_logic_probes, h.num_analog_probes
            ),
            Self::Meta(options) => write!(f, "META ({} options)", options.len()),
            Self::Trigger => f.write_str("TRIGGER"),
            Self::Logic(l) => write!(f, "LOGIC ({} bytes, unitsize {})", l.length(), l.unitsize),
            Self::Analog(a) => write!(f, "ANALOG ({} samples)", a.num_samples()),
            Self::End => f.write_str("END"),
        }
    }
}
