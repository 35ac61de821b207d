//! Ready-made datafeed consumer that keeps a whole run in memory and turns
//! it into a `polars` DataFrame.

use std::cell::RefCell;
use std::rc::Rc;

use polars::prelude::*;

use crate::datafeed::{Packet, PacketType};
use crate::device::DeviceInstance;
use crate::session::Session;

pub const TIME_COLUMN_NAME: &str = "time";
pub const RAW_COLUMN_NAME: &str = "raw";

/// Everything one device sent during a run.
#[derive(Debug, Clone, Default)]
pub struct LogicCapture {
    pub samplerate: u64,
    pub num_logic_probes: usize,
    /// Zero until the first Logic packet.
    pub unitsize: u16,
    pub logic: Vec<u8>,
    /// One series per analog probe.
    pub analog: Vec<Vec<f32>>,
    /// Sample index at which the Trigger packet arrived.
    pub trigger_at: Option<u64>,
    pub packets: Vec<PacketType>,
    analog_channel: usize,
}

impl LogicCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every packet `dev` produces in `session`.
    pub fn attach(session: &mut Session, dev: &DeviceInstance) -> Rc<RefCell<Self>> {
        let capture = Rc::new(RefCell::new(Self::new()));
        let sink = Rc::clone(&capture);
        let dev = dev.clone();
        session.datafeed_callback_add(move |from, packet| {
            if from.ptr_eq(&dev) {
                sink.borrow_mut().record(packet);
            }
        });
        capture
    }

    pub fn record(&mut self, packet: &Packet<'_>) {
        self.packets.push(packet.packet_type());
        match packet {
            Packet::Header(header) => {
                *self = Self {
                    samplerate: header.samplerate,
                    num_logic_probes: header.num_logic_probes.max(0) as usize,
                    analog: vec![Vec::new(); header.num_analog_probes.max(0) as usize],
                    packets: vec![PacketType::Header],
                    ..Self::default()
                };
            }
            Packet::Meta(_) | Packet::End => {}
            Packet::Trigger => {
                if self.trigger_at.is_none() {
                    self.trigger_at = Some(self.num_samples());
                }
            }
            Packet::Logic(logic) => {
                if self.unitsize == 0 {
                    self.unitsize = logic.unitsize;
                }
                if logic.unitsize != self.unitsize {
                    log::warn!(
                        "capture: dropped logic with unitsize {} (expected {})",
                        logic.unitsize,
                        self.unitsize
                    );
                    return;
                }
                self.logic.extend_from_slice(logic.data);
                self.analog_channel = 0;
            }
            Packet::Analog(analog) => {
                if self.analog.len() <= self.analog_channel {
                    self.analog.resize(self.analog_channel + 1, Vec::new());
                }
                self.analog[self.analog_channel].extend_from_slice(analog.data);
                self.analog_channel += 1;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.packets.last() == Some(&PacketType::End)
    }

    pub fn num_samples(&self) -> u64 {
        if self.unitsize == 0 {
            return 0;
        }
        (self.logic.len() / usize::from(self.unitsize)) as u64
    }

    /// Sample `index` as an integer, first byte least significant.
    pub fn sample(&self, index: u64) -> Option<u64> {
        let unitsize = usize::from(self.unitsize);
        let start = usize::try_from(index).ok()?.checked_mul(unitsize)?;
        let bytes = self.logic.get(start..start + unitsize)?;
        Some(
            bytes
                .iter()
                .take(8)
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        )
    }

    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.num_samples()).filter_map(|i| self.sample(i))
    }

    /// One row per sample: `time` in seconds, the `raw` sample value and a
    /// `bit_N` column per logic probe. Analog probes whose series covers
    /// every sample are added as `analog_N`.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let raw: Vec<u64> = self.samples().collect();
        let height = raw.len();
        let seconds_per_sample = if self.samplerate == 0 {
            1.0
        } else {
            1.0 / self.samplerate as f64
        };

        let mut df = DataFrame::new(vec![Series::new(RAW_COLUMN_NAME.into(), raw.clone()).into()])?
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([(col("row_index").cast(DataType::Float64) * lit(seconds_per_sample))
                .alias(TIME_COLUMN_NAME)])
            .select([col(TIME_COLUMN_NAME), col(RAW_COLUMN_NAME)])
            .collect()?;

        let num_bits = self
            .num_logic_probes
            .min(usize::from(self.unitsize) * 8)
            .min(64);
        for bit in 0..num_bits {
            let values: Vec<bool> = raw.iter().map(|v| (v >> bit) & 1 == 1).collect();
            let column: Column = Series::new(format!("bit_{bit}").into(), values).into();
            df.with_column(column)?;
        }

        for (i, series) in self.analog.iter().enumerate() {
            if series.len() != height {
                log::debug!(
                    "capture: analog probe {i} has {} values for {height} samples, skipped",
                    series.len()
                );
                continue;
            }
            let column: Column = Series::new(format!("analog_{i}").into(), series.as_slice()).into();
            df.with_column(column)?;
        }
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::{Analog, Header, Logic, MeasuredQuantity, Unit};

    fn run(capture: &mut LogicCapture) {
        capture.record(&Packet::Header(Header::new(1000, 4, 1)));
        capture.record(&Packet::Logic(Logic::new(1, &[0b0001, 0b0010])));
        capture.record(&Packet::Analog(Analog::new(
            MeasuredQuantity::Voltage,
            Unit::Volt,
            &[0.5, 1.0],
        )));
        capture.record(&Packet::Trigger);
        capture.record(&Packet::Logic(Logic::new(1, &[0b0101])));
        capture.record(&Packet::Analog(Analog::new(
            MeasuredQuantity::Voltage,
            Unit::Volt,
            &[1.5],
        )));
        capture.record(&Packet::End);
    }

    #[test]
    fn test_records_a_run() {
        let mut capture = LogicCapture::new();
        run(&mut capture);
        assert!(capture.is_complete());
        assert_eq!(capture.num_samples(), 3);
        assert_eq!(capture.trigger_at, Some(2));
        assert_eq!(capture.samples().collect::<Vec<u64>>(), [1u64, 2, 5]);
        assert_eq!(capture.analog, vec![vec![0.5f32, 1.0, 1.5]]);
        assert_eq!(capture.packets.len(), 7);
    }

    #[test]
    fn test_header_starts_over() {
        let mut capture = LogicCapture::new();
        run(&mut capture);
        capture.record(&Packet::Header(Header::new(50, 8, 0)));
        assert_eq!(capture.num_samples(), 0);
        assert_eq!(capture.samplerate, 50);
        assert_eq!(capture.packets, [PacketType::Header]);
    }

    #[test]
    fn test_wide_samples_are_little_endian() {
        let mut capture = LogicCapture::new();
        capture.record(&Packet::Header(Header::new(1, 16, 0)));
        capture.record(&Packet::Logic(Logic::new(2, &[0x34, 0x12, 0xff, 0x00])));
        capture.record(&Packet::Logic(Logic::new(1, &[0x01])));
        assert_eq!(capture.samples().collect::<Vec<_>>(), [0x1234, 0x00ff]);
        assert_eq!(capture.sample(2), None);
    }

    #[test]
    fn test_dataframe() {
        let mut capture = LogicCapture::new();
        run(&mut capture);
        let df = capture.to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.width(), 2 + 4 + 1);
        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(time.get(2), Some(0.002));
        let bit0 = df.column("bit_0").unwrap().bool().unwrap();
        assert_eq!(bit0.get(0), Some(true));
        assert_eq!(bit0.get(1), Some(false));
        let bit2 = df.column("bit_2").unwrap().bool().unwrap();
        assert_eq!(bit2.get(2), Some(true));
    }
}
