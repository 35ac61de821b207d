//! Serial transport for drivers of serial instruments.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serialport::{DataBits, Parity, SerialPort, StopBits};

use crate::error::{LabError, Result};

/// Port settings in the usual `baud/<bits><parity><stop>` notation, for
/// example `115200/8n1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: char,
    pub stop_bits: u8,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: 'n',
            stop_bits: 1,
        }
    }
}

impl FromStr for SerialParams {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || LabError::argument(format!("invalid serial parameters '{s}'"));
        let (baud, frame) = s.split_once('/').unwrap_or((s, "8n1"));
        let baud_rate = baud.parse::<u32>().map_err(|_| bad())?;
        let frame: Vec<char> = frame.chars().collect();
        let [bits, parity, stop] = frame.as_slice() else {
            return Err(bad());
        };
        let data_bits = bits.to_digit(10).ok_or_else(bad)? as u8;
        let stop_bits = stop.to_digit(10).ok_or_else(bad)? as u8;
        let parity = parity.to_ascii_lowercase();
        if !(5..=8).contains(&data_bits) || !matches!(parity, 'n' | 'o' | 'e') || !(1..=2).contains(&stop_bits) {
            return Err(bad());
        }
        Ok(Self {
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl fmt::Display for SerialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// An open serial connection.
pub trait SerialLink {
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Whatever has arrived, without blocking. Returns the bytes appended.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize>;

    /// Read until `buf` is full or `timeout` passes. Returns the bytes read.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Drop anything pending in either direction.
    fn clear(&mut self) -> Result<()>;
}

pub trait SerialOpener {
    fn open(&self, port: &str, params: SerialParams) -> Result<Box<dyn SerialLink>>;
}

/// Opens real ports through `serialport`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl SerialOpener for SerialPortOpener {
    fn open(&self, port: &str, params: SerialParams) -> Result<Box<dyn SerialLink>> {
        log::debug!("serial: opening {port} at {params}");
        let data_bits = match params.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match params.parity {
            'o' => Parity::Odd,
            'e' => Parity::Even,
            _ => Parity::None,
        };
        let stop_bits = if params.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let serial = serialport::new(port, params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(10))
            .open()?;
        let mut link = SerialPortLink { serial };
        link.clear()?;
        Ok(Box::new(link))
    }
}

pub struct SerialPortLink {
    serial: Box<dyn SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.serial.write_all(data)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let pending = self.serial.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let start = buf.len();
        buf.resize(start + pending, 0);
        let n = match self.serial.read(&mut buf[start..]) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => {
                buf.truncate(start);
                return Err(e.into());
            }
        };
        buf.truncate(start + n);
        Ok(n)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let start = Instant::now();
        let mut filled = 0;
        while filled < buf.len() && start.elapsed() < timeout {
            match self.serial.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn clear(&mut self) -> Result<()> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

/// Names of the serial ports on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let p: SerialParams = "9600/7e2".parse().unwrap();
        assert_eq!(
            p,
            SerialParams {
                baud_rate: 9600,
                data_bits: 7,
                parity: 'e',
                stop_bits: 2
            }
        );
        assert_eq!(p.to_string(), "9600/7e2");
        let p: SerialParams = "57600".parse().unwrap();
        assert_eq!(p.data_bits, 8);
        assert_eq!(SerialParams::default().to_string(), "115200/8n1");
    }

    #[test]
    fn test_reject_bad_params() {
        assert!("fast/8n1".parse::<SerialParams>().is_err());
        assert!("9600/9n1".parse::<SerialParams>().is_err());
        assert!("9600/8x1".parse::<SerialParams>().is_err());
        assert!("9600/8n".parse::<SerialParams>().is_err());
    }
}
