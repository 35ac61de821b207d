//! fx2lafw firmware command set.

use crate::error::{LabError, Result};
use crate::usb::{UsbError, UsbHandle};

pub const USB_INTERFACE: u8 = 0;
pub const USB_CONFIGURATION: u8 = 1;
/// Bulk IN endpoint 2.
pub const BULK_ENDPOINT: u8 = 0x82;

pub const REQUIRED_VERSION_MAJOR: u8 = 1;

const CMD_GET_FW_VERSION: u8 = 0xb0;
const CMD_START: u8 = 0xb1;
const CMD_GET_REVID_VERSION: u8 = 0xb2;

pub const START_FLAGS_SAMPLE_16BIT: u8 = 1 << 5;
pub const START_FLAGS_CLK_48MHZ: u8 = 1 << 6;

const MAX_SAMPLE_DELAY: u64 = 6 * 256;
const MAX_16BIT_SAMPLERATE: u64 = 12_000_000;

const MHZ_48: u64 = 48_000_000;
const MHZ_30: u64 = 30_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
}

pub fn get_fw_version(handle: &mut dyn UsbHandle) -> std::result::Result<VersionInfo, UsbError> {
    let mut buf = [0u8; 2];
    let n = handle.control_in(CMD_GET_FW_VERSION, 0, 0, &mut buf)?;
    if n != buf.len() {
        return Err(UsbError::Short {
            expected: buf.len(),
            actual: n,
        });
    }
    Ok(VersionInfo {
        major: buf[0],
        minor: buf[1],
    })
}

pub fn get_revid_version(handle: &mut dyn UsbHandle) -> std::result::Result<u8, UsbError> {
    let mut buf = [0u8; 1];
    let n = handle.control_in(CMD_GET_REVID_VERSION, 0, 0, &mut buf)?;
    if n != buf.len() {
        return Err(UsbError::Short {
            expected: buf.len(),
            actual: n,
        });
    }
    Ok(buf[0])
}

/// Payload of the start command: flags, then the GPIF sample delay
/// big-endian. The 48 MHz clock is preferred when it divides the rate and
/// the delay fits, the 30 MHz clock otherwise.
pub fn start_command(samplerate: u64, sample_wide: bool) -> Result<[u8; 3]> {
    if samplerate == 0 {
        return Err(LabError::Samplerate(samplerate));
    }
    if sample_wide && samplerate > MAX_16BIT_SAMPLERATE {
        log::error!("fx2lafw: unable to sample at {samplerate} Hz with 16-bit samples");
        return Err(LabError::Samplerate(samplerate));
    }

    let mut flags = 0u8;
    let mut delay = 0u64;
    if MHZ_48 % samplerate == 0 {
        flags = START_FLAGS_CLK_48MHZ;
        delay = MHZ_48 / samplerate - 1;
        if delay > MAX_SAMPLE_DELAY {
            delay = 0;
        }
    }
    if delay == 0 && MHZ_30 % samplerate == 0 {
        flags = 0;
        delay = MHZ_30 / samplerate - 1;
    }

    log::debug!(
        "fx2lafw: GPIF delay = {delay}, clocksource = {}MHz",
        if flags & START_FLAGS_CLK_48MHZ != 0 { 48 } else { 30 }
    );

    if delay == 0 || delay > MAX_SAMPLE_DELAY {
        log::error!("fx2lafw: unable to sample at {samplerate} Hz");
        return Err(LabError::Samplerate(samplerate));
    }
    if sample_wide {
        flags |= START_FLAGS_SAMPLE_16BIT;
    }
    Ok([flags, (delay >> 8) as u8, (delay & 0xff) as u8])
}

pub fn start_acquisition(
    handle: &mut dyn UsbHandle,
    samplerate: u64,
    sample_wide: bool,
) -> Result<()> {
    let cmd = start_command(samplerate, sample_wide)?;
    handle.control_out(CMD_START, 0, 0, &cmd).map_err(|e| {
        log::error!("fx2lafw: unable to send start command: {e}");
        LabError::from(e)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_48mhz_clock_preferred() {
        assert_eq!(start_command(24_000_000, false).unwrap(), [START_FLAGS_CLK_48MHZ, 0, 1]);
        assert_eq!(start_command(1_000_000, false).unwrap(), [START_FLAGS_CLK_48MHZ, 0, 47]);
    }

    #[test]
    fn test_slow_rates_fall_back_to_30mhz() {
        // 48 MHz / 20 kHz needs a delay of 2399, too long for the GPIF.
        assert_eq!(start_command(20_000, false).unwrap(), [0, 0x05, 0xdb]);
    }

    #[test]
    fn test_wide_flag() {
        let cmd = start_command(1_000_000, true).unwrap();
        assert_eq!(cmd[0], START_FLAGS_CLK_48MHZ | START_FLAGS_SAMPLE_16BIT);
        assert!(start_command(16_000_000, true).is_err());
    }

    #[test]
    fn test_unreachable_rates() {
        assert!(matches!(start_command(48_000_000, false), Err(LabError::Samplerate(_))));
        assert!(start_command(7, false).is_err());
        assert!(start_command(0, false).is_err());
    }
}
