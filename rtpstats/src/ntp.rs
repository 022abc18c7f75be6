//! 64-bit NTP timestamps (RFC 5905 32.32 fixed point) and the RTT
//! extraction used when consuming reception reports.

use rtcp::reception_report::ReceptionReport;

use crate::error::{Error, Result};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_EPOCH_OFFSET_SECS: u64 = 0x83AA_7E80;

/// An NTP timestamp: seconds since 1900 in the upper 32 bits, fraction of a
/// second in the lower 32 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTime(u64);

impl NtpTime {
    pub fn from_unix_nanos(nanos: i64) -> Self {
        let secs = (nanos / 1_000_000_000) as u64 + NTP_EPOCH_OFFSET_SECS;
        let frac = (((nanos % 1_000_000_000) as u64) << 32) / 1_000_000_000;
        NtpTime((secs << 32) | frac)
    }

    pub fn as_unix_nanos(self) -> i64 {
        let secs = (self.0 >> 32) as i64 - NTP_EPOCH_OFFSET_SECS as i64;
        let nanos = ((self.0 & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        secs * 1_000_000_000 + nanos as i64
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The middle 32 bits, i.e. the LSR/DLSR wire representation.
    pub fn middle_32(self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for NtpTime {
    fn from(v: u64) -> Self {
        NtpTime(v)
    }
}

impl From<NtpTime> for u64 {
    fn from(t: NtpTime) -> Self {
        t.0
    }
}

/// Round-trip time from a reception report, against the sender report the
/// report refers to. `sr_at` is when that sender report was sent/recorded,
/// `now` is the arrival time of the reception report, both in Unix
/// nanoseconds.
///
/// RFC 3550: `RTT = A - LSR - DLSR`, with DLSR in 1/65536 second units.
pub fn rtt_from_reception_report(
    rr: &ReceptionReport,
    sr_ntp: NtpTime,
    sr_at: i64,
    now: i64,
) -> Result<u32> {
    if rr.last_sender_report == 0 {
        return Err(Error::ErrRttNoLastSenderReport);
    }
    if rr.last_sender_report != sr_ntp.middle_32() {
        return Err(Error::ErrRttNotLastSenderReport);
    }

    let dlsr_nanos = (rr.delay as i64) * 1_000_000_000 / 65536;
    let rtt_nanos = (now - sr_at) - dlsr_nanos;
    if rtt_nanos < 0 {
        return Err(Error::ErrRttNegative);
    }
    Ok((rtt_nanos / 1_000_000) as u32)
}
