//! State shared between the receiver- and sender-side statistics: raw
//! counters, the RFC 3550 jitter estimator, the gap histogram, the
//! snapshot/delta machinery and the record of RTCP sender reports anchoring
//! the stream's clock.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ntp::NtpTime;

pub(crate) const FIRST_SNAPSHOT_ID: u32 = 1;

pub(crate) const GAP_HISTOGRAM_NUM_BINS: usize = 101;
pub(crate) const NUM_SEQUENCE_NUMBERS: u64 = 1 << 16;

/// In-order gaps at or above this many packets are logged as suspicious.
pub(crate) const SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD: i64 = 100;

/// For a while after the stream starts, the first packet time may be pushed
/// back when a sender report indicates the first sample left the sender
/// earlier than it was received (pacing, queueing along the path).
pub(crate) const FIRST_PACKET_TIME_ADJUST_WINDOW: Duration = Duration::from_secs(120);
pub(crate) const FIRST_PACKET_TIME_ADJUST_THRESHOLD: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RtpStatsParams {
    /// Negotiated RTP clock rate in Hz.
    pub clock_rate: u32,
}

// ---------------------------------------------------------------------

/// An RTCP sender report as seen by the engine: wire fields plus the 64-bit
/// RTP timestamp extension and the receive time rebased to the local time
/// base. Times are Unix nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpSenderReportData {
    pub ntp_timestamp: NtpTime,
    pub rtp_timestamp: u32,
    pub rtp_timestamp_ext: u64,
    /// Wall-clock receive time of the report.
    pub at: i64,
    /// Receive time rebased to the local time base via propagation delay.
    pub at_adjusted: i64,
    pub packets: u32,
    pub octets: u32,
}

// ---------------------------------------------------------------------

/// Counter baseline anchored at `(start_time, ext_start_sn)`. Maxima
/// (`max_rtt`, `max_jitter`) accumulate while the snapshot is outstanding.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Snapshot {
    pub(crate) is_valid: bool,

    pub(crate) start_time: i64,
    pub(crate) ext_start_sn: u64,

    pub(crate) bytes: u64,
    pub(crate) header_bytes: u64,

    pub(crate) packets_padding: u64,
    pub(crate) bytes_padding: u64,
    pub(crate) header_bytes_padding: u64,

    pub(crate) packets_duplicate: u64,
    pub(crate) bytes_duplicate: u64,
    pub(crate) header_bytes_duplicate: u64,

    pub(crate) packets_lost: u64,
    pub(crate) packets_out_of_order: u64,

    pub(crate) frames: u32,

    pub(crate) nacks: u32,
    pub(crate) plis: u32,
    pub(crate) firs: u32,

    pub(crate) max_rtt: u32,
    pub(crate) max_jitter: f64,
}

/// Interval between two snapshot reads, with counters converted for
/// telemetry. Jitter is in microseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtpDeltaInfo {
    pub start_time: i64,
    pub end_time: i64,
    pub packets: u32,
    pub bytes: u64,
    pub header_bytes: u64,
    pub packets_duplicate: u32,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,
    pub packets_padding: u32,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,
    pub packets_lost: u32,
    pub packets_missing: u32,
    pub packets_out_of_order: u32,
    pub frames: u32,
    pub rtt_max: u32,
    pub jitter_max: f64,
    pub nacks: u32,
    pub plis: u32,
    pub firs: u32,
}

/// Language-neutral mirror of the stream's counters and anchors, for the
/// control plane. Rates are over the stream lifetime; jitter is in
/// microseconds; times are Unix nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpStats {
    pub start_time: i64,
    pub end_time: i64,
    pub duration: f64,

    pub ext_start_sn: u64,
    pub ext_highest_sn: u64,
    pub ext_start_ts: u64,
    pub ext_highest_ts: u64,

    pub packets: u32,
    pub packet_rate: f64,
    pub bytes: u64,
    pub header_bytes: u64,
    pub bitrate: f64,

    pub packets_lost: u32,
    pub packet_loss_rate: f64,
    pub packet_loss_percentage: f32,

    pub packets_duplicate: u32,
    pub packet_duplicate_rate: f64,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,
    pub bitrate_duplicate: f64,

    pub packets_padding: u32,
    pub packet_padding_rate: f64,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,
    pub bitrate_padding: f64,

    pub packets_out_of_order: u32,

    pub frames: u32,
    pub frame_rate: f64,

    pub jitter_current: f64,
    pub jitter_max: f64,

    pub gap_histogram: BTreeMap<u32, u32>,

    pub nacks: u32,
    pub plis: u32,
    pub last_pli: i64,
    pub firs: u32,
    pub last_fir: i64,

    pub rtt_current: u32,
    pub rtt_max: u32,

    pub key_frames: u32,
    pub last_key_frame: i64,
}

// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct RtpStatsBase {
    pub(crate) params: RtpStatsParams,

    pub(crate) initialized: bool,

    pub(crate) start_time: i64,
    pub(crate) end_time: i64,

    pub(crate) first_time: i64,
    pub(crate) highest_time: i64,

    pub(crate) bytes: u64,
    pub(crate) header_bytes: u64,
    pub(crate) bytes_duplicate: u64,
    pub(crate) header_bytes_duplicate: u64,
    pub(crate) bytes_padding: u64,
    pub(crate) header_bytes_padding: u64,

    pub(crate) packets_duplicate: u64,
    pub(crate) packets_padding: u64,
    pub(crate) packets_lost: u64,
    pub(crate) packets_out_of_order: u64,

    pub(crate) frames: u32,

    pub(crate) jitter: f64,
    pub(crate) max_jitter: f64,
    last_transit: Option<i64>,

    pub(crate) gap_histogram: [u32; GAP_HISTOGRAM_NUM_BINS],

    pub(crate) nacks: u32,
    pub(crate) plis: u32,
    pub(crate) last_pli: i64,
    pub(crate) firs: u32,
    pub(crate) last_fir: i64,
    pub(crate) key_frames: u32,
    pub(crate) last_key_frame: i64,

    pub(crate) rtt: u32,
    pub(crate) max_rtt: u32,

    pub(crate) sr_first: Option<RtcpSenderReportData>,
    pub(crate) sr_newest: Option<RtcpSenderReportData>,

    pub(crate) next_snapshot_id: u32,
    pub(crate) snapshots: Vec<Snapshot>,
}

impl RtpStatsBase {
    pub(crate) fn new(params: RtpStatsParams) -> Self {
        RtpStatsBase {
            params,
            initialized: false,
            start_time: 0,
            end_time: 0,
            first_time: 0,
            highest_time: 0,
            bytes: 0,
            header_bytes: 0,
            bytes_duplicate: 0,
            header_bytes_duplicate: 0,
            bytes_padding: 0,
            header_bytes_padding: 0,
            packets_duplicate: 0,
            packets_padding: 0,
            packets_lost: 0,
            packets_out_of_order: 0,
            frames: 0,
            jitter: 0.0,
            max_jitter: 0.0,
            last_transit: None,
            gap_histogram: [0; GAP_HISTOGRAM_NUM_BINS],
            nacks: 0,
            plis: 0,
            last_pli: 0,
            firs: 0,
            last_fir: 0,
            key_frames: 0,
            last_key_frame: 0,
            rtt: 0,
            max_rtt: 0,
            sr_first: None,
            sr_newest: None,
            next_snapshot_id: FIRST_SNAPSHOT_ID,
            snapshots: Vec::new(),
        }
    }

    pub(crate) fn seed(&mut self, from: &RtpStatsBase) -> bool {
        if !from.initialized || self.initialized {
            return false;
        }
        *self = from.clone();
        true
    }

    pub(crate) fn stop(&mut self, now: i64) {
        if self.end_time == 0 {
            self.end_time = now;
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.end_time == 0
    }

    pub(crate) fn update_nack(&mut self, count: u32) {
        self.nacks += count;
    }

    pub(crate) fn update_pli(&mut self, now: i64) {
        self.plis += 1;
        self.last_pli = now;
    }

    pub(crate) fn update_fir(&mut self, now: i64) {
        self.firs += 1;
        self.last_fir = now;
    }

    pub(crate) fn update_key_frame(&mut self, now: i64) {
        self.key_frames += 1;
        self.last_key_frame = now;
    }

    // ------------------------------------------------------------------
    // snapshot machinery

    pub(crate) fn new_snapshot_id(&mut self, ext_start_sn: u64, now: i64) -> u32 {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;

        let needed = (self.next_snapshot_id - FIRST_SNAPSHOT_ID) as usize;
        if self.snapshots.len() < needed {
            self.snapshots.resize(needed, Snapshot::default());
        }

        if self.initialized {
            let snapshot = self.init_snapshot(now, ext_start_sn);
            self.snapshots[(id - FIRST_SNAPSHOT_ID) as usize] = snapshot;
        }
        id
    }

    pub(crate) fn init_snapshot(&self, start_time: i64, ext_start_sn: u64) -> Snapshot {
        Snapshot {
            is_valid: true,
            start_time,
            ext_start_sn,
            ..Default::default()
        }
    }

    fn get_snapshot(&self, start_time: i64, ext_start_sn: u64) -> Snapshot {
        Snapshot {
            is_valid: true,
            start_time,
            ext_start_sn,
            bytes: self.bytes,
            header_bytes: self.header_bytes,
            packets_padding: self.packets_padding,
            bytes_padding: self.bytes_padding,
            header_bytes_padding: self.header_bytes_padding,
            packets_duplicate: self.packets_duplicate,
            bytes_duplicate: self.bytes_duplicate,
            header_bytes_duplicate: self.header_bytes_duplicate,
            packets_lost: self.packets_lost,
            packets_out_of_order: self.packets_out_of_order,
            frames: self.frames,
            nacks: self.nacks,
            plis: self.plis,
            firs: self.firs,
            max_rtt: self.rtt,
            max_jitter: self.jitter,
        }
    }

    /// Returns `(then, now)` for the given snapshot and re-anchors the slot
    /// at the current state.
    pub(crate) fn get_and_reset_snapshot(
        &mut self,
        snapshot_id: u32,
        ext_start_sn: u64,
        ext_highest_sn: u64,
        now: i64,
    ) -> Option<(Snapshot, Snapshot)> {
        if !self.initialized {
            return None;
        }

        let idx = snapshot_id.checked_sub(FIRST_SNAPSHOT_ID)? as usize;
        if idx >= self.snapshots.len() {
            return None;
        }

        let mut then = self.snapshots[idx];
        if !then.is_valid {
            then = self.init_snapshot(self.start_time, ext_start_sn);
            self.snapshots[idx] = then;
        }

        let now_snapshot = self.get_snapshot(now, ext_highest_sn + 1);
        self.snapshots[idx] = now_snapshot;
        Some((then, now_snapshot))
    }

    pub(crate) fn delta_info(
        &mut self,
        snapshot_id: u32,
        ext_start_sn: u64,
        ext_highest_sn: u64,
        now: i64,
    ) -> Option<RtpDeltaInfo> {
        let (then, now_snapshot) =
            self.get_and_reset_snapshot(snapshot_id, ext_start_sn, ext_highest_sn, now)?;

        let start_time = then.start_time;
        let end_time = now_snapshot.start_time;

        let packets_expected = now_snapshot.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if packets_expected > NUM_SEQUENCE_NUMBERS {
            warn!(
                "too many packets expected in delta, start: {}, end: {}, expected: {}",
                then.ext_start_sn, now_snapshot.ext_start_sn, packets_expected,
            );
            return None;
        }
        if packets_expected == 0 {
            return Some(RtpDeltaInfo {
                start_time,
                end_time,
                ..Default::default()
            });
        }

        let mut packets_lost = now_snapshot.packets_lost.wrapping_sub(then.packets_lost) as i64;
        if packets_lost < 0 {
            packets_lost = 0;
        }
        if packets_lost as u64 > packets_expected {
            warn!(
                "unexpected number of packets lost in delta, expected: {}, lost: {}",
                packets_expected, packets_lost,
            );
            packets_lost = packets_expected as i64;
        }

        Some(RtpDeltaInfo {
            start_time,
            end_time,
            packets: (packets_expected as u32)
                .saturating_sub((now_snapshot.packets_padding - then.packets_padding) as u32),
            bytes: now_snapshot.bytes - then.bytes,
            header_bytes: now_snapshot.header_bytes - then.header_bytes,
            packets_duplicate: (now_snapshot.packets_duplicate - then.packets_duplicate) as u32,
            bytes_duplicate: now_snapshot.bytes_duplicate - then.bytes_duplicate,
            header_bytes_duplicate: now_snapshot.header_bytes_duplicate
                - then.header_bytes_duplicate,
            packets_padding: (now_snapshot.packets_padding - then.packets_padding) as u32,
            bytes_padding: now_snapshot.bytes_padding - then.bytes_padding,
            header_bytes_padding: now_snapshot.header_bytes_padding - then.header_bytes_padding,
            packets_lost: packets_lost as u32,
            packets_missing: 0,
            packets_out_of_order: (now_snapshot.packets_out_of_order - then.packets_out_of_order)
                as u32,
            frames: now_snapshot.frames - then.frames,
            rtt_max: then.max_rtt,
            jitter_max: then.max_jitter / self.params.clock_rate as f64 * 1e6,
            nacks: now_snapshot.nacks - then.nacks,
            plis: now_snapshot.plis - then.plis,
            firs: now_snapshot.firs - then.firs,
        })
    }

    // ------------------------------------------------------------------
    // estimators

    /// RFC 3550 inter-arrival jitter, in RTP clock ticks. Snapshots track
    /// their own running maximum.
    pub(crate) fn update_jitter(&mut self, ext_ts: u64, packet_time: i64) -> f64 {
        let packet_time_rtp =
            (packet_time as i128 * self.params.clock_rate as i128 / 1_000_000_000) as i64;
        let transit = packet_time_rtp - ext_ts as i64;

        if let Some(last_transit) = self.last_transit {
            let d = (transit - last_transit).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
            if self.jitter > self.max_jitter {
                self.max_jitter = self.jitter;
            }

            let jitter = self.jitter;
            for s in &mut self.snapshots {
                if jitter > s.max_jitter {
                    s.max_jitter = jitter;
                }
            }
        }
        self.last_transit = Some(transit);
        self.jitter
    }

    pub(crate) fn update_gap_histogram(&mut self, gap: i64) {
        let missing = gap - 1;
        if missing < 1 {
            return;
        }

        if (missing as usize) < GAP_HISTOGRAM_NUM_BINS {
            self.gap_histogram[missing as usize - 1] += 1;
        } else {
            self.gap_histogram[GAP_HISTOGRAM_NUM_BINS - 1] += 1;
        }
    }

    /// Primary (non-padding) packets accounted for so far.
    pub(crate) fn total_packets_primary(&self, ext_start_sn: u64, ext_highest_sn: u64) -> u64 {
        let packets_expected = ext_highest_sn.wrapping_sub(ext_start_sn).wrapping_add(1);
        if self.packets_lost > packets_expected {
            return 0;
        }

        let packets_seen = packets_expected - self.packets_lost;
        if self.packets_padding > packets_seen {
            return 0;
        }
        packets_seen - self.packets_padding
    }

    /// Pushes the first packet time back when a sender report shows that the
    /// start of the stream left the sender earlier than it arrived here.
    /// Only adjusts downwards, only within a window after stream start.
    pub(crate) fn maybe_adjust_first_packet_time(
        &mut self,
        sr_data: &RtcpSenderReportData,
        ts_offset: u64,
        ext_start_ts: u64,
        now: i64,
    ) -> Result<()> {
        if now - self.start_time > FIRST_PACKET_TIME_ADJUST_WINDOW.as_nanos() as i64 {
            return Ok(());
        }

        let samples_diff = sr_data
            .rtp_timestamp_ext
            .wrapping_sub(ts_offset)
            .wrapping_sub(ext_start_ts) as i64;
        if samples_diff < 0 {
            // the report refers to media sent before the start, skip
            return Ok(());
        }

        let samples_duration =
            (samples_diff as i128 * 1_000_000_000 / self.params.clock_rate as i128) as i64;
        let first_time = sr_data.at_adjusted - samples_duration;
        if first_time < self.first_time {
            if self.first_time - first_time > FIRST_PACKET_TIME_ADJUST_THRESHOLD.as_nanos() as i64 {
                return Err(Error::ErrFirstPacketTimeAdjustTooBig);
            }
            self.first_time = first_time;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // views

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn as_stats(
        &self,
        now: i64,
        ext_start_sn: u64,
        ext_highest_sn: u64,
        ext_start_ts: u64,
        ext_highest_ts: u64,
        packets_lost: u64,
        jitter: f64,
        max_jitter: f64,
    ) -> RtpStats {
        if !self.initialized {
            return RtpStats::default();
        }

        let end_time = if self.end_time != 0 { self.end_time } else { now };
        let elapsed = ((end_time - self.start_time).max(1)) as f64 / 1e9;

        let packets = self.total_packets_primary(ext_start_sn, ext_highest_sn) as u32;
        let packets_expected = packets as u64 + packets_lost;

        let mut gap_histogram = BTreeMap::new();
        for (i, count) in self.gap_histogram.iter().enumerate() {
            if *count > 0 {
                gap_histogram.insert(i as u32 + 1, *count);
            }
        }

        RtpStats {
            start_time: self.start_time,
            end_time: self.end_time,
            duration: elapsed,
            ext_start_sn,
            ext_highest_sn,
            ext_start_ts,
            ext_highest_ts,
            packets,
            packet_rate: packets as f64 / elapsed,
            bytes: self.bytes,
            header_bytes: self.header_bytes,
            bitrate: self.bytes as f64 * 8.0 / elapsed,
            packets_lost: packets_lost.min(u32::MAX as u64) as u32,
            packet_loss_rate: packets_lost as f64 / elapsed,
            packet_loss_percentage: if packets_expected != 0 {
                packets_lost as f32 / packets_expected as f32 * 100.0
            } else {
                0.0
            },
            packets_duplicate: self.packets_duplicate as u32,
            packet_duplicate_rate: self.packets_duplicate as f64 / elapsed,
            bytes_duplicate: self.bytes_duplicate,
            header_bytes_duplicate: self.header_bytes_duplicate,
            bitrate_duplicate: self.bytes_duplicate as f64 * 8.0 / elapsed,
            packets_padding: self.packets_padding as u32,
            packet_padding_rate: self.packets_padding as f64 / elapsed,
            bytes_padding: self.bytes_padding,
            header_bytes_padding: self.header_bytes_padding,
            bitrate_padding: self.bytes_padding as f64 * 8.0 / elapsed,
            packets_out_of_order: self.packets_out_of_order as u32,
            frames: self.frames,
            frame_rate: self.frames as f64 / elapsed,
            jitter_current: jitter / self.params.clock_rate as f64 * 1e6,
            jitter_max: max_jitter / self.params.clock_rate as f64 * 1e6,
            gap_histogram,
            nacks: self.nacks,
            plis: self.plis,
            last_pli: self.last_pli,
            firs: self.firs,
            last_fir: self.last_fir,
            rtt_current: self.rtt,
            rtt_max: self.max_rtt,
            key_frames: self.key_frames,
            last_key_frame: self.last_key_frame,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn fmt_summary(
        &self,
        f: &mut fmt::Formatter<'_>,
        ext_start_sn: u64,
        ext_highest_sn: u64,
        ext_start_ts: u64,
        ext_highest_ts: u64,
        packets_lost: u64,
        jitter: f64,
        max_jitter: f64,
    ) -> fmt::Result {
        write!(
            f,
            "t: [{} - {}], sn: [{} - {}], ts: [{} - {}], p: {}, l: {}, d: {}, pp: {}, ooo: {}, \
             f: {}, j: {:.1}/{:.1}, rtt: {}/{}, n: {}, pli: {}, fir: {}",
            self.start_time,
            self.end_time,
            ext_start_sn,
            ext_highest_sn,
            ext_start_ts,
            ext_highest_ts,
            self.total_packets_primary(ext_start_sn, ext_highest_sn),
            packets_lost,
            self.packets_duplicate,
            self.packets_padding,
            self.packets_out_of_order,
            self.frames,
            jitter,
            max_jitter,
            self.rtt,
            self.max_rtt,
            self.nacks,
            self.plis,
            self.firs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RtpStatsParams {
        RtpStatsParams { clock_rate: 90000 }
    }

    #[test]
    fn test_gap_histogram_buckets() {
        let mut b = RtpStatsBase::new(params());
        b.update_gap_histogram(1); // no missing packets
        b.update_gap_histogram(2); // one missing
        b.update_gap_histogram(2);
        b.update_gap_histogram(5); // four missing
        b.update_gap_histogram(100_000); // overflow bucket

        assert_eq!(b.gap_histogram[0], 2);
        assert_eq!(b.gap_histogram[3], 1);
        assert_eq!(b.gap_histogram[GAP_HISTOGRAM_NUM_BINS - 1], 1);
        assert_eq!(b.gap_histogram.iter().sum::<u32>(), 4);
    }

    #[test]
    fn test_jitter_per_rfc3550() {
        let mut b = RtpStatsBase::new(params());
        let t0 = 1_700_000_000 * 1_000_000_000i64;

        b.update_jitter(42_378_934, t0);
        // one second later, but the RTP timestamp only advanced 60000 of the
        // expected 90000 ticks
        let jitter = b.update_jitter(42_378_934 + 60_000, t0 + 1_000_000_000);
        assert_eq!(jitter as u32, 30_000 / 16);
        assert_eq!(b.max_jitter as u32, 30_000 / 16);
    }

    #[test]
    fn test_total_packets_primary() {
        let mut b = RtpStatsBase::new(params());
        b.packets_lost = 10;
        b.packets_padding = 5;
        assert_eq!(b.total_packets_primary(1, 100), 85);

        b.packets_lost = 200;
        assert_eq!(b.total_packets_primary(1, 100), 0);
    }

    #[test]
    fn test_snapshot_ids_are_sequential() {
        let mut b = RtpStatsBase::new(params());
        let a = b.new_snapshot_id(0, 0);
        let c = b.new_snapshot_id(0, 0);
        assert_eq!(c, a + 1);
        assert_eq!(b.snapshots.len(), 2);
    }

    #[test]
    fn test_first_packet_time_adjustment() {
        let now = 1_700_000_000 * 1_000_000_000i64;
        let mut b = RtpStatsBase::new(params());
        b.initialized = true;
        b.start_time = now;
        b.first_time = now;

        // the report stands one second of samples after the start, at the
        // time we started: the first sample left one second early
        let sr = RtcpSenderReportData {
            rtp_timestamp_ext: 90_000,
            at_adjusted: now,
            ..Default::default()
        };
        b.maybe_adjust_first_packet_time(&sr, 0, 0, now).unwrap();
        assert_eq!(b.first_time, now - 1_000_000_000);

        // an adjustment beyond the threshold is rejected
        let sr = RtcpSenderReportData {
            rtp_timestamp_ext: 90_000 * 1_000,
            at_adjusted: now,
            ..Default::default()
        };
        assert_eq!(
            b.maybe_adjust_first_packet_time(&sr, 0, 0, now),
            Err(Error::ErrFirstPacketTimeAdjustTooBig)
        );
        assert_eq!(b.first_time, now - 1_000_000_000);
    }
}
