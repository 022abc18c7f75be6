//! Subscriber-side RTP statistics: driven with already-extended sequence
//! numbers and timestamps by the forwarding path, keeps a per-sequence-number
//! metadata ring to reconstruct interval statistics between receiver
//! reports, and synthesizes outgoing sender reports on the publisher's
//! report clock.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;

use crate::base::{
    RtcpSenderReportData, RtpDeltaInfo, RtpStats, RtpStatsBase, RtpStatsParams,
    NUM_SEQUENCE_NUMBERS, SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD,
};
use crate::error::{Error, Result};
use crate::ntp::{self, NtpTime};

/// Size of the per-sequence-number metadata ring.
pub const SN_INFO_SIZE: u64 = 4096;
const SN_INFO_MASK: u64 = SN_INFO_SIZE - 1;

/// Suggested wait before generating the first sender report for a stream.
pub const SR_INITIAL_WAIT: Duration = Duration::from_secs(1);

// -------------------------------------------------------------------

const SN_INFO_FLAG_MARKER: u8 = 1 << 0;
const SN_INFO_FLAG_PADDING: u8 = 1 << 1;
const SN_INFO_FLAG_OUT_OF_ORDER: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, Default)]
struct SnInfo {
    pkt_size: u16,
    hdr_size: u8,
    flags: u8,
}

// -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct IntervalStats {
    packets: u64,
    bytes: u64,
    header_bytes: u64,
    packets_padding: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_lost: u64,
    packets_out_of_order: u64,
    frames: u32,
    packets_not_found: u64,
}

impl IntervalStats {
    fn aggregate(&mut self, other: &IntervalStats) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.header_bytes += other.header_bytes;
        self.packets_padding += other.packets_padding;
        self.bytes_padding += other.bytes_padding;
        self.header_bytes_padding += other.header_bytes_padding;
        self.packets_lost += other.packets_lost;
        self.packets_out_of_order += other.packets_out_of_order;
        self.frames += other.frames;
        self.packets_not_found += other.packets_not_found;
    }
}

impl fmt::Display for IntervalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p: {}, b: {}, hb: {}, pp: {}, bp: {}, hbp: {}, pl: {}, pooo: {}, f: {}, pnf: {}",
            self.packets,
            self.bytes,
            self.header_bytes,
            self.packets_padding,
            self.bytes_padding,
            self.header_bytes_padding,
            self.packets_lost,
            self.packets_out_of_order,
            self.frames,
            self.packets_not_found,
        )
    }
}

// -------------------------------------------------------------------

/// Snapshot anchored at receiver-report arrivals. Interval statistics are
/// accumulated on every receiver report rather than at read time.
#[derive(Debug, Clone, Copy, Default)]
struct SenderSnapshot {
    is_valid: bool,

    start_time: i64,

    ext_start_sn: u64,
    bytes: u64,
    header_bytes: u64,

    packets_padding: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,

    packets_duplicate: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,

    packets_out_of_order: u64,

    packets_lost_feed: u64,
    packets_lost: u64,

    frames: u32,

    nacks: u32,
    plis: u32,
    firs: u32,

    max_rtt: u32,
    max_jitter_feed: f64,
    max_jitter: f64,

    ext_last_rr_sn: u64,
    interval_stats: IntervalStats,
}

// -------------------------------------------------------------------

pub struct RtpStatsSender {
    base: RtpStatsBase,

    ext_start_sn: u64,
    ext_highest_sn: u64,
    ext_highest_sn_from_rr: u64,

    last_rr_time: i64,
    last_rr: Option<ReceptionReport>,

    ext_start_ts: u64,
    ext_highest_ts: u64,

    packets_lost_from_rr: u64,

    jitter_from_rr: f64,
    max_jitter_from_rr: f64,

    sn_infos: Vec<SnInfo>,

    next_sender_snapshot_id: u32,
    sender_snapshots: Vec<SenderSnapshot>,

    clock_skew_count: u32,
    metadata_cache_overflow_count: u32,
    large_jump_negative_count: u32,
    large_jump_count: u32,
    time_reversed_count: u32,
}

impl RtpStatsSender {
    pub fn new(params: RtpStatsParams) -> Self {
        RtpStatsSender {
            base: RtpStatsBase::new(params),
            ext_start_sn: 0,
            ext_highest_sn: 0,
            ext_highest_sn_from_rr: 0,
            last_rr_time: 0,
            last_rr: None,
            ext_start_ts: 0,
            ext_highest_ts: 0,
            packets_lost_from_rr: 0,
            jitter_from_rr: 0.0,
            max_jitter_from_rr: 0.0,
            sn_infos: vec![SnInfo::default(); SN_INFO_SIZE as usize],
            next_sender_snapshot_id: crate::base::FIRST_SNAPSHOT_ID,
            sender_snapshots: Vec::new(),
            clock_skew_count: 0,
            metadata_cache_overflow_count: 0,
            large_jump_negative_count: 0,
            large_jump_count: 0,
            time_reversed_count: 0,
        }
    }

    /// Copies the complete state of another sender-stats instance, e.g. when
    /// a subscription switches layers and the new layer continues the old
    /// one's sequence number space.
    pub fn seed(&mut self, from: &RtpStatsSender) {
        if !self.base.seed(&from.base) {
            return;
        }

        self.ext_start_sn = from.ext_start_sn;
        self.ext_highest_sn = from.ext_highest_sn;
        self.ext_highest_sn_from_rr = from.ext_highest_sn_from_rr;

        self.last_rr_time = from.last_rr_time;
        self.last_rr = from.last_rr.clone();

        self.ext_start_ts = from.ext_start_ts;
        self.ext_highest_ts = from.ext_highest_ts;

        self.packets_lost_from_rr = from.packets_lost_from_rr;

        self.jitter_from_rr = from.jitter_from_rr;
        self.max_jitter_from_rr = from.max_jitter_from_rr;

        self.sn_infos = from.sn_infos.clone();

        self.next_sender_snapshot_id = from.next_sender_snapshot_id;
        self.sender_snapshots = from.sender_snapshots.clone();
    }

    pub fn stop(&mut self, now: i64) {
        self.base.stop(now);
    }

    pub fn is_initialized(&self) -> bool {
        self.base.initialized
    }

    pub fn new_snapshot_id(&mut self, now: i64) -> u32 {
        self.base.new_snapshot_id(self.ext_highest_sn, now)
    }

    pub fn new_sender_snapshot_id(&mut self, now: i64) -> u32 {
        let id = self.next_sender_snapshot_id;
        self.next_sender_snapshot_id += 1;

        let needed = (self.next_sender_snapshot_id - crate::base::FIRST_SNAPSHOT_ID) as usize;
        if self.sender_snapshots.len() < needed {
            self.sender_snapshots
                .resize(needed, SenderSnapshot::default());
        }

        if self.base.initialized {
            let snapshot = self.init_sender_snapshot(now, self.ext_highest_sn);
            self.sender_snapshots[(id - crate::base::FIRST_SNAPSHOT_ID) as usize] = snapshot;
        }
        id
    }

    pub fn update(
        &mut self,
        packet_time: i64,
        ext_sequence_number: u64,
        ext_timestamp: u64,
        marker: bool,
        hdr_size: usize,
        payload_size: usize,
        padding_size: usize,
    ) {
        if !self.base.is_active() {
            return;
        }

        if !self.base.initialized {
            if payload_size == 0 {
                // do not start on a padding only packet
                return;
            }

            self.base.initialized = true;

            self.base.start_time = packet_time;
            self.base.first_time = packet_time;
            self.base.highest_time = packet_time;

            self.ext_start_sn = ext_sequence_number;
            self.ext_highest_sn = ext_sequence_number.wrapping_sub(1);

            self.ext_start_ts = ext_timestamp;
            self.ext_highest_ts = ext_timestamp;

            // initialize any snapshots handed out before the stream started
            let snapshot = self
                .base
                .init_snapshot(self.base.start_time, self.ext_start_sn);
            for s in &mut self.base.snapshots {
                *s = snapshot;
            }
            let sender_snapshot = self.init_sender_snapshot(self.base.start_time, self.ext_start_sn);
            for s in &mut self.sender_snapshots {
                *s = sender_snapshot;
            }

            debug!("rtp sender stream start, stats: {}", self);
        }

        let pkt_size = (hdr_size + payload_size + padding_size) as u64;
        let mut is_duplicate = false;
        let gap_sn = ext_sequence_number.wrapping_sub(self.ext_highest_sn) as i64;
        if gap_sn <= 0 {
            // duplicate OR out-of-order
            if payload_size == 0 && ext_sequence_number < self.ext_start_sn {
                // do not start on a padding only packet
                return;
            }

            if ext_sequence_number < self.ext_start_sn {
                self.base.packets_lost += self.ext_start_sn - ext_sequence_number;

                // lower the start of snapshots that still sit at the old one
                for s in &mut self.base.snapshots {
                    if s.ext_start_sn == self.ext_start_sn {
                        s.ext_start_sn = ext_sequence_number;
                    }
                }
                for s in &mut self.sender_snapshots {
                    if s.ext_start_sn == self.ext_start_sn {
                        s.ext_start_sn = ext_sequence_number;
                        if s.ext_last_rr_sn == self.ext_start_sn.wrapping_sub(1) {
                            s.ext_last_rr_sn = ext_sequence_number.wrapping_sub(1);
                        }
                    }
                }

                info!(
                    "adjusting start sequence number, sn: {} -> {}, ts: {}, stats: {}",
                    self.ext_start_sn, ext_sequence_number, ext_timestamp, self,
                );
                self.ext_start_sn = ext_sequence_number;
            }

            if gap_sn != 0 {
                self.base.packets_out_of_order += 1;
            }

            if !self.is_sn_info_lost(ext_sequence_number, self.ext_highest_sn) {
                self.base.bytes_duplicate += pkt_size;
                self.base.header_bytes_duplicate += hdr_size as u64;
                self.base.packets_duplicate += 1;
                is_duplicate = true;
            } else {
                self.base.packets_lost = self.base.packets_lost.saturating_sub(1);
                self.set_sn_info(
                    ext_sequence_number,
                    self.ext_highest_sn,
                    pkt_size as u16,
                    hdr_size as u8,
                    payload_size,
                    marker,
                    true,
                );
            }

            if !is_duplicate && -gap_sn >= SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD {
                self.large_jump_negative_count += 1;
                if (self.large_jump_negative_count - 1) % 100 == 0 {
                    warn!(
                        "large sequence number gap negative, gap_sn: {}, sn: {}, \
                         count: {}, stats: {}",
                        gap_sn, ext_sequence_number, self.large_jump_negative_count, self,
                    );
                }
            }
        } else {
            // in-order
            if gap_sn >= SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD {
                self.large_jump_count += 1;
                if (self.large_jump_count - 1) % 100 == 0 {
                    warn!(
                        "large sequence number gap, gap_sn: {}, sn: {}, count: {}, stats: {}",
                        gap_sn, ext_sequence_number, self.large_jump_count, self,
                    );
                }
            }

            if ext_timestamp < self.ext_highest_ts {
                self.time_reversed_count += 1;
                if (self.time_reversed_count - 1) % 100 == 0 {
                    warn!(
                        "time reversed, ts: {}, count: {}, stats: {}",
                        ext_timestamp, self.time_reversed_count, self,
                    );
                }
            }

            self.base.update_gap_histogram(gap_sn);

            // packets between the previous highest and this one are missing
            // until they show up late
            self.clear_sn_infos(self.ext_highest_sn.wrapping_add(1), ext_sequence_number);
            self.base.packets_lost += (gap_sn - 1) as u64;

            self.set_sn_info(
                ext_sequence_number,
                self.ext_highest_sn,
                pkt_size as u16,
                hdr_size as u8,
                payload_size,
                marker,
                false,
            );

            self.ext_highest_sn = ext_sequence_number;
        }

        if ext_timestamp < self.ext_start_ts {
            info!(
                "adjusting start timestamp, ts: {} -> {}, stats: {}",
                self.ext_start_ts, ext_timestamp, self,
            );
            self.ext_start_ts = ext_timestamp;
        }

        if ext_timestamp > self.ext_highest_ts {
            // update only on the first packet of a frame as the same
            // timestamp can be in multiple packets; padding only packets can
            // re-use an old timestamp, skip those
            if payload_size > 0 {
                self.base.highest_time = packet_time;
            }
            self.ext_highest_ts = ext_timestamp;
        }

        if !is_duplicate {
            if payload_size == 0 {
                self.base.packets_padding += 1;
                self.base.bytes_padding += pkt_size;
                self.base.header_bytes_padding += hdr_size as u64;
            } else {
                self.base.bytes += pkt_size;
                self.base.header_bytes += hdr_size as u64;

                if marker {
                    self.base.frames += 1;
                }

                let jitter = self.base.update_jitter(ext_timestamp, packet_time);
                for s in &mut self.sender_snapshots {
                    if jitter > s.max_jitter_feed {
                        s.max_jitter_feed = jitter;
                    }
                }
            }
        }
    }

    pub fn total_packets_primary(&self) -> u64 {
        self.base
            .total_packets_primary(self.ext_start_sn, self.ext_highest_sn)
    }

    pub fn ext_highest_sequence_number(&self) -> u64 {
        self.ext_highest_sn
    }

    pub fn last_receiver_report_time(&self) -> i64 {
        self.last_rr_time
    }

    // ------------------------------------------------------------------
    // receiver report ingestion

    /// Consumes a reception report about this stream. Returns the round trip
    /// time in milliseconds and whether it changed; RTT stays zero until a
    /// sender report has been generated for the report to refer to.
    pub fn update_from_receiver_report(&mut self, rr: &ReceptionReport, now: i64) -> (u32, bool) {
        if !self.base.initialized || !self.base.is_active() {
            return (0, false);
        }

        let mut ext_highest_sn_from_rr =
            (self.ext_highest_sn_from_rr & 0xFFFF_FFFF_0000_0000) + rr.last_sequence_number as u64;
        if let Some(last_rr) = &self.last_rr {
            if rr
                .last_sequence_number
                .wrapping_sub(last_rr.last_sequence_number)
                < (1 << 31)
                && rr.last_sequence_number < last_rr.last_sequence_number
            {
                ext_highest_sn_from_rr += 1 << 32;
            }
        }
        if ext_highest_sn_from_rr.wrapping_add(self.ext_start_sn & 0xFFFF_FFFF_FFFF_0000)
            < self.ext_start_sn
        {
            // the last sequence number in the report can be before the start
            // when probe packets trigger the remote's track path
            return (0, false);
        }

        if self.last_rr_time != 0 && self.ext_highest_sn_from_rr > ext_highest_sn_from_rr {
            debug!(
                "receiver report potentially out of order, highest_sn: existing: {}, \
                 received: {}, stats: {}",
                self.ext_highest_sn_from_rr, ext_highest_sn_from_rr, self,
            );
            return (0, false);
        }

        self.ext_highest_sn_from_rr = ext_highest_sn_from_rr;

        let mut rtt = 0u32;
        let mut is_rtt_changed = false;
        if let Some(sr_newest) = &self.base.sr_newest {
            match ntp::rtt_from_reception_report(rr, sr_newest.ntp_timestamp, sr_newest.at, now) {
                Ok(computed) => {
                    rtt = computed;
                    is_rtt_changed = rtt != self.base.rtt;
                }
                Err(err) => {
                    debug!("error getting rtt: {}", err);
                }
            }
        }

        // 24 bits on the wire; extended for consistency with everything else
        let mut packets_lost_from_rr =
            (self.packets_lost_from_rr & 0xFFFF_FFFF_0000_0000) + rr.total_lost as u64;
        if let Some(last_rr) = &self.last_rr {
            if rr.total_lost.wrapping_sub(last_rr.total_lost) < (1 << 31)
                && rr.total_lost < last_rr.total_lost
            {
                packets_lost_from_rr += 1 << 32;
            }
        }
        self.packets_lost_from_rr = packets_lost_from_rr;

        if is_rtt_changed {
            self.base.rtt = rtt;
            if rtt > self.base.max_rtt {
                self.base.max_rtt = rtt;
            }
        }

        self.jitter_from_rr = rr.jitter as f64;
        if self.jitter_from_rr > self.max_jitter_from_rr {
            self.max_jitter_from_rr = self.jitter_from_rr;
        }

        for s in &mut self.base.snapshots {
            if is_rtt_changed && rtt > s.max_rtt {
                s.max_rtt = rtt;
            }
        }

        let ext_received_rr_sn = self
            .ext_highest_sn_from_rr
            .wrapping_add(self.ext_start_sn & 0xFFFF_FFFF_FFFF_0000);
        for i in 0..self.sender_snapshots.len() {
            let s = &mut self.sender_snapshots[i];
            if is_rtt_changed && rtt > s.max_rtt {
                s.max_rtt = rtt;
            }

            if self.jitter_from_rr > s.max_jitter {
                s.max_jitter = self.jitter_from_rr;
            }

            let packets_in_interval = ext_received_rr_sn.wrapping_sub(s.ext_last_rr_sn);
            if (packets_in_interval as i64) < 0 || packets_in_interval > (1 << 15) {
                info!(
                    "rr interval too big, skipping, ext_received_rr_sn: {}, \
                     packets_in_interval: {}, received_rr: {:?}",
                    ext_received_rr_sn, packets_in_interval, rr,
                );
                continue;
            }

            // on every receiver report, roll the interval since the last one
            // into the snapshot using the packet metadata cache
            let ext_last_rr_sn = s.ext_last_rr_sn;
            let interval_stats = self.get_interval_stats(
                ext_last_rr_sn.wrapping_add(1),
                ext_received_rr_sn.wrapping_add(1),
                self.ext_highest_sn,
            );
            let s = &mut self.sender_snapshots[i];
            s.interval_stats.aggregate(&interval_stats);
            if interval_stats.packets_not_found != 0 {
                self.metadata_cache_overflow_count += 1;
                if (self.metadata_cache_overflow_count - 1) % 10 == 0 {
                    info!(
                        "metadata cache overflow, ext_received_rr_sn: {}, \
                         interval_stats: {}, aggregate: {}, count: {}",
                        ext_received_rr_sn,
                        interval_stats,
                        self.sender_snapshots[i].interval_stats,
                        self.metadata_cache_overflow_count,
                    );
                }
            }
            self.sender_snapshots[i].ext_last_rr_sn = ext_received_rr_sn;
        }

        self.last_rr_time = now;
        self.last_rr = Some(rr.clone());
        (rtt, is_rtt_changed)
    }

    // ------------------------------------------------------------------
    // outgoing sender report

    pub fn maybe_adjust_first_packet_time(
        &mut self,
        publisher_sr_data: &RtcpSenderReportData,
        ts_offset: u64,
        now: i64,
    ) {
        if !self.base.initialized {
            return;
        }

        let ext_start_ts = self.ext_start_ts;
        if let Err(err) =
            self.base
                .maybe_adjust_first_packet_time(publisher_sr_data, ts_offset, ext_start_ts, now)
        {
            info!("{}, current: {:?}, stats: {}", err, publisher_sr_data, self);
        }
    }

    /// Expected extended RTP timestamp at `at`, projected from the first
    /// packet. The only fallible read: the stream must have started.
    pub fn get_expected_rtp_timestamp(&self, at: i64) -> Result<u64> {
        if !self.base.initialized {
            return Err(Error::ErrUninitialized);
        }

        let time_diff = at - self.base.first_time;
        let expected_rtp_diff =
            time_diff as i128 * self.base.params.clock_rate as i128 / 1_000_000_000;
        Ok(self.ext_start_ts.wrapping_add(expected_rtp_diff as u64))
    }

    /// Builds an outgoing sender report on the publisher's report clock.
    /// `ts_offset` is the RTP time bias between the publisher's and this
    /// subscriber's timestamp spaces.
    pub fn get_rtcp_sender_report(
        &mut self,
        ssrc: u32,
        publisher_sr_data: &RtcpSenderReportData,
        ts_offset: u64,
        pass_through: bool,
        now: i64,
    ) -> Option<SenderReport> {
        if !self.base.initialized || !self.base.is_active() {
            return None;
        }

        let time_since_publisher_sr_adjusted = now - publisher_sr_data.at_adjusted;
        let (now_ntp, now_rtp_ext) = if pass_through {
            (
                publisher_sr_data.ntp_timestamp,
                publisher_sr_data.rtp_timestamp_ext.wrapping_sub(ts_offset),
            )
        } else {
            (
                NtpTime::from_unix_nanos(now),
                publisher_sr_data
                    .rtp_timestamp_ext
                    .wrapping_sub(ts_offset)
                    .wrapping_add(
                        (time_since_publisher_sr_adjusted as i128
                            * self.base.params.clock_rate as i128
                            / 1_000_000_000) as u64,
                    ),
            )
        };

        let packet_count =
            (self.total_packets_primary() + self.base.packets_duplicate + self.base.packets_padding)
                as u32;
        let octet_count =
            (self.base.bytes + self.base.bytes_duplicate + self.base.bytes_padding) as u32;
        let sr_data = RtcpSenderReportData {
            ntp_timestamp: now_ntp,
            rtp_timestamp: now_rtp_ext as u32,
            rtp_timestamp_ext: now_rtp_ext,
            at: now,
            at_adjusted: now,
            packets: packet_count,
            octets: octet_count,
        };

        if let Some(sr_newest) = &self.base.sr_newest {
            if now_rtp_ext >= sr_newest.rtp_timestamp_ext {
                let time_since_last_report =
                    now_ntp.as_unix_nanos() - sr_newest.ntp_timestamp.as_unix_nanos();
                let rtp_diff_since_last_report =
                    now_rtp_ext.wrapping_sub(sr_newest.rtp_timestamp_ext);
                let window_clock_rate =
                    rtp_diff_since_last_report as f64 / (time_since_last_report as f64 / 1e9);
                let clock_rate = self.base.params.clock_rate as f64;
                if time_since_last_report as f64 / 1e9 > 0.2
                    && (clock_rate - window_clock_rate).abs() > 0.2 * clock_rate
                {
                    self.clock_skew_count += 1;
                    if (self.clock_skew_count - 1) % 100 == 0 {
                        info!(
                            "sending sender report, clock skew, curr: {:?}, feed: {:?}, \
                             window_clock_rate: {}, count: {}, stats: {}",
                            sr_data, publisher_sr_data, window_clock_rate, self.clock_skew_count, self,
                        );
                    }
                }
            }
        }

        if let Some(sr_newest) = &self.base.sr_newest {
            if now_rtp_ext < sr_newest.rtp_timestamp_ext {
                // should not happen; do not send a report behind the last one
                info!(
                    "sending sender report, out-of-order, skipping, curr: {:?}, \
                     feed: {:?}, stats: {}",
                    sr_data, publisher_sr_data, self,
                );
                return None;
            }
        }

        self.base.sr_newest = Some(sr_data);
        if self.base.sr_first.is_none() {
            self.base.sr_first = Some(sr_data);
        }

        Some(SenderReport {
            ssrc,
            ntp_time: now_ntp.as_u64(),
            rtp_time: now_rtp_ext as u32,
            packet_count,
            octet_count,
            ..Default::default()
        })
    }

    // ------------------------------------------------------------------
    // deltas

    pub fn delta_info(&mut self, snapshot_id: u32, now: i64) -> Option<RtpDeltaInfo> {
        self.base
            .delta_info(snapshot_id, self.ext_start_sn, self.ext_highest_sn, now)
    }

    /// Delta over the sender-snapshot pool: anchored at receiver-report
    /// arrivals, loss is the remote's view, local feed loss is reported as
    /// `packets_missing`, and publisher-side jitter is discounted.
    pub fn delta_info_sender(&mut self, sender_snapshot_id: u32) -> Option<RtpDeltaInfo> {
        if self.last_rr_time == 0 {
            return None;
        }

        let (then, now_snapshot) = self.get_and_reset_sender_snapshot(sender_snapshot_id)?;

        let start_time = then.start_time;
        let end_time = now_snapshot.start_time;

        let packets_expected = now_snapshot.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if packets_expected > NUM_SEQUENCE_NUMBERS {
            warn!(
                "too many packets expected in delta (sender), start_sn: {}, end_sn: {}, \
                 expected: {}, stats: {}",
                then.ext_start_sn, now_snapshot.ext_start_sn, packets_expected, self,
            );
            return None;
        }
        if packets_expected == 0 {
            // no receiver report received (OR) the publisher is not
            // producing any data
            return None;
        }

        let mut packets_lost = now_snapshot.packets_lost.wrapping_sub(then.packets_lost) as i64;
        if packets_lost < 0 {
            packets_lost = 0;
        }
        let mut packets_lost_feed =
            now_snapshot.packets_lost_feed.wrapping_sub(then.packets_lost_feed) as i64;
        if packets_lost_feed < 0 {
            packets_lost_feed = 0;
        }
        if packets_lost as u64 > packets_expected {
            warn!(
                "unexpected number of packets lost, start: {}, end: {}, expected: {}, \
                 lost: report: {}, feed: {}, stats: {}",
                then.ext_start_sn,
                now_snapshot.ext_start_sn,
                packets_expected,
                packets_lost,
                packets_lost_feed,
                self,
            );
            packets_lost = packets_expected as i64;
        }

        // discount jitter from the publisher side and internal processing
        let max_jitter = (then.max_jitter - then.max_jitter_feed).max(0.0);
        let max_jitter_time = max_jitter / self.base.params.clock_rate as f64 * 1e6;

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
            packets_missing: packets_lost_feed as u32,
            packets_out_of_order: (now_snapshot.packets_out_of_order
                - then.packets_out_of_order) as u32,
            frames: now_snapshot.frames - then.frames,
            rtt_max: then.max_rtt,
            jitter_max: max_jitter_time,
            nacks: now_snapshot.nacks - then.nacks,
            plis: now_snapshot.plis - then.plis,
            firs: now_snapshot.firs - then.firs,
        })
    }

    fn get_and_reset_sender_snapshot(
        &mut self,
        sender_snapshot_id: u32,
    ) -> Option<(SenderSnapshot, SenderSnapshot)> {
        if !self.base.initialized || self.last_rr_time == 0 {
            return None;
        }

        let idx = sender_snapshot_id.checked_sub(crate::base::FIRST_SNAPSHOT_ID)? as usize;
        if idx >= self.sender_snapshots.len() {
            return None;
        }

        let mut then = self.sender_snapshots[idx];
        if !then.is_valid {
            then = self.init_sender_snapshot(self.base.start_time, self.ext_start_sn);
            self.sender_snapshots[idx] = then;
        }

        let now_snapshot = self.get_sender_snapshot(self.last_rr_time, &then);
        self.sender_snapshots[idx] = now_snapshot;
        Some((then, now_snapshot))
    }

    fn init_sender_snapshot(&self, start_time: i64, ext_start_sn: u64) -> SenderSnapshot {
        SenderSnapshot {
            is_valid: true,
            start_time,
            ext_start_sn,
            ext_last_rr_sn: ext_start_sn.wrapping_sub(1),
            ..Default::default()
        }
    }

    fn get_sender_snapshot(&self, start_time: i64, s: &SenderSnapshot) -> SenderSnapshot {
        SenderSnapshot {
            is_valid: true,
            start_time,
            ext_start_sn: s.ext_last_rr_sn.wrapping_add(1),
            bytes: s.bytes + s.interval_stats.bytes,
            header_bytes: s.header_bytes + s.interval_stats.header_bytes,
            packets_padding: s.packets_padding + s.interval_stats.packets_padding,
            bytes_padding: s.bytes_padding + s.interval_stats.bytes_padding,
            header_bytes_padding: s.header_bytes_padding + s.interval_stats.header_bytes_padding,
            packets_duplicate: self.base.packets_duplicate,
            bytes_duplicate: self.base.bytes_duplicate,
            header_bytes_duplicate: self.base.header_bytes_duplicate,
            packets_out_of_order: s.packets_out_of_order + s.interval_stats.packets_out_of_order,
            packets_lost_feed: self.base.packets_lost,
            packets_lost: s.packets_lost + s.interval_stats.packets_lost,
            frames: s.frames + s.interval_stats.frames,
            nacks: self.base.nacks,
            plis: self.base.plis,
            firs: self.base.firs,
            max_rtt: self.base.rtt,
            max_jitter_feed: self.base.jitter,
            max_jitter: self.jitter_from_rr,
            ext_last_rr_sn: s.ext_last_rr_sn,
            interval_stats: IntervalStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // per-sequence-number metadata ring

    fn sn_info_out_of_order_slot(&self, esn: u64, ehsn: u64) -> Option<usize> {
        let offset = ehsn.wrapping_sub(esn) as i64;
        if !(0..SN_INFO_SIZE as i64).contains(&offset) {
            // too old OR too new (i.e. ahead of the highest)
            return None;
        }
        Some((esn & SN_INFO_MASK) as usize)
    }

    #[allow(clippy::too_many_arguments)]
    fn set_sn_info(
        &mut self,
        esn: u64,
        ehsn: u64,
        pkt_size: u16,
        hdr_size: u8,
        payload_size: usize,
        marker: bool,
        is_out_of_order: bool,
    ) {
        let slot = if (esn.wrapping_sub(ehsn) as i64) < 0 {
            match self.sn_info_out_of_order_slot(esn, ehsn) {
                Some(slot) => slot,
                None => return,
            }
        } else {
            (esn & SN_INFO_MASK) as usize
        };

        let sn_info = &mut self.sn_infos[slot];
        sn_info.pkt_size = pkt_size;
        sn_info.hdr_size = hdr_size;
        sn_info.flags = 0;
        if marker {
            sn_info.flags |= SN_INFO_FLAG_MARKER;
        }
        if payload_size == 0 {
            sn_info.flags |= SN_INFO_FLAG_PADDING;
        }
        if is_out_of_order {
            sn_info.flags |= SN_INFO_FLAG_OUT_OF_ORDER;
        }
    }

    fn clear_sn_infos(&mut self, ext_start_inclusive: u64, ext_end_exclusive: u64) {
        if ext_end_exclusive <= ext_start_inclusive {
            return;
        }

        let mut esn = ext_start_inclusive;
        // a gap larger than the ring wraps over itself, one pass is enough
        let span = (ext_end_exclusive - ext_start_inclusive).min(SN_INFO_SIZE);
        for _ in 0..span {
            self.sn_infos[(esn & SN_INFO_MASK) as usize] = SnInfo::default();
            esn = esn.wrapping_add(1);
        }
    }

    fn is_sn_info_lost(&self, esn: u64, ehsn: u64) -> bool {
        match self.sn_info_out_of_order_slot(esn, ehsn) {
            Some(slot) => self.sn_infos[slot].pkt_size == 0,
            None => false,
        }
    }

    fn get_interval_stats(
        &self,
        ext_start_inclusive: u64,
        ext_end_exclusive: u64,
        ehsn: u64,
    ) -> IntervalStats {
        let mut interval_stats = IntervalStats::default();
        let mut esn = ext_start_inclusive;
        while esn != ext_end_exclusive {
            match self.sn_info_out_of_order_slot(esn, ehsn) {
                None => interval_stats.packets_not_found += 1,
                Some(slot) => {
                    let sn_info = &self.sn_infos[slot];
                    if sn_info.pkt_size == 0 {
                        interval_stats.packets_lost += 1;
                    } else if sn_info.flags & SN_INFO_FLAG_PADDING != 0 {
                        interval_stats.packets_padding += 1;
                        interval_stats.bytes_padding += sn_info.pkt_size as u64;
                        interval_stats.header_bytes_padding += sn_info.hdr_size as u64;
                    } else {
                        interval_stats.packets += 1;
                        interval_stats.bytes += sn_info.pkt_size as u64;
                        interval_stats.header_bytes += sn_info.hdr_size as u64;
                        if sn_info.flags & SN_INFO_FLAG_OUT_OF_ORDER != 0 {
                            interval_stats.packets_out_of_order += 1;
                        }
                    }

                    if sn_info.flags & SN_INFO_FLAG_MARKER != 0 {
                        interval_stats.frames += 1;
                    }
                }
            }
            esn = esn.wrapping_add(1);
        }
        interval_stats
    }

    // ------------------------------------------------------------------
    // feedback bookkeeping

    pub fn update_nack(&mut self, count: u32) {
        self.base.update_nack(count);
    }

    pub fn update_pli(&mut self, now: i64) {
        self.base.update_pli(now);
    }

    pub fn update_fir(&mut self, now: i64) {
        self.base.update_fir(now);
    }

    pub fn update_key_frame(&mut self, now: i64) {
        self.base.update_key_frame(now);
    }

    // ------------------------------------------------------------------
    // views

    pub fn as_stats(&self, now: i64) -> RtpStats {
        self.base.as_stats(
            now,
            self.ext_start_sn,
            self.ext_highest_sn,
            self.ext_start_ts,
            self.ext_highest_ts,
            self.packets_lost_from_rr,
            self.jitter_from_rr,
            self.max_jitter_from_rr,
        )
    }
}

impl fmt::Display for RtpStatsSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtpStatsSender {{ ")?;
        self.base.fmt_summary(
            f,
            self.ext_start_sn,
            self.ext_highest_sn,
            self.ext_start_ts,
            self.ext_highest_ts,
            self.packets_lost_from_rr,
            self.jitter_from_rr,
            self.max_jitter_from_rr,
        )?;
        write!(
            f,
            ", highest_sn_from_rr: {}, lost_from_rr: {} }}",
            self.ext_highest_sn_from_rr, self.packets_lost_from_rr,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntp::NtpTime;

    const SECOND: i64 = 1_000_000_000;
    const MILLISECOND: i64 = 1_000_000;
    const T0: i64 = 1_700_000_000 * SECOND;

    fn sender() -> RtpStatsSender {
        RtpStatsSender::new(RtpStatsParams { clock_rate: 90000 })
    }

    fn feed(s: &mut RtpStatsSender, i: i64, esn: u64, ets: u64) {
        s.update(T0 + i * 10 * MILLISECOND, esn, ets, false, 12, 1000, 0);
    }

    fn publisher_sr(at: i64, rtp_timestamp_ext: u64) -> RtcpSenderReportData {
        RtcpSenderReportData {
            ntp_timestamp: NtpTime::from_unix_nanos(at),
            rtp_timestamp: rtp_timestamp_ext as u32,
            rtp_timestamp_ext,
            at,
            at_adjusted: at,
            packets: 0,
            octets: 0,
        }
    }

    #[test]
    fn test_initialization_makes_first_packet_in_order() {
        let mut s = sender();
        feed(&mut s, 0, 1000, 90_000);
        assert_eq!(s.ext_start_sn, 1000);
        assert_eq!(s.ext_highest_sn, 1000);
        assert_eq!(s.base.packets_lost, 0);
        assert_eq!(s.base.packets_out_of_order, 0);
        assert_eq!(s.total_packets_primary(), 1);
    }

    #[test]
    fn test_retroactive_start_lowering() {
        let mut s = sender();
        let snapshot_id = s.new_snapshot_id(T0);
        let sender_snapshot_id = s.new_sender_snapshot_id(T0);
        feed(&mut s, 0, 1000, 90_000);
        feed(&mut s, 1, 1001, 93_000);

        // an older packet shows up after the start
        feed(&mut s, 2, 997, 87_000);
        assert_eq!(s.ext_start_sn, 997);
        // 998 and 999 are now considered lost (997 itself arrived)
        assert_eq!(s.base.packets_lost, 2);

        let idx = (snapshot_id - crate::base::FIRST_SNAPSHOT_ID) as usize;
        assert_eq!(s.base.snapshots[idx].ext_start_sn, 997);
        let sidx = (sender_snapshot_id - crate::base::FIRST_SNAPSHOT_ID) as usize;
        assert_eq!(s.sender_snapshots[sidx].ext_start_sn, 997);
        assert_eq!(s.sender_snapshots[sidx].ext_last_rr_sn, 996);
    }

    #[test]
    fn test_duplicate_vs_late_arrival_via_ring() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);
        feed(&mut s, 1, 2, 6000);
        feed(&mut s, 2, 4, 12_000); // 3 lost
        assert_eq!(s.base.packets_lost, 1);

        // late arrival repairs the loss
        feed(&mut s, 3, 3, 9000);
        assert_eq!(s.base.packets_lost, 0);
        assert_eq!(s.base.packets_duplicate, 0);
        assert_eq!(s.base.packets_out_of_order, 1);

        // the same packet again is a duplicate now
        feed(&mut s, 4, 3, 9000);
        assert_eq!(s.base.packets_duplicate, 1);
    }

    #[test]
    fn test_padding_does_not_advance_highest_time() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);
        let highest_time = s.base.highest_time;

        // padding with a fresher timestamp advances the timestamp but not
        // the highest packet time
        s.update(T0 + SECOND, 2, 6000, false, 12, 0, 100);
        assert_eq!(s.base.highest_time, highest_time);
        assert_eq!(s.ext_highest_ts, 6000);
        assert_eq!(s.base.packets_padding, 1);
    }

    #[test]
    fn test_timestamp_start_lowering() {
        let mut s = sender();
        feed(&mut s, 0, 10, 90_000);
        feed(&mut s, 1, 9, 87_000);
        assert_eq!(s.ext_start_ts, 87_000);
    }

    #[test]
    fn test_rtt_from_receiver_report() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);

        // a sender report to refer to
        let publisher = publisher_sr(T0 + SECOND, 90_000);
        let sr = s
            .get_rtcp_sender_report(1, &publisher, 0, true, T0 + SECOND)
            .unwrap();
        let sr_ntp = NtpTime::from(sr.ntp_time);

        let rr = ReceptionReport {
            ssrc: 1,
            fraction_lost: 0,
            total_lost: 0,
            last_sequence_number: 1,
            jitter: 50,
            last_sender_report: sr_ntp.middle_32(),
            delay: 100 * 65536 / 1000, // 100 ms
        };
        let now = T0 + SECOND + 200 * MILLISECOND;
        let (rtt, changed) = s.update_from_receiver_report(&rr, now);
        assert!(changed);
        assert!((99..=101).contains(&rtt), "rtt: {rtt}");
        assert_eq!(s.base.rtt, rtt);
        assert_eq!(s.base.max_rtt, rtt);
        assert_eq!(s.jitter_from_rr, 50.0);
    }

    #[test]
    fn test_receiver_report_loss_extension() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);

        let rr = ReceptionReport {
            ssrc: 1,
            fraction_lost: 0,
            total_lost: 7,
            last_sequence_number: 1,
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        };
        s.update_from_receiver_report(&rr, T0 + SECOND);
        assert_eq!(s.packets_lost_from_rr, 7);

        let rr = ReceptionReport {
            total_lost: 12,
            last_sequence_number: 2,
            ..rr
        };
        s.update_from_receiver_report(&rr, T0 + 2 * SECOND);
        assert_eq!(s.packets_lost_from_rr, 12);
    }

    #[test]
    fn test_out_of_order_receiver_report_ignored() {
        let mut s = sender();
        for i in 0..10 {
            feed(&mut s, i, 1 + i as u64, 3000 * (1 + i as u64));
        }

        let rr = ReceptionReport {
            ssrc: 1,
            fraction_lost: 0,
            total_lost: 0,
            last_sequence_number: 8,
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        };
        s.update_from_receiver_report(&rr, T0 + SECOND);
        assert_eq!(s.ext_highest_sn_from_rr, 8);

        let stale = ReceptionReport {
            last_sequence_number: 5,
            ..rr
        };
        s.update_from_receiver_report(&stale, T0 + 2 * SECOND);
        assert_eq!(s.ext_highest_sn_from_rr, 8);
    }

    #[test]
    fn test_receiver_report_before_start_ignored() {
        let mut s = sender();
        feed(&mut s, 0, 100_000, 3000);

        let rr = ReceptionReport {
            ssrc: 1,
            fraction_lost: 0,
            total_lost: 0,
            last_sequence_number: 10,
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        };
        s.update_from_receiver_report(&rr, T0 + SECOND);
        assert_eq!(s.last_rr_time, 0);
        assert_eq!(s.ext_highest_sn_from_rr, 0);
    }

    #[test]
    fn test_interval_stats_over_receiver_reports() {
        let mut s = sender();
        let sender_snapshot_id = s.new_sender_snapshot_id(T0);

        // 1..=10 with 5 lost, one marker
        for esn in 1u64..=10 {
            if esn == 5 {
                continue;
            }
            s.update(
                T0 + esn as i64 * 10 * MILLISECOND,
                esn,
                3000 * esn,
                esn == 10,
                12,
                1000,
                0,
            );
        }

        let rr = ReceptionReport {
            ssrc: 1,
            fraction_lost: 0,
            total_lost: 1,
            last_sequence_number: 10,
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        };
        s.update_from_receiver_report(&rr, T0 + SECOND);

        let idx = (sender_snapshot_id - crate::base::FIRST_SNAPSHOT_ID) as usize;
        let interval = s.sender_snapshots[idx].interval_stats;
        assert_eq!(interval.packets, 9);
        assert_eq!(interval.packets_lost, 1);
        assert_eq!(interval.bytes, 9 * 1012);
        assert_eq!(interval.frames, 1);
        assert_eq!(interval.packets_not_found, 0);
        assert_eq!(s.sender_snapshots[idx].ext_last_rr_sn, 10);

        let delta = s.delta_info_sender(sender_snapshot_id).unwrap();
        assert_eq!(delta.packets, 10);
        assert_eq!(delta.packets_lost, 1);
        assert_eq!(delta.packets_missing, 1);
        assert_eq!(delta.bytes, 9 * 1012);
        assert_eq!(delta.frames, 1);
    }

    #[test]
    fn test_interval_stats_cache_overflow() {
        let mut s = sender();
        let sender_snapshot_id = s.new_sender_snapshot_id(T0);

        feed(&mut s, 0, 1, 3000);
        // jump far beyond the ring so early slots are recycled
        feed(&mut s, 1, 1 + 20_000, 3000 * 20_001);
        assert_eq!(s.base.packets_lost, 19_999);

        let rr = ReceptionReport {
            ssrc: 1,
            fraction_lost: 0,
            total_lost: 0,
            last_sequence_number: 10_000,
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        };
        s.update_from_receiver_report(&rr, T0 + SECOND);

        let idx = (sender_snapshot_id - crate::base::FIRST_SNAPSHOT_ID) as usize;
        // interval is 1..=10000, all of it older than the ring window
        assert_eq!(s.sender_snapshots[idx].interval_stats.packets_not_found, 10_000);
        assert_eq!(s.metadata_cache_overflow_count, 1);
    }

    #[test]
    fn test_sender_report_pass_through_and_generated() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);
        feed(&mut s, 1, 2, 6000);

        let ts_offset = 1000u64;
        let publisher = publisher_sr(T0, 100_000);

        let sr = s
            .get_rtcp_sender_report(0x42, &publisher, ts_offset, true, T0)
            .unwrap();
        assert_eq!(sr.ssrc, 0x42);
        assert_eq!(sr.ntp_time, publisher.ntp_timestamp.as_u64());
        assert_eq!(sr.rtp_time, 99_000);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 2 * 1012);

        // five seconds later, generated mode projects the publisher clock
        let now = T0 + 5 * SECOND;
        let sr = s
            .get_rtcp_sender_report(0x42, &publisher, ts_offset, false, now)
            .unwrap();
        assert_eq!(sr.rtp_time, 99_000 + 5 * 90_000);
        let ntp = NtpTime::from(sr.ntp_time);
        assert!((ntp.as_unix_nanos() - now).abs() < 2);

        // both reports are recorded as the stream's own anchors
        assert_eq!(s.base.sr_newest.unwrap().rtp_timestamp_ext, 99_000 + 5 * 90_000);
        assert_eq!(s.base.sr_first.unwrap().rtp_timestamp_ext, 99_000);
    }

    #[test]
    fn test_sender_report_behind_newest_is_skipped() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);

        let publisher = publisher_sr(T0, 500_000);
        assert!(s
            .get_rtcp_sender_report(1, &publisher, 0, true, T0)
            .is_some());

        // a report that would go backwards in RTP time is dropped
        let stale = publisher_sr(T0 + SECOND, 400_000);
        assert!(s
            .get_rtcp_sender_report(1, &stale, 0, true, T0 + SECOND)
            .is_none());
    }

    #[test]
    fn test_expected_rtp_timestamp() {
        let mut s = sender();
        s.update(T0, 1, 90_000, false, 12, 1000, 0);

        assert_eq!(s.get_expected_rtp_timestamp(T0 + SECOND), Ok(180_000));

        let uninit = sender();
        assert_eq!(
            uninit.get_expected_rtp_timestamp(T0),
            Err(Error::ErrUninitialized)
        );
    }

    #[test]
    fn test_seed() {
        let mut a = sender();
        feed(&mut a, 0, 100, 3000);
        feed(&mut a, 1, 101, 6000);

        let mut b = sender();
        b.seed(&a);
        assert_eq!(b.ext_start_sn, 100);
        assert_eq!(b.ext_highest_sn, 101);
        assert!(b.is_initialized());

        // seeding an already started instance is a no-op
        let mut c = sender();
        feed(&mut c, 0, 500, 3000);
        c.seed(&a);
        assert_eq!(c.ext_start_sn, 500);
    }

    #[test]
    fn test_update_after_stop_is_ignored() {
        let mut s = sender();
        feed(&mut s, 0, 1, 3000);
        s.stop(T0 + SECOND);
        feed(&mut s, 1, 2, 6000);
        assert_eq!(s.ext_highest_sn, 1);

        let publisher = publisher_sr(T0 + 2 * SECOND, 100_000);
        assert!(s
            .get_rtcp_sender_report(1, &publisher, 0, true, T0 + 2 * SECOND)
            .is_none());
    }

    #[test]
    fn test_delta_info_sender_requires_receiver_report() {
        let mut s = sender();
        let sender_snapshot_id = s.new_sender_snapshot_id(T0);
        feed(&mut s, 0, 1, 3000);
        assert!(s.delta_info_sender(sender_snapshot_id).is_none());
    }
}
