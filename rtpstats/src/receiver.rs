//! Publisher-side RTP statistics: classifies every incoming packet against
//! the reconstructed 64-bit sequence number / timestamp spaces, consumes
//! RTCP sender reports to maintain a propagation-delay-rebased clock, and
//! synthesizes outgoing reception reports.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use rtcp::reception_report::ReceptionReport;

use crate::base::{
    RtcpSenderReportData, RtpDeltaInfo, RtpStats, RtpStatsBase, RtpStatsParams,
    NUM_SEQUENCE_NUMBERS, SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD,
};
use crate::bitmap::Bitmap;
use crate::wrap_around::{WrapAround, WrapAroundResult};

/// Window of extended sequence numbers over which duplicates are detected
/// and late arrivals can repair the loss count.
pub const HISTORY_SIZE: u64 = 8192;

// Sender reports are re-based to the local time base so that every
// subscriber side shares it. The propagation delay
// (report receive time - report NTP timestamp) is adapted continuously:
// when it falls, adapt fast, the lower value could be the real delay; when
// it rises, adapt slowly, it may be a temporary change or slow drift.
pub const PD_FALL_FACTOR: f64 = 0.9;
pub const PD_RISE_FACTOR: f64 = 0.1;

pub const PD_SPIKE_FACTOR: f64 = 0.5;

// A consistently higher delta of propagation delay indicates a path change
// mid-stream. Re-seed once both of the following hold:
//   1. at least PD_HIGH_N consecutive reports with a sharp increase,
//   2. PD_HIGH_WAIT of persistent high delta.
// A sharp increase is a delta exceeding PD_DELTA_FACTOR times the long-term
// delta estimate (and at least PD_DELTA_MIN).
pub const PD_DELTA_MIN: Duration = Duration::from_millis(10);
pub const PD_DELTA_FACTOR: i64 = 2;
pub const PD_HIGH_N: u32 = 2;
pub const PD_HIGH_WAIT: Duration = Duration::from_secs(10);
pub const PD_LT_THRESH: Duration = Duration::from_millis(50);

/// How far the RTP timestamp of a sender report may be from its projection
/// before the clock-rate-mismatch fallback kicks in.
pub const REPORT_SLACK: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------

/// Per-packet outcome of [`RtpStatsReceiver::update`]. The caller decides
/// what to do with the packet; the engine only classifies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpFlowState {
    pub is_not_handled: bool,

    pub has_loss: bool,
    pub loss_start_inclusive: u64,
    pub loss_end_exclusive: u64,

    pub is_duplicate: bool,
    pub is_out_of_order: bool,

    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

// ---------------------------------------------------------------------

pub struct RtpStatsReceiver {
    base: RtpStatsBase,

    sequence_number: WrapAround<u16>,

    ts_rollover_threshold: i64,
    timestamp: WrapAround<u32>,

    history: Bitmap,

    propagation_delay: i64,
    long_term_delta_propagation_delay: i64,
    propagation_delay_delta_high_count: u32,
    propagation_delay_delta_high_start_time: i64,
    propagation_delay_spike: i64,

    clock_skew_count: u32,
    clock_skew_media_path_count: u32,
    out_of_order_sender_report_count: u32,
    large_jump_count: u32,
    large_jump_negative_count: u32,
    time_reversed_count: u32,
}

impl RtpStatsReceiver {
    pub fn new(params: RtpStatsParams) -> Self {
        let ts_rollover_threshold = (1i64 << 31) * 1_000_000_000 / params.clock_rate as i64;
        RtpStatsReceiver {
            base: RtpStatsBase::new(params),
            sequence_number: WrapAround::new(),
            ts_rollover_threshold,
            timestamp: WrapAround::new(),
            history: Bitmap::new(HISTORY_SIZE),
            propagation_delay: 0,
            long_term_delta_propagation_delay: 0,
            propagation_delay_delta_high_count: 0,
            propagation_delay_delta_high_start_time: 0,
            propagation_delay_spike: 0,
            clock_skew_count: 0,
            clock_skew_media_path_count: 0,
            out_of_order_sender_report_count: 0,
            large_jump_count: 0,
            large_jump_negative_count: 0,
            time_reversed_count: 0,
        }
    }

    pub fn new_snapshot_id(&mut self, now: i64) -> u32 {
        self.base
            .new_snapshot_id(self.sequence_number.extended_highest(), now)
    }

    pub fn stop(&mut self, now: i64) {
        self.base.stop(now);
    }

    pub fn is_initialized(&self) -> bool {
        self.base.initialized
    }

    fn ts_rollover_count(&self, diff_nanos: i64, ts: u32) -> i32 {
        if diff_nanos < self.ts_rollover_threshold {
            // time not more than rollover threshold
            return -1;
        }

        let excess = (diff_nanos - self.ts_rollover_threshold * 2) as i128
            * self.base.params.clock_rate as i128
            / 1_000_000_000;
        let mut roc = excess / (1i128 << 32);
        if roc < 0 {
            roc = 0;
        }
        if self.timestamp.highest() > ts {
            roc += 1;
        }
        roc as i32
    }

    pub fn update(
        &mut self,
        packet_time: i64,
        sequence_number: u16,
        timestamp: u32,
        marker: bool,
        hdr_size: usize,
        payload_size: usize,
        padding_size: usize,
    ) -> RtpFlowState {
        let mut flow_state = RtpFlowState::default();

        if !self.base.is_active() {
            flow_state.is_not_handled = true;
            return flow_state;
        }

        let res_sn: WrapAroundResult;
        let res_ts: WrapAroundResult;
        if !self.base.initialized {
            if payload_size == 0 {
                // do not start on a padding only packet
                flow_state.is_not_handled = true;
                return flow_state;
            }

            self.base.initialized = true;

            self.base.start_time = packet_time;
            self.base.first_time = packet_time;
            self.base.highest_time = packet_time;

            res_sn = self.sequence_number.update(sequence_number);
            res_ts = self.timestamp.update(timestamp);

            // initialize any snapshots handed out before the stream started
            let snapshot = self
                .base
                .init_snapshot(self.base.start_time, self.sequence_number.extended_start());
            for s in &mut self.base.snapshots {
                *s = snapshot;
            }

            debug!("rtp receiver stream start, stats: {}", self);
        } else {
            let mut sn = self.sequence_number.update(sequence_number);
            if sn.is_unhandled {
                flow_state.is_not_handled = true;
                return flow_state;
            }
            let gap_sn = sn.extended_val.wrapping_sub(sn.pre_extended_highest) as i64;

            let time_since_highest = packet_time - self.base.highest_time;
            let ts_roc = self.ts_rollover_count(time_since_highest, timestamp);
            if ts_roc >= 0 {
                warn!(
                    "potential timestamp rollover, ts: {timestamp}, \
                     time_since_highest: {time_since_highest}ns, count: {ts_roc}, stats: {}",
                    self,
                );
            }
            let ts = self.timestamp.rollover(timestamp, ts_roc);
            if ts.is_unhandled {
                flow_state.is_not_handled = true;
                return flow_state;
            }
            let gap_ts = ts.extended_val.wrapping_sub(ts.pre_extended_highest) as i64;

            // old packets can come in after a discontinuity; it is not
            // possible to detect how far to roll back the sequence number,
            // so ignore them
            if gap_ts < 0 && gap_sn > 0 {
                self.sequence_number.undo_update(&sn);
                warn!(
                    "dropping old packet, sn: {sequence_number}, ts: {timestamp}, \
                     gap_sn: {gap_sn}, gap_ts: {gap_ts}, stats: {}",
                    self,
                );
                flow_state.is_not_handled = true;
                return flow_state;
            }

            // the sequence number can have rolled over alongside the timestamp
            if gap_sn < 0 && gap_ts > 0 && payload_size > 0 {
                if ts_roc >= 0 {
                    // the number of rolled over cycles is unknowable,
                    // use one so the sequence number at least moves forward
                    sn = self.sequence_number.rollover(sequence_number, 1);
                    if sn.is_unhandled {
                        flow_state.is_not_handled = true;
                        return flow_state;
                    }
                    warn!(
                        "forcing sequence number rollover, sn: {sequence_number}, \
                         ts: {timestamp}, stats: {}",
                        self,
                    );
                } else {
                    warn!(
                        "forcing sequence number rollover skipped, sn: {sequence_number}, \
                         ts: {timestamp}, gap_sn: {gap_sn}, gap_ts: {gap_ts}, stats: {}",
                        self,
                    );
                }
            }

            res_sn = sn;
            res_ts = ts;
        }
        let gap_sn = res_sn.extended_val.wrapping_sub(res_sn.pre_extended_highest) as i64;

        let pkt_size = (hdr_size + payload_size + padding_size) as u64;
        if gap_sn <= 0 {
            // duplicate OR out-of-order
            if gap_sn != 0 {
                self.base.packets_out_of_order += 1;
            }

            if self.is_in_range(res_sn.extended_val, res_sn.pre_extended_highest) {
                if self.history.is_set(res_sn.extended_val) {
                    self.base.bytes_duplicate += pkt_size;
                    self.base.header_bytes_duplicate += hdr_size as u64;
                    self.base.packets_duplicate += 1;
                    flow_state.is_duplicate = true;
                } else {
                    // late arrival of a packet counted as lost
                    self.base.packets_lost = self.base.packets_lost.saturating_sub(1);
                    self.history.set(res_sn.extended_val);
                }
            }

            flow_state.is_out_of_order = true;

            if !flow_state.is_duplicate && -gap_sn >= SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD {
                self.large_jump_negative_count += 1;
                if (self.large_jump_negative_count - 1) % 100 == 0 {
                    warn!(
                        "large sequence number gap negative, gap_sn: {gap_sn}, \
                         sn: {sequence_number}, count: {}, stats: {}",
                        self.large_jump_negative_count, self,
                    );
                }
            }
        } else {
            // in-order
            if gap_sn >= SEQUENCE_NUMBER_LARGE_JUMP_THRESHOLD {
                self.large_jump_count += 1;
                if (self.large_jump_count - 1) % 100 == 0 {
                    warn!(
                        "large sequence number gap, gap_sn: {gap_sn}, sn: {sequence_number}, \
                         count: {}, stats: {}",
                        self.large_jump_count, self,
                    );
                }
            }

            if res_ts.extended_val < res_ts.pre_extended_highest {
                self.time_reversed_count += 1;
                if (self.time_reversed_count - 1) % 100 == 0 {
                    warn!(
                        "time reversed, ts: {timestamp}, count: {}, stats: {}",
                        self.time_reversed_count, self,
                    );
                }
            }

            self.base.update_gap_histogram(gap_sn);

            // packets between the previous highest and this one are missing
            // until they show up late
            self.history.clear_range(
                res_sn.pre_extended_highest.wrapping_add(1),
                res_sn.extended_val.wrapping_sub(1),
            );
            self.base.packets_lost += (gap_sn - 1) as u64;

            self.history.set(res_sn.extended_val);

            if timestamp != res_ts.pre_extended_highest as u32 {
                // update only on the first packet of a frame as the same
                // timestamp can be in multiple packets.
                // NOTE: this may not be the first packet with this timestamp
                // if there is packet loss.
                self.base.highest_time = packet_time;
            }

            if gap_sn > 1 {
                flow_state.has_loss = true;
                flow_state.loss_start_inclusive = res_sn.pre_extended_highest + 1;
                flow_state.loss_end_exclusive = res_sn.extended_val;
            }
        }
        flow_state.ext_sequence_number = res_sn.extended_val;
        flow_state.ext_timestamp = res_ts.extended_val;

        if !flow_state.is_duplicate {
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

                self.base.update_jitter(res_ts.extended_val, packet_time);
            }
        }
        flow_state
    }

    fn is_in_range(&self, esn: u64, ehsn: u64) -> bool {
        let diff = ehsn.wrapping_sub(esn) as i64;
        (0..HISTORY_SIZE as i64).contains(&diff)
    }

    // ------------------------------------------------------------------
    // sender report ingestion

    /// Extends the report's 32-bit RTP timestamp into the 64-bit space
    /// anchored at the newest accepted report.
    fn extend_sender_report(&self, sr_data: &RtcpSenderReportData) -> RtcpSenderReportData {
        let mut ts_cycles = 0u64;
        if let Some(sr_newest) = &self.base.sr_newest {
            // project from the last report so that long gaps, where the
            // timestamp may jump more than half the range, stay covered
            let time_since_last = sr_data.ntp_timestamp.as_unix_nanos()
                - sr_newest.ntp_timestamp.as_unix_nanos();
            let expected = sr_newest.rtp_timestamp_ext.wrapping_add(
                (time_since_last as i128 * self.base.params.clock_rate as i128 / 1_000_000_000)
                    as u64,
            );
            let slack = REPORT_SLACK.as_secs() * self.base.params.clock_rate as u64;
            let lbound = expected.wrapping_sub(slack);
            let ubound = expected.wrapping_add(slack);
            let in_range = sr_data.rtp_timestamp.wrapping_sub(lbound as u32) < (1 << 31)
                && (ubound as u32).wrapping_sub(sr_data.rtp_timestamp) < (1 << 31);
            if in_range {
                let lb_cycles = lbound & 0xFFFF_FFFF_0000_0000;
                let ub_cycles = ubound & 0xFFFF_FFFF_0000_0000;
                ts_cycles = if lb_cycles == ub_cycles {
                    lb_cycles
                } else if sr_data.rtp_timestamp < (1 << 31) {
                    // rolled over
                    ub_cycles
                } else {
                    lb_cycles
                };
            } else {
                // ideally this path should not be needed, but some clients
                // negotiate one clock rate and send media at another
                ts_cycles = sr_newest.rtp_timestamp_ext & 0xFFFF_FFFF_0000_0000;
                if sr_data.rtp_timestamp.wrapping_sub(sr_newest.rtp_timestamp) < (1 << 31)
                    && sr_data.rtp_timestamp < sr_newest.rtp_timestamp
                {
                    ts_cycles += 1 << 32;
                }

                if ts_cycles >= (1 << 32)
                    && sr_data.rtp_timestamp.wrapping_sub(sr_newest.rtp_timestamp) >= (1 << 31)
                    && sr_data.rtp_timestamp > sr_newest.rtp_timestamp
                {
                    ts_cycles -= 1 << 32;
                }
            }
        }

        let mut sr_data_ext = *sr_data;
        sr_data_ext.rtp_timestamp_ext = sr_data.rtp_timestamp as u64 + ts_cycles;
        sr_data_ext
    }

    fn check_out_of_order_sender_report(&mut self, sr_data: &RtcpSenderReportData) -> bool {
        if let Some(sr_newest) = &self.base.sr_newest {
            if sr_data.rtp_timestamp_ext < sr_newest.rtp_timestamp_ext {
                // a track mute/unmute can briefly resurrect an older clock,
                // or the remote generates bad reports; either way skip
                self.out_of_order_sender_report_count += 1;
                if (self.out_of_order_sender_report_count - 1) % 10 == 0 {
                    info!(
                        "received sender report, out-of-order, skipping, \
                         current: {sr_data:?}, count: {}, stats: {}",
                        self.out_of_order_sender_report_count, self,
                    );
                }
                return true;
            }
        }
        false
    }

    fn check_rtp_clock_skew(&mut self, sr_data: &RtcpSenderReportData) {
        let (sr_newest, sr_first) = match (&self.base.sr_newest, &self.base.sr_first) {
            (Some(n), Some(f)) => (*n, *f),
            _ => return,
        };

        let clock_rate = self.base.params.clock_rate as f64;

        let time_since_last = (sr_data.ntp_timestamp.as_unix_nanos()
            - sr_newest.ntp_timestamp.as_unix_nanos()) as f64
            / 1e9;
        let rtp_diff_since_last = sr_data
            .rtp_timestamp_ext
            .wrapping_sub(sr_newest.rtp_timestamp_ext);
        let calculated_from_last = rtp_diff_since_last as f64 / time_since_last;

        let time_since_first = (sr_data.ntp_timestamp.as_unix_nanos()
            - sr_first.ntp_timestamp.as_unix_nanos()) as f64
            / 1e9;
        let rtp_diff_since_first = sr_data
            .rtp_timestamp_ext
            .wrapping_sub(sr_first.rtp_timestamp_ext);
        let calculated_from_first = rtp_diff_since_first as f64 / time_since_first;

        if (time_since_last > 0.2 && (clock_rate - calculated_from_last).abs() > 0.2 * clock_rate)
            || (time_since_first > 0.2
                && (clock_rate - calculated_from_first).abs() > 0.2 * clock_rate)
        {
            self.clock_skew_count += 1;
            if (self.clock_skew_count - 1) % 100 == 0 {
                info!(
                    "received sender report, clock skew, current: {sr_data:?}, \
                     calculated_first: {calculated_from_first}, \
                     calculated_last: {calculated_from_last}, count: {}, stats: {}",
                    self.clock_skew_count, self,
                );
            }
        }
    }

    fn check_rtp_clock_skew_against_media_path(&mut self, sr_data: &RtcpSenderReportData) {
        if self.base.highest_time == 0 {
            return;
        }

        let clock_rate = self.base.params.clock_rate;
        let ticks = |nanos: i64| (nanos as i128 * clock_rate as i128 / 1_000_000_000) as i64;
        let now = sr_data.at;

        let ext_now_ts_sr = sr_data.rtp_timestamp_ext as i64 + ticks(now - sr_data.at_adjusted);
        let ext_now_ts_highest =
            self.timestamp.extended_highest() as i64 + ticks(now - self.base.highest_time);
        let ext_now_ts_first =
            self.timestamp.extended_start() as i64 + ticks(now - self.base.first_time);

        let diff_highest = ext_now_ts_sr - ext_now_ts_highest;
        let diff_first = ext_now_ts_sr - ext_now_ts_first;

        // is it more than 5 seconds off?
        let limit = 5 * clock_rate as u64;
        if diff_highest.unsigned_abs() > limit || diff_first.unsigned_abs() > limit {
            self.clock_skew_media_path_count += 1;
            if (self.clock_skew_media_path_count - 1) % 100 == 0 {
                info!(
                    "received sender report, clock skew against media path, \
                     current: {sr_data:?}, diff_highest: {diff_highest}, \
                     diff_first: {diff_first}, count: {}, stats: {}",
                    self.clock_skew_media_path_count, self,
                );
            }
        }
    }

    fn reset_propagation_delay_delta(&mut self) {
        self.propagation_delay_delta_high_count = 0;
        self.propagation_delay_delta_high_start_time = 0;
        self.propagation_delay_spike = 0;
    }

    fn init_propagation_delay(&mut self, pd: i64) {
        self.propagation_delay = pd;
        self.long_term_delta_propagation_delay = 0;
        self.reset_propagation_delay_delta();
    }

    fn update_propagation_delay_and_record_sender_report(
        &mut self,
        sr_data: &mut RtcpSenderReportData,
    ) {
        let ntp_time = sr_data.ntp_timestamp.as_unix_nanos();
        let propagation_delay = sr_data.at - ntp_time;

        if self.base.sr_first.is_none() {
            self.init_propagation_delay(propagation_delay);
            debug!(
                "initializing propagation delay, received: {propagation_delay}ns, \
                 current: {sr_data:?}, stats: {}",
                self,
            );
        } else {
            let delta_propagation_delay = propagation_delay - self.propagation_delay;
            if delta_propagation_delay > PD_DELTA_MIN.as_nanos() as i64 {
                // ignore small changes for path change consideration
                if self.long_term_delta_propagation_delay != 0
                    && delta_propagation_delay
                        > self.long_term_delta_propagation_delay * PD_DELTA_FACTOR
                {
                    debug!(
                        "sharp increase in propagation delay, received: {propagation_delay}ns, \
                         delta: {delta_propagation_delay}ns, high_count: {}, stats: {}",
                        self.propagation_delay_delta_high_count, self,
                    );
                    self.propagation_delay_delta_high_count += 1;
                    if self.propagation_delay_delta_high_start_time == 0 {
                        self.propagation_delay_delta_high_start_time = sr_data.at;
                    }
                    if self.propagation_delay_spike == 0 {
                        self.propagation_delay_spike = propagation_delay;
                    } else {
                        self.propagation_delay_spike += (PD_SPIKE_FACTOR
                            * (propagation_delay - self.propagation_delay_spike) as f64)
                            as i64;
                    }

                    if self.propagation_delay_delta_high_count >= PD_HIGH_N
                        && sr_data.at - self.propagation_delay_delta_high_start_time
                            >= PD_HIGH_WAIT.as_nanos() as i64
                    {
                        let spike = self.propagation_delay_spike;
                        debug!("re-initializing propagation delay, new: {spike}ns, stats: {}", self);
                        self.init_propagation_delay(spike);
                    }
                } else {
                    self.reset_propagation_delay_delta();
                }
            } else {
                self.reset_propagation_delay_delta();

                let factor = if propagation_delay > self.propagation_delay {
                    PD_RISE_FACTOR
                } else {
                    PD_FALL_FACTOR
                };
                self.propagation_delay +=
                    (factor * (propagation_delay - self.propagation_delay) as f64) as i64;
            }

            if delta_propagation_delay < PD_LT_THRESH.as_nanos() as i64 {
                if self.long_term_delta_propagation_delay == 0 {
                    self.long_term_delta_propagation_delay = delta_propagation_delay;
                } else if let Some(sr_newest) = &self.base.sr_newest {
                    // do not adapt to large positive spikes, they happen when
                    // a congested channel delivers reports very late; a real
                    // path change persists and is handled above
                    let since_last_report = sr_data.ntp_timestamp.as_unix_nanos()
                        - sr_newest.ntp_timestamp.as_unix_nanos();
                    let adaptation_factor =
                        (since_last_report as f64 / PD_HIGH_WAIT.as_nanos() as f64).min(1.0);
                    self.long_term_delta_propagation_delay += (adaptation_factor
                        * (delta_propagation_delay - self.long_term_delta_propagation_delay)
                            as f64) as i64;
                }
            }
            if self.long_term_delta_propagation_delay < 0 {
                self.long_term_delta_propagation_delay = 0;
            }
        }

        // adjust receive time to the estimated propagation delay
        sr_data.at_adjusted = ntp_time + self.propagation_delay;

        if self.base.sr_first.is_none() {
            self.base.sr_first = Some(*sr_data);
        }
        self.base.sr_newest = Some(*sr_data);
    }

    /// Consumes an inbound RTCP sender report. Returns whether the report
    /// was accepted. On acceptance, the stored copy carries the extended
    /// RTP timestamp and the receive time rebased to the local time base.
    pub fn set_rtcp_sender_report_data(&mut self, sr_data: RtcpSenderReportData) -> bool {
        if !self.base.initialized {
            return false;
        }

        // guard against the extreme case of anachronous sender reports
        if let Some(sr_newest) = &self.base.sr_newest {
            if sr_newest.ntp_timestamp > sr_data.ntp_timestamp {
                info!(
                    "received sender report, anachronous, dropping, current: {sr_data:?}, \
                     stats: {}",
                    self,
                );
                return false;
            }
        }

        let mut sr_data_ext = self.extend_sender_report(&sr_data);

        if self.check_out_of_order_sender_report(&sr_data_ext) {
            return false;
        }

        self.check_rtp_clock_skew(&sr_data_ext);
        self.update_propagation_delay_and_record_sender_report(&mut sr_data_ext);
        self.check_rtp_clock_skew_against_media_path(&sr_data_ext);

        let ext_start_ts = self.timestamp.extended_start();
        if let Some(sr_newest) = self.base.sr_newest {
            if let Err(err) =
                self.base
                    .maybe_adjust_first_packet_time(&sr_newest, 0, ext_start_ts, sr_data_ext.at)
            {
                info!("{err}, current: {sr_newest:?}, stats: {}", self);
            }
        }
        true
    }

    pub fn get_rtcp_sender_report_data(&self) -> Option<RtcpSenderReportData> {
        self.base.sr_newest
    }

    pub fn last_sender_report_time(&self) -> i64 {
        self.base.sr_newest.map(|sr| sr.at).unwrap_or(0)
    }

    /// Current propagation delay estimate in nanoseconds.
    pub fn propagation_delay(&self) -> i64 {
        self.propagation_delay
    }

    // ------------------------------------------------------------------
    // outgoing reception report

    pub fn get_rtcp_reception_report(
        &mut self,
        ssrc: u32,
        proxy_fraction_lost: u8,
        snapshot_id: u32,
        now: i64,
    ) -> Option<ReceptionReport> {
        if !self.base.is_active() {
            return None;
        }

        let ext_start_sn = self.sequence_number.extended_start();
        let ext_highest_sn = self.sequence_number.extended_highest();
        let (then, now_snapshot) =
            self.base
                .get_and_reset_snapshot(snapshot_id, ext_start_sn, ext_highest_sn, now)?;

        let packets_expected = now_snapshot.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if packets_expected > NUM_SEQUENCE_NUMBERS {
            warn!(
                "too many packets expected in receiver report, start: {}, end: {}, \
                 expected: {packets_expected}, stats: {}",
                then.ext_start_sn, now_snapshot.ext_start_sn, self,
            );
            return None;
        }
        if packets_expected == 0 {
            return None;
        }

        let mut packets_lost = now_snapshot.packets_lost.wrapping_sub(then.packets_lost) as i64;
        if packets_lost < 0 {
            packets_lost = 0;
        }
        let loss_rate = packets_lost as f32 / packets_expected as f32;
        let mut fraction_lost = (loss_rate * 256.0).clamp(0.0, 255.0) as u8;
        if proxy_fraction_lost > fraction_lost {
            fraction_lost = proxy_fraction_lost;
        }

        let total_lost = self.base.packets_lost.min(0xFF_FFFF) as u32;

        let mut last_sr = 0u32;
        let mut dlsr = 0u32;
        if let Some(sr_newest) = &self.base.sr_newest {
            last_sr = sr_newest.ntp_timestamp.middle_32();
            if sr_newest.at != 0 {
                let delay_us = (now - sr_newest.at).max(0) / 1000;
                dlsr = (delay_us * 65536 / 1_000_000) as u32;
            }
        }

        Some(ReceptionReport {
            ssrc,
            fraction_lost,
            total_lost,
            last_sequence_number: now_snapshot.ext_start_sn as u32,
            jitter: self.base.jitter as u32,
            last_sender_report: last_sr,
            delay: dlsr,
        })
    }

    pub fn delta_info(&mut self, snapshot_id: u32, now: i64) -> Option<RtpDeltaInfo> {
        self.base.delta_info(
            snapshot_id,
            self.sequence_number.extended_start(),
            self.sequence_number.extended_highest(),
            now,
        )
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

    pub fn ext_highest_sequence_number(&self) -> u64 {
        self.sequence_number.extended_highest()
    }

    pub fn highest_timestamp(&self) -> u32 {
        self.timestamp.highest()
    }

    pub fn as_stats(&self, now: i64) -> RtpStats {
        self.base.as_stats(
            now,
            self.sequence_number.extended_start(),
            self.sequence_number.extended_highest(),
            self.timestamp.extended_start(),
            self.timestamp.extended_highest(),
            self.base.packets_lost,
            self.base.jitter,
            self.base.max_jitter,
        )
    }
}

impl fmt::Display for RtpStatsReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RtpStatsReceiver {{ ")?;
        self.base.fmt_summary(
            f,
            self.sequence_number.extended_start(),
            self.sequence_number.extended_highest(),
            self.timestamp.extended_start(),
            self.timestamp.extended_highest(),
            self.base.packets_lost,
            self.base.jitter,
            self.base.max_jitter,
        )?;
        write!(
            f,
            ", pd: {}ns, lt_delta_pd: {}ns }}",
            self.propagation_delay, self.long_term_delta_propagation_delay,
        )
    }
}
