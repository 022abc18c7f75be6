//! Per-stream RTP statistics for an SFU media path.
//!
//! For each unidirectional RTP flow — publisher→SFU ([`RtpStatsReceiver`])
//! and SFU→subscriber ([`RtpStatsSender`]) — this crate reconstructs
//! extended (non-wrapping) sequence numbers and timestamps from the 16- and
//! 32-bit wire values, classifies every packet as in-order / out-of-order /
//! duplicate / lost, computes loss, jitter and inter-arrival diagnostics,
//! and consumes/produces RTCP sender and reception reports on a stable
//! local time base.
//!
//! # Design
//!
//! The engine is sans-io and synchronous: every operation that needs a
//! clock takes it as an argument (Unix nanoseconds), nothing blocks, and no
//! allocation happens per packet — histories are fixed-size rings and
//! bitmaps. Mutating operations take `&mut self`; the owning track decides
//! how to share an instance between its media and RTCP paths (typically one
//! `RwLock` per stream).
//!
//! ```
//! use rtpstats::{RtpStatsParams, RtpStatsReceiver};
//!
//! let mut stats = RtpStatsReceiver::new(RtpStatsParams { clock_rate: 90000 });
//! let flow = stats.update(1_700_000_000_000_000_000, 1, 3000, false, 12, 1000, 0);
//! assert!(!flow.is_not_handled);
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod base;
pub mod bitmap;
pub mod error;
pub mod ntp;
pub mod receiver;
pub mod sender;
pub mod wrap_around;

pub use base::{RtcpSenderReportData, RtpDeltaInfo, RtpStats, RtpStatsParams};
pub use error::{Error, Result};
pub use ntp::NtpTime;
pub use receiver::{RtpFlowState, RtpStatsReceiver, HISTORY_SIZE, REPORT_SLACK};
pub use sender::{RtpStatsSender, SN_INFO_SIZE, SR_INITIAL_WAIT};
