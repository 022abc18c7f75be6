//! End-to-end RTCP report flow: a publisher's sender report is ingested on
//! the receiver side, rebased to the local time base via propagation delay,
//! and drives subscriber-side sender report generation.

use rtpstats::{NtpTime, RtcpSenderReportData, RtpStatsParams, RtpStatsReceiver, RtpStatsSender};

const SECOND: i64 = 1_000_000_000;
const MILLISECOND: i64 = 1_000_000;
const T0: i64 = 1_700_000_000 * SECOND;
const CLOCK_RATE: u32 = 90_000;

fn params() -> RtpStatsParams {
    let _ = env_logger::builder().is_test(true).try_init();
    RtpStatsParams {
        clock_rate: CLOCK_RATE,
    }
}

#[test]
fn test_publisher_report_drives_subscriber_report() {
    let mut receiver = RtpStatsReceiver::new(params());
    let mut sender = RtpStatsSender::new(params());

    // media flows on both sides; the forwarder feeds the sender with the
    // receiver's extended outputs
    for i in 0..100u16 {
        let packet_time = T0 + i as i64 * 10 * MILLISECOND;
        let flow = receiver.update(packet_time, 100 + i, 90_000 + i as u32 * 900, false, 12, 1200, 0);
        assert!(!flow.is_not_handled);
        sender.update(
            packet_time,
            flow.ext_sequence_number,
            flow.ext_timestamp,
            false,
            12,
            1200,
            0,
        );
    }

    // the publisher reports 20 ms of propagation delay
    let pd = 20 * MILLISECOND;
    let sr_at = T0 + SECOND;
    let publisher_sr = RtcpSenderReportData {
        ntp_timestamp: NtpTime::from_unix_nanos(sr_at - pd),
        rtp_timestamp: 90_000 + 90_000,
        at: sr_at,
        ..Default::default()
    };
    assert!(receiver.set_rtcp_sender_report_data(publisher_sr));

    let rebased = receiver.get_rtcp_sender_report_data().unwrap();
    assert_eq!(rebased.rtp_timestamp_ext, 180_000);
    // with a single sample, the rebase folds the whole delay back out
    assert_eq!(rebased.at_adjusted, sr_at);

    // the subscriber's report in pass-through mode mirrors the publisher
    let ts_offset = 0u64;
    let sr = sender
        .get_rtcp_sender_report(0xCAFE, &rebased, ts_offset, true, sr_at)
        .unwrap();
    assert_eq!(sr.ssrc, 0xCAFE);
    assert_eq!(sr.ntp_time, rebased.ntp_timestamp.as_u64());
    assert_eq!(sr.rtp_time, 180_000);
    assert_eq!(sr.packet_count, 100);
    assert_eq!(sr.octet_count, 100 * 1212);

    // in generated mode two seconds later, NTP tracks the local clock and
    // the RTP time advances on the negotiated clock rate
    let later = sr_at + 2 * SECOND;
    let sr = sender
        .get_rtcp_sender_report(0xCAFE, &rebased, ts_offset, false, later)
        .unwrap();
    assert_eq!(sr.rtp_time, 180_000 + 2 * CLOCK_RATE);
    let ntp = NtpTime::from(sr.ntp_time);
    assert!((ntp.as_unix_nanos() - later).abs() < 2);
}

#[test]
fn test_reception_report_round_trip_rtt() {
    let mut receiver = RtpStatsReceiver::new(params());
    let mut sender = RtpStatsSender::new(params());

    for i in 0..10u16 {
        let packet_time = T0 + i as i64 * 10 * MILLISECOND;
        let flow = receiver.update(packet_time, 1 + i, 3000 * (1 + i as u32), false, 12, 1000, 0);
        sender.update(
            packet_time,
            flow.ext_sequence_number,
            flow.ext_timestamp,
            false,
            12,
            1000,
            0,
        );
    }

    // subscriber-side sender report goes out at t1
    let t1 = T0 + SECOND;
    let publisher_sr = RtcpSenderReportData {
        ntp_timestamp: NtpTime::from_unix_nanos(t1),
        rtp_timestamp: 30_000,
        rtp_timestamp_ext: 30_000,
        at: t1,
        at_adjusted: t1,
        ..Default::default()
    };
    let sr = sender
        .get_rtcp_sender_report(0xCAFE, &publisher_sr, 0, true, t1)
        .unwrap();

    // the remote answers with a reception report referring to that report,
    // having held it for 150 ms; it arrives 250 ms after the report left
    let rr = rtcp::reception_report::ReceptionReport {
        ssrc: 0xCAFE,
        fraction_lost: 0,
        total_lost: 0,
        last_sequence_number: 10,
        jitter: 120,
        last_sender_report: NtpTime::from(sr.ntp_time).middle_32(),
        delay: 150 * 65536 / 1000,
    };
    let (rtt, changed) = sender.update_from_receiver_report(&rr, t1 + 250 * MILLISECOND);
    assert!(changed);
    assert!((99..=101).contains(&rtt), "rtt: {rtt}");
}
