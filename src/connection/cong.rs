use std::time::Instant;

/// Initial retransmission timeout, in microseconds.
pub(crate) const START_RTO: u32 = 1_000_000;
/// Upper bound on the retransmission timeout, in microseconds.
pub(crate) const MAX_RTO: u32 = 3_000_000;

/// Congestion window state, RFC 5681 flavoured: slow start below
/// `ssthresh`, additive increase above it, fast recovery keyed off the
/// duplicate-ACK counter.
#[derive(Debug, Clone)]
pub(crate) struct CongestionControl {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dupack: u32,
}

impl CongestionControl {
    /// RFC 6928 initial window: 2-4 segments depending on the MSS.
    pub fn new(mss: u32) -> Self {
        let iw = if mss > 2190 {
            2
        } else if mss > 1095 {
            3
        } else {
            4
        };

        CongestionControl {
            cwnd: iw * mss,
            ssthresh: u32::MAX,
            dupack: 0,
        }
    }

    /// Window growth after `advanced` bytes were newly acknowledged.
    /// Also ends an ongoing fast recovery.
    pub fn on_advance(&mut self, advanced: u32, mss: u32, sndbuf_max: u32) {
        if self.dupack != 0 {
            if self.dupack >= 3 {
                tracing::debug!("fast recovery ended");
                self.cwnd = self.ssthresh;
            }

            self.dupack = 0;
        }

        if self.cwnd < self.ssthresh {
            // RFC 5681 eq. 2, slow start
            self.cwnd += advanced.min(mss);
        } else {
            // RFC 5681 eq. 3, congestion avoidance
            self.cwnd += 1.max(mss * mss / self.cwnd);
        }

        if self.cwnd > sndbuf_max {
            self.cwnd = sndbuf_max;
        }
    }

    /// Slow-start restart after a retransmission timeout (RFC 5681 eq. 4).
    pub fn on_rto(&mut self, flightsize: u32, mss: u32) {
        self.ssthresh = (flightsize / 2).max(2 * mss);
        self.cwnd = mss;
    }

    /// Counts a duplicate ACK. On the third, halves into fast recovery and
    /// returns true so the caller retransmits the lost segment; every
    /// further duplicate inflates the window by one segment.
    pub fn on_dup_ack(&mut self, flightsize: u32, mss: u32, sndbuf_max: u32) -> bool {
        self.dupack += 1;
        tracing::trace!(dupack = self.dupack, "duplicate ack");

        if self.dupack == 3 {
            self.ssthresh = (flightsize / 2).max(2 * mss);
            self.cwnd = (self.ssthresh + 3 * mss).min(sndbuf_max);
            true
        } else {
            if self.dupack > 3 {
                self.cwnd = (self.cwnd + mss).min(sndbuf_max);
            }

            false
        }
    }
}

/// RFC 6298 retransmission-timeout estimator. All values in microseconds;
/// at most one sample is measured at a time.
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    srtt: u32,
    rttvar: u32,
    pub rto: u32,
    sample: Option<(Instant, u32)>,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: 0,
            rttvar: 0,
            rto: START_RTO,
            sample: None,
        }
    }

    pub fn sample_in_flight(&self) -> bool {
        self.sample.is_some()
    }

    /// Begins a measurement expecting `seq` to be acknowledged.
    pub fn start_sample(&mut self, now: Instant, seq: u32) {
        self.sample = Some((now, seq));
        tracing::trace!(seq, "starting rtt measurement");
    }

    pub fn cancel_sample(&mut self) {
        self.sample = None;
    }

    /// Feeds an acknowledgement into the estimator. The sample completes
    /// only when `ack` matches the expected sequence number exactly; an ack
    /// beyond it invalidates the measurement.
    pub fn on_ack(&mut self, now: Instant, ack: u32, granularity: u32) {
        let Some((start, seq)) = self.sample else {
            return;
        };

        if ack == seq {
            let rtt = now.duration_since(start).as_micros() as u32;
            self.update(rtt, granularity);
            self.sample = None;
        } else if (seq.wrapping_sub(ack) as i32) < 0 {
            tracing::trace!(seq, ack, "cancelling rtt measurement");
            self.sample = None;
        }
    }

    fn update(&mut self, rtt: u32, granularity: u32) {
        if rtt == 0 {
            return;
        }

        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            self.rttvar = (3 * self.rttvar + self.srtt.abs_diff(rtt)) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
        }

        self.rto = (self.srtt + (4 * self.rttvar).max(granularity)).min(MAX_RTO);

        tracing::trace!(
            rtt,
            srtt = self.srtt,
            rttvar = self.rttvar,
            rto = self.rto,
            "rtt sample"
        );
    }

    /// Exponential backoff after a retransmission; drops any in-flight
    /// sample, which would now measure the wrong transmission.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.sample = None;
    }

    /// Clamps back to the initial timeout (host-driven timer reset).
    pub fn restart(&mut self) {
        self.sample = None;

        if self.rto > START_RTO {
            self.rto = START_RTO;
        }
    }
}
