use std::{collections::VecDeque, net::IpAddr, time::Duration};

use crate::probe::{PingResult, ResultKind};

/// How many recent round trips each hop keeps for the report's standard
/// deviation column.
const RTT_WINDOW: usize = 100;

/// Running statistics for one hop of the probed route.
///
/// Replies and time-exceeded responses both count as answers from the hop;
/// the loss ratio is timeouts over resolved probes. Updates are applied in
/// the order results arrive, by the single consumer draining the engine.
#[derive(Debug, Clone)]
pub struct HopStats {
    pub ttl: u8,
    /// False while the hop has never responded (silent hops stay false).
    pub hop_valid: bool,
    pub responder: Option<IpAddr>,
    /// Sample number of the most recently applied result.
    pub last_sample: u64,
    pub replies: u64,
    pub timeouts: u64,
    pub last_rtt: Option<Duration>,
    pub best_rtt: Option<Duration>,
    pub worst_rtt: Option<Duration>,
    pub avg_rtt: Option<Duration>,
    pub last_jitter: Option<Duration>,
    pub jitter_avg: Option<Duration>,
    pub rtts: VecDeque<Duration>,
    avg_secs: f64,
    jitter_avg_secs: f64,
}

impl HopStats {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            hop_valid: true,
            responder: None,
            last_sample: 0,
            replies: 0,
            timeouts: 0,
            last_rtt: None,
            best_rtt: None,
            worst_rtt: None,
            avg_rtt: None,
            last_jitter: None,
            jitter_avg: None,
            rtts: VecDeque::with_capacity(RTT_WINDOW),
            avg_secs: 0.0,
            jitter_avg_secs: 0.0,
        }
    }

    /// Row for a hop that never answered during discovery. No probe stream
    /// feeds it; it exists so the route keeps its TTL indexing.
    pub fn placeholder(ttl: u8) -> Self {
        Self {
            hop_valid: false,
            ..Self::new(ttl)
        }
    }

    /// Apply one probe outcome.
    pub fn record(&mut self, result: &PingResult) {
        self.last_sample = result.sample;
        match result.kind {
            ResultKind::Reply | ResultKind::TimeExceeded => {
                self.record_reply(result.responder, result.round_trip);
            }
            ResultKind::NoReply => self.record_timeout(),
        }
    }

    pub fn record_reply(&mut self, responder: Option<IpAddr>, rtt: Duration) {
        self.hop_valid = true;
        if responder.is_some() {
            self.responder = responder;
        }
        self.replies += 1;

        // Jitter needs the previous round trip.
        if let Some(previous) = self.last_rtt {
            let jitter = if rtt > previous {
                rtt - previous
            } else {
                previous - rtt
            };
            self.last_jitter = Some(jitter);
            let jitter_samples = (self.replies - 1) as f64;
            self.jitter_avg_secs +=
                (jitter.as_secs_f64() - self.jitter_avg_secs) / jitter_samples;
            self.jitter_avg = Some(Duration::from_secs_f64(self.jitter_avg_secs));
        }

        self.last_rtt = Some(rtt);
        self.rtts.push_back(rtt);
        if self.rtts.len() > RTT_WINDOW {
            self.rtts.pop_front();
        }

        if self.best_rtt.map_or(true, |best| rtt < best) {
            self.best_rtt = Some(rtt);
        }
        if self.worst_rtt.map_or(true, |worst| rtt > worst) {
            self.worst_rtt = Some(rtt);
        }

        // Running mean over every reply ever received, not just the window.
        self.avg_secs += (rtt.as_secs_f64() - self.avg_secs) / self.replies as f64;
        self.avg_rtt = Some(Duration::from_secs_f64(self.avg_secs));

        tracing::trace!(
            ttl = self.ttl,
            replies = self.replies,
            rtt_ms = rtt.as_secs_f64() * 1000.0,
            "hop reply recorded"
        );
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        tracing::trace!(ttl = self.ttl, timeouts = self.timeouts, "hop timeout recorded");
    }

    /// Resolved probe count for this hop.
    pub fn samples(&self) -> u64 {
        self.replies + self.timeouts
    }

    /// Loss ratio in percent; `None` until at least one probe resolved.
    pub fn loss_percent(&self) -> Option<f64> {
        let samples = self.samples();
        if samples == 0 {
            return None;
        }
        Some(self.timeouts as f64 / samples as f64 * 100.0)
    }
}
