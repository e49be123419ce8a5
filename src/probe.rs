//! Outstanding-probe bookkeeping.
//!
//! Every transmitted Echo Request is registered here until the receiver
//! matches a reply, the sweeper times it out, or the engine drains it during
//! shutdown. Whichever happens first removes the entry, so each probe
//! produces exactly one `PingResult`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tracing::trace;

/// Handle for a target registered with an engine. Wraps the target's stable
/// 16-bit ICMP identifier, which is unique within its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub u16);

/// Composite key correlating replies with requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    pub identifier: u16,
    pub sequence: u16,
}

/// A single outstanding Echo Request.
#[derive(Debug, Clone)]
pub struct Probe {
    pub key: ProbeKey,
    pub target: TargetId,
    pub user_data: usize,
    /// Monotonic per-target sample number.
    pub sample: u64,
    pub sent_at: Instant,
    pub sent_wall: SystemTime,
    pub serviced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Reply,
    TimeExceeded,
    NoReply,
}

/// Outcome of one probe, pushed to engine subscribers.
#[derive(Debug, Clone)]
pub struct PingResult {
    pub sample: u64,
    pub kind: ResultKind,
    /// Responding host; `None` for `NoReply`.
    pub responder: Option<IpAddr>,
    /// Wall-clock time the request went out.
    pub request_time: SystemTime,
    /// Measured round trip; the configured timeout for `NoReply`.
    pub round_trip: Duration,
    pub target: TargetId,
    pub user_data: usize,
    /// Hop distance to the responder inferred from the reply TTL, when the
    /// inbound IP header was available.
    pub hops: Option<u16>,
}

/// In-flight probe table shared by the transmitter, receiver and sweeper.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    probes: Mutex<HashMap<ProbeKey, Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe after a successful send. Returns false (and leaves
    /// the table unchanged) if the key is already outstanding.
    pub fn insert(&self, probe: Probe) -> bool {
        let mut probes = self.probes.lock().expect("registry lock poisoned");
        if probes.contains_key(&probe.key) {
            trace!(key = ?probe.key, "duplicate probe key rejected");
            return false;
        }
        probes.insert(probe.key, probe);
        true
    }

    /// Remove and return the probe for `key`, marking it serviced. Each key
    /// can be claimed at most once.
    pub fn claim(&self, key: &ProbeKey) -> Option<Probe> {
        let mut probes = self.probes.lock().expect("registry lock poisoned");
        probes.remove(key).map(|mut probe| {
            probe.serviced = true;
            probe
        })
    }

    /// Claim the probe carrying `sequence`, whatever identifier it was sent
    /// with. Used when the kernel rewrote the identifier field; the engine
    /// allocates sequences from a single counter, so at most one in-flight
    /// probe carries any given sequence.
    pub fn claim_by_sequence(&self, sequence: u16) -> Option<Probe> {
        let mut probes = self.probes.lock().expect("registry lock poisoned");
        let key = probes
            .keys()
            .find(|key| key.sequence == sequence)
            .copied()?;
        probes.remove(&key).map(|mut probe| {
            probe.serviced = true;
            probe
        })
    }

    /// Remove and return every probe older than `timeout`. Callers emit the
    /// `NoReply` results after the lock is released.
    pub fn sweep(&self, timeout: Duration, now: Instant) -> Vec<Probe> {
        let mut probes = self.probes.lock().expect("registry lock poisoned");
        let expired: Vec<ProbeKey> = probes
            .iter()
            .filter(|(_, probe)| !probe.serviced && now.duration_since(probe.sent_at) > timeout)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| probes.remove(&key))
            .map(|mut probe| {
                probe.serviced = true;
                probe
            })
            .collect()
    }

    /// Remove and return every outstanding probe. Used on engine stop and
    /// target removal so in-flight probes still finalise as `NoReply`.
    pub fn drain(&self) -> Vec<Probe> {
        let mut probes = self.probes.lock().expect("registry lock poisoned");
        probes
            .drain()
            .map(|(_, mut probe)| {
                probe.serviced = true;
                probe
            })
            .collect()
    }

    /// Remove and return the outstanding probes belonging to one target.
    pub fn drain_target(&self, target: TargetId) -> Vec<Probe> {
        let mut probes = self.probes.lock().expect("registry lock poisoned");
        let keys: Vec<ProbeKey> = probes
            .iter()
            .filter(|(_, probe)| probe.target == target)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| probes.remove(&key))
            .map(|mut probe| {
                probe.serviced = true;
                probe
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.probes.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Probe {
    /// Finalise this probe as a timeout.
    pub fn into_no_reply(self, timeout: Duration) -> PingResult {
        PingResult {
            sample: self.sample,
            kind: ResultKind::NoReply,
            responder: None,
            request_time: self.sent_wall,
            round_trip: timeout,
            target: self.target,
            user_data: self.user_data,
            hops: None,
        }
    }
}
