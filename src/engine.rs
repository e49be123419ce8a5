//! Continuous ping engine.
//!
//! One engine owns the targets of a probe stream and three workers: a
//! transmitter fanning probes out at the configured interval, a receiver
//! matching inbound replies against the probe registry, and a sweeper that
//! finalises unanswered probes as `NoReply`. Results are pushed to
//! subscribers the moment either the receiver or the sweeper resolves a
//! probe; ordering across targets follows arrival, not transmission.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{EngineError, Result};
use crate::packet::{self, IpVersion, ReplyKind, DEFAULT_PAYLOAD_LEN};
use crate::probe::{PingResult, Probe, ProbeKey, ProbeRegistry, ResultKind, TargetId};
use crate::shutdown::Shutdown;
use crate::socket::{IcmpSocket, SocketMode};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Floor for the sweeper cadence so a tiny timeout cannot spin a core.
const MIN_SWEEP_CADENCE: Duration = Duration::from_millis(25);

/// Bounds on the receiver's poll timeout: short enough that shutdown stays
/// prompt, long enough to avoid busy polling.
const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Creates engines for a given IP version. The analyser and the route
/// engine receive one of these instead of reaching into any global registry,
/// and a different probing back-end only has to supply its own factory.
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self, version: IpVersion) -> PingEngine;
}

/// Factory for the raw/datagram-socket engine in this module.
#[derive(Debug, Default)]
pub struct IcmpEngineFactory;

impl EngineFactory for IcmpEngineFactory {
    fn create_engine(&self, version: IpVersion) -> PingEngine {
        PingEngine::new(version)
    }
}

/// A configured probe destination owned by its engine.
#[derive(Debug, Clone)]
struct TargetEntry {
    id: TargetId,
    address: IpAddr,
    /// 0 means "no override": probes travel with the default TTL and are
    /// expected to reach the destination.
    ttl: u8,
    /// Opaque consumer slot; the analyser stores the hop index here.
    user_data: usize,
    /// Monotonic per-target sample counter.
    samples: u64,
}

/// Everything the worker threads share with the engine handle.
struct EngineShared {
    version: IpVersion,
    epoch: Instant,
    interval: Mutex<Duration>,
    timeout: Mutex<Duration>,
    targets: Mutex<Vec<TargetEntry>>,
    registry: ProbeRegistry,
    /// Engine-wide sequence allocator. A single counter keeps every
    /// in-flight sequence unique, which the receiver's identifier-rewrite
    /// fallback depends on; per-target sequences remain strictly increasing.
    next_sequence: AtomicU16,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PingResult>>>,
    shutdown: Shutdown,
    state: Mutex<EngineState>,
    fatal: Mutex<Option<EngineError>>,
    invalid_packets: AtomicU64,
}

impl EngineShared {
    fn interval(&self) -> Duration {
        *self.interval.lock().expect("interval lock poisoned")
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock().expect("timeout lock poisoned")
    }

    fn state(&self) -> EngineState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Deliver a result to every live subscriber; senders whose receiver
    /// has gone away are dropped. Never called with the registry locked.
    fn publish(&self, result: PingResult) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|sender| sender.send(result.clone()).is_ok());
    }

    fn record_fatal(&self, err: EngineError) {
        warn!("engine worker failed: {err}");
        let mut fatal = self.fatal.lock().expect("fatal lock poisoned");
        fatal.get_or_insert(err);
        drop(fatal);
        *self.state.lock().expect("state lock poisoned") = EngineState::Stopped;
        self.shutdown.signal();
    }

    fn alloc_sequence(&self) -> u16 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// Continuous per-hop measurement engine.
pub struct PingEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PingEngine {
    pub fn new(version: IpVersion) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                version,
                epoch: Instant::now(),
                interval: Mutex::new(DEFAULT_INTERVAL),
                timeout: Mutex::new(DEFAULT_TIMEOUT),
                targets: Mutex::new(Vec::new()),
                registry: ProbeRegistry::new(),
                next_sequence: AtomicU16::new(1),
                subscribers: Mutex::new(Vec::new()),
                shutdown: Shutdown::new(),
                state: Mutex::new(EngineState::Created),
                fatal: Mutex::new(None),
                invalid_packets: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn version(&self) -> IpVersion {
        self.shared.version
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Monotonic reference point for this engine's probe timestamps.
    pub fn epoch(&self) -> Instant {
        self.shared.epoch
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    /// Set the probe interval. Only valid before `start`.
    pub fn set_interval(&self, interval: Duration) -> bool {
        if self.shared.state() != EngineState::Created {
            return false;
        }
        *self.shared.interval.lock().expect("interval lock poisoned") = interval;
        true
    }

    /// Set the reply timeout. Only valid before `start`.
    pub fn set_timeout(&self, timeout: Duration) -> bool {
        if self.shared.state() != EngineState::Created {
            return false;
        }
        *self.shared.timeout.lock().expect("timeout lock poisoned") = timeout;
        true
    }

    /// Register a destination probed at the default TTL (i.e. expected to be
    /// reached).
    pub fn add_target(&self, address: IpAddr) -> Result<TargetId> {
        self.add_target_with_ttl(address, 0)
    }

    /// Register a destination probed with a TTL override; probes expire at
    /// that hop and the router there answers with Time Exceeded.
    pub fn add_target_with_ttl(&self, address: IpAddr, ttl: u8) -> Result<TargetId> {
        if !self.shared.version.matches(address) {
            return Err(EngineError::AddressFamily(address));
        }
        let mut targets = self.shared.targets.lock().expect("target lock poisoned");
        let id = TargetId(allocate_identifier(&targets));
        targets.push(TargetEntry {
            id,
            address,
            ttl,
            user_data: 0,
            samples: 0,
        });
        debug!(
            "added target {} ttl={} id={}",
            address, ttl, id.0
        );
        Ok(id)
    }

    /// Attach an opaque consumer value to a target; it is copied into every
    /// result for that target.
    pub fn set_target_user_data(&self, target: TargetId, user_data: usize) -> bool {
        let mut targets = self.shared.targets.lock().expect("target lock poisoned");
        match targets.iter_mut().find(|entry| entry.id == target) {
            Some(entry) => {
                entry.user_data = user_data;
                true
            }
            None => false,
        }
    }

    pub fn target_address(&self, target: TargetId) -> Option<IpAddr> {
        let targets = self.shared.targets.lock().expect("target lock poisoned");
        targets
            .iter()
            .find(|entry| entry.id == target)
            .map(|entry| entry.address)
    }

    pub fn target_count(&self) -> usize {
        self.shared.targets.lock().expect("target lock poisoned").len()
    }

    /// Remove a target and finalise its in-flight probes as `NoReply`. The
    /// handle is invalid afterwards.
    pub fn remove_target(&self, target: TargetId) -> bool {
        let removed = {
            let mut targets = self.shared.targets.lock().expect("target lock poisoned");
            let before = targets.len();
            targets.retain(|entry| entry.id != target);
            targets.len() != before
        };
        if removed {
            let timeout = self.shared.timeout();
            for probe in self.shared.registry.drain_target(target) {
                self.shared.publish(probe.into_no_reply(timeout));
            }
        }
        removed
    }

    /// Subscribe to the result stream. Every `PingResult` is delivered at
    /// most once to each subscriber, in resolution order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PingResult> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(sender);
        receiver
    }

    /// Spawn the workers. Idempotent while running; once the engine has
    /// stopped it cannot be started again.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock().expect("state lock poisoned");
        match *state {
            EngineState::Started => return Ok(()),
            EngineState::Created => {}
            EngineState::Stopping | EngineState::Stopped => {
                return Err(EngineError::InvalidState("start after stop"));
            }
        }

        let socket = Arc::new(IcmpSocket::open(self.shared.version)?);

        let mut workers = self.workers.lock().expect("worker lock poisoned");
        let transmitter = {
            let shared = Arc::clone(&self.shared);
            let socket = Arc::clone(&socket);
            std::thread::Builder::new()
                .name("pathprobe-transmitter".into())
                .spawn(move || transmitter_loop(shared, socket))?
        };
        let receiver = {
            let shared = Arc::clone(&self.shared);
            let socket = Arc::clone(&socket);
            std::thread::Builder::new()
                .name("pathprobe-receiver".into())
                .spawn(move || receiver_loop(shared, socket))?
        };
        let sweeper = {
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name("pathprobe-sweeper".into())
                .spawn(move || sweeper_loop(shared))?
        };
        workers.extend([transmitter, receiver, sweeper]);

        *state = EngineState::Started;
        debug!("engine started ({})", self.shared.version.family_name());
        Ok(())
    }

    /// Stop the workers and finalise every in-flight probe as `NoReply`
    /// before returning. Idempotent.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            if *state != EngineState::Stopped {
                *state = EngineState::Stopping;
            }
        }

        self.shared.shutdown.signal();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker lock poisoned"));
        for handle in workers {
            let _ = handle.join();
        }

        let timeout = self.shared.timeout();
        for probe in self.shared.registry.drain() {
            self.shared.publish(probe.into_no_reply(timeout));
        }

        *self.shared.state.lock().expect("state lock poisoned") = EngineState::Stopped;
        debug!("engine stopped");
        Ok(())
    }

    /// Blocking one-off probe, used by route discovery. Runs on its own
    /// socket outside the periodic scheduler and registers no target.
    pub fn single_shot(
        &self,
        address: IpAddr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<PingResult> {
        let version = self.shared.version;
        if !version.matches(address) {
            return Err(EngineError::AddressFamily(address));
        }

        let socket = IcmpSocket::open(version)?;
        socket.apply_hops(ttl)?;

        let identifier = random_identifier();
        let sequence = 1u16;
        let request = packet::build_echo_request(version, identifier, sequence, DEFAULT_PAYLOAD_LEN);
        let request_time = SystemTime::now();
        socket.send_to(&request, address)?;
        let sent_at = Instant::now();
        let deadline = sent_at + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Some((datagram, source)) = socket.recv_from(deadline - now)? else {
                continue;
            };
            let Some(parsed) =
                packet::parse_reply(version, &datagram, socket.includes_ip_header())
            else {
                continue;
            };

            let header_match = parsed.identifier == identifier && parsed.sequence == sequence;
            let marker_match = parsed.marker == Some((identifier, sequence));
            // On a datagram socket the kernel rewrote our identifier but
            // only delivers errors for this socket's own probes.
            let rewrite_match = socket.mode() == SocketMode::Datagram
                && parsed.kind == ReplyKind::TimeExceeded
                && parsed.sequence == sequence;
            if !(header_match || marker_match || rewrite_match) {
                continue;
            }

            let kind = match parsed.kind {
                ReplyKind::EchoReply => ResultKind::Reply,
                ReplyKind::TimeExceeded => ResultKind::TimeExceeded,
            };
            return Ok(PingResult {
                sample: 0,
                kind,
                responder: Some(source),
                request_time,
                round_trip: sent_at.elapsed(),
                target: TargetId(identifier),
                user_data: 0,
                hops: parsed.hops,
            });
        }

        Ok(PingResult {
            sample: 0,
            kind: ResultKind::NoReply,
            responder: None,
            request_time,
            round_trip: timeout,
            target: TargetId(identifier),
            user_data: 0,
            hops: None,
        })
    }

    /// Structural failure that shut the engine down, if any.
    pub fn take_error(&self) -> Option<EngineError> {
        self.shared.fatal.lock().expect("fatal lock poisoned").take()
    }

    /// Count of inbound datagrams discarded as unparseable.
    pub fn invalid_packet_count(&self) -> u64 {
        self.shared.invalid_packets.load(Ordering::Relaxed)
    }

    /// Opaque configuration blob for hosts that persist engine settings.
    pub fn save_configuration(&self) -> serde_json::Value {
        serde_json::json!({
            "interval_ms": self.shared.interval().as_millis() as u64,
            "timeout_ms": self.shared.timeout().as_millis() as u64,
        })
    }

    /// Restore settings written by `save_configuration`. Fails (returns
    /// false) once the engine has started, like the setters it drives.
    pub fn load_configuration(&self, configuration: &serde_json::Value) -> bool {
        let Some(object) = configuration.as_object() else {
            return false;
        };
        if let Some(ms) = object.get("interval_ms").and_then(|value| value.as_u64()) {
            if !self.set_interval(Duration::from_millis(ms)) {
                return false;
            }
        }
        if let Some(ms) = object.get("timeout_ms").and_then(|value| value.as_u64()) {
            if !self.set_timeout(Duration::from_millis(ms)) {
                return false;
            }
        }
        true
    }
}

impl Drop for PingEngine {
    fn drop(&mut self) {
        self.shared.shutdown.signal();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker lock poisoned"));
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn random_identifier() -> u16 {
    (rand::random::<u16>() % (u16::MAX - 1)) + 1
}

fn allocate_identifier(targets: &[TargetEntry]) -> u16 {
    let mut candidate = random_identifier();
    while targets.iter().any(|entry| entry.id.0 == candidate) {
        candidate = candidate.wrapping_add(1);
        if candidate == 0 {
            candidate = 1;
        }
    }
    candidate
}

/// One probe the transmitter is about to send; snapshotted from the target
/// table so the lock is not held across syscalls.
struct ProbeOrder {
    target: TargetId,
    address: IpAddr,
    ttl: u8,
    user_data: usize,
    sample: u64,
    sequence: u16,
}

fn transmitter_loop(shared: Arc<EngineShared>, socket: Arc<IcmpSocket>) {
    debug!("transmitter running");
    while !shared.shutdown.is_signalled() {
        let cycle_start = Instant::now();
        let interval = shared.interval();

        let orders: Vec<ProbeOrder> = {
            let mut targets = shared.targets.lock().expect("target lock poisoned");
            targets
                .iter_mut()
                .map(|entry| {
                    entry.samples += 1;
                    ProbeOrder {
                        target: entry.id,
                        address: entry.address,
                        ttl: entry.ttl,
                        user_data: entry.user_data,
                        sample: entry.samples,
                        sequence: shared.alloc_sequence(),
                    }
                })
                .collect()
        };

        for order in orders {
            if shared.shutdown.is_signalled() {
                return;
            }
            if let Err(err) = send_probe(&shared, &socket, &order) {
                match err {
                    EngineError::Socket(ref io_err)
                        if EngineError::is_transient(io_err) || is_unreachable(io_err) =>
                    {
                        debug!("probe to {} not sent: {}", order.address, io_err);
                    }
                    err => {
                        shared.record_fatal(err);
                        return;
                    }
                }
            }
        }

        let elapsed = cycle_start.elapsed();
        if elapsed < interval {
            if shared.shutdown.wait_timeout(interval - elapsed) {
                return;
            }
        }
        // Over budget: the next cycle fires immediately, no backlog builds.
    }
}

fn send_probe(shared: &EngineShared, socket: &IcmpSocket, order: &ProbeOrder) -> Result<()> {
    socket.apply_hops(order.ttl)?;
    let request = packet::build_echo_request(
        shared.version,
        order.target.0,
        order.sequence,
        DEFAULT_PAYLOAD_LEN,
    );
    socket.send_to(&request, order.address)?;

    // Registered only after the send succeeded, so an unsent probe never
    // produces a result.
    let registered = shared.registry.insert(Probe {
        key: ProbeKey {
            identifier: order.target.0,
            sequence: order.sequence,
        },
        target: order.target,
        user_data: order.user_data,
        sample: order.sample,
        sent_at: Instant::now(),
        sent_wall: SystemTime::now(),
        serviced: false,
    });
    if !registered {
        warn!(
            "sequence collision for id={} seq={}",
            order.target.0, order.sequence
        );
    }
    trace!(
        "sent probe to {} ttl={} seq={} sample={}",
        order.address,
        order.ttl,
        order.sequence,
        order.sample
    );
    Ok(())
}

/// Destination-specific delivery failures keep the engine alive; only
/// structural socket errors are fatal.
fn is_unreachable(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code)
            if code == Errno::ENETUNREACH as i32
                || code == Errno::EHOSTUNREACH as i32
                || code == Errno::EACCES as i32
    )
}

fn receiver_loop(shared: Arc<EngineShared>, socket: Arc<IcmpSocket>) {
    debug!("receiver running");
    loop {
        if shared.shutdown.is_signalled() {
            return;
        }
        let poll_timeout = (shared.timeout() / 4).clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT);
        match socket.recv_from(poll_timeout) {
            Ok(None) => continue,
            Ok(Some((datagram, source))) => {
                handle_datagram(&shared, &socket, &datagram, source);
            }
            Err(err) => {
                shared.record_fatal(err);
                return;
            }
        }
    }
}

fn handle_datagram(
    shared: &EngineShared,
    socket: &IcmpSocket,
    datagram: &[u8],
    source: IpAddr,
) {
    let Some(parsed) = packet::parse_reply(shared.version, datagram, socket.includes_ip_header())
    else {
        shared.invalid_packets.fetch_add(1, Ordering::Relaxed);
        trace!("discarded unrecognised datagram from {source}");
        return;
    };

    let key = ProbeKey {
        identifier: parsed.identifier,
        sequence: parsed.sequence,
    };
    let probe = shared
        .registry
        .claim(&key)
        .or_else(|| {
            // Echo replies carry our payload marker even when a datagram
            // socket rewrote the identifier in the header.
            parsed.marker.and_then(|(identifier, sequence)| {
                shared.registry.claim(&ProbeKey {
                    identifier,
                    sequence,
                })
            })
        })
        .or_else(|| {
            // Time Exceeded payloads embed the rewritten header, so on a
            // datagram socket fall back to the engine-unique sequence.
            if socket.mode() == SocketMode::Datagram && parsed.kind == ReplyKind::TimeExceeded {
                shared.registry.claim_by_sequence(parsed.sequence)
            } else {
                None
            }
        });

    let Some(probe) = probe else {
        trace!(
            "unmatched {:?} id={} seq={} from {}",
            parsed.kind,
            parsed.identifier,
            parsed.sequence,
            source
        );
        return;
    };

    let kind = match parsed.kind {
        ReplyKind::EchoReply => ResultKind::Reply,
        ReplyKind::TimeExceeded => ResultKind::TimeExceeded,
    };
    shared.publish(PingResult {
        sample: probe.sample,
        kind,
        responder: Some(source),
        request_time: probe.sent_wall,
        round_trip: probe.sent_at.elapsed(),
        target: probe.target,
        user_data: probe.user_data,
        hops: parsed.hops,
    });
}

fn sweeper_loop(shared: Arc<EngineShared>) {
    debug!("sweeper running");
    loop {
        let timeout = shared.timeout();
        let cadence = std::cmp::max(timeout / 4, MIN_SWEEP_CADENCE);
        if shared.shutdown.wait_timeout(cadence) {
            return;
        }
        // The sweep pass holds the registry lock; results go out after.
        let expired = shared.registry.sweep(timeout, Instant::now());
        for probe in expired {
            trace!(
                "probe id={} seq={} timed out",
                probe.key.identifier,
                probe.key.sequence
            );
            shared.publish(probe.into_no_reply(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_new_engine_defaults() {
        let engine = PingEngine::new(IpVersion::V4);
        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(engine.interval(), DEFAULT_INTERVAL);
        assert_eq!(engine.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(engine.target_count(), 0);
    }

    #[test]
    fn test_settings_before_start() {
        let engine = PingEngine::new(IpVersion::V4);
        assert!(engine.set_interval(Duration::from_millis(500)));
        assert!(engine.set_timeout(Duration::from_secs(2)));
        assert_eq!(engine.interval(), Duration::from_millis(500));
        assert_eq!(engine.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_settings_rejected_after_stop() {
        let engine = PingEngine::new(IpVersion::V4);
        engine.stop().unwrap();
        assert!(!engine.set_interval(Duration::from_millis(500)));
        assert!(!engine.set_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn test_start_after_stop_is_invalid() {
        let engine = PingEngine::new(IpVersion::V4);
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(
            engine.start(),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let engine = PingEngine::new(IpVersion::V4);
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_target_bookkeeping() {
        let engine = PingEngine::new(IpVersion::V4);
        let first = engine.add_target(v4(1)).unwrap();
        let second = engine.add_target_with_ttl(v4(2), 7).unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.target_count(), 2);
        assert_eq!(engine.target_address(first), Some(v4(1)));

        assert!(engine.set_target_user_data(second, 42));
        assert!(engine.remove_target(first));
        assert!(!engine.remove_target(first));
        assert_eq!(engine.target_count(), 1);
        assert_eq!(engine.target_address(first), None);
    }

    #[test]
    fn test_target_identifiers_are_unique() {
        let engine = PingEngine::new(IpVersion::V4);
        let mut seen = std::collections::HashSet::new();
        for last in 1..=50u8 {
            let id = engine.add_target(v4(last)).unwrap();
            assert_ne!(id.0, 0);
            assert!(seen.insert(id.0));
        }
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let engine = PingEngine::new(IpVersion::V6);
        assert!(matches!(
            engine.add_target(v4(1)),
            Err(EngineError::AddressFamily(_))
        ));
        assert!(matches!(
            engine.single_shot(v4(1), 1, Duration::from_millis(1)),
            Err(EngineError::AddressFamily(_))
        ));
    }

    #[test]
    fn test_sequence_allocation_is_monotonic() {
        let engine = PingEngine::new(IpVersion::V4);
        let first = engine.shared.alloc_sequence();
        let second = engine.shared.alloc_sequence();
        let third = engine.shared.alloc_sequence();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 3);
    }

    #[test]
    fn test_configuration_round_trip() {
        let engine = PingEngine::new(IpVersion::V4);
        engine.set_interval(Duration::from_millis(750));
        engine.set_timeout(Duration::from_millis(1500));
        let blob = engine.save_configuration();

        let restored = PingEngine::new(IpVersion::V4);
        assert!(restored.load_configuration(&blob));
        assert_eq!(restored.interval(), Duration::from_millis(750));
        assert_eq!(restored.timeout(), Duration::from_millis(1500));

        assert!(!restored.load_configuration(&serde_json::Value::Null));
    }

    #[test]
    fn test_stop_drains_in_flight_probes() {
        let engine = PingEngine::new(IpVersion::V4);
        engine.set_timeout(Duration::from_secs(1));
        let mut results = engine.subscribe();

        engine.shared.registry.insert(Probe {
            key: ProbeKey {
                identifier: 11,
                sequence: 1,
            },
            target: TargetId(11),
            user_data: 3,
            sample: 1,
            sent_at: Instant::now(),
            sent_wall: SystemTime::now(),
            serviced: false,
        });

        engine.stop().unwrap();
        let result = results.try_recv().unwrap();
        assert_eq!(result.kind, ResultKind::NoReply);
        assert_eq!(result.round_trip, Duration::from_secs(1));
        assert_eq!(result.user_data, 3);
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn test_remove_target_finalises_probes() {
        let engine = PingEngine::new(IpVersion::V4);
        let target = engine.add_target(v4(9)).unwrap();
        let mut results = engine.subscribe();

        engine.shared.registry.insert(Probe {
            key: ProbeKey {
                identifier: target.0,
                sequence: 5,
            },
            target,
            user_data: 0,
            sample: 1,
            sent_at: Instant::now(),
            sent_wall: SystemTime::now(),
            serviced: false,
        });

        assert!(engine.remove_target(target));
        let result = results.try_recv().unwrap();
        assert_eq!(result.kind, ResultKind::NoReply);
        assert_eq!(result.target, target);
    }

    // End-to-end coverage against the loopback interface. These need an
    // environment where ICMP sockets can be opened at all, so they skip
    // quietly when neither a datagram nor a raw socket is available.
    fn startable_engine(version: IpVersion) -> Option<PingEngine> {
        if IcmpSocket::open(version).is_err() {
            return None;
        }
        Some(PingEngine::new(version))
    }

    #[test]
    fn test_loopback_echo_cycles() {
        let Some(engine) = startable_engine(IpVersion::V4) else {
            return;
        };
        engine.set_interval(Duration::from_millis(200));
        engine.set_timeout(Duration::from_secs(3));
        let target = engine.add_target(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let mut results = engine.subscribe();
        engine.start().unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < 3 && Instant::now() < deadline {
            match results.try_recv() {
                Ok(result) => received.push(result),
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        engine.stop().unwrap();

        assert!(received.len() >= 3, "expected replies from loopback");
        let mut last_sample = 0;
        for result in &received {
            assert_eq!(result.kind, ResultKind::Reply);
            assert_eq!(result.target, target);
            assert!(result.round_trip < Duration::from_millis(100));
            assert!(result.sample > last_sample);
            last_sample = result.sample;
        }
    }

    #[test]
    fn test_unroutable_address_times_out() {
        let Some(engine) = startable_engine(IpVersion::V4) else {
            return;
        };
        let timeout = Duration::from_millis(500);
        engine.set_interval(Duration::from_millis(250));
        engine.set_timeout(timeout);
        // TEST-NET-1 never answers.
        engine.add_target(v4(1)).unwrap();
        let mut results = engine.subscribe();
        engine.start().unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(4);
        while received.len() < 2 && Instant::now() < deadline {
            match results.try_recv() {
                Ok(result) => received.push(result),
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        engine.stop().unwrap();

        // In an isolated environment the send itself may fail with "network
        // unreachable", in which case no probe was registered and nothing is
        // emitted; only assert on the results that exist.
        for result in &received {
            assert_eq!(result.kind, ResultKind::NoReply);
            assert_eq!(result.round_trip, timeout);
            assert!(result.responder.is_none());
        }
    }

    #[test]
    fn test_loopback_echo_v6() {
        let Some(engine) = startable_engine(IpVersion::V6) else {
            return;
        };
        engine.set_interval(Duration::from_millis(200));
        engine.set_timeout(Duration::from_secs(2));
        let address: IpAddr = "::1".parse().unwrap();
        engine.add_target(address).unwrap();
        let mut results = engine.subscribe();
        engine.start().unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < 2 && Instant::now() < deadline {
            match results.try_recv() {
                Ok(result) => received.push(result),
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        engine.stop().unwrap();

        // Loopback ICMPv6 may be unavailable in minimal containers; only
        // assert on what actually arrived.
        for result in &received {
            assert_eq!(result.kind, ResultKind::Reply);
            assert_eq!(result.responder, Some(address));
        }
    }

    #[test]
    fn test_single_shot_loopback() {
        let Some(engine) = startable_engine(IpVersion::V4) else {
            return;
        };
        let result = engine
            .single_shot(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(result.kind, ResultKind::Reply);
        assert!(result.round_trip < Duration::from_secs(2));
        assert_eq!(engine.state(), EngineState::Created);
    }
}
