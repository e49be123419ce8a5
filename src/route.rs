//! Incremental route discovery.
//!
//! Walks the TTL space from 1 upward with single-shot probes until the
//! destination answers, publishing the partially discovered route after
//! every hop. Hops that stay silent are kept as `None` placeholders so a
//! route entry's index always equals its TTL minus one.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineFactory;
use crate::error::Result;
use crate::packet::IpVersion;
use crate::probe::{PingResult, ResultKind};

/// Ordered hop list indexed by TTL - 1; silent hops are `None` and the
/// final entry is the destination itself.
pub type RouteList = Vec<Option<IpAddr>>;

/// TTL ceiling for discovery unless the caller overrides it.
pub const MAX_ROUTE_HOPS: u8 = 64;

/// Reply deadline for each discovery probe.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Progress or completion of one discovery run.
#[derive(Debug, Clone)]
pub struct RouteEvent {
    /// Resolved destination; `None` when resolution failed.
    pub target: Option<IpAddr>,
    pub route: RouteList,
    pub complete: bool,
    /// Hop count to the destination when it answered the reachability
    /// probe, otherwise -1.
    pub total_hops: i32,
    pub max_hops: u8,
}

/// Handle on a running discovery: an event stream plus cancellation.
pub struct RouteDiscovery {
    events: mpsc::UnboundedReceiver<RouteEvent>,
    cancel: CancellationToken,
}

impl RouteDiscovery {
    /// Next progress event; `None` once the worker is done and the stream
    /// is drained. A cancelled run closes the stream without a completion
    /// event.
    pub async fn recv(&mut self) -> Option<RouteEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Start an asynchronous route discovery for `host` with the default TTL
/// ceiling.
///
/// Resolution failure produces a single final event with an empty route and
/// `total_hops == -1`. Otherwise the worker walks the TTL space on a
/// blocking task, probing through a throwaway engine from `factory`.
pub fn find_route(
    factory: Arc<dyn EngineFactory>,
    host: &str,
    version: IpVersion,
) -> RouteDiscovery {
    find_route_with_max_hops(factory, host, version, MAX_ROUTE_HOPS)
}

/// Route discovery with an explicit TTL ceiling.
pub fn find_route_with_max_hops(
    factory: Arc<dyn EngineFactory>,
    host: &str,
    version: IpVersion,
    max_hops: u8,
) -> RouteDiscovery {
    let (events, receiver) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let host = host.to_string();

    tokio::spawn(async move {
        let Some(address) = resolve(&host, version).await else {
            warn!("no {} address for {}", version.family_name(), host);
            let _ = events.send(RouteEvent {
                target: None,
                route: RouteList::new(),
                complete: true,
                total_hops: -1,
                max_hops,
            });
            return;
        };
        debug!("resolved {} to {}", host, address);

        let worker = tokio::task::spawn_blocking(move || {
            let engine = factory.create_engine(version);
            walk_route(
                |ttl, timeout| engine.single_shot(address, ttl, timeout),
                address,
                max_hops,
                &events,
                &token,
            );
        });
        if let Err(err) = worker.await {
            warn!("route discovery worker failed: {}", err);
        }
    });

    RouteDiscovery {
        events: receiver,
        cancel,
    }
}

async fn resolve(host: &str, version: IpVersion) -> Option<IpAddr> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return version.matches(address).then_some(address);
    }
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let response = resolver.lookup_ip(host).await.ok()?;
    response.iter().find(|address| version.matches(*address))
}

/// The discovery loop proper, expressed over a probe function so the walk
/// logic is independent of sockets.
fn walk_route<F>(
    mut probe: F,
    destination: IpAddr,
    max_hops: u8,
    events: &mpsc::UnboundedSender<RouteEvent>,
    cancel: &CancellationToken,
) where
    F: FnMut(u8, Duration) -> Result<PingResult>,
{
    // Probe at the TTL ceiling first: if the destination is reachable at
    // all, its reply carries the hop-count metadata for every later event.
    let mut total_hops: i32 = -1;
    match probe(max_hops, DISCOVERY_TIMEOUT) {
        Ok(result) if result.kind == ResultKind::Reply => {
            total_hops = result.hops.map_or(-1, i32::from);
        }
        Ok(_) => {}
        Err(err) => debug!("reachability probe failed: {}", err),
    }

    let progress = |route: &RouteList, complete: bool| {
        events
            .send(RouteEvent {
                target: Some(destination),
                route: route.clone(),
                complete,
                total_hops,
                max_hops,
            })
            .is_ok()
    };

    let mut route = RouteList::new();
    for ttl in 1..=max_hops {
        if cancel.is_cancelled() {
            debug!("route discovery cancelled at ttl {}", ttl);
            return;
        }
        match probe(ttl, DISCOVERY_TIMEOUT) {
            Ok(result) => match result.kind {
                ResultKind::Reply => {
                    route.push(Some(result.responder.unwrap_or(destination)));
                    break;
                }
                ResultKind::TimeExceeded => route.push(result.responder),
                ResultKind::NoReply => route.push(None),
            },
            Err(err) => {
                debug!("probe at ttl {} failed: {}", ttl, err);
                route.push(None);
            }
        }
        if !progress(&route, false) {
            return;
        }
    }

    info!(
        "route to {} complete after {} hops",
        destination,
        route.len()
    );

    // The final hop is emitted twice, first as ordinary progress and then
    // with the completion flag, so every hop produces exactly one
    // incremental event for listeners.
    if !progress(&route, false) {
        return;
    }
    let _ = progress(&route, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TargetId;
    use std::net::Ipv4Addr;
    use std::time::SystemTime;

    fn scripted_result(kind: ResultKind, responder: Option<IpAddr>) -> PingResult {
        PingResult {
            sample: 0,
            kind,
            responder,
            request_time: SystemTime::now(),
            round_trip: Duration::from_millis(10),
            target: TargetId(1),
            user_data: 0,
            hops: Some(4),
        }
    }

    fn hop(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn destination() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
    }

    /// Scripted path: routers at TTL 1 and 2, a silent hop at TTL 3 and the
    /// destination at TTL 4. The first probe is the reachability check at
    /// the TTL ceiling.
    fn scripted_probe(ttl: u8, _timeout: Duration) -> Result<PingResult> {
        Ok(match ttl {
            MAX_ROUTE_HOPS => scripted_result(ResultKind::Reply, Some(destination())),
            1 => scripted_result(ResultKind::TimeExceeded, Some(hop(1))),
            2 => scripted_result(ResultKind::TimeExceeded, Some(hop(2))),
            3 => scripted_result(ResultKind::NoReply, None),
            _ => scripted_result(ResultKind::Reply, Some(destination())),
        })
    }

    fn collect_events(
        probe: impl FnMut(u8, Duration) -> Result<PingResult>,
        max_hops: u8,
        cancel: &CancellationToken,
    ) -> Vec<RouteEvent> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        walk_route(probe, destination(), max_hops, &sender, cancel);
        drop(sender);
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_walk_orders_hops_by_ttl() {
        let events = collect_events(scripted_probe, MAX_ROUTE_HOPS, &CancellationToken::new());
        let last = events.last().unwrap();

        assert!(last.complete);
        assert_eq!(last.route.len(), 4);
        assert_eq!(last.route[0], Some(hop(1)));
        assert_eq!(last.route[1], Some(hop(2)));
        assert_eq!(last.route[2], None);
        assert_eq!(last.route[3], Some(destination()));
        assert_eq!(last.total_hops, 4);
        assert_eq!(last.target, Some(destination()));
    }

    #[test]
    fn test_silent_hop_does_not_block_completion() {
        let events = collect_events(scripted_probe, MAX_ROUTE_HOPS, &CancellationToken::new());
        assert!(events.iter().any(|event| event.complete));
    }

    #[test]
    fn test_final_hop_emitted_as_progress_then_completion() {
        let events = collect_events(scripted_probe, MAX_ROUTE_HOPS, &CancellationToken::new());
        // TTLs 1-3 emit one progress event each, the final hop two more.
        assert_eq!(events.len(), 5);
        let (final_progress, completion) = (&events[3], &events[4]);
        assert!(!final_progress.complete);
        assert!(completion.complete);
        assert_eq!(final_progress.route, completion.route);
    }

    #[test]
    fn test_every_progress_event_grows_the_route() {
        let events = collect_events(scripted_probe, MAX_ROUTE_HOPS, &CancellationToken::new());
        for (index, event) in events.iter().take(4).enumerate() {
            assert_eq!(event.route.len(), index + 1);
        }
    }

    #[test]
    fn test_exhausted_walk_reports_max_hops() {
        let probe =
            |_ttl: u8, _timeout: Duration| Ok(scripted_result(ResultKind::NoReply, None));
        let events = collect_events(probe, MAX_ROUTE_HOPS, &CancellationToken::new());
        let last = events.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.route.len(), usize::from(MAX_ROUTE_HOPS));
        assert!(last.route.iter().all(Option::is_none));
        assert_eq!(last.total_hops, -1);
    }

    #[test]
    fn test_walk_honours_custom_hop_ceiling() {
        let probe =
            |_ttl: u8, _timeout: Duration| Ok(scripted_result(ResultKind::NoReply, None));
        let events = collect_events(probe, 5, &CancellationToken::new());
        let last = events.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.route.len(), 5);
        assert_eq!(last.max_hops, 5);
    }

    #[test]
    fn test_cancelled_walk_emits_no_completion() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events = collect_events(scripted_probe, MAX_ROUTE_HOPS, &cancel);
        assert!(events.iter().all(|event| !event.complete));
    }

    #[test]
    fn test_probe_errors_count_as_silent_hops() {
        let probe = |ttl: u8, _timeout: Duration| match ttl {
            MAX_ROUTE_HOPS => Ok(scripted_result(ResultKind::NoReply, None)),
            1 => Err(crate::error::EngineError::PermissionDenied),
            _ => Ok(scripted_result(ResultKind::Reply, Some(destination()))),
        };
        let events = collect_events(probe, MAX_ROUTE_HOPS, &CancellationToken::new());
        let last = events.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.route[0], None);
        assert_eq!(last.route[1], Some(destination()));
    }

    #[tokio::test]
    async fn test_resolution_failure_yields_empty_final_route() {
        let factory = Arc::new(crate::engine::IcmpEngineFactory);
        let mut discovery = find_route(factory, "host.invalid", IpVersion::V4);
        let event = discovery.recv().await.unwrap();
        assert!(event.complete);
        assert!(event.target.is_none());
        assert!(event.route.is_empty());
        assert_eq!(event.total_hops, -1);
        assert!(discovery.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_find_route_to_loopback() {
        use crate::socket::IcmpSocket;
        if IcmpSocket::open(IpVersion::V4).is_err() {
            return;
        }
        let factory = Arc::new(crate::engine::IcmpEngineFactory);
        let mut discovery = find_route(factory, "127.0.0.1", IpVersion::V4);
        let mut last = None;
        while let Some(event) = discovery.recv().await {
            last = Some(event);
        }
        let last = last.unwrap();
        assert!(last.complete);
        assert_eq!(last.route.last(), Some(&Some("127.0.0.1".parse().unwrap())));
        assert!(last.route.len() <= usize::from(MAX_ROUTE_HOPS));
    }
}
