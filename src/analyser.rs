//! Binds a discovered route to a continuous ping engine.
//!
//! Each responsive hop becomes an engine target probed at its own TTL, with
//! the hop index stored in the target's user-data slot; silent hops get a
//! placeholder row and no probe stream. Results are drained by a single
//! consumer and folded into the per-hop statistics rows, and row-change
//! notifications go out to subscribers who then re-read whatever fields
//! they display.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{EngineFactory, PingEngine};
use crate::error::Result;
use crate::hop_stats::HopStats;
use crate::packet::IpVersion;
use crate::probe::PingResult;
use crate::route::RouteList;

pub struct RouteAnalyser {
    engine: PingEngine,
    rows: Vec<HopStats>,
    results: mpsc::UnboundedReceiver<PingResult>,
    change_subscribers: Vec<mpsc::UnboundedSender<usize>>,
}

impl RouteAnalyser {
    /// Build an analyser over a completed (or still growing) route.
    pub fn new(
        factory: &dyn EngineFactory,
        version: IpVersion,
        route: &RouteList,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let engine = factory.create_engine(version);
        engine.set_interval(interval);
        engine.set_timeout(timeout);
        let results = engine.subscribe();

        let mut rows = Vec::with_capacity(route.len());
        for (index, hop) in route.iter().enumerate() {
            let ttl = (index + 1) as u8;
            match hop {
                Some(address) => {
                    let target = engine.add_target_with_ttl(*address, ttl)?;
                    engine.set_target_user_data(target, index);
                    rows.push(HopStats::new(ttl));
                }
                None => rows.push(HopStats::placeholder(ttl)),
            }
        }
        debug!(
            "analyser bound {} hops ({} probed)",
            rows.len(),
            engine.target_count()
        );

        Ok(Self {
            engine,
            rows,
            results,
            change_subscribers: Vec::new(),
        })
    }

    pub fn engine(&self) -> &PingEngine {
        &self.engine
    }

    pub fn rows(&self) -> &[HopStats] {
        &self.rows
    }

    pub fn start(&self) -> Result<()> {
        self.engine.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.engine.stop()
    }

    /// Stream of "row N changed" notifications. Consumers re-read the row;
    /// the notification does not say which field moved.
    pub fn subscribe_changes(&mut self) -> mpsc::UnboundedReceiver<usize> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.change_subscribers.push(sender);
        receiver
    }

    /// Fold one result into its hop row. Returns the changed row index, or
    /// `None` if the result does not map to a row.
    pub fn apply(&mut self, result: &PingResult) -> Option<usize> {
        let index = result.user_data;
        let Some(row) = self.rows.get_mut(index) else {
            debug!("result for unknown hop index {} dropped", index);
            return None;
        };
        row.record(result);
        self.change_subscribers
            .retain(|sender| sender.send(index).is_ok());
        Some(index)
    }

    /// Await the next engine result and apply it. Pends while the stream is
    /// quiet; callers bound it with their own deadline.
    pub async fn process_one(&mut self) -> Option<usize> {
        loop {
            let result = self.results.recv().await?;
            if let Some(index) = self.apply(&result) {
                return Some(index);
            }
        }
    }

    /// Apply every result already queued on the channel without waiting.
    /// Returns how many were folded in; used after `stop()` to pick up the
    /// probes the shutdown drain finalised as `NoReply`.
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(result) = self.results.try_recv() {
            if self.apply(&result).is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Opaque configuration blob; the analyser itself has nothing to
    /// persist, engine settings travel with the engine's own blob.
    pub fn save_configuration(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    pub fn load_configuration(&self, configuration: &serde_json::Value) -> bool {
        configuration.is_object()
    }
}
