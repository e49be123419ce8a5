pub mod analyser;
pub mod args;
pub mod engine;
pub mod error;
pub mod hop_stats;
pub mod packet;
pub mod probe;
pub mod report;
pub mod route;
pub mod shutdown;
pub mod socket;
pub mod utils;

// Re-export commonly used types
pub use analyser::RouteAnalyser;
pub use args::Args;
pub use engine::{EngineFactory, IcmpEngineFactory, PingEngine};
pub use error::{EngineError, Result};
pub use hop_stats::HopStats;
pub use packet::IpVersion;
pub use probe::{PingResult, ProbeKey, ResultKind, TargetId};
pub use route::{find_route, find_route_with_max_hops, RouteDiscovery, RouteEvent, RouteList};

// Re-export external dependencies commonly used across modules
pub use std::net::IpAddr;
pub use std::time::Duration;
