use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pathprobe::{find_route_with_max_hops, report, Args, IcmpEngineFactory, IpVersion, RouteAnalyser};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pathprobe=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let version = if args.ipv6 {
        IpVersion::V6
    } else {
        IpVersion::V4
    };
    info!("discovering route to {}", args.target);

    let factory = Arc::new(IcmpEngineFactory);
    let mut discovery =
        find_route_with_max_hops(factory.clone(), &args.target, version, args.max_hops);

    let mut final_event = None;
    while let Some(event) = discovery.recv().await {
        if event.complete {
            final_event = Some(event);
        } else {
            info!("discovered {} hops so far", event.route.len());
        }
    }
    let route_event = final_event
        .ok_or_else(|| anyhow::anyhow!("route discovery was interrupted"))?;
    let Some(target_addr) = route_event.target else {
        anyhow::bail!(
            "failed to resolve {} for {}",
            args.target,
            version.family_name()
        );
    };
    info!(
        "route to {} complete: {} hops",
        target_addr,
        route_event.route.len()
    );

    let interval = Duration::from_millis(args.interval);
    let timeout = Duration::from_millis(args.timeout);
    let mut analyser = RouteAnalyser::new(
        factory.as_ref(),
        version,
        &route_event.route,
        interval,
        timeout,
    )?;

    analyser.start()?;

    // Drain results for the requested number of cycles, then let the
    // engine's stop() finalise whatever is still in flight.
    let deadline = tokio::time::Instant::now() + interval * args.count as u32 + timeout;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => break,
            changed = analyser.process_one() => {
                if changed.is_none() {
                    break;
                }
            }
        }
    }

    analyser.stop()?;
    // Probes that were still in flight at stop() have been finalised as
    // NoReply; fold them into the rows before reporting.
    analyser.drain_pending();
    if let Some(err) = analyser.engine().take_error() {
        anyhow::bail!("engine failed: {err}");
    }

    report::print_report(&args.target, Some(target_addr), analyser.rows());
    Ok(())
}
