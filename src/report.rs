use crate::hop_stats::HopStats;
use crate::utils;

fn format_header() -> String {
    format!(
        "{:24} {:>6} {:>5} {:>7} {:>7} {:>6} {:>6} {:>6} {:>6}",
        "", "Loss%", "Snt", "Last", "Avg", "Best", "Wrst", "StDev", "Jttr"
    )
}

/// Spread of the hop's recent round trips, in milliseconds.
fn round_trip_spread(hop: &HopStats) -> f64 {
    let Some(avg) = hop.avg_rtt else {
        return 0.0;
    };
    if hop.rtts.len() < 2 {
        return 0.0;
    }
    let samples: Vec<f64> = hop
        .rtts
        .iter()
        .copied()
        .map(utils::time::duration_to_ms_f64)
        .collect();
    utils::math::calculate_stddev(&samples, utils::time::duration_to_ms_f64(avg))
}

fn format_row(hop: &HopStats) -> String {
    let host = utils::network::format_optional_ip(hop.responder);
    let loss = match hop.loss_percent() {
        Some(loss) => format!("{:5.1}%", loss),
        None => "  ???".to_string(),
    };
    let stddev = round_trip_spread(hop);

    format!(
        "{:2}.|-- {:17} {:>6} {:>5} {:>7} {:>7} {:>6} {:>6} {:>6.1} {:>6}",
        hop.ttl,
        host,
        loss,
        hop.samples(),
        utils::time::format_optional_duration_ms(hop.last_rtt),
        utils::time::format_optional_duration_ms(hop.avg_rtt),
        utils::time::format_optional_duration_ms(hop.best_rtt),
        utils::time::format_optional_duration_ms(hop.worst_rtt),
        stddev,
        utils::time::format_optional_duration_ms(hop.jitter_avg),
    )
}

/// Print the per-hop table for a finished measurement run.
pub fn print_report(target: &str, target_addr: Option<std::net::IpAddr>, rows: &[HopStats]) {
    println!(
        "Start: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "HOST: localhost -> {} ({})",
        target,
        utils::network::format_optional_ip(target_addr)
    );
    println!();
    println!("{}", format_header());

    for hop in rows {
        println!("{}", format_row(hop));
    }
}
