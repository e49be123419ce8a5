// Individual modules import what they need

/// Time conversion utilities
pub mod time {
    use std::time::Duration;

    /// Convert Duration to milliseconds as f64
    pub fn duration_to_ms_f64(duration: Duration) -> f64 {
        duration.as_secs_f64() * 1000.0
    }

    /// Format duration as milliseconds with one decimal place
    pub fn format_duration_ms(duration: Duration) -> String {
        format!("{:.1}", duration_to_ms_f64(duration))
    }

    /// Format optional duration as milliseconds with one decimal place, or "???" if None
    pub fn format_optional_duration_ms(duration: Option<Duration>) -> String {
        duration
            .map(format_duration_ms)
            .unwrap_or_else(|| "???".to_string())
    }
}

/// Math utilities for statistics
pub mod math {
    /// Sample standard deviation around a known mean
    pub fn calculate_stddev(values: &[f64], mean: f64) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let variance = values
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / (values.len() - 1) as f64;
        variance.sqrt()
    }
}

/// Network formatting utilities
pub mod network {
    use std::net::IpAddr;

    /// Format an optional address, or "???" for hops that never answered
    pub fn format_optional_ip(addr: Option<IpAddr>) -> String {
        addr.map(|a| a.to_string()).unwrap_or_else(|| "???".to_string())
    }
}
