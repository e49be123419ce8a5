use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "pathprobe")]
#[command(about = "Continuous ping-path analyser: discovers the route to a host and probes every hop")]
#[command(version)]
pub struct Args {
    /// Target hostname or IP address
    pub target: String,

    /// Number of probe cycles to run before reporting
    #[arg(short, long, default_value = "10")]
    pub count: usize,

    /// Wait time between probe cycles in milliseconds
    #[arg(short, long, default_value = "1000")]
    pub interval: u64,

    /// Reply timeout in milliseconds
    #[arg(short, long, default_value = "3000")]
    pub timeout: u64,

    /// Maximum number of hops to walk during route discovery
    #[arg(short = 'M', long, default_value = "64")]
    pub max_hops: u8,

    /// Probe over IPv6 instead of IPv4
    #[arg(short = '6', long)]
    pub ipv6: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["pathprobe", "example.com"]).unwrap();
        assert_eq!(args.target, "example.com");
        assert_eq!(args.count, 10);
        assert_eq!(args.interval, 1000);
        assert_eq!(args.timeout, 3000);
        assert_eq!(args.max_hops, 64);
        assert!(!args.ipv6);
    }

    #[test]
    fn test_args_custom_values() {
        let args = Args::try_parse_from([
            "pathprobe",
            "--count",
            "20",
            "--interval",
            "500",
            "--timeout",
            "1500",
            "--max-hops",
            "30",
            "-6",
            "one.one.one.one",
        ])
        .unwrap();

        assert_eq!(args.target, "one.one.one.one");
        assert_eq!(args.count, 20);
        assert_eq!(args.interval, 500);
        assert_eq!(args.timeout, 1500);
        assert_eq!(args.max_hops, 30);
        assert!(args.ipv6);
    }

    #[test]
    fn test_args_short_flags() {
        let args = Args::try_parse_from([
            "pathprobe",
            "-c",
            "5",
            "-i",
            "250",
            "-t",
            "900",
            "-M",
            "16",
            "198.51.100.4",
        ])
        .unwrap();
        assert_eq!(args.target, "198.51.100.4");
        assert_eq!(args.count, 5);
        assert_eq!(args.interval, 250);
        assert_eq!(args.timeout, 900);
        assert_eq!(args.max_hops, 16);
    }
}
