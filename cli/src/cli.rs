use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[clap(name = "selector-sim", version)]
pub struct Cli {
    /// Items queued per client (comma-separated); one client per entry
    #[clap(long, value_delimiter = ',', default_values_t = [1usize, 10, 100, 1, 1])]
    pub items: Vec<usize>,

    /// Number of selections to run
    #[clap(long, default_value_t = 10_000)]
    pub trials: usize,

    /// Every K-th item of each client starts in cooldown (0 = none)
    #[clap(long, default_value_t = 0)]
    pub cooldown_every: usize,

    /// Cooldown length for those items, in milliseconds
    #[clap(long, default_value_t = 5_000)]
    pub cooldown_ms: u64,

    /// RNG seed; random if omitted
    #[clap(long)]
    pub seed: Option<u64>,

    /// Overrides SELECTOR_EXCLUSION_LIMIT
    #[clap(long)]
    pub exclusion_limit: Option<usize>,

    /// Emit logs as JSON
    #[clap(long)]
    pub json: bool,

    #[clap(long, value_enum, default_value_t = ReportFormat::Text)]
    pub report: ReportFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_fairness_setup() {
        let cli = Cli::parse_from(["selector-sim"]);
        assert_eq!(cli.items, vec![1, 10, 100, 1, 1]);
        assert_eq!(cli.trials, 10_000);
        assert_eq!(cli.report, ReportFormat::Text);
        assert!(cli.seed.is_none());
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "selector-sim",
            "--items",
            "3,4",
            "--cooldown-every",
            "2",
            "--seed",
            "9",
            "--report",
            "json",
        ]);
        assert_eq!(cli.items, vec![3, 4]);
        assert_eq!(cli.cooldown_every, 2);
        assert_eq!(cli.seed, Some(9));
        assert_eq!(cli.report, ReportFormat::Json);
    }
}
