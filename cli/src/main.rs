mod cli;
mod sim;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use common::logger::{TraceId, init_logger, root_span};
use selector::SelectorConfig;

use crate::cli::{Cli, ReportFormat};
use crate::sim::{SimParams, run};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger("selector-sim", cli.json);

    let mut config = SelectorConfig::from_env();
    if let Some(limit) = cli.exclusion_limit {
        config.exclusion_limit = limit;
    }

    let seed = cli.seed.unwrap_or_else(rand::random);
    let span = root_span("simulation", &TraceId::new());
    span.record("seed", seed);
    let _guard = span.enter();

    let params = SimParams {
        items: cli.items,
        trials: cli.trials,
        cooldown_every: cli.cooldown_every,
        cooldown_ms: cli.cooldown_ms,
        seed,
        start_ms: common::time::now_ms(),
    };
    info!(clients = params.items.len(), trials = params.trials, "starting simulation");

    let report = run(&params, config).context("simulation failed")?;

    match cli.report {
        ReportFormat::Text => print!("{}", report.to_table()),
        ReportFormat::Json => {
            let doc = serde_json::to_string_pretty(&report).context("serializing report")?;
            println!("{doc}");
        }
    }
    Ok(())
}
