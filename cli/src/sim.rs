//! Synthetic workload driven through a single root sector.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info};

use common::logger::child_span;
use selector::{
    NoExclusion, OwnerSlot, Readiness, Schedulable, Selection, SelectionTree, SelectorConfig,
    Timestamp, TreeError,
};

#[derive(Debug, Clone)]
pub struct SimParams {
    pub items: Vec<usize>,
    pub trials: usize,
    pub cooldown_every: usize,
    pub cooldown_ms: u64,
    pub seed: u64,
    pub start_ms: Timestamp,
}

/// One queued request of a synthetic client.
struct SimItem {
    client: usize,
    ready_at: Timestamp,
    owner: OwnerSlot,
}

impl Schedulable for SimItem {
    fn readiness(&self, now: Timestamp) -> Readiness {
        if self.ready_at > now {
            Readiness::Cooldown(self.ready_at)
        } else {
            Readiness::Ready
        }
    }

    fn owner_slot(&self) -> &OwnerSlot {
        &self.owner
    }
}

#[derive(Debug, Serialize)]
pub struct ClientReport {
    pub client: usize,
    pub items: usize,
    pub picks: usize,
    pub share: f64,
}

#[derive(Debug, Serialize)]
pub struct SimReport {
    pub seed: u64,
    pub trials: usize,
    pub picks: usize,
    pub wakeups: usize,
    pub empties: usize,
    /// Simulated time consumed, including jumps to reported wakeups.
    pub elapsed_ms: u64,
    pub clients: Vec<ClientReport>,
}

impl SimReport {
    pub fn to_table(&self) -> String {
        let header = format!("{:>8} {:>8} {:>8} {:>8}", "client", "items", "picks", "share");
        let rows = self.clients.iter().map(|c| {
            format!(
                "{:>8} {:>8} {:>8} {:>7.2}%",
                c.client,
                c.items,
                c.picks,
                c.share * 100.0
            )
        });
        let footer = format!(
            "seed {} | {} trials | {} picks | {} wakeups | {} empty | {} ms simulated",
            self.seed, self.trials, self.picks, self.wakeups, self.empties, self.elapsed_ms
        );

        let mut lines: Vec<String> = std::iter::once(header).chain(rows).collect();
        lines.push(footer);
        lines.join("\n") + "\n"
    }
}

/// Build the tree, run `trials` selections re-queueing every pick, and tally.
pub fn run(params: &SimParams, config: SelectorConfig) -> Result<SimReport, TreeError> {
    let _span = child_span("run").entered();

    let mut tree: SelectionTree<usize, SimItem> = SelectionTree::new(config);
    let root = tree.new_sector();

    for (client, &count) in params.items.iter().enumerate() {
        for n in 0..count {
            let cooling = params.cooldown_every > 0 && (n + 1) % params.cooldown_every == 0;
            let ready_at = if cooling {
                params.start_ms + params.cooldown_ms
            } else {
                0
            };
            let item = Arc::new(SimItem {
                client,
                ready_at,
                owner: OwnerSlot::new(),
            });
            tree.add(root, client, item)?;
        }
    }
    info!(
        clients = tree.len(root)?,
        items = tree.item_count(root)?,
        "tree populated"
    );

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut now = params.start_ms;
    let mut picks = vec![0usize; params.items.len()];
    let (mut wakeups, mut empties) = (0usize, 0usize);

    for _ in 0..params.trials {
        match tree.remove_random(root, &NoExclusion, now, &mut rng)? {
            Selection::Item(item) => {
                picks[item.client] += 1;
                let client = item.client;
                tree.add(root, client, item)?;
            }
            Selection::Wakeup(at) => {
                debug!(now, wakeup = at, "everything cooling; jumping ahead");
                wakeups += 1;
                now = at;
                continue;
            }
            Selection::Empty => {
                empties += 1;
                break;
            }
        }
        now += 1;
    }

    let total: usize = picks.iter().sum();
    let clients = params
        .items
        .iter()
        .zip(&picks)
        .enumerate()
        .map(|(client, (&items, &picked))| ClientReport {
            client,
            items,
            picks: picked,
            share: if total == 0 {
                0.0
            } else {
                picked as f64 / total as f64
            },
        })
        .collect();

    Ok(SimReport {
        seed: params.seed,
        trials: params.trials,
        picks: total,
        wakeups,
        empties,
        elapsed_ms: now - params.start_ms,
        clients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(items: Vec<usize>) -> SimParams {
        SimParams {
            items,
            trials: 5_000,
            cooldown_every: 0,
            cooldown_ms: 1_000,
            seed: 17,
            start_ms: 1_000_000,
        }
    }

    #[test]
    fn every_trial_is_a_pick_when_nothing_cools() {
        let report = run(&params(vec![1, 10, 100]), SelectorConfig::default()).unwrap();

        assert_eq!(report.picks, 5_000);
        assert_eq!(report.wakeups, 0);
        assert_eq!(report.empties, 0);
        for c in &report.clients {
            assert!(
                (0.28..0.39).contains(&c.share),
                "client {} share {:.3}",
                c.client,
                c.share
            );
        }
    }

    #[test]
    fn all_cooling_reports_a_wakeup_then_proceeds() {
        let mut p = params(vec![2, 2]);
        p.cooldown_every = 1;
        p.trials = 10;

        let report = run(&p, SelectorConfig::default()).unwrap();
        assert_eq!(report.wakeups, 1);
        assert_eq!(report.picks, 9);
        assert!(report.elapsed_ms >= 1_000);
    }

    #[test]
    fn no_clients_is_empty() {
        let report = run(&params(vec![]), SelectorConfig::default()).unwrap();
        assert_eq!(report.empties, 1);
        assert_eq!(report.picks, 0);
        assert!(report.to_table().contains("0 picks"));
    }

    #[test]
    fn table_has_header_one_row_per_client_and_footer() {
        let report = run(&params(vec![1, 1]), SelectorConfig::default()).unwrap();
        let table = report.to_table();
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("client") && lines[0].contains("share"));
        assert!(lines[1].trim_start().starts_with('0'));
        assert!(lines[3].starts_with("seed 17"));
        assert!(table.ends_with('\n'));
    }

    #[test]
    fn report_serializes() {
        let report = run(&params(vec![1, 1]), SelectorConfig::default()).unwrap();
        let doc = serde_json::to_value(&report).unwrap();
        assert_eq!(doc["clients"].as_array().map(Vec::len), Some(2));
        assert_eq!(doc["seed"], 17);
    }
}
