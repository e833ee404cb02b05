//! Statistical checks on the pick distribution. Seeded, so deterministic.


use std::collections::HashMap;

use rand::SeedableRng;
use rand::rngs::StdRng;

use selector::{NoExclusion, SelectionTree, SelectorConfig};
use test_item::Job;

const NOW: u64 = 1_000;

fn chi_squared(observed: &[usize], expected: f64) -> f64 {
    observed
        .iter()
        .map(|&o| {
            let d = o as f64 - expected;
            d * d / expected
        })
        .sum()
}

#[test]
fn clients_are_picked_uniformly_regardless_of_queue_length() {
    let sizes = [1usize, 10, 100, 1, 1];
    let clients = ["c0", "c1", "c2", "c3", "c4"];
    let trials = 10_000;

    let mut tree: SelectionTree<&'static str, Job> = SelectionTree::default();
    let root = tree.new_sector();
    let mut client_of = HashMap::new();
    let mut next_id = 0;
    for (client, &n) in clients.iter().zip(&sizes) {
        for _ in 0..n {
            tree.add(root, *client, Job::ready(next_id)).unwrap();
            client_of.insert(next_id, *client);
            next_id += 1;
        }
    }

    let mut rng = StdRng::seed_from_u64(42);
    let mut hits: HashMap<&str, usize> = HashMap::new();
    for _ in 0..trials {
        let job = tree
            .remove_random(root, &NoExclusion, NOW, &mut rng)
            .unwrap()
            .into_item()
            .expect("every client always has a ready item");
        let client = client_of[&job.id];
        *hits.entry(client).or_default() += 1;
        // Put it back so no client ever runs dry.
        tree.add(root, client, job).unwrap();
    }

    let observed: Vec<usize> = clients.iter().map(|c| hits.get(c).copied().unwrap_or(0)).collect();
    let chi2 = chi_squared(&observed, trials as f64 / clients.len() as f64);
    // 4 degrees of freedom, p = 0.001
    assert!(chi2 < 18.47, "chi2 = {chi2:.2}, hits = {observed:?}");
    assert_eq!(tree.item_count(root).unwrap(), sizes.iter().sum::<usize>());
}

fn leaf_distribution(exclusion_limit: usize) -> Vec<usize> {
    let cfg = SelectorConfig {
        exclusion_limit,
        block_size: 8,
        min_block_size: 2,
    };
    let mut tree: SelectionTree<&'static str, Job> = SelectionTree::new(cfg);
    let leaf = tree.new_leaf();
    for id in 0..20 {
        tree.add_to_leaf(leaf, Job::ready(id)).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(exclusion_limit as u64);
    let mut hits = vec![0usize; 20];
    for _ in 0..20_000 {
        let job = tree
            .remove_random(leaf, &NoExclusion, NOW, &mut rng)
            .unwrap()
            .into_item()
            .expect("ready item");
        hits[job.id] += 1;
        tree.add_to_leaf(leaf, job).unwrap();
    }
    hits
}

#[test]
fn items_within_a_leaf_are_picked_uniformly() {
    // 20 items: limit 5 probes random slots, limit 50 scans exhaustively.
    for limit in [5usize, 50] {
        let hits = leaf_distribution(limit);
        let chi2 = chi_squared(&hits, 1_000.0);
        // 19 degrees of freedom, p = 0.001
        assert!(chi2 < 43.82, "limit {limit}: chi2 = {chi2:.2}, hits = {hits:?}");
    }
}
