//! Anonymizer (C4): maps real model identities to opaque labels for Stage 2
//! prompts, deterministically per request so every ranker sees the same
//! label assignment.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A label ↔ model id bijection scoped to one Stage-2 invocation (one round).
#[derive(Debug, Clone)]
pub struct AnonLabelMap {
    label_to_model: HashMap<String, String>,
    model_to_label: HashMap<String, String>,
    order: Vec<String>,
}

impl AnonLabelMap {
    /// Build a deterministic shuffle of `model_ids` keyed off `seed`. Labels
    /// are assigned `A, B, C, …` in the shuffled order.
    pub fn new(model_ids: &[String], seed: u64) -> Self {
        let mut shuffled = model_ids.to_vec();
        let mut rng = StdRng::seed_from_u64(seed);
        // Fisher-Yates, driven by a seeded RNG so the same seed always
        // produces the same permutation.
        for i in (1..shuffled.len()).rev() {
            let j = rng.gen_range(0..=i);
            shuffled.swap(i, j);
        }

        let mut label_to_model = HashMap::new();
        let mut model_to_label = HashMap::new();
        let mut order = Vec::new();
        for (i, model) in shuffled.into_iter().enumerate() {
            let label = label_for_index(i);
            order.push(label.clone());
            label_to_model.insert(label.clone(), model.clone());
            model_to_label.insert(model, label);
        }

        Self {
            label_to_model,
            model_to_label,
            order,
        }
    }

    pub fn label_for(&self, model_id: &str) -> Option<&str> {
        self.model_to_label.get(model_id).map(String::as_str)
    }

    pub fn model_for(&self, label: &str) -> Option<&str> {
        self.label_to_model.get(label).map(String::as_str)
    }

    pub fn labels_in_order(&self) -> &[String] {
        &self.order
    }

    /// Build the view presented to ranker `ranker_model`: every labeled
    /// response except the ranker's own (P3: self-exclusion).
    pub fn view_excluding<'a>(
        &'a self,
        ranker_model: &str,
        contents: &'a HashMap<String, String>,
    ) -> Vec<(&'a str, &'a str)> {
        self.order
            .iter()
            .filter_map(|label| {
                let model = self.label_to_model.get(label)?;
                if model == ranker_model {
                    return None;
                }
                let content = contents.get(model)?;
                Some((label.as_str(), content.as_str()))
            })
            .collect()
    }
}

fn label_for_index(i: usize) -> String {
    // A..Z, then AA, AB, ... for councils larger than 26 (generously future
    // proof; realistic councils are single digits).
    let mut n = i;
    let mut chars = Vec::new();
    loop {
        let rem = (n % 26) as u8;
        chars.push((b'A' + rem) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    chars.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("model-{i}")).collect()
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let ids = models(4);
        let a = AnonLabelMap::new(&ids, 42);
        let b = AnonLabelMap::new(&ids, 42);
        assert_eq!(a.order, b.order);
        for id in &ids {
            assert_eq!(a.label_for(id), b.label_for(id));
        }
    }

    #[test]
    fn test_bijection_roundtrip() {
        let ids = models(5);
        let map = AnonLabelMap::new(&ids, 7);
        for id in &ids {
            let label = map.label_for(id).unwrap();
            assert_eq!(map.model_for(label), Some(id.as_str()));
        }
    }

    #[test]
    fn test_self_exclusion() {
        let ids = models(3);
        let map = AnonLabelMap::new(&ids, 1);
        let mut contents = HashMap::new();
        for id in &ids {
            contents.insert(id.clone(), format!("draft from {id}"));
        }
        let view = map.view_excluding(&ids[0], &contents);
        assert_eq!(view.len(), ids.len() - 1);
        assert!(view.iter().all(|(_, content)| !content.contains(&ids[0])));
    }

    #[test]
    fn test_labels_distinct() {
        let ids = models(6);
        let map = AnonLabelMap::new(&ids, 99);
        let mut labels: Vec<&String> = map.order.iter().collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), ids.len());
    }
}
