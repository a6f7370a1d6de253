//! Ranking Parser (C3): extracts an ordered list of labeled responses with
//! optional quality scores from a ranker model's free-form text.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedLabel {
    pub label: String,
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseResult {
    pub ordering: Vec<RankedLabel>,
    pub warnings: Vec<String>,
}

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static pattern compiles"));

static FINAL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)final\s+ranking").expect("static pattern compiles"));

static RANKING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:#|\d+[.)])\s*(?:Response\s+)?([A-Z])\b.*?(?:\(?\s*([0-9](?:\.[0-9])?)\s*/\s*5\)?)?")
        .expect("static pattern compiles")
});

/// Parse a ranker's raw text into an ordered label list with scores.
/// `expected_labels` is the number of responses the ranker was shown
/// (the anonymized view size); a warning is emitted when fewer labels
/// are recovered than that (§4.3 rule 5).
pub fn parse_ranking(raw: &str, expected_labels: usize) -> ParseResult {
    let without_thinking = THINK_BLOCK.replace_all(raw, "");
    let lines: Vec<&str> = without_thinking.lines().collect();

    let candidate_lines = extract_ranking_block(&lines);

    let mut seen = std::collections::HashSet::new();
    let mut ordering = Vec::new();
    let mut warnings = Vec::new();

    for line in &candidate_lines {
        let Some(caps) = RANKING_LINE.captures(line) else {
            continue;
        };
        let label = caps.get(1).map(|m| m.as_str().to_string());
        let Some(label) = label else { continue };
        if !seen.insert(label.clone()) {
            continue; // dedupe by label, keep first occurrence
        }
        let score = caps.get(2).and_then(|m| m.as_str().parse::<f32>().ok());
        ordering.push(RankedLabel { label, score });
    }

    if ordering.is_empty() {
        warnings.push("unparseable: no ranking lines matched".to_string());
    } else if ordering.len() < expected_labels {
        warnings.push(format!(
            "fewer labels than expected: found {} of {expected_labels}",
            ordering.len()
        ));
    }

    ParseResult { ordering, warnings }
}

/// Find the block of lines that make up the final ranking: prefer an
/// explicit "FINAL RANKING" marker; otherwise fall back to the last
/// contiguous run of ordinal-prefixed lines.
fn extract_ranking_block<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    if let Some(marker_idx) = lines.iter().position(|l| FINAL_MARKER.is_match(l)) {
        return lines[marker_idx + 1..].to_vec();
    }

    let mut best_run: Vec<&str> = Vec::new();
    let mut current_run: Vec<&str> = Vec::new();
    for line in lines {
        if RANKING_LINE.is_match(line) {
            current_run.push(line);
        } else if !line.trim().is_empty() {
            if current_run.len() > best_run.len() {
                best_run = std::mem::take(&mut current_run);
            } else {
                current_run.clear();
            }
        }
    }
    if current_run.len() > best_run.len() {
        best_run = current_run;
    }
    best_run
}

/// Compute the aggregate ranking across multiple rankers (§4.3). Each
/// ranker's ordering is converted to a 1-indexed position per label; the
/// aggregate is the mean position, ascending, tie-broken by higher mean
/// quality score then lexicographic label.
pub fn aggregate_rankings(per_ranker: &[Vec<RankedLabel>]) -> (Vec<String>, HashMap<String, f64>, HashMap<String, f64>) {
    let mut positions: HashMap<String, Vec<f64>> = HashMap::new();
    let mut scores: HashMap<String, Vec<f64>> = HashMap::new();

    for ordering in per_ranker {
        for (idx, entry) in ordering.iter().enumerate() {
            positions
                .entry(entry.label.clone())
                .or_default()
                .push((idx + 1) as f64);
            if let Some(score) = entry.score {
                scores.entry(entry.label.clone()).or_default().push(score as f64);
            }
        }
    }

    let mean_position: HashMap<String, f64> = positions
        .iter()
        .map(|(label, ps)| (label.clone(), ps.iter().sum::<f64>() / ps.len() as f64))
        .collect();

    let mean_quality: HashMap<String, f64> = scores
        .iter()
        .map(|(label, ss)| (label.clone(), ss.iter().sum::<f64>() / ss.len() as f64))
        .collect();

    let mut labels: Vec<String> = mean_position.keys().cloned().collect();
    labels.sort_by(|a, b| {
        let pa = mean_position[a];
        let pb = mean_position[b];
        pa.partial_cmp(&pb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let qa = mean_quality.get(a).copied().unwrap_or(f64::MIN);
                let qb = mean_quality.get(b).copied().unwrap_or(f64::MIN);
                qb.partial_cmp(&qa).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.cmp(b))
    });

    (labels, mean_position, mean_quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_final_ranking_marker() {
        let text = "A is solid, B is thin.\n\nFINAL RANKING:\n1. A (4.5/5)\n2. B (3/5)\n";
        let result = parse_ranking(text, 2);
        assert_eq!(result.ordering.len(), 2);
        assert_eq!(result.ordering[0].label, "A");
        assert_eq!(result.ordering[0].score, Some(4.5));
        assert_eq!(result.ordering[1].label, "B");
        assert_eq!(result.ordering[1].score, Some(3.0));
    }

    #[test]
    fn test_parse_without_marker_uses_ordinal_run() {
        let text = "Some commentary here.\n#1 Response A (5/5)\n#2 Response B (2/5)\nThanks.";
        let result = parse_ranking(text, 2);
        assert_eq!(result.ordering.len(), 2);
        assert_eq!(result.ordering[0].label, "A");
        assert_eq!(result.ordering[1].label, "B");
    }

    #[test]
    fn test_parse_strips_think_block() {
        let text = "<think>1. C (1/5)</think>FINAL RANKING:\n1. A (5/5)\n2. B (4/5)";
        let result = parse_ranking(text, 2);
        assert_eq!(result.ordering.len(), 2);
        assert!(result.ordering.iter().all(|r| r.label != "C"));
    }

    #[test]
    fn test_parse_missing_score_defaults_null() {
        let text = "FINAL RANKING:\n1. A\n2. B";
        let result = parse_ranking(text, 2);
        assert_eq!(result.ordering[0].score, None);
    }

    #[test]
    fn test_parse_dedupes_keeping_first() {
        let text = "FINAL RANKING:\n1. A (5/5)\n2. A (1/5)\n3. B (3/5)";
        let result = parse_ranking(text, 2);
        assert_eq!(result.ordering.len(), 2);
        assert_eq!(result.ordering[0].score, Some(5.0));
    }

    #[test]
    fn test_parse_unparseable_emits_warning() {
        let result = parse_ranking("I refuse to rank these.", 2);
        assert!(result.ordering.is_empty());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_parse_fewer_labels_than_expected_emits_warning() {
        let text = "FINAL RANKING:\n1. A (5/5)";
        let result = parse_ranking(text, 3);
        assert_eq!(result.ordering.len(), 1);
        assert!(result.warnings.iter().any(|w| w.contains("fewer labels")));
    }

    #[test]
    fn test_aggregate_simple_majority() {
        let a: Vec<RankedLabel> = vec![
            RankedLabel { label: "A".into(), score: Some(5.0) },
            RankedLabel { label: "B".into(), score: Some(4.0) },
        ];
        let b: Vec<RankedLabel> = vec![
            RankedLabel { label: "A".into(), score: Some(4.5) },
            RankedLabel { label: "B".into(), score: Some(3.5) },
        ];
        let (ordering, _, _) = aggregate_rankings(&[a, b]);
        assert_eq!(ordering, vec!["A", "B"]);
    }

    #[test]
    fn test_aggregate_order_independence() {
        // P6: aggregate ranking is a pure function of the per-ranker
        // orderings, independent of the order those orderings are supplied.
        let a: Vec<RankedLabel> = vec![
            RankedLabel { label: "A".into(), score: Some(5.0) },
            RankedLabel { label: "B".into(), score: Some(1.0) },
        ];
        let b: Vec<RankedLabel> = vec![
            RankedLabel { label: "B".into(), score: Some(1.0) },
            RankedLabel { label: "A".into(), score: Some(5.0) },
        ];
        let (ord1, _, _) = aggregate_rankings(&[a.clone(), b.clone()]);
        let (ord2, _, _) = aggregate_rankings(&[b, a]);
        assert_eq!(ord1, ord2);
    }

    #[test]
    fn test_aggregate_omitted_label_not_penalized() {
        // A ranker that omits a label (partial parse) simply doesn't
        // contribute to that label's mean position.
        let a: Vec<RankedLabel> = vec![RankedLabel { label: "A".into(), score: None }];
        let b: Vec<RankedLabel> = vec![
            RankedLabel { label: "A".into(), score: None },
            RankedLabel { label: "B".into(), score: None },
        ];
        let (ordering, mean_position, _) = aggregate_rankings(&[a, b]);
        assert!(ordering.contains(&"B".to_string()));
        assert_eq!(mean_position[&"A".to_string()], 1.0);
    }
}
