//! Score fusion strategies for combining a vector-search result list with a
//! lexical-search result list into one ranked list. `reciprocal_rank_fusion`
//! is the default; `score_aware_rrf` and `weighted_fusion` are alternate
//! strategies selectable via `SearchConfig` (score_weight = 0 recovers
//! plain RRF).

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridSource {
    Vector,
    Lexical,
    Both,
}

/// Reciprocal Rank Fusion: `score += weight_L / (rrf_k + rank)` for each hit
/// at rank `rank` (1-based) in list `L`. `rrf_k` is fixed at 60 by default.
pub fn reciprocal_rank_fusion(
    vector_results: &[(String, f32)],
    lexical_results: &[(String, f32)],
    rrf_k: usize,
    semantic_weight: f32,
    keyword_weight: f32,
    top_k: usize,
) -> Vec<(String, f32, HybridSource)> {
    let mut scores: HashMap<String, (f32, HybridSource)> = HashMap::new();

    for (rank, (id, _)) in vector_results.iter().enumerate() {
        let contribution = semantic_weight / (rrf_k as f32 + rank as f32 + 1.0);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += contribution;
                *src = HybridSource::Both;
            })
            .or_insert((contribution, HybridSource::Vector));
    }

    for (rank, (id, _)) in lexical_results.iter().enumerate() {
        let contribution = keyword_weight / (rrf_k as f32 + rank as f32 + 1.0);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += contribution;
                *src = HybridSource::Both;
            })
            .or_insert((contribution, HybridSource::Lexical));
    }

    let mut merged: Vec<(String, f32, HybridSource)> = scores
        .into_iter()
        .map(|(id, (score, source))| (id, score, source))
        .collect();

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    merged
}

/// Standard RRF weighted by normalized original similarity/BM25 scores, so
/// high-confidence matches get a boost on top of pure rank. `score_weight`
/// controls the blend: 0.0 recovers plain RRF, higher = more score
/// influence. Kept as an alternate fusion strategy behind `SearchConfig`.
pub fn score_aware_rrf(
    vector_results: &[(String, f32)],
    lexical_results: &[(String, f32)],
    rrf_k: usize,
    top_k: usize,
    score_weight: f32,
) -> Vec<(String, f32, HybridSource)> {
    let normalize = |results: &[(String, f32)]| -> HashMap<String, f32> {
        if results.is_empty() {
            return HashMap::new();
        }
        let max = results.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let min = results.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
        if (max - min).abs() < 1e-9 {
            return results.iter().map(|(id, _)| (id.clone(), 0.5)).collect();
        }
        let range = max - min;
        results
            .iter()
            .map(|(id, s)| (id.clone(), (s - min) / range))
            .collect()
    };

    let vec_norm = normalize(vector_results);
    let lex_norm = normalize(lexical_results);

    let mut scores: HashMap<String, (f32, HybridSource)> = HashMap::new();

    for (rank, (id, _)) in vector_results.iter().enumerate() {
        let rrf = 1.0 / (rrf_k as f32 + rank as f32 + 1.0);
        let orig_score = vec_norm.get(id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig_score);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += combined;
                *src = HybridSource::Both;
            })
            .or_insert((combined, HybridSource::Vector));
    }

    for (rank, (id, _)) in lexical_results.iter().enumerate() {
        let rrf = 1.0 / (rrf_k as f32 + rank as f32 + 1.0);
        let orig_score = lex_norm.get(id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig_score);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += combined;
                *src = HybridSource::Both;
            })
            .or_insert((combined, HybridSource::Lexical));
    }

    let mut merged: Vec<(String, f32, HybridSource)> = scores
        .into_iter()
        .map(|(id, (score, source))| (id, score, source))
        .collect();

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);

    // Raw RRF lands in a narrow 0.01-0.05 band; renormalize to [0, 1] so
    // downstream min_score thresholds stay meaningful.
    if let Some(max_score) = merged.first().map(|(_, s, _)| *s) {
        if max_score > 0.0 {
            for item in &mut merged {
                item.1 /= max_score;
            }
        }
    }

    merged
}

/// Alpha-blend of min-max normalized vector and lexical scores.
pub fn weighted_fusion(
    vector_results: &[(String, f32)],
    lexical_results: &[(String, f32)],
    alpha: f32,
    top_k: usize,
) -> Vec<(String, f32, HybridSource)> {
    let normalize = |results: &[(String, f32)]| -> Vec<(String, f32)> {
        if results.is_empty() {
            return vec![];
        }
        let max = results.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let min = results.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
        let range = (max - min).max(1e-6);
        results
            .iter()
            .map(|(id, s)| (id.clone(), (s - min) / range))
            .collect()
    };

    let norm_vec = normalize(vector_results);
    let norm_lex = normalize(lexical_results);

    let mut scores: HashMap<String, (f32, HybridSource)> = HashMap::new();

    for (id, score) in &norm_vec {
        scores.insert(id.clone(), (alpha * score, HybridSource::Vector));
    }

    for (id, score) in &norm_lex {
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += (1.0 - alpha) * score;
                *src = HybridSource::Both;
            })
            .or_insert(((1.0 - alpha) * score, HybridSource::Lexical));
    }

    let mut merged: Vec<(String, f32, HybridSource)> = scores
        .into_iter()
        .map(|(id, (score, source))| (id, score, source))
        .collect();

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_uses_fixed_k_and_weights() {
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let lexical = vec![("b".to_string(), 5.0), ("a".to_string(), 3.0)];
        let fused = reciprocal_rank_fusion(&vector, &lexical, 60, 0.5, 0.5, 10);
        // a: rank1 in vector (0.5/61) + rank2 in lexical (0.5/62)
        // b: rank2 in vector (0.5/62) + rank1 in lexical (0.5/61)
        // scores for a and b are equal by symmetry
        assert_eq!(fused.len(), 2);
        assert!((fused[0].1 - fused[1].1).abs() < 1e-6);
    }

    #[test]
    fn rrf_prefers_item_appearing_in_both_lists() {
        let vector = vec![("only_vec".to_string(), 0.9), ("both".to_string(), 0.1)];
        let lexical = vec![("both".to_string(), 0.1), ("only_lex".to_string(), 9.0)];
        let fused = reciprocal_rank_fusion(&vector, &lexical, 60, 0.5, 0.5, 10);
        assert_eq!(fused[0].0, "both");
        assert_eq!(fused[0].2, HybridSource::Both);
    }

    #[test]
    fn score_aware_rrf_normalizes_to_unit_max() {
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.1)];
        let lexical: Vec<(String, f32)> = vec![];
        let fused = score_aware_rrf(&vector, &lexical, 60, 10, 0.3);
        assert!((fused[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn weighted_fusion_alpha_zero_ignores_vector() {
        let vector = vec![("a".to_string(), 1.0)];
        let lexical = vec![("b".to_string(), 1.0)];
        let fused = weighted_fusion(&vector, &lexical, 0.0, 10);
        let b_score = fused.iter().find(|(id, ..)| id == "b").unwrap().1;
        let a_score = fused.iter().find(|(id, ..)| id == "a").unwrap().1;
        assert!(b_score > a_score);
    }
}
