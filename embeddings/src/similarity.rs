//! Similarity computation for embeddings.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::error::{EmbeddingError, Result};

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical vectors
/// - 0.0 means orthogonal vectors
/// - -1.0 means opposite vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    let dot = dot_product(a, b)?;
    let magnitude_a = magnitude(a);
    let magnitude_b = magnitude(b);

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot / (magnitude_a * magnitude_b))
}

/// Compute the dot product between two embeddings.
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize an embedding to unit length.
pub fn normalize(embedding: &mut [f32]) {
    let magnitude = magnitude(embedding);
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Keep the `k` highest scoring items, best first.
///
/// Runs in O(n log k). Items with equal scores keep their input order.
pub fn top_k<T>(scored: impl IntoIterator<Item = (T, f32)>, k: usize) -> Vec<(T, f32)> {
    if k == 0 {
        return Vec::new();
    }

    // Min-heap on (score, earlier-first) so the weakest candidate is on top.
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, Reverse<usize>)>> =
        BinaryHeap::with_capacity(k + 1);
    let mut items: Vec<Option<T>> = Vec::new();

    for (position, (item, score)) in scored.into_iter().enumerate() {
        let key = (OrderedFloat(score), Reverse(position));
        if heap.len() < k {
            heap.push(Reverse(key));
        } else if heap.peek().is_some_and(|Reverse(weakest)| key > *weakest) {
            heap.pop();
            heap.push(Reverse(key));
        } else {
            items.push(None);
            continue;
        }
        items.push(Some(item));
    }

    let mut winners: Vec<(OrderedFloat<f32>, Reverse<usize>)> =
        heap.into_iter().map(|Reverse(key)| key).collect();
    winners.sort_by(|a, b| b.cmp(a));

    winners
        .into_iter()
        .filter_map(|(score, Reverse(position))| {
            items
                .get_mut(position)
                .and_then(Option::take)
                .map(|item| (item, score.0))
        })
        .collect()
}
