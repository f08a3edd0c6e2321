use rand::distributions::{Distribution, WeightedIndex};

use crate::candidates::{softmax, TokenDataArray, TokenId};
use crate::rng::Prng;

/// Return the id with the highest logit. `None` on an empty candidate set.
pub fn sample_token_greedy(candidates: &mut TokenDataArray) -> Option<TokenId> {
    candidates
        .data
        .iter()
        .max_by(|a, b| {
            a.logit
                .partial_cmp(&b.logit)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.id)
}

/// Draw an id from the softmax distribution using the context RNG.
pub fn sample_token(candidates: &mut TokenDataArray, rng: &mut Prng) -> Option<TokenId> {
    softmax(candidates);
    if candidates.is_empty() {
        return None;
    }
    let dist = match WeightedIndex::new(candidates.data.iter().map(|c| c.p)) {
        Ok(d) => d,
        // degenerate distribution: fall back to the most probable entry
        Err(_) => return Some(candidates.data[0].id),
    };
    let idx = dist.sample(rng);
    Some(candidates.data[idx].id)
}
