/// Token id type shared across the runtime (negative values never occur in
/// vocabularies; the signed representation matches the session file format).
pub type TokenId = i32;

/// A candidate token: id, raw logit and (once computed) probability.
#[derive(Debug, Clone, Copy)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// The working set of the sampling pipeline.
///
/// Filters mutate the array in place. `sorted` means the entries are in
/// descending-logit order; transforms that break the order clear it, and
/// `softmax` restores it.
#[derive(Debug, Clone)]
pub struct TokenDataArray {
    pub data: Vec<TokenData>,
    pub sorted: bool,
}

impl TokenDataArray {
    /// Build the full candidate set from a logits row; token id = index.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        TokenDataArray {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub(crate) fn sort_by_logit_desc(data: &mut [TokenData]) {
    data.sort_by(|a, b| {
        b.logit
            .partial_cmp(&a.logit)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Compute probabilities from logits: subtract the max logit, exponentiate
/// and normalize. Leaves the array sorted descending by logit.
pub fn softmax(candidates: &mut TokenDataArray) {
    if candidates.is_empty() {
        return;
    }
    if !candidates.sorted {
        sort_by_logit_desc(&mut candidates.data);
        candidates.sorted = true;
    }
    let max_l = candidates.data[0].logit;
    let mut cum_sum = 0.0f32;
    for c in candidates.data.iter_mut() {
        c.p = (c.logit - max_l).exp();
        cum_sum += c.p;
    }
    for c in candidates.data.iter_mut() {
        c.p /= cum_sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_normalizes_and_sorts() {
        let mut c = TokenDataArray::from_logits(&[0.1, 3.0, -1.0, 0.5]);
        softmax(&mut c);
        assert!(c.sorted);
        assert_eq!(c.data[0].id, 1);
        let sum: f32 = c.data.iter().map(|d| d.p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(c.data.iter().all(|d| d.p >= 0.0));
    }

    #[test]
    fn test_softmax_idempotent() {
        let mut c = TokenDataArray::from_logits(&[1.0, 2.0, 3.0]);
        softmax(&mut c);
        let once: Vec<f32> = c.data.iter().map(|d| d.p).collect();
        softmax(&mut c);
        let twice: Vec<f32> = c.data.iter().map(|d| d.p).collect();
        for (a, b) in once.iter().zip(&twice) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_empty_is_noop() {
        let mut c = TokenDataArray::from_logits(&[] as &[f32]);
        softmax(&mut c);
        assert!(c.is_empty());
    }
}
