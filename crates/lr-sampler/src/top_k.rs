use crate::candidates::{sort_by_logit_desc, TokenDataArray};

/// Keep the `max(k, min_keep)` highest-logit candidates.
///
/// Partial-sorts when the array is unsorted and the cut is strict, so the
/// tail beyond `k` is never fully ordered.
pub fn top_k(candidates: &mut TokenDataArray, k: usize, min_keep: usize) {
    let k = k.max(min_keep).min(candidates.len());
    if !candidates.sorted {
        if k == candidates.len() {
            sort_by_logit_desc(&mut candidates.data);
        } else if k > 0 {
            candidates.data.select_nth_unstable_by(k - 1, |a, b| {
                b.logit
                    .partial_cmp(&a.logit)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            sort_by_logit_desc(&mut candidates.data[..k]);
        }
        candidates.sorted = true;
    }
    candidates.data.truncate(k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::TokenDataArray;

    #[test]
    fn test_top_k_keeps_best() {
        let mut c = TokenDataArray::from_logits(&[0.5, 2.0, -1.0, 1.5]);
        top_k(&mut c, 2, 1);
        assert_eq!(c.len(), 2);
        assert_eq!(c.data[0].id, 1);
        assert_eq!(c.data[1].id, 3);
        assert!(c.sorted);
    }

    #[test]
    fn test_top_k_min_keep_dominates() {
        let mut c = TokenDataArray::from_logits(&[0.5, 2.0, -1.0]);
        top_k(&mut c, 1, 3);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_top_k_larger_than_len() {
        let mut c = TokenDataArray::from_logits(&[0.5, 2.0]);
        top_k(&mut c, 40, 1);
        assert_eq!(c.len(), 2);
    }
}
