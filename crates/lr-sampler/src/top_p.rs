use crate::candidates::{softmax, TokenDataArray};

/// Nucleus filter: keep the smallest prefix whose cumulative probability
/// reaches `p`, but never fewer than `min_keep` candidates.
pub fn top_p(candidates: &mut TokenDataArray, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    softmax(candidates);

    let mut cum_sum = 0.0f32;
    let mut last_idx = candidates.len();
    for (i, c) in candidates.data.iter().enumerate() {
        cum_sum += c.p;
        if cum_sum >= p && i + 1 >= min_keep {
            last_idx = i + 1;
            break;
        }
    }
    candidates.data.truncate(last_idx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_p_truncates_tail() {
        // softmax of [2, 1, 0, -5] concentrates mass on the first two
        let mut c = TokenDataArray::from_logits(&[2.0, 1.0, 0.0, -5.0]);
        top_p(&mut c, 0.8, 1);
        assert!(c.len() < 4);
        assert_eq!(c.data[0].id, 0);
    }

    #[test]
    fn test_top_p_one_is_noop() {
        let mut c = TokenDataArray::from_logits(&[2.0, 1.0]);
        top_p(&mut c, 1.0, 1);
        assert_eq!(c.len(), 2);
        assert!(!c.sorted);
    }

    #[test]
    fn test_top_p_min_keep() {
        let mut c = TokenDataArray::from_logits(&[10.0, 0.0, 0.0]);
        top_p(&mut c, 0.1, 2);
        assert!(c.len() >= 2);
    }
}
