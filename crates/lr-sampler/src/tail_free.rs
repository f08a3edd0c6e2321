use crate::candidates::{softmax, TokenDataArray};

/// Tail-free filter: truncate where the normalized absolute second
/// derivative of the sorted probability curve accumulates past `z`.
pub fn tail_free(candidates: &mut TokenDataArray, z: f32, min_keep: usize) {
    if z >= 1.0 || candidates.len() <= 2 {
        return;
    }
    softmax(candidates);

    let n = candidates.len();
    let first: Vec<f32> = (0..n - 1)
        .map(|i| candidates.data[i].p - candidates.data[i + 1].p)
        .collect();
    let mut second: Vec<f32> = (0..n - 2).map(|i| (first[i] - first[i + 1]).abs()).collect();

    let sum: f32 = second.iter().sum();
    if sum > 0.0 {
        for v in second.iter_mut() {
            *v /= sum;
        }
    }

    let mut cum_sum = 0.0f32;
    let mut last_idx = n;
    for (i, &v) in second.iter().enumerate() {
        cum_sum += v;
        if cum_sum > z && i >= min_keep {
            last_idx = i;
            break;
        }
    }
    candidates.data.truncate(last_idx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_free_drops_flat_tail() {
        // a sharp head followed by a flat tail
        let mut c =
            TokenDataArray::from_logits(&[5.0, 4.0, -3.0, -3.0, -3.0, -3.0, -3.0, -3.0]);
        tail_free(&mut c, 0.5, 1);
        assert!(c.len() < 8);
        assert_eq!(c.data[0].id, 0);
    }

    #[test]
    fn test_tail_free_small_input_noop() {
        let mut c = TokenDataArray::from_logits(&[1.0, 0.0]);
        tail_free(&mut c, 0.5, 1);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_tail_free_z_one_noop() {
        let mut c = TokenDataArray::from_logits(&[1.0, 0.5, 0.0]);
        tail_free(&mut c, 1.0, 1);
        assert_eq!(c.len(), 3);
    }
}
