use crate::candidates::{softmax, TokenDataArray};

/// Locally typical filter: rank candidates by how close their surprise
/// `-log p` is to the distribution's entropy, and keep the smallest prefix
/// whose cumulative probability exceeds `p`.
pub fn typical(candidates: &mut TokenDataArray, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    softmax(candidates);

    let entropy: f32 = candidates
        .data
        .iter()
        .map(|c| -c.p * c.p.ln())
        .sum();

    let shifted: Vec<f32> = candidates
        .data
        .iter()
        .map(|c| (-c.p.ln() - entropy).abs())
        .collect();

    let mut indices: Vec<usize> = (0..candidates.len()).collect();
    indices.sort_by(|&a, &b| {
        shifted[a]
            .partial_cmp(&shifted[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cum_sum = 0.0f32;
    let mut last_idx = indices.len();
    for (i, &idx) in indices.iter().enumerate() {
        cum_sum += candidates.data[idx].p;
        if cum_sum > p && i + 1 >= min_keep {
            last_idx = i + 1;
            break;
        }
    }

    let new_data = indices[..last_idx]
        .iter()
        .map(|&idx| candidates.data[idx])
        .collect();
    candidates.data = new_data;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typical_keeps_members_of_input() {
        let logits = [1.0, 0.2, 0.1, -2.0, 3.0];
        let mut c = TokenDataArray::from_logits(&logits);
        typical(&mut c, 0.5, 1);
        assert!(!c.is_empty());
        assert!(c.data.iter().all(|d| (d.id as usize) < logits.len()));
    }

    #[test]
    fn test_typical_uniform_keeps_all() {
        // with a uniform distribution every candidate is exactly typical
        let mut c = TokenDataArray::from_logits(&[1.0, 1.0, 1.0, 1.0]);
        typical(&mut c, 0.99, 1);
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn test_typical_p_one_noop() {
        let mut c = TokenDataArray::from_logits(&[2.0, 1.0]);
        typical(&mut c, 1.0, 1);
        assert_eq!(c.len(), 2);
    }
}
