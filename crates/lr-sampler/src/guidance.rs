use crate::candidates::TokenDataArray;

fn log_softmax(x: &mut [f32]) {
    let max_l = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_l).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v = (*v / sum).ln();
    }
}

/// Classifier-free guidance over a full, unsorted candidate set.
///
/// `guidance_logits` is the logits row of the guidance context and must be
/// the same length as `candidates`. Each logit becomes
/// `smooth_factor * g' + (1 - smooth_factor) * base` where
/// `g' = log_softmax(guidance + scale * (base - guidance))`.
pub fn classifier_free_guidance(
    candidates: &mut TokenDataArray,
    guidance_logits: &[f32],
    scale: f32,
    smooth_factor: f32,
) {
    debug_assert!(!candidates.sorted, "guidance expects vocab-order candidates");
    debug_assert_eq!(candidates.len(), guidance_logits.len());

    let mut logits_base: Vec<f32> = candidates.data.iter().map(|c| c.logit).collect();
    log_softmax(&mut logits_base);

    let mut logits_guidance = guidance_logits.to_vec();
    log_softmax(&mut logits_guidance);

    for (g, &b) in logits_guidance.iter_mut().zip(&logits_base) {
        *g = scale * (b - *g) + *g;
    }
    log_softmax(&mut logits_guidance);

    for ((c, &g), &b) in candidates
        .data
        .iter_mut()
        .zip(&logits_guidance)
        .zip(&logits_base)
    {
        c.logit = smooth_factor * g + (1.0 - smooth_factor) * b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guidance_identity_when_contexts_agree() {
        // scale 1 with identical contexts reduces to the base log-softmax
        let logits = [1.0, 2.0, 3.0];
        let mut c = TokenDataArray::from_logits(&logits);
        classifier_free_guidance(&mut c, &logits, 1.0, 1.0);
        let mut expected = logits.to_vec();
        log_softmax(&mut expected);
        for (got, want) in c.data.iter().zip(&expected) {
            assert!((got.logit - want).abs() < 1e-5);
        }
    }

    #[test]
    fn test_guidance_pushes_away_from_guidance_peak() {
        let base = [0.0, 0.0];
        let guidance = [5.0, 0.0];
        let mut c = TokenDataArray::from_logits(&base);
        classifier_free_guidance(&mut c, &guidance, 2.0, 1.0);
        // the token favored by the guidance context is suppressed
        assert!(c.data[0].logit < c.data[1].logit);
    }

    #[test]
    fn test_smooth_factor_zero_keeps_base() {
        let base = [0.5, 1.5];
        let mut c = TokenDataArray::from_logits(&base);
        classifier_free_guidance(&mut c, &[9.0, -9.0], 3.0, 0.0);
        let mut expected = base.to_vec();
        log_softmax(&mut expected);
        for (got, want) in c.data.iter().zip(&expected) {
            assert!((got.logit - want).abs() < 1e-5);
        }
    }
}
