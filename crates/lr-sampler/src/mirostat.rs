use crate::candidates::{softmax, TokenDataArray, TokenId};
use crate::rng::Prng;
use crate::token::sample_token;
use crate::top_k::top_k;

/// Mirostat sampling (Basu et al.), targeting a surprise of `tau` bits.
///
/// Estimates the Zipf exponent `s_hat` from the top `m` candidates, derives
/// the `k` that should realize the target surprise `mu`, samples from the
/// truncated distribution, then nudges `mu` by the observed surprise error.
/// `n_vocab` is the full vocabulary size.
#[allow(clippy::too_many_arguments)]
pub fn sample_token_mirostat(
    candidates: &mut TokenDataArray,
    rng: &mut Prng,
    tau: f32,
    eta: f32,
    m: usize,
    mu: &mut f32,
    n_vocab: usize,
) -> Option<TokenId> {
    if candidates.is_empty() {
        return None;
    }
    softmax(candidates);

    // estimate s_hat from the m most probable tokens
    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    let limit = m.saturating_sub(1).min(candidates.len() - 1);
    for i in 0..limit {
        let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
        let b_i = (candidates.data[i].p / candidates.data[i + 1].p).ln();
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }
    let s_hat = sum_ti_bi / sum_ti_sq;

    // k that realizes the target surprise under a Zipf tail
    let epsilon_hat = s_hat - 1.0;
    let n = n_vocab as f32;
    let k = ((epsilon_hat * (2.0f32).powf(*mu)) / (1.0 - n.powf(-epsilon_hat)))
        .powf(1.0 / s_hat);

    top_k(candidates, k as usize, 1);
    let x = sample_token(candidates, rng)?;

    let idx = candidates.data.iter().position(|c| c.id == x)?;
    let observed_surprise = -candidates.data[idx].p.log2();
    *mu -= eta * (observed_surprise - tau);
    Some(x)
}

/// Mirostat 2.0: truncate to candidates whose surprise does not exceed `mu`,
/// renormalize, sample, and update `mu` by the surprise error.
pub fn sample_token_mirostat_v2(
    candidates: &mut TokenDataArray,
    rng: &mut Prng,
    tau: f32,
    eta: f32,
    mu: &mut f32,
) -> Option<TokenId> {
    if candidates.is_empty() {
        return None;
    }
    softmax(candidates);

    let cut = candidates
        .data
        .iter()
        .position(|c| -c.p.log2() > *mu)
        .unwrap_or(candidates.len());
    candidates.data.truncate(cut.max(1));

    // renormalize over the surviving candidates
    softmax(candidates);

    let x = sample_token(candidates, rng)?;
    let idx = candidates.data.iter().position(|c| c.id == x)?;
    let observed_surprise = -candidates.data[idx].p.log2();
    *mu -= eta * (observed_surprise - tau);
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zipf_logits(n: usize) -> Vec<f32> {
        (0..n).map(|i| -((i + 1) as f32).ln() * 1.1).collect()
    }

    #[test]
    fn test_mirostat_returns_member() {
        let logits = zipf_logits(64);
        let mut rng = Prng::new(3);
        let mut mu = 10.0;
        let mut c = TokenDataArray::from_logits(&logits);
        let id = sample_token_mirostat(&mut c, &mut rng, 5.0, 0.1, 100, &mut mu, 64).unwrap();
        assert!((id as usize) < 64);
    }

    #[test]
    fn test_mirostat_updates_mu() {
        let logits = zipf_logits(64);
        let mut rng = Prng::new(3);
        let mut mu = 10.0;
        let mut c = TokenDataArray::from_logits(&logits);
        sample_token_mirostat(&mut c, &mut rng, 5.0, 0.1, 100, &mut mu, 64).unwrap();
        assert!(mu != 10.0);
        assert!(mu.is_finite());
    }

    #[test]
    fn test_mirostat_v2_truncates_high_surprise() {
        let logits = zipf_logits(64);
        let mut rng = Prng::new(11);
        let mut mu = 3.0;
        let mut c = TokenDataArray::from_logits(&logits);
        let id = sample_token_mirostat_v2(&mut c, &mut rng, 2.0, 0.1, &mut mu).unwrap();
        assert!((id as usize) < 64);
        // only low-surprise candidates survive the cut
        assert!(c.len() < 64);
        let sum: f32 = c.data.iter().map(|d| d.p).sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_mirostat_v2_keeps_at_least_one() {
        let mut rng = Prng::new(1);
        let mut mu = -100.0; // every candidate exceeds the surprise bound
        let mut c = TokenDataArray::from_logits(&[0.0, 1.0, 2.0]);
        let id = sample_token_mirostat_v2(&mut c, &mut rng, 2.0, 0.1, &mut mu);
        assert!(id.is_some());
    }
}
