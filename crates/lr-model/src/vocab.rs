use std::collections::HashMap;

use lr_sampler::TokenId;

/// Beginning-of-sequence token.
pub fn token_bos() -> TokenId {
    1
}

/// End-of-sequence token.
pub fn token_eos() -> TokenId {
    2
}

/// Newline token (the byte-fallback id of `\n`).
pub fn token_nl() -> TokenId {
    13
}

/// First id of the byte-fallback range `[3, 3 + 256)`.
pub const BYTE_FALLBACK_BASE: TokenId = 3;

/// A vocabulary entry: raw token bytes and the merge score.
#[derive(Debug, Clone)]
pub struct TokenScore {
    pub text: Vec<u8>,
    pub score: f32,
}

/// Ordered token vocabulary with a reverse byte-string index.
#[derive(Debug, Default)]
pub struct Vocab {
    pub id_to_token: Vec<TokenScore>,
    pub token_to_id: HashMap<Vec<u8>, TokenId>,
}

impl Vocab {
    pub fn new(entries: Vec<TokenScore>) -> Vocab {
        let mut token_to_id = HashMap::with_capacity(entries.len());
        for (id, tok) in entries.iter().enumerate() {
            token_to_id.insert(tok.text.clone(), id as TokenId);
        }
        Vocab {
            id_to_token: entries,
            token_to_id,
        }
    }

    pub fn n_vocab(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// Raw bytes of a token, or `None` for out-of-range ids.
    pub fn token_text(&self, id: TokenId) -> Option<&[u8]> {
        self.id_to_token
            .get(usize::try_from(id).ok()?)
            .map(|t| t.text.as_slice())
    }

    pub fn token_score(&self, id: TokenId) -> Option<f32> {
        self.id_to_token
            .get(usize::try_from(id).ok()?)
            .map(|t| t.score)
    }

    /// Decode a token sequence by concatenating token bytes; byte-fallback
    /// ids map back to their single byte.
    pub fn decode(&self, tokens: &[TokenId]) -> Vec<u8> {
        let mut out = Vec::new();
        for &id in tokens {
            if (BYTE_FALLBACK_BASE..BYTE_FALLBACK_BASE + 256).contains(&id) {
                // byte-fallback entries also appear in the table, but decode
                // uniformly even for vocabularies that elide them
                out.push((id - BYTE_FALLBACK_BASE) as u8);
            } else if let Some(text) = self.token_text(id) {
                out.extend_from_slice(text);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert_eq!(token_bos(), 1);
        assert_eq!(token_eos(), 2);
        assert_eq!(token_nl(), BYTE_FALLBACK_BASE + b'\n' as TokenId);
    }

    #[test]
    fn test_lookup() {
        let v = Vocab::new(vec![
            TokenScore {
                text: b"<unk>".to_vec(),
                score: 0.0,
            },
            TokenScore {
                text: b"hello".to_vec(),
                score: 1.5,
            },
        ]);
        assert_eq!(v.n_vocab(), 2);
        assert_eq!(v.token_text(1), Some(&b"hello"[..]));
        assert_eq!(v.token_score(1), Some(1.5));
        assert_eq!(v.token_to_id.get(&b"hello"[..].to_vec()), Some(&1));
        assert_eq!(v.token_text(7), None);
        assert_eq!(v.token_text(-1), None);
    }
}
