//! Unigram-score subword tokenizer.
//!
//! The input is split into UTF-8 code points linked as a doubly linked list;
//! a max-priority queue of candidate bigrams then greedily merges the
//! highest-scoring adjacent pair until no merge is possible. Symbols that
//! never became vocabulary entries are emitted byte by byte through the
//! byte-fallback id range.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use lr_sampler::TokenId;

use crate::vocab::{token_bos, Vocab, BYTE_FALLBACK_BASE};

// code-point length from the leading byte's high nibble
const UTF8_LEN: [usize; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 4];

fn utf8_len(byte: u8) -> usize {
    UTF8_LEN[(byte >> 4) as usize]
}

#[derive(Debug, Clone, Copy)]
struct Symbol {
    prev: i32,
    next: i32,
    start: usize,
    /// Byte length; 0 once merged away.
    n: usize,
}

#[derive(Debug, Clone, Copy)]
struct Bigram {
    left: i32,
    right: i32,
    score: f32,
    /// Concatenated byte length at insertion time; a mismatch on pop marks
    /// the entry stale.
    size: usize,
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bigram {}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bigram {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher score first; on ties the leftmost pair wins
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.left.cmp(&self.left))
    }
}

struct Tokenizer<'a> {
    vocab: &'a Vocab,
    symbols: Vec<Symbol>,
    work_queue: BinaryHeap<Bigram>,
}

impl<'a> Tokenizer<'a> {
    fn new(vocab: &'a Vocab) -> Self {
        Tokenizer {
            vocab,
            symbols: Vec::new(),
            work_queue: BinaryHeap::new(),
        }
    }

    fn tokenize(&mut self, text: &[u8], output: &mut Vec<TokenId>) {
        // split into UTF-8 code points, linked both ways
        let mut offs = 0;
        let mut index = 0i32;
        while offs < text.len() {
            let char_len = utf8_len(text[offs]).min(text.len() - offs);
            let next = if offs + char_len == text.len() {
                -1
            } else {
                index + 1
            };
            self.symbols.push(Symbol {
                prev: index - 1,
                next,
                start: offs,
                n: char_len,
            });
            offs += char_len;
            index += 1;
        }

        // seed the work queue with all adjacent pairs
        for i in 1..self.symbols.len() {
            self.try_add_bigram(text, (i - 1) as i32, i as i32);
        }

        // keep substituting the highest-scoring pairs for as long as we can
        while let Some(bigram) = self.work_queue.pop() {
            let left_sym = self.symbols[bigram.left as usize];
            let right_sym = self.symbols[bigram.right as usize];

            // one of the symbols was already merged away, or grew since
            if left_sym.n == 0 || right_sym.n == 0 || left_sym.n + right_sym.n != bigram.size {
                continue;
            }

            // merge the right symbol into the left one and unlink it
            self.symbols[bigram.left as usize].n += right_sym.n;
            self.symbols[bigram.right as usize].n = 0;
            self.symbols[bigram.left as usize].next = right_sym.next;
            if right_sym.next >= 0 {
                self.symbols[right_sym.next as usize].prev = bigram.left;
            }

            let left = self.symbols[bigram.left as usize];
            self.try_add_bigram(text, left.prev, bigram.left);
            self.try_add_bigram(text, bigram.left, left.next);
        }

        // walk the chain, emitting ids; unknown symbols fall back to bytes
        let mut i = 0i32;
        while i != -1 && !self.symbols.is_empty() {
            let symbol = self.symbols[i as usize];
            let bytes = &text[symbol.start..symbol.start + symbol.n];
            match self.vocab.token_to_id.get(bytes) {
                Some(&id) => output.push(id),
                None => {
                    for &b in bytes {
                        output.push(b as TokenId + BYTE_FALLBACK_BASE);
                    }
                }
            }
            i = symbol.next;
        }
    }

    fn try_add_bigram(&mut self, text: &[u8], left: i32, right: i32) {
        if left == -1 || right == -1 {
            return;
        }
        let l = self.symbols[left as usize];
        let r = self.symbols[right as usize];
        let bytes = &text[l.start..l.start + l.n + r.n];
        let Some(&id) = self.vocab.token_to_id.get(bytes) else {
            return;
        };
        let Some(score) = self.vocab.token_score(id) else {
            return;
        };
        self.work_queue.push(Bigram {
            left,
            right,
            score,
            size: bytes.len(),
        });
    }
}

/// Encode `text` into token ids, optionally prefixed with BOS.
///
/// Tokenization is total: empty input yields just the optional BOS.
pub fn tokenize(vocab: &Vocab, text: &str, add_bos: bool) -> Vec<TokenId> {
    let mut output = Vec::new();
    if add_bos {
        output.push(token_bos());
    }
    if text.is_empty() {
        return output;
    }
    Tokenizer::new(vocab).tokenize(text.as_bytes(), &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::TokenScore;

    /// Vocabulary with reserved ids, the byte-fallback range and a few
    /// sentencepiece-style merge chains.
    fn test_vocab() -> Vocab {
        let mut entries: Vec<TokenScore> = vec![b"<unk>".to_vec(), b"<s>".to_vec(), b"</s>".to_vec()]
            .into_iter()
            .map(|text| TokenScore { text, score: 0.0 })
            .collect();
        for b in 0u16..256 {
            entries.push(TokenScore {
                text: vec![b as u8],
                score: 0.0,
            });
        }
        // longer merges score higher, so full words win
        for word in ["He", "Hel", "Hell", "Hello", "wo", "wor", "worl", "world"] {
            entries.push(TokenScore {
                text: word.as_bytes().to_vec(),
                score: word.len() as f32,
            });
        }
        Vocab::new(entries)
    }

    fn id_of(v: &Vocab, s: &str) -> TokenId {
        v.token_to_id[s.as_bytes()]
    }

    #[test]
    fn test_hello_world_with_bos() {
        let v = test_vocab();
        let toks = tokenize(&v, "Hello, world", true);
        assert_eq!(toks[0], token_bos());
        assert_eq!(*toks.last().unwrap(), id_of(&v, "world"));
        assert_eq!(v.decode(&toks[1..]), b"Hello, world");
    }

    #[test]
    fn test_merge_prefers_longest_chain() {
        let v = test_vocab();
        let toks = tokenize(&v, "Hello", false);
        assert_eq!(toks, vec![id_of(&v, "Hello")]);
    }

    #[test]
    fn test_byte_fallback_for_unknown_symbols() {
        // a vocabulary with no single-byte entries at all
        let entries = vec![
            TokenScore {
                text: b"<unk>".to_vec(),
                score: 0.0,
            },
        ];
        let v = Vocab::new(entries);
        let toks = tokenize(&v, "Hi", false);
        assert_eq!(
            toks,
            vec![
                b'H' as TokenId + BYTE_FALLBACK_BASE,
                b'i' as TokenId + BYTE_FALLBACK_BASE,
            ]
        );
        assert_eq!(v.decode(&toks), b"Hi");
    }

    #[test]
    fn test_multibyte_codepoints_stay_whole() {
        let v = test_vocab();
        // U+00E9 (two bytes) followed by U+20AC (three bytes)
        let toks = tokenize(&v, "é€", false);
        // no merges exist, so each code point falls back to its bytes
        assert_eq!(toks.len(), 5);
        assert_eq!(v.decode(&toks), "é€".as_bytes());
    }

    #[test]
    fn test_empty_input() {
        let v = test_vocab();
        assert!(tokenize(&v, "", false).is_empty());
        assert_eq!(tokenize(&v, "", true), vec![token_bos()]);
    }

    #[test]
    fn test_roundtrip_ascii() {
        let v = test_vocab();
        let text = "Hello world Hello";
        let toks = tokenize(&v, text, false);
        assert_eq!(v.decode(&toks), text.as_bytes());
    }
}
