//! Contrastive Language-Image Pre-Training
//!
//! Contrastive Language-Image Pre-Training (CLIP) is an architecture trained on
//! pairs of images with related texts. This module only holds its byte-level
//! BPE tokenizer, reading the `vocab.json` and `merges.txt` files that ship
//! with Hugging Face checkpoints.
//!
//! https://github.com/openai/CLIP
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

use super::Tokenize;
use crate::error::{Error, Result};

/// Sequence length of the CLIP text encoder.
pub const MAX_LENGTH: usize = 77;

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";
const END_OF_WORD: &str = "</w>";

const PAT: &str =
    r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

/// The reversible mapping from bytes to printable characters used by
/// byte-level BPE. Printable latin-1 bytes map to themselves, the others are
/// shifted past 255.
fn bytes_to_unicode() -> [char; 256] {
    let printable =
        |b: u32| (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);
    let mut table = ['\0'; 256];
    let mut shifted = 0;
    for b in 0..256u32 {
        let c = if printable(b) {
            b
        } else {
            shifted += 1;
            255 + shifted
        };
        table[b as usize] = char::from_u32(c).unwrap_or('\u{fffd}');
    }
    table
}

// This is mostly a Rust rewrite of the original Python CLIP code.
// https://github.com/openai/CLIP/blob/main/clip/simple_tokenizer.py
/// A tokenizer for CLIP.
pub struct ClipTokenizer {
    re: regex::Regex,
    whitespace: regex::Regex,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    encoder: HashMap<String, usize>,
    decoder: HashMap<usize, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    start_of_text_token: usize,
    end_of_text_token: usize,
    pad_token: usize,
    max_length: usize,
}

impl ClipTokenizer {
    /// Loads a tokenizer from a `vocab.json` token-to-id map and a
    /// `merges.txt` file whose first line is a version header.
    pub fn create<P: AsRef<Path>, Q: AsRef<Path>>(
        vocab_path: P,
        merges_path: Q,
        max_length: usize,
    ) -> Result<Self> {
        let vocab_file = crate::utils::file_open(vocab_path)?;
        let encoder: HashMap<String, usize> =
            serde_json::from_reader(std::io::BufReader::new(vocab_file))?;

        let merges_path = merges_path.as_ref();
        let merges_file = crate::utils::file_open(merges_path)?;
        let io_err = |source| Error::Io { path: merges_path.to_string_lossy().into_owned(), source };
        let mut merges = vec![];
        for line in std::io::BufReader::new(merges_file).lines().skip(1) {
            let line = line.map_err(io_err)?;
            let vs: Vec<_> = line.split_whitespace().collect();
            match vs.as_slice() {
                [] => continue,
                [first, second] => merges.push((first.to_string(), second.to_string())),
                _ => {
                    return Err(Error::config(format!(
                        "expected two items got {} '{line}'",
                        vs.len()
                    )))
                }
            }
        }
        let tokenizer = Self::from_parts(encoder, merges, max_length)?;
        tracing::debug!(
            vocab = tokenizer.encoder.len(),
            merges = tokenizer.bpe_ranks.len(),
            "loaded clip tokenizer"
        );
        Ok(tokenizer)
    }

    /// Builds a tokenizer from an in-memory vocabulary and an ordered merge list.
    pub fn from_parts(
        encoder: HashMap<String, usize>,
        merges: Vec<(String, String)>,
        max_length: usize,
    ) -> Result<Self> {
        if max_length < 2 {
            return Err(Error::config(format!("max_length must be at least 2, got {max_length}")));
        }
        let lookup = |token: &str| {
            encoder
                .get(token)
                .copied()
                .ok_or_else(|| Error::config(format!("vocabulary is missing {token}")))
        };
        let start_of_text_token = lookup(START_OF_TEXT)?;
        let end_of_text_token = lookup(END_OF_TEXT)?;
        let byte_encoder = bytes_to_unicode();
        let byte_decoder = byte_encoder.iter().enumerate().map(|(b, &c)| (c, b as u8)).collect();
        let decoder = encoder.iter().map(|(k, v)| (*v, k.clone())).collect();
        let bpe_ranks = merges.into_iter().enumerate().map(|(i, v)| (v, i)).collect();
        Ok(Self {
            re: regex::Regex::new(PAT).map_err(|e| Error::config(e.to_string()))?,
            whitespace: regex::Regex::new(r"\s+").map_err(|e| Error::config(e.to_string()))?,
            byte_encoder,
            byte_decoder,
            encoder,
            decoder,
            bpe_ranks,
            start_of_text_token,
            end_of_text_token,
            pad_token: end_of_text_token,
            max_length,
        })
    }

    fn get_pairs(word: &[String]) -> HashSet<(String, String)> {
        word.windows(2).map(|w| (w[0].clone(), w[1].clone())).collect()
    }

    /// Merges the symbols of a byte-encoded word, lowest ranked pair first.
    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|x| x.to_string()).collect();
        if let Some(last) = word.last_mut() {
            last.push_str(END_OF_WORD);
        }
        while word.len() > 1 {
            let best = Self::get_pairs(&word)
                .into_iter()
                .filter_map(|p| self.bpe_ranks.get(&p).map(|rank| (*rank, p)))
                .min_by_key(|(rank, _)| *rank);
            let (first, second) = match best {
                None => break,
                Some((_, pair)) => pair,
            };
            let mut new_word = vec![];
            let mut index = 0;
            while index < word.len() {
                let w = &word[index];
                if index + 1 < word.len() && *w == first && word[index + 1] == second {
                    new_word.push(format!("{first}{second}"));
                    index += 2
                } else {
                    new_word.push(w.clone());
                    index += 1
                }
            }
            word = new_word
        }
        word
    }

    // Pieces missing from the vocabulary decompose to per-character ids,
    // falling back to the end-of-text id as the unknown token.
    fn piece_ids(&self, piece: &str, ids: &mut Vec<usize>) {
        if let Some(&id) = self.encoder.get(piece) {
            ids.push(id);
            return;
        }
        let (body, end_of_word) = match piece.strip_suffix(END_OF_WORD) {
            Some(body) => (body, true),
            None => (piece, false),
        };
        let chars: Vec<char> = body.chars().collect();
        for (i, c) in chars.iter().enumerate() {
            let mut symbol = c.to_string();
            if end_of_word && i + 1 == chars.len() {
                symbol.push_str(END_OF_WORD);
            }
            let id = self
                .encoder
                .get(&symbol)
                .or_else(|| self.encoder.get(&c.to_string()))
                .copied()
                .unwrap_or(self.end_of_text_token);
            ids.push(id);
        }
    }

    /// Tokenizes without the start, end and padding tokens.
    pub fn encode_raw(&self, s: &str) -> Vec<usize> {
        let s = self.whitespace.replace_all(s.trim(), " ").to_lowercase();
        let mut ids = vec![];
        for token in self.re.find_iter(&s) {
            let encoded: String =
                token.as_str().bytes().map(|b| self.byte_encoder[b as usize]).collect();
            for piece in self.bpe(&encoded) {
                self.piece_ids(&piece, &mut ids);
            }
        }
        ids
    }

    pub fn encode_pad(&self, s: &str, pad_size_to: usize) -> Vec<usize> {
        let mut bpe_tokens = vec![self.start_of_text_token];
        bpe_tokens.extend(self.encode_raw(s));
        bpe_tokens.truncate(pad_size_to.saturating_sub(1));
        bpe_tokens.push(self.end_of_text_token);
        bpe_tokens.resize(pad_size_to, self.pad_token);
        bpe_tokens
    }

    /// The inverse of the tokenization process, takes as input a list of tokens and returns a
    /// string that produces this tokenization. Unknown ids and special tokens are skipped.
    pub fn decode(&self, tokens: &[usize]) -> String {
        let text: String = tokens
            .iter()
            .filter(|&&t| t != self.start_of_text_token && t != self.end_of_text_token)
            .filter_map(|token| self.decoder.get(token).map(String::as_str))
            .collect();
        let bytes: Vec<u8> = text
            .replace(END_OF_WORD, " ")
            .chars()
            .filter_map(|c| if c == ' ' { Some(b' ') } else { self.byte_decoder.get(&c).copied() })
            .collect();
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }

    pub fn start_of_text_token(&self) -> usize {
        self.start_of_text_token
    }

    pub fn end_of_text_token(&self) -> usize {
        self.end_of_text_token
    }
}

impl Tokenize for ClipTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        Ok(self.encode_pad(text, self.max_length).into_iter().map(|id| id as i64).collect())
    }

    fn max_length(&self) -> usize {
        self.max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny vocabulary in the layout of the CLIP one: single symbols, then
    // merged pieces, then the special tokens.
    fn tokenizer(max_length: usize) -> ClipTokenizer {
        let tokens = [
            "a", "c", "t", "o", "d", "g", "!", "a</w>", "t</w>", "g</w>", "!</w>", "ca", "cat</w>",
            "do", "dog</w>", START_OF_TEXT, END_OF_TEXT,
        ];
        let encoder = tokens.iter().enumerate().map(|(i, t)| (t.to_string(), i)).collect();
        let merges = [("c", "a"), ("ca", "t</w>"), ("d", "o"), ("do", "g</w>")]
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        ClipTokenizer::from_parts(encoder, merges, max_length).unwrap()
    }

    #[test]
    fn byte_table_is_a_bijection() {
        let table = bytes_to_unicode();
        let unique: HashSet<char> = table.iter().copied().collect();
        assert_eq!(unique.len(), 256);
        assert_eq!(table[b'a' as usize], 'a');
        assert_eq!(table[b' ' as usize], 'Ġ');
    }

    #[test]
    fn encode_pads_with_end_token() {
        let tok = tokenizer(8);
        let ids = tok.encode("A  cat").unwrap();
        // start, "a</w>", "cat</w>", end, then padding
        assert_eq!(ids, vec![15, 7, 12, 16, 16, 16, 16, 16]);
        assert_eq!(ids.len(), tok.max_length());
    }

    #[test]
    fn encode_truncates() {
        let tok = tokenizer(4);
        let ids = tok.encode("cat dog cat dog").unwrap();
        assert_eq!(ids, vec![15, 12, 14, 16]);
    }

    #[test]
    fn unknown_pieces_fall_back() {
        let tok = tokenizer(6);
        // "tag" has no merges: per symbol ids, then "!" is a known word piece,
        // and "z" is unknown.
        let raw = tok.encode_raw("tag! z");
        assert_eq!(raw, vec![2, 0, 9, 10, 16]);
    }

    #[test]
    fn decode_roundtrips_words() {
        let tok = tokenizer(8);
        let ids: Vec<usize> = tok.encode_pad("cat dog", 8);
        assert_eq!(tok.decode(&ids), "cat dog");
    }

    #[test]
    fn special_tokens_are_required() {
        let encoder = [("a".to_string(), 0)].into_iter().collect();
        assert!(ClipTokenizer::from_parts(encoder, vec![], 77).is_err());
    }
}
