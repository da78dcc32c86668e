use crate::{LmError, Result};

/// Maps text to token ids and back.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<usize>;

    fn decode(&self, ids: &[usize]) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn eos_id(&self) -> usize;
}

/// Byte-level tokenizer: ids 0..=255 are the UTF-8 bytes, 256 is end-of-sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOS: usize = 256;
    pub const VOCAB_SIZE: usize = 257;

    /// Bytes of the ids before the first EOS; fails on ids outside the vocabulary.
    pub fn decode_bytes(&self, ids: &[usize]) -> Result<Vec<u8>> {
        ids.iter()
            .take_while(|&&id| id != Self::EOS)
            .map(|&id| {
                u8::try_from(id).map_err(|_| LmError::Tokenizer(format!("unknown token id {id}")))
            })
            .collect()
    }

    /// Decodes as much text as is complete, for streaming output. Returns the
    /// text and the number of leading ids it covers. A trailing partial UTF-8
    /// sequence stays undecoded; invalid bytes become U+FFFD.
    pub fn decode_prefix(&self, ids: &[usize]) -> Result<(String, usize)> {
        let bytes = self.decode_bytes(ids)?;
        let mut text = String::new();
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    return Ok((text, bytes.len()));
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => return Ok((text, bytes.len() - after.len())),
                    }
                }
            }
        }
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<usize> {
        text.bytes().map(usize::from).collect()
    }

    fn decode(&self, ids: &[usize]) -> Result<String> {
        String::from_utf8(self.decode_bytes(ids)?).map_err(|e| LmError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }

    fn eos_id(&self) -> usize {
        Self::EOS
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decode_stops_at_eos() {
        let tok = ByteTokenizer;
        let mut ids = tok.encode("hi");
        ids.push(ByteTokenizer::EOS);
        ids.extend(tok.encode("ignored"));
        assert_eq!(tok.decode(&ids).unwrap(), "hi");
    }

    #[test]
    fn out_of_range_ids_are_errors() {
        assert!(matches!(
            ByteTokenizer.decode(&[300]),
            Err(LmError::Tokenizer(_))
        ));
    }

    #[test]
    fn prefix_holds_back_partial_characters() {
        let tok = ByteTokenizer;
        let ids = tok.encode("aé");
        let (text, used) = tok.decode_prefix(&ids[..2]).unwrap();
        assert_eq!((text.as_str(), used), ("a", 1));
        let (text, used) = tok.decode_prefix(&ids).unwrap();
        assert_eq!((text.as_str(), used), ("aé", 3));
    }

    #[test]
    fn prefix_replaces_invalid_bytes() {
        let (text, used) = ByteTokenizer.decode_prefix(&[104, 0xff, 105]).unwrap();
        assert_eq!((text.as_str(), used), ("h\u{fffd}i", 3));
    }

    proptest! {
        #[test]
        fn encode_then_decode_is_identity(text in ".*") {
            let tok = ByteTokenizer;
            let ids = tok.encode(&text);
            prop_assert!(ids.iter().all(|&id| id < tok.vocab_size()));
            prop_assert_eq!(tok.decode(&ids).unwrap(), text);
        }
    }
}
