//! Tokenizers selected by `arch.args.text_params.model`.

use mosaic_abstraction::{parse_args, ComponentArgs, ComponentError, ComponentResult, Tokenizer};
use serde::Deserialize;
use sha2::{Digest, Sha256};

const DEFAULT_HASH_VOCAB: usize = 4096;

/// Tokenizer options read from `text_params`. Keys meant for the model
/// (e.g. `embed_dim`) are ignored here.
#[derive(Debug, Deserialize)]
struct TokenizerArgs {
    #[serde(default)]
    vocab_size: Option<usize>,
    #[serde(default = "default_lowercase")]
    lowercase: bool,
}

fn default_lowercase() -> bool {
    true
}

/// Whitespace word tokenizer that hashes each word into a fixed vocabulary.
#[derive(Debug, Clone)]
pub struct HashingTokenizer {
    vocab_size: usize,
    lowercase: bool,
}

impl HashingTokenizer {
    pub const KIND: &'static str = "hashing-bow";

    #[must_use]
    pub fn new(vocab_size: usize, lowercase: bool) -> Self {
        Self { vocab_size, lowercase }
    }

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<Self> {
        let args: TokenizerArgs = parse_args(args)?;
        let vocab_size = args.vocab_size.unwrap_or(DEFAULT_HASH_VOCAB);
        if vocab_size == 0 {
            return Err(ComponentError::InvalidArguments("vocab_size must be >= 1".to_string()));
        }
        Ok(Self::new(vocab_size, args.lowercase))
    }

    fn hash_word(&self, word: &str) -> u32 {
        let digest = Sha256::digest(word.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.vocab_size as u64) as u32
    }
}

impl Tokenizer for HashingTokenizer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|word| !word.is_empty())
            .map(|word| {
                if self.lowercase {
                    self.hash_word(&word.to_lowercase())
                } else {
                    self.hash_word(word)
                }
            })
            .collect()
    }
}

/// Byte-level tokenizer with a 256-entry vocabulary.
#[derive(Debug, Clone, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const KIND: &'static str = "byte-level";

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<Self> {
        let args: TokenizerArgs = parse_args(args)?;
        if let Some(size) = args.vocab_size {
            if size != 256 {
                return Err(ComponentError::InvalidArguments(format!(
                    "byte-level tokenizer has a fixed vocab of 256, got {size}"
                )));
            }
        }
        Ok(Self)
    }
}

impl Tokenizer for ByteTokenizer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn vocab_size(&self) -> usize {
        256
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }
}
