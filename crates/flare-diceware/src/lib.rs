//! Diceware passphrases: a fixed dictionary plus words drawn uniformly at
//! random from a cryptographically secure source.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;

/// Separator placed between words of a generated passphrase.
pub const DEFAULT_SEPARATOR: &str = "-";

#[derive(Debug, Error)]
pub enum DicewareError {
    #[error("failed to read word list: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed word list line {line}: {content:?}")]
    MalformedLine { line: usize, content: String },
    #[error("word list is empty")]
    Empty,
    #[error("passphrase must contain at least one word")]
    ZeroWords,
    #[error("entropy source failed: {0}")]
    Entropy(#[from] rand::Error),
}

/// An immutable dictionary shared cheaply between generators.
#[derive(Debug, Clone)]
pub struct Wordlist {
    words: Arc<[String]>,
}

impl Wordlist {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DicewareError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let list = Self::from_reader(BufReader::new(file))?;
        debug!(path = %path.display(), words = list.len(), "loaded diceware word list");
        Ok(list)
    }

    /// Parses the EFF dice format (`11111<TAB>abacus`). Lines holding a
    /// single bare word are accepted as well; blank lines are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, DicewareError> {
        let mut words = Vec::with_capacity(7776);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let word = match line.trim_end_matches(['\r', '\n']).split_once('\t') {
                Some((_, word)) => word.trim(),
                None => match trimmed.split_once(char::is_whitespace) {
                    Some((roll, word)) if roll.chars().all(|c| c.is_ascii_digit()) => word.trim(),
                    Some(_) => "",
                    None => trimmed,
                },
            };
            if word.is_empty() || word.contains(char::is_whitespace) {
                return Err(DicewareError::MalformedLine {
                    line: index + 1,
                    content: line,
                });
            }
            words.push(word.to_string());
        }
        Self::from_words(words)
    }

    pub fn from_words<I, S>(words: I) -> Result<Self, DicewareError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        if words.is_empty() {
            return Err(DicewareError::Empty);
        }
        Ok(Self {
            words: words.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }
}

/// Generates N-word passphrases from a word list using the OS entropy source.
#[derive(Debug, Clone)]
pub struct Diceware {
    wordlist: Wordlist,
    words: usize,
    separator: String,
}

impl Diceware {
    pub fn new(wordlist: Wordlist, words: usize) -> Result<Self, DicewareError> {
        if words == 0 {
            return Err(DicewareError::ZeroWords);
        }
        Ok(Self {
            wordlist,
            words,
            separator: DEFAULT_SEPARATOR.to_string(),
        })
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn wordlist(&self) -> &Wordlist {
        &self.wordlist
    }

    pub fn generate(&self) -> Result<String, DicewareError> {
        self.generate_with(&mut OsRng)
    }

    pub fn generate_with<R: RngCore + ?Sized>(&self, rng: &mut R) -> Result<String, DicewareError> {
        generate_passphrase(self.words, &self.wordlist, rng, &self.separator)
    }
}

pub fn generate_passphrase<R: RngCore + ?Sized>(
    words: usize,
    wordlist: &Wordlist,
    rng: &mut R,
    separator: &str,
) -> Result<String, DicewareError> {
    if words == 0 {
        return Err(DicewareError::ZeroWords);
    }
    let mut picked = Vec::with_capacity(words);
    for _ in 0..words {
        let index = uniform_index(rng, wordlist.len())?;
        picked.push(wordlist.words[index].as_str());
    }
    Ok(picked.join(separator))
}

/// Uniform index in `0..len` by rejection sampling, so no word is favoured
/// when `len` does not divide 2^64.
fn uniform_index<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Result<usize, rand::Error> {
    let len = len as u128;
    let range = 1u128 << 64;
    let limit = range - range % len;
    loop {
        let mut buf = [0u8; 8];
        rng.try_fill_bytes(&mut buf)?;
        let value = u64::from_le_bytes(buf) as u128;
        if value < limit {
            return Ok((value % len) as usize);
        }
    }
}
