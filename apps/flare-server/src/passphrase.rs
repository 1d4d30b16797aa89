use flare_diceware::Diceware;

use crate::error::SignalError;

/// Words per passphrase unless configured otherwise.
pub const DEFAULT_PASSPHRASE_WORDS: usize = 6;

/// Source of session passphrases.
pub trait PassphraseGenerator: Send + Sync + 'static {
    fn generate(&self) -> Result<String, SignalError>;
}

impl PassphraseGenerator for Diceware {
    fn generate(&self) -> Result<String, SignalError> {
        Diceware::generate(self).map_err(|err| SignalError::EntropySource(err.to_string()))
    }
}
