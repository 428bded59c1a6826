//! BIP-39 seed management for the coordinator key tree.
//!
//! The coordinator's signing keys and the whole nonce sequence derive from
//! a single mnemonic kept in a file under the data directory.

use std::io;
use std::path::Path;

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Seed file error: {0}")]
    Io(#[from] io::Error),
}

/// Generate a new BIP-39 mnemonic (24 words).
pub fn generate_mnemonic() -> Result<Mnemonic, SeedError> {
    Mnemonic::generate_in(Language::English, 24)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from words.
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    Mnemonic::parse_in(Language::English, words.trim())
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Derive seed bytes from a mnemonic (with optional passphrase).
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(passphrase))
}

/// Load the mnemonic from `path`, generating and persisting a fresh one on
/// first start. The file is created with owner-only permissions.
pub fn load_or_create_mnemonic(path: &Path) -> Result<Mnemonic, SeedError> {
    if path.exists() {
        let words = std::fs::read_to_string(path)?;
        return parse_mnemonic(&words);
    }

    let mnemonic = generate_mnemonic()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, mnemonic.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    log::info!("Generated new coordinator seed at {}", path.display());
    Ok(mnemonic)
}
