//! Encrypted on-disk store for the worker account's private key.
//!
//! The plaintext is `<account>_<private key>`, both hex. It is sealed with
//! AES-256-GCM under the SHA-256 of the passphrase; the file holds the hex of
//! `nonce || ciphertext`.

use std::fmt;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use alloy_primitives::{Address, hex, keccak256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("cannot access vault file: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault file is not valid hex")]
    Encoding,

    #[error("vault cannot be opened with this passphrase")]
    Decryption,

    #[error("vault contents are malformed")]
    Malformed,

    #[error("private key is not a valid secp256k1 scalar")]
    InvalidKey,

    #[error("vault holds {found}, expected {expected}")]
    AccountMismatch { expected: Address, found: Address },
}

/// Ledger address controlled by `key`.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..])
}

/// Signing key plus the address it controls.
#[derive(Clone)]
pub struct Wallet {
    key: SigningKey,
    address: Address,
}

impl Wallet {
    pub fn from_key(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn from_hex(private_key: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(private_key.trim()).map_err(|_| VaultError::InvalidKey)?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self::from_key(key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn cipher(passphrase: &str) -> Aes256Gcm {
    let key = Sha256::digest(passphrase.as_bytes());
    Aes256Gcm::new(&key)
}

pub struct Vault;

impl Vault {
    /// Encrypts `account` and `private_key` into `path`.
    pub fn seal(
        path: &Path,
        passphrase: &str,
        account: Address,
        private_key: &str,
    ) -> Result<(), VaultError> {
        let wallet = Wallet::from_hex(private_key)?;
        if wallet.address() != account {
            return Err(VaultError::AccountMismatch {
                expected: account,
                found: wallet.address(),
            });
        }
        let plaintext = format!(
            "{}_{}",
            hex::encode(account),
            hex::encode(wallet.signing_key().to_bytes())
        );
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher(passphrase)
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Decryption)?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        std::fs::write(path, hex::encode(sealed))?;
        Ok(())
    }

    /// Decrypts `path` and checks that it holds the key for `account`.
    pub fn open(path: &Path, passphrase: &str, account: Address) -> Result<Wallet, VaultError> {
        let contents = std::fs::read_to_string(path)?;
        let sealed = hex::decode(contents.trim()).map_err(|_| VaultError::Encoding)?;
        if sealed.len() <= NONCE_LEN {
            return Err(VaultError::Malformed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher(passphrase)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decryption)?;
        let plaintext = String::from_utf8(plaintext).map_err(|_| VaultError::Malformed)?;

        let (stored, private_key) = plaintext.split_once('_').ok_or(VaultError::Malformed)?;
        let stored: Address = stored.parse().map_err(|_| VaultError::Malformed)?;
        let wallet = Wallet::from_hex(private_key)?;
        for found in [stored, wallet.address()] {
            if found != account {
                return Err(VaultError::AccountMismatch { expected: account, found });
            }
        }
        Ok(wallet)
    }
}
