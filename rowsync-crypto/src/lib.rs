//! Encryption layer for rowsync.
//!
//! - [`field_key`] turns a passphrase into a ChaCha20-Poly1305 key
//! - [`encrypt_fields`] seals designated columns of an outgoing row
//! - [`wrapping_key`] and [`generate_passphrase`] back the remote keystore,
//!   which stores the passphrase sealed under an organization salt

mod cipher;
mod error;
mod fields;
mod key;

pub use cipher::{decrypt_string, encrypt_string, open, seal, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use fields::{decrypt_fields, encrypt_fields};
pub use key::{
    derive_key, field_key, generate_passphrase, generate_salt_text, wrapping_key, DerivedKey,
    KdfParams, Salt, KEY_SIZE, PASSPHRASE_LEN, SALT_SIZE,
};
