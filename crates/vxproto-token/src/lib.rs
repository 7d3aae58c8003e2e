//! Authentication tokens and IMC addresses for the vxproto hub.
//!
//! # Agent tokens
//!
//! A token is 40 lowercase hex characters (20 bytes):
//!
//! ```text
//! 3DES-CBC( rand[4] | flags[4] | stateCRC[4] | CRC(rand..stateCRC)[4] ) | CRC(ciphertext)[4]
//! ```
//!
//! `stateCRC` is the CRC32 of `"<agent id>:<agent type>:<rand>"`. For
//! `VXAgent` and `VXServer` the rand field is `CRC32(agent id)`, so the same
//! agent always gets the same token and routes addressed to it survive a
//! reconnect. Browser and external tokens use a random value instead.
//!
//! Validation never explains why a token was refused; every failure is a
//! plain `false`.
//!
//! # IMC addresses
//!
//! Module tokens (`ffffffff…`) and topic tokens (`ffff7777…`) are keyed
//! hashes of the module or topic name and group, stable for the lifetime of
//! the key.

pub mod imc;

pub use imc::{classify_destination, is_imc_token, is_imc_topic, Destination};

use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::fmt;
use vxproto_types::AgentType;

type TdesCbcEnc = cbc::Encryptor<des::TdesEde3>;
type TdesCbcDec = cbc::Decryptor<des::TdesEde3>;

/// Length of a token in hex characters.
pub const TOKEN_HEX_LEN: usize = 40;
/// Length of the process secret the 3DES key is built from.
pub const SECRET_LEN: usize = 12;

const TOKEN_LEN: usize = TOKEN_HEX_LEN / 2;
const SEALED_LEN: usize = 16;
const TOKEN_VERSION: u8 = 1;

/// Errors related to token key material.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The configured secret is not 12 bytes of hex.
    #[error("invalid token secret: {0}")]
    InvalidSecret(String),

    /// The block cipher rejected its input.
    #[error("token cipher failure")]
    Cipher,
}

/// Issues and validates tokens with a per-process secret.
///
/// The 3DES key is the 12-byte secret written twice; the CBC IV is the first
/// 8 key bytes.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; SECRET_LEN * 2],
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

fn crc(data: &[u8]) -> [u8; 4] {
    crc32fast::hash(data).to_be_bytes()
}

fn state_crc(agent_id: &str, agent_type: AgentType, rand: u32) -> [u8; 4] {
    crc(format!("{}:{}:{}", agent_id, agent_type, rand).as_bytes())
}

/// Decodes a token string, accepting only the canonical lowercase form.
fn token_bytes(token: &str) -> Option<[u8; TOKEN_LEN]> {
    if token.len() != TOKEN_HEX_LEN
        || !token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    let mut out = [0u8; TOKEN_LEN];
    hex::decode_to_slice(token, &mut out).ok()?;
    Some(out)
}

/// Checks the outer CRC of a token without decrypting it.
pub fn has_token_crc_valid(token: &str) -> bool {
    match token_bytes(token) {
        Some(raw) => crc(&raw[..SEALED_LEN]) == raw[SEALED_LEN..],
        None => false,
    }
}

impl TokenCipher {
    /// Builds a cipher from the process secret.
    pub fn new(secret: [u8; SECRET_LEN]) -> Self {
        let mut key = [0u8; SECRET_LEN * 2];
        key[..SECRET_LEN].copy_from_slice(&secret);
        key[SECRET_LEN..].copy_from_slice(&secret);
        Self { key }
    }

    /// Builds a cipher from a hex-encoded secret.
    pub fn from_hex(secret: &str) -> Result<Self, TokenError> {
        let mut raw = [0u8; SECRET_LEN];
        hex::decode_to_slice(secret.trim(), &mut raw)
            .map_err(|e| TokenError::InvalidSecret(e.to_string()))?;
        Ok(Self::new(raw))
    }

    /// Builds a cipher with a fresh random secret.
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::new(secret)
    }

    fn iv(&self) -> [u8; 8] {
        let mut iv = [0u8; 8];
        iv.copy_from_slice(&self.key[..8]);
        iv
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    fn seal(&self, plain: [u8; SEALED_LEN]) -> Result<[u8; SEALED_LEN], TokenError> {
        let mut buf = plain;
        TdesCbcEnc::new_from_slices(&self.key, &self.iv())
            .map_err(|_| TokenError::Cipher)?
            .encrypt_padded_mut::<NoPadding>(&mut buf, SEALED_LEN)
            .map_err(|_| TokenError::Cipher)?;
        Ok(buf)
    }

    fn open(&self, sealed: &[u8]) -> Option<[u8; SEALED_LEN]> {
        let mut buf = [0u8; SEALED_LEN];
        buf.copy_from_slice(sealed);
        TdesCbcDec::new_from_slices(&self.key, &self.iv())
            .ok()?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .ok()?;
        Some(buf)
    }

    /// Issues a token for an agent.
    ///
    /// Deterministic for `VXAgent`/`VXServer`, random for the other types.
    pub fn new_token(&self, agent_id: &str, agent_type: AgentType) -> Result<String, TokenError> {
        loop {
            let rand = if agent_type.has_deterministic_token() {
                crc32fast::hash(agent_id.as_bytes())
            } else {
                rand::rngs::OsRng.next_u32()
            };

            let mut plain = [0u8; SEALED_LEN];
            plain[..4].copy_from_slice(&rand.to_be_bytes());
            plain[4] = agent_type.code();
            plain[5] = TOKEN_VERSION;
            plain[8..12].copy_from_slice(&state_crc(agent_id, agent_type, rand));
            let check = crc(&plain[..12]);
            plain[12..].copy_from_slice(&check);

            let sealed = self.seal(plain)?;
            let mut raw = [0u8; TOKEN_LEN];
            raw[..SEALED_LEN].copy_from_slice(&sealed);
            raw[SEALED_LEN..].copy_from_slice(&crc(&sealed));
            let token = hex::encode(raw);

            // Random tokens must not collide with the IMC address space.
            if agent_type.has_deterministic_token()
                || imc::classify_destination(&token) == Destination::Hub
            {
                return Ok(token);
            }
        }
    }

    /// Validates a token issued for `agent_id` and `agent_type`.
    pub fn has_token_valid(&self, token: &str, agent_id: &str, agent_type: AgentType) -> bool {
        let Some(raw) = token_bytes(token) else {
            return false;
        };
        if crc(&raw[..SEALED_LEN]) != raw[SEALED_LEN..] {
            return false;
        }
        let Some(plain) = self.open(&raw[..SEALED_LEN]) else {
            return false;
        };
        if crc(&plain[..12]) != plain[12..] {
            return false;
        }
        if plain[4] != agent_type.code() || plain[5] != TOKEN_VERSION {
            return false;
        }
        let rand = u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
        if agent_type.has_deterministic_token() && rand != crc32fast::hash(agent_id.as_bytes()) {
            return false;
        }
        state_crc(agent_id, agent_type, rand) == plain[8..12]
    }
}
