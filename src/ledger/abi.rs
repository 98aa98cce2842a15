//! Minimal contract ABI codec: selectors, call-data for the handful of
//! argument shapes the protocol uses, and word-level decoding of return data
//! and event payloads.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use thiserror::Error;

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    #[error("return data too short: need {needed} bytes, have {available}")]
    OutOfBounds { needed: usize, available: usize },

    #[error("value does not fit in {0}")]
    Overflow(&'static str),
}

/// One call argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(B256),
    Uint(U256),
    Address(Address),
    /// Dynamic `bytes`.
    Bytes(Vec<u8>),
}

/// First four bytes of the keccak hash of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic 0 of an event with the given canonical signature.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let head_len = args.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for arg in args {
        match arg {
            Token::Word(word) => head.extend_from_slice(word.as_slice()),
            Token::Uint(value) => head.extend_from_slice(&value.to_be_bytes::<32>()),
            Token::Address(address) => head.extend_from_slice(address.into_word().as_slice()),
            Token::Bytes(bytes) => {
                let offset = U256::from(head_len + tail.len());
                head.extend_from_slice(&offset.to_be_bytes::<32>());
                tail.extend_from_slice(&U256::from(bytes.len()).to_be_bytes::<32>());
                tail.extend_from_slice(bytes);
                let padding = (WORD - bytes.len() % WORD) % WORD;
                tail.resize(tail.len() + padding, 0);
            }
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    Bytes::from(out)
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8], AbiError> {
    let end = offset.checked_add(len).ok_or(AbiError::Overflow("usize"))?;
    data.get(offset..end).ok_or(AbiError::OutOfBounds {
        needed: end,
        available: data.len(),
    })
}

fn word_at(data: &[u8], offset: usize) -> Result<B256, AbiError> {
    slice_at(data, offset, WORD).map(B256::from_slice)
}

/// The `index`-th 32-byte head word.
pub fn word(data: &[u8], index: usize) -> Result<B256, AbiError> {
    word_at(data, index * WORD)
}

fn word_to_u64(word: B256) -> Result<u64, AbiError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow("u64"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(buf))
}

pub fn decode_u64(data: &[u8], index: usize) -> Result<u64, AbiError> {
    word_to_u64(word(data, index)?)
}

pub fn decode_u8(data: &[u8], index: usize) -> Result<u8, AbiError> {
    let value = decode_u64(data, index)?;
    u8::try_from(value).map_err(|_| AbiError::Overflow("u8"))
}

pub fn decode_address(data: &[u8], index: usize) -> Result<Address, AbiError> {
    let word = word(data, index)?;
    if word[..12].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow("address"));
    }
    Ok(Address::from_word(word))
}

fn offset_in_head(data: &[u8], index: usize) -> Result<usize, AbiError> {
    let offset = decode_u64(data, index)?;
    usize::try_from(offset).map_err(|_| AbiError::Overflow("usize"))
}

/// Dynamic `bytes` whose offset sits in head word `index`.
pub fn decode_bytes(data: &[u8], index: usize) -> Result<Vec<u8>, AbiError> {
    let offset = offset_in_head(data, index)?;
    let len = usize::try_from(word_to_u64(word_at(data, offset)?)?)
        .map_err(|_| AbiError::Overflow("usize"))?;
    slice_at(data, offset + WORD, len).map(<[u8]>::to_vec)
}

/// Dynamic `address[]` whose offset sits in head word `index`.
pub fn decode_address_array(data: &[u8], index: usize) -> Result<Vec<Address>, AbiError> {
    let offset = offset_in_head(data, index)?;
    let count = usize::try_from(word_to_u64(word_at(data, offset)?)?)
        .map_err(|_| AbiError::Overflow("usize"))?;
    let items = data.get(offset + WORD..).ok_or(AbiError::OutOfBounds {
        needed: offset + WORD,
        available: data.len(),
    })?;
    (0..count).map(|i| decode_address(items, i)).collect()
}
