//! Legacy (pre-typed-envelope) ledger transactions with EIP-155 replay
//! protection.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rlp::{Encodable, Header};
use k256::ecdsa::SigningKey;

/// Everything needed to sign one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub chain_id: u64,
}

/// Signed transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

fn list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

impl LegacyTransaction {
    fn encode_body(&self, out: &mut Vec<u8>) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
    }

    /// RLP of `[nonce, gasPrice, gas, to, value, data, chainId, 0, 0]`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_body(&mut payload);
        self.chain_id.encode(&mut payload);
        0u8.encode(&mut payload);
        0u8.encode(&mut payload);
        list(payload)
    }

    pub fn signing_hash(&self) -> B256 {
        keccak256(self.signing_payload())
    }

    pub fn sign(&self, key: &SigningKey) -> Result<SignedTransaction, k256::ecdsa::Error> {
        let (signature, recovery_id) =
            key.sign_prehash_recoverable(self.signing_hash().as_slice())?;
        let rs = signature.to_bytes();
        let r = U256::from_be_slice(&rs[..32]);
        let s = U256::from_be_slice(&rs[32..]);
        let v = u64::from(recovery_id.to_byte()) + 35 + 2 * self.chain_id;

        let mut payload = Vec::new();
        self.encode_body(&mut payload);
        v.encode(&mut payload);
        r.encode(&mut payload);
        s.encode(&mut payload);
        let raw = list(payload);

        Ok(SignedTransaction {
            hash: keccak256(&raw),
            raw: Bytes::from(raw),
        })
    }
}
