//! Opaque signing, verification, and address-derivation primitives.
//!
//! The chain engine treats ECDSA and the Base58Check/RIPEMD160 pipeline as
//! external collaborators it only *consumes* — it never re-derives key
//! material itself. This module is that collaborator: a thin, concrete
//! implementation grounded on the same crate family `zebra-chain` reaches
//! for (`secp256k1`, `ripemd`, `bs58`).

use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature as EcdsaSignature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::ChainError;
use crate::hash::Hash256;

/// Version byte for EmberChain addresses.
const ADDRESS_VERSION: u8 = 0x32;

/// Derives the Base58Check address for an uncompressed secp256k1 public key:
/// `Base58Check(0x32 || RIPEMD160(SHA256(0x04 || pubkey_bytes)))`.
#[must_use]
pub fn address_from_public_key(pubkey: &PublicKey) -> String {
    let uncompressed = pubkey.serialize_uncompressed();
    let sha = Sha256::digest(uncompressed);
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha);
    let pkh = ripemd.finalize();

    let mut payload = Vec::with_capacity(1 + pkh.len());
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(&pkh);

    bs58::encode(payload).with_check().into_string()
}

/// Decodes a Base58Check address back into its 20-byte pubkey hash.
pub fn decode_address(address: &str) -> Result<[u8; 20], ChainError> {
    let bytes = bs58::decode(address)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
        .map_err(|e| ChainError::InvalidAddress(e.to_string()))?;
    // `with_check` already verified and stripped the checksum; `bytes[0]` is the version.
    if bytes.len() != 21 {
        return Err(ChainError::InvalidAddress(format!(
            "expected 21-byte payload, got {}",
            bytes.len()
        )));
    }
    let mut pkh = [0u8; 20];
    pkh.copy_from_slice(&bytes[1..]);
    Ok(pkh)
}

/// Encodes `sig.der "." pubkey.der` as hex, the wire signature-string
/// format every transaction input carries.
#[must_use]
pub fn encode_signature_string(sig: &EcdsaSignature, pubkey: &PublicKey) -> String {
    format!(
        "{}.{}",
        hex::encode(sig.serialize_der()),
        hex::encode(pubkey.serialize())
    )
}

/// Decodes a wire signature string back into `(signature, pubkey)`.
pub fn decode_signature_string(s: &str) -> Result<(EcdsaSignature, PublicKey), ChainError> {
    let (sig_hex, pk_hex) = s.split_once('.').ok_or(ChainError::InvalidSignature)?;
    let sig_bytes = hex::decode(sig_hex).map_err(|_| ChainError::InvalidSignature)?;
    let pk_bytes = hex::decode(pk_hex).map_err(|_| ChainError::InvalidSignature)?;
    let sig = EcdsaSignature::from_der(&sig_bytes).map_err(|_| ChainError::InvalidSignature)?;
    let pubkey = PublicKey::from_slice(&pk_bytes).map_err(|_| ChainError::InvalidSignature)?;
    Ok((sig, pubkey))
}

/// Verifies an ECDSA signature over a transaction id hash.
#[must_use]
pub fn verify(tx_id: &Hash256, sig: &EcdsaSignature, pubkey: &PublicKey) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(message) = Message::from_digest_slice(tx_id.as_bytes()) else {
        return false;
    };
    secp.verify_ecdsa(&message, sig, pubkey).is_ok()
}

/// Signs a transaction id hash with a private key, used by `send`.
pub fn sign(tx_id: &Hash256, secret_key: &SecretKey) -> Result<EcdsaSignature, ChainError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest_slice(tx_id.as_bytes())
        .map_err(|e| ChainError::Cryptographic(e.to_string()))?;
    Ok(secp.sign_ecdsa(&message, secret_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_decode() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        let addr = address_from_public_key(&pubkey);

        let sha = Sha256::digest(pubkey.serialize_uncompressed());
        let mut ripemd = Ripemd160::new();
        ripemd.update(sha);
        let expected_pkh = ripemd.finalize();

        let decoded = decode_address(&addr).unwrap();
        assert_eq!(&decoded[..], &expected_pkh[..]);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        let tx_id = Hash256::sha256(b"some transaction payload");

        let sig = sign(&tx_id, &secret).unwrap();
        assert!(verify(&tx_id, &sig, &pubkey));

        let encoded = encode_signature_string(&sig, &pubkey);
        let (decoded_sig, decoded_pk) = decode_signature_string(&encoded).unwrap();
        assert!(verify(&tx_id, &decoded_sig, &decoded_pk));
    }

    #[test]
    fn verify_rejects_mismatched_key() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let other_secret = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let other_pubkey = PublicKey::from_secret_key(&secp, &other_secret);
        let tx_id = Hash256::sha256(b"payload");

        let sig = sign(&tx_id, &secret).unwrap();
        assert!(!verify(&tx_id, &sig, &other_pubkey));
    }
}
