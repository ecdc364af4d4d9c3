//! Wallet keys and ECDSA signatures (secp256k1)
//!
//! Signing is deterministic (RFC 6979), so the same key and message always
//! yield the same signature. Wallet ids are derived from the compressed
//! public key.

use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::hash::{double_sha256, sha256};

/// Version byte prefixed to wallet ids before Base58Check encoding
const WALLET_ID_VERSION: u8 = 0x00;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A private key and its public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Wallet id owned by this key
    pub fn wallet_id(&self) -> String {
        public_key_to_wallet_id(&self.public_key)
    }

    /// Sign a message with the private key, returning the compact signature
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_message(&self.secret_key, message)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_signature(&self.public_key, message, signature)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Derive a wallet id: Base58Check(version || RIPEMD160(SHA256(pubkey)))
pub fn public_key_to_wallet_id(public_key: &PublicKey) -> String {
    let sha256_hash = sha256(&public_key.serialize());

    let mut ripemd = Ripemd160::new();
    ripemd.update(&sha256_hash);
    let ripemd_hash = ripemd.finalize();

    let mut id_bytes = vec![WALLET_ID_VERSION];
    id_bytes.extend_from_slice(&ripemd_hash);

    let checksum = double_sha256(&id_bytes);
    id_bytes.extend_from_slice(&checksum[..4]);

    bs58::encode(id_bytes).into_string()
}

/// Check the Base58Check checksum of a wallet id
pub fn is_valid_wallet_id(wallet_id: &str) -> bool {
    let bytes = match bs58::decode(wallet_id).into_vec() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    if bytes.len() != 25 || bytes[0] != WALLET_ID_VERSION {
        return false;
    }
    let (payload, checksum) = bytes.split_at(21);
    double_sha256(payload)[..4] == *checksum
}

/// Parse a compressed or uncompressed public key from hex
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Messages that are not already a 32-byte digest are hashed first
fn message_digest(message: &[u8]) -> Result<Message, KeyError> {
    let digest = if message.len() == 32 {
        message.to_vec()
    } else {
        let mut hasher = Sha256::new();
        hasher.update(message);
        hasher.finalize().to_vec()
    };
    Ok(Message::from_digest_slice(&digest)?)
}

/// Sign a message with a secret key
pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::signing_only();
    let message = message_digest(message)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a compact signature against a public key
///
/// A malformed signature is an error; a well-formed signature that does not
/// match returns `Ok(false)`.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let message = message_digest(message)?;
    let sig = Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.private_key_hex().len(), 64);
        assert_eq!(kp.public_key_hex().len(), 66);
        assert!(is_valid_wallet_id(&kp.wallet_id()));
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let message = b"send 30 to bob";

        let signature = kp.sign(message).unwrap();
        assert!(kp.verify(message, &signature).unwrap());
        assert!(!kp.verify(b"send 300 to bob", &signature).unwrap());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let kp = KeyPair::generate();
        assert_eq!(kp.sign(b"same").unwrap(), kp.sign(b"same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let signature = mallory.sign(b"payload").unwrap();

        assert!(!verify_signature(&alice.public_key, b"payload", &signature).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_error() {
        let kp = KeyPair::generate();
        assert!(kp.verify(b"payload", &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_private_key_hex(&kp1.private_key_hex()).unwrap();

        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert_eq!(kp1.wallet_id(), kp2.wallet_id());
        assert!(KeyPair::from_private_key_hex("zz").is_err());
    }

    #[test]
    fn test_wallet_id_checksum() {
        let id = KeyPair::generate().wallet_id();
        assert!(id.starts_with('1'));

        let mut tampered: Vec<char> = id.chars().collect();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == '2' { '3' } else { '2' };
        let tampered: String = tampered.into_iter().collect();
        assert!(!is_valid_wallet_id(&tampered));
        assert!(!is_valid_wallet_id("ZAKAT_POOL"));
    }
}
