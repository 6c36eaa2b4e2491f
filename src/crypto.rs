use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{AtxError, AtxResult};
use crate::types::{ActivationTx, Hash32, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> AtxResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> AtxResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| AtxError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> AtxResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| AtxError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| AtxError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.public_key)
        .map_err(|err| AtxError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| AtxError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| AtxError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn node_id(keypair: &Keypair) -> NodeId {
    NodeId(keypair.public.to_bytes())
}

/// Content hash used for ATX ids and challenge hashes.
pub fn hash32(data: &[u8]) -> Hash32 {
    *blake3::hash(data).as_bytes()
}

/// Checks the ATX signature under its own smesher id. Any failure, including
/// an undecodable key or signature, renders the ATX malformed.
pub fn verify_atx_signature(atx: &ActivationTx) -> AtxResult<()> {
    let public = PublicKey::from_bytes(atx.smesher_id.as_bytes())
        .map_err(|_| AtxError::Malformed("invalid smesher public key".into()))?;
    let signature = Signature::from_bytes(&atx.signature)
        .map_err(|_| AtxError::Malformed("invalid atx signature encoding".into()))?;
    public
        .verify(&atx.signed_bytes(), &signature)
        .map_err(|_| AtxError::Malformed("invalid atx signature".into()))
}
