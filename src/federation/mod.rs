//! Federation Coordinator (C13): turns a local fraud pattern into a
//! differentially-private, HMAC-integrity-tagged model delta, broadcasts
//! it to peers over AEAD-encrypted transport, applies it locally after
//! re-verification, and logs an opaque on-chain propagation record.
//!
//! Training, the chain client, and peer transport are external
//! collaborators abstracted behind traits, the same capability-interface
//! pattern used for `ContainmentHook` in the controller.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::Sha3_256;
use tracing::{error, info, warn};

use crate::config::FederationConfig;
use crate::error::{Error, Result};
use crate::model::unix_seconds;

type HmacSha3_256 = Hmac<Sha3_256>;

/// A local fraud pattern abstracted into a fixed-length embedding by an
/// encoder this crate treats as external.
#[derive(Debug, Clone)]
pub struct Case {
    pub pattern_hash: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// {layer_name -> tensor}, kept in a `BTreeMap` so iteration order is
/// always the sorted-key order the integrity tag is computed over.
pub type Delta = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMetadata {
    pub proof: String,
    pub pattern_hash: String,
    pub delta_hash: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub delta: Delta,
    pub metadata: DeltaMetadata,
}

/// Current layer weights. In production this would be the live model
/// state; here it is the thing `process_pattern` reads and `apply`
/// mutates.
pub type WeightMap = BTreeMap<String, Tensor>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &str, payload: &[u8]) -> Result<()>;
}

pub struct NoopPeerTransport;

#[async_trait]
impl PeerTransport for NoopPeerTransport {
    async fn send(&self, peer: &str, _payload: &[u8]) -> Result<()> {
        info!(peer, "noop transport: delta broadcast discarded");
        Ok(())
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn log_propagation(&self, delta_hash: &str, pattern_hash: &str) -> Result<String>;
    async fn verify_propagation(&self, delta_hash: &str) -> Result<bool>;
}

pub struct NoopChainClient;

#[async_trait]
impl ChainClient for NoopChainClient {
    async fn log_propagation(&self, delta_hash: &str, pattern_hash: &str) -> Result<String> {
        info!(delta_hash, pattern_hash, "noop chain client: propagation not recorded");
        Ok("noop-receipt".to_string())
    }
    async fn verify_propagation(&self, _delta_hash: &str) -> Result<bool> {
        Ok(true)
    }
}

fn canonical_tensor_bytes(layer: &str, tensor: &Tensor) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(layer.len() + tensor.values.len() * 4 + tensor.shape.len() * 8);
    bytes.extend_from_slice(layer.as_bytes());
    for v in &tensor.values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    for d in &tensor.shape {
        bytes.extend_from_slice(&(*d as u64).to_le_bytes());
    }
    bytes
}

/// HMAC-SHA3-256 over each tensor's bytes followed by shape, keys in
/// sorted order (guaranteed by `Delta` being a `BTreeMap`).
fn integrity_tag(secret: &str, delta: &Delta) -> Result<String> {
    let mut mac = <HmacSha3_256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::CryptoUnavailable(format!("federation hmac key: {e}")))?;
    for (layer, tensor) in delta {
        Mac::update(&mut mac, &canonical_tensor_bytes(layer, tensor));
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn delta_hash(delta: &Delta) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for (layer, tensor) in delta {
        hasher.update(canonical_tensor_bytes(layer, tensor));
    }
    hex::encode(hasher.finalize())
}

fn derive_aead_key(secret: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"fortiguard-federation-aead-v1");
    hasher.finalize().into()
}

fn encrypt_envelope(secret: &str, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
    let key_bytes = derive_aead_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = serde_json::to_vec(envelope)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| Error::CryptoUnavailable(format!("federation envelope encryption failed: {e}")))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_envelope(secret: &str, payload: &[u8]) -> Result<EncryptedEnvelope> {
    if payload.len() < 12 {
        return Err(Error::IntegrityViolation("federation payload too short".into()));
    }
    let (nonce_bytes, ciphertext) = payload.split_at(12);
    let key_bytes = derive_aead_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| Error::IntegrityViolation(format!("federation envelope decryption failed: {e}")))?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// `sigma = sqrt(2 ln(1.25/delta)) / epsilon`, the Gaussian-mechanism
/// noise scale for the configured privacy budget.
fn noise_sigma(epsilon: f64, delta: f64) -> f64 {
    (2.0 * (1.25f64 / delta).ln()).sqrt() / epsilon
}

/// Box-Muller transform, sampling N(0, sigma^2).
fn sample_gaussian(sigma: f64) -> f64 {
    use std::f64::consts::PI;
    let u1: f64 = rand::random::<f64>().max(f64::EPSILON);
    let u2: f64 = rand::random();
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn add_dp_noise(tensor: &mut Tensor, sigma: f64) {
    for v in tensor.values.iter_mut() {
        *v += sample_gaussian(sigma) as f32;
    }
}

pub struct FederationCoordinator {
    config: FederationConfig,
    transport: Arc<dyn PeerTransport>,
    chain: Arc<dyn ChainClient>,
    weights: RwLock<WeightMap>,
    registry_dir: PathBuf,
}

impl FederationCoordinator {
    pub fn new(
        config: FederationConfig,
        initial_weights: WeightMap,
        transport: Arc<dyn PeerTransport>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        if config.epsilon <= 0.0 {
            return Err(Error::Config("federation.epsilon must be > 0".into()));
        }
        if !(0.0 < config.delta && config.delta < 1.0) {
            return Err(Error::Config("federation.delta must be in (0,1)".into()));
        }
        let registry_dir = PathBuf::from(&config.model_registry_dir);
        Ok(Self {
            config,
            transport,
            chain,
            weights: RwLock::new(initial_weights),
            registry_dir,
        })
    }

    /// Runs the full local-pattern-to-propagated-delta pipeline and
    /// returns the delta's content hash.
    pub async fn process_pattern(&self, case: &Case) -> Result<String> {
        let mean_embedding = if case.embedding.is_empty() {
            0.0
        } else {
            case.embedding.iter().map(|v| *v as f64).sum::<f64>() / case.embedding.len() as f64
        };
        let scale = 1.0 + mean_embedding * 0.01;

        let current = self.weights.read().clone();
        let mut delta: Delta = BTreeMap::new();
        for (layer, tensor) in &current {
            let updated_values: Vec<f32> = tensor.values.iter().map(|w| w * scale as f32 - w).collect();
            delta.insert(
                layer.clone(),
                Tensor {
                    shape: tensor.shape.clone(),
                    values: updated_values,
                },
            );
        }

        let sigma = noise_sigma(self.config.epsilon, self.config.delta);
        for tensor in delta.values_mut() {
            add_dp_noise(tensor, sigma);
        }

        if self.config.secret.is_empty() {
            return Err(Error::CryptoUnavailable("federation secret not configured".into()));
        }
        let proof = integrity_tag(&self.config.secret, &delta)?;
        let hash = delta_hash(&delta);
        let metadata = DeltaMetadata {
            proof,
            pattern_hash: case.pattern_hash.clone(),
            delta_hash: hash.clone(),
            timestamp: unix_seconds(),
        };

        let envelope = EncryptedEnvelope { delta: delta.clone(), metadata: metadata.clone() };
        match encrypt_envelope(&self.config.secret, &envelope) {
            Ok(payload) => {
                for peer in &self.config.peers {
                    if let Err(err) = self.transport.send(peer, &payload).await {
                        warn!(peer, error = %err, "federation broadcast failed");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to encrypt federation envelope, skipping broadcast"),
        }

        self.apply(delta, metadata.clone())?;

        match self.chain.log_propagation(&metadata.delta_hash, &metadata.pattern_hash).await {
            Ok(receipt) => info!(receipt, "propagation logged on chain"),
            Err(err) => warn!(error = %err, "chain propagation log failed"),
        }

        Ok(hash)
    }

    /// Verifies `delta`'s HMAC under the shared secret, merges it into
    /// the live weight map, and commits a versioned snapshot.
    pub fn apply(&self, delta: Delta, metadata: DeltaMetadata) -> Result<String> {
        let expected = integrity_tag(&self.config.secret, &delta)?;
        let tags_match: bool = {
            use subtle::ConstantTimeEq;
            expected.as_bytes().ct_eq(metadata.proof.as_bytes()).into()
        };
        if !tags_match {
            return Err(Error::IntegrityViolation("federation delta HMAC mismatch".into()));
        }

        {
            let mut weights = self.weights.write();
            for (layer, d) in &delta {
                match weights.get_mut(layer) {
                    Some(tensor) => {
                        for (w, dv) in tensor.values.iter_mut().zip(d.values.iter()) {
                            *w += dv;
                        }
                    }
                    None => {
                        weights.insert(layer.clone(), d.clone());
                    }
                }
            }
        }

        self.commit_version(&metadata)
    }

    fn commit_version(&self, metadata: &DeltaMetadata) -> Result<String> {
        use sha2::{Digest, Sha256};
        std::fs::create_dir_all(&self.registry_dir)?;

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(metadata)?);
        let version_hash = hex::encode(hasher.finalize())[..12].to_string();

        let snapshot_path = self.registry_dir.join(format!("{version_hash}.json"));
        let weights = self.weights.read();
        std::fs::write(&snapshot_path, serde_json::to_vec_pretty(&*weights)?)?;
        drop(weights);

        let current_path = self.registry_dir.join("current");
        let tmp_path = self.registry_dir.join("current.tmp");
        std::fs::write(&tmp_path, &version_hash)?;
        std::fs::rename(&tmp_path, &current_path)?;

        info!(version_hash, "federation model version committed");
        Ok(version_hash)
    }

    pub fn current_version(&self) -> Result<Option<String>> {
        let current_path = self.registry_dir.join("current");
        if !current_path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(current_path)?))
    }

    pub fn weights_snapshot(&self) -> WeightMap {
        self.weights.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_weights() -> WeightMap {
        let mut w = BTreeMap::new();
        w.insert(
            "layer1".to_string(),
            Tensor { shape: vec![2], values: vec![1.0, 2.0] },
        );
        w
    }

    fn test_config() -> (FederationConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = FederationConfig {
            peers: vec!["https://peer-a.example".into()],
            secret: "test-secret".into(),
            epsilon: 1.0,
            delta: 1e-5,
            model_registry_dir: dir.path().to_string_lossy().to_string(),
        };
        (config, dir)
    }

    #[test]
    fn integrity_tag_is_deterministic_and_key_scoped() {
        let delta = sample_weights();
        let a = integrity_tag("secret-a", &delta).unwrap();
        let b = integrity_tag("secret-a", &delta).unwrap();
        let c = integrity_tag("secret-b", &delta).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn noise_sigma_matches_gaussian_mechanism_formula() {
        let sigma = noise_sigma(1.0, 1e-5);
        let expected = (2.0 * (1.25f64 / 1e-5).ln()).sqrt();
        assert!((sigma - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn process_pattern_updates_weights_and_commits_version() {
        let (config, _dir) = test_config();
        let coordinator = FederationCoordinator::new(
            config,
            sample_weights(),
            Arc::new(NoopPeerTransport),
            Arc::new(NoopChainClient),
        )
        .unwrap();

        let case = Case { pattern_hash: "p1".into(), embedding: vec![0.5, 0.5] };
        let hash = coordinator.process_pattern(&case).await.unwrap();
        assert!(!hash.is_empty());
        assert!(coordinator.current_version().unwrap().is_some());
    }

    #[test]
    fn apply_rejects_tampered_delta() {
        let (config, _dir) = test_config();
        let coordinator = FederationCoordinator::new(
            config,
            sample_weights(),
            Arc::new(NoopPeerTransport),
            Arc::new(NoopChainClient),
        )
        .unwrap();

        let delta = sample_weights();
        let metadata = DeltaMetadata {
            proof: "not-a-real-tag".into(),
            pattern_hash: "p1".into(),
            delta_hash: delta_hash(&delta),
            timestamp: unix_seconds(),
        };
        let result = coordinator.apply(delta, metadata);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_invalid_privacy_budget() {
        let (mut config, _dir) = test_config();
        config.epsilon = 0.0;
        let result = FederationCoordinator::new(
            config,
            sample_weights(),
            Arc::new(NoopPeerTransport),
            Arc::new(NoopChainClient),
        );
        assert!(result.is_err());
    }
}
