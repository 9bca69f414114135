//! Write path: canonical JSON → gzip → AES-256-GCM with a random
//! 96-bit nonce → `len(4) ∥ nonce(12) ∥ tag(16) ∥ ciphertext(*)`
//! appended to the current log file, fsynced, with a matching row
//! appended to a CSV-like plaintext index. Rotated at `max_log_size`.
//!
//! The 4-byte length prefix exists because a file holding many encrypted
//! records needs *some* framing to scan them back out in order, which
//! `search` depends on.
//!
//! Key derivation: PBKDF2-HMAC-SHA256(secret, salt, 100k, 32B). The salt
//! is persisted next to the log files, never inside the encrypted
//! stream, so the log remains decryptable after a restart.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};
use zeroize::ZeroizeOnDrop;

use crate::config::AuditConfig;
use crate::error::{Error, Result};
use crate::model::unix_seconds;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const LEN_PREFIX_SIZE: usize = 4;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub daily: Decimal,
    pub transaction: Decimal,
    pub weekly: Decimal,
    pub hmac_signature: String,
    pub note: Option<String>,
}

#[derive(ZeroizeOnDrop)]
struct AuditKey([u8; 32]);

impl AuditKey {
    fn derive(secret: &str, salt: &[u8; SALT_SIZE]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        AuditKey(key)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

struct CurrentFile {
    path: PathBuf,
    file: File,
    size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub min_daily_limit: Option<Decimal>,
}

struct IndexRow {
    timestamp: DateTime<Utc>,
    user_id: String,
    daily: Decimal,
    filename: String,
    entry_hash: String,
}

pub struct AuditLog {
    directory: PathBuf,
    key: AuditKey,
    current: Mutex<CurrentFile>,
    index_path: PathBuf,
    index_lock: Mutex<()>,
    max_log_size_bytes: u64,
    sender: crossbeam_channel::Sender<AuditEntry>,
    receiver: crossbeam_channel::Receiver<AuditEntry>,
}

fn canonical_json(entry: &AuditEntry) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entry)?)
}

fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

impl AuditLog {
    pub fn open(config: &AuditConfig) -> Result<Self> {
        let directory = PathBuf::from(&config.directory);
        std::fs::create_dir_all(&directory)?;

        let salt = Self::load_or_create_salt(&directory)?;
        if config.secret.is_empty() {
            return Err(Error::CryptoUnavailable(
                "audit.secret is empty; cannot derive AEAD key".into(),
            ));
        }
        let key = AuditKey::derive(&config.secret, &salt);

        let index_path = directory.join("index.csv");
        if !index_path.exists() {
            std::fs::write(&index_path, "timestamp,user_id,daily,transaction,filename,entry_hash\n")?;
        }

        let current = Self::open_new_log_file(&directory)?;
        let (sender, receiver) = crossbeam_channel::unbounded();

        Ok(Self {
            directory,
            key,
            current: Mutex::new(current),
            index_path,
            index_lock: Mutex::new(()),
            max_log_size_bytes: config.max_log_size_bytes,
            sender,
            receiver,
        })
    }

    fn load_or_create_salt(directory: &Path) -> Result<[u8; SALT_SIZE]> {
        let salt_path = directory.join("audit.salt");
        if salt_path.exists() {
            let bytes = std::fs::read(&salt_path)?;
            if bytes.len() == SALT_SIZE {
                let mut salt = [0u8; SALT_SIZE];
                salt.copy_from_slice(&bytes);
                return Ok(salt);
            }
            warn!("audit salt file has unexpected length, regenerating");
        }
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        std::fs::write(&salt_path, salt)?;
        Ok(salt)
    }

    fn open_new_log_file(directory: &Path) -> Result<CurrentFile> {
        let filename = format!("limits_{}.enc", unix_seconds());
        let path = directory.join(&filename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(CurrentFile { path, file, size: 0 })
    }

    /// Non-blocking enqueue; a writer worker drains and persists.
    pub fn log(&self, entry: AuditEntry) {
        let _ = self.sender.send(entry);
    }

    /// Runs as one of `writer_workers` tasks, all pulling from the same
    /// queue and serializing their writes through the file mutex.
    pub async fn run_writer(self: Arc<Self>) {
        loop {
            let entry = {
                let receiver = self.receiver.clone();
                match tokio::task::spawn_blocking(move || receiver.recv_timeout(std::time::Duration::from_millis(500))).await {
                    Ok(Ok(entry)) => entry,
                    Ok(Err(_)) => continue,
                    Err(_) => break,
                }
            };
            if let Err(err) = self.write_entry(&entry) {
                error!(error = %err, "audit write failed");
            }
        }
    }

    fn write_entry(&self, entry: &AuditEntry) -> Result<()> {
        let canonical = canonical_json(entry)?;
        let compressed = gzip_compress(&canonical)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext_with_tag = self
            .key
            .cipher()
            .encrypt(nonce, compressed.as_ref())
            .map_err(|e| Error::CryptoUnavailable(format!("audit encrypt failed: {e}")))?;
        let split_at = ciphertext_with_tag.len() - TAG_SIZE;
        let (ciphertext, tag) = ciphertext_with_tag.split_at(split_at);

        let record_body_len = NONCE_SIZE + TAG_SIZE + ciphertext.len();
        let mut record = Vec::with_capacity(LEN_PREFIX_SIZE + record_body_len);
        record.extend_from_slice(&(record_body_len as u32).to_be_bytes());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(tag);
        record.extend_from_slice(ciphertext);

        let filename = {
            let mut current = self.current.lock();
            if current.size + record.len() as u64 > self.max_log_size_bytes && current.size > 0 {
                *current = Self::open_new_log_file(&self.directory)?;
            }
            current.file.write_all(&record)?;
            current.file.sync_all()?;
            current.size += record.len() as u64;
            current.path.file_name().unwrap().to_string_lossy().to_string()
        };

        let entry_hash = hex::encode(Sha256::digest(&canonical));
        self.append_index_row(entry, &filename, &entry_hash)?;
        debug!(user_id = %entry.user_id, filename, "audit entry written");
        Ok(())
    }

    fn append_index_row(&self, entry: &AuditEntry, filename: &str, entry_hash: &str) -> Result<()> {
        let _guard = self.index_lock.lock();
        let mut file = OpenOptions::new().append(true).open(&self.index_path)?;
        writeln!(
            file,
            "{},{},{},{},{},{}",
            entry.timestamp.to_rfc3339(),
            entry.user_id,
            entry.daily,
            entry.transaction,
            filename,
            entry_hash
        )?;
        file.sync_all()?;
        Ok(())
    }

    fn read_index(&self) -> Result<Vec<IndexRow>> {
        let text = std::fs::read_to_string(&self.index_path)?;
        let mut rows = Vec::new();
        for line in text.lines().skip(1) {
            let parts: Vec<&str> = line.splitn(6, ',').collect();
            if parts.len() != 6 {
                continue;
            }
            let (Ok(timestamp), Ok(daily)) = (
                DateTime::parse_from_rfc3339(parts[0]).map(|d| d.with_timezone(&Utc)),
                parts[2].parse::<Decimal>(),
            ) else {
                continue;
            };
            rows.push(IndexRow {
                timestamp,
                user_id: parts[1].to_string(),
                daily,
                filename: parts[4].to_string(),
                entry_hash: parts[5].to_string(),
            });
        }
        Ok(rows)
    }

    fn decrypt_records_in_file(&self, path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
        let buf = std::fs::read(path)?;
        let mut cursor = 0usize;
        let mut records = Vec::new();
        while cursor + LEN_PREFIX_SIZE <= buf.len() {
            let len = u32::from_be_bytes(buf[cursor..cursor + LEN_PREFIX_SIZE].try_into().unwrap()) as usize;
            cursor += LEN_PREFIX_SIZE;
            if cursor + len > buf.len() {
                break;
            }
            let frame = &buf[cursor..cursor + len];
            cursor += len;

            let nonce_bytes = &frame[0..NONCE_SIZE];
            let tag = &frame[NONCE_SIZE..NONCE_SIZE + TAG_SIZE];
            let ciphertext = &frame[NONCE_SIZE + TAG_SIZE..];
            let mut ciphertext_with_tag = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
            ciphertext_with_tag.extend_from_slice(ciphertext);
            ciphertext_with_tag.extend_from_slice(tag);

            let nonce = Nonce::from_slice(nonce_bytes);
            let compressed = match self.key.cipher().decrypt(nonce, ciphertext_with_tag.as_ref()) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let canonical = gzip_decompress(&compressed)?;
            let hash = hex::encode(Sha256::digest(&canonical));
            records.push((hash, canonical));
        }
        Ok(records)
    }

    /// Scans the index for rows matching `query`, then decrypts the
    /// named file's records in order until the one whose hash matches
    /// the index row is found.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<AuditEntry>> {
        let rows = self.read_index()?;
        let matches: Vec<&IndexRow> = rows
            .iter()
            .filter(|r| query.start_time.map_or(true, |t| r.timestamp >= t))
            .filter(|r| query.end_time.map_or(true, |t| r.timestamp <= t))
            .filter(|r| query.user_id.as_ref().map_or(true, |u| &r.user_id == u))
            .filter(|r| query.min_daily_limit.map_or(true, |m| r.daily >= m))
            .collect();

        let mut file_cache: HashMap<String, Vec<(String, Vec<u8>)>> = HashMap::new();
        let mut results = Vec::new();
        for row in matches {
            let records = match file_cache.get(&row.filename) {
                Some(r) => r,
                None => {
                    let path = self.directory.join(&row.filename);
                    let decoded = self.decrypt_records_in_file(&path)?;
                    file_cache.entry(row.filename.clone()).or_insert(decoded)
                }
            };
            if let Some((_, canonical)) = records.iter().find(|(hash, _)| hash == &row.entry_hash) {
                if let Ok(entry) = serde_json::from_slice::<AuditEntry>(canonical) {
                    results.push(entry);
                }
            }
        }
        Ok(results)
    }

    /// Deletes log files whose mtime is older than `retention_days`.
    pub fn enforce_retention(&self, retention_days: u64) -> std::io::Result<usize> {
        let cutoff = unix_seconds().saturating_sub(retention_days * 24 * 3600);
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("enc") {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    let modified_secs = modified
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    if modified_secs < cutoff {
                        let _ = std::fs::remove_file(&path);
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config(dir: &Path) -> AuditConfig {
        AuditConfig {
            directory: dir.to_string_lossy().to_string(),
            max_log_size_bytes: 1024 * 1024,
            retention_days: 90,
            writer_workers: 1,
            secret: "test-secret-material".into(),
        }
    }

    fn sample_entry(user_id: &str) -> AuditEntry {
        AuditEntry {
            timestamp: crate::model::now_ts(),
            user_id: user_id.to_string(),
            daily: dec!(5000),
            transaction: dec!(1000),
            weekly: dec!(35000),
            hmac_signature: "deadbeef".into(),
            note: None,
        }
    }

    #[test]
    fn write_then_search_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&test_config(dir.path())).unwrap();
        let entry = sample_entry("U_2");
        log.write_entry(&entry).unwrap();

        let results = log
            .search(&SearchQuery {
                user_id: Some("U_2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, "U_2");
        assert_eq!(results[0].daily, dec!(5000));
    }

    #[test]
    fn search_with_no_match_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&test_config(dir.path())).unwrap();
        log.write_entry(&sample_entry("U_1")).unwrap();
        let results = log
            .search(&SearchQuery {
                user_id: Some("U_nonexistent".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn five_entries_search_by_user_returns_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&test_config(dir.path())).unwrap();
        for i in 0..5 {
            log.write_entry(&sample_entry(&format!("U_{i}"))).unwrap();
        }
        let results = log
            .search(&SearchQuery {
                user_id: Some("U_2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, "U_2");
    }

    #[test]
    fn salt_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let log = AuditLog::open(&config).unwrap();
            log.write_entry(&sample_entry("U_1")).unwrap();
        }
        let log2 = AuditLog::open(&config).unwrap();
        let results = log2
            .search(&SearchQuery {
                user_id: Some("U_1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn missing_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.secret = String::new();
        assert!(AuditLog::open(&config).is_err());
    }
}
