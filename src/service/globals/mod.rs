use std::{
    collections::BTreeMap,
    fs,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use lru_cache::LruCache;
use parking_lot::Mutex;
use ruma::{signatures::Ed25519KeyPair, MilliSecondsSinceUnixEpoch, OwnedServerName, ServerName};
use serde::Deserialize;
use tracing::{error, info};

use crate::{utils::random_string, Config, Error, Result};

#[derive(Deserialize)]
struct VerifyKeyEntry {
    key: ruma::serde::Base64,
}

#[derive(Deserialize)]
struct ServerKeyResponse {
    verify_keys: BTreeMap<String, VerifyKeyEntry>,
    valid_until_ts: MilliSecondsSinceUnixEpoch,
}

struct CachedKeys {
    keys: BTreeMap<String, ruma::serde::Base64>,
    valid_until: MilliSecondsSinceUnixEpoch,
}

/// Server identity, signing key, the outbound HTTP client, and the remote
/// signing-key cache every other service borrows from. One instance lives
/// for the process lifetime.
pub struct Service {
    pub config: Config,
    keypair: Ed25519KeyPair,
    shutdown: AtomicBool,
    pub default_client: reqwest::Client,
    /// Caches a remote server's published signing keys until their claimed
    /// validity (§6: "a freshly-fetched key is cached until its claimed
    /// validity"), used to verify X-Matrix signatures on the policy-server
    /// admission surface.
    key_cache: Mutex<LruCache<OwnedServerName, CachedKeys>>,
}

fn reqwest_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(1)
}

/// Loads the ed25519 keypair from `path`, generating and persisting a fresh
/// one if the file doesn't exist yet. On-disk layout: an 8-byte random
/// version string, a `0xff` separator, then the DER-encoded keypair —
/// matching the format the homeserver itself uses for its own signing key.
fn load_or_generate_keypair(path: &str) -> Result<Ed25519KeyPair> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path, "no signing key found, generating one");
            let mut value = random_string(8).into_bytes();
            value.push(0xff);
            value.extend_from_slice(
                &Ed25519KeyPair::generate().map_err(|_| Error::bad_config("failed to generate ed25519 keypair"))?,
            );
            fs::write(path, &value)?;
            value
        }
        Err(e) => return Err(e.into()),
    };

    let mut parts = bytes.splitn(2, |&b| b == 0xff);
    let version = parts.next().unwrap_or_default();
    let version = String::from_utf8(version.to_vec()).map_err(|_| Error::bad_config("signing key file is corrupt"))?;
    let der = parts.next().ok_or_else(|| Error::bad_config("signing key file is corrupt"))?;

    Ed25519KeyPair::from_der(der, version).map_err(|_| {
        error!(path, "signing key file failed to parse");
        Error::bad_config("signing key file is corrupt")
    })
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        let keypair = match &config.signing_key_path {
            Some(path) => load_or_generate_keypair(path)?,
            None => Ed25519KeyPair::generate()
                .ok()
                .and_then(|der| Ed25519KeyPair::from_der(&der, "ephemeral".to_owned()).ok())
                .ok_or_else(|| Error::bad_config("failed to generate an ephemeral signing key"))?,
        };

        Ok(Self {
            default_client: reqwest_client_builder().build()?,
            config,
            keypair,
            shutdown: AtomicBool::new(false),
            key_cache: Mutex::new(LruCache::new(256)),
        })
    }

    pub fn server_name(&self) -> OwnedServerName {
        self.config.server_name.clone()
    }

    pub fn keypair(&self) -> &Ed25519KeyPair {
        &self.keypair
    }

    async fn fetch_keys(&self, server: &ServerName) -> Result<BTreeMap<String, ruma::serde::Base64>> {
        let url = format!("https://{server}/_matrix/key/v2/server");
        let resp = self.default_client.get(&url).timeout(Duration::from_secs(10)).send().await?;
        if !resp.status().is_success() {
            return Err(Error::BadServerResponse("server key fetch failed"));
        }
        let parsed: ServerKeyResponse = resp.json().await?;
        let keys: BTreeMap<String, ruma::serde::Base64> = parsed.verify_keys.into_iter().map(|(id, entry)| (id, entry.key)).collect();

        self.key_cache.lock().insert(
            server.to_owned(),
            CachedKeys {
                keys: keys.clone(),
                valid_until: parsed.valid_until_ts,
            },
        );
        Ok(keys)
    }

    /// Returns the still-valid verify keys for `server`, fetching fresh ones
    /// if the cache is empty or has expired.
    pub async fn verify_keys(&self, server: &ServerName) -> Result<BTreeMap<String, ruma::serde::Base64>> {
        if let Some(cached) = self.key_cache.lock().get_mut(&server.to_owned()) {
            if cached.valid_until > MilliSecondsSinceUnixEpoch::now() {
                return Ok(cached.keys.clone());
            }
        }
        self.fetch_keys(server).await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
