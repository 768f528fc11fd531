use std::fmt;

use ruma::{OwnedRoomId, OwnedServerName, OwnedUserId};
use serde::Deserialize;
use url::Url;

use crate::{Error, Result};

/// Configuration for the appservice registration meowlnir authenticates
/// itself to the homeserver with, and that the homeserver uses to push
/// transactions back to us.
#[derive(Clone, Debug, Deserialize)]
pub struct AppserviceConfig {
    pub id: String,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    #[serde(default)]
    pub namespaces: AppserviceNamespaces,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppserviceNamespaces {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub rooms: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,

    pub server_name: OwnedServerName,
    /// Base URL of the homeserver's client-server API, validated at load
    /// time rather than left as an opaque string the HTTP client might
    /// mangle while concatenating paths onto it.
    pub homeserver_url: Url,

    pub appservice: AppserviceConfig,

    /// Path to the ed25519 signing key used by the policy-server endpoints.
    /// When absent, policy-server signing is disabled but admission checks
    /// still run.
    pub signing_key_path: Option<String>,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Shared secret the homeserver's admission-callback hook (`user_may_invite`,
    /// `accept_make_join`, ...) must present as a bearer token, compared with
    /// constant-time SHA-256 equality (§6).
    pub admission_secret: String,

    /// Optional path to a separate appservice registration YAML file (the
    /// format the homeserver itself loads); when set, it overrides the
    /// inline `[appservice]` table for `id`/`as_token`/`hs_token`/namespaces.
    pub registration_path: Option<String>,

    /// Management rooms this process owns an evaluator for.
    pub management_rooms: Vec<ManagementRoomConfig>,

    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub filter_local_invites: bool,
    pub auto_reject_invites_token: Option<String>,
    #[serde(default = "true_fn")]
    pub notify_management_room: bool,
    #[serde(default)]
    pub always_redact: bool,
    #[serde(default)]
    pub auto_redact_patterns: Vec<String>,
    #[serde(default)]
    pub rule_filter: Vec<String>,

    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,
    #[serde(default = "default_acl_debounce_secs")]
    pub acl_debounce_secs: u64,

    #[serde(default = "default_log")]
    pub log: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManagementRoomConfig {
    pub room_id: OwnedRoomId,
    #[serde(default)]
    pub admins: Vec<OwnedUserId>,
}

#[derive(Deserialize)]
struct RegistrationNamespaceEntry {
    regex: String,
}

#[derive(Deserialize, Default)]
struct RegistrationNamespaces {
    #[serde(default)]
    users: Vec<RegistrationNamespaceEntry>,
    #[serde(default)]
    rooms: Vec<RegistrationNamespaceEntry>,
}

/// The homeserver's own appservice-registration YAML shape (Matrix spec
/// `POST /_synapse/admin/v1/register` / `conduit`'s `registration.yaml`
/// loader), distinct from this crate's inline `[appservice]` TOML table.
#[derive(Deserialize)]
struct RegistrationFile {
    id: String,
    as_token: String,
    hs_token: String,
    sender_localpart: String,
    #[serde(default)]
    namespaces: RegistrationNamespaces,
}

impl Config {
    /// When `registration_path` is set, overrides the inline `[appservice]`
    /// table with whatever the homeserver's own registration file says, so
    /// the two never drift out of sync.
    pub fn apply_registration_override(&mut self) -> Result<()> {
        let Some(path) = &self.registration_path else {
            return Ok(());
        };
        let bytes = std::fs::read(path).map_err(|_| Error::bad_config("registration_path could not be read"))?;
        let registration: RegistrationFile = serde_yaml::from_slice(&bytes).map_err(|_| Error::bad_config("registration_path is not valid registration YAML"))?;

        self.appservice.id = registration.id;
        self.appservice.as_token = registration.as_token;
        self.appservice.hs_token = registration.hs_token;
        self.appservice.sender_localpart = registration.sender_localpart;
        self.appservice.namespaces = AppserviceNamespaces {
            users: registration.namespaces.users.into_iter().map(|e| e.regex).collect(),
            rooms: registration.namespaces.rooms.into_iter().map(|e| e.regex).collect(),
        };
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Active config values:")?;
        writeln!(f, "Server name: {}", self.server_name)?;
        writeln!(f, "Homeserver URL: {}", self.homeserver_url)?;
        writeln!(f, "Appservice id: {}", self.appservice.id)?;
        writeln!(f, "Sqlite path: {}", self.sqlite_path)?;
        writeln!(f, "Dry run: {}", self.dry_run)?;
        writeln!(f, "Management rooms: {}", self.management_rooms.len())?;
        writeln!(
            f,
            "Policy-server signing: {}",
            if self.signing_key_path.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        )
    }
}

fn default_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8050
}

fn default_sqlite_path() -> String {
    directories::ProjectDirs::from("xyz", "meowlnir", "meowlnir")
        .map(|dirs| dirs.data_dir().join("meowlnir.db").to_string_lossy().into_owned())
        .unwrap_or_else(|| "./meowlnir.db".to_owned())
}

fn default_reconciliation_interval_secs() -> u64 {
    60 * 60
}

fn default_acl_debounce_secs() -> u64 {
    15
}

fn default_log() -> String {
    "warn,meowlnir=info".to_owned()
}

fn true_fn() -> bool {
    true
}
