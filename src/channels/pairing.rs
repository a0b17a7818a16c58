// ABOUTME: Pairing service: pending sender approvals persisted in the settings store.
// ABOUTME: Idempotent code minting, expiry elision, max-3 retention, approve/deny take.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::channels::{normalize_allow_entry_for_channel, normalize_channel};
use crate::config::Config;

pub const PAIRING_PENDING_KEY: &str = "pairing_pending_v1";

const PAIRING_CODE_LENGTH: usize = 8;
/// Visually ambiguous characters (0, 1, I, O) are deliberately absent.
const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const MAX_PENDING_PAIRINGS: usize = 3;

fn default_pairing_ttl() -> Duration {
    Duration::hours(1)
}

/// A pending sender approval entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingPairing {
    pub channel: String,
    pub sender_id: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Abstract key-value setting store the pairing state lives in.
pub trait SettingStore: Send + Sync {
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Manages pending sender approvals over the setting store.
pub struct PairingService {
    store: Arc<dyn SettingStore>,
}

impl PairingService {
    pub fn new(store: Arc<dyn SettingStore>) -> Self {
        Self { store }
    }

    /// Return the existing pending entry for (channel, sender), or mint a new
    /// code. The stored list is rewritten either way so expired entries are
    /// elided.
    pub fn create_or_get_pending(
        &self,
        channel: &str,
        sender_id: &str,
        ttl: Option<Duration>,
    ) -> Result<PendingPairing> {
        let channel = normalize_channel(channel);
        let sender_id = sender_id.trim().to_string();
        if channel.is_empty() || sender_id.is_empty() {
            bail!("channel and sender_id are required");
        }
        let ttl = match ttl {
            Some(t) if t > Duration::zero() => t,
            _ => default_pairing_ttl(),
        };

        let now = Utc::now();
        let mut items = filter_non_expired(self.load_pending()?, now);

        if let Some(existing) = items
            .iter()
            .find(|it| it.channel == channel && it.sender_id == sender_id)
            .cloned()
        {
            self.save_pending(&items)?;
            return Ok(existing);
        }

        let entry = PendingPairing {
            channel,
            sender_id,
            code: random_pairing_code(),
            created_at: now,
            expires_at: now + ttl,
        };
        items.push(entry.clone());
        if items.len() > MAX_PENDING_PAIRINGS {
            items.sort_by_key(|it| it.created_at);
            items = items.split_off(items.len() - MAX_PENDING_PAIRINGS);
        }
        self.save_pending(&items)?;
        Ok(entry)
    }

    /// All live pending entries; persists the elided list.
    pub fn list_pending(&self) -> Result<Vec<PendingPairing>> {
        let items = filter_non_expired(self.load_pending()?, Utc::now());
        self.save_pending(&items)?;
        Ok(items)
    }

    /// Approve a pending entry: add the normalized sender to the channel's
    /// allow-list in `cfg` and remove the entry. The caller persists `cfg`.
    pub fn approve(&self, cfg: &mut Config, channel: &str, code: &str) -> Result<PendingPairing> {
        let (entry, remaining) = self.take_pending(channel, code)?;
        add_channel_allow_from(cfg, &entry.channel, &entry.sender_id)?;
        self.save_pending(&remaining)?;
        Ok(entry)
    }

    /// Remove a pending entry without approving it.
    pub fn deny(&self, channel: &str, code: &str) -> Result<PendingPairing> {
        let (entry, remaining) = self.take_pending(channel, code)?;
        self.save_pending(&remaining)?;
        Ok(entry)
    }

    fn take_pending(
        &self,
        channel: &str,
        code: &str,
    ) -> Result<(PendingPairing, Vec<PendingPairing>)> {
        let channel = normalize_channel(channel);
        let code = normalize_code(code);
        if channel.is_empty() || code.is_empty() {
            bail!("channel and code are required");
        }
        let items = filter_non_expired(self.load_pending()?, Utc::now());
        let mut hit: Option<PendingPairing> = None;
        let mut remaining = Vec::with_capacity(items.len());
        for it in items {
            if hit.is_none() && it.channel == channel && normalize_code(&it.code) == code {
                hit = Some(it);
            } else {
                remaining.push(it);
            }
        }
        match hit {
            Some(entry) => Ok((entry, remaining)),
            None => bail!("pairing code not found for channel {channel:?}"),
        }
    }

    fn load_pending(&self) -> Result<Vec<PendingPairing>> {
        let raw = self.store.get_setting(PAIRING_PENDING_KEY)?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).context("Failed to parse pending pairings")
    }

    fn save_pending(&self, items: &[PendingPairing]) -> Result<()> {
        let data = serde_json::to_string(items).context("Failed to encode pending pairings")?;
        self.store.set_setting(PAIRING_PENDING_KEY, &data)
    }
}

/// Drop expired and malformed entries, re-normalizing what remains.
fn filter_non_expired(items: Vec<PendingPairing>, now: DateTime<Utc>) -> Vec<PendingPairing> {
    items
        .into_iter()
        .filter(|it| it.expires_at > now)
        .map(|mut it| {
            it.channel = normalize_channel(&it.channel);
            it.code = normalize_code(&it.code);
            it.sender_id = it.sender_id.trim().to_string();
            it
        })
        .filter(|it| !it.channel.is_empty() && !it.code.is_empty() && !it.sender_id.is_empty())
        .collect()
}

/// Mint an 8-character code from the unambiguous alphabet using the OS
/// cryptographic RNG. Predictable codes would break the approval model.
fn random_pairing_code() -> String {
    let mut rng = OsRng;
    (0..PAIRING_CODE_LENGTH)
        .map(|_| PAIRING_CODE_ALPHABET[rng.gen_range(0..PAIRING_CODE_ALPHABET.len())] as char)
        .collect()
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Add a normalized sender to the channel's allow-list, enforcing uniqueness.
fn add_channel_allow_from(cfg: &mut Config, channel: &str, sender_id: &str) -> Result<()> {
    let sender = normalize_allow_entry_for_channel(channel, sender_id);
    if sender.is_empty() {
        bail!("sender id is required");
    }
    let name = normalize_channel(channel);
    let Some(channel_cfg) = cfg.channel_mut(&name) else {
        bail!("unsupported channel: {channel}");
    };
    append_unique(&mut channel_cfg.allow_from, &sender);
    Ok(())
}

fn append_unique(items: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    if items.iter().any(|v| v.trim().eq_ignore_ascii_case(value)) {
        return;
    }
    items.push(value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::TimelineService;
    use tempfile::TempDir;

    fn new_service(dir: &TempDir) -> PairingService {
        let timeline = TimelineService::new(dir.path().join("timeline.db")).unwrap();
        PairingService::new(Arc::new(timeline))
    }

    #[test]
    fn create_is_idempotent_per_sender() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);

        let first = service
            .create_or_get_pending("slack", "U1", None)
            .unwrap();
        assert_eq!(first.channel, "slack");
        assert_eq!(first.code.len(), 8);
        assert!(first
            .code
            .bytes()
            .all(|b| PAIRING_CODE_ALPHABET.contains(&b)));

        let second = service
            .create_or_get_pending("slack", "U1", None)
            .unwrap();
        assert_eq!(second.code, first.code);

        let other = service
            .create_or_get_pending("slack", "U2", None)
            .unwrap();
        assert_ne!(other.code, first.code);
    }

    #[test]
    fn channel_is_normalized_on_create() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);
        let entry = service
            .create_or_get_pending(" Teams ", " user-1 ", None)
            .unwrap();
        assert_eq!(entry.channel, "msteams");
        assert_eq!(entry.sender_id, "user-1");
    }

    #[test]
    fn create_requires_channel_and_sender() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);
        assert!(service.create_or_get_pending("", "U1", None).is_err());
        assert!(service.create_or_get_pending("slack", "  ", None).is_err());
    }

    #[test]
    fn expired_entries_are_elided_everywhere() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);

        service
            .create_or_get_pending("slack", "U1", Some(Duration::milliseconds(-1)))
            .unwrap();
        // Negative TTL falls back to the one-hour default, so expire it by
        // writing a stale list directly.
        let now = Utc::now();
        let stale = vec![PendingPairing {
            channel: "slack".into(),
            sender_id: "U1".into(),
            code: "AAAA2222".into(),
            created_at: now - Duration::hours(2),
            expires_at: now - Duration::hours(1),
        }];
        service.save_pending(&stale).unwrap();

        assert!(service.list_pending().unwrap().is_empty());
        // A fresh create mints a new code instead of returning the stale one.
        let entry = service.create_or_get_pending("slack", "U1", None).unwrap();
        assert_ne!(entry.code, "AAAA2222");
    }

    #[test]
    fn retains_newest_three_entries() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);

        for sender in ["U1", "U2", "U3", "U4", "U5"] {
            service.create_or_get_pending("slack", sender, None).unwrap();
        }
        let pending = service.list_pending().unwrap();
        assert_eq!(pending.len(), 3);
        let senders: Vec<&str> = pending.iter().map(|p| p.sender_id.as_str()).collect();
        assert!(senders.contains(&"U5"));
        assert!(!senders.contains(&"U1"));
        assert!(!senders.contains(&"U2"));
    }

    #[test]
    fn approve_adds_to_allow_list_and_takes_entry() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);
        let mut cfg = Config::default();

        let entry = service
            .create_or_get_pending("teams", "Teams:User:Alice@example.com", None)
            .unwrap();
        let approved = service
            .approve(&mut cfg, "msteams", &entry.code.to_lowercase())
            .unwrap();
        assert_eq!(approved.code, entry.code);
        assert_eq!(
            cfg.channels.msteams.allow_from,
            vec!["alice@example.com".to_string()]
        );
        assert!(service.list_pending().unwrap().is_empty());

        // Approving twice is a not-found error.
        assert!(service.approve(&mut cfg, "msteams", &entry.code).is_err());
    }

    #[test]
    fn approve_is_unique_on_allow_list() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);
        let mut cfg = Config::default();
        cfg.channels.slack.allow_from.push("u1".to_string());

        let entry = service.create_or_get_pending("slack", "U1", None).unwrap();
        service.approve(&mut cfg, "slack", &entry.code).unwrap();
        assert_eq!(cfg.channels.slack.allow_from, vec!["u1".to_string()]);
    }

    #[test]
    fn deny_removes_without_config_change() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);

        let entry = service.create_or_get_pending("slack", "U9", None).unwrap();
        let denied = service.deny("slack", &entry.code).unwrap();
        assert_eq!(denied.sender_id, "U9");
        assert!(service.list_pending().unwrap().is_empty());
        assert!(service.deny("slack", &entry.code).is_err());
    }

    #[test]
    fn take_requires_channel_and_code() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);
        assert!(service.deny("", "CODE").is_err());
        assert!(service.deny("slack", "  ").is_err());
    }

    #[test]
    fn unsupported_channel_fails_approval() {
        let dir = TempDir::new().unwrap();
        let service = new_service(&dir);
        let mut cfg = Config::default();
        // Write an entry for a channel the config does not know.
        let now = Utc::now();
        service
            .save_pending(&[PendingPairing {
                channel: "irc".into(),
                sender_id: "nick".into(),
                code: "BBBB3333".into(),
                created_at: now,
                expires_at: now + Duration::hours(1),
            }])
            .unwrap();
        assert!(service.approve(&mut cfg, "irc", "BBBB3333").is_err());
    }
}
