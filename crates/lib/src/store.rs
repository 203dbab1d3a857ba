//! JSON-file persistence for leads and settings.
//!
//! Both stores load once at startup (a missing or invalid file starts empty)
//! and write the whole file back on every mutation. Last write wins per key.

use crate::lead::LeadRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Persisted lead records, keyed by conversation session id.
pub struct LeadStore {
    path: PathBuf,
    leads: RwLock<HashMap<String, LeadRecord>>,
}

impl LeadStore {
    /// Load store from path; if file missing or invalid, starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let records: Vec<LeadRecord> = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|_| Vec::new()),
            Err(_) => Vec::new(),
        };
        let leads = records.into_iter().map(|l| (l.id.clone(), l)).collect();
        Self {
            path,
            leads: RwLock::new(leads),
        }
    }

    async fn save(&self) -> std::io::Result<()> {
        let leads = self.leads.read().await;
        let mut records: Vec<&LeadRecord> = leads.values().collect();
        records.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await
    }

    pub async fn get(&self, id: &str) -> Option<LeadRecord> {
        self.leads.read().await.get(id).cloned()
    }

    /// Insert or replace the record and persist to disk.
    pub async fn save_lead(&self, lead: LeadRecord) -> anyhow::Result<()> {
        self.leads.write().await.insert(lead.id.clone(), lead);
        self.save().await.map_err(anyhow::Error::from)
    }

    /// Remove the record and persist. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let existed = self.leads.write().await.remove(id).is_some();
        if existed {
            self.save().await?;
        }
        Ok(existed)
    }

    /// All records, most recently active first.
    pub async fn list(&self) -> Vec<LeadRecord> {
        let mut records: Vec<LeadRecord> = self.leads.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        records
    }

    /// Records whose name, email, or phone contains the query (the admin
    /// table filter). An empty query returns everything.
    pub async fn search(&self, query: &str) -> Vec<LeadRecord> {
        let mut records = self.list().await;
        records.retain(|l| l.matches(query));
        records
    }
}

/// Process-wide settings the admin panel can change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettings {
    /// Admin-set key that takes precedence over the env/config credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_api_key: Option<String>,
}

/// Persisted [`SystemSettings`], same load/save contract as the lead store.
pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<SystemSettings>,
}

impl SettingsStore {
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
            Err(_) => SystemSettings::default(),
        };
        Self {
            path,
            settings: RwLock::new(settings),
        }
    }

    pub async fn get(&self) -> SystemSettings {
        self.settings.read().await.clone()
    }

    /// Apply a partial update and persist: `Some(key)` sets the override (an
    /// empty or whitespace-only key clears it), `None` leaves it unchanged.
    pub async fn update(&self, custom_api_key: Option<String>) -> anyhow::Result<SystemSettings> {
        let updated = {
            let mut settings = self.settings.write().await;
            if let Some(key) = custom_api_key {
                let key = key.trim().to_string();
                settings.custom_api_key = if key.is_empty() { None } else { Some(key) };
            }
            settings.clone()
        };
        let json = serde_json::to_string_pretty(&updated)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("funil-store-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[tokio::test]
    async fn leads_survive_a_reload() {
        let path = temp_path("leads.json");
        let store = LeadStore::load(&path).await;
        let mut lead = LeadRecord::new("sess-1", Utc::now());
        lead.name = "Ana".to_string();
        store.save_lead(lead).await.unwrap();

        let reloaded = LeadStore::load(&path).await;
        let lead = reloaded.get("sess-1").await.expect("lead persisted");
        assert_eq!(lead.name, "Ana");
        assert_eq!(reloaded.list().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_and_reports() {
        let path = temp_path("leads.json");
        let store = LeadStore::load(&path).await;
        store
            .save_lead(LeadRecord::new("sess-1", Utc::now()))
            .await
            .unwrap();
        assert!(store.delete("sess-1").await.unwrap());
        assert!(!store.delete("sess-1").await.unwrap());
        assert!(store.get("sess-1").await.is_none());
    }

    #[tokio::test]
    async fn search_filters_by_substring() {
        let path = temp_path("leads.json");
        let store = LeadStore::load(&path).await;
        let now = Utc::now();
        let mut a = LeadRecord::new("sess-a", now);
        a.name = "Ana".to_string();
        let mut b = LeadRecord::new("sess-b", now);
        b.name = "Bruno".to_string();
        b.email = Some("bruno@x.com".to_string());
        store.save_lead(a).await.unwrap();
        store.save_lead(b).await.unwrap();

        let hits = store.search("bruno").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "sess-b");
        assert_eq!(store.search("").await.len(), 2);
    }

    #[tokio::test]
    async fn settings_set_and_clear() {
        let path = temp_path("settings.json");
        let store = SettingsStore::load(&path).await;
        assert!(store.get().await.custom_api_key.is_none());

        let updated = store.update(Some("abc123".to_string())).await.unwrap();
        assert_eq!(updated.custom_api_key.as_deref(), Some("abc123"));

        // None leaves the value alone; an empty string clears it.
        let kept = store.update(None).await.unwrap();
        assert_eq!(kept.custom_api_key.as_deref(), Some("abc123"));
        let cleared = store.update(Some("  ".to_string())).await.unwrap();
        assert!(cleared.custom_api_key.is_none());

        let reloaded = SettingsStore::load(&path).await;
        assert!(reloaded.get().await.custom_api_key.is_none());
    }
}
