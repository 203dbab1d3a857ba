//! Lead records: one per conversation, updated by merging funnel analyses.
//!
//! A record is created when the bot greets a new visitor and then follows the
//! conversation. Only a successfully parsed analysis moves stage, status,
//! score, or contact fields; a failed turn touches the activity timestamp only.

use crate::envelope::FunnelAnalysis;
use crate::funnel::{FunnelStage, LeadStatus};
use crate::session::ConversationMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_SCORE: u8 = 100;

/// Placeholder name until the model extracts a real one.
pub const DEFAULT_LEAD_NAME: &str = "Novo Lead";

/// One captured lead, keyed by its conversation session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need: Option<String>,
    pub status: LeadStatus,
    pub stage: FunnelStage,
    pub score: u8,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

impl LeadRecord {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: DEFAULT_LEAD_NAME.to_string(),
            email: None,
            phone: None,
            need: None,
            status: LeadStatus::default(),
            stage: FunnelStage::default(),
            score: 0,
            last_active_at: now,
            messages: Vec::new(),
        }
    }

    /// Merge one analysis: a present field overrides, an absent field keeps
    /// the prior value. The score is clamped to [`MAX_SCORE`].
    pub fn apply_analysis(&mut self, analysis: &FunnelAnalysis, now: DateTime<Utc>) {
        if let Some(stage) = analysis.stage {
            self.stage = stage;
        }
        if let Some(status) = analysis.status {
            self.status = status;
        }
        if let Some(score) = analysis.score {
            self.score = score.min(MAX_SCORE);
        }
        let extracted = &analysis.extracted_data;
        if let Some(ref name) = extracted.name {
            self.name = name.clone();
        }
        if let Some(ref email) = extracted.email {
            self.email = Some(email.clone());
        }
        if let Some(ref phone) = extracted.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(ref need) = extracted.main_need {
            self.need = Some(need.clone());
        }
        self.last_active_at = now;
    }

    /// A failed turn leaves everything but the activity timestamp untouched.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
    }

    /// Case-insensitive substring match over name, email, and phone.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&q)
            || self
                .email
                .as_deref()
                .is_some_and(|e| e.to_lowercase().contains(&q))
            || self
                .phone
                .as_deref()
                .is_some_and(|p| p.to_lowercase().contains(&q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ExtractedData;

    fn analysis() -> FunnelAnalysis {
        FunnelAnalysis {
            stage: Some(FunnelStage::Diagnosis),
            status: Some(LeadStatus::Warm),
            score: Some(30),
            next_step: Some("perguntar sobre orçamento".to_string()),
            extracted_data: ExtractedData {
                name: Some("Ana".to_string()),
                email: None,
                phone: None,
                main_need: Some("mais leads".to_string()),
            },
        }
    }

    #[test]
    fn present_fields_override_absent_fields_preserve() {
        let now = Utc::now();
        let mut lead = LeadRecord::new("sess-1", now);
        lead.email = Some("ana@x.com".to_string());

        lead.apply_analysis(&analysis(), now);
        assert_eq!(lead.stage, FunnelStage::Diagnosis);
        assert_eq!(lead.status, LeadStatus::Warm);
        assert_eq!(lead.score, 30);
        assert_eq!(lead.name, "Ana");
        assert_eq!(lead.need.as_deref(), Some("mais leads"));
        // No email in this analysis; the stored one survives.
        assert_eq!(lead.email.as_deref(), Some("ana@x.com"));
    }

    #[test]
    fn merge_is_idempotent() {
        let now = Utc::now();
        let mut once = LeadRecord::new("sess-1", now);
        once.apply_analysis(&analysis(), now);
        let mut twice = once.clone();
        twice.apply_analysis(&analysis(), now);
        assert_eq!(serde_json::to_value(&once).unwrap(), serde_json::to_value(&twice).unwrap());
    }

    #[test]
    fn zero_score_is_present_and_overrides() {
        let now = Utc::now();
        let mut lead = LeadRecord::new("sess-1", now);
        lead.score = 40;
        let a = FunnelAnalysis {
            score: Some(0),
            ..FunnelAnalysis::default()
        };
        lead.apply_analysis(&a, now);
        assert_eq!(lead.score, 0);
    }

    #[test]
    fn score_is_clamped() {
        let now = Utc::now();
        let mut lead = LeadRecord::new("sess-1", now);
        let a = FunnelAnalysis {
            score: Some(250),
            ..FunnelAnalysis::default()
        };
        lead.apply_analysis(&a, now);
        assert_eq!(lead.score, MAX_SCORE);
    }

    #[test]
    fn search_matches_name_email_and_phone() {
        let now = Utc::now();
        let mut lead = LeadRecord::new("sess-1", now);
        lead.name = "Ana Souza".to_string();
        lead.email = Some("ana@empresa.com.br".to_string());
        lead.phone = Some("+55 11 99999-0000".to_string());

        assert!(lead.matches("souza"));
        assert!(lead.matches("EMPRESA"));
        assert!(lead.matches("99999"));
        assert!(lead.matches(""));
        assert!(!lead.matches("carlos"));
    }
}
