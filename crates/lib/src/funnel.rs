//! Funnel domain: conversation stage and lead temperature.
//!
//! Wire values are the Portuguese strings the model emits inside the analysis
//! block; the enums deserialize from exactly those strings.

use serde::{Deserialize, Serialize};

/// Phase of the sales conversation, from first contact to close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunnelStage {
    #[default]
    #[serde(rename = "Abertura")]
    Opening,
    #[serde(rename = "Diagnóstico")]
    Diagnosis,
    #[serde(rename = "Autoridade")]
    Authority,
    #[serde(rename = "Solução")]
    Solution,
    #[serde(rename = "Qualificação")]
    Qualification,
    #[serde(rename = "Conversão")]
    Conversion,
}

impl FunnelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStage::Opening => "Abertura",
            FunnelStage::Diagnosis => "Diagnóstico",
            FunnelStage::Authority => "Autoridade",
            FunnelStage::Solution => "Solução",
            FunnelStage::Qualification => "Qualificação",
            FunnelStage::Conversion => "Conversão",
        }
    }
}

impl std::fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temperature classification of a prospect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadStatus {
    #[default]
    #[serde(rename = "Frio")]
    Cold,
    #[serde(rename = "Morno")]
    Warm,
    #[serde(rename = "Qualificado")]
    Qualified,
    #[serde(rename = "Quente")]
    Hot,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Cold => "Frio",
            LeadStatus::Warm => "Morno",
            LeadStatus::Qualified => "Qualificado",
            LeadStatus::Hot => "Quente",
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_deserializes_from_wire_strings() {
        let stage: FunnelStage = serde_json::from_str("\"Diagnóstico\"").unwrap();
        assert_eq!(stage, FunnelStage::Diagnosis);
        let stage: FunnelStage = serde_json::from_str("\"Conversão\"").unwrap();
        assert_eq!(stage, FunnelStage::Conversion);
    }

    #[test]
    fn unknown_stage_is_a_decode_error() {
        assert!(serde_json::from_str::<FunnelStage>("\"Fechamento\"").is_err());
    }

    #[test]
    fn defaults_are_opening_and_cold() {
        assert_eq!(FunnelStage::default(), FunnelStage::Opening);
        assert_eq!(LeadStatus::default(), LeadStatus::Cold);
    }
}
