//! Response envelope: free text for the user plus one delimited analysis block.
//!
//! The model contract is "answer, then `<analysis>{...}</analysis>`". The
//! block is a side channel; a malformed block never blocks the visible reply,
//! it only loses the structured metadata for that turn.

use crate::funnel::{FunnelStage, LeadStatus};
use serde::{Deserialize, Serialize};

pub const ANALYSIS_OPEN: &str = "<analysis>";
pub const ANALYSIS_CLOSE: &str = "</analysis>";

/// Structured metadata the model attaches to one reply. Every field is
/// optional; what a missing field means is decided at merge time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelAnalysis {
    #[serde(default)]
    pub stage: Option<FunnelStage>,
    #[serde(default)]
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub score: Option<u8>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub extracted_data: ExtractedData,
}

/// Contact fields the model has extracted so far. Absent means "not seen yet".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub main_need: Option<String>,
}

/// One parsed model reply: the text to show and the optional analysis.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub display_text: String,
    pub analysis: Option<FunnelAnalysis>,
}

/// Split a raw model reply into display text and analysis.
///
/// The first `<analysis>...</analysis>` block is removed from the text and its
/// content decoded as JSON. No block, an unterminated block, or undecodable
/// JSON all yield `analysis: None`; the text is returned untouched (no block)
/// or with the block stripped (bad payload). The reply itself is never lost.
pub fn parse_envelope(raw: &str) -> Envelope {
    let Some(open) = raw.find(ANALYSIS_OPEN) else {
        return Envelope {
            display_text: raw.to_string(),
            analysis: None,
        };
    };
    let inner_start = open + ANALYSIS_OPEN.len();
    let Some(close) = raw[inner_start..].find(ANALYSIS_CLOSE) else {
        return Envelope {
            display_text: raw.to_string(),
            analysis: None,
        };
    };
    let inner = &raw[inner_start..inner_start + close];
    let block_end = inner_start + close + ANALYSIS_CLOSE.len();

    let mut display = String::with_capacity(raw.len());
    display.push_str(&raw[..open]);
    display.push_str(&raw[block_end..]);
    let display_text = display.trim().to_string();

    let analysis = match serde_json::from_str::<FunnelAnalysis>(inner) {
        Ok(a) => Some(a),
        Err(e) => {
            log::warn!("analysis block ignored (bad payload): {}", e);
            None
        }
    };
    Envelope {
        display_text,
        analysis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_block_is_split_out() {
        let raw = "Ótimo, vamos começar!<analysis>{\"stage\":\"Diagnóstico\",\"status\":\"Morno\",\"score\":30,\"next_step\":\"perguntar sobre orçamento\",\"extracted_data\":{}}</analysis>";
        let env = parse_envelope(raw);
        assert_eq!(env.display_text, "Ótimo, vamos começar!");
        let analysis = env.analysis.expect("analysis present");
        assert_eq!(analysis.stage, Some(FunnelStage::Diagnosis));
        assert_eq!(analysis.status, Some(LeadStatus::Warm));
        assert_eq!(analysis.score, Some(30));
        assert_eq!(analysis.next_step.as_deref(), Some("perguntar sobre orçamento"));
        assert_eq!(analysis.extracted_data, ExtractedData::default());
    }

    #[test]
    fn no_block_returns_text_verbatim() {
        let env = parse_envelope("Só uma resposta normal.");
        assert_eq!(env.display_text, "Só uma resposta normal.");
        assert!(env.analysis.is_none());
    }

    #[test]
    fn malformed_json_keeps_the_text() {
        let raw = "Resposta visível. <analysis>{nope}</analysis>";
        let env = parse_envelope(raw);
        assert_eq!(env.display_text, "Resposta visível.");
        assert!(env.analysis.is_none());
    }

    #[test]
    fn unterminated_block_is_left_in_place() {
        let raw = "Resposta. <analysis>{\"score\":10}";
        let env = parse_envelope(raw);
        assert_eq!(env.display_text, raw);
        assert!(env.analysis.is_none());
    }

    #[test]
    fn unknown_stage_string_drops_the_whole_analysis() {
        let raw = "Oi!<analysis>{\"stage\":\"Inexistente\",\"score\":50}</analysis>";
        let env = parse_envelope(raw);
        assert_eq!(env.display_text, "Oi!");
        assert!(env.analysis.is_none());
    }

    #[test]
    fn extracted_fields_come_through() {
        let raw = "Perfeito.<analysis>{\"extracted_data\":{\"name\":\"Ana\",\"email\":\"ana@x.com\"}}</analysis>";
        let env = parse_envelope(raw);
        let analysis = env.analysis.expect("analysis present");
        assert_eq!(analysis.extracted_data.name.as_deref(), Some("Ana"));
        assert_eq!(analysis.extracted_data.email.as_deref(), Some("ana@x.com"));
        assert!(analysis.extracted_data.phone.is_none());
        assert!(analysis.stage.is_none());
    }

    #[test]
    fn only_the_first_block_is_removed() {
        let raw = "A<analysis>{}</analysis>B<analysis>{}</analysis>";
        let env = parse_envelope(raw);
        assert_eq!(env.display_text, "AB<analysis>{}</analysis>");
        assert!(env.analysis.is_some());
    }
}
