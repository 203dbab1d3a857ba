//! Consultant persona: the system instruction and its optional workspace extension.
//!
//! The base instruction carries the selling persona plus the envelope contract
//! the response parser depends on. A `PERSONA.md` in the workspace, when
//! present, is appended so deployments can adjust tone and offering without a
//! rebuild.

use std::fs;
use std::path::Path;

/// Base system instruction sent with every model call.
pub const SYSTEM_INSTRUCTION: &str = "\
Você é o consultor comercial da Funil Digital. Venda: Tráfego, Automação, SaaS e Landing Pages.
Seja direto e consultivo. Conduza a conversa pelo funil: Abertura, Diagnóstico, Autoridade, Solução, Qualificação, Conversão.
Obrigatório: toda resposta termina com exatamente um bloco
<analysis>{\"stage\":\"...\",\"status\":\"...\",\"score\":0,\"next_step\":\"...\",\"extracted_data\":{\"name\":\"\",\"email\":\"\",\"phone\":\"\",\"main_need\":\"\"}}</analysis>
stage em {Abertura, Diagnóstico, Autoridade, Solução, Qualificação, Conversão}; status em {Frio, Morno, Qualificado, Quente}; score de 0 a 100. Inclua em extracted_data apenas os campos que o cliente informou.";

/// Load the persona extension (PERSONA.md) from the workspace.
///
/// Returns the file contents when PERSONA.md exists and is non-empty; otherwise None.
pub fn load_persona_ctx(workspace_dir: Option<&Path>) -> Option<String> {
    let dir = workspace_dir?;
    let path = dir.join("PERSONA.md");
    match fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

/// Full system instruction: base persona plus the workspace extension.
pub fn build_system_instruction(persona_ctx: Option<&str>) -> String {
    match persona_ctx {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("{}\n\n{}", SYSTEM_INSTRUCTION, ctx.trim())
        }
        _ => SYSTEM_INSTRUCTION.to_string(),
    }
}
