//! Consultant turn driver: one user message in, one funnel-updated reply out.
//!
//! Each conversation runs at most one model call at a time. Quota failures
//! retry with linear backoff up to a ceiling; any other failure (or an
//! exhausted ceiling) posts an error notice into the conversation and puts it
//! in a cooldown window that rejects new submissions until it elapses.

use crate::envelope::{parse_envelope, FunnelAnalysis};
use crate::lead::LeadRecord;
use crate::llm::{is_quota_error, ChatMessage, LlmBackend, LlmError};
use crate::session::{ConversationMessage, SessionStore};
use crate::store::LeadStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// First assistant message of every conversation; also the moment the lead
/// record is created.
pub const GREETING: &str = "Olá! Bem-vindo à Funil Digital. Sou seu consultor especialista em crescimento digital. Como posso ajudar seu negócio a escalar hoje?";

/// How many times to call the model per turn and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Model calls per turn before giving up (quota failures only).
    pub max_attempts: u32,
    /// Base delay; the wait after attempt n (0-indexed) is (n + 1) * base.
    pub base_delay: Duration,
    /// Window during which new submissions are rejected after a terminal failure.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * (attempt + 1)
    }
}

/// Sleeps between retry attempts. Injected so tests can observe the backoff
/// schedule instead of waiting it out.
#[async_trait]
pub trait RetryDelay: Send + Sync {
    async fn wait(&self, duration: Duration);
}

/// Production delay: tokio sleep.
pub struct TokioDelay;

#[async_trait]
impl RetryDelay for TokioDelay {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Per-conversation request state.
#[derive(Debug, Clone, Copy)]
enum TurnState {
    Sending,
    Cooldown { until: Instant },
}

/// Everything one consultant turn can fail with. `Busy`, `Cooldown`,
/// `Empty`, and `MissingApiKey` reject the submission up front; `Failed`
/// means the model call gave up and the conversation is now cooling down.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("message is empty")]
    Empty,
    #[error("a response is already being generated for this conversation")]
    Busy,
    #[error("cooling down: retry in {remaining} second(s)")]
    Cooldown { remaining: u64 },
    #[error("no Gemini API key configured (admin override, GEMINI_API_KEY, or config)")]
    MissingApiKey,
    #[error("conversation not found: {0}")]
    UnknownSession(String),
    #[error("nothing to retry for this conversation")]
    NothingToRetry,
    #[error("model call failed: {0}")]
    Failed(#[from] LlmError),
}

/// Outcome of a successful turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub analysis: Option<FunnelAnalysis>,
    pub lead: LeadRecord,
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Drives consultant turns for all conversations: gating, retries, cooldowns,
/// and lead persistence. The API key is resolved by the caller per turn so
/// the admin override can take effect immediately.
pub struct Consultant {
    backend: Arc<dyn LlmBackend>,
    delay: Arc<dyn RetryDelay>,
    policy: RetryPolicy,
    history_window: usize,
    system_instruction: String,
    sessions: Arc<SessionStore>,
    leads: Arc<LeadStore>,
    states: RwLock<HashMap<String, TurnState>>,
    /// Last user text per conversation after a terminal failure, kept for the
    /// manual retry affordance.
    pending_retry: RwLock<HashMap<String, String>>,
}

impl Consultant {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        delay: Arc<dyn RetryDelay>,
        policy: RetryPolicy,
        history_window: usize,
        system_instruction: String,
        sessions: Arc<SessionStore>,
        leads: Arc<LeadStore>,
    ) -> Self {
        Self {
            backend,
            delay,
            policy,
            history_window,
            system_instruction,
            sessions,
            leads,
            states: RwLock::new(HashMap::new()),
            pending_retry: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start a conversation: new session, the fixed greeting, and the lead
    /// record the analyses will be merged into.
    pub async fn open_conversation(&self) -> anyhow::Result<(String, String)> {
        let session_id = self.sessions.create().await;
        self.sessions
            .append_message(&session_id, ConversationMessage::assistant(GREETING))
            .await
            .map_err(anyhow::Error::msg)?;
        let mut lead = LeadRecord::new(&session_id, Utc::now());
        lead.messages = self
            .sessions
            .get(&session_id)
            .await
            .map(|s| s.messages)
            .unwrap_or_default();
        self.leads.save_lead(lead).await?;
        Ok((session_id, GREETING.to_string()))
    }

    /// Seconds left in this conversation's cooldown; None when not cooling down.
    pub async fn cooldown_remaining(&self, session_id: &str) -> Option<u64> {
        let states = self.states.read().await;
        match states.get(session_id) {
            Some(TurnState::Cooldown { until }) => {
                let now = Instant::now();
                if *until > now {
                    Some(ceil_secs(until.duration_since(now)))
                } else {
                    Some(0)
                }
            }
            _ => None,
        }
    }

    /// Run one user turn end to end. Rejects while a turn is pending or the
    /// conversation is cooling down.
    pub async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        api_key: Option<&str>,
    ) -> Result<TurnOutcome, TurnError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnError::Empty);
        }
        self.acquire(session_id).await?;
        let Some(api_key) = api_key else {
            self.release(session_id).await;
            return Err(TurnError::MissingApiKey);
        };
        let result = self.drive(session_id, text, api_key, true).await;
        self.finish(session_id, text, &result).await;
        result
    }

    /// Re-run the last failed user message at attempt zero. Only valid once
    /// the cooldown has elapsed; the message is not appended again.
    pub async fn retry_last(
        &self,
        session_id: &str,
        api_key: Option<&str>,
    ) -> Result<TurnOutcome, TurnError> {
        let text = self
            .pending_retry
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(TurnError::NothingToRetry)?;
        self.acquire(session_id).await?;
        let Some(api_key) = api_key else {
            self.release(session_id).await;
            return Err(TurnError::MissingApiKey);
        };
        let result = self.drive(session_id, &text, api_key, false).await;
        self.finish(session_id, &text, &result).await;
        result
    }

    /// Gate check; moves the conversation to Sending or rejects.
    async fn acquire(&self, session_id: &str) -> Result<(), TurnError> {
        let mut states = self.states.write().await;
        match states.get(session_id) {
            Some(TurnState::Sending) => return Err(TurnError::Busy),
            Some(TurnState::Cooldown { until }) => {
                let now = Instant::now();
                if *until > now {
                    return Err(TurnError::Cooldown {
                        remaining: ceil_secs(until.duration_since(now)),
                    });
                }
            }
            None => {}
        }
        states.insert(session_id.to_string(), TurnState::Sending);
        Ok(())
    }

    async fn release(&self, session_id: &str) {
        self.states.write().await.remove(session_id);
    }

    async fn finish(
        &self,
        session_id: &str,
        text: &str,
        result: &Result<TurnOutcome, TurnError>,
    ) {
        match result {
            Ok(_) => {
                self.release(session_id).await;
                self.pending_retry.write().await.remove(session_id);
            }
            Err(TurnError::Failed(_)) => {
                self.states.write().await.insert(
                    session_id.to_string(),
                    TurnState::Cooldown {
                        until: Instant::now() + self.policy.cooldown,
                    },
                );
                self.pending_retry
                    .write()
                    .await
                    .insert(session_id.to_string(), text.to_string());
            }
            Err(_) => self.release(session_id).await,
        }
    }

    /// One gated turn: append the user message, call the model with bounded
    /// retries, apply the envelope, persist the lead.
    async fn drive(
        &self,
        session_id: &str,
        text: &str,
        api_key: &str,
        append_user: bool,
    ) -> Result<TurnOutcome, TurnError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| TurnError::UnknownSession(session_id.to_string()))?;
        if append_user {
            self.sessions
                .append_message(session_id, ConversationMessage::user(text))
                .await
                .map_err(TurnError::UnknownSession)?;
        }

        // Bounded trailing window of prior turns; the new text goes separately.
        let skip = session.messages.len().saturating_sub(self.history_window);
        let history: Vec<ChatMessage> = session.messages[skip..]
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.text.clone(),
            })
            .collect();

        let mut attempt = 0u32;
        loop {
            match self
                .backend
                .send_turn(api_key, &self.system_instruction, &history, text)
                .await
            {
                Ok(raw) => {
                    let envelope = parse_envelope(&raw);
                    self.sessions
                        .append_message(
                            session_id,
                            ConversationMessage::assistant(envelope.display_text.clone()),
                        )
                        .await
                        .map_err(TurnError::UnknownSession)?;
                    let lead = self
                        .apply_to_lead(session_id, envelope.analysis.as_ref())
                        .await;
                    return Ok(TurnOutcome {
                        reply: envelope.display_text,
                        analysis: envelope.analysis,
                        lead,
                    });
                }
                Err(err) if is_quota_error(&err) && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    log::warn!(
                        "model call hit quota limit (attempt {}), retrying in {:?}",
                        attempt + 1,
                        delay
                    );
                    self.delay.wait(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    log::warn!("model call failed after {} attempt(s): {}", attempt + 1, err);
                    let notice = format!(
                        "Erro de conexão: {}. Aguarde {} segundos e tente novamente.",
                        err,
                        self.policy.cooldown.as_secs()
                    );
                    let _ = self
                        .sessions
                        .append_message(session_id, ConversationMessage::assistant_error(notice))
                        .await;
                    self.touch_lead(session_id).await;
                    return Err(TurnError::Failed(err));
                }
            }
        }
    }

    /// Merge the analysis (or just touch) and write the lead through. Store
    /// failures are logged, not fatal: the conversation outranks the CRM copy.
    async fn apply_to_lead(
        &self,
        session_id: &str,
        analysis: Option<&FunnelAnalysis>,
    ) -> LeadRecord {
        let now = Utc::now();
        let mut lead = self
            .leads
            .get(session_id)
            .await
            .unwrap_or_else(|| LeadRecord::new(session_id, now));
        match analysis {
            Some(a) => lead.apply_analysis(a, now),
            None => lead.touch(now),
        }
        lead.messages = self
            .sessions
            .get(session_id)
            .await
            .map(|s| s.messages)
            .unwrap_or_default();
        if let Err(e) = self.leads.save_lead(lead.clone()).await {
            log::error!("saving lead {} failed: {}", session_id, e);
        }
        lead
    }

    /// Terminal failure: only the activity timestamp moves.
    async fn touch_lead(&self, session_id: &str) {
        if let Some(mut lead) = self.leads.get(session_id).await {
            lead.touch(Utc::now());
            if let Err(e) = self.leads.save_lead(lead).await {
                log::error!("saving lead {} failed: {}", session_id, e);
            }
        }
    }
}
