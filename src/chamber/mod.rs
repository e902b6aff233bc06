//! Deliberation chamber
//!
//! Sends one task description to every participant at once, waits for all
//! of them (each under its own timeout), then arbitrates the successful
//! proposals into a single consolidated patch.

pub mod arbiter;
pub mod openrouter;
pub mod prompts;
pub mod provider;

pub use arbiter::{Arbitration, Candidate, ClusterWinner};
pub use openrouter::OpenRouterProvider;
pub use provider::{Chunk, ChunkSource, ModelProvider, ProviderReply, StreamingProvider, Usage};

use crate::config::{Config, ParticipantConfig};
use crate::diff::{parse_patch, render_patch, UnifiedDiff};
use crate::error::{HuntError, HuntResult, ProviderError, ProviderErrorKind};
use crate::report::{ProposalSkeleton, Report};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub model_id: String,
    pub priority: u32,
    pub timeout: Duration,
}

impl From<&ParticipantConfig> for Participant {
    fn from(config: &ParticipantConfig) -> Self {
        Self {
            id: config.id.clone(),
            model_id: config.model_id.clone(),
            priority: config.priority,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// A participant's patch plus the evidence it cites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub participant_id: String,
    pub model_id: String,
    pub priority: u32,
    pub diff: String,
    pub justification: String,
    /// Distinct evidence ids from the report named in the justification
    pub cited: Vec<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ParticipantOutcome {
    Succeeded(Proposal),
    TimedOut { participant_id: String },
    Failed {
        participant_id: String,
        error: ProviderError,
    },
}

impl ParticipantOutcome {
    pub fn participant_id(&self) -> &str {
        match self {
            ParticipantOutcome::Succeeded(p) => &p.participant_id,
            ParticipantOutcome::TimedOut { participant_id } => participant_id,
            ParticipantOutcome::Failed { participant_id, .. } => participant_id,
        }
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        match self {
            ParticipantOutcome::Succeeded(p) => Some(p),
            _ => None,
        }
    }
}

/// Result of one deliberation round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliberation {
    /// The consolidated patch as unified diff text
    pub diff: String,
    #[serde(skip)]
    pub patch: Vec<UnifiedDiff>,
    pub winners: Vec<ClusterWinner>,
    /// Every participant's outcome, in configured order
    pub outcomes: Vec<ParticipantOutcome>,
}

impl Deliberation {
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.proposal().is_some()).count()
    }
}

pub struct Chamber {
    participants: Vec<Participant>,
    provider: Arc<dyn ModelProvider>,
}

impl std::fmt::Debug for Chamber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chamber")
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

impl Chamber {
    pub fn new(participants: Vec<Participant>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            participants,
            provider,
        }
    }

    pub fn from_config(config: &Config, provider: Arc<dyn ModelProvider>) -> Self {
        Self::new(
            config.participants.iter().map(Participant::from).collect(),
            provider,
        )
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Fan the agenda out to every participant and arbitrate the replies
    pub async fn deliberate(
        &self,
        report: &Report,
        skeletons: &[ProposalSkeleton],
        cancel: CancellationToken,
    ) -> HuntResult<Deliberation> {
        if skeletons.is_empty() {
            return Err(HuntError::EmptyAgenda);
        }
        let prompt = prompts::task_prompt(report, skeletons);
        let evidence_ids = report.evidence_ids();

        let dispatches = self
            .participants
            .iter()
            .map(|p| self.consult(p, &prompt, &evidence_ids));

        let outcomes = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(unit = %report.unit, "deliberation cancelled");
                return Err(HuntError::Cancelled);
            }
            outcomes = join_all(dispatches) => outcomes,
        };

        let successes: Vec<&Proposal> = outcomes.iter().filter_map(|o| o.proposal()).collect();
        tracing::info!(
            unit = %report.unit,
            participants = outcomes.len(),
            successes = successes.len(),
            "deliberation settled"
        );
        if successes.is_empty() {
            return Err(HuntError::NoQuorum { outcomes });
        }

        let candidates: Vec<Candidate<'_>> = successes
            .iter()
            .filter_map(|p| {
                Some(Candidate {
                    participant_id: &p.participant_id,
                    priority: p.priority,
                    cited: p.cited.len(),
                    diffs: parse_patch(&p.diff).ok()?,
                })
            })
            .collect();
        let Arbitration { diffs, winners } = arbiter::arbitrate(&candidates);

        Ok(Deliberation {
            diff: render_patch(&diffs),
            patch: diffs,
            winners,
            outcomes,
        })
    }

    async fn consult(
        &self,
        participant: &Participant,
        prompt: &str,
        evidence_ids: &[String],
    ) -> ParticipantOutcome {
        let participant_id = participant.id.clone();
        let reply = tokio::time::timeout(
            participant.timeout,
            self.provider
                .send(prompt, &participant.model_id, participant.timeout),
        )
        .await;

        let reply = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) if error.kind == ProviderErrorKind::Timeout => {
                tracing::warn!(participant = %participant_id, "participant timed out");
                return ParticipantOutcome::TimedOut { participant_id };
            }
            Ok(Err(error)) => {
                tracing::warn!(participant = %participant_id, error = %error, "participant failed");
                return ParticipantOutcome::Failed {
                    participant_id,
                    error,
                };
            }
            Err(_) => {
                tracing::warn!(
                    participant = %participant_id,
                    timeout_ms = participant.timeout.as_millis() as u64,
                    "participant timed out"
                );
                return ParticipantOutcome::TimedOut { participant_id };
            }
        };

        let Some(parsed) = prompts::parse_reply(&reply.text) else {
            return malformed(participant_id, "reply contained no unified diff");
        };
        if let Err(e) = parse_patch(&parsed.diff) {
            return malformed(participant_id, format!("diff does not parse: {}", e));
        }
        let cited = prompts::cited_evidence(&parsed.justification, evidence_ids);
        tracing::debug!(
            participant = %participant_id,
            cited = cited.len(),
            tokens_out = reply.usage.tokens_out,
            "proposal received"
        );
        ParticipantOutcome::Succeeded(Proposal {
            participant_id,
            model_id: participant.model_id.clone(),
            priority: participant.priority,
            diff: parsed.diff,
            justification: parsed.justification,
            cited,
            usage: reply.usage,
        })
    }
}

fn malformed(participant_id: String, message: impl Into<String>) -> ParticipantOutcome {
    let error = ProviderError::new(ProviderErrorKind::MalformedReply, message);
    tracing::warn!(participant = %participant_id, error = %error, "participant failed");
    ParticipantOutcome::Failed {
        participant_id,
        error,
    }
}
