//! Existence polling for artifacts the backend produces out of process.
//!
//! The backend offers no completion signal; the only evidence that a job is
//! done is that its output file answers a HEAD request. Every probe carries a
//! fresh `t` query parameter so a file that was missing a moment ago is seen
//! as soon as it exists.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use engine::ArtifactKind;

use crate::backend::http::cache_bust_token;
use crate::backend::GenerationBackend;

/// Bounded exponential backoff for post-action probing.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Wait after the action returns before the first probe.
    pub settle_delay: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Found; the locator carries the cache-busting token it was found with.
    Present(String),
    /// Still missing after every attempt.
    TimedOut { attempts: u32 },
}

fn with_token(url: &str, token: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, sep, token)
}

#[derive(Clone)]
pub struct ExistencePoller {
    backend: Arc<dyn GenerationBackend>,
    policy: PollPolicy,
}

impl ExistencePoller {
    pub fn new(backend: Arc<dyn GenerationBackend>, policy: PollPolicy) -> Self {
        ExistencePoller { backend, policy }
    }

    /// One probe, no waiting. Returns the cache-busted locator when present.
    pub async fn probe_now(&self, project: &str, kind: &ArtifactKind) -> Option<String> {
        let url = with_token(&self.backend.artifact_url(project, kind), &cache_bust_token());
        if self.backend.probe(&url).await {
            Some(url)
        } else {
            None
        }
    }

    /// Probe until the artifact exists or the attempt budget is spent.
    ///
    /// `settle` adds the settle delay before the first attempt.
    pub async fn await_artifact(
        &self,
        project: &str,
        kind: &ArtifactKind,
        settle: bool,
    ) -> ProbeOutcome {
        if settle && !self.policy.settle_delay.is_zero() {
            sleep(self.policy.settle_delay).await;
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;

        for attempt in 1..=max_attempts {
            if let Some(url) = self.probe_now(project, kind).await {
                info!("[Poller] {} of {} present after {} probe(s)", kind, project, attempt);
                return ProbeOutcome::Present(url);
            }
            if attempt == max_attempts {
                break;
            }
            debug!(
                "[Poller] {} of {} not there yet (attempt {}/{}), retrying in {:?}",
                kind, project, attempt, max_attempts, backoff
            );
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }

        warn!("[Poller] {} of {} still missing after {} probes", kind, project, max_attempts);
        ProbeOutcome::TimedOut {
            attempts: max_attempts,
        }
    }
}
