//! Citation verification.
//!
//! Every citation is resolved independently against the authoritative
//! source on a shared pool of lookup permits. Citations with the same
//! fingerprint share one lookup. Whatever is still unresolved when the
//! stage deadline fires is removed; nothing leaves this stage unverified.

use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::guard::guarded;
use super::matching::{match_text, TextMatch};
use crate::error::{ErrorCode, Result, ReviewError};
use crate::traits::knowledge::{AuthoritativeDocument, AuthoritativeSource};
use crate::types::citation::{Citation, VerificationStatus};
use crate::types::config::ReviewConfig;

type Judgement = (VerificationStatus, Option<String>);

/// Verifies citations against an [`AuthoritativeSource`].
#[derive(Clone)]
pub struct CitationVerifier {
    authority: Arc<dyn AuthoritativeSource>,
    permits: Arc<Semaphore>,
    config: Arc<ReviewConfig>,
}

impl CitationVerifier {
    /// `permits` is shared by every job using this verifier.
    pub fn new(
        authority: Arc<dyn AuthoritativeSource>,
        permits: Arc<Semaphore>,
        config: Arc<ReviewConfig>,
    ) -> Self {
        Self {
            authority,
            permits,
            config,
        }
    }

    /// Resolve every unverified citation by `deadline`.
    ///
    /// Returns `Cancelled` if the job is cancelled mid-stage; otherwise every
    /// returned citation has a terminal status.
    pub async fn verify(
        &self,
        mut citations: Vec<Citation>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Citation>> {
        let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (i, citation) in citations.iter().enumerate() {
            if !citation.status.is_terminal() {
                groups.entry(citation.fingerprint()).or_default().push(i);
            }
        }
        debug!(
            citations = citations.len(),
            lookups = groups.len(),
            "verifying citations"
        );

        let mut set = JoinSet::new();
        for (group, indices) in groups.values().enumerate() {
            let locator = citations[indices[0]].locator.clone();
            let authority = self.authority.clone();
            let permits = self.permits.clone();
            let cancel = cancel.clone();
            let timeout = self.config.lookup_timeout();

            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (group, Err(ReviewError::Cancelled)),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(e) => return (group, Err(ReviewError::Internal(e.to_string()))),
                    },
                };
                let lookup = guarded(&cancel, timeout, "lookup", authority.lookup(&locator)).await;
                (group, lookup)
            });
        }

        let today = Utc::now().date_naive();
        let mut outcomes: Vec<Option<Judgement>> = vec![None; groups.len()];
        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((_, Err(ReviewError::Cancelled))))) => {}
                Ok(Some(Ok((group, lookup)))) => {
                    let representative = &citations[groups[group][0]];
                    outcomes[group] = Some(judge(representative, lookup, &self.config, today));
                }
                Ok(Some(Err(e))) => warn!(error = %e, "citation lookup task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = set.len(), "verification deadline reached");
                    set.abort_all();
                    deadline_hit = true;
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ReviewError::Cancelled);
        }

        for (group, indices) in groups.values().enumerate() {
            let (status, note) = outcomes[group].clone().unwrap_or_else(|| {
                let note = if deadline_hit {
                    "verification deadline exceeded"
                } else {
                    "verification did not complete"
                };
                (VerificationStatus::Removed, Some(note.to_string()))
            });
            if status == VerificationStatus::Removed {
                warn!(
                    locator = %citations[indices[0]].locator,
                    note = note.as_deref().unwrap_or(""),
                    "citation removed"
                );
            }
            for &i in indices {
                citations[i].resolve(status, note.clone());
            }
        }

        let removed = citations
            .iter()
            .filter(|c| c.status == VerificationStatus::Removed)
            .count();
        info!(total = citations.len(), removed, "citations verified");
        Ok(citations)
    }
}

/// Decide a citation's status from its lookup result.
///
/// Checks run in order: reachability, existence, temporal validity,
/// jurisdiction, digitised origin, then text support.
pub fn judge(
    citation: &Citation,
    lookup: Result<Option<AuthoritativeDocument>>,
    config: &ReviewConfig,
    today: NaiveDate,
) -> Judgement {
    let document = match lookup {
        Err(e) => {
            return (
                VerificationStatus::Removed,
                Some(format!("{}: {}", ErrorCode::VerificationUnavailable, e)),
            )
        }
        Ok(None) => {
            return (
                VerificationStatus::Removed,
                Some("locator not found".to_string()),
            )
        }
        Ok(Some(document)) => document,
    };

    if !document.is_in_force(today) {
        return (
            VerificationStatus::Removed,
            Some(format!("source not in force ({:?})", document.validity).to_lowercase()),
        );
    }

    if let (Some(wanted), Some(actual)) = (&config.jurisdiction, &document.jurisdiction) {
        if !wanted.eq_ignore_ascii_case(actual) {
            return (
                VerificationStatus::Removed,
                Some(format!("jurisdiction {actual} does not match {wanted}")),
            );
        }
    }

    if document.digitised {
        return (
            VerificationStatus::DigitisedUnverifiable,
            Some("digitised source predates machine-readable originals".to_string()),
        );
    }

    match match_text(&citation.asserted_text, &document.text, config.match_threshold) {
        TextMatch::Exact => (VerificationStatus::Verified, None),
        TextMatch::Similar(score) => (
            VerificationStatus::Verified,
            Some(format!("paraphrase (overlap {score:.2})")),
        ),
        TextMatch::Mismatch(score) => (
            VerificationStatus::Removed,
            Some(format!("text mismatch (overlap {score:.2})")),
        ),
    }
}
