//! Transfer share classification and the deficit-based fairness ledger.

use std::collections::{BTreeMap, HashMap};

use ferry_config::{ShareConfig, ShareType};
use ferry_core::{DEFAULT_SHARE, TransferRequest};
use tracing::trace;

use crate::error::{SchedulerError, SchedulerResult};

/// Maps requests to share names and holds the weight of each share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareConfiguration {
    share_type: ShareType,
    default_weight: u32,
    reference: BTreeMap<String, u32>,
}

impl Default for ShareConfiguration {
    fn default() -> Self {
        Self {
            share_type: ShareType::User,
            default_weight: ferry_config::ShareConfig::default().default_weight,
            reference: BTreeMap::new(),
        }
    }
}

impl ShareConfiguration {
    /// Configuration with no reference shares.
    ///
    /// # Errors
    ///
    /// Returns an error when `default_weight` is zero.
    pub fn new(share_type: ShareType, default_weight: u32) -> SchedulerResult<Self> {
        if default_weight == 0 {
            return Err(SchedulerError::InvalidShare {
                share: DEFAULT_SHARE.to_string(),
                reason: "weight must be positive",
            });
        }
        Ok(Self {
            share_type,
            default_weight,
            reference: BTreeMap::new(),
        })
    }

    /// Add an explicit weight for one share.
    ///
    /// # Errors
    ///
    /// Returns an error when `weight` is zero.
    pub fn with_reference(mut self, share: impl Into<String>, weight: u32) -> SchedulerResult<Self> {
        let share = share.into();
        if weight == 0 {
            return Err(SchedulerError::InvalidShare {
                share,
                reason: "weight must be positive",
            });
        }
        self.reference.insert(share, weight);
        Ok(self)
    }

    /// Build from the configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error when any weight is zero.
    pub fn from_config(config: &ShareConfig) -> SchedulerResult<Self> {
        config.reference_weights.iter().try_fold(
            Self::new(config.share_type, config.default_weight)?,
            |shares, (name, weight)| shares.with_reference(name.clone(), *weight),
        )
    }

    /// Classification rule.
    #[must_use]
    pub const fn share_type(&self) -> ShareType {
        self.share_type
    }

    /// Number of shares with explicit weights.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.reference.len()
    }

    /// Share a request belongs to. Never empty.
    #[must_use]
    pub fn classify(&self, request: &TransferRequest) -> String {
        let base = match self.share_type {
            ShareType::User => Some(request.user().name.as_str()),
            ShareType::Vo => request.vo(),
            ShareType::None => None,
        }
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SHARE);
        match request.sub_share().filter(|sub| !sub.is_empty()) {
            Some(sub) => format!("{base}-{sub}"),
            None => base.to_string(),
        }
    }

    /// Weight of a share.
    ///
    /// An exact reference entry wins; otherwise the longest reference name
    /// that prefixes the share up to a `-` separator applies, so sub-shares
    /// inherit the weight of their parent.
    #[must_use]
    pub fn weight(&self, share: &str) -> u32 {
        self.reference_weight(share).unwrap_or(self.default_weight)
    }

    /// Priority used to order requests inside a share.
    ///
    /// Shares with a reference weight scale the job priority by
    /// `weight / 100`; other shares keep the job priority.
    #[must_use]
    pub fn effective_priority(&self, share: &str, priority: u32) -> u64 {
        self.reference_weight(share).map_or(u64::from(priority), |weight| {
            u64::from(weight) * u64::from(priority) / 100
        })
    }

    fn reference_weight(&self, share: &str) -> Option<u32> {
        if let Some(weight) = self.reference.get(share) {
            return Some(*weight);
        }
        self.reference
            .iter()
            .filter(|(name, _)| {
                share
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
            })
            .max_by_key(|(name, _)| name.len())
            .map(|(_, weight)| *weight)
    }
}

/// One share's best waiting request, as seen by [`ShareLedger::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareCandidate<'a> {
    /// Share name.
    pub share: &'a str,
    /// Configured weight of the share.
    pub weight: u32,
    /// Effective priority of the share's head request.
    pub priority: u64,
    /// Enqueue sequence of the share's head request; lower is older.
    pub seq: u64,
}

/// Allocation history for one stage.
///
/// Each share's entitlement is its weight divided by the total weight of the
/// shares that currently have work. The share whose allocation trails its
/// entitlement the most is served next. Shares that go idle lose their
/// history, and a share that becomes busy again starts level with its
/// entitlement so it cannot claim credit for time spent idle.
#[derive(Debug, Default)]
pub struct ShareLedger {
    allocated: HashMap<String, u64>,
}

impl ShareLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose among candidates and charge the winner one allocation.
    ///
    /// Returns the index of the chosen candidate, or `None` when there are none.
    pub fn select(&mut self, candidates: &[ShareCandidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        self.allocated
            .retain(|share, _| candidates.iter().any(|c| c.share == share));

        let total_weight: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
        let mut total_allocated: u64 = self.allocated.values().sum();
        for candidate in candidates {
            if !self.allocated.contains_key(candidate.share) {
                // Seed at the entitlement so the newcomer starts level.
                let others = total_weight.saturating_sub(u64::from(candidate.weight));
                let seeded = if others == 0 {
                    0
                } else {
                    total_allocated * u64::from(candidate.weight) / others
                };
                total_allocated += seeded;
                self.allocated.insert(candidate.share.to_string(), seeded);
            }
        }

        let total_allocated = i128::from(self.allocated.values().sum::<u64>());
        let total_weight = i128::from(total_weight);
        let deficit = |candidate: &ShareCandidate<'_>| {
            let held = i128::from(self.allocated.get(candidate.share).copied().unwrap_or(0));
            (total_allocated + 1) * i128::from(candidate.weight) - held * total_weight
        };

        let (index, chosen) = candidates.iter().enumerate().max_by(|(_, a), (_, b)| {
            deficit(a)
                .cmp(&deficit(b))
                .then(a.priority.cmp(&b.priority))
                .then(b.seq.cmp(&a.seq))
        })?;
        trace!(share = chosen.share, deficit = %deficit(chosen), "share selected");
        if let Some(held) = self.allocated.get_mut(chosen.share) {
            *held += 1;
        }
        Some(index)
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.allocated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::LocalUser;

    fn request(user: &str) -> TransferRequest {
        TransferRequest::new("job", "mock://src/a", "mock://dst/a", LocalUser::new(user, 1, 1))
    }

    fn run(ledger: &mut ShareLedger, shares: &[(&str, u32)], rounds: usize) -> Vec<usize> {
        let mut picks = vec![0; shares.len()];
        for round in 0..rounds {
            let candidates: Vec<_> = shares
                .iter()
                .map(|(share, weight)| ShareCandidate {
                    share,
                    weight: *weight,
                    priority: 50,
                    seq: round as u64,
                })
                .collect();
            let index = ledger.select(&candidates).expect("candidate chosen");
            picks[index] += 1;
        }
        picks
    }

    #[test]
    fn classification_follows_share_type() {
        let by_user = ShareConfiguration::default();
        assert_eq!(by_user.classify(&request("alice")), "alice");
        assert_eq!(
            by_user.classify(&request("alice").with_sub_share("download")),
            "alice-download"
        );

        let by_vo = ShareConfiguration::new(ShareType::Vo, 50).expect("valid");
        assert_eq!(by_vo.classify(&request("alice").with_vo("atlas")), "atlas");
        assert_eq!(by_vo.classify(&request("alice")), DEFAULT_SHARE);

        let none = ShareConfiguration::new(ShareType::None, 50).expect("valid");
        assert_eq!(none.classify(&request("alice").with_vo("atlas")), DEFAULT_SHARE);
    }

    #[test]
    fn weights_fall_back_through_parent_shares() {
        let shares = ShareConfiguration::new(ShareType::Vo, 50)
            .and_then(|s| s.with_reference("atlas", 80))
            .and_then(|s| s.with_reference("atlas-prod", 90))
            .expect("valid");
        assert_eq!(shares.weight("atlas"), 80);
        assert_eq!(shares.weight("atlas-download"), 80);
        assert_eq!(shares.weight("atlas-prod-download"), 90);
        assert_eq!(shares.weight("atlasx"), 50);
        assert_eq!(shares.weight("cms"), 50);
        assert_eq!(shares.effective_priority("atlas-download", 50), 40);
        assert_eq!(shares.effective_priority("cms", 50), 50);
        assert_eq!(shares.reference_count(), 2);
    }

    #[test]
    fn zero_weights_are_rejected() {
        assert!(ShareConfiguration::new(ShareType::User, 0).is_err());
        let err = ShareConfiguration::default()
            .with_reference("atlas", 0)
            .expect_err("zero weight");
        assert!(matches!(err, SchedulerError::InvalidShare { ref share, .. } if share == "atlas"));
    }

    #[test]
    fn equal_shares_split_evenly() {
        let mut ledger = ShareLedger::new();
        let picks = run(&mut ledger, &[("alice", 50), ("bob", 50)], 100);
        assert!(picks[0].abs_diff(50) <= 1, "picks {picks:?}");
        assert!(picks[1].abs_diff(50) <= 1, "picks {picks:?}");
    }

    #[test]
    fn weighted_shares_split_proportionally() {
        let mut ledger = ShareLedger::new();
        let picks = run(&mut ledger, &[("heavy", 75), ("light", 25)], 100);
        assert!(picks[0].abs_diff(75) <= 1, "picks {picks:?}");
        assert!(picks[1].abs_diff(25) <= 1, "picks {picks:?}");
    }

    #[test]
    fn returning_share_does_not_claim_idle_credit() {
        let mut ledger = ShareLedger::new();
        let _ = run(&mut ledger, &[("alice", 50)], 40);
        let picks = run(&mut ledger, &[("alice", 50), ("bob", 50)], 20);
        assert!(picks[1].abs_diff(10) <= 1, "picks {picks:?}");
    }

    #[test]
    fn ties_prefer_priority_then_age() {
        let mut ledger = ShareLedger::new();
        let candidates = [
            ShareCandidate { share: "a", weight: 50, priority: 10, seq: 1 },
            ShareCandidate { share: "b", weight: 50, priority: 90, seq: 2 },
        ];
        assert_eq!(ledger.select(&candidates), Some(1));

        let mut ledger = ShareLedger::new();
        let candidates = [
            ShareCandidate { share: "a", weight: 50, priority: 50, seq: 7 },
            ShareCandidate { share: "b", weight: 50, priority: 50, seq: 3 },
        ];
        assert_eq!(ledger.select(&candidates), Some(1));
        assert_eq!(ledger.select(&[]), None);
    }
}
