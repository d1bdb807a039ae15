//! The update torture campaign.
//!
//! Each iteration is a reboot, a normal update or a forced capsule update.
//! Only updates count towards the target; reboots are tallied separately. The
//! first failed invariant aborts the whole campaign.

use crate::config::CampaignConfig;
use crate::error::Result;
use crate::harness::{CycleOutcome, Harness};
use crate::slot::SlotId;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// What one iteration does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    RebootOnly,
    NormalUpdate,
    ForcedCapsuleUpdate,
}

impl ActionKind {
    /// Every action, in the order random draws index them.
    pub const ALL: [ActionKind; 3] = [
        ActionKind::RebootOnly,
        ActionKind::ForcedCapsuleUpdate,
        ActionKind::NormalUpdate,
    ];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::RebootOnly => "reboot-only",
            ActionKind::NormalUpdate => "normal-update",
            ActionKind::ForcedCapsuleUpdate => "forced-capsule-update",
        };
        f.write_str(name)
    }
}

/// Record of one campaign iteration.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateAttempt {
    /// 1-based iteration number.
    pub iteration: u32,
    pub kind: ActionKind,
    pub pre_slot: Option<SlotId>,
    pub post_slot: Option<SlotId>,
    pub success: bool,
    pub transfer_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Error code and message when the iteration failed.
    pub error: Option<String>,
}

/// Running tallies of completed iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    pub normal_updates: u32,
    pub capsule_updates: u32,
    pub reboots: u32,
}

impl CampaignStats {
    /// Completed updates of either kind.
    pub fn updates(&self) -> u32 {
        self.normal_updates + self.capsule_updates
    }

    fn record(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::RebootOnly => self.reboots += 1,
            ActionKind::NormalUpdate => self.normal_updates += 1,
            ActionKind::ForcedCapsuleUpdate => self.capsule_updates += 1,
        }
    }
}

/// Final result of a completed campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub seed: u64,
    pub target_updates: u32,
    pub stats: CampaignStats,
    pub attempts: Vec<UpdateAttempt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The torture test driver.
pub struct UpdateCampaign {
    config: CampaignConfig,
    seed: u64,
    rng: StdRng,
    stats: CampaignStats,
    attempts: Vec<UpdateAttempt>,
}

impl UpdateCampaign {
    /// Creates a campaign. Without a configured seed one is drawn from the OS
    /// so the run can still be reproduced from the logged value.
    pub fn new(config: &CampaignConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        Self {
            config: config.clone(),
            seed,
            rng: StdRng::seed_from_u64(seed),
            stats: CampaignStats::default(),
            attempts: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> CampaignStats {
        self.stats
    }

    /// Iterations recorded so far, the failing one included.
    pub fn attempts(&self) -> &[UpdateAttempt] {
        &self.attempts
    }

    /// Picks the next action.
    pub fn select_action(&mut self) -> ActionKind {
        if self.config.mixed_random {
            ActionKind::ALL[self.rng.random_range(0..ActionKind::ALL.len())]
        } else if self.config.force_capsule {
            ActionKind::ForcedCapsuleUpdate
        } else {
            ActionKind::NormalUpdate
        }
    }

    fn perform(harness: &mut Harness, kind: ActionKind) -> Result<CycleOutcome> {
        match kind {
            ActionKind::RebootOnly => harness.reboot_only(),
            ActionKind::NormalUpdate => harness.update_cycle(false),
            ActionKind::ForcedCapsuleUpdate => harness.update_cycle(true),
        }
    }

    /// Runs one iteration of `kind` and records it.
    pub fn run_iteration(&mut self, harness: &mut Harness, kind: ActionKind) -> Result<CycleOutcome> {
        let iteration = self.attempts.len() as u32 + 1;
        let started_at = Utc::now();
        let clock = Instant::now();
        log::info!(
            "Iteration {}: {} ({} of {} updates done)",
            iteration,
            kind,
            self.stats.updates(),
            self.config.num_updates
        );

        let result = Self::perform(harness, kind);
        let mut attempt = UpdateAttempt {
            iteration,
            kind,
            pre_slot: None,
            post_slot: None,
            success: false,
            transfer_attempts: 0,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            error: None,
        };

        match &result {
            Ok(outcome) => {
                attempt.pre_slot = Some(outcome.pre_slot);
                attempt.post_slot = Some(outcome.post_slot);
                attempt.transfer_attempts = outcome.transfer_attempts;
                attempt.success = true;
                self.stats.record(kind);
            }
            Err(e) => {
                log::error!("Iteration {} ({}) failed [{}]: {}", iteration, kind, e.code(), e);
                attempt.error = Some(format!("{}: {}", e.code(), e));
            }
        }
        self.attempts.push(attempt);
        result
    }

    /// Runs until the configured number of updates has completed.
    pub fn run(&mut self, harness: &mut Harness) -> Result<CampaignReport> {
        let started_at = Utc::now();
        log::info!(
            "Starting update torture campaign with {} update passes (seed {})",
            self.config.num_updates,
            self.seed
        );

        while self.stats.updates() < self.config.num_updates {
            let kind = self.select_action();
            self.run_iteration(harness, kind)?;
        }

        log::info!(
            "Campaign complete: {} normal updates, {} capsule updates, {} reboots",
            self.stats.normal_updates,
            self.stats.capsule_updates,
            self.stats.reboots
        );
        Ok(CampaignReport {
            seed: self.seed,
            target_updates: self.config.num_updates,
            stats: self.stats,
            attempts: self.attempts.clone(),
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign(mixed_random: bool, force_capsule: bool, seed: u64) -> UpdateCampaign {
        UpdateCampaign::new(&CampaignConfig {
            num_updates: 10,
            force_capsule,
            mixed_random,
            seed: Some(seed),
        })
    }

    #[test]
    fn test_fixed_selection() {
        let mut c = campaign(false, false, 1);
        assert!((0..20).all(|_| c.select_action() == ActionKind::NormalUpdate));
        let mut c = campaign(false, true, 1);
        assert!((0..20).all(|_| c.select_action() == ActionKind::ForcedCapsuleUpdate));
    }

    #[test]
    fn test_random_selection_is_reproducible() {
        let mut a = campaign(true, false, 42);
        let mut b = campaign(true, false, 42);
        let xs: Vec<_> = (0..64).map(|_| a.select_action()).collect();
        let ys: Vec<_> = (0..64).map(|_| b.select_action()).collect();
        assert_eq!(xs, ys);
        for kind in ActionKind::ALL {
            assert!(xs.contains(&kind), "{kind} never drawn");
        }
    }

    #[test]
    fn test_seed_is_drawn_when_unset() {
        let c = UpdateCampaign::new(&CampaignConfig::default());
        let again = UpdateCampaign::new(&CampaignConfig {
            seed: Some(c.seed()),
            ..CampaignConfig::default()
        });
        assert_eq!(c.seed(), again.seed());
    }

    #[test]
    fn test_stats_record() {
        let mut stats = CampaignStats::default();
        stats.record(ActionKind::RebootOnly);
        stats.record(ActionKind::NormalUpdate);
        stats.record(ActionKind::ForcedCapsuleUpdate);
        stats.record(ActionKind::ForcedCapsuleUpdate);
        assert_eq!(stats.updates(), 3);
        assert_eq!(stats.reboots, 1);
        assert_eq!(stats.capsule_updates, 2);
    }

    #[test]
    fn test_action_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ActionKind::ForcedCapsuleUpdate).unwrap(),
            "\"forced-capsule-update\""
        );
        assert_eq!(ActionKind::RebootOnly.to_string(), "reboot-only");
    }
}
