//! Token budget: a cap per logical query and an optional monthly cap.
//!
//! The monthly counter is persisted as a small JSON file
//! (`{"month": "2026-10", "used_tokens": 1234}`) and resets when the
//! calendar month (UTC) changes.
//!
//! Every generation call first takes a [`Reservation`] for an estimate of
//! prompt tokens plus the completion cap. The cap check and the hold happen
//! under one lock, so concurrent queries cannot all pass the check and then
//! overrun the cap together. After the call the reservation is settled with
//! the provider-reported usage, or with the estimate when the provider
//! reports none. A reservation dropped without settling is released.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use crate::config::Config;

/// Raised when a generation call would overrun a cap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetExceeded {
    #[error("per-query token budget exceeded: need {needed}, {remaining} of {limit} remaining")]
    PerQuery { needed: u64, remaining: u64, limit: u64 },

    #[error("monthly token budget exceeded: need {needed}, {remaining} of {limit} remaining")]
    Monthly { needed: u64, remaining: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MonthState {
    month: String,
    used_tokens: u64,
    /// Held by in-flight calls; never persisted.
    #[serde(skip)]
    reserved: u64,
}

impl MonthState {
    fn fresh(month: String) -> Self {
        Self {
            month,
            used_tokens: 0,
            reserved: 0,
        }
    }

    fn roll(&mut self) {
        let month = current_month();
        if self.month != month {
            *self = MonthState::fresh(month);
        }
    }
}

fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// Process-wide budget shared by all queries.
#[derive(Debug)]
pub struct TokenBudget {
    per_query: u64,
    monthly: Option<u64>,
    state_path: Option<PathBuf>,
    state: Mutex<MonthState>,
}

impl TokenBudget {
    /// Budget from `[budget]`, persisted at [`Config::budget_state_path`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            config.budget.max_tokens_per_query,
            config.budget.max_monthly_tokens,
            &config.budget_state_path(),
        )
    }

    /// Load the monthly state at `path`; a missing file starts at zero.
    pub fn open(per_query: u64, monthly: Option<u64>, path: &Path) -> Result<Self> {
        let month = current_month();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read budget state: {}", path.display()))?;
            let stored: MonthState = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid budget state file: {}", path.display()))?;
            if stored.month == month {
                stored
            } else {
                tracing::info!(previous = %stored.month, current = %month, "new budget month");
                MonthState::fresh(month)
            }
        } else {
            MonthState::fresh(month)
        };

        Ok(Self {
            per_query,
            monthly,
            state_path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    /// Budget that is never written to disk.
    pub fn in_memory(per_query: u64, monthly: Option<u64>) -> Self {
        Self {
            per_query,
            monthly,
            state_path: None,
            state: Mutex::new(MonthState::fresh(current_month())),
        }
    }

    /// Start accounting for one logical query.
    pub fn query(&self) -> QueryBudget<'_> {
        QueryBudget {
            budget: self,
            held: AtomicU64::new(0),
            used: AtomicU64::new(0),
        }
    }

    /// Tokens charged this month.
    pub fn monthly_used(&self) -> u64 {
        self.lock().used_tokens
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonthState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn reserve_monthly(&self, needed: u64) -> Result<(), BudgetExceeded> {
        let mut state = self.lock();
        state.roll();
        if let Some(limit) = self.monthly {
            let remaining = limit
                .saturating_sub(state.used_tokens)
                .saturating_sub(state.reserved);
            if needed > remaining {
                return Err(BudgetExceeded::Monthly {
                    needed,
                    remaining,
                    limit,
                });
            }
        }
        state.reserved = state.reserved.saturating_add(needed);
        Ok(())
    }

    fn release_monthly(&self, held: u64) {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(held);
    }

    fn settle_monthly(&self, held: u64, tokens: u64) -> Result<()> {
        let snapshot = {
            let mut state = self.lock();
            state.roll();
            state.reserved = state.reserved.saturating_sub(held);
            state.used_tokens = state.used_tokens.saturating_add(tokens);
            state.clone()
        };
        if let Some(path) = &self.state_path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, serde_json::to_string(&snapshot)?)
                .with_context(|| format!("Failed to write budget state: {}", path.display()))?;
        }
        Ok(())
    }
}

/// Usage of one logical query, across its attempts and repair.
#[derive(Debug)]
pub struct QueryBudget<'a> {
    budget: &'a TokenBudget,
    /// Charged plus reserved.
    held: AtomicU64,
    used: AtomicU64,
}

impl QueryBudget<'_> {
    /// Hold `estimate` tokens against both caps, or fail if either would
    /// be overrun.
    pub fn reserve(&self, estimate: u64) -> Result<Reservation<'_>, BudgetExceeded> {
        let limit = self.budget.per_query;
        self.held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                (estimate <= limit.saturating_sub(held)).then(|| held + estimate)
            })
            .map_err(|held| BudgetExceeded::PerQuery {
                needed: estimate,
                remaining: limit.saturating_sub(held),
                limit,
            })?;
        if let Err(e) = self.budget.reserve_monthly(estimate) {
            self.held.fetch_sub(estimate, Ordering::SeqCst);
            return Err(e);
        }
        Ok(Reservation {
            query: self,
            estimate,
            settled: false,
        })
    }

    /// Tokens charged to this query so far.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

/// Tokens held for one in-flight generation call.
#[derive(Debug)]
#[must_use = "a reservation is released unless settled"]
pub struct Reservation<'a> {
    query: &'a QueryBudget<'a>,
    estimate: u64,
    settled: bool,
}

impl Reservation<'_> {
    /// Replace the hold with actual usage and return what was charged.
    /// A report of zero tokens charges the estimate.
    pub fn settle(mut self, reported: u64) -> Result<u64> {
        self.settled = true;
        let charged = if reported == 0 { self.estimate } else { reported };
        let estimate = self.estimate;
        let _ = self
            .query
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                Some(held.saturating_sub(estimate).saturating_add(charged))
            });
        self.query.used.fetch_add(charged, Ordering::SeqCst);
        self.query.budget.settle_monthly(estimate, charged)?;
        Ok(charged)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.query.held.fetch_sub(self.estimate, Ordering::SeqCst);
            self.query.budget.release_monthly(self.estimate);
        }
    }
}
