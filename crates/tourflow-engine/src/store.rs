//! In-memory stores for availability rules and exceptions.
//!
//! Both stores keep per-tour collections behind copy-on-write `Arc`
//! snapshots: readers clone the `Arc` and never block on writers, writers
//! clone the vector, mutate, and swap. A monotonic version counter lets the
//! resolution cache detect any change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use tracing::info;
use uuid::Uuid;

use tourflow_core::{AvailabilityException, AvailabilityRule, Tour, DEFAULT_LEAD_HOURS};

use crate::error::{EngineError, EngineResult};

/// Input for creating or updating an availability rule.
#[derive(Debug, Clone)]
pub struct RuleDraft {
    /// Weekdays the rule fires on.
    pub weekdays: Vec<Weekday>,
    /// Departure times of day, in the tour's timezone.
    pub start_times: Vec<NaiveTime>,
    /// Capacity per departure.
    pub max_capacity: i32,
    /// Minimum booking lead time in hours; defaults when absent.
    pub min_booking_lead_hours: Option<i64>,
}

impl RuleDraft {
    fn validate(&self, tour: &Tour) -> EngineResult<()> {
        if self.weekdays.is_empty() {
            return Err(EngineError::validation("rule must name at least one weekday"));
        }
        if self.start_times.is_empty() {
            return Err(EngineError::validation(
                "rule must name at least one start time",
            ));
        }
        if self.max_capacity <= 0 {
            return Err(EngineError::validation(format!(
                "rule capacity must be positive, got {}",
                self.max_capacity
            )));
        }
        if self.max_capacity > tour.max_capacity {
            return Err(EngineError::validation(format!(
                "rule capacity {} exceeds tour capacity {}",
                self.max_capacity, tour.max_capacity
            )));
        }
        if let Some(lead) = self.min_booking_lead_hours
            && lead < 0
        {
            return Err(EngineError::validation(format!(
                "lead time must not be negative, got {} hours",
                lead
            )));
        }
        Ok(())
    }
}

/// Store of recurring availability rules, keyed by tour.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<HashMap<Uuid, Arc<Vec<AvailabilityRule>>>>,
    version: AtomicU64,
}

impl RuleStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Creates a rule for the tour. New rules start active.
    pub fn create_rule(&self, tour: &Tour, draft: RuleDraft) -> EngineResult<AvailabilityRule> {
        draft.validate(tour)?;

        let rule = AvailabilityRule {
            id: Uuid::new_v4(),
            tour_id: tour.id,
            active: true,
            weekdays: draft.weekdays,
            start_times: draft.start_times,
            max_capacity: draft.max_capacity,
            min_booking_lead_hours: draft.min_booking_lead_hours.unwrap_or(DEFAULT_LEAD_HOURS),
            created_at: Utc::now(),
        };

        self.mutate(tour.id, |rules| rules.push(rule.clone()));
        info!(tour = %tour.id, rule = %rule.id, "Created availability rule");
        Ok(rule)
    }

    /// Replaces the pattern and constraints of an existing rule.
    ///
    /// The active flag and creation time are preserved.
    pub fn update_rule(
        &self,
        tour: &Tour,
        rule_id: Uuid,
        draft: RuleDraft,
    ) -> EngineResult<AvailabilityRule> {
        draft.validate(tour)?;

        let mut updated = None;
        let found = self.try_mutate(tour.id, |rules| {
            let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) else {
                return false;
            };
            rule.weekdays = draft.weekdays.clone();
            rule.start_times = draft.start_times.clone();
            rule.max_capacity = draft.max_capacity;
            if let Some(lead) = draft.min_booking_lead_hours {
                rule.min_booking_lead_hours = lead;
            }
            updated = Some(rule.clone());
            true
        });

        if !found {
            return Err(EngineError::not_found(format!(
                "no rule {} for tour {}",
                rule_id, tour.id
            )));
        }
        Ok(updated.expect("rule updated but not captured"))
    }

    /// Activates or deactivates a rule without deleting it.
    pub fn set_rule_active(&self, tour_id: Uuid, rule_id: Uuid, active: bool) -> EngineResult<()> {
        let found = self.try_mutate(tour_id, |rules| {
            let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) else {
                return false;
            };
            rule.active = active;
            true
        });
        if !found {
            return Err(EngineError::not_found(format!(
                "no rule {} for tour {}",
                rule_id, tour_id
            )));
        }
        Ok(())
    }

    /// Deletes a rule. Deleting an unknown id is a no-op.
    pub fn delete_rule(&self, tour_id: Uuid, rule_id: Uuid) {
        self.mutate(tour_id, |rules| rules.retain(|r| r.id != rule_id));
    }

    /// Returns the tour's rules ordered by creation time.
    pub fn rules_for_tour(&self, tour_id: Uuid) -> Arc<Vec<AvailabilityRule>> {
        self.rules
            .read()
            .expect("rule store lock poisoned")
            .get(&tour_id)
            .cloned()
            .unwrap_or_default()
    }

    fn mutate(&self, tour_id: Uuid, f: impl FnOnce(&mut Vec<AvailabilityRule>)) {
        let mut map = self.rules.write().expect("rule store lock poisoned");
        let current = map.entry(tour_id).or_default();
        let mut next = current.as_ref().clone();
        f(&mut next);
        next.sort_by_key(|r| (r.created_at, r.id));
        *current = Arc::new(next);
        drop(map);
        self.bump();
    }

    // Returns whether `f` found its target; the swap happens only if it did.
    fn try_mutate(&self, tour_id: Uuid, f: impl FnOnce(&mut Vec<AvailabilityRule>) -> bool) -> bool {
        let mut map = self.rules.write().expect("rule store lock poisoned");
        let Some(current) = map.get_mut(&tour_id) else {
            return false;
        };
        let mut next = current.as_ref().clone();
        if !f(&mut next) {
            return false;
        }
        next.sort_by_key(|r| (r.created_at, r.id));
        *current = Arc::new(next);
        drop(map);
        self.bump();
        true
    }
}

/// Store of blackout exceptions, keyed by tour.
#[derive(Debug, Default)]
pub struct ExceptionStore {
    exceptions: RwLock<HashMap<Uuid, Arc<Vec<AvailabilityException>>>>,
    version: AtomicU64,
}

impl ExceptionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Creates a blackout interval for the tour.
    pub fn create_exception(
        &self,
        tour_id: Uuid,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> EngineResult<AvailabilityException> {
        validate_blackout(start_date, end_date)?;

        let exception = AvailabilityException {
            id: Uuid::new_v4(),
            tour_id,
            start_date,
            end_date,
            reason: reason.into(),
            created_at: Utc::now(),
        };

        self.mutate(tour_id, |exceptions| exceptions.push(exception.clone()));
        info!(tour = %tour_id, exception = %exception.id, "Created availability exception");
        Ok(exception)
    }

    /// Replaces the interval and reason of an existing exception.
    pub fn update_exception(
        &self,
        tour_id: Uuid,
        exception_id: Uuid,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> EngineResult<AvailabilityException> {
        validate_blackout(start_date, end_date)?;
        let reason = reason.into();

        let mut updated = None;
        let found = self.try_mutate(tour_id, |exceptions| {
            let Some(exception) = exceptions.iter_mut().find(|e| e.id == exception_id) else {
                return false;
            };
            exception.start_date = start_date;
            exception.end_date = end_date;
            exception.reason = reason.clone();
            updated = Some(exception.clone());
            true
        });

        if !found {
            return Err(EngineError::not_found(format!(
                "no exception {} for tour {}",
                exception_id, tour_id
            )));
        }
        Ok(updated.expect("exception updated but not captured"))
    }

    /// Deletes an exception. Deleting an unknown id is a no-op.
    pub fn delete_exception(&self, tour_id: Uuid, exception_id: Uuid) {
        self.mutate(tour_id, |exceptions| {
            exceptions.retain(|e| e.id != exception_id)
        });
    }

    /// Returns the tour's exceptions ordered by creation time.
    pub fn exceptions_for_tour(&self, tour_id: Uuid) -> Arc<Vec<AvailabilityException>> {
        self.exceptions
            .read()
            .expect("exception store lock poisoned")
            .get(&tour_id)
            .cloned()
            .unwrap_or_default()
    }

    fn mutate(&self, tour_id: Uuid, f: impl FnOnce(&mut Vec<AvailabilityException>)) {
        let mut map = self.exceptions.write().expect("exception store lock poisoned");
        let current = map.entry(tour_id).or_default();
        let mut next = current.as_ref().clone();
        f(&mut next);
        next.sort_by_key(|e| (e.created_at, e.id));
        *current = Arc::new(next);
        drop(map);
        self.bump();
    }

    fn try_mutate(
        &self,
        tour_id: Uuid,
        f: impl FnOnce(&mut Vec<AvailabilityException>) -> bool,
    ) -> bool {
        let mut map = self.exceptions.write().expect("exception store lock poisoned");
        let Some(current) = map.get_mut(&tour_id) else {
            return false;
        };
        let mut next = current.as_ref().clone();
        if !f(&mut next) {
            return false;
        }
        next.sort_by_key(|e| (e.created_at, e.id));
        *current = Arc::new(next);
        drop(map);
        self.bump();
        true
    }
}

fn validate_blackout(start: DateTime<Utc>, end: DateTime<Utc>) -> EngineResult<()> {
    if start >= end {
        return Err(EngineError::validation(format!(
            "blackout start {} must be before end {}",
            start, end
        )));
    }
    Ok(())
}
