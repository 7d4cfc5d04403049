use crate::task::{TaskError, TaskErrorKind, TaskOutcome};

use super::{Decision, Policy};

/// Collects per-task outcomes in input order and applies the policy's decision rule.
///
/// The predicate is purely outcome based: commit iff no failure is among the outcomes
/// gathered when [`decide`](Self::decide) is called. Outcomes recorded after that are kept
/// but flagged as late.
#[derive(Debug)]
pub struct OutcomeAggregator {
    policy: Policy,
    slots: Vec<Option<TaskOutcome>>,
    gathered: usize,
    first_failure: Option<usize>,
    decision: Option<Decision>,
    late: Vec<usize>,
}

impl OutcomeAggregator {
    #[must_use]
    pub fn new(policy: Policy, task_count: usize) -> Self {
        Self {
            policy,
            slots: vec![None; task_count],
            gathered: 0,
            first_failure: None,
            decision: None,
            late: Vec::new(),
        }
    }

    /// Store the outcome for task `index`. Each index is recorded at most once; a repeat is
    /// ignored.
    pub fn record(&mut self, index: usize, outcome: TaskOutcome) {
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::warn!(index, "outcome for unknown task index ignored");
            return;
        };
        if slot.is_some() {
            tracing::warn!(index, "duplicate outcome ignored");
            return;
        }
        if outcome.is_failure() && self.first_failure.is_none() {
            self.first_failure = Some(index);
        }
        *slot = Some(outcome);
        self.gathered += 1;
        if self.decision.is_some() {
            self.late.push(index);
        }
    }

    /// True once the policy has seen enough to decide.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match self.policy {
            Policy::FailFast => self.first_failure.is_some() || self.all_gathered(),
            Policy::CollectAll => self.all_gathered(),
        }
    }

    #[must_use]
    pub fn all_gathered(&self) -> bool {
        self.gathered == self.slots.len()
    }

    #[must_use]
    pub fn gathered(&self) -> usize {
        self.gathered
    }

    /// Fix the decision from the outcomes gathered so far. Later calls return the first
    /// decision unchanged.
    pub fn decide(&mut self) -> Decision {
        if let Some(decision) = self.decision {
            return decision;
        }
        let decision = if self.first_failure.is_some() {
            Decision::RolledBack
        } else {
            Decision::Committed
        };
        self.decision = Some(decision);
        decision
    }

    /// Index and cause of the first failure observed.
    #[must_use]
    pub fn first_failure(&self) -> Option<(usize, &TaskError)> {
        let index = self.first_failure?;
        let cause = self.slots.get(index)?.as_ref()?.cause()?;
        Some((index, cause))
    }

    /// Index-aligned outcomes plus the indices that arrived after the decision. A task that
    /// never reported is filled in as aborted.
    #[must_use]
    pub fn finish(self) -> (Vec<TaskOutcome>, Vec<usize>) {
        let outcomes = self
            .slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| TaskOutcome::Failure {
                    cause: TaskError::new(TaskErrorKind::Aborted, "no outcome recorded"),
                    elapsed: std::time::Duration::ZERO,
                })
            })
            .collect();
        (outcomes, self.late)
    }
}
