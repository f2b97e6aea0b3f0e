//! Plan snapshots and their invariants.
//!
//! A [`Plan`] is an ordered list of steps with strictly increasing ids.
//! REPLAN never edits a plan in place: [`Plan::extend`] returns the next
//! revision with the delta appended, and the caller keeps the old snapshot
//! for its audit history.

use serde::{Deserialize, Serialize};

use crate::core::types::Step;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub revision: u32,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Build revision 0 from proposed steps, renumbering ids `1..=n` in order.
    ///
    /// Proposed ids are advisory; order is what the proposer controls.
    pub fn from_proposal(steps: Vec<Step>) -> Self {
        let steps = steps
            .into_iter()
            .zip(1u32..)
            .map(|(step, id)| Step {
                step_id: id,
                ..step
            })
            .collect();
        Self { revision: 0, steps }
    }

    /// Return the next revision with `delta` appended after the last step.
    ///
    /// Appended steps are renumbered from `max_step_id + 1` and carry no
    /// runtime state.
    pub fn extend(&self, delta: Vec<Step>) -> Plan {
        let start = self.max_step_id() + 1;
        let mut steps = self.steps.clone();
        steps.extend(
            delta
                .into_iter()
                .zip(start..)
                .map(|(step, id)| Step {
                    step_id: id,
                    ..step.without_runtime_state()
                }),
        );
        Plan {
            revision: self.revision + 1,
            steps,
        }
    }

    /// Copy of the plan as a fresh revision 0 with runtime state cleared.
    pub fn replayable(&self) -> Plan {
        Plan {
            revision: 0,
            steps: self.steps.iter().map(Step::without_runtime_state).collect(),
        }
    }

    pub fn max_step_id(&self) -> u32 {
        self.steps.iter().map(|s| s.step_id).max().unwrap_or(0)
    }

    pub fn step(&self, step_id: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn first_step_id(&self) -> Option<u32> {
        self.steps.first().map(|s| s.step_id)
    }

    /// Id of the step that follows `step_id` in plan order.
    pub fn next_step_id(&self, step_id: u32) -> Option<u32> {
        let pos = self.steps.iter().position(|s| s.step_id == step_id)?;
        self.steps.get(pos + 1).map(|s| s.step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Validate plan invariants. Returns every violation found.
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.steps.is_empty() {
        errors.push("plan has no steps".to_string());
    }
    let mut previous: Option<u32> = None;
    for step in &plan.steps {
        if step.step_id == 0 {
            errors.push("step_id must be >= 1".to_string());
        }
        if let Some(prev) = previous
            && step.step_id <= prev
        {
            errors.push(format!(
                "step_id {} does not increase after {}",
                step.step_id, prev
            ));
        }
        previous = Some(step.step_id);
        if step.description.trim().is_empty() {
            errors.push(format!("step {} has an empty description", step.step_id));
        }
        if step.tool.trim().is_empty() {
            errors.push(format!("step {} has an empty tool", step.step_id));
        }
    }
    errors
}
