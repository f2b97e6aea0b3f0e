//! Approval channel for RISKY and DANGEROUS steps.
//!
//! The pipeline blocks the affected step on [`ApprovalChannel::approve`]. A
//! `false` answer fails the step without touching the sandbox.

use crate::core::permission::Classification;
use crate::core::types::{RiskLevel, Step};

/// What the approver is asked about.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalRequest<'a> {
    pub task_id: &'a str,
    pub step: &'a Step,
    pub classification: &'a Classification,
}

pub trait ApprovalChannel: Send + Sync {
    fn approve(&self, request: &ApprovalRequest<'_>) -> bool;
}

/// Grants everything (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ApprovalChannel for AutoApprove {
    fn approve(&self, _: &ApprovalRequest<'_>) -> bool {
        true
    }
}

/// Denies everything that needs approval (`--deny`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl ApprovalChannel for DenyAll {
    fn approve(&self, _: &ApprovalRequest<'_>) -> bool {
        false
    }
}

/// Grants steps up to and including `max`.
#[derive(Debug, Clone, Copy)]
pub struct ApproveUpTo(pub RiskLevel);

impl ApprovalChannel for ApproveUpTo {
    fn approve(&self, request: &ApprovalRequest<'_>) -> bool {
        request.classification.risk <= self.0
    }
}
