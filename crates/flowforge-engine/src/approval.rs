//! Approval requests and multi-party coordination
//!
//! Approval nodes suspend their instance; one request is opened per
//! approver. Decisions are aggregated under the node's policy and the
//! instance resumes only once the policy resolves, carrying the decision
//! into the run context for routing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use flowforge_core::{ApprovalId, ExecutionId, InstanceId};

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::instance::{ExecutionRepository, NodeExecution};
use crate::runner::InstanceRunner;
use crate::{Context, EngineError, Result};

/// How multiple approvers on one node are aggregated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Every approver must approve; one rejection rejects.
    #[default]
    All,
    /// First approval approves; rejection needs every approver.
    Any,
    /// Strict majority either way.
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Delegated,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// One approver's pending or settled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub instance_id: InstanceId,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub approver: String,
    pub status: ApprovalStatus,
    pub policy: AggregationPolicy,
    #[serde(default)]
    pub decision: Option<ApprovalDecision>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delegated_to: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        execution: &NodeExecution,
        approver: impl Into<String>,
        policy: AggregationPolicy,
        due_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: ApprovalId::new(),
            instance_id: execution.instance_id,
            execution_id: execution.id,
            node_id: execution.node_id.clone(),
            approver: approver.into(),
            status: ApprovalStatus::Pending,
            policy,
            decision: None,
            comment: None,
            due_date,
            delegated_to: None,
            created_at: Utc::now(),
            responded_at: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending
            && self.due_date.map_or(false, |due| due <= now)
    }
}

/// Options applied to every request of one approval round.
#[derive(Debug, Clone)]
pub struct ApprovalOptions {
    pub policy: AggregationPolicy,
    pub due_date: Option<DateTime<Utc>>,
}

/// Approval repository trait
#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn save(&self, request: &ApprovalRequest) -> Result<()>;
    async fn get(&self, id: ApprovalId) -> Result<Option<ApprovalRequest>>;
    async fn update(&self, request: &ApprovalRequest) -> Result<()>;
    async fn list_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ApprovalRequest>>;
    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>>;
}

/// In-memory approval repository
pub struct InMemoryApprovalRepository {
    requests: Arc<RwLock<HashMap<ApprovalId, ApprovalRequest>>>,
}

impl InMemoryApprovalRepository {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryApprovalRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn save(&self, request: &ApprovalRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: ApprovalId) -> Result<Option<ApprovalRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id).cloned())
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            requests.insert(request.id, request.clone());
            Ok(())
        } else {
            Err(EngineError::NotFound(request.id.to_string()))
        }
    }

    async fn list_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ApprovalRequest>> {
        let requests = self.requests.read().await;
        let mut found: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect())
    }
}

/// Coordinates approval rounds and feeds resolved decisions back into the
/// runner.
pub struct ApprovalCoordinator {
    requests: Arc<dyn ApprovalRepository>,
    executions: Arc<dyn ExecutionRepository>,
    runner: Arc<InstanceRunner>,
    audit: AuditLog,
}

impl ApprovalCoordinator {
    pub fn new(
        requests: Arc<dyn ApprovalRepository>,
        executions: Arc<dyn ExecutionRepository>,
        runner: Arc<InstanceRunner>,
        audit: AuditLog,
    ) -> Self {
        Self {
            requests,
            executions,
            runner,
            audit,
        }
    }

    /// Open one pending request per approver for a suspended execution.
    pub async fn request_approval(
        &self,
        execution: &NodeExecution,
        approvers: &[String],
        options: ApprovalOptions,
    ) -> Result<Vec<ApprovalRequest>> {
        let mut created = Vec::with_capacity(approvers.len());

        for approver in approvers {
            let request =
                ApprovalRequest::new(execution, approver, options.policy, options.due_date);
            self.requests.save(&request).await?;

            self.audit
                .record(
                    execution.instance_id,
                    AuditEvent::new(
                        AuditEventType::ApprovalRequested,
                        format!("Approval requested from {}", approver),
                    )
                    .with_node(&execution.node_id)
                    .with_details(json!({
                        "request_id": request.id,
                        "policy": options.policy,
                        "due_date": options.due_date,
                    })),
                )
                .await;

            created.push(request);
        }

        tracing::info!(
            instance_id = %execution.instance_id,
            node_id = %execution.node_id,
            approver_count = approvers.len(),
            policy = ?options.policy,
            "Approval round opened"
        );

        Ok(created)
    }

    /// Record one approver's decision and resume the instance if the
    /// aggregation policy resolves.
    pub async fn decide(
        &self,
        request_id: ApprovalId,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<()> {
        let mut request = self
            .requests
            .get(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval request {}", request_id)))?;

        if request.status != ApprovalStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "approval request {} is {:?}, not pending",
                request_id, request.status
            )));
        }

        request.status = match decision {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        };
        request.decision = Some(decision);
        request.comment = comment.clone();
        request.responded_at = Some(Utc::now());
        self.requests.update(&request).await?;

        self.audit
            .record(
                request.instance_id,
                AuditEvent::new(
                    AuditEventType::ApprovalDecision,
                    format!("{} decided {:?}", request.approver, decision),
                )
                .with_node(&request.node_id)
                .with_details(json!({
                    "request_id": request.id,
                    "decision": decision,
                    "comment": comment,
                })),
            )
            .await;

        tracing::info!(
            instance_id = %request.instance_id,
            node_id = %request.node_id,
            approver = %request.approver,
            decision = ?decision,
            "Approval decision recorded"
        );

        let Some(resolution) = self.resolve_policy(&request).await? else {
            return Ok(());
        };

        self.expire_round(&request).await?;
        self.stamp_execution(&request, resolution).await?;

        let mut resume_data = Context::new();
        resume_data.insert(
            "approval_decision".into(),
            json!(match resolution {
                ApprovalDecision::Approve => "approved",
                ApprovalDecision::Reject => "rejected",
            }),
        );
        resume_data.insert("approved_by".into(), json!(request.approver));
        if let Some(comment) = &request.comment {
            resume_data.insert("approval_comment".into(), json!(comment));
        }

        self.runner.resume(request.instance_id, resume_data).await
    }

    /// Hand a pending request to another approver.
    pub async fn delegate(
        &self,
        request_id: ApprovalId,
        new_approver: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<ApprovalRequest> {
        let mut request = self
            .requests
            .get(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval request {}", request_id)))?;

        if request.status != ApprovalStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "approval request {} is {:?}, not pending",
                request_id, request.status
            )));
        }

        let new_approver = new_approver.into();
        let delegated = ApprovalRequest {
            id: ApprovalId::new(),
            approver: new_approver.clone(),
            status: ApprovalStatus::Pending,
            decision: None,
            comment: None,
            delegated_to: None,
            created_at: Utc::now(),
            responded_at: None,
            ..request.clone()
        };

        request.status = ApprovalStatus::Delegated;
        request.delegated_to = Some(new_approver.clone());
        request.comment = Some(reason.into());
        request.responded_at = Some(Utc::now());
        self.requests.update(&request).await?;
        self.requests.save(&delegated).await?;

        self.audit
            .record(
                request.instance_id,
                AuditEvent::new(
                    AuditEventType::ApprovalRequested,
                    format!("Approval delegated from {} to {}", request.approver, new_approver),
                )
                .with_node(&request.node_id)
                .with_details(json!({"request_id": delegated.id})),
            )
            .await;

        tracing::info!(
            instance_id = %request.instance_id,
            from = %request.approver,
            to = %new_approver,
            "Approval request delegated"
        );

        Ok(delegated)
    }

    /// Mark overdue pending requests expired. Recording only; instances stay
    /// suspended until the deadline poller cancels or expires them.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalId>> {
        let pending = self.requests.list_pending().await?;
        let mut expired = Vec::new();

        for mut request in pending {
            if request.is_overdue(now) {
                request.status = ApprovalStatus::Expired;
                request.responded_at = Some(now);
                self.requests.update(&request).await?;
                expired.push(request.id);

                tracing::warn!(
                    instance_id = %request.instance_id,
                    approver = %request.approver,
                    "Approval request expired"
                );
            }
        }

        Ok(expired)
    }

    /// Aggregate the round; `Some` once the policy is mathematically settled.
    async fn resolve_policy(&self, request: &ApprovalRequest) -> Result<Option<ApprovalDecision>> {
        let round = self.requests.list_for_execution(request.execution_id).await?;
        // Delegated originals are replaced by their delegate's request and
        // expired requests no longer vote.
        let participants: Vec<&ApprovalRequest> = round
            .iter()
            .filter(|r| {
                !matches!(r.status, ApprovalStatus::Delegated | ApprovalStatus::Expired)
            })
            .collect();

        let total = participants.len();
        let approved = participants
            .iter()
            .filter(|r| r.status == ApprovalStatus::Approved)
            .count();
        let rejected = participants
            .iter()
            .filter(|r| r.status == ApprovalStatus::Rejected)
            .count();

        let resolution = match request.policy {
            AggregationPolicy::Any => {
                if approved >= 1 {
                    Some(ApprovalDecision::Approve)
                } else if rejected == total {
                    Some(ApprovalDecision::Reject)
                } else {
                    None
                }
            }
            AggregationPolicy::All => {
                if rejected >= 1 {
                    Some(ApprovalDecision::Reject)
                } else if approved == total {
                    Some(ApprovalDecision::Approve)
                } else {
                    None
                }
            }
            AggregationPolicy::Majority => {
                let needed = total / 2 + 1;
                if approved >= needed {
                    Some(ApprovalDecision::Approve)
                } else if rejected + needed > total {
                    // Approval can no longer reach the threshold.
                    Some(ApprovalDecision::Reject)
                } else {
                    None
                }
            }
        };

        Ok(resolution)
    }

    /// Expire requests left pending once the round resolved.
    async fn expire_round(&self, request: &ApprovalRequest) -> Result<()> {
        let round = self.requests.list_for_execution(request.execution_id).await?;
        for mut sibling in round {
            if sibling.status == ApprovalStatus::Pending {
                sibling.status = ApprovalStatus::Expired;
                sibling.responded_at = Some(Utc::now());
                self.requests.update(&sibling).await?;
            }
        }
        Ok(())
    }

    async fn stamp_execution(
        &self,
        request: &ApprovalRequest,
        resolution: ApprovalDecision,
    ) -> Result<()> {
        if let Some(mut execution) = self.executions.get(request.execution_id).await? {
            execution.approval_status = Some(
                match resolution {
                    ApprovalDecision::Approve => "approved",
                    ApprovalDecision::Reject => "rejected",
                }
                .to_string(),
            );
            execution.approved_by = Some(request.approver.clone());
            execution.approval_comment = request.comment.clone();
            self.executions.update(&execution).await?;
        }
        Ok(())
    }
}
