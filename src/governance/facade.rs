//! Governance facade.
//!
//! Wires the audit ledger, tenure guard, quorum verifier and approval engine
//! to the consensus loop on one side and to RPC/CLI callers on the other.
//! Finalized requests and ledger entries are archived through an
//! [`ArchiveStore`].

use crate::approval::{
    ApprovalEngine, ApprovalPolicy, ApprovalRequest, DecisionOutcome, MultiSigProof,
    OperationKind, RequestId, RequestStatus,
};
use crate::audit::{
    ArchiveStore, AuditEntry, AuditFilter, AuditLedger, ByzantineDetector, ByzantineSuspicion,
    EntryId, MemoryStore, RoundObservation, RoundVerdict, Severity,
};
use crate::config::{ByzantineResponse, GovernanceConfig};
use crate::consensus::{
    LeaderTenureGuard, QuorumAnswer, QuorumFraction, QuorumVerifier, ReplicaLogView, TenureCheck,
};
use crate::core::{Clock, Error, IdentityId, Result, SystemClock};
use crate::governance::events::{
    EventBus, GovernanceEvent, StepDownReason, StepDownRequest, StepDownSink, TracingSink,
};
use crate::identity::{
    AllowAll, CapabilityChecker, Ed25519Service, PublicIdentity, SignatureService,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Descriptor carried by leader revocation requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationDescriptor {
    /// Leader to revoke
    pub leader: IdentityId,
    /// Term it held
    pub term: u64,
    /// Detection that prompted the request, if any
    pub detection: Option<EntryId>,
    /// Free-form reason
    pub reason: String,
}

impl RevocationDescriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builder for [`GovernanceFacade`].
pub struct GovernanceBuilder {
    config: GovernanceConfig,
    signatures: Arc<dyn SignatureService>,
    capabilities: Arc<dyn CapabilityChecker>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ArchiveStore>,
    sink: Arc<dyn StepDownSink>,
    replicas: Vec<Arc<dyn ReplicaLogView>>,
    event_capacity: usize,
}

impl GovernanceBuilder {
    pub fn signatures(mut self, signatures: Arc<dyn SignatureService>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn capabilities(mut self, capabilities: Arc<dyn CapabilityChecker>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, store: Arc<dyn ArchiveStore>) -> Self {
        self.store = store;
        self
    }

    pub fn step_down_sink(mut self, sink: Arc<dyn StepDownSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replicas consulted by quorum reads.
    pub fn replicas(mut self, replicas: Vec<Arc<dyn ReplicaLogView>>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration and assemble the facade.
    pub fn build(self) -> Result<GovernanceFacade> {
        self.config.validate()?;
        let engine = ApprovalEngine::new(
            self.config.approval.clone(),
            self.signatures.clone(),
            self.capabilities,
            self.clock.clone(),
        );
        let detector = ByzantineDetector::new(self.config.audit.grace_period_ms, self.signatures);
        let quorum = QuorumVerifier::new(self.replicas, &self.config.quorum);

        Ok(GovernanceFacade {
            system_identity: IdentityId::new(&self.config.system_identity),
            engine,
            ledger: Mutex::new(AuditLedger::new(self.config.audit.max_entries)),
            detector,
            tenure: Mutex::new(LeaderTenureGuard::new(self.config.tenure.max_tenure_secs)),
            quorum,
            store: self.store,
            sink: self.sink,
            events: EventBus::new(self.event_capacity),
            archiving: Mutex::new(HashSet::new()),
            clock: self.clock,
            config: self.config,
        })
    }
}

/// Governance facade.
pub struct GovernanceFacade {
    config: GovernanceConfig,
    system_identity: IdentityId,
    engine: ApprovalEngine,
    ledger: Mutex<AuditLedger>,
    detector: ByzantineDetector,
    tenure: Mutex<LeaderTenureGuard>,
    quorum: QuorumVerifier,
    store: Arc<dyn ArchiveStore>,
    sink: Arc<dyn StepDownSink>,
    events: EventBus,
    archiving: Mutex<HashSet<RequestId>>,
    clock: Arc<dyn Clock>,
}

impl GovernanceFacade {
    /// Start a builder with default wiring: Ed25519 signatures, no capability
    /// checks, wall clock, in-memory archive, logging step-down sink.
    pub fn builder(config: GovernanceConfig) -> GovernanceBuilder {
        GovernanceBuilder {
            config,
            signatures: Arc::new(Ed25519Service),
            capabilities: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(TracingSink),
            replicas: Vec::new(),
            event_capacity: 256,
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Underlying approval engine.
    pub fn engine(&self) -> &ApprovalEngine {
        &self.engine
    }

    pub fn register_policy(&self, policy: ApprovalPolicy) -> Result<()> {
        self.engine.register_policy(policy).map(|_| ())
    }

    pub fn register_identity(&self, identity: PublicIdentity) -> Result<()> {
        self.engine.register_identity(identity)
    }

    /// Subscribe to operational events.
    pub fn subscribe(&self) -> broadcast::Receiver<GovernanceEvent> {
        self.events.subscribe()
    }

    // Consensus-facing hooks

    /// Evaluate a completed round and apply the configured response.
    pub async fn on_round_complete(&self, mut observation: RoundObservation) -> Result<RoundVerdict> {
        if observation.leader_key.is_none() {
            observation.leader_key = self.engine.public_key(&observation.leader);
        }

        let (verdict, entry) = {
            let mut ledger = lock(&self.ledger);
            let verdict = self.detector.evaluate_round(&mut ledger, observation)?;
            let entry = ledger.get(verdict.entry_id()).cloned();
            (verdict, entry)
        };
        if let Some(entry) = &entry {
            self.store.archive_entry(entry).await?;
        }

        match &verdict {
            RoundVerdict::Consistent { .. } => {}
            RoundVerdict::Inconclusive { reported, entry_id } => {
                let round = entry.map(|e| e.round);
                debug!(entry = %entry_id, reported, "inconclusive round reported");
                if let Some(round) = round {
                    self.events.publish(GovernanceEvent::RoundInconclusive {
                        round,
                        reported: *reported,
                    });
                }
            }
            RoundVerdict::Divergent(suspicion) => {
                self.events
                    .publish(GovernanceEvent::ByzantineSuspected(suspicion.clone()));
                self.respond_to_divergence(suspicion);
            }
        }
        Ok(verdict)
    }

    fn respond_to_divergence(&self, suspicion: &ByzantineSuspicion) {
        let automatic = match self.config.audit.response {
            ByzantineResponse::ReportOnly => return,
            ByzantineResponse::AutoRevokeClear => suspicion.severity == Severity::Clear,
            ByzantineResponse::AlwaysApproval => false,
        };

        if automatic {
            self.step_down(StepDownRequest {
                leader: suspicion.leader.clone(),
                term: suspicion.term,
                reason: StepDownReason::ByzantineDetected {
                    entry_id: suspicion.entry_id,
                },
            });
            if let Err(e) = lock(&self.ledger).resolve_detection(suspicion.entry_id) {
                warn!(entry = %suspicion.entry_id, error = %e, "could not resolve detection");
            }
            return;
        }

        let descriptor = RevocationDescriptor {
            leader: suspicion.leader.clone(),
            term: suspicion.term,
            detection: Some(suspicion.entry_id),
            reason: format!(
                "{} divergence at index {}",
                suspicion.severity, suspicion.index
            ),
        };
        match self.open_revocation(&descriptor) {
            Ok(request_id) => {
                info!(request = %request_id, leader = %suspicion.leader, "revocation routed to approvers");
            }
            Err(e) => {
                warn!(leader = %suspicion.leader, error = %e, "could not open revocation request");
            }
        }
    }

    /// Open a leader revocation request on behalf of the system identity.
    pub fn open_revocation(&self, descriptor: &RevocationDescriptor) -> Result<RequestId> {
        let request_id = self.engine.create_request(
            &OperationKind::RevokeLeader,
            &self.system_identity,
            descriptor.to_bytes()?,
        )?;
        self.events.publish(GovernanceEvent::RevocationRequested {
            request_id: request_id.clone(),
            leader: descriptor.leader.clone(),
            term: descriptor.term,
        });
        Ok(request_id)
    }

    /// Record a leadership change.
    pub fn on_leader_change(&self, leader: &str, term: u64) {
        let leader = IdentityId::new(leader);
        lock(&self.tenure).on_leader_change(&leader, term, self.clock.now());
        self.events
            .publish(GovernanceEvent::LeaderChanged { leader, term });
    }

    /// Run one tenure check; signals a step-down when tenure is exceeded.
    pub fn tick_tenure(&self) -> TenureCheck {
        let check = lock(&self.tenure).check(self.clock.now());
        if let TenureCheck::StepDownRequired {
            leader,
            term,
            held_for,
        } = &check
        {
            self.step_down(StepDownRequest {
                leader: leader.clone(),
                term: *term,
                reason: StepDownReason::TenureExceeded {
                    held_secs: held_for.num_seconds(),
                },
            });
        }
        check
    }

    fn step_down(&self, request: StepDownRequest) {
        self.sink.request_step_down(request.clone());
        self.events
            .publish(GovernanceEvent::StepDownRequested(request));
    }

    /// Release a detection once handled.
    pub fn resolve_detection(&self, entry_id: EntryId) -> Result<()> {
        lock(&self.ledger).resolve_detection(entry_id)
    }

    /// Query the in-memory ledger.
    pub fn audit_entries(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        lock(&self.ledger).query(filter)
    }

    /// Detections still pinned.
    pub fn unresolved_detections(&self) -> Vec<AuditEntry> {
        lock(&self.ledger)
            .unresolved_detections()
            .into_iter()
            .cloned()
            .collect()
    }

    // Caller-facing operations

    pub fn create_request(
        &self,
        kind: &OperationKind,
        initiator: &str,
        descriptor: Vec<u8>,
    ) -> Result<RequestId> {
        self.engine
            .create_request(kind, &IdentityId::new(initiator), descriptor)
    }

    /// Record a signed approval. The engine's outcome is returned even when
    /// archiving the finalized request fails; the expiry sweep retries it.
    pub async fn approve(
        &self,
        request_id: &RequestId,
        approver: &str,
        signature: &[u8],
    ) -> Result<DecisionOutcome> {
        let result = self
            .engine
            .approve(request_id, &IdentityId::new(approver), signature);
        self.try_archive(request_id).await;
        result
    }

    pub async fn deny(
        &self,
        request_id: &RequestId,
        approver: &str,
        reason: &str,
    ) -> Result<DecisionOutcome> {
        let result = self
            .engine
            .deny(request_id, &IdentityId::new(approver), reason);
        self.try_archive(request_id).await;
        result
    }

    pub async fn revoke(&self, request_id: &RequestId, approver: &str) -> Result<DecisionOutcome> {
        let result = self.engine.revoke(request_id, &IdentityId::new(approver));
        self.try_archive(request_id).await;
        result
    }

    /// Re-check a dynamic-quorum request after its window closed.
    pub async fn evaluate_dynamic_quorum(&self, request_id: &RequestId) -> Result<RequestStatus> {
        let result = self.engine.evaluate_dynamic_quorum(request_id);
        self.try_archive(request_id).await;
        result
    }

    /// Status from the engine, falling back to the archive for requests
    /// no longer held in memory.
    pub async fn get_status(&self, request_id: &RequestId) -> Result<RequestStatus> {
        match self.engine.get_status(request_id) {
            Err(Error::NotFound(_)) => Ok(self.load_archived(request_id).await?.status()),
            other => other,
        }
    }

    pub async fn get_proof(&self, request_id: &RequestId) -> Result<MultiSigProof> {
        match self.engine.get_proof(request_id) {
            Err(Error::NotFound(_)) => {
                let request = self.load_archived(request_id).await?;
                request.proof().cloned().ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "request {} is {}, proof exists only once approved",
                        request_id,
                        request.status()
                    ))
                })
            }
            other => other,
        }
    }

    pub async fn get_request(&self, request_id: &RequestId) -> Result<ApprovalRequest> {
        match self.engine.get_request(request_id) {
            Err(Error::NotFound(_)) => self.load_archived(request_id).await,
            other => other,
        }
    }

    async fn load_archived(&self, request_id: &RequestId) -> Result<ApprovalRequest> {
        self.store
            .load_request(request_id)
            .await?
            .ok_or_else(|| Error::NotFound(request_id.to_string()))
    }

    /// Quorum read at `index`.
    pub async fn query_with_quorum(
        &self,
        index: u64,
        fraction: Option<QuorumFraction>,
    ) -> Result<QuorumAnswer> {
        self.quorum.query_with_quorum(index, fraction).await
    }

    /// Expire overdue requests, then archive and retire every terminal
    /// request still held in memory. Returns the requests this sweep
    /// expired. Archive failures are reported and left for the next sweep.
    pub async fn sweep_expired(&self) -> Vec<RequestId> {
        let expired = self.engine.sweep_expired();
        for request_id in self.engine.finalized() {
            self.try_archive(&request_id).await;
        }
        expired
    }

    async fn try_archive(&self, request_id: &RequestId) {
        if let Err(e) = self.archive_if_terminal(request_id).await {
            warn!(request = %request_id, error = %e, "archiving finalized request failed");
            self.events.publish(GovernanceEvent::ArchiveFailed {
                request_id: request_id.clone(),
                error: e.to_string(),
            });
        }
    }

    /// Archive a terminal request, retire it from the engine, publish its
    /// outcome and enact an approved revocation.
    async fn archive_if_terminal(&self, request_id: &RequestId) -> Result<()> {
        let request = match self.engine.live_request(request_id) {
            Some(request) if request.status().is_terminal() => request,
            _ => return Ok(()),
        };
        if !lock(&self.archiving).insert(request_id.clone()) {
            return Ok(());
        }

        let archived = self.store.archive_request(&request).await;
        let retired = archived.and_then(|_| self.engine.retire(request_id));
        lock(&self.archiving).remove(request_id);
        retired?;

        self.events.publish(GovernanceEvent::RequestFinalized {
            request_id: request_id.clone(),
            kind: request.kind.clone(),
            status: request.status(),
        });

        if request.kind == OperationKind::RevokeLeader
            && request.status() == RequestStatus::Approved
        {
            self.enact_revocation(&request);
        }
        Ok(())
    }

    fn enact_revocation(&self, request: &ApprovalRequest) {
        let descriptor = match RevocationDescriptor::from_bytes(&request.descriptor) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(request = %request.id, error = %e, "approved revocation has no usable descriptor");
                return;
            }
        };
        info!(request = %request.id, leader = %descriptor.leader, "approved revocation enacted");
        self.step_down(StepDownRequest {
            leader: descriptor.leader,
            term: descriptor.term,
            reason: StepDownReason::RevocationApproved {
                request_id: request.id.clone(),
            },
        });
        if let Some(entry_id) = descriptor.detection {
            if let Err(e) = lock(&self.ledger).resolve_detection(entry_id) {
                debug!(entry = %entry_id, error = %e, "detection already rotated or resolved");
            }
        }
    }

    // Background tasks

    /// Run `tick_tenure` on the configured interval.
    pub fn spawn_tenure_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let facade = Arc::clone(self);
        let period = Duration::from_secs(self.config.tenure.check_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                facade.tick_tenure();
            }
        })
    }

    /// Run `sweep_expired` on the configured interval.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let facade = Arc::clone(self);
        let period = Duration::from_secs(self.config.approval.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                facade.sweep_expired().await;
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
