//! Approval engine: the m-of-n / weighted / dynamic-quorum state machine.
//!
//! Requests are independently addressable records. Each sits behind its own
//! mutex, so decisions on one request are serialized while different requests
//! proceed in parallel. Threshold checks and the terminal transition happen
//! under that lock as one step.

use crate::approval::policy::{ApprovalPolicy, OperationKind, PolicyRegistry};
use crate::approval::proof::MultiSigProof;
use crate::approval::request::{ApprovalRequest, Decision, RequestId, RequestStatus, Side};
use crate::config::ApprovalConfig;
use crate::core::{Clock, Error, Hash256, IdentityId, Result, SystemClock};
use crate::identity::{
    AllowAll, CapabilityChecker, Ed25519Service, KeyDirectory, PublicIdentity, PublicKeyLookup,
    SignatureService,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Result of a decision or revocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionOutcome {
    /// Request acted on
    pub request_id: RequestId,
    /// Status after the call
    pub status: RequestStatus,
    /// Approved points after the call
    pub approved_points: u64,
    /// Denied count after the call
    pub denied_count: u32,
    /// True when this call moved the request to a terminal state
    pub finalized: bool,
}

impl DecisionOutcome {
    fn of(request: &ApprovalRequest, finalized: bool) -> Self {
        Self {
            request_id: request.id.clone(),
            status: request.status(),
            approved_points: request.approved_points(),
            denied_count: request.denied_count(),
            finalized,
        }
    }
}

type Handle = Arc<Mutex<ApprovalRequest>>;

/// Archived terminal requests kept for reads, oldest evicted first.
struct Retired {
    order: VecDeque<RequestId>,
    records: HashMap<RequestId, ApprovalRequest>,
    capacity: usize,
}

impl Retired {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            records: HashMap::new(),
            capacity,
        }
    }

    fn insert(&mut self, request: ApprovalRequest) {
        if self.capacity == 0 {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
        self.order.push_back(request.id.clone());
        self.records.insert(request.id.clone(), request);
    }

    fn get(&self, id: &RequestId) -> Option<&ApprovalRequest> {
        self.records.get(id)
    }
}

/// Approval engine.
pub struct ApprovalEngine {
    policies: RwLock<PolicyRegistry>,
    requests: RwLock<HashMap<RequestId, Handle>>,
    retired: RwLock<Retired>,
    directory: RwLock<KeyDirectory>,
    signatures: Arc<dyn SignatureService>,
    capabilities: Arc<dyn CapabilityChecker>,
    clock: Arc<dyn Clock>,
    config: ApprovalConfig,
}

impl ApprovalEngine {
    /// Create an engine with explicit collaborators.
    pub fn new(
        config: ApprovalConfig,
        signatures: Arc<dyn SignatureService>,
        capabilities: Arc<dyn CapabilityChecker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies: RwLock::new(PolicyRegistry::new()),
            requests: RwLock::new(HashMap::new()),
            retired: RwLock::new(Retired::new(config.retained_closed)),
            directory: RwLock::new(KeyDirectory::new()),
            signatures,
            capabilities,
            clock,
            config,
        }
    }

    /// Register a policy.
    pub fn register_policy(&self, policy: ApprovalPolicy) -> Result<Arc<ApprovalPolicy>> {
        let policy = write(&self.policies).register(policy)?;
        info!(policy = %policy.id, kind = %policy.kind, approvers = policy.approvers.len(), "policy registered");
        Ok(policy)
    }

    /// Register an approver's public identity.
    pub fn register_identity(&self, identity: PublicIdentity) -> Result<()> {
        write(&self.directory).register(identity)
    }

    /// Snapshot of the identity directory.
    pub fn directory(&self) -> KeyDirectory {
        read(&self.directory).clone()
    }

    /// Registered public key of an identity.
    pub fn public_key(&self, id: &IdentityId) -> Option<[u8; 32]> {
        read(&self.directory).public_key(id)
    }

    /// Policy governing an operation kind.
    pub fn policy_for(&self, kind: &OperationKind) -> Option<Arc<ApprovalPolicy>> {
        read(&self.policies).for_kind(kind)
    }

    /// Hash approvers sign for an operation.
    pub fn operation_hash(&self, kind: &OperationKind, descriptor: &[u8]) -> Hash256 {
        let mut bytes = Vec::with_capacity(kind.label().len() + 1 + descriptor.len());
        bytes.extend_from_slice(kind.label().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(descriptor);
        self.signatures.hash(&bytes)
    }

    /// Open a request for a privileged operation.
    pub fn create_request(
        &self,
        kind: &OperationKind,
        initiator: &IdentityId,
        descriptor: Vec<u8>,
    ) -> Result<RequestId> {
        let policy = self
            .policy_for(kind)
            .ok_or_else(|| Error::PolicyNotFound(kind.to_string()))?;
        if descriptor.is_empty() {
            return Err(Error::InvalidOperation("empty operation descriptor".into()));
        }
        if !self
            .capabilities
            .has_permission(initiator, &policy.required_permission)
        {
            return Err(Error::Unauthorized(initiator.to_string()));
        }

        let operation_hash = self.operation_hash(kind, &descriptor);
        let id = RequestId::generate();
        let request = ApprovalRequest::new(
            id.clone(),
            &policy,
            initiator.clone(),
            descriptor,
            operation_hash,
            self.clock.now(),
        );
        info!(
            request = %id,
            kind = %kind,
            initiator = %initiator,
            deadline = %request.deadline,
            "approval request created"
        );
        write(&self.requests).insert(id.clone(), Arc::new(Mutex::new(request)));
        Ok(id)
    }

    /// Record a signed approval.
    pub fn approve(
        &self,
        request_id: &RequestId,
        approver: &IdentityId,
        signature: &[u8],
    ) -> Result<DecisionOutcome> {
        let (policy, handle) = self.lookup(request_id)?;
        let mut request = lock(&handle);
        self.admit_decision(&mut request, &policy, approver)?;

        let key = read(&self.directory)
            .public_key(approver)
            .ok_or_else(|| Error::InvalidProof(format!("no public key for {}", approver)))?;
        if !self
            .signatures
            .verify(request.operation_hash.as_bytes(), signature, &key)
        {
            warn!(request = %request_id, approver = %approver, "approval signature rejected");
            return Err(Error::InvalidProof(format!(
                "signature from {} does not cover the operation hash",
                approver
            )));
        }

        let now = self.clock.now();
        request.record(
            approver,
            Decision::Approved {
                signature: signature.to_vec(),
            },
            now,
        );
        debug!(request = %request_id, approver = %approver, points = request.approved_points(), "approval recorded");
        Ok(self.settle(&mut request, &policy, Side::Approve))
    }

    /// Record a denial.
    pub fn deny(
        &self,
        request_id: &RequestId,
        approver: &IdentityId,
        reason: &str,
    ) -> Result<DecisionOutcome> {
        let (policy, handle) = self.lookup(request_id)?;
        let mut request = lock(&handle);
        self.admit_decision(&mut request, &policy, approver)?;

        let now = self.clock.now();
        request.record(
            approver,
            Decision::Denied {
                reason: reason.to_string(),
            },
            now,
        );
        debug!(request = %request_id, approver = %approver, denied = request.denied_count(), "denial recorded");
        Ok(self.settle(&mut request, &policy, Side::Deny))
    }

    /// Withdraw a decision while the request is still pending.
    pub fn revoke(&self, request_id: &RequestId, approver: &IdentityId) -> Result<DecisionOutcome> {
        let (policy, handle) = match self.lookup(request_id) {
            Err(Error::Expired(id)) => return Err(Error::TooLate(id)),
            other => other?,
        };
        let mut request = lock(&handle);
        if !request.is_eligible(approver) {
            return Err(Error::Unauthorized(approver.to_string()));
        }
        if request.expire_if_due(self.clock.now()) {
            info!(request = %request_id, "approval request expired");
        }
        if request.status().is_terminal() {
            return Err(Error::TooLate(request_id.to_string()));
        }
        match request.clear(approver) {
            Some(_) => {
                debug!(request = %request_id, approver = %approver, "decision revoked");
                // A smaller respondent set can lower a dynamic threshold
                Ok(self.settle(&mut request, &policy, Side::Approve))
            }
            None => Err(Error::InvalidOperation(format!(
                "{} has no decision to revoke",
                approver
            ))),
        }
    }

    /// Re-check a dynamic-quorum request once its availability window closed.
    pub fn evaluate_dynamic_quorum(&self, request_id: &RequestId) -> Result<RequestStatus> {
        let (policy, handle) = match self.lookup(request_id) {
            Err(Error::Expired(_)) => return self.retired_status(request_id),
            other => other?,
        };
        if !policy.is_dynamic() {
            return Err(Error::InvalidPolicy(format!(
                "{} is not a dynamic-quorum policy",
                policy.id
            )));
        }
        let mut request = lock(&handle);
        let now = self.clock.now();
        if request.expire_if_due(now) {
            info!(request = %request_id, "approval request expired");
        }
        if request.status().is_terminal() {
            return Ok(request.status());
        }
        if !request.window_closed(now) {
            return Err(Error::WindowOpen(request_id.to_string()));
        }
        Ok(self.settle(&mut request, &policy, Side::Approve).status)
    }

    /// Expire the request if its deadline passed. Idempotent.
    pub fn check_expiry(&self, request_id: &RequestId) -> Result<RequestStatus> {
        let handle = match self.handle(request_id) {
            Ok(handle) => handle,
            Err(_) => return self.retired_status(request_id),
        };
        let mut request = lock(&handle);
        if request.expire_if_due(self.clock.now()) {
            info!(request = %request_id, "approval request expired");
        }
        Ok(request.status())
    }

    /// Current status, applying lazy expiry.
    pub fn get_status(&self, request_id: &RequestId) -> Result<RequestStatus> {
        self.check_expiry(request_id)
    }

    /// Proof of an approved request.
    pub fn get_proof(&self, request_id: &RequestId) -> Result<MultiSigProof> {
        let request = self.get_request(request_id)?;
        match (request.status(), request.proof()) {
            (RequestStatus::Approved, Some(proof)) => Ok(proof.clone()),
            (status, _) => Err(Error::InvalidOperation(format!(
                "request {} is {}, proof exists only once approved",
                request_id, status
            ))),
        }
    }

    /// Snapshot of a request.
    pub fn get_request(&self, request_id: &RequestId) -> Result<ApprovalRequest> {
        if let Some(request) = self.live_request(request_id) {
            return Ok(request);
        }
        read(&self.retired)
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(request_id.to_string()))
    }

    /// Snapshot of a request still held in the live map.
    pub fn live_request(&self, request_id: &RequestId) -> Option<ApprovalRequest> {
        let handle = self.handle(request_id).ok()?;
        let request = lock(&handle).clone();
        Some(request)
    }

    /// Move a terminal request out of the live map once it is archived.
    /// The most recent `retained_closed` retired requests stay readable.
    pub fn retire(&self, request_id: &RequestId) -> Result<()> {
        let mut requests = write(&self.requests);
        let handle = requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(request_id.to_string()))?;
        let snapshot = {
            let request = lock(&handle);
            if !request.status().is_terminal() {
                return Err(Error::InvalidOperation(format!(
                    "request {} is still pending",
                    request_id
                )));
            }
            request.clone()
        };
        requests.remove(request_id);
        drop(requests);

        write(&self.retired).insert(snapshot);
        debug!(request = %request_id, "request retired from live set");
        Ok(())
    }

    /// IDs of requests still pending.
    pub fn pending(&self) -> Vec<RequestId> {
        self.handles()
            .into_iter()
            .filter(|(_, h)| lock(h).status() == RequestStatus::Pending)
            .map(|(id, _)| id)
            .collect()
    }

    /// IDs of requests in a terminal state.
    pub fn finalized(&self) -> Vec<RequestId> {
        self.handles()
            .into_iter()
            .filter(|(_, h)| lock(h).status().is_terminal())
            .map(|(id, _)| id)
            .collect()
    }

    /// Expire every request past its deadline. Returns the ones this sweep
    /// transitioned.
    pub fn sweep_expired(&self) -> Vec<RequestId> {
        let now = self.clock.now();
        let expired: Vec<RequestId> = self
            .handles()
            .into_iter()
            .filter(|(_, h)| lock(h).expire_if_due(now))
            .map(|(id, _)| id)
            .collect();
        if !expired.is_empty() {
            info!(count = expired.len(), "expiry sweep closed requests");
        }
        expired
    }

    /// Number of requests in the live map.
    pub fn request_count(&self) -> usize {
        read(&self.requests).len()
    }

    /// Number of retired requests still readable.
    pub fn retired_count(&self) -> usize {
        read(&self.retired).records.len()
    }

    fn handles(&self) -> Vec<(RequestId, Handle)> {
        read(&self.requests)
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect()
    }

    fn handle(&self, request_id: &RequestId) -> Result<Handle> {
        read(&self.requests)
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(request_id.to_string()))
    }

    fn retired_status(&self, request_id: &RequestId) -> Result<RequestStatus> {
        read(&self.retired)
            .get(request_id)
            .map(|r| r.status())
            .ok_or_else(|| Error::NotFound(request_id.to_string()))
    }

    /// Policy and handle of a live request. A retired request is terminal,
    /// so decisions on it fail with `Expired`.
    fn lookup(&self, request_id: &RequestId) -> Result<(Arc<ApprovalPolicy>, Handle)> {
        let handle = match self.handle(request_id) {
            Ok(handle) => handle,
            Err(e) => {
                return Err(match self.retired_status(request_id) {
                    Ok(_) => Error::Expired(request_id.to_string()),
                    Err(_) => e,
                })
            }
        };
        let policy_id = lock(&handle).policy_id.clone();
        let policy = read(&self.policies)
            .get(&policy_id)
            .ok_or_else(|| Error::PolicyNotFound(policy_id.to_string()))?;
        Ok((policy, handle))
    }

    /// Checks shared by approve and deny, in order: eligibility, expiry,
    /// terminal state, duplicate decision, optional capability re-check.
    fn admit_decision(
        &self,
        request: &mut ApprovalRequest,
        policy: &ApprovalPolicy,
        approver: &IdentityId,
    ) -> Result<()> {
        if !request.is_eligible(approver) {
            return Err(Error::Unauthorized(approver.to_string()));
        }
        if request.expire_if_due(self.clock.now()) {
            info!(request = %request.id, "approval request expired");
        }
        if request.status().is_terminal() {
            return Err(Error::Expired(request.id.to_string()));
        }
        if request
            .slot(approver)
            .is_some_and(|slot| slot.decision.is_some())
        {
            return Err(Error::AlreadyActed(approver.to_string()));
        }
        if self.config.revalidate_permissions
            && !self
                .capabilities
                .has_permission(approver, &policy.required_permission)
        {
            return Err(Error::Unauthorized(approver.to_string()));
        }
        Ok(())
    }

    fn settle(
        &self,
        request: &mut ApprovalRequest,
        policy: &ApprovalPolicy,
        first: Side,
    ) -> DecisionOutcome {
        let now = self.clock.now();
        match request.resolve(policy, now, first) {
            Some(resolution) => {
                request.finalize(resolution, now);
                info!(
                    request = %request.id,
                    status = %request.status(),
                    approved = request.approved_points(),
                    denied = request.denied_count(),
                    required = resolution.required,
                    "approval request finalized"
                );
                DecisionOutcome::of(request, true)
            }
            None => DecisionOutcome::of(request, false),
        }
    }
}

impl Default for ApprovalEngine {
    fn default() -> Self {
        Self::new(
            ApprovalConfig::default(),
            Arc::new(Ed25519Service),
            Arc::new(AllowAll),
            Arc::new(SystemClock),
        )
    }
}

fn lock(handle: &Handle) -> MutexGuard<'_, ApprovalRequest> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::identity::{KeyPair, StaticCapabilities};

    const FIVE: [&str; 5] = ["alice", "bob", "carol", "dave", "erin"];

    struct Harness {
        engine: ApprovalEngine,
        clock: ManualClock,
        keys: HashMap<String, KeyPair>,
    }

    impl Harness {
        fn new(policy: ApprovalPolicy) -> Self {
            Self::with_config(policy, ApprovalConfig::default(), Arc::new(AllowAll))
        }

        fn with_config(
            policy: ApprovalPolicy,
            config: ApprovalConfig,
            capabilities: Arc<dyn CapabilityChecker>,
        ) -> Self {
            let clock = ManualClock::default();
            let engine = ApprovalEngine::new(
                config,
                Arc::new(Ed25519Service),
                capabilities,
                Arc::new(clock.clone()),
            );
            let mut keys = HashMap::new();
            for name in FIVE {
                let pair = KeyPair::generate();
                engine
                    .register_identity(PublicIdentity::new(name, &pair))
                    .unwrap();
                keys.insert(name.to_string(), pair);
            }
            engine.register_policy(policy).unwrap();
            Self {
                engine,
                clock,
                keys,
            }
        }

        fn open(&self, kind: OperationKind) -> RequestId {
            self.engine
                .create_request(&kind, &IdentityId::from("ops"), b"target=n3".to_vec())
                .unwrap()
        }

        fn sign(&self, id: &RequestId, who: &str) -> Vec<u8> {
            let request = self.engine.get_request(id).unwrap();
            self.keys[who].sign(request.operation_hash.as_bytes())
        }

        fn approve(&self, id: &RequestId, who: &str) -> Result<DecisionOutcome> {
            let signature = self.sign(id, who);
            self.engine.approve(id, &IdentityId::from(who), &signature)
        }

        fn deny(&self, id: &RequestId, who: &str) -> Result<DecisionOutcome> {
            self.engine.deny(id, &IdentityId::from(who), "not justified")
        }
    }

    fn three_of_five() -> ApprovalPolicy {
        ApprovalPolicy::fixed("rb", OperationKind::Rollback, &FIVE, 3)
            .with_deny_threshold(2)
            .with_timeout_secs(600)
    }

    #[test]
    fn test_approved_exactly_at_threshold() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);

        assert_eq!(h.approve(&id, "alice").unwrap().status, RequestStatus::Pending);
        assert_eq!(h.approve(&id, "bob").unwrap().status, RequestStatus::Pending);
        let outcome = h.approve(&id, "carol").unwrap();
        assert_eq!(outcome.status, RequestStatus::Approved);
        assert!(outcome.finalized);
        assert_eq!(outcome.approved_points, 3);

        let proof = h.engine.get_proof(&id).unwrap();
        assert_eq!(proof.signature_count(), 3);
        assert!(proof.verify(&Ed25519Service, &h.engine.directory(), 3).valid);
    }

    #[test]
    fn test_outcome_order_independent() {
        let orders = [
            ["alice", "bob", "carol"],
            ["carol", "alice", "bob"],
            ["bob", "carol", "alice"],
        ];
        for order in orders {
            let h = Harness::new(three_of_five());
            let id = h.open(OperationKind::Rollback);
            for (i, who) in order.iter().enumerate() {
                let outcome = h.approve(&id, who).unwrap();
                assert_eq!(outcome.finalized, i == 2);
            }
            assert_eq!(h.engine.get_status(&id).unwrap(), RequestStatus::Approved);
        }
    }

    #[test]
    fn test_denial_fast_path() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);

        h.approve(&id, "alice").unwrap();
        assert_eq!(h.deny(&id, "bob").unwrap().status, RequestStatus::Pending);
        let outcome = h.deny(&id, "carol").unwrap();
        assert_eq!(outcome.status, RequestStatus::Denied);
        assert_eq!(outcome.approved_points, 1);
        assert!(h.engine.get_proof(&id).is_err());
    }

    #[test]
    fn test_weighted_approval() {
        let policy =
            ApprovalPolicy::weighted("pa", OperationKind::PromoteAdmin, &FIVE, &[("alice", 2)], 5);
        let h = Harness::new(policy);
        let id = h.open(OperationKind::PromoteAdmin);

        assert_eq!(h.approve(&id, "alice").unwrap().approved_points, 2);
        assert_eq!(h.approve(&id, "bob").unwrap().approved_points, 3);
        assert_eq!(h.approve(&id, "carol").unwrap().approved_points, 4);
        let outcome = h.approve(&id, "dave").unwrap();
        assert_eq!(outcome.approved_points, 5);
        assert_eq!(outcome.status, RequestStatus::Approved);

        let proof = h.engine.get_proof(&id).unwrap();
        assert_eq!(proof.signature_count(), 4);
        assert_eq!(proof.collected, 5);
    }

    #[test]
    fn test_revoke_before_and_after_finalization() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);

        h.approve(&id, "alice").unwrap();
        h.approve(&id, "bob").unwrap();
        let outcome = h.engine.revoke(&id, &IdentityId::from("bob")).unwrap();
        assert_eq!(outcome.approved_points, 1);
        assert_eq!(outcome.status, RequestStatus::Pending);

        // Bob may act again after withdrawing
        h.approve(&id, "bob").unwrap();
        h.approve(&id, "carol").unwrap();
        let err = h.engine.revoke(&id, &IdentityId::from("carol")).unwrap_err();
        assert!(matches!(err, Error::TooLate(_)));
        assert_eq!(h.engine.get_status(&id).unwrap(), RequestStatus::Approved);
    }

    #[test]
    fn test_revoke_denial_decrements() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);
        h.deny(&id, "erin").unwrap();
        let outcome = h.engine.revoke(&id, &IdentityId::from("erin")).unwrap();
        assert_eq!(outcome.denied_count, 0);
    }

    #[test]
    fn test_revoke_without_decision() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);
        let err = h.engine.revoke(&id, &IdentityId::from("dave")).unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
    }

    #[test]
    fn test_error_cases() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);

        let missing = RequestId::new("missing");
        assert!(matches!(
            h.engine.deny(&missing, &IdentityId::from("alice"), "x"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            h.engine.deny(&id, &IdentityId::from("mallory"), "x"),
            Err(Error::Unauthorized(_))
        ));

        h.approve(&id, "alice").unwrap();
        assert!(matches!(h.approve(&id, "alice"), Err(Error::AlreadyActed(_))));
        assert!(matches!(h.deny(&id, "alice"), Err(Error::AlreadyActed(_))));
    }

    #[test]
    fn test_invalid_signature_records_nothing() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);

        // Bob signs with Alice's name
        let forged = h.sign(&id, "bob");
        let err = h
            .engine
            .approve(&id, &IdentityId::from("alice"), &forged)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProof(_)));

        let request = h.engine.get_request(&id).unwrap();
        assert_eq!(request.approved_points(), 0);
        assert!(request
            .slot(&IdentityId::from("alice"))
            .unwrap()
            .decision
            .is_none());
        // Alice can still approve properly
        assert!(h.approve(&id, "alice").is_ok());
    }

    #[test]
    fn test_signature_over_other_request_rejected() {
        let h = Harness::new(three_of_five());
        let first = h.open(OperationKind::Rollback);
        let second = h
            .engine
            .create_request(
                &OperationKind::Rollback,
                &IdentityId::from("ops"),
                b"target=n4".to_vec(),
            )
            .unwrap();

        let signature = h.sign(&first, "alice");
        assert!(h
            .engine
            .approve(&second, &IdentityId::from("alice"), &signature)
            .is_err());
    }

    #[test]
    fn test_lazy_expiry_on_touch() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);
        h.approve(&id, "alice").unwrap();

        h.clock.advance(chrono::Duration::seconds(601));
        assert!(matches!(h.approve(&id, "bob"), Err(Error::Expired(_))));
        assert_eq!(h.engine.get_status(&id).unwrap(), RequestStatus::Expired);
        assert!(matches!(
            h.engine.revoke(&id, &IdentityId::from("alice")),
            Err(Error::TooLate(_))
        ));
    }

    #[test]
    fn test_check_expiry_idempotent() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);

        assert_eq!(h.engine.check_expiry(&id).unwrap(), RequestStatus::Pending);
        h.clock.advance(chrono::Duration::seconds(601));
        let first = h.engine.check_expiry(&id).unwrap();
        let finalized_at = h.engine.get_request(&id).unwrap().finalized_at();
        h.clock.advance(chrono::Duration::seconds(60));
        let second = h.engine.check_expiry(&id).unwrap();

        assert_eq!(first, RequestStatus::Expired);
        assert_eq!(second, RequestStatus::Expired);
        assert_eq!(h.engine.get_request(&id).unwrap().finalized_at(), finalized_at);
    }

    #[test]
    fn test_sweep_expired() {
        let h = Harness::new(three_of_five());
        let a = h.open(OperationKind::Rollback);
        let b = h.open(OperationKind::Rollback);
        h.approve(&b, "alice").unwrap();
        h.approve(&b, "bob").unwrap();
        h.approve(&b, "carol").unwrap();

        h.clock.advance(chrono::Duration::seconds(601));
        assert_eq!(h.engine.sweep_expired(), vec![a.clone()]);
        assert!(h.engine.sweep_expired().is_empty());
        assert_eq!(h.engine.get_status(&b).unwrap(), RequestStatus::Approved);
        assert!(h.engine.pending().is_empty());
    }

    #[test]
    fn test_late_decision_on_terminal_request() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);
        h.deny(&id, "alice").unwrap();
        h.deny(&id, "bob").unwrap();
        assert!(matches!(h.approve(&id, "carol"), Err(Error::Expired(_))));
        assert_eq!(h.engine.get_status(&id).unwrap(), RequestStatus::Denied);
    }

    #[test]
    fn test_create_request_validation() {
        let h = Harness::new(three_of_five());
        let err = h
            .engine
            .create_request(
                &OperationKind::PromoteAdmin,
                &IdentityId::from("ops"),
                b"x".to_vec(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::PolicyNotFound(_)));

        let err = h
            .engine
            .create_request(&OperationKind::Rollback, &IdentityId::from("ops"), Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_initiator_permission_checked_once() {
        let caps = StaticCapabilities::new().grant("ops", "governance.rollback");
        let h = Harness::with_config(three_of_five(), ApprovalConfig::default(), Arc::new(caps));

        assert!(h
            .engine
            .create_request(&OperationKind::Rollback, &IdentityId::from("intruder"), b"x".to_vec())
            .is_err());
        let id = h.open(OperationKind::Rollback);
        // Approvers hold no capability but are pre-authorized by the policy
        assert!(h.approve(&id, "alice").is_ok());
    }

    #[test]
    fn test_revalidate_permissions() {
        let caps = StaticCapabilities::new()
            .grant("ops", "governance.rollback")
            .grant("alice", "governance.rollback");
        let config = ApprovalConfig {
            revalidate_permissions: true,
            ..Default::default()
        };
        let h = Harness::with_config(three_of_five(), config, Arc::new(caps));
        let id = h.open(OperationKind::Rollback);

        assert!(h.approve(&id, "alice").is_ok());
        assert!(matches!(h.approve(&id, "bob"), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_dynamic_quorum_evaluation() {
        let policy =
            ApprovalPolicy::dynamic("rl", OperationKind::RevokeLeader, &FIVE, 4, 120, 3)
                .with_timeout_secs(600);
        let h = Harness::new(policy);
        let id = h.open(OperationKind::RevokeLeader);

        h.approve(&id, "alice").unwrap();
        h.approve(&id, "bob").unwrap();
        assert!(matches!(
            h.engine.evaluate_dynamic_quorum(&id),
            Err(Error::WindowOpen(_))
        ));

        h.clock.advance(chrono::Duration::seconds(121));
        // Two respondents is below min_respondents
        assert_eq!(
            h.engine.evaluate_dynamic_quorum(&id).unwrap(),
            RequestStatus::Pending
        );

        h.deny(&id, "carol").unwrap();
        // 2 of 3 respondents approve
        assert_eq!(
            h.engine.evaluate_dynamic_quorum(&id).unwrap(),
            RequestStatus::Approved
        );
        assert!(matches!(h.approve(&id, "dave"), Err(Error::Expired(_))));

        let proof = h.engine.get_proof(&id).unwrap();
        assert_eq!(proof.required, 2);
        let policy = h.engine.policy_for(&OperationKind::RevokeLeader).unwrap();
        assert!(
            proof
                .verify_against_policy(&Ed25519Service, &h.engine.directory(), &policy)
                .valid
        );
    }

    #[test]
    fn test_dynamic_majority_denial() {
        let policy =
            ApprovalPolicy::dynamic("rl", OperationKind::RevokeLeader, &FIVE, 4, 120, 3)
                .with_deny_threshold(4)
                .with_timeout_secs(600);
        let h = Harness::new(policy);
        let id = h.open(OperationKind::RevokeLeader);

        h.approve(&id, "alice").unwrap();
        h.deny(&id, "bob").unwrap();
        h.deny(&id, "carol").unwrap();
        h.clock.advance(chrono::Duration::seconds(121));
        assert_eq!(
            h.engine.evaluate_dynamic_quorum(&id).unwrap(),
            RequestStatus::Denied
        );
    }

    #[test]
    fn test_revoke_rechecks_dynamic_threshold() {
        let policy =
            ApprovalPolicy::dynamic("rl", OperationKind::RevokeLeader, &FIVE, 4, 120, 3)
                .with_deny_threshold(4)
                .with_timeout_secs(600);
        let h = Harness::new(policy);
        let id = h.open(OperationKind::RevokeLeader);

        h.approve(&id, "alice").unwrap();
        h.approve(&id, "bob").unwrap();
        h.deny(&id, "carol").unwrap();
        h.deny(&id, "dave").unwrap();
        h.clock.advance(chrono::Duration::seconds(121));

        // 2 of 4 respondents is no majority; dropping dave leaves 2 of 3
        let outcome = h.engine.revoke(&id, &IdentityId::from("dave")).unwrap();
        assert_eq!(outcome.status, RequestStatus::Approved);
        assert!(outcome.finalized);
        assert_eq!(h.engine.get_proof(&id).unwrap().signature_count(), 2);
    }

    #[test]
    fn test_retire_moves_terminal_request() {
        let h = Harness::new(three_of_five());
        let done = h.open(OperationKind::Rollback);
        let open = h.open(OperationKind::Rollback);
        for who in ["alice", "bob", "carol"] {
            h.approve(&done, who).unwrap();
        }

        assert!(matches!(
            h.engine.retire(&open),
            Err(Error::InvalidOperation(_))
        ));
        h.engine.retire(&done).unwrap();
        assert_eq!(h.engine.request_count(), 1);
        assert_eq!(h.engine.retired_count(), 1);
        assert!(h.engine.live_request(&done).is_none());
        assert!(h.engine.finalized().is_empty());

        assert_eq!(h.engine.get_status(&done).unwrap(), RequestStatus::Approved);
        assert_eq!(h.engine.get_proof(&done).unwrap().signature_count(), 3);
        assert!(matches!(h.approve(&done, "dave"), Err(Error::Expired(_))));
        assert!(matches!(
            h.engine.revoke(&done, &IdentityId::from("alice")),
            Err(Error::TooLate(_))
        ));
    }

    #[test]
    fn test_retired_set_is_bounded() {
        let config = ApprovalConfig {
            retained_closed: 2,
            ..Default::default()
        };
        let h = Harness::with_config(three_of_five(), config, Arc::new(AllowAll));
        let ids: Vec<RequestId> = (0..3)
            .map(|_| {
                let id = h.open(OperationKind::Rollback);
                h.deny(&id, "alice").unwrap();
                h.deny(&id, "bob").unwrap();
                h.engine.retire(&id).unwrap();
                id
            })
            .collect();

        assert_eq!(h.engine.request_count(), 0);
        assert_eq!(h.engine.retired_count(), 2);
        assert!(matches!(
            h.engine.get_status(&ids[0]),
            Err(Error::NotFound(_))
        ));
        assert_eq!(h.engine.get_status(&ids[2]).unwrap(), RequestStatus::Denied);
    }

    #[test]
    fn test_evaluate_rejects_static_policy() {
        let h = Harness::new(three_of_five());
        let id = h.open(OperationKind::Rollback);
        assert!(matches!(
            h.engine.evaluate_dynamic_quorum(&id),
            Err(Error::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_concurrent_decisions_finalize_once() {
        let h = Arc::new(Harness::new(
            ApprovalPolicy::fixed("rb", OperationKind::Rollback, &FIVE, 2).with_deny_threshold(2),
        ));
        let id = h.open(OperationKind::Rollback);

        let threads: Vec<_> = FIVE
            .iter()
            .enumerate()
            .map(|(i, who)| {
                let h = h.clone();
                let id = id.clone();
                let who = who.to_string();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        h.approve(&id, &who)
                    } else {
                        h.deny(&id, &who)
                    }
                })
            })
            .collect();

        let finalized = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap().ok())
            .filter(|o| o.finalized)
            .count();
        assert_eq!(finalized, 1);

        let request = h.engine.get_request(&id).unwrap();
        assert!(request.status().is_terminal());
        assert!(request.approved_points() < 2 || request.denied_count() < 2);
    }
}
