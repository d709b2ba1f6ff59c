//! End-to-end flows through the governance facade.

use regent::approval::{ApprovalPolicy, OperationKind, RequestId, RequestStatus};
use regent::audit::{MemoryStore, RoundObservation, RoundVerdict};
use regent::config::{ByzantineResponse, GovernanceConfig};
use regent::consensus::{MemoryReplica, QuorumFraction, ReplicaLogView, TenureCheck};
use regent::core::{now, Clock, Hash256, ManualClock};
use regent::governance::{
    GovernanceEvent, GovernanceFacade, RecordingSink, StepDownReason,
};
use regent::identity::{Ed25519Service, KeyPair, PublicIdentity};
use regent::Error;
use std::collections::HashMap;
use std::sync::Arc;

const APPROVERS: [&str; 5] = ["alice", "bob", "carol", "dave", "erin"];

struct Deployment {
    facade: GovernanceFacade,
    clock: ManualClock,
    sink: Arc<RecordingSink>,
    keys: HashMap<&'static str, KeyPair>,
}

fn h(byte: u8) -> Hash256 {
    Hash256::new([byte; 32])
}

fn deploy(replicas: Vec<Arc<dyn ReplicaLogView>>) -> Deployment {
    let mut config = GovernanceConfig::default();
    config.audit.response = ByzantineResponse::AutoRevokeClear;
    config.tenure.max_tenure_secs = 120;

    let clock = ManualClock::new(now());
    let sink = Arc::new(RecordingSink::new());
    let facade = GovernanceFacade::builder(config)
        .clock(Arc::new(clock.clone()))
        .step_down_sink(sink.clone())
        .store(Arc::new(MemoryStore::new()))
        .replicas(replicas)
        .build()
        .unwrap();

    let mut keys = HashMap::new();
    for name in APPROVERS {
        let pair = KeyPair::generate();
        facade
            .register_identity(PublicIdentity::new(name, &pair))
            .unwrap();
        keys.insert(name, pair);
    }

    Deployment {
        facade,
        clock,
        sink,
        keys,
    }
}

async fn approve(d: &Deployment, id: &RequestId, who: &'static str) -> RequestStatus {
    let hash = d.facade.get_request(id).await.unwrap().operation_hash;
    let signature = d.keys[who].sign(hash.as_bytes());
    d.facade.approve(id, who, &signature).await.unwrap().status
}

#[tokio::test]
async fn test_threshold_reached_exactly_in_any_order() {
    let orders: [[&'static str; 5]; 3] = [
        ["alice", "bob", "carol", "dave", "erin"],
        ["erin", "carol", "alice", "bob", "dave"],
        ["dave", "erin", "bob", "carol", "alice"],
    ];

    for (n, order) in orders.iter().enumerate() {
        let d = deploy(Vec::new());
        d.facade
            .register_policy(ApprovalPolicy::fixed(
                "promote",
                OperationKind::PromoteAdmin,
                &APPROVERS,
                3,
            ))
            .unwrap();
        let id = d
            .facade
            .create_request(&OperationKind::PromoteAdmin, "alice", format!("op-{}", n).into_bytes())
            .unwrap();

        assert_eq!(approve(&d, &id, order[0]).await, RequestStatus::Pending);
        assert_eq!(approve(&d, &id, order[1]).await, RequestStatus::Pending);
        assert_eq!(approve(&d, &id, order[2]).await, RequestStatus::Approved);
        assert_eq!(d.facade.get_proof(&id).await.unwrap().signature_count(), 3);

        let hash = d.facade.get_request(&id).await.unwrap().operation_hash;
        let late = d.keys[order[3]].sign(hash.as_bytes());
        assert!(matches!(
            d.facade.approve(&id, order[3], &late).await,
            Err(Error::Expired(_))
        ));
    }
}

#[tokio::test]
async fn test_denial_fast_path() {
    let d = deploy(Vec::new());
    d.facade
        .register_policy(
            ApprovalPolicy::fixed("rollback", OperationKind::Rollback, &APPROVERS, 3)
                .with_deny_threshold(2),
        )
        .unwrap();
    let id = d
        .facade
        .create_request(&OperationKind::Rollback, "alice", b"to:100".to_vec())
        .unwrap();

    assert_eq!(approve(&d, &id, "alice").await, RequestStatus::Pending);
    d.facade.deny(&id, "bob", "no").await.unwrap();
    let outcome = d.facade.deny(&id, "carol", "no").await.unwrap();
    assert_eq!(outcome.status, RequestStatus::Denied);
    assert!(outcome.finalized);
}

#[tokio::test]
async fn test_weighted_approval_proof() {
    let d = deploy(Vec::new());
    d.facade
        .register_policy(ApprovalPolicy::weighted(
            "grant",
            OperationKind::GrantCapability,
            &APPROVERS,
            &[("alice", 2)],
            5,
        ))
        .unwrap();
    let id = d
        .facade
        .create_request(&OperationKind::GrantCapability, "bob", b"cap:deploy".to_vec())
        .unwrap();

    for who in ["alice", "bob", "carol"] {
        assert_eq!(approve(&d, &id, who).await, RequestStatus::Pending);
    }
    assert_eq!(approve(&d, &id, "dave").await, RequestStatus::Approved);

    let proof = d.facade.get_proof(&id).await.unwrap();
    assert_eq!(proof.signature_count(), 4);
    assert_eq!(proof.collected, 5);

    // Re-verify from the encoded artifact and public keys only.
    let decoded = regent::approval::MultiSigProof::decode(&proof.encode().unwrap()).unwrap();
    let directory = d.facade.engine().directory();
    let policy = d
        .facade
        .engine()
        .policy_for(&OperationKind::GrantCapability)
        .unwrap();
    let verification = decoded.verify_against_policy(&Ed25519Service, &directory, &policy);
    assert!(verification.valid);
    assert_eq!(verification.valid_signatures, 4);
    assert_eq!(verification.valid_points, 5);
    assert!(decoded.verify(&Ed25519Service, &directory, 4).valid);
    assert!(!decoded.verify(&Ed25519Service, &directory, 5).valid);
}

#[tokio::test]
async fn test_revocation_window() {
    let d = deploy(Vec::new());
    d.facade
        .register_policy(ApprovalPolicy::fixed(
            "promote",
            OperationKind::PromoteAdmin,
            &APPROVERS,
            2,
        ))
        .unwrap();
    let id = d
        .facade
        .create_request(&OperationKind::PromoteAdmin, "alice", b"promote:erin".to_vec())
        .unwrap();

    approve(&d, &id, "alice").await;
    let outcome = d.facade.revoke(&id, "alice").await.unwrap();
    assert_eq!(outcome.approved_points, 0);
    assert_eq!(outcome.status, RequestStatus::Pending);

    approve(&d, &id, "alice").await;
    assert_eq!(approve(&d, &id, "bob").await, RequestStatus::Approved);
    assert!(matches!(
        d.facade.revoke(&id, "bob").await,
        Err(Error::TooLate(_))
    ));
}

#[tokio::test]
async fn test_byzantine_detection_names_divergent_replica() {
    let d = deploy(Vec::new());
    let mut events = d.facade.subscribe();
    let t = d.clock.now();

    let consistent = RoundObservation::new("leader-1", 1, 1, t)
        .with_replicas(&["r1", "r2", "r3"])
        .report("r1", h(1), vec![], t)
        .report("r2", h(1), vec![], t)
        .report("r3", h(1), vec![], t);
    let verdict = d.facade.on_round_complete(consistent).await.unwrap();
    assert!(matches!(verdict, RoundVerdict::Consistent { .. }));
    assert!(events.try_recv().is_err());

    let divergent = RoundObservation::new("leader-1", 1, 2, t)
        .with_replicas(&["r1", "r2", "r3"])
        .report("r1", h(2), vec![], t)
        .report("r2", h(2), vec![], t)
        .report("r3", h(9), vec![], t);
    d.facade.on_round_complete(divergent).await.unwrap();

    match events.try_recv().unwrap() {
        GovernanceEvent::ByzantineSuspected(suspicion) => {
            let named: Vec<&str> = suspicion.divergent.iter().map(|(r, _)| r.as_str()).collect();
            assert_eq!(named, vec!["r3"]);
            assert_eq!(suspicion.plurality, Some(h(2)));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(d.sink.requests().len(), 1);
}

#[tokio::test]
async fn test_tenure_step_down_independent_of_detection() {
    let d = deploy(Vec::new());
    d.facade.on_leader_change("leader-1", 7);

    let t = d.clock.now();
    let clean = RoundObservation::new("leader-1", 7, 1, t)
        .report("r1", h(1), vec![], t)
        .report("r2", h(1), vec![], t);
    d.facade.on_round_complete(clean).await.unwrap();

    d.clock.advance(chrono::Duration::seconds(121));
    match d.facade.tick_tenure() {
        TenureCheck::StepDownRequired { leader, term, .. } => {
            assert_eq!(leader.as_str(), "leader-1");
            assert_eq!(term, 7);
        }
        other => panic!("expected step-down, got {:?}", other),
    }
    let requests = d.sink.requests();
    assert_eq!(requests.len(), 1);
    assert!(matches!(
        requests[0].reason,
        StepDownReason::TenureExceeded { held_secs: 121 }
    ));
}

#[tokio::test]
async fn test_quorum_read_through_facade() {
    let replica = |id: &str, byte: u8| -> Arc<dyn ReplicaLogView> {
        Arc::new(MemoryReplica::new(id).with_entry(10, h(byte)))
    };
    let d = deploy(vec![
        replica("r1", 1),
        replica("r2", 1),
        replica("r3", 1),
        replica("r4", 1),
        replica("r5", 2),
    ]);
    let fraction = QuorumFraction::AtLeast {
        numerator: 3,
        denominator: 5,
    };
    let answer = d
        .facade
        .query_with_quorum(10, Some(fraction))
        .await
        .unwrap();
    assert_eq!(answer.hash, h(1));
    assert_eq!(answer.corroborating, 4);

    let split = deploy(vec![
        replica("r1", 1),
        replica("r2", 1),
        replica("r3", 2),
        replica("r4", 3),
        replica("r5", 4),
    ]);
    assert!(matches!(
        split.facade.query_with_quorum(10, None).await,
        Err(Error::QuorumFailed { .. })
    ));
}
