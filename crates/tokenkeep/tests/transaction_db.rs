use num_bigint::BigInt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokenkeep::prelude::*;
use tokenkeep::QueryTransactionsParams;

fn test_db() -> (Arc<TransactionDb>, TempDir) {
    let temp = TempDir::new().unwrap();
    let cfg = StoreConfig::new(temp.path().join("transactions.db"));
    (Arc::new(TransactionDb::open(cfg).unwrap()), temp)
}

fn transfer_record(anchor: &str) -> AuditRecord {
    AuditRecord {
        anchor: anchor.to_string(),
        inputs: vec![AuditEntry::new(0, "alice", "USD", BigInt::from(100))],
        outputs: vec![
            AuditEntry::new(0, "bob", "USD", BigInt::from(70)),
            AuditEntry::new(0, "alice", "USD", BigInt::from(30)),
        ],
    }
}

#[test]
fn append_transaction_record_end_to_end() {
    let (db, _temp) = test_db();
    let ctx = Context::background();

    db.append_transaction_record(
        &ctx,
        &transfer_record("T1"),
        b"raw-request",
        &HashMap::new(),
        b"pp-hash",
    )
    .unwrap();

    let (status, _) = db.get_status(&ctx, "T1").unwrap();
    assert_eq!(status, TxStatus::Pending);

    let records: Vec<TransactionRecord> = db
        .transactions(&ctx, &QueryTransactionsParams::default())
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.sender_eid == "alice"));
    assert!(records.iter().all(|r| r.action_type == ActionType::Transfer));

    let movements = db.movements(&ctx, "T1").unwrap();
    assert_eq!(movements.len(), 2);
    let net: BigInt = movements.iter().map(|m| &m.amount).sum();
    assert_eq!(net, BigInt::from(0));

    assert_eq!(
        db.get_token_request(&ctx, "T1").unwrap(),
        Some(b"raw-request".to_vec())
    );
}

#[test]
fn invalid_audit_rolls_everything_back() {
    let (db, _temp) = test_db();
    let ctx = Context::background();

    let record = AuditRecord {
        anchor: "T1".to_string(),
        inputs: vec![
            AuditEntry::new(0, "alice", "USD", BigInt::from(10)),
            AuditEntry::new(0, "bob", "USD", BigInt::from(10)),
        ],
        outputs: vec![AuditEntry::new(0, "carol", "USD", BigInt::from(20))],
    };
    let err = db
        .append_transaction_record(&ctx, &record, b"raw", &HashMap::new(), b"pp")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidAudit(_)));
    assert_eq!(db.get_token_request(&ctx, "T1").unwrap(), None);
    assert!(db.get_status(&ctx, "T1").is_err());
}

#[test]
fn set_status_notifies_every_subscriber_once_in_order() {
    let (db, _temp) = test_db();
    let ctx = Context::background();
    db.append_transaction_record(&ctx, &transfer_record("T1"), b"r", &HashMap::new(), b"pp")
        .unwrap();
    db.append_transaction_record(&ctx, &transfer_record("T2"), b"r", &HashMap::new(), b"pp")
        .unwrap();

    let seen_a: Arc<Mutex<Vec<(String, TxStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_b: Arc<Mutex<Vec<(String, TxStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    for seen in [&seen_a, &seen_b] {
        let seen = seen.clone();
        db.notifier()
            .subscribe_fn(move |e| seen.lock().push((e.tx_id.clone(), e.status)));
    }

    db.set_status(&ctx, "T1", TxStatus::Confirmed, "").unwrap();
    db.set_status(&ctx, "T2", TxStatus::Deleted, "invalid").unwrap();

    let expected = vec![
        ("T1".to_string(), TxStatus::Confirmed),
        ("T2".to_string(), TxStatus::Deleted),
    ];
    assert_eq!(*seen_a.lock(), expected);
    assert_eq!(*seen_b.lock(), expected);
}

#[test]
fn listeners_observe_durable_state_only() {
    let (db, _temp) = test_db();
    let ctx = Context::background();
    db.append_transaction_record(&ctx, &transfer_record("T1"), b"r", &HashMap::new(), b"pp")
        .unwrap();

    let observed: Arc<Mutex<Option<TxStatus>>> = Arc::new(Mutex::new(None));
    {
        let db = db.clone();
        let ctx = ctx.clone();
        let observed = observed.clone();
        db.clone().notifier().subscribe_fn(move |e| {
            // the event must never precede the backend commit
            let (status, _) = db.get_status(&ctx, &e.tx_id).unwrap();
            *observed.lock() = Some(status);
        });
    }

    db.set_status(&ctx, "T1", TxStatus::Confirmed, "").unwrap();
    assert_eq!(*observed.lock(), Some(TxStatus::Confirmed));
}

#[test]
fn token_request_cache_round_trip() {
    let (db, _temp) = test_db();
    let ctx = Context::background();
    db.append_transaction_record(&ctx, &transfer_record("T1"), b"raw", &HashMap::new(), b"pp")
        .unwrap();

    // served from the cache
    assert_eq!(db.get_token_request(&ctx, "T1").unwrap(), Some(b"raw".to_vec()));
    // unknown ids miss the cache and the backend alike
    assert_eq!(db.get_token_request(&ctx, "nope").unwrap(), None);
}

#[test]
fn validation_record_flow() {
    let (db, _temp) = test_db();
    let ctx = Context::background();

    let mut metadata = HashMap::new();
    metadata.insert("rule".to_string(), b"r1".to_vec());
    db.append_validation_record(&ctx, "T1", b"request", &metadata, b"pp")
        .unwrap();

    let (status, _) = db.get_status(&ctx, "T1").unwrap();
    assert_eq!(status, TxStatus::Pending);
    assert_eq!(
        db.get_token_request(&ctx, "T1").unwrap(),
        Some(b"request".to_vec())
    );

    let validations: Vec<_> = db
        .validations(&ctx, &Default::default())
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(validations.len(), 1);
    assert_eq!(validations[0].metadata.get("rule"), Some(&b"r1".to_vec()));
}

#[test]
fn endorsement_acks_pass_through() {
    let (db, _temp) = test_db();
    let ctx = Context::background();
    db.add_transaction_endorsement_ack(&ctx, "T1", &[0xAB], b"sig")
        .unwrap();
    let acks = db.get_transaction_endorsement_acks(&ctx, "T1").unwrap();
    assert_eq!(acks.get("ab"), Some(&b"sig".to_vec()));
}

#[tokio::test]
async fn waiter_resolves_on_confirmation() {
    let (db, _temp) = test_db();
    let ctx = Context::background();
    db.append_transaction_record(&ctx, &transfer_record("T1"), b"r", &HashMap::new(), b"pp")
        .unwrap();

    let waiter = StatusWaiter::new(db.notifier());
    db.set_status(&ctx, "T1", TxStatus::Confirmed, "done").unwrap();

    let event = waiter
        .wait_final("T1", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(event.status, TxStatus::Confirmed);
    assert_eq!(event.message, "done");
}
