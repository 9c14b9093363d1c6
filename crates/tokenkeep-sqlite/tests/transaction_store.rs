use chrono::Utc;
use num_bigint::BigInt;
use std::collections::HashMap;
use tempfile::TempDir;
use tokenkeep_core::{
    ActionType, Context, MovementRecord, QueryTokenRequestsParams, QueryTransactionsParams,
    QueryValidationsParams, StoreConfig, StoreError, TransactionRecord, TxStatus,
};
use tokenkeep_sqlite::SqliteTransactionStore;

fn test_store() -> (SqliteTransactionStore, TempDir) {
    let temp = TempDir::new().unwrap();
    let cfg = StoreConfig::new(temp.path().join("transactions.db"));
    (SqliteTransactionStore::open(cfg).unwrap(), temp)
}

fn tx_record(tx_id: &str, sender: &str, recipient: &str, amount: i64) -> TransactionRecord {
    TransactionRecord {
        tx_id: tx_id.to_string(),
        action_type: if sender.is_empty() {
            ActionType::Issue
        } else if recipient.is_empty() {
            ActionType::Redeem
        } else {
            ActionType::Transfer
        },
        sender_eid: sender.to_string(),
        recipient_eid: recipient.to_string(),
        token_type: "USD".to_string(),
        amount: BigInt::from(amount),
        status: TxStatus::Pending,
        status_message: String::new(),
        timestamp: Utc::now(),
    }
}

fn append(store: &SqliteTransactionStore, ctx: &Context, tx_id: &str, records: &[TransactionRecord]) {
    let mut w = store.begin_atomic_write().unwrap();
    w.add_token_request(ctx, tx_id, b"request", &HashMap::new(), b"pp-hash")
        .unwrap();
    for record in records {
        w.add_transaction(ctx, record).unwrap();
    }
    w.commit().unwrap();
}

#[test]
fn request_sets_pending_status() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    append(&store, &ctx, "T1", &[]);

    let (status, message) = store.get_status(&ctx, "T1").unwrap();
    assert_eq!(status, TxStatus::Pending);
    assert!(message.is_empty());
}

#[test]
fn status_round_trip_and_missing_id() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    append(&store, &ctx, "T1", &[]);

    store
        .set_status(&ctx, "T1", TxStatus::Confirmed, "committed at block 7")
        .unwrap();
    let (status, message) = store.get_status(&ctx, "T1").unwrap();
    assert_eq!(status, TxStatus::Confirmed);
    assert_eq!(message, "committed at block 7");

    assert!(matches!(
        store.get_status(&ctx, "ghost"),
        Err(StoreError::NotFound(_))
    ));
    // setting the status of an unknown id is accepted
    store
        .set_status(&ctx, "ghost", TxStatus::Deleted, "")
        .unwrap();
}

#[test]
fn duplicate_token_request_is_a_conflict() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    append(&store, &ctx, "T1", &[]);

    let mut w = store.begin_atomic_write().unwrap();
    let err = w
        .add_token_request(&ctx, "T1", b"other", &HashMap::new(), b"pp")
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    w.rollback().unwrap();
}

#[test]
fn token_request_round_trip() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    append(&store, &ctx, "T1", &[]);

    assert_eq!(
        store.get_token_request(&ctx, "T1").unwrap(),
        Some(b"request".to_vec())
    );
    assert_eq!(store.get_token_request(&ctx, "nope").unwrap(), None);

    let requests: Vec<_> = store
        .query_token_requests(&ctx, &QueryTokenRequestsParams::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tx_id, "T1");
    assert_eq!(requests[0].status, TxStatus::Pending);
}

#[test]
fn transactions_join_the_request_status() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    append(
        &store,
        &ctx,
        "T1",
        &[tx_record("T1", "alice", "bob", 70), tx_record("T1", "alice", "alice", 30)],
    );
    store
        .set_status(&ctx, "T1", TxStatus::Confirmed, "")
        .unwrap();

    let records: Vec<_> = store
        .query_transactions(&ctx, &QueryTransactionsParams::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == TxStatus::Confirmed));
    assert!(records.iter().all(|r| r.action_type == ActionType::Transfer));
}

#[test]
fn transaction_filters_compose() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    append(&store, &ctx, "T1", &[tx_record("T1", "", "alice", 100)]);
    append(&store, &ctx, "T2", &[tx_record("T2", "alice", "bob", 40)]);
    append(&store, &ctx, "T3", &[tx_record("T3", "alice", "", 10)]);
    store.set_status(&ctx, "T2", TxStatus::Deleted, "").unwrap();

    let by_sender: Vec<_> = store
        .query_transactions(
            &ctx,
            &QueryTransactionsParams {
                sender_wallet_id: "alice".into(),
                ..Default::default()
            },
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(by_sender.len(), 2);

    let issues: Vec<_> = store
        .query_transactions(
            &ctx,
            &QueryTransactionsParams {
                action_types: vec![ActionType::Issue],
                ..Default::default()
            },
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].tx_id, "T1");

    let deleted: Vec<_> = store
        .query_transactions(
            &ctx,
            &QueryTransactionsParams {
                statuses: vec![TxStatus::Deleted],
                ..Default::default()
            },
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].tx_id, "T2");

    let by_ids: Vec<_> = store
        .query_transactions(
            &ctx,
            &QueryTransactionsParams {
                ids: vec!["T1".into(), "T3".into()],
                ..Default::default()
            },
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(by_ids.len(), 2);
}

#[test]
fn validation_records_round_trip() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    let mut metadata = HashMap::new();
    metadata.insert("verifier".to_string(), b"node-3".to_vec());

    let mut w = store.begin_atomic_write().unwrap();
    w.add_token_request(&ctx, "T1", b"request", &HashMap::new(), b"pp")
        .unwrap();
    w.add_validation_record(&ctx, "T1", &metadata).unwrap();
    w.commit().unwrap();

    let records: Vec<_> = store
        .query_validations(&ctx, &QueryValidationsParams::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tx_id, "T1");
    assert_eq!(records[0].status, TxStatus::Pending);
    assert_eq!(records[0].metadata.get("verifier"), Some(&b"node-3".to_vec()));
}

#[test]
fn movements_round_trip() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    let mut w = store.begin_atomic_write().unwrap();
    w.add_token_request(&ctx, "T1", b"request", &HashMap::new(), b"pp")
        .unwrap();
    w.add_movement(
        &ctx,
        &MovementRecord {
            tx_id: "T1".to_string(),
            enrollment_id: "alice".to_string(),
            token_type: "USD".to_string(),
            amount: BigInt::from(-70),
            status: TxStatus::Pending,
            timestamp: Utc::now(),
        },
    )
    .unwrap();
    w.commit().unwrap();

    let movements = store.movements(&ctx, "T1").unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].amount, BigInt::from(-70));
    assert_eq!(movements[0].enrollment_id, "alice");
}

#[test]
fn endorsement_acks_keyed_by_endorser() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    store
        .add_transaction_endorsement_ack(&ctx, "T1", &[0x01, 0x02], b"sig-a")
        .unwrap();
    store
        .add_transaction_endorsement_ack(&ctx, "T1", &[0x03], b"sig-b")
        .unwrap();

    let acks = store.get_transaction_endorsement_acks(&ctx, "T1").unwrap();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks.get("0102"), Some(&b"sig-a".to_vec()));
    assert_eq!(acks.get("03"), Some(&b"sig-b".to_vec()));

    // same (tx, endorser) pair conflicts
    let err = store
        .add_transaction_endorsement_ack(&ctx, "T1", &[0x03], b"sig-c")
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[test]
fn write_handle_discipline() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    let mut w = store.begin_atomic_write().unwrap();
    w.add_token_request(&ctx, "T1", b"request", &HashMap::new(), b"pp")
        .unwrap();
    w.rollback().unwrap();
    assert!(matches!(w.commit(), Err(StoreError::IllegalState(_))));
    assert!(matches!(
        w.add_token_request(&ctx, "T2", b"x", &HashMap::new(), b"pp"),
        Err(StoreError::IllegalState(_))
    ));
    drop(w);

    assert_eq!(store.get_token_request(&ctx, "T1").unwrap(), None);

    // drop without commit rolls back
    {
        let mut w = store.begin_atomic_write().unwrap();
        w.add_token_request(&ctx, "T3", b"request", &HashMap::new(), b"pp")
            .unwrap();
    }
    assert_eq!(store.get_token_request(&ctx, "T3").unwrap(), None);
}
