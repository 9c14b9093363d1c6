use tempfile::TempDir;
use tokenkeep_core::{
    Context, QueryTokenDetailsParams, StoreConfig, StoreError, TokenId, TokenRecord,
};
use tokenkeep_sqlite::SqliteTokenStore;

fn test_store() -> (SqliteTokenStore, TempDir) {
    let temp = TempDir::new().unwrap();
    let cfg = StoreConfig::new(temp.path().join("tokens.db"));
    (SqliteTokenStore::open(cfg).unwrap(), temp)
}

fn record(tx_id: &str, index: u64, token_type: &str, amount: u64) -> TokenRecord {
    TokenRecord {
        tx_id: tx_id.to_string(),
        index,
        ledger: format!("ledger-{tx_id}-{index}").into_bytes(),
        ledger_metadata: format!("meta-{tx_id}-{index}").into_bytes(),
        token_type: token_type.to_string(),
        quantity: amount.to_string(),
        amount,
        owner_raw: vec![0xAA],
        owner_type: "idemix".to_string(),
        owner_identity: vec![0xBB],
        owner: true,
        ..Default::default()
    }
}

#[test]
fn issue_then_spend() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    store
        .store_token(&ctx, &record("T1", 0, "USD", 100), &["alice".into()])
        .unwrap();

    assert!(store.is_mine(&ctx, "T1", 0).unwrap());
    assert_eq!(store.balance(&ctx, "alice", "USD").unwrap(), 100);

    let mut w = store.begin_atomic_write().unwrap();
    w.delete_token(&ctx, "T1", 0, "T2").unwrap();
    w.commit().unwrap();

    assert!(!store.is_mine(&ctx, "T1", 0).unwrap());
    let (spent_by, deleted) = store
        .who_deleted_tokens(&ctx, &[TokenId::new("T1", 0)])
        .unwrap();
    assert_eq!(spent_by, vec!["T2".to_string()]);
    assert_eq!(deleted, vec![true]);
    assert_eq!(store.balance(&ctx, "alice", "USD").unwrap(), 0);
}

#[test]
fn delete_token_is_idempotent() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("T1", 0, "USD", 10), &["alice".into()])
        .unwrap();

    for _ in 0..2 {
        let mut w = store.begin_atomic_write().unwrap();
        w.delete_token(&ctx, "T1", 0, "T2").unwrap();
        w.commit().unwrap();
    }

    let (spent_by, deleted) = store
        .who_deleted_tokens(&ctx, &[TokenId::new("T1", 0)])
        .unwrap();
    assert_eq!(spent_by, vec!["T2".to_string()]);
    assert_eq!(deleted, vec![true]);
}

#[test]
fn delete_tokens_batch_and_empty_list() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("T1", 0, "USD", 10), &["alice".into()])
        .unwrap();
    store
        .store_token(&ctx, &record("T1", 1, "USD", 20), &["alice".into()])
        .unwrap();

    // empty id list is a no-op
    store.delete_tokens(&ctx, "spender", &[]).unwrap();
    assert!(store.is_mine(&ctx, "T1", 0).unwrap());

    store
        .delete_tokens(
            &ctx,
            "spender",
            &[TokenId::new("T1", 0), TokenId::new("T1", 1)],
        )
        .unwrap();
    assert!(!store.is_mine(&ctx, "T1", 0).unwrap());
    assert!(!store.is_mine(&ctx, "T1", 1).unwrap());
}

#[test]
fn rollback_disposes_all_effects() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    let mut w = store.begin_atomic_write().unwrap();
    w.store_token(&ctx, &record("T1", 0, "USD", 100), &["alice".into()])
        .unwrap();
    w.rollback().unwrap();

    assert!(!store.transaction_exists(&ctx, "T1").unwrap());
    assert_eq!(store.balance(&ctx, "alice", "USD").unwrap(), 0);
}

#[test]
fn ordered_retrieval_follows_input_order() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    for (tx, amount) in [("A", 1u64), ("B", 2), ("C", 3)] {
        store
            .store_token(&ctx, &record(tx, 0, "USD", amount), &["alice".into()])
            .unwrap();
    }

    let ids = vec![TokenId::new("C", 0), TokenId::new("A", 0), TokenId::new("B", 0)];
    let tokens = store.get_tokens(&ctx, &ids).unwrap();
    let quantities: Vec<&str> = tokens.iter().map(|t| t.quantity.as_str()).collect();
    assert_eq!(quantities, vec!["3", "1", "2"]);
}

#[test]
fn get_tokens_reports_the_missing_key() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("A", 0, "USD", 1), &["alice".into()])
        .unwrap();

    let err = store
        .get_tokens(&ctx, &[TokenId::new("A", 0), TokenId::new("missing", 7)])
        .unwrap_err();
    match err {
        StoreError::NotFound(msg) => {
            assert_eq!(msg, "token not found for key [missing:7]");
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn get_tokens_skips_deleted_and_unowned() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("A", 0, "USD", 1), &["alice".into()])
        .unwrap();
    let mut audit = record("B", 0, "USD", 2);
    audit.owner = false;
    audit.auditor = true;
    store.store_token(&ctx, &audit, &["auditor".into()]).unwrap();

    assert!(store.get_tokens(&ctx, &[TokenId::new("B", 0)]).is_err());

    store.delete_tokens(&ctx, "X", &[TokenId::new("A", 0)]).unwrap();
    assert!(store.get_tokens(&ctx, &[TokenId::new("A", 0)]).is_err());
}

#[test]
fn audit_tokens_in_input_order() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    for tx in ["A", "B"] {
        let mut rec = record(tx, 0, "USD", 5);
        rec.owner = false;
        rec.auditor = true;
        store.store_token(&ctx, &rec, &["aud".into()]).unwrap();
    }

    let tokens = store
        .list_audit_tokens(&ctx, &[TokenId::new("B", 0), TokenId::new("A", 0)])
        .unwrap();
    assert_eq!(tokens.len(), 2);

    let err = store
        .list_audit_tokens(&ctx, &[TokenId::new("Z", 3)])
        .unwrap_err();
    assert_eq!(err.to_string(), "token not found for key [Z:3]");
}

#[test]
fn foreign_key_violation_maps_to_token_does_not_exist() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    let err = store
        .store_certifications(&ctx, &[(TokenId::new("ghost", 0), vec![1, 2, 3])])
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenDoesNotExist(_)));
}

#[test]
fn certification_round_trip() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("T1", 0, "USD", 1), &["alice".into()])
        .unwrap();
    store
        .store_token(&ctx, &record("T1", 1, "USD", 1), &["alice".into()])
        .unwrap();

    let id = TokenId::new("T1", 0);
    store
        .store_certifications(&ctx, &[(id.clone(), b"cert".to_vec())])
        .unwrap();

    assert!(store.exists_certification(&ctx, &id));
    assert!(!store.exists_certification(&ctx, &TokenId::new("T1", 1)));
    assert_eq!(
        store.get_certifications(&ctx, &[id.clone()]).unwrap(),
        vec![b"cert".to_vec()]
    );

    // an empty certification exists in the table but does not certify
    let empty_id = TokenId::new("T1", 1);
    store
        .store_certifications(&ctx, &[(empty_id.clone(), Vec::new())])
        .unwrap();
    assert!(!store.exists_certification(&ctx, &empty_id));
    let err = store.get_certifications(&ctx, &[empty_id]).unwrap_err();
    assert!(matches!(err, StoreError::NotCertified(_)));

    let err = store
        .get_certifications(&ctx, &[TokenId::new("nope", 0)])
        .unwrap_err();
    assert!(matches!(err, StoreError::NotCertified(_)));
}

#[test]
fn public_params_log_returns_latest() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    // absent params are empty, not an error
    assert!(store.public_params(&ctx).unwrap().is_empty());

    for i in 0u8..3 {
        store.store_public_params(&ctx, &[i; 4]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    assert_eq!(store.public_params(&ctx).unwrap(), vec![2u8; 4]);
}

#[test]
fn token_outputs_preserve_order_and_reject_empty() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("A", 0, "USD", 1), &["alice".into()])
        .unwrap();
    store
        .store_token(&ctx, &record("B", 0, "USD", 1), &["alice".into()])
        .unwrap();

    let ids = vec![TokenId::new("B", 0), TokenId::new("A", 0)];
    let mut seen = Vec::new();
    store
        .get_token_outputs(&ctx, &ids, |id, raw| {
            seen.push((id.clone(), raw.to_vec()));
            Ok(())
        })
        .unwrap();
    assert_eq!(seen[0].0, ids[0]);
    assert_eq!(seen[0].1, b"ledger-B-0".to_vec());
    assert_eq!(seen[1].1, b"ledger-A-0".to_vec());

    let mut empty = record("E", 0, "USD", 1);
    empty.ledger = Vec::new();
    store.store_token(&ctx, &empty, &["alice".into()]).unwrap();
    let err = store
        .get_token_outputs(&ctx, &[TokenId::new("E", 0)], |_, _| Ok(()))
        .unwrap_err();
    assert!(matches!(err, StoreError::EmptyToken(_)));
}

#[test]
fn info_and_outputs_are_parallel_arrays() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("A", 0, "USD", 1), &["alice".into()])
        .unwrap();
    store
        .store_token(&ctx, &record("B", 0, "USD", 1), &["alice".into()])
        .unwrap();

    let ids = vec![TokenId::new("B", 0), TokenId::new("A", 0)];
    let (tokens, metas) = store.get_token_info_and_outputs(&ctx, &ids).unwrap();
    assert_eq!(tokens, vec![b"ledger-B-0".to_vec(), b"ledger-A-0".to_vec()]);
    assert_eq!(metas, vec![b"meta-B-0".to_vec(), b"meta-A-0".to_vec()]);

    let err = store
        .get_token_info_and_outputs(&ctx, &[TokenId::new("gone", 9)])
        .unwrap_err();
    assert_eq!(err.to_string(), "token not found for key [gone:9]");
}

#[test]
fn token_details_multiplicity_follows_ownership() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(
            &ctx,
            &record("T1", 0, "USD", 10),
            &["alice".into(), "auditor".into()],
        )
        .unwrap();

    let details = store
        .query_token_details(
            &ctx,
            &QueryTokenDetailsParams {
                ids: vec![TokenId::new("T1", 0)],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(details.len(), 2);

    let narrowed = store
        .query_token_details(
            &ctx,
            &QueryTokenDetailsParams {
                ids: vec![TokenId::new("T1", 0)],
                enrollment_id: "alice".into(),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(narrowed.len(), 1);
    assert_eq!(narrowed[0].owner_enrollment, "alice");
}

#[test]
fn deleted_tokens_visible_only_with_include_deleted() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    store
        .store_token(&ctx, &record("T1", 0, "USD", 10), &["alice".into()])
        .unwrap();
    store.delete_tokens(&ctx, "T2", &[TokenId::new("T1", 0)]).unwrap();

    let live = store
        .query_token_details(&ctx, &QueryTokenDetailsParams::default())
        .unwrap();
    assert!(live.is_empty());

    let all = store
        .query_token_details(
            &ctx,
            &QueryTokenDetailsParams {
                include_deleted: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_deleted);
    assert_eq!(all[0].spent_by, "T2");
}

#[test]
fn unspent_iterator_crosses_batch_boundaries() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    let mut w = store.begin_atomic_write().unwrap();
    for i in 0..300u64 {
        w.store_token(&ctx, &record("bulk", i, "USD", 1), &["alice".into()])
            .unwrap();
    }
    w.commit().unwrap();

    let tokens = store.list_unspent_tokens(&ctx).unwrap();
    assert_eq!(tokens.len(), 300);

    // every row exactly once
    let mut ids: Vec<u64> = tokens.iter().map(|t| t.id.index).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 300);

    let filtered = store.list_unspent_tokens_by(&ctx, "alice", "USD").unwrap();
    assert_eq!(filtered.len(), 300);
    assert!(store.list_unspent_tokens_by(&ctx, "bob", "").unwrap().is_empty());
}

#[test]
fn spendable_iterator_reads_wallet_from_token_row() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    let mut rec = record("T1", 0, "USD", 10);
    rec.owner_wallet_id = Some("alice".into());
    store.store_token(&ctx, &rec, &[]).unwrap();

    // stored through ownership rows only: not spendable by wallet column
    store
        .store_token(&ctx, &record("T2", 0, "USD", 5), &["alice".into()])
        .unwrap();

    let spendable: Vec<_> = store
        .spendable_tokens_iterator_by(&ctx, "alice", "USD")
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(spendable.len(), 1);
    assert_eq!(spendable[0].id, TokenId::new("T1", 0));
    assert_eq!(spendable[0].wallet_id, "alice");
}

#[test]
fn history_of_issued_tokens() {
    let (store, _temp) = test_store();
    let ctx = Context::background();
    let mut rec = record("T1", 0, "USD", 10);
    rec.issuer = true;
    rec.issuer_raw = Some(vec![0xCC]);
    store.store_token(&ctx, &rec, &["alice".into()]).unwrap();
    store
        .store_token(&ctx, &record("T2", 0, "USD", 5), &["alice".into()])
        .unwrap();

    let issued = store.list_history_issued_tokens(&ctx).unwrap();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].id, TokenId::new("T1", 0));
    assert_eq!(issued[0].issuer_raw, Some(vec![0xCC]));
}

#[test]
fn write_handle_get_token_sees_uncommitted_rows() {
    let (store, _temp) = test_store();
    let ctx = Context::background();

    let mut w = store.begin_atomic_write().unwrap();
    w.store_token(&ctx, &record("T1", 0, "USD", 10), &["alice".into()])
        .unwrap();
    let (token, owners) = w.get_token(&ctx, "T1", 0, false).unwrap();
    assert!(token.is_some());
    assert_eq!(owners, vec!["alice".to_string()]);

    let (missing, owners) = w.get_token(&ctx, "nope", 0, false).unwrap();
    assert!(missing.is_none());
    assert!(owners.is_empty());
    w.rollback().unwrap();
}
