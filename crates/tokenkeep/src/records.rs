//! Pure decomposition of audit records into transaction and movement
//! records.

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use tokenkeep_core::{
    ActionType, AuditEntry, AuditRecord, MovementRecord, Result, StoreError, TransactionRecord,
    TxStatus,
};

/// Distinct non-empty enrollment ids, in order of first appearance.
fn enrollment_ids<'a>(entries: impl Iterator<Item = &'a AuditEntry>) -> Vec<String> {
    let mut seen = Vec::new();
    for entry in entries {
        if !entry.enrollment_id.is_empty() && !seen.contains(&entry.enrollment_id) {
            seen.push(entry.enrollment_id.clone());
        }
    }
    seen
}

/// Distinct token types, in order of first appearance.
fn token_types<'a>(entries: impl Iterator<Item = &'a AuditEntry>) -> Vec<String> {
    let mut seen = Vec::new();
    for entry in entries {
        if !seen.contains(&entry.token_type) {
            seen.push(entry.token_type.clone());
        }
    }
    seen
}

fn sum_by(entries: &[&AuditEntry], enrollment_id: &str, token_type: &str) -> BigInt {
    entries
        .iter()
        .filter(|e| e.enrollment_id == enrollment_id && e.token_type == token_type)
        .map(|e| &e.amount)
        .sum()
}

/// Decompose an audit record into transaction records: one per (action,
/// sender, recipient, token type) with a positive received amount.
///
/// For each action there is at most one input enrollment id; more is an
/// invalid audit. The empty recipient id stands for burn: outputs not
/// attributed to any enrollment id in an action with inputs become a
/// redeem record.
pub fn transaction_records(
    record: &AuditRecord,
    timestamp: DateTime<Utc>,
) -> Result<Vec<TransactionRecord>> {
    let mut records = Vec::new();

    for action_index in 0.. {
        let ins: Vec<&AuditEntry> = record
            .inputs
            .iter()
            .filter(|e| e.action_index == action_index)
            .collect();
        let outs: Vec<&AuditEntry> = record
            .outputs
            .iter()
            .filter(|e| e.action_index == action_index)
            .collect();
        if ins.is_empty() && outs.is_empty() {
            tracing::debug!("no actions left for tx [{}][{action_index}]", record.anchor);
            break;
        }

        let in_eids = enrollment_ids(ins.iter().copied());
        if in_eids.len() > 1 {
            return Err(StoreError::InvalidAudit(format!(
                "expected at most 1 input enrollment id, got {} [{:?}]",
                in_eids.len(),
                in_eids
            )));
        }
        let in_eid = in_eids.first().cloned().unwrap_or_default();

        let mut out_eids = enrollment_ids(outs.iter().copied());
        out_eids.push(String::new());
        let mut types = token_types(outs.iter().copied());
        for token_type in token_types(ins.iter().copied()) {
            if !types.contains(&token_type) {
                types.push(token_type);
            }
        }

        for out_eid in &out_eids {
            for token_type in &types {
                let mut received = sum_by(&outs, out_eid, token_type);
                if out_eid.is_empty() {
                    // value entering the action but not leaving it is burnt,
                    // whether or not an explicit burn output records it
                    let total_in: BigInt = ins
                        .iter()
                        .filter(|e| &e.token_type == token_type)
                        .map(|e| &e.amount)
                        .sum();
                    let total_out: BigInt = outs
                        .iter()
                        .filter(|e| &e.token_type == token_type)
                        .map(|e| &e.amount)
                        .sum();
                    let residual = total_in - total_out;
                    if residual > BigInt::from(0) {
                        received += residual;
                    }
                }
                if received <= BigInt::from(0) {
                    continue;
                }

                let action_type = if in_eids.is_empty() {
                    ActionType::Issue
                } else if out_eid.is_empty() {
                    ActionType::Redeem
                } else {
                    ActionType::Transfer
                };

                records.push(TransactionRecord {
                    tx_id: record.anchor.clone(),
                    sender_eid: in_eid.clone(),
                    recipient_eid: out_eid.clone(),
                    token_type: token_type.clone(),
                    amount: received,
                    status: TxStatus::Pending,
                    action_type,
                    status_message: String::new(),
                    timestamp,
                });
            }
        }
    }
    tracing::debug!("parsed transactions for tx [{}]", record.anchor);

    Ok(records)
}

/// Decompose an audit record into net movements: one per (enrollment id,
/// token type) whose received and sent totals differ. Positive amounts
/// are incoming, negative outgoing.
pub fn movements(record: &AuditRecord, created: DateTime<Utc>) -> Result<Vec<MovementRecord>> {
    // both sides matter: a redeem has the enrollment id on inputs only
    let eids = enrollment_ids(record.inputs.iter().chain(record.outputs.iter()));
    let types = token_types(record.inputs.iter().chain(record.outputs.iter()));

    let all_outs: Vec<&AuditEntry> = record.outputs.iter().collect();
    let all_ins: Vec<&AuditEntry> = record.inputs.iter().collect();

    let mut movements = Vec::new();
    for eid in &eids {
        for token_type in &types {
            let received = sum_by(&all_outs, eid, token_type);
            let sent = sum_by(&all_ins, eid, token_type);
            if received == sent {
                continue;
            }
            let diff = received - &sent;
            tracing::debug!("adding movement [{eid}:{diff}]");
            movements.push(MovementRecord {
                tx_id: record.anchor.clone(),
                enrollment_id: eid.clone(),
                token_type: token_type.clone(),
                amount: diff,
                status: TxStatus::Pending,
                timestamp: created,
            });
        }
    }
    Ok(movements)
}
