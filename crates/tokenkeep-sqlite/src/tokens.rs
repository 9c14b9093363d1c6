//! SQLite-backed token store.
//!
//! Persists token outputs, ownerships, public parameters and
//! certifications. All writes go through an atomic-write handle; reads go
//! through a pool of read-only connections and never block the writer
//! (WAL mode). Iterators hold their own read-only connection and paginate
//! by keyset, so they stay lazy and single-pass without borrowing the pool.

use crate::backend::{classify, open_read_only, open_rw};
use crate::conditions::{where_clause, Cond, Conditions, Param};
use crate::read_pool::ReadPool;
use crate::schema::{self, TokenTables};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokenkeep_core::{
    Context, IssuedToken, QueryTokenDetailsParams, Result, SpendableToken, StoreConfig,
    StoreError, Token, TokenDetails, TokenId, TokenRecord, UnspentToken,
};

pub(crate) const ITERATOR_BATCH: usize = 256;

pub struct SqliteTokenStore {
    conn: Arc<Mutex<Connection>>,
    tables: TokenTables,
    read_pool: Arc<ReadPool>,
}

impl SqliteTokenStore {
    /// Open the store, creating the schema when configured to.
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let tables = TokenTables::new(&cfg.table_prefix);
        let conn = open_rw(&cfg)?;
        if cfg.create_schema {
            schema::init_schema(&conn, &schema::token_schema(&tables))?;
        }
        let read_pool = Arc::new(ReadPool::open(&cfg.path, cfg.read_pool_size)?);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables,
            read_pool,
        })
    }

    fn conditions(&self) -> Conditions {
        Conditions::new(self.tables.tokens.clone(), self.tables.ownership.clone())
    }

    fn join_clause(&self) -> String {
        format!(
            "LEFT JOIN {o} ON {t}.tx_id = {o}.tx_id AND {t}.idx = {o}.idx",
            t = self.tables.tokens,
            o = self.tables.ownership,
        )
    }

    fn with_read<R>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        ctx.check()?;
        let conn = self.read_pool.acquire();
        f(&conn)
    }

    /// Run a read-only closure on a pooled connection from a blocking
    /// thread, for callers on an async executor.
    pub async fn read_async<F, R>(&self, ctx: Context, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.read_pool.clone();
        tokio::task::spawn_blocking(move || {
            ctx.check()?;
            let conn = pool.acquire();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("read task failed: {e}")))?
    }

    /// Begin an atomic write. The returned handle must be committed or
    /// rolled back; dropping an unfinished handle rolls back.
    pub fn begin_atomic_write(&self) -> Result<TokenAtomicWrite<'_>> {
        let guard = self.conn.lock();
        guard
            .execute("BEGIN IMMEDIATE", [])
            .map_err(|e| classify(e, "beginning write transaction"))?;
        Ok(TokenAtomicWrite {
            conn: guard,
            tables: &self.tables,
            conditions: self.conditions(),
            join: self.join_clause(),
            state: TxnState::Active,
        })
    }

    /// One-shot convenience: store a token and its owners in a fresh
    /// atomic write.
    pub fn store_token(&self, ctx: &Context, record: &TokenRecord, owners: &[String]) -> Result<()> {
        let mut w = self.begin_atomic_write()?;
        if let Err(e) = w.store_token(ctx, record, owners) {
            if let Err(re) = w.rollback() {
                tracing::error!("error rolling back: {re}");
            }
            return Err(e);
        }
        w.commit()
    }

    /// Mark multiple tokens deleted in a single statement. An empty id
    /// list is a no-op.
    pub fn delete_tokens(&self, ctx: &Context, deleted_by: &str, ids: &[TokenId]) -> Result<()> {
        tracing::debug!("delete tokens [{deleted_by}][{}]", ids.len());
        if ids.is_empty() {
            return Ok(());
        }
        ctx.check()?;
        let cond = self.conditions().has_tokens("tx_id", "idx", ids);
        let rendered = cond.render(3);
        let sql = format!(
            "UPDATE {} SET is_deleted = true, spent_by = ?1, spent_at = ?2 WHERE {}",
            self.tables.tokens, rendered.sql
        );
        let mut args: Vec<Param> = vec![
            Param::Text(deleted_by.to_string()),
            Param::Timestamp(Utc::now()),
        ];
        args.extend(rendered.params);
        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(args.iter()))
            .map_err(|e| classify(e, "setting tokens to deleted"))?;
        Ok(())
    }

    /// True iff an owned, undeleted token row exists for the id.
    pub fn is_mine(&self, ctx: &Context, tx_id: &str, index: u64) -> Result<bool> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT tx_id FROM {} WHERE tx_id = ?1 AND idx = ?2 AND is_deleted = false AND owner = true LIMIT 1",
                self.tables.tokens
            );
            let found: Option<String> = conn
                .query_row(&sql, params![tx_id, index as i64], |row| row.get(0))
                .optional()
                .map_err(|e| classify(e, "querying token ownership"))?;
            Ok(found.as_deref() == Some(tx_id))
        })
    }

    /// Sum of the amounts of live tokens matching wallet and type. A null
    /// sum (no rows) is zero.
    pub fn balance(&self, ctx: &Context, wallet_id: &str, token_type: &str) -> Result<u64> {
        let cond = self.conditions().has_token_details(
            &QueryTokenDetailsParams {
                wallet_id: wallet_id.to_string(),
                token_type: token_type.to_string(),
                ..Default::default()
            },
            true,
        );
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT SUM(amount) FROM {} {} {}",
            self.tables.tokens,
            self.join_clause(),
            rendered.sql
        );
        self.with_read(ctx, |conn| {
            let sum: Option<i64> = conn
                .query_row(&sql, params_from_iter(rendered.params.iter()), |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| classify(e, "querying balance"))?
                .flatten();
            Ok(sum.unwrap_or(0) as u64)
        })
    }

    /// Iterator over all unspent tokens.
    pub fn unspent_tokens_iterator(&self, ctx: &Context) -> Result<UnspentTokensIterator> {
        self.unspent_tokens_iterator_by(ctx, "", "")
    }

    /// Iterator over unspent tokens restricted by wallet id and token type;
    /// either filter may be empty.
    pub fn unspent_tokens_iterator_by(
        &self,
        ctx: &Context,
        wallet_id: &str,
        token_type: &str,
    ) -> Result<UnspentTokensIterator> {
        let ci = self.conditions();
        let cond = ci.and(vec![
            ci.has_token_details(
                &QueryTokenDetailsParams {
                    wallet_id: wallet_id.to_string(),
                    token_type: token_type.to_string(),
                    ..Default::default()
                },
                true,
            ),
            Cond::Const(format!("{}.owner = true", self.tables.tokens)),
        ]);
        UnspentTokensIterator::new(
            self.read_pool.db_path(),
            self.tables.clone(),
            cond,
            ctx.clone(),
        )
    }

    /// Iterator over the selector-relevant fields of spendable tokens; the
    /// wallet id comes from the token row itself, no ownership join.
    pub fn spendable_tokens_iterator_by(
        &self,
        ctx: &Context,
        wallet_id: &str,
        token_type: &str,
    ) -> Result<SpendableTokensIterator> {
        let ci = self.conditions();
        let cond = ci.and(vec![
            ci.has_token_details(
                &QueryTokenDetailsParams {
                    wallet_id: wallet_id.to_string(),
                    token_type: token_type.to_string(),
                    ..Default::default()
                },
                false,
            ),
            Cond::Const("owner = true".to_string()),
        ]);
        SpendableTokensIterator::new(
            self.read_pool.db_path(),
            self.tables.clone(),
            cond,
            ctx.clone(),
        )
    }

    /// Eager form of [`unspent_tokens_iterator`].
    pub fn list_unspent_tokens(&self, ctx: &Context) -> Result<Vec<UnspentToken>> {
        self.unspent_tokens_iterator(ctx)?.collect()
    }

    /// Eager form of [`unspent_tokens_iterator_by`].
    pub fn list_unspent_tokens_by(
        &self,
        ctx: &Context,
        wallet_id: &str,
        token_type: &str,
    ) -> Result<Vec<UnspentToken>> {
        self.unspent_tokens_iterator_by(ctx, wallet_id, token_type)?
            .collect()
    }

    /// Audited tokens for the passed ids, in the order of the ids.
    pub fn list_audit_tokens(&self, ctx: &Context, ids: &[TokenId]) -> Result<Vec<Token>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ci = self.conditions();
        let cond = ci.and(vec![
            ci.has_tokens("tx_id", "idx", ids),
            Cond::Const("auditor = true".to_string()),
        ]);
        self.select_tokens_ordered(ctx, ids, &cond, "querying audit tokens")
    }

    /// Owned, undeleted tokens for the passed ids, in the order of the ids.
    pub fn get_tokens(&self, ctx: &Context, ids: &[TokenId]) -> Result<Vec<Token>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ci = self.conditions();
        let cond = ci.and(vec![
            ci.has_tokens("tx_id", "idx", ids),
            Cond::Const("is_deleted = false".to_string()),
            Cond::Const("owner = true".to_string()),
        ]);
        self.select_tokens_ordered(ctx, ids, &cond, "querying tokens")
    }

    /// Shared slot-fill algorithm: rows arrive in any order and are placed
    /// at every input position holding their id; the first unfilled slot
    /// turns into a NotFound for that id.
    fn select_tokens_ordered(
        &self,
        ctx: &Context,
        ids: &[TokenId],
        cond: &Cond,
        context: &str,
    ) -> Result<Vec<Token>> {
        let rendered = where_clause(cond, 1);
        let sql = format!(
            "SELECT tx_id, idx, owner_raw, token_type, quantity FROM {} {}",
            self.tables.tokens, rendered.sql
        );
        tracing::debug!(sql = %sql, "{context}");
        self.with_read(ctx, |conn| {
            let mut stmt = conn.prepare(&sql).map_err(|e| classify(e, context))?;
            let mut rows = stmt
                .query(params_from_iter(rendered.params.iter()))
                .map_err(|e| classify(e, context))?;

            let positions = positions_by_id(ids);
            let mut slots: Vec<Option<Token>> = vec![None; ids.len()];
            while let Some(row) = rows.next().map_err(|e| classify(e, context))? {
                let id = TokenId::new(
                    row.get::<_, String>(0).map_err(|e| classify(e, context))?,
                    row.get::<_, i64>(1).map_err(|e| classify(e, context))? as u64,
                );
                let token = Token {
                    owner_raw: row.get(2).map_err(|e| classify(e, context))?,
                    token_type: row.get(3).map_err(|e| classify(e, context))?,
                    quantity: row.get(4).map_err(|e| classify(e, context))?,
                };
                match positions.get(&id) {
                    Some(indices) => {
                        for &i in indices {
                            slots[i] = Some(token.clone());
                        }
                    }
                    None => {
                        return Err(StoreError::Backend(anyhow::anyhow!(
                            "retrieved wrong token [{id}]"
                        )))
                    }
                }
            }
            collect_slots(slots, ids)
        })
    }

    /// All tokens this node issued.
    pub fn list_history_issued_tokens(&self, ctx: &Context) -> Result<Vec<IssuedToken>> {
        let sql = format!(
            "SELECT tx_id, idx, owner_raw, token_type, quantity, issuer_raw FROM {} WHERE issuer = true",
            self.tables.tokens
        );
        self.with_read(ctx, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying issued tokens"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(IssuedToken {
                        id: TokenId::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64),
                        owner_raw: row.get(2)?,
                        token_type: row.get(3)?,
                        quantity: row.get(4)?,
                        issuer_raw: row.get(5)?,
                    })
                })
                .map_err(|e| classify(e, "querying issued tokens"))?;
            let mut tokens = Vec::new();
            for row in rows {
                tokens.push(row.map_err(|e| classify(e, "querying issued tokens"))?);
            }
            Ok(tokens)
        })
    }

    /// Invoke `callback` once per id, in input order, with the raw ledger
    /// bytes of each token.
    pub fn get_token_outputs(
        &self,
        ctx: &Context,
        ids: &[TokenId],
        mut callback: impl FnMut(&TokenId, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let tokens = self.get_ledger_tokens(ctx, ids)?;
        for (id, token) in ids.iter().zip(tokens.iter()) {
            callback(id, token)?;
        }
        Ok(())
    }

    /// Parallel arrays of ledger bytes and ledger metadata, ordered by the
    /// input ids.
    pub fn get_token_info_and_outputs(
        &self,
        ctx: &Context,
        ids: &[TokenId],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        self.get_ledger_tokens_and_meta(ctx, ids)
    }

    /// Ledger metadata only, ordered by the input ids.
    pub fn get_token_metadata(&self, ctx: &Context, ids: &[TokenId]) -> Result<Vec<Vec<u8>>> {
        let (_, metas) = self.get_ledger_tokens_and_meta(ctx, ids)?;
        Ok(metas)
    }

    fn get_ledger_tokens(&self, ctx: &Context, ids: &[TokenId]) -> Result<Vec<Vec<u8>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cond = self.conditions().has_tokens("tx_id", "idx", ids);
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT tx_id, idx, ledger FROM {} {}",
            self.tables.tokens, rendered.sql
        );
        self.with_read(ctx, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying ledger tokens"))?;
            let mut rows = stmt
                .query(params_from_iter(rendered.params.iter()))
                .map_err(|e| classify(e, "querying ledger tokens"))?;
            let mut by_id: HashMap<TokenId, Vec<u8>> = HashMap::with_capacity(ids.len());
            while let Some(row) = rows.next().map_err(|e| classify(e, "querying ledger tokens"))? {
                let id = TokenId::new(
                    row.get::<_, String>(0)
                        .map_err(|e| classify(e, "querying ledger tokens"))?,
                    row.get::<_, i64>(1)
                        .map_err(|e| classify(e, "querying ledger tokens"))? as u64,
                );
                let ledger: Vec<u8> = row
                    .get(2)
                    .map_err(|e| classify(e, "querying ledger tokens"))?;
                by_id.insert(id, ledger);
            }

            let mut tokens = Vec::with_capacity(ids.len());
            for id in ids {
                match by_id.get(id) {
                    None => {
                        return Err(StoreError::NotFound(format!(
                            "token not found for key [{}:{}]",
                            id.tx_id, id.index
                        )))
                    }
                    Some(raw) if raw.is_empty() => {
                        return Err(StoreError::EmptyToken(format!(
                            "empty token found for key [{}:{}]",
                            id.tx_id, id.index
                        )))
                    }
                    Some(raw) => tokens.push(raw.clone()),
                }
            }
            Ok(tokens)
        })
    }

    fn get_ledger_tokens_and_meta(
        &self,
        ctx: &Context,
        ids: &[TokenId],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        if ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let cond = self.conditions().has_tokens("tx_id", "idx", ids);
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT tx_id, idx, ledger, ledger_metadata FROM {} {}",
            self.tables.tokens, rendered.sql
        );
        self.with_read(ctx, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying ledger tokens"))?;
            let mut rows = stmt
                .query(params_from_iter(rendered.params.iter()))
                .map_err(|e| classify(e, "querying ledger tokens"))?;
            let mut by_id: HashMap<TokenId, (Vec<u8>, Vec<u8>)> = HashMap::with_capacity(ids.len());
            while let Some(row) = rows.next().map_err(|e| classify(e, "querying ledger tokens"))? {
                let id = TokenId::new(
                    row.get::<_, String>(0)
                        .map_err(|e| classify(e, "querying ledger tokens"))?,
                    row.get::<_, i64>(1)
                        .map_err(|e| classify(e, "querying ledger tokens"))? as u64,
                );
                let ledger: Vec<u8> = row
                    .get(2)
                    .map_err(|e| classify(e, "querying ledger tokens"))?;
                let meta: Vec<u8> = row
                    .get(3)
                    .map_err(|e| classify(e, "querying ledger tokens"))?;
                by_id.insert(id, (ledger, meta));
            }

            let mut tokens = Vec::with_capacity(ids.len());
            let mut metas = Vec::with_capacity(ids.len());
            for id in ids {
                match by_id.get(id) {
                    None => {
                        return Err(StoreError::NotFound(format!(
                            "token not found for key [{}:{}]",
                            id.tx_id, id.index
                        )))
                    }
                    Some((ledger, meta)) => {
                        tokens.push(ledger.clone());
                        metas.push(meta.clone());
                    }
                }
            }
            Ok((tokens, metas))
        })
    }

    /// Details of tokens matching the cumulative filters, spent or not. A
    /// token owned by N wallets appears N times unless an enrollment
    /// filter narrows the join.
    pub fn query_token_details(
        &self,
        ctx: &Context,
        params: &QueryTokenDetailsParams,
    ) -> Result<Vec<TokenDetails>> {
        let cond = self.conditions().has_token_details(params, true);
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT {t}.tx_id, {t}.idx, owner_identity, owner_type, COALESCE({o}.wallet_id, ''), token_type, amount, is_deleted, spent_by, stored_at \
             FROM {t} {join} {where_}",
            t = self.tables.tokens,
            o = self.tables.ownership,
            join = self.join_clause(),
            where_ = rendered.sql,
        );
        tracing::debug!(sql = %sql, "querying token details");
        self.with_read(ctx, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying token details"))?;
            let rows = stmt
                .query_map(params_from_iter(rendered.params.iter()), |row| {
                    Ok(TokenDetails {
                        tx_id: row.get(0)?,
                        index: row.get::<_, i64>(1)? as u64,
                        owner_identity: row.get(2)?,
                        owner_type: row.get(3)?,
                        owner_enrollment: row.get(4)?,
                        token_type: row.get(5)?,
                        amount: row.get::<_, i64>(6)? as u64,
                        is_deleted: row.get(7)?,
                        spent_by: row.get(8)?,
                        stored_at: row.get(9)?,
                    })
                })
                .map_err(|e| classify(e, "querying token details"))?;
            let mut details = Vec::new();
            for row in rows {
                details.push(row.map_err(|e| classify(e, "querying token details"))?);
            }
            Ok(details)
        })
    }

    /// Parallel arrays telling which transaction deleted each passed token
    /// and whether it is deleted at all, ordered by the input ids.
    pub fn who_deleted_tokens(
        &self,
        ctx: &Context,
        ids: &[TokenId],
    ) -> Result<(Vec<String>, Vec<bool>)> {
        if ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let cond = self.conditions().has_tokens("tx_id", "idx", ids);
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT tx_id, idx, spent_by, is_deleted FROM {} {}",
            self.tables.tokens, rendered.sql
        );
        self.with_read(ctx, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying deleted tokens"))?;
            let mut rows = stmt
                .query(params_from_iter(rendered.params.iter()))
                .map_err(|e| classify(e, "querying deleted tokens"))?;

            let positions = positions_by_id(ids);
            let mut spent_by = vec![String::new(); ids.len()];
            let mut is_deleted = vec![false; ids.len()];
            let mut found = vec![false; ids.len()];
            while let Some(row) = rows.next().map_err(|e| classify(e, "querying deleted tokens"))? {
                let id = TokenId::new(
                    row.get::<_, String>(0)
                        .map_err(|e| classify(e, "querying deleted tokens"))?,
                    row.get::<_, i64>(1)
                        .map_err(|e| classify(e, "querying deleted tokens"))? as u64,
                );
                let by: String = row
                    .get(2)
                    .map_err(|e| classify(e, "querying deleted tokens"))?;
                let deleted: bool = row
                    .get(3)
                    .map_err(|e| classify(e, "querying deleted tokens"))?;
                if let Some(indices) = positions.get(&id) {
                    for &i in indices {
                        spent_by[i] = by.clone();
                        is_deleted[i] = deleted;
                        found[i] = true;
                    }
                }
            }
            for (j, f) in found.iter().enumerate() {
                if !f {
                    return Err(StoreError::NotFound(format!(
                        "token not found for key [{}:{}]",
                        ids[j].tx_id, ids[j].index
                    )));
                }
            }
            Ok((spent_by, is_deleted))
        })
    }

    /// Any token row with this transaction id.
    pub fn transaction_exists(&self, ctx: &Context, tx_id: &str) -> Result<bool> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT tx_id FROM {} WHERE tx_id = ?1 LIMIT 1",
                self.tables.tokens
            );
            let found: Option<String> = conn
                .query_row(&sql, params![tx_id], |row| row.get(0))
                .optional()
                .map_err(|e| classify(e, "checking transaction existence"))?;
            Ok(found.is_some())
        })
    }

    /// Append a public-parameters row.
    pub fn store_public_params(&self, ctx: &Context, raw: &[u8]) -> Result<()> {
        ctx.check()?;
        let sql = format!(
            "INSERT INTO {} (raw, stored_at) VALUES (?1, ?2)",
            self.tables.public_params
        );
        tracing::debug!("store public parameters ({} bytes)", raw.len());
        let conn = self.conn.lock();
        conn.execute(&sql, params![raw, Utc::now()])
            .map_err(|e| classify(e, "storing public parameters"))?;
        Ok(())
    }

    /// The most recent public-parameters row, or empty when none exists.
    pub fn public_params(&self, ctx: &Context) -> Result<Vec<u8>> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT raw FROM {} ORDER BY stored_at DESC LIMIT 1",
                self.tables.public_params
            );
            let raw: Option<Vec<u8>> = conn
                .query_row(&sql, [], |row| row.get(0))
                .optional()
                .map_err(|e| classify(e, "querying public parameters"))?;
            Ok(raw.unwrap_or_default())
        })
    }

    /// Store certifications in a single atomic batch.
    pub fn store_certifications(
        &self,
        ctx: &Context,
        certifications: &[(TokenId, Vec<u8>)],
    ) -> Result<()> {
        ctx.check()?;
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO {} (tx_id, idx, certification, stored_at) VALUES (?1, ?2, ?3, ?4)",
            self.tables.certifications
        );
        let mut guard = self.conn.lock();
        let tx = guard
            .transaction()
            .map_err(|e| classify(e, "beginning certification transaction"))?;
        for (id, certification) in certifications {
            if id.tx_id.is_empty() {
                return Err(StoreError::InvalidArgument(
                    "invalid token id, cannot be empty".to_string(),
                ));
            }
            tx.execute(&sql, params![id.tx_id, id.index as i64, certification, now])
                .map_err(|e| classify(e, "storing certification"))?;
        }
        tx.commit()
            .map_err(|e| classify(e, "committing certifications"))?;
        Ok(())
    }

    /// True iff a non-empty certification exists for the id. Errors and
    /// empty payloads come back as false; empty payloads are warn-logged.
    pub fn exists_certification(&self, ctx: &Context, id: &TokenId) -> bool {
        let result = self.with_read(ctx, |conn| {
            let cond = self.conditions().has_tokens("tx_id", "idx", std::slice::from_ref(id));
            let rendered = where_clause(&cond, 1);
            let sql = format!(
                "SELECT certification FROM {} {}",
                self.tables.certifications, rendered.sql
            );
            let certification: Option<Vec<u8>> = conn
                .query_row(&sql, params_from_iter(rendered.params.iter()), |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| classify(e, "checking certification existence"))?;
            Ok(certification)
        });
        match result {
            Ok(Some(certification)) => {
                if certification.is_empty() {
                    tracing::warn!(
                        "tried to check certification existence for token id [{id}], got an empty certification"
                    );
                    return false;
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("tried to check certification existence for token id [{id}], err {e}");
                false
            }
        }
    }

    /// Certifications for the passed ids, in input order. A missing or
    /// empty certification fails the whole call.
    pub fn get_certifications(&self, ctx: &Context, ids: &[TokenId]) -> Result<Vec<Vec<u8>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cond = self.conditions().has_tokens("tx_id", "idx", ids);
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT tx_id, idx, certification FROM {} {}",
            self.tables.certifications, rendered.sql
        );
        self.with_read(ctx, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying certifications"))?;
            let mut rows = stmt
                .query(params_from_iter(rendered.params.iter()))
                .map_err(|e| classify(e, "querying certifications"))?;
            let mut by_id: HashMap<TokenId, Vec<u8>> = HashMap::with_capacity(ids.len());
            while let Some(row) = rows.next().map_err(|e| classify(e, "querying certifications"))? {
                let id = TokenId::new(
                    row.get::<_, String>(0)
                        .map_err(|e| classify(e, "querying certifications"))?,
                    row.get::<_, i64>(1)
                        .map_err(|e| classify(e, "querying certifications"))? as u64,
                );
                let certification: Vec<u8> = row
                    .get(2)
                    .map_err(|e| classify(e, "querying certifications"))?;
                by_id.insert(id, certification);
            }

            let mut certifications = Vec::with_capacity(ids.len());
            for id in ids {
                match by_id.get(id) {
                    None => {
                        return Err(StoreError::NotCertified(format!(
                            "token [{id}] was not certified"
                        )))
                    }
                    Some(cert) if cert.is_empty() => {
                        return Err(StoreError::NotCertified(format!(
                            "empty certification for [{id}]"
                        )))
                    }
                    Some(cert) => certifications.push(cert.clone()),
                }
            }
            Ok(certifications)
        })
    }
}

fn positions_by_id(ids: &[TokenId]) -> HashMap<TokenId, Vec<usize>> {
    let mut positions: HashMap<TokenId, Vec<usize>> = HashMap::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        positions.entry(id.clone()).or_default().push(i);
    }
    positions
}

fn collect_slots(slots: Vec<Option<Token>>, ids: &[TokenId]) -> Result<Vec<Token>> {
    let mut tokens = Vec::with_capacity(slots.len());
    for (j, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(token) => tokens.push(token),
            None => {
                return Err(StoreError::NotFound(format!(
                    "token not found for key [{}:{}]",
                    ids[j].tx_id, ids[j].index
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

impl TxnState {
    fn describe(self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Committed => "committed",
            TxnState::RolledBack => "rolled back",
        }
    }
}

/// Atomic write handle over the token store.
///
/// Statement order within the handle is preserved. After commit or
/// rollback the handle is invalid; any further call returns `IllegalState`.
/// Dropping an unfinished handle rolls back.
pub struct TokenAtomicWrite<'a> {
    conn: MutexGuard<'a, Connection>,
    tables: &'a TokenTables,
    conditions: Conditions,
    join: String,
    state: TxnState,
}

impl<'a> TokenAtomicWrite<'a> {
    fn ensure_active(&self, op: &str) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(StoreError::IllegalState(format!(
                "write transaction already {}: cannot {op}",
                self.state.describe()
            )));
        }
        Ok(())
    }

    /// Insert one token row plus one ownership row per owner. A token
    /// flagged as owned must carry at least one owner or a wallet id.
    pub fn store_token(
        &mut self,
        ctx: &Context,
        record: &TokenRecord,
        owners: &[String],
    ) -> Result<()> {
        self.ensure_active("store token")?;
        ctx.check()?;
        if record.owner
            && owners.is_empty()
            && record.owner_wallet_id.as_deref().unwrap_or("").is_empty()
        {
            return Err(StoreError::InvalidArgument(format!(
                "no owners specified for token [{}:{}]",
                record.tx_id, record.index
            )));
        }

        let now = Utc::now();
        let sql = format!(
            "INSERT INTO {} (tx_id, idx, issuer_raw, owner_raw, owner_type, owner_identity, owner_wallet_id, ledger, ledger_metadata, token_type, quantity, amount, stored_at, owner, auditor, issuer) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            self.tables.tokens
        );
        tracing::debug!(
            "store record [{}:{},{}]",
            record.tx_id,
            record.index,
            owners.len()
        );
        self.conn
            .execute(
                &sql,
                params![
                    record.tx_id,
                    record.index as i64,
                    record.issuer_raw,
                    record.owner_raw,
                    record.owner_type,
                    record.owner_identity,
                    record.owner_wallet_id,
                    record.ledger,
                    record.ledger_metadata,
                    record.token_type,
                    record.quantity,
                    record.amount as i64,
                    now,
                    record.owner,
                    record.auditor,
                    record.issuer,
                ],
            )
            .map_err(|e| {
                classify(
                    e,
                    &format!("storing token [{}:{}]", record.tx_id, record.index),
                )
            })?;

        let ownership_sql = format!(
            "INSERT INTO {} (tx_id, idx, wallet_id) VALUES (?1, ?2, ?3)",
            self.tables.ownership
        );
        for wallet_id in owners {
            self.conn
                .execute(
                    &ownership_sql,
                    params![record.tx_id, record.index as i64, wallet_id],
                )
                .map_err(|e| {
                    classify(
                        e,
                        &format!("storing token ownership [{}:{}]", record.tx_id, record.index),
                    )
                })?;
        }
        Ok(())
    }

    /// Mark a token deleted. Idempotent: deleting an already-deleted token
    /// updates spent_by/spent_at and is not an error. Ownership rows are
    /// kept, history is preserved.
    pub fn delete_token(
        &mut self,
        ctx: &Context,
        tx_id: &str,
        index: u64,
        deleted_by: &str,
    ) -> Result<()> {
        self.ensure_active("delete token")?;
        ctx.check()?;
        let sql = format!(
            "UPDATE {} SET is_deleted = true, spent_by = ?1, spent_at = ?2 WHERE tx_id = ?3 AND idx = ?4",
            self.tables.tokens
        );
        self.conn
            .execute(&sql, params![deleted_by, Utc::now(), tx_id, index as i64])
            .map_err(|e| classify(e, &format!("setting token to deleted [{tx_id}:{index}]")))?;
        Ok(())
    }

    /// Read a token through the open write transaction, together with the
    /// wallet ids owning it. Returns `None` for the token when no row
    /// matches (the owner list may still name wallets).
    pub fn get_token(
        &mut self,
        ctx: &Context,
        tx_id: &str,
        index: u64,
        include_deleted: bool,
    ) -> Result<(Option<Token>, Vec<String>)> {
        self.ensure_active("get token")?;
        ctx.check()?;
        let cond = self.conditions.has_token_details(
            &QueryTokenDetailsParams {
                ids: vec![TokenId::new(tx_id, index)],
                include_deleted,
                ..Default::default()
            },
            true,
        );
        let rendered = where_clause(&cond, 1);
        let sql = format!(
            "SELECT owner_raw, token_type, quantity, {o}.wallet_id, owner_wallet_id FROM {t} {join} {where_}",
            t = self.tables.tokens,
            o = self.tables.ownership,
            join = self.join,
            where_ = rendered.sql,
        );

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| classify(e, "querying token"))?;
        let mut rows = stmt
            .query(params_from_iter(rendered.params.iter()))
            .map_err(|e| classify(e, "querying token"))?;

        let mut raw: Vec<u8> = Vec::new();
        let mut token_type = String::new();
        let mut quantity = String::new();
        let mut wallet_id: Option<String> = None;
        let mut owners = Vec::new();
        while let Some(row) = rows.next().map_err(|e| classify(e, "querying token"))? {
            raw = row.get(0).map_err(|e| classify(e, "querying token"))?;
            token_type = row.get(1).map_err(|e| classify(e, "querying token"))?;
            quantity = row.get(2).map_err(|e| classify(e, "querying token"))?;
            let owner: Option<String> = row.get(3).map_err(|e| classify(e, "querying token"))?;
            wallet_id = row.get(4).map_err(|e| classify(e, "querying token"))?;
            if let Some(owner) = owner {
                if !owner.is_empty() {
                    owners.push(owner);
                }
            }
        }
        if let Some(wallet_id) = wallet_id {
            if !wallet_id.is_empty() {
                owners.push(wallet_id);
            }
        }
        if raw.is_empty() {
            return Ok((None, owners));
        }
        Ok((
            Some(Token {
                owner_raw: raw,
                token_type,
                quantity,
            }),
            owners,
        ))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        let started = std::time::Instant::now();
        self.conn
            .execute("COMMIT", [])
            .map_err(|e| classify(e, "committing write transaction"))?;
        self.state = TxnState::Committed;
        tokenkeep_core::observe::record_commit(started.elapsed());
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("rollback")?;
        self.conn
            .execute("ROLLBACK", [])
            .map_err(|e| classify(e, "rolling back write transaction"))?;
        self.state = TxnState::RolledBack;
        Ok(())
    }
}

impl<'a> Drop for TokenAtomicWrite<'a> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            tracing::debug!("rolling back unfinished token write transaction");
            let _ = self.conn.execute("ROLLBACK", []);
        }
    }
}

/// Lazy iterator over unspent tokens. Holds its own backend cursor (a
/// dedicated read-only connection) and fetches rows in keyset-paginated
/// batches; not safe for concurrent use. The cursor closes on drop.
pub struct UnspentTokensIterator {
    conn: Connection,
    tables: TokenTables,
    cond: Cond,
    ctx: Context,
    cursor: Option<(String, i64, String)>,
    buf: VecDeque<UnspentToken>,
    done: bool,
}

impl UnspentTokensIterator {
    fn new(
        db_path: &std::path::Path,
        tables: TokenTables,
        cond: Cond,
        ctx: Context,
    ) -> Result<Self> {
        let conn = open_read_only(db_path)?;
        let mut it = Self {
            conn,
            tables,
            cond,
            ctx,
            cursor: None,
            buf: VecDeque::new(),
            done: false,
        };
        it.fetch_batch()?;
        Ok(it)
    }

    fn fetch_batch(&mut self) -> Result<()> {
        self.ctx.check()?;
        let wallet_col = format!("COALESCE({}.wallet_id, '')", self.tables.ownership);
        let mut parts = vec![self.cond.clone()];
        if let Some((tx_id, idx, wallet)) = &self.cursor {
            parts.push(Cond::RowGt {
                columns: vec![
                    format!("{}.tx_id", self.tables.tokens),
                    format!("{}.idx", self.tables.tokens),
                    wallet_col.clone(),
                ],
                values: vec![
                    Param::Text(tx_id.clone()),
                    Param::Int(*idx),
                    Param::Text(wallet.clone()),
                ],
            });
        }
        let rendered = where_clause(&Cond::And(parts), 1);
        let sql = format!(
            "SELECT {t}.tx_id, {t}.idx, {t}.owner_raw, {t}.token_type, {t}.quantity, {wallet_col} \
             FROM {t} LEFT JOIN {o} ON {t}.tx_id = {o}.tx_id AND {t}.idx = {o}.idx \
             {where_} ORDER BY {t}.tx_id, {t}.idx, {wallet_col} LIMIT {limit}",
            t = self.tables.tokens,
            o = self.tables.ownership,
            where_ = rendered.sql,
            limit = ITERATOR_BATCH,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| classify(e, "querying unspent tokens"))?;
        let mut rows = stmt
            .query(params_from_iter(rendered.params.iter()))
            .map_err(|e| classify(e, "querying unspent tokens"))?;
        let mut fetched = 0;
        while let Some(row) = rows.next().map_err(|e| classify(e, "querying unspent tokens"))? {
            let tx_id: String = row.get(0).map_err(|e| classify(e, "querying unspent tokens"))?;
            let idx: i64 = row.get(1).map_err(|e| classify(e, "querying unspent tokens"))?;
            let wallet: String = row.get(5).map_err(|e| classify(e, "querying unspent tokens"))?;
            self.buf.push_back(UnspentToken {
                id: TokenId::new(tx_id.clone(), idx as u64),
                owner_raw: row.get(2).map_err(|e| classify(e, "querying unspent tokens"))?,
                token_type: row.get(3).map_err(|e| classify(e, "querying unspent tokens"))?,
                quantity: row.get(4).map_err(|e| classify(e, "querying unspent tokens"))?,
            });
            self.cursor = Some((tx_id, idx, wallet));
            fetched += 1;
        }
        if fetched < ITERATOR_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for UnspentTokensIterator {
    type Item = Result<UnspentToken>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.fetch_batch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

/// Lazy iterator over the selector-relevant fields of spendable tokens.
/// Same cursor discipline as [`UnspentTokensIterator`].
pub struct SpendableTokensIterator {
    conn: Connection,
    tables: TokenTables,
    cond: Cond,
    ctx: Context,
    cursor: Option<(String, i64)>,
    buf: VecDeque<SpendableToken>,
    done: bool,
}

impl SpendableTokensIterator {
    fn new(
        db_path: &std::path::Path,
        tables: TokenTables,
        cond: Cond,
        ctx: Context,
    ) -> Result<Self> {
        let conn = open_read_only(db_path)?;
        let mut it = Self {
            conn,
            tables,
            cond,
            ctx,
            cursor: None,
            buf: VecDeque::new(),
            done: false,
        };
        it.fetch_batch()?;
        Ok(it)
    }

    fn fetch_batch(&mut self) -> Result<()> {
        self.ctx.check()?;
        let mut parts = vec![self.cond.clone()];
        if let Some((tx_id, idx)) = &self.cursor {
            parts.push(Cond::RowGt {
                columns: vec!["tx_id".to_string(), "idx".to_string()],
                values: vec![Param::Text(tx_id.clone()), Param::Int(*idx)],
            });
        }
        let rendered = where_clause(&Cond::And(parts), 1);
        let sql = format!(
            "SELECT tx_id, idx, token_type, quantity, COALESCE(owner_wallet_id, '') FROM {t} \
             {where_} ORDER BY tx_id, idx LIMIT {limit}",
            t = self.tables.tokens,
            where_ = rendered.sql,
            limit = ITERATOR_BATCH,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| classify(e, "querying spendable tokens"))?;
        let mut rows = stmt
            .query(params_from_iter(rendered.params.iter()))
            .map_err(|e| classify(e, "querying spendable tokens"))?;
        let mut fetched = 0;
        while let Some(row) = rows
            .next()
            .map_err(|e| classify(e, "querying spendable tokens"))?
        {
            let tx_id: String = row
                .get(0)
                .map_err(|e| classify(e, "querying spendable tokens"))?;
            let idx: i64 = row
                .get(1)
                .map_err(|e| classify(e, "querying spendable tokens"))?;
            self.buf.push_back(SpendableToken {
                id: TokenId::new(tx_id.clone(), idx as u64),
                token_type: row
                    .get(2)
                    .map_err(|e| classify(e, "querying spendable tokens"))?,
                quantity: row
                    .get(3)
                    .map_err(|e| classify(e, "querying spendable tokens"))?,
                wallet_id: row
                    .get(4)
                    .map_err(|e| classify(e, "querying spendable tokens"))?,
            });
            self.cursor = Some((tx_id, idx));
            fetched += 1;
        }
        if fetched < ITERATOR_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for SpendableTokensIterator {
    type Item = Result<SpendableToken>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.fetch_batch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}
