//! PostgreSQL bridge store
//!
//! Status changes are atomic CAS updates (`WHERE status = expected`). Scanned
//! events are inserted with `ON CONFLICT DO NOTHING` in the same transaction as
//! the cursor upsert, and the cursor upsert itself never moves backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};

use super::error::BridgeError;
use super::state::{
    DepositState, FallbackStatus, SettlementStatus, WithdrawStatus, ensure_deposit_transition,
    ensure_settlement_transition, ensure_withdraw_transition,
};
use super::store::{
    CursorStore, DepositStore, LedgerStore, RechargeNotification, Result, WithdrawStore,
};
use super::types::{
    ChainKind, CustodySubmission, DepositPatch, DepositRecord, IndexCursor, RollupDepositRecord,
    SettlementLedgerEntry, TransferEvent, WithdrawCheck, WithdrawEvent, WithdrawRecord,
};

const DEPOSIT_COLUMNS: &str = r#"
    id, btc_block_number, btc_tx_index, btc_tx_hash, btc_from, btc_froms::text AS btc_froms,
    btc_to, btc_value, btc_block_time, btc_from_aa_address, mint_status, mint_tx_hash,
    mint_retry, fallback_status, fallback_tx_hash, fallback_raw_tx, settlement_status,
    settlement_retry, callback_status, last_error, created_at, updated_at
"#;

const WITHDRAW_COLUMNS: &str = r#"
    id, request_id, rollup_block_number, rollup_block_hash, rollup_tx_hash, rollup_tx_index, rollup_log_index,
    rollup_tx_from, btc_from, btc_to, btc_value, btc_real_value, fee, uuid, status, btc_tx_hash,
    retry, last_error, created_at, updated_at
"#;

const CALLBACK_CONFIRMED: i16 = 1;

pub struct PgBridgeStore {
    pool: PgPool,
}

impl PgBridgeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_deposit(row: &PgRow) -> Result<DepositRecord> {
        let mint_status: i16 = row.try_get("mint_status")?;
        let mint_status = DepositState::from_id(mint_status)
            .ok_or_else(|| BridgeError::InvalidRecord(format!("mint_status {}", mint_status)))?;
        let settlement_status: i16 = row.try_get("settlement_status")?;
        let settlement_status = SettlementStatus::from_id(settlement_status).ok_or_else(|| {
            BridgeError::InvalidRecord(format!("settlement_status {}", settlement_status))
        })?;
        let fallback_status: Option<i16> = row.try_get("fallback_status")?;
        let froms: String = row.try_get("btc_froms")?;
        let callback_status: i16 = row.try_get("callback_status")?;

        Ok(DepositRecord {
            id: row.try_get("id")?,
            btc_block_number: row.try_get::<i64, _>("btc_block_number")? as u64,
            btc_tx_index: row.try_get::<i64, _>("btc_tx_index")? as u32,
            btc_tx_hash: row.try_get("btc_tx_hash")?,
            btc_from: row.try_get("btc_from")?,
            btc_froms: serde_json::from_str(&froms)?,
            btc_to: row.try_get("btc_to")?,
            btc_value: row.try_get::<i64, _>("btc_value")? as u64,
            btc_block_time: row.try_get("btc_block_time")?,
            btc_from_aa_address: row.try_get("btc_from_aa_address")?,
            mint_status,
            mint_tx_hash: row.try_get("mint_tx_hash")?,
            mint_retry: row.try_get("mint_retry")?,
            fallback_status: fallback_status.and_then(FallbackStatus::from_id),
            fallback_tx_hash: row.try_get("fallback_tx_hash")?,
            fallback_raw_tx: row.try_get("fallback_raw_tx")?,
            settlement_status,
            settlement_retry: row.try_get("settlement_retry")?,
            callback_confirmed: callback_status == CALLBACK_CONFIRMED,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_withdraw(row: &PgRow) -> Result<WithdrawRecord> {
        let status: i16 = row.try_get("status")?;
        let status = WithdrawStatus::from_id(status)
            .ok_or_else(|| BridgeError::InvalidRecord(format!("withdraw status {}", status)))?;

        Ok(WithdrawRecord {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            rollup_block_number: row.try_get::<i64, _>("rollup_block_number")? as u64,
            rollup_block_hash: row.try_get("rollup_block_hash")?,
            rollup_tx_hash: row.try_get("rollup_tx_hash")?,
            rollup_tx_index: row.try_get::<i64, _>("rollup_tx_index")? as u32,
            rollup_log_index: row.try_get::<i64, _>("rollup_log_index")? as u32,
            rollup_tx_from: row.try_get("rollup_tx_from")?,
            btc_from: row.try_get("btc_from")?,
            btc_to: row.try_get("btc_to")?,
            btc_value: row.try_get::<i64, _>("btc_value")? as u64,
            btc_real_value: row.try_get::<i64, _>("btc_real_value")? as u64,
            fee: row.try_get::<i64, _>("fee")? as u64,
            uuid: row.try_get("uuid")?,
            status,
            btc_tx_hash: row.try_get("btc_tx_hash")?,
            retry: row.try_get("retry")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Monotonic cursor upsert; returns whether the row changed
async fn upsert_cursor<'e, E: PgExecutor<'e>>(executor: E, cursor: &IndexCursor) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO index_cursor (chain_id, block_height, tx_index, log_index, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (chain_id) DO UPDATE
        SET block_height = EXCLUDED.block_height,
            tx_index = EXCLUDED.tx_index,
            log_index = EXCLUDED.log_index,
            updated_at = NOW()
        WHERE (index_cursor.block_height, index_cursor.tx_index, index_cursor.log_index)
            < (EXCLUDED.block_height, EXCLUDED.tx_index, EXCLUDED.log_index)
        "#,
    )
    .bind(cursor.chain.as_str())
    .bind(cursor.height as i64)
    .bind(cursor.tx_index as i64)
    .bind(cursor.log_index as i64)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl CursorStore for PgBridgeStore {
    async fn load_cursor(&self, chain: ChainKind) -> Result<Option<IndexCursor>> {
        let row = sqlx::query(
            "SELECT block_height, tx_index, log_index FROM index_cursor WHERE chain_id = $1",
        )
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(IndexCursor::at_log(
                chain,
                row.try_get::<i64, _>("block_height")? as u64,
                row.try_get::<i64, _>("tx_index")? as u32,
                row.try_get::<i64, _>("log_index")? as u32,
            ))),
            None => Ok(None),
        }
    }

    async fn save_cursor(&self, cursor: &IndexCursor) -> Result<bool> {
        upsert_cursor(&self.pool, cursor).await
    }
}

#[async_trait]
impl DepositStore for PgBridgeStore {
    async fn insert_deposit_with_cursor(
        &self,
        event: &TransferEvent,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO deposit_history
                (btc_block_number, btc_tx_index, btc_tx_hash, btc_from, btc_froms, btc_to,
                 btc_value, btc_block_time, mint_status, settlement_status)
            VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7, $8, $9, $10)
            ON CONFLICT (btc_tx_hash) DO NOTHING
            "#,
        )
        .bind(event.block_height as i64)
        .bind(event.tx_index as i64)
        .bind(&event.tx_id)
        .bind(event.primary_sender())
        .bind(serde_json::to_string(&event.from_addresses)?)
        .bind(&event.to_address)
        .bind(event.amount as i64)
        .bind(event.block_time)
        .bind(DepositState::Pending.id())
        .bind(SettlementStatus::Pending.id())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        upsert_cursor(&mut *tx, cursor).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_deposit(&self, id: i64) -> Result<Option<DepositRecord>> {
        let sql = format!("SELECT {} FROM deposit_history WHERE id = $1", DEPOSIT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_deposit).transpose()
    }

    async fn get_deposit_by_tx_hash(&self, btc_tx_hash: &str) -> Result<Option<DepositRecord>> {
        let sql = format!(
            "SELECT {} FROM deposit_history WHERE btc_tx_hash = $1",
            DEPOSIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(btc_tx_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_deposit).transpose()
    }

    async fn find_deposits_in(
        &self,
        states: &[DepositState],
        limit: usize,
    ) -> Result<Vec<DepositRecord>> {
        let ids: Vec<i16> = states.iter().map(DepositState::id).collect();
        let sql = format!(
            "SELECT {} FROM deposit_history WHERE mint_status = ANY($1) ORDER BY id ASC LIMIT $2",
            DEPOSIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_deposit).collect()
    }

    async fn find_stale_deposits(
        &self,
        state: DepositState,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DepositRecord>> {
        let sql = format!(
            r#"SELECT {} FROM deposit_history
               WHERE mint_status = $1 AND updated_at < $2
               ORDER BY id ASC LIMIT $3"#,
            DEPOSIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(state.id())
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_deposit).collect()
    }

    async fn transition_deposit(
        &self,
        id: i64,
        from: DepositState,
        to: DepositState,
        patch: &DepositPatch,
    ) -> Result<bool> {
        ensure_deposit_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE deposit_history
            SET mint_status = $1,
                fallback_status = COALESCE($2, fallback_status),
                mint_tx_hash = COALESCE($3, mint_tx_hash),
                fallback_tx_hash = COALESCE($4, fallback_tx_hash),
                fallback_raw_tx = COALESCE($5, fallback_raw_tx),
                btc_from_aa_address = COALESCE($6, btc_from_aa_address),
                last_error = COALESCE($7, last_error),
                updated_at = NOW()
            WHERE id = $8 AND mint_status = $9
            "#,
        )
        .bind(to.id())
        .bind(FallbackStatus::for_state(to).map(|s| s.id()))
        .bind(&patch.mint_tx_hash)
        .bind(&patch.fallback_tx_hash)
        .bind(&patch.fallback_raw_tx)
        .bind(&patch.resolved_address)
        .bind(&patch.last_error)
        .bind(id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_deposit_retry(&self, id: i64, last_error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deposit_history
            SET mint_retry = mint_retry + 1, last_error = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_deposits_by_settlement(
        &self,
        status: SettlementStatus,
        mint_states: &[DepositState],
        limit: usize,
    ) -> Result<Vec<DepositRecord>> {
        let ids: Vec<i16> = mint_states.iter().map(DepositState::id).collect();
        let sql = format!(
            r#"SELECT {} FROM deposit_history
               WHERE settlement_status = $1
                 AND (cardinality($2::smallint[]) = 0 OR mint_status = ANY($2))
               ORDER BY id ASC LIMIT $3"#,
            DEPOSIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.id())
            .bind(ids)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_deposit).collect()
    }

    async fn transition_settlement(
        &self,
        id: i64,
        from: SettlementStatus,
        to: SettlementStatus,
    ) -> Result<bool> {
        ensure_settlement_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE deposit_history
            SET settlement_status = $1, updated_at = NOW()
            WHERE id = $2 AND settlement_status = $3
            "#,
        )
        .bind(to.id())
        .bind(id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_settlement_retry(&self, id: i64, last_error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deposit_history
            SET settlement_retry = settlement_retry + 1, last_error = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_rollup_deposit(&self, btc_tx_hash: &str) -> Result<Option<RollupDepositRecord>> {
        let row = sqlx::query(
            r#"
            SELECT rollup_block_number, rollup_block_hash, rollup_tx_hash, rollup_tx_index,
                   rollup_log_index, rollup_tx_from, btc_from_aa_address, btc_value, btc_tx_hash
            FROM rollup_deposit_history
            WHERE btc_tx_hash = $1
            ORDER BY rollup_block_number ASC, rollup_tx_index ASC, rollup_log_index ASC
            LIMIT 1
            "#,
        )
        .bind(btc_tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<RollupDepositRecord> {
            Ok(RollupDepositRecord {
                block_number: row.try_get::<i64, _>("rollup_block_number")? as u64,
                block_hash: row.try_get("rollup_block_hash")?,
                tx_hash: row.try_get("rollup_tx_hash")?,
                tx_index: row.try_get::<i64, _>("rollup_tx_index")? as u32,
                log_index: row.try_get::<i64, _>("rollup_log_index")? as u32,
                caller: row.try_get("rollup_tx_from")?,
                to_address: row.try_get("btc_from_aa_address")?,
                amount: row.try_get::<i64, _>("btc_value")? as u64,
                btc_tx_hash: row.try_get("btc_tx_hash")?,
            })
        })
        .transpose()
    }

    async fn record_mint_credit(
        &self,
        id: i64,
        rollup_tx_hash: &str,
        aa_address: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deposit_history
            SET mint_tx_hash = $1,
                btc_from_aa_address = COALESCE(btc_from_aa_address, $2),
                updated_at = NOW()
            WHERE id = $3 AND mint_status = $4 AND mint_tx_hash IS NULL
            "#,
        )
        .bind(rollup_tx_hash)
        .bind(aa_address)
        .bind(id)
        .bind(DepositState::MintFailed.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_recharge_notification(
        &self,
        notification: &RechargeNotification,
        deposit_id: Option<i64>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO custody_callback
                (request_id, request_type, tx_hash, btc_from, btc_to, btc_value, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(&notification.request_id)
        .bind(notification.request_type)
        .bind(&notification.tx_hash)
        .bind(&notification.from)
        .bind(&notification.to)
        .bind(notification.amount as i64)
        .bind(&notification.raw)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(id) = deposit_id {
            sqlx::query(
                "UPDATE deposit_history SET callback_status = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(CALLBACK_CONFIRMED)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_deposit_from_notify(
        &self,
        notification: &RechargeNotification,
    ) -> Result<bool> {
        let froms = serde_json::to_string(&[&notification.from])?;
        let result = sqlx::query(
            r#"
            INSERT INTO deposit_history
                (btc_block_number, btc_tx_index, btc_tx_hash, btc_from, btc_froms, btc_to,
                 btc_value, mint_status, settlement_status, callback_status)
            VALUES (0, 0, $1, $2, $3::jsonb, $4, $5, $6, $7, $8)
            ON CONFLICT (btc_tx_hash) DO NOTHING
            "#,
        )
        .bind(&notification.tx_hash)
        .bind(&notification.from)
        .bind(froms)
        .bind(&notification.to)
        .bind(notification.amount as i64)
        .bind(DepositState::Pending.id())
        .bind(SettlementStatus::Pending.id())
        .bind(CALLBACK_CONFIRMED)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WithdrawStore for PgBridgeStore {
    async fn insert_withdraw_with_cursor(
        &self,
        event: &WithdrawEvent,
        btc_from: &str,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO withdraw_history
                (request_id, rollup_block_number, rollup_block_hash, rollup_tx_hash, rollup_tx_index,
                 rollup_log_index, rollup_tx_from, btc_from, btc_to, btc_value, btc_real_value,
                 fee, uuid, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event.request_id())
        .bind(event.block_number as i64)
        .bind(&event.block_hash)
        .bind(&event.tx_hash)
        .bind(event.tx_index as i64)
        .bind(event.log_index as i64)
        .bind(&event.caller)
        .bind(btc_from)
        .bind(&event.to_address)
        .bind(event.original_amount as i64)
        .bind(event.amount as i64)
        .bind(event.fee as i64)
        .bind(&event.uuid)
        .bind(WithdrawStatus::Submitted.id())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        upsert_cursor(&mut *tx, cursor).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn insert_rollup_deposit_with_cursor(
        &self,
        record: &RollupDepositRecord,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO rollup_deposit_history
                (rollup_block_number, rollup_block_hash, rollup_tx_hash, rollup_tx_index, rollup_log_index,
                 rollup_tx_from, btc_from_aa_address, btc_value, btc_tx_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (rollup_block_number, rollup_tx_index, rollup_log_index) DO NOTHING
            "#,
        )
        .bind(record.block_number as i64)
        .bind(&record.block_hash)
        .bind(&record.tx_hash)
        .bind(record.tx_index as i64)
        .bind(record.log_index as i64)
        .bind(&record.caller)
        .bind(&record.to_address)
        .bind(record.amount as i64)
        .bind(&record.btc_tx_hash)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        upsert_cursor(&mut *tx, cursor).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_withdraw(&self, id: i64) -> Result<Option<WithdrawRecord>> {
        let sql = format!("SELECT {} FROM withdraw_history WHERE id = $1", WITHDRAW_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_withdraw).transpose()
    }

    async fn get_withdraw_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<WithdrawRecord>> {
        let sql = format!(
            "SELECT {} FROM withdraw_history WHERE request_id = $1",
            WITHDRAW_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_withdraw).transpose()
    }

    async fn find_withdraws(
        &self,
        status: WithdrawStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WithdrawRecord>> {
        let sql = format!(
            r#"SELECT {} FROM withdraw_history
               WHERE status = $1 AND updated_at < $2
               ORDER BY id ASC LIMIT $3"#,
            WITHDRAW_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.id())
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_withdraw).collect()
    }

    async fn transition_withdraw(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
    ) -> Result<bool> {
        ensure_withdraw_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE withdraw_history
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(to.id())
        .bind(id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_custody_submission(
        &self,
        id: i64,
        submission: &CustodySubmission,
    ) -> Result<bool> {
        let (from, to) = (WithdrawStatus::CustodyPending, WithdrawStatus::CustodyBroadcast);
        ensure_withdraw_transition(from, to)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE withdraw_history
            SET status = $1, btc_tx_hash = NULLIF($2, ''), updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(to.id())
        .bind(&submission.btc_tx_hash)
        .bind(id)
        .bind(from.id())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO withdraw_custody
                (api_request_id, custody_id, custody_request_id, fee_rate, state)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&submission.request_id)
        .bind(&submission.custody_id)
        .bind(&submission.custody_request_id)
        .bind(submission.fee_rate as i64)
        .bind(submission.custody_state)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO withdraw_audit
                (rollup_tx_hash, btc_from, btc_to, btc_value, btc_tx_hash, custody_state)
            SELECT rollup_tx_hash, btc_from, btc_to, btc_real_value, $1, $2
            FROM withdraw_history WHERE id = $3
            "#,
        )
        .bind(&submission.btc_tx_hash)
        .bind(submission.custody_state)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_withdraw_broadcast(&self, id: i64, btc_tx_hash: &str) -> Result<bool> {
        let (from, to) = (WithdrawStatus::CustodyBroadcast, WithdrawStatus::ConfirmWait);
        ensure_withdraw_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE withdraw_history
            SET status = $1, btc_tx_hash = $2, updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(to.id())
        .bind(btc_tx_hash)
        .bind(id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_confirm_wait(&self, limit: usize) -> Result<Vec<WithdrawRecord>> {
        let sql = format!(
            r#"SELECT {} FROM withdraw_history
               WHERE status = $1 AND btc_tx_hash IS NOT NULL AND btc_tx_hash <> ''
               ORDER BY id ASC LIMIT $2"#,
            WITHDRAW_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(WithdrawStatus::ConfirmWait.id())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_withdraw).collect()
    }

    async fn record_withdraw_check(&self, check: &WithdrawCheck) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO withdraw_check (rollup_tx_hash, btc_from, btc_to, btc_value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (rollup_tx_hash) DO NOTHING
            "#,
        )
        .bind(&check.rollup_tx_hash)
        .bind(&check.btc_from)
        .bind(&check.btc_to)
        .bind(check.btc_value as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_withdraw_retry(&self, id: i64, last_error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE withdraw_history
            SET retry = retry + 1, last_error = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgBridgeStore {
    async fn insert_ledger_entry_with_cursor(
        &self,
        entry: &SettlementLedgerEntry,
        cursor: &IndexCursor,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_event_history
                (bridge_event_id, height, bridge_module_tx_index, tx_hash, tx_code,
                 message_types, raw_log)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7)
            ON CONFLICT (bridge_event_id) DO NOTHING
            "#,
        )
        .bind(&entry.bridge_event_id)
        .bind(entry.height as i64)
        .bind(entry.bridge_module_tx_index as i64)
        .bind(&entry.tx_hash)
        .bind(entry.tx_code as i64)
        .bind(serde_json::to_string(&entry.message_types)?)
        .bind(&entry.raw_log)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        upsert_cursor(&mut *tx, cursor).await?;
        tx.commit().await?;
        Ok(true)
    }
}
