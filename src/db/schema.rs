use anyhow::Result;
use sqlx::PgPool;

/// Create every bridge table and index; safe to run on each start
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing bridge schema...");

    for (name, ddl) in TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", name, e))?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create index: {}: {}", ddl, e))?;
    }

    tracing::info!("Bridge schema initialized successfully");
    Ok(())
}

const TABLES: [(&str, &str); 10] = [
    ("index_cursor", CREATE_INDEX_CURSOR),
    ("deposit_history", CREATE_DEPOSIT_HISTORY),
    ("rollup_deposit_history", CREATE_ROLLUP_DEPOSIT_HISTORY),
    ("withdraw_history", CREATE_WITHDRAW_HISTORY),
    ("withdraw_custody", CREATE_WITHDRAW_CUSTODY),
    ("withdraw_audit", CREATE_WITHDRAW_AUDIT),
    ("withdraw_check", CREATE_WITHDRAW_CHECK),
    ("custody_callback", CREATE_CUSTODY_CALLBACK),
    ("withdraw_reset_history", CREATE_WITHDRAW_RESET_HISTORY),
    ("ledger_event_history", CREATE_LEDGER_EVENT_HISTORY),
];

/// One row per scanned chain. A fully processed height has both indexes at 4294967295.
const CREATE_INDEX_CURSOR: &str = r#"
CREATE TABLE IF NOT EXISTS index_cursor (
    chain_id      VARCHAR(32) PRIMARY KEY,
    block_height  BIGINT NOT NULL,
    tx_index      BIGINT NOT NULL,
    log_index     BIGINT NOT NULL DEFAULT 0,
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_DEPOSIT_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS deposit_history (
    id                   BIGSERIAL PRIMARY KEY,
    btc_block_number     BIGINT NOT NULL,
    btc_tx_index         BIGINT NOT NULL,
    btc_tx_hash          VARCHAR(128) NOT NULL UNIQUE,
    btc_from             VARCHAR(128) NOT NULL DEFAULT '',
    btc_froms            JSONB NOT NULL DEFAULT '[]',
    btc_to               VARCHAR(128) NOT NULL,
    btc_value            BIGINT NOT NULL,
    btc_block_time       BIGINT NOT NULL DEFAULT 0,
    btc_from_aa_address  VARCHAR(64),
    mint_status          SMALLINT NOT NULL,
    mint_tx_hash         VARCHAR(80),
    mint_retry           INT NOT NULL DEFAULT 0,
    fallback_status      SMALLINT,
    fallback_tx_hash     VARCHAR(80),
    fallback_raw_tx      BYTEA,
    settlement_status    SMALLINT NOT NULL DEFAULT 1,
    settlement_retry     INT NOT NULL DEFAULT 0,
    callback_status      SMALLINT NOT NULL DEFAULT 0,
    last_error           VARCHAR(64),
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ROLLUP_DEPOSIT_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS rollup_deposit_history (
    id                   BIGSERIAL PRIMARY KEY,
    rollup_block_number      BIGINT NOT NULL,
    rollup_block_hash        VARCHAR(80) NOT NULL,
    rollup_tx_hash           VARCHAR(80) NOT NULL,
    rollup_tx_index          BIGINT NOT NULL,
    rollup_log_index         BIGINT NOT NULL,
    rollup_tx_from           VARCHAR(64) NOT NULL,
    btc_from_aa_address  VARCHAR(64) NOT NULL,
    btc_value            BIGINT NOT NULL,
    btc_tx_hash          VARCHAR(128) NOT NULL,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (rollup_block_number, rollup_tx_index, rollup_log_index)
)
"#;

const CREATE_WITHDRAW_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS withdraw_history (
    id                BIGSERIAL PRIMARY KEY,
    request_id        VARCHAR(128) NOT NULL UNIQUE,
    rollup_block_number   BIGINT NOT NULL,
    rollup_block_hash     VARCHAR(80) NOT NULL,
    rollup_tx_hash        VARCHAR(80) NOT NULL,
    rollup_tx_index       BIGINT NOT NULL,
    rollup_log_index      BIGINT NOT NULL,
    rollup_tx_from        VARCHAR(64) NOT NULL,
    btc_from          VARCHAR(128) NOT NULL,
    btc_to            VARCHAR(128) NOT NULL,
    btc_value         BIGINT NOT NULL,
    btc_real_value    BIGINT NOT NULL,
    fee               BIGINT NOT NULL,
    uuid              VARCHAR(128) NOT NULL,
    status            SMALLINT NOT NULL,
    btc_tx_hash       VARCHAR(128),
    retry             INT NOT NULL DEFAULT 0,
    last_error        VARCHAR(64),
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (rollup_block_number, rollup_tx_index, rollup_log_index)
)
"#;

const CREATE_WITHDRAW_CUSTODY: &str = r#"
CREATE TABLE IF NOT EXISTS withdraw_custody (
    id                  BIGSERIAL PRIMARY KEY,
    api_request_id      VARCHAR(128) NOT NULL UNIQUE,
    custody_id          VARCHAR(128) NOT NULL,
    custody_request_id  VARCHAR(128) NOT NULL,
    fee_rate            BIGINT NOT NULL,
    state               INT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_WITHDRAW_AUDIT: &str = r#"
CREATE TABLE IF NOT EXISTS withdraw_audit (
    id            BIGSERIAL PRIMARY KEY,
    rollup_tx_hash    VARCHAR(80) NOT NULL,
    btc_from      VARCHAR(128) NOT NULL,
    btc_to        VARCHAR(128) NOT NULL,
    btc_value     BIGINT NOT NULL,
    btc_tx_hash   VARCHAR(128) NOT NULL DEFAULT '',
    custody_state INT NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_WITHDRAW_CHECK: &str = r#"
CREATE TABLE IF NOT EXISTS withdraw_check (
    id          BIGSERIAL PRIMARY KEY,
    rollup_tx_hash  VARCHAR(128) NOT NULL UNIQUE,
    btc_from    VARCHAR(128) NOT NULL,
    btc_to      VARCHAR(128) NOT NULL,
    btc_value   BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_CUSTODY_CALLBACK: &str = r#"
CREATE TABLE IF NOT EXISTS custody_callback (
    id            BIGSERIAL PRIMARY KEY,
    request_id    VARCHAR(128) NOT NULL UNIQUE,
    request_type  INT NOT NULL,
    tx_hash       VARCHAR(128) NOT NULL,
    btc_from      VARCHAR(128) NOT NULL,
    btc_to        VARCHAR(128) NOT NULL,
    btc_value     BIGINT NOT NULL,
    raw           TEXT NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Written by maintenance tooling when a stuck withdrawal is reset (0) or sped up (1)
const CREATE_WITHDRAW_RESET_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS withdraw_reset_history (
    id                 BIGSERIAL PRIMARY KEY,
    request_id         VARCHAR(128) NOT NULL UNIQUE,
    reset_type         SMALLINT NOT NULL,
    rollup_tx_hash         VARCHAR(80) NOT NULL,
    withdraw_snapshot  JSONB NOT NULL,
    custody_snapshot   JSONB NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_LEDGER_EVENT_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_event_history (
    id                      BIGSERIAL PRIMARY KEY,
    bridge_event_id         VARCHAR(128) NOT NULL UNIQUE,
    height                  BIGINT NOT NULL,
    bridge_module_tx_index  BIGINT NOT NULL,
    tx_hash                 VARCHAR(80) NOT NULL,
    tx_code                 BIGINT NOT NULL,
    message_types           JSONB NOT NULL DEFAULT '[]',
    raw_log                 TEXT NOT NULL DEFAULT '',
    created_at              TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const INDEXES: [&str; 6] = [
    "CREATE INDEX IF NOT EXISTS idx_deposit_mint_status ON deposit_history (mint_status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_deposit_settlement_status ON deposit_history (settlement_status, mint_status)",
    "CREATE INDEX IF NOT EXISTS idx_rollup_deposit_btc_tx_hash ON rollup_deposit_history (btc_tx_hash)",
    "CREATE INDEX IF NOT EXISTS idx_withdraw_status ON withdraw_history (status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_withdraw_rollup_tx_hash ON withdraw_history (rollup_tx_hash)",
    "CREATE INDEX IF NOT EXISTS idx_withdraw_btc_tx_hash ON withdraw_history (btc_tx_hash)",
];
