//! PostgreSQL DDL for the ledger tables
//!
//! Every statement is idempotent, so `Database::init_schema` can run on
//! each startup.

const CREATE_CUSTOMERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(200) NOT NULL,
    customer_type   VARCHAR(20) NOT NULL CHECK (customer_type IN ('individual', 'business')),
    personal_id     VARCHAR(20) UNIQUE,
    business_number VARCHAR(20) UNIQUE,
    vip_tier        VARCHAR(20) CHECK (vip_tier IN ('Gold', 'Platinum', 'Diamond')),
    email           VARCHAR(200),
    phone           VARCHAR(50),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT customer_identity_matches_type CHECK (
        (customer_type = 'individual' AND personal_id IS NOT NULL AND business_number IS NULL)
        OR (customer_type = 'business' AND business_number IS NOT NULL AND personal_id IS NULL)
    )
)
"#;

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id             BIGSERIAL PRIMARY KEY,
    customer_id    BIGINT NOT NULL REFERENCES customers(id),
    account_number VARCHAR(50) NOT NULL UNIQUE,
    account_type   VARCHAR(20) NOT NULL DEFAULT 'checking'
                   CHECK (account_type IN ('checking', 'savings', 'business', 'vip')),
    balance        NUMERIC(15, 2) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    currency       CHAR(3) NOT NULL DEFAULT 'ILS',
    status         VARCHAR(20) NOT NULL DEFAULT 'active'
                   CHECK (status IN ('active', 'inactive', 'frozen', 'closed')),
    version        BIGINT NOT NULL DEFAULT 0,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    transaction_id      BIGINT PRIMARY KEY,
    from_account_id     BIGINT NOT NULL REFERENCES accounts(id),
    to_account_id       BIGINT NOT NULL REFERENCES accounts(id),
    from_balance_before NUMERIC(15, 2) NOT NULL,
    from_balance_after  NUMERIC(15, 2) NOT NULL CHECK (from_balance_after >= 0),
    to_balance_before   NUMERIC(15, 2) NOT NULL,
    to_balance_after    NUMERIC(15, 2) NOT NULL CHECK (to_balance_after >= 0),
    amount              NUMERIC(15, 2) NOT NULL CHECK (amount > 0),
    currency            CHAR(3) NOT NULL,
    description         VARCHAR(500),
    status              VARCHAR(20) NOT NULL
                        CHECK (status IN ('pending', 'completed', 'failed', 'cancelled')),
    processed_by        VARCHAR(100) NOT NULL,
    source              VARCHAR(100) NOT NULL,
    error_message       TEXT,
    tx_timestamp        TIMESTAMPTZ NOT NULL,
    CONSTRAINT transaction_distinct_accounts CHECK (from_account_id <> to_account_id)
)
"#;

const CREATE_TRANSACTIONS_FROM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions (from_account_id, tx_timestamp DESC)
"#;

const CREATE_TRANSACTIONS_TO_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transactions_to ON transactions (to_account_id, tx_timestamp DESC)
"#;

const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    seq            BIGSERIAL PRIMARY KEY,
    event_id       VARCHAR(64) NOT NULL UNIQUE,
    transaction_id BIGINT NOT NULL REFERENCES transactions(transaction_id),
    topic          VARCHAR(100) NOT NULL,
    partition_key  VARCHAR(100) NOT NULL,
    payload        JSONB NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL,
    published_at   TIMESTAMPTZ
)
"#;

const CREATE_OUTBOX_UNPUBLISHED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_outbox_unpublished ON outbox_events (seq) WHERE published_at IS NULL
"#;

const CREATE_OUTBOX_ARCHIVE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_archive (LIKE outbox_events)
"#;

/// Ledger DDL in dependency order
pub const LEDGER_SCHEMA: &[&str] = &[
    CREATE_CUSTOMERS_TABLE,
    CREATE_ACCOUNTS_TABLE,
    CREATE_TRANSACTIONS_TABLE,
    CREATE_TRANSACTIONS_FROM_INDEX,
    CREATE_TRANSACTIONS_TO_INDEX,
    CREATE_OUTBOX_TABLE,
    CREATE_OUTBOX_UNPUBLISHED_INDEX,
    CREATE_OUTBOX_ARCHIVE_TABLE,
];
