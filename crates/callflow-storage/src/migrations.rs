//! Database schema migrations.
//!
//! Version 1 creates the agents, campaigns, campaign_contacts, calls,
//! call_transcripts and webhook_events tables.

use rusqlite::Connection;
use tracing::info;

use callflow_core::error::CallflowError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), CallflowError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| CallflowError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| CallflowError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema. Timestamps are microseconds since the epoch.
fn apply_v1(conn: &Connection) -> Result<(), CallflowError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS agents (
            id          TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL,
            name        TEXT NOT NULL,
            voice_id    TEXT NOT NULL,
            script      TEXT NOT NULL,
            version     INTEGER NOT NULL DEFAULT 1,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS campaigns (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT NOT NULL,
            agent_id        TEXT NOT NULL,
            agent_version   INTEGER NOT NULL,
            name            TEXT NOT NULL,
            status          TEXT NOT NULL
                            CHECK (status IN ('scheduled', 'active', 'paused', 'completed')),
            settings        TEXT NOT NULL,
            voice_id        TEXT NOT NULL,
            script          TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_campaigns_status
            ON campaigns (status);

        CREATE TABLE IF NOT EXISTS campaign_contacts (
            campaign_id     TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            contact_id      TEXT NOT NULL,
            destination     TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
            failure_reason  TEXT,
            position        INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            PRIMARY KEY (campaign_id, contact_id)
        );

        CREATE INDEX IF NOT EXISTS idx_contacts_dispatch
            ON campaign_contacts (campaign_id, status, position);

        CREATE TABLE IF NOT EXISTS calls (
            id                  TEXT PRIMARY KEY NOT NULL,
            campaign_id         TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            contact_id          TEXT NOT NULL,
            destination         TEXT NOT NULL,
            provider_call_id    TEXT,
            status              TEXT NOT NULL
                                CHECK (status IN ('queued', 'ringing', 'answered', 'completed',
                                                  'failed', 'no_answer', 'busy')),
            duration_secs       INTEGER,
            recording_url       TEXT,
            recording_sid       TEXT,
            failure_reason      TEXT,
            transcription       TEXT,
            analysis            TEXT,
            session_outcome     TEXT,
            created_at          INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL,
            ended_at            INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_calls_campaign_created
            ON calls (campaign_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_calls_provider
            ON calls (provider_call_id);

        -- One live call per contact.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_live_contact
            ON calls (campaign_id, contact_id)
            WHERE status IN ('queued', 'ringing', 'answered');

        CREATE TABLE IF NOT EXISTS call_transcripts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id     TEXT NOT NULL REFERENCES calls(id) ON DELETE CASCADE,
            speaker     TEXT NOT NULL CHECK (speaker IN ('agent', 'caller')),
            text        TEXT NOT NULL,
            timestamp   INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transcripts_call
            ON call_transcripts (call_id, id);

        CREATE TABLE IF NOT EXISTS webhook_events (
            event_key   TEXT PRIMARY KEY NOT NULL,
            received_at INTEGER NOT NULL,
            response    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_webhook_events_received
            ON webhook_events (received_at);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| CallflowError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
