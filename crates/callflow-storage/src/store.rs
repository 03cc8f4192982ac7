//! SQLite implementation of [`CallflowStore`].
//!
//! Status changes are single `UPDATE ... WHERE status IN (...)` statements so
//! that the row count tells the caller whether its swap won.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::FromSql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use callflow_core::error::{CallflowError, Result};
use callflow_core::store::CallflowStore;
use callflow_core::types::{
    Agent, Analysis, Call, CallOutcome, CallStats, CallStatus, Campaign, CampaignContact,
    CampaignStatus, ContactCounts, ContactEnrollment, ContactStatus, EventClaim, SessionOutcome,
    TranscriptEntry,
};

use crate::db::Database;

const CALL_COLUMNS: &str = "id, campaign_id, contact_id, destination, provider_call_id, status,
     duration_secs, recording_url, recording_sid, failure_reason, transcription, analysis,
     session_outcome, created_at, updated_at, ended_at";

const CAMPAIGN_COLUMNS: &str = "id, user_id, agent_id, agent_version, name, status, settings,
     voice_id, script, created_at, updated_at";

const CONTACT_COLUMNS: &str =
    "campaign_id, contact_id, destination, status, failure_reason, position, updated_at";

/// Campaign, contact, call and webhook persistence backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// A store over a fresh in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::in_memory()?)))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn from_micros(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(v).unwrap_or_default()
}

fn col<T: FromSql>(row: &Row<'_>, idx: usize) -> Result<T> {
    row.get(idx)
        .map_err(|e| CallflowError::Storage(format!("Column {}: {}", idx, e)))
}

fn parse_col<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> Result<T> {
    let raw: String = col(row, idx)?;
    raw.parse().map_err(CallflowError::Storage)
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> Result<Uuid> {
    let raw: String = col(row, idx)?;
    Uuid::parse_str(&raw).map_err(|e| CallflowError::Storage(format!("Bad uuid {}: {}", raw, e)))
}

fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> CallflowError {
    move |e| CallflowError::Storage(format!("{}: {}", context, e))
}

/// `'a', 'b'` list for an `IN (...)` clause over internal enum names.
fn in_list<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn live_call_statuses() -> String {
    in_list(&CallStatus::Completed.predecessors())
}

fn map_agent_row(row: &Row<'_>) -> Result<Agent> {
    let script: String = col(row, 4)?;
    Ok(Agent {
        id: parse_uuid(row, 0)?,
        user_id: col(row, 1)?,
        name: col(row, 2)?,
        voice_id: col(row, 3)?,
        script: serde_json::from_str(&script)?,
        version: col(row, 5)?,
        created_at: from_micros(col(row, 6)?),
        updated_at: from_micros(col(row, 7)?),
    })
}

fn map_campaign_row(row: &Row<'_>) -> Result<Campaign> {
    let settings: String = col(row, 6)?;
    let script: String = col(row, 8)?;
    Ok(Campaign {
        id: parse_uuid(row, 0)?,
        user_id: col(row, 1)?,
        agent_id: parse_uuid(row, 2)?,
        agent_version: col(row, 3)?,
        name: col(row, 4)?,
        status: parse_col(row, 5)?,
        settings: serde_json::from_str(&settings)?,
        voice_id: col(row, 7)?,
        script: serde_json::from_str(&script)?,
        created_at: from_micros(col(row, 9)?),
        updated_at: from_micros(col(row, 10)?),
    })
}

fn map_contact_row(row: &Row<'_>) -> Result<CampaignContact> {
    Ok(CampaignContact {
        campaign_id: parse_uuid(row, 0)?,
        contact_id: col(row, 1)?,
        destination: col(row, 2)?,
        status: parse_col(row, 3)?,
        failure_reason: col(row, 4)?,
        position: col(row, 5)?,
        updated_at: from_micros(col(row, 6)?),
    })
}

fn map_call_row(row: &Row<'_>) -> Result<Call> {
    let analysis: Option<String> = col(row, 11)?;
    let session_outcome: Option<String> = col(row, 12)?;
    let ended_at: Option<i64> = col(row, 15)?;
    Ok(Call {
        id: parse_uuid(row, 0)?,
        campaign_id: parse_uuid(row, 1)?,
        contact_id: col(row, 2)?,
        destination: col(row, 3)?,
        provider_call_id: col(row, 4)?,
        status: parse_col(row, 5)?,
        duration_secs: col(row, 6)?,
        recording_url: col(row, 7)?,
        recording_sid: col(row, 8)?,
        failure_reason: col(row, 9)?,
        transcription: col(row, 10)?,
        analysis: analysis
            .map(|a| serde_json::from_str::<Analysis>(&a))
            .transpose()?,
        session_outcome: session_outcome
            .map(|s| s.parse::<SessionOutcome>())
            .transpose()
            .map_err(CallflowError::Storage)?,
        created_at: from_micros(col(row, 13)?),
        updated_at: from_micros(col(row, 14)?),
        ended_at: ended_at.map(from_micros),
    })
}

/// Run a query and map each row with a fallible mapper.
fn query_all<T, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(sql_err("Prepare"))?;
    let rows = stmt
        .query_map(params, |row| Ok(map(row)))
        .map_err(sql_err("Query"))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(sql_err("Row"))??);
    }
    Ok(results)
}

fn query_one<T, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> Result<T>,
) -> Result<Option<T>> {
    conn.query_row(sql, params, |row| Ok(map(row)))
        .optional()
        .map_err(sql_err("Query"))?
        .transpose()
}

// =============================================================================
// CallflowStore
// =============================================================================

impl CallflowStore for SqliteStore {
    fn save_agent(&self, agent: &Agent) -> Result<()> {
        let script = serde_json::to_string(&agent.script)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents (id, user_id, name, voice_id, script, version,
                                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    voice_id = excluded.voice_id,
                    script = excluded.script,
                    version = excluded.version,
                    updated_at = excluded.updated_at",
                params![
                    agent.id.to_string(),
                    agent.user_id,
                    agent.name,
                    agent.voice_id,
                    script,
                    agent.version,
                    micros(agent.created_at),
                    micros(agent.updated_at),
                ],
            )
            .map_err(sql_err("Save agent"))?;
            Ok(())
        })
    }

    fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                "SELECT id, user_id, name, voice_id, script, version, created_at, updated_at
                 FROM agents WHERE id = ?1",
                [id.to_string()],
                map_agent_row,
            )
        })
    }

    fn create_campaign(&self, campaign: &Campaign, contacts: &[ContactEnrollment]) -> Result<()> {
        let settings = serde_json::to_string(&campaign.settings)?;
        let script = serde_json::to_string(&campaign.script)?;
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(sql_err("Begin transaction"))?;

            tx.execute(
                &format!(
                    "INSERT INTO campaigns ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    CAMPAIGN_COLUMNS
                ),
                params![
                    campaign.id.to_string(),
                    campaign.user_id,
                    campaign.agent_id.to_string(),
                    campaign.agent_version,
                    campaign.name,
                    campaign.status.to_string(),
                    settings,
                    campaign.voice_id,
                    script,
                    micros(campaign.created_at),
                    micros(campaign.updated_at),
                ],
            )
            .map_err(sql_err("Insert campaign"))?;

            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO campaign_contacts (campaign_id, contact_id, destination,
                                                        status, position, updated_at)
                         VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                    )
                    .map_err(sql_err("Prepare contact insert"))?;
                for (position, contact) in contacts.iter().enumerate() {
                    stmt.execute(params![
                        campaign.id.to_string(),
                        contact.contact_id,
                        contact.destination,
                        position as i64,
                        micros(campaign.created_at),
                    ])
                    .map_err(sql_err("Insert contact"))?;
                }
            }

            tx.commit().map_err(sql_err("Commit campaign"))?;
            Ok(())
        })
    }

    fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS),
                [id.to_string()],
                map_campaign_row,
            )
        })
    }

    fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM campaigns WHERE status = ?1 ORDER BY created_at",
                    CAMPAIGN_COLUMNS
                ),
                [status.to_string()],
                map_campaign_row,
            )
        })
    }

    fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE campaigns SET status = ?1, updated_at = ?2
                         WHERE id = ?3 AND status IN ({})",
                        in_list(from)
                    ),
                    params![to.to_string(), micros(Utc::now()), id.to_string()],
                )
                .map_err(sql_err("Transition campaign"))?;
            Ok(changed > 0)
        })
    }

    fn pending_contacts(&self, campaign_id: Uuid, limit: usize) -> Result<Vec<CampaignContact>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM campaign_contacts
                     WHERE campaign_id = ?1 AND status = 'pending'
                     ORDER BY position
                     LIMIT ?2",
                    CONTACT_COLUMNS
                ),
                params![campaign_id.to_string(), limit as i64],
                map_contact_row,
            )
        })
    }

    fn get_contact(
        &self,
        campaign_id: Uuid,
        contact_id: &str,
    ) -> Result<Option<CampaignContact>> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {} FROM campaign_contacts WHERE campaign_id = ?1 AND contact_id = ?2",
                    CONTACT_COLUMNS
                ),
                params![campaign_id.to_string(), contact_id],
                map_contact_row,
            )
        })
    }

    fn transition_contact(
        &self,
        campaign_id: Uuid,
        contact_id: &str,
        from: ContactStatus,
        to: ContactStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE campaign_contacts
                     SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
                     WHERE campaign_id = ?4 AND contact_id = ?5 AND status = ?6",
                    params![
                        to.to_string(),
                        reason,
                        micros(Utc::now()),
                        campaign_id.to_string(),
                        contact_id,
                        from.to_string(),
                    ],
                )
                .map_err(sql_err("Transition contact"))?;
            Ok(changed > 0)
        })
    }

    fn contact_counts(&self, campaign_id: Uuid) -> Result<ContactCounts> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT status, COUNT(*) FROM campaign_contacts
                     WHERE campaign_id = ?1 GROUP BY status",
                )
                .map_err(sql_err("Prepare contact counts"))?;
            let rows = stmt
                .query_map([campaign_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })
                .map_err(sql_err("Contact counts"))?;

            let mut counts = ContactCounts::default();
            for row in rows {
                let (status, n) = row.map_err(sql_err("Contact counts row"))?;
                match status.parse::<ContactStatus>().map_err(CallflowError::Storage)? {
                    ContactStatus::Pending => counts.pending = n,
                    ContactStatus::InProgress => counts.in_progress = n,
                    ContactStatus::Completed => counts.completed = n,
                    ContactStatus::Failed => counts.failed = n,
                }
            }
            Ok(counts)
        })
    }

    fn insert_call(&self, call: &Call) -> Result<()> {
        let analysis = call.analysis.as_ref().map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO calls ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                                                    ?11, ?12, ?13, ?14, ?15, ?16)",
                    CALL_COLUMNS
                ),
                params![
                    call.id.to_string(),
                    call.campaign_id.to_string(),
                    call.contact_id,
                    call.destination,
                    call.provider_call_id,
                    call.status.to_string(),
                    call.duration_secs,
                    call.recording_url,
                    call.recording_sid,
                    call.failure_reason,
                    call.transcription,
                    analysis,
                    call.session_outcome.map(|o| o.to_string()),
                    micros(call.created_at),
                    micros(call.updated_at),
                    call.ended_at.map(micros),
                ],
            )
            .map_err(sql_err("Insert call"))?;
            Ok(())
        })
    }

    fn get_call(&self, id: Uuid) -> Result<Option<Call>> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                &format!("SELECT {} FROM calls WHERE id = ?1", CALL_COLUMNS),
                [id.to_string()],
                map_call_row,
            )
        })
    }

    fn set_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE calls SET provider_call_id = ?1, updated_at = ?2 WHERE id = ?3",
                    params![provider_call_id, micros(Utc::now()), id.to_string()],
                )
                .map_err(sql_err("Set provider call id"))?;
            if changed == 0 {
                return Err(CallflowError::NotFound(format!("call {}", id)));
            }
            Ok(())
        })
    }

    fn count_in_flight_since(&self, campaign_id: Uuid, since: DateTime<Utc>) -> Result<u32> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM calls
                     WHERE campaign_id = ?1 AND created_at >= ?2 AND status IN ({})",
                    live_call_statuses()
                ),
                params![campaign_id.to_string(), micros(since)],
                |row| row.get(0),
            )
            .map_err(sql_err("Count in-flight calls"))
        })
    }

    fn count_calls_since(&self, campaign_id: Uuid, since: DateTime<Utc>) -> Result<u32> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM calls WHERE campaign_id = ?1 AND created_at >= ?2",
                params![campaign_id.to_string(), micros(since)],
                |row| row.get(0),
            )
            .map_err(sql_err("Count calls"))
        })
    }

    fn advance_call_status(&self, id: Uuid, to: CallStatus, at: DateTime<Utc>) -> Result<bool> {
        if to.is_terminal() {
            return Err(CallflowError::InvalidTransition {
                from: "live".to_string(),
                to: to.to_string(),
            });
        }
        let from = to.predecessors();
        if from.is_empty() {
            return Ok(false);
        }
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE calls SET status = ?1, updated_at = ?2
                         WHERE id = ?3 AND status IN ({})",
                        in_list(&from)
                    ),
                    params![to.to_string(), micros(at), id.to_string()],
                )
                .map_err(sql_err("Advance call status"))?;
            Ok(changed > 0)
        })
    }

    fn finalize_call(
        &self,
        id: Uuid,
        status: CallStatus,
        outcome: &CallOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(CallflowError::InvalidTransition {
                from: "live".to_string(),
                to: status.to_string(),
            });
        }
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE calls SET
                            status = ?1,
                            duration_secs = COALESCE(?2, duration_secs),
                            recording_url = COALESCE(?3, recording_url),
                            recording_sid = COALESCE(?4, recording_sid),
                            failure_reason = COALESCE(?5, failure_reason),
                            ended_at = ?6,
                            updated_at = ?6
                         WHERE id = ?7 AND status IN ({})",
                        live_call_statuses()
                    ),
                    params![
                        status.to_string(),
                        outcome.duration_secs,
                        outcome.recording_url,
                        outcome.recording_sid,
                        outcome.failure_reason,
                        micros(at),
                        id.to_string(),
                    ],
                )
                .map_err(sql_err("Finalize call"))?;
            Ok(changed > 0)
        })
    }

    fn set_session_outcome(&self, id: Uuid, outcome: SessionOutcome) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE calls SET session_outcome = ?1, updated_at = ?2
                 WHERE id = ?3 AND session_outcome IS NULL",
                params![outcome.to_string(), micros(Utc::now()), id.to_string()],
            )
            .map_err(sql_err("Set session outcome"))?;
            Ok(())
        })
    }

    fn stale_dispatches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Call>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM calls
                     WHERE status = 'queued' AND provider_call_id IS NULL AND created_at < ?1
                     ORDER BY created_at",
                    CALL_COLUMNS
                ),
                [micros(cutoff)],
                map_call_row,
            )
        })
    }

    fn call_stats(&self, campaign_id: Uuid) -> Result<CallStats> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN status IN ({}) THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'no_answer' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'busy' THEN 1 ELSE 0 END), 0),
                            AVG(duration_secs)
                     FROM calls WHERE campaign_id = ?1",
                    live_call_statuses()
                ),
                [campaign_id.to_string()],
                |row| {
                    Ok(CallStats {
                        total: row.get(0)?,
                        in_flight: row.get(1)?,
                        completed: row.get(2)?,
                        failed: row.get(3)?,
                        no_answer: row.get(4)?,
                        busy: row.get(5)?,
                        avg_duration_secs: row.get(6)?,
                    })
                },
            )
            .map_err(sql_err("Call stats"))
        })
    }

    fn append_transcript(&self, call_id: Uuid, entries: &[TranscriptEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(sql_err("Begin transaction"))?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO call_transcripts (call_id, speaker, text, timestamp)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(sql_err("Prepare transcript insert"))?;
                for entry in entries {
                    stmt.execute(params![
                        call_id.to_string(),
                        entry.speaker.to_string(),
                        entry.text,
                        micros(entry.timestamp),
                    ])
                    .map_err(sql_err("Insert transcript entry"))?;
                }
            }
            tx.commit().map_err(sql_err("Commit transcript"))?;
            Ok(())
        })
    }

    fn transcript(&self, call_id: Uuid) -> Result<Vec<TranscriptEntry>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                "SELECT speaker, text, timestamp FROM call_transcripts
                 WHERE call_id = ?1 ORDER BY id",
                [call_id.to_string()],
                |row| {
                    Ok(TranscriptEntry {
                        speaker: parse_col(row, 0)?,
                        text: col(row, 1)?,
                        timestamp: from_micros(col(row, 2)?),
                    })
                },
            )
        })
    }

    fn save_transcription(
        &self,
        call_id: Uuid,
        text: &str,
        analysis: Option<&Analysis>,
    ) -> Result<bool> {
        let analysis = analysis.map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE calls SET transcription = ?1, analysis = COALESCE(?2, analysis),
                                      updated_at = ?3
                     WHERE id = ?4",
                    params![text, analysis, micros(Utc::now()), call_id.to_string()],
                )
                .map_err(sql_err("Save transcription"))?;
            Ok(changed > 0)
        })
    }

    fn claim_event(&self, key: &str, at: DateTime<Utc>) -> Result<EventClaim> {
        self.db.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO webhook_events (event_key, received_at) VALUES (?1, ?2)",
                    params![key, micros(at)],
                )
                .map_err(sql_err("Claim event"))?;
            if inserted > 0 {
                return Ok(EventClaim::Claimed);
            }

            let response: Option<String> = conn
                .query_row(
                    "SELECT response FROM webhook_events WHERE event_key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .map_err(sql_err("Load event response"))?;
            let response = response
                .map(|r| serde_json::from_str::<serde_json::Value>(&r))
                .transpose()?;
            Ok(EventClaim::Duplicate(response))
        })
    }

    fn record_event_response(&self, key: &str, response: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(response)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE webhook_events SET response = ?1 WHERE event_key = ?2",
                params![body, key],
            )
            .map_err(sql_err("Record event response"))?;
            Ok(())
        })
    }

    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM webhook_events WHERE received_at < ?1",
                [micros(cutoff)],
            )
            .map_err(sql_err("Purge webhook events"))
        })
    }
}
