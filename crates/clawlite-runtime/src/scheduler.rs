use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use clawlite_core::{
    ClawLiteError, Event, EventBus, MessageBus, OutboundMessage, Result, SessionId,
};

/// A persisted scheduled job. Ids are monotonic (SQLite rowids).
#[derive(Debug, Clone, Serialize)]
pub struct CronJob {
    pub id: i64,
    pub session_id: String,
    pub expression: String,
    pub prompt: String,
    pub name: String,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The expression grammar: `every <N seconds>` | `at <RFC3339>` (one-shot)
/// | 5-field cron, interpreted in the scheduler timezone.
#[derive(Debug)]
pub enum CronExpression {
    Every { seconds: u64 },
    At { when: DateTime<Utc> },
    Cron { schedule: cron::Schedule },
}

impl CronExpression {
    /// Parse an expression. Rejects `every 0` and malformed input with
    /// `cron_expression_invalid`; such expressions are never stored.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        if let Some(rest) = expr.strip_prefix("every ") {
            let token = rest.split_whitespace().next().unwrap_or("");
            let token = token.trim_end_matches('s');
            let seconds: u64 = token
                .parse()
                .map_err(|_| ClawLiteError::CronExpressionInvalid(expr.to_string()))?;
            if seconds == 0 {
                return Err(ClawLiteError::CronExpressionInvalid(
                    "every 0 never fires".into(),
                ));
            }
            return Ok(CronExpression::Every { seconds });
        }

        if let Some(rest) = expr.strip_prefix("at ") {
            let when = DateTime::parse_from_rfc3339(rest.trim())
                .map_err(|_| ClawLiteError::CronExpressionInvalid(expr.to_string()))?
                .with_timezone(&Utc);
            return Ok(CronExpression::At { when });
        }

        // 5-field cron; the cron crate wants a seconds field, pin it to 0.
        if expr.split_whitespace().count() != 5 {
            return Err(ClawLiteError::CronExpressionInvalid(expr.to_string()));
        }
        let schedule = cron::Schedule::from_str(&format!("0 {expr}"))
            .map_err(|_| ClawLiteError::CronExpressionInvalid(expr.to_string()))?;
        Ok(CronExpression::Cron { schedule })
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, CronExpression::At { .. })
    }

    /// First fire time when the job is created. An `at` time in the past is
    /// rejected here.
    pub fn first_fire(&self, now: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        match self {
            CronExpression::Every { seconds } => {
                Ok(now + chrono::Duration::seconds(*seconds as i64))
            }
            CronExpression::At { when } => {
                if *when <= now {
                    return Err(ClawLiteError::CronExpressionInvalid(format!(
                        "at {} is in the past",
                        when.to_rfc3339()
                    )));
                }
                Ok(*when)
            }
            CronExpression::Cron { schedule } => schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| {
                    ClawLiteError::CronExpressionInvalid("cron schedule never fires".into())
                }),
        }
    }

    /// Next fire after a fire at `now`. One-shots have none.
    pub fn next_after(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            CronExpression::Every { seconds } => {
                Some(now + chrono::Duration::seconds(*seconds as i64))
            }
            CronExpression::At { .. } => None,
            CronExpression::Cron { schedule } => schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

// ── Persistent table ───────────────────────────────────────────

/// rusqlite-backed cron table at `<state>/cron.db`.
pub struct CronStore {
    conn: Mutex<Connection>,
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    let parse = |s: Option<String>| {
        s.and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    Ok(CronJob {
        id: row.get(0)?,
        session_id: row.get(1)?,
        expression: row.get(2)?,
        prompt: row.get(3)?,
        name: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        next_fire_at: parse(row.get(6)?),
        last_fire_at: parse(row.get(7)?),
        created_at: parse(row.get(8)?).unwrap_or_else(Utc::now),
    })
}

impl CronStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ClawLiteError::Session(format!("open cron store: {e}")))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ClawLiteError::Session(format!("open cron store: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                expression TEXT NOT NULL,
                prompt TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                next_fire_at TEXT,
                last_fire_at TEXT,
                created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_id);",
        )
        .map_err(|e| ClawLiteError::Session(format!("init cron store: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(
        &self,
        session_id: &str,
        expression: &str,
        prompt: &str,
        name: &str,
        next_fire_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (session_id, expression, prompt, name, enabled, next_fire_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
            rusqlite::params![
                session_id,
                expression,
                prompt,
                name,
                next_fire_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| ClawLiteError::Session(format!("insert cron job: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list(&self, session_id: Option<&str>) -> Result<Vec<CronJob>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        let base = "SELECT id, session_id, expression, prompt, name, enabled, next_fire_at, last_fire_at, created_at FROM jobs";
        if let Some(sid) = session_id {
            let mut stmt = conn
                .prepare(&format!("{base} WHERE session_id = ?1 ORDER BY id"))
                .map_err(|e| ClawLiteError::Session(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![sid], row_to_job)
                .map_err(|e| ClawLiteError::Session(e.to_string()))?;
            for row in rows.flatten() {
                out.push(row);
            }
        } else {
            let mut stmt = stmt_all(&conn, base)?;
            let rows = stmt
                .query_map([], row_to_job)
                .map_err(|e| ClawLiteError::Session(e.to_string()))?;
            for row in rows.flatten() {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Jobs that are enabled and due at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|j| j.enabled && j.next_fire_at.is_some_and(|next| next <= now))
            .collect())
    }

    pub fn get(&self, id: i64) -> Result<Option<CronJob>> {
        Ok(self.list(None)?.into_iter().find(|j| j.id == id))
    }

    pub fn set_next(&self, id: i64, next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET next_fire_at = ?2 WHERE id = ?1",
            rusqlite::params![id, next.map(|n| n.to_rfc3339())],
        )
        .map_err(|e| ClawLiteError::Session(e.to_string()))?;
        Ok(())
    }

    pub fn update_fired(
        &self,
        id: i64,
        fired_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET last_fire_at = ?2, next_fire_at = ?3 WHERE id = ?1",
            rusqlite::params![id, fired_at.to_rfc3339(), next.map(|n| n.to_rfc3339())],
        )
        .map_err(|e| ClawLiteError::Session(e.to_string()))?;
        Ok(())
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET enabled = ?2 WHERE id = ?1",
            rusqlite::params![id, enabled as i64],
        )
        .map_err(|e| ClawLiteError::Session(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])
            .map_err(|e| ClawLiteError::Session(e.to_string()))?;
        Ok(rows > 0)
    }
}

fn stmt_all<'c>(conn: &'c Connection, sql: &str) -> Result<rusqlite::Statement<'c>> {
    conn.prepare(&format!("{sql} ORDER BY id"))
        .map_err(|e| ClawLiteError::Session(e.to_string()))
}

// ── Handle for tools / gateway ─────────────────────────────────

/// Clone-able handle for cron CRUD from tools and the gateway.
#[derive(Clone)]
pub struct CronHandle {
    store: Arc<CronStore>,
    tz: Tz,
}

impl CronHandle {
    pub fn new(store: Arc<CronStore>, tz: Tz) -> Self {
        Self { store, tz }
    }

    /// Validate and persist a job. Malformed expressions (including
    /// `every 0` and `at <past>`) are rejected and never stored.
    pub fn add(&self, session_id: &str, expression: &str, prompt: &str, name: &str) -> Result<i64> {
        SessionId::parse(session_id)?;
        let expr = CronExpression::parse(expression)?;
        let next = expr.first_fire(Utc::now(), self.tz)?;
        let id = self
            .store
            .insert(session_id, expression, prompt, name, next)?;
        info!(job_id = id, session = session_id, expression, "cron job created");
        Ok(id)
    }

    pub fn list(&self, session_id: Option<&str>) -> Result<Vec<CronJob>> {
        self.store.list(session_id)
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let removed = self.store.delete(id)?;
        if removed {
            info!(job_id = id, "cron job removed");
        }
        Ok(removed)
    }
}

// ── Service ────────────────────────────────────────────────────

/// Anything that can execute a scheduled prompt as if it were a user
/// message. Implemented by the agent engine.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, session_id: &SessionId, prompt: &str) -> Result<String>;
}

/// Tick-driven cron executor with per-job overlap suppression. Clones
/// share the job locks.
#[derive(Clone)]
pub struct CronService {
    store: Arc<CronStore>,
    tz: Tz,
    locks: Arc<Mutex<HashMap<i64, Arc<TokioMutex<()>>>>>,
    runner: Arc<dyn JobRunner>,
    bus: MessageBus,
    events: EventBus,
}

impl CronService {
    pub fn new(
        store: Arc<CronStore>,
        tz: Tz,
        runner: Arc<dyn JobRunner>,
        bus: MessageBus,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tz,
            locks: Arc::new(Mutex::new(HashMap::new())),
            runner,
            bus,
            events,
        })
    }

    /// One scheduler tick at `now`. Selects every enabled job with
    /// `next_fire_at <= now`; a job whose previous fire is still running is
    /// skipped and pushed forward, never queued.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = match self.store.due(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "cron due-selection failed");
                return;
            }
        };

        for job in due {
            let lock = {
                let mut locks = self.locks.lock();
                Arc::clone(
                    locks
                        .entry(job.id)
                        .or_insert_with(|| Arc::new(TokioMutex::new(()))),
                )
            };

            let expr = match CronExpression::parse(&job.expression) {
                Ok(expr) => expr,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "stored cron expression unparseable, disabling");
                    let _ = self.store.set_enabled(job.id, false);
                    continue;
                }
            };

            let guard = match Arc::clone(&lock).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    // Overlap suppression: skip and push forward
                    debug!(job_id = job.id, "cron fire skipped, previous run still in flight");
                    self.events.publish(Event::CronFireSkipped { job_id: job.id });
                    let _ = self.store.set_next(job.id, expr.next_after(now, self.tz));
                    continue;
                }
            };

            self.events.publish(Event::CronFireStarted { job_id: job.id });
            let service = self.clone();
            tokio::spawn(async move {
                let _guard = guard; // held for the whole fire
                service.fire(job, expr, now).await;
            });
        }
    }

    async fn fire(&self, job: CronJob, expr: CronExpression, now: DateTime<Utc>) {
        let session_id = match SessionId::parse(&job.session_id) {
            Ok(sid) => sid,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "cron job has invalid session id, disabling");
                let _ = self.store.set_enabled(job.id, false);
                return;
            }
        };

        match self.runner.run_job(&session_id, &job.prompt).await {
            Ok(text) => {
                if !text.is_empty() {
                    let msg = OutboundMessage::text(session_id.clone(), None, text);
                    if let Err(e) = self.bus.publish_outbound(msg).await {
                        warn!(job_id = job.id, error = %e, "cron reply publish failed");
                    }
                }
            }
            Err(e) => {
                // Failures never remove the job
                warn!(job_id = job.id, error = %e, "cron.fire.failed");
                self.events.publish(Event::CronFireFailed {
                    job_id: job.id,
                    error: e.kind().to_string(),
                });
            }
        }

        if expr.is_one_shot() {
            // Fired at most once, ever, then deleted
            let _ = self.store.delete(job.id);
            self.locks.lock().remove(&job.id);
            info!(job_id = job.id, "one-shot cron job fired and deleted");
        } else if let Err(e) = self
            .store
            .update_fired(job.id, now, expr.next_after(now, self.tz))
        {
            warn!(job_id = job.id, error = %e, "cron bookkeeping failed");
        }
    }

    /// Run the scheduler loop with 1-second tick granularity.
    pub async fn run(self: Arc<Self>) {
        info!("cron scheduler started, 1s tick");
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            self.tick(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_every_seconds() {
        assert!(matches!(
            CronExpression::parse("every 30").unwrap(),
            CronExpression::Every { seconds: 30 }
        ));
        assert!(matches!(
            CronExpression::parse("every 30s").unwrap(),
            CronExpression::Every { seconds: 30 }
        ));
        assert!(matches!(
            CronExpression::parse("every 1 seconds").unwrap(),
            CronExpression::Every { seconds: 1 }
        ));
    }

    #[test]
    fn every_zero_is_rejected() {
        let err = CronExpression::parse("every 0").unwrap_err();
        assert_eq!(err.kind(), "cron_expression_invalid");
    }

    #[test]
    fn at_rfc3339_parses() {
        let expr = CronExpression::parse("at 2099-01-01T00:00:00Z").unwrap();
        assert!(expr.is_one_shot());
    }

    #[test]
    fn at_in_the_past_is_rejected_at_first_fire() {
        let expr = CronExpression::parse("at 2001-01-01T00:00:00Z").unwrap();
        let err = expr.first_fire(Utc::now(), chrono_tz::UTC).unwrap_err();
        assert_eq!(err.kind(), "cron_expression_invalid");
    }

    #[test]
    fn five_field_cron_parses() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        let now = Utc::now();
        let next = expr.first_fire(now, chrono_tz::UTC).unwrap();
        assert!(next > now);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(CronExpression::parse("sometimes").is_err());
        assert!(CronExpression::parse("every banana").is_err());
        assert!(CronExpression::parse("at notadate").is_err());
        assert!(CronExpression::parse("* * *").is_err());
    }

    #[test]
    fn cron_next_is_computed_in_the_configured_timezone() {
        // 09:00 every day, in Tokyo = 00:00 UTC
        let expr = CronExpression::parse("0 9 * * *").unwrap();
        let now = DateTime::parse_from_rfc3339("2026-08-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = expr.next_after(now, chrono_tz::Asia::Tokyo).unwrap();
        assert_eq!(next.to_rfc3339(), "2026-08-02T00:00:00+00:00");
    }

    #[test]
    fn store_roundtrip_and_monotonic_ids() {
        let store = CronStore::open_in_memory().unwrap();
        let next = Utc::now() + chrono::Duration::seconds(60);
        let a = store.insert("cli:ops", "every 60", "check", "a", next).unwrap();
        let b = store.insert("cli:ops", "every 60", "check", "b", next).unwrap();
        assert!(b > a, "ids must be monotonic");

        let jobs = store.list(Some("cli:ops")).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "a");
        assert!(jobs[0].enabled);

        assert!(store.delete(a).unwrap());
        assert!(!store.delete(a).unwrap());
        assert_eq!(store.list(Some("cli:ops")).unwrap().len(), 1);
    }

    #[test]
    fn handle_rejects_invalid_expressions() {
        let store = Arc::new(CronStore::open_in_memory().unwrap());
        let handle = CronHandle::new(Arc::clone(&store), chrono_tz::UTC);

        assert!(handle.add("cli:ops", "every 0", "x", "").is_err());
        assert!(handle.add("cli:ops", "at 2001-01-01T00:00:00Z", "x", "").is_err());
        assert!(handle.add("cli:ops", "gibberish", "x", "").is_err());
        // Nothing was stored
        assert!(store.list(None).unwrap().is_empty());
    }
}
