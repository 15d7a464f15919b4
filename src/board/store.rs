use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::board::models::*;
use crate::conflict;
use crate::errors::StoreError;

/// Sentinel note attached to runs recovered at startup.
pub const ORPHAN_NOTE: &str = "orphaned from previous session";

/// Audit prompt text is capped at this many bytes before persistence.
pub const AUDIT_PROMPT_CAP: usize = 50_000;

const TRUNCATION_MARKER: &str = "...[truncated]";

/// Cap `text` at [`AUDIT_PROMPT_CAP`] bytes, appending a truncation marker.
/// The cut lands on a char boundary at or below the cap.
pub fn truncate_audit_text(text: &str) -> String {
    if text.len() <= AUDIT_PROMPT_CAP {
        return text.to_string();
    }
    let mut cut = AUDIT_PROMPT_CAP;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], TRUNCATION_MARKER)
}

/// Numbered migrations, applied in order. Each version is recorded in
/// `schema_migrations` so re-opening an existing database is a no-op.
const MIGRATIONS: &[&str] = &[
    // 1: core board tables
    "
    CREATE TABLE tickets (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        domain TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 3,
        ticket_type TEXT NOT NULL DEFAULT 'feature',
        files TEXT NOT NULL DEFAULT '[]',
        dependencies TEXT NOT NULL DEFAULT '[]',
        acceptance_criteria TEXT NOT NULL DEFAULT '[]',
        technical_context TEXT NOT NULL DEFAULT '',
        constraints TEXT NOT NULL DEFAULT '[]',
        signoffs TEXT NOT NULL DEFAULT '{}',
        bugs TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'backlog',
        assigned_agent TEXT,
        workspace_path TEXT,
        branch TEXT,
        parent_id TEXT,
        parallel_group INTEGER,
        conversation TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE ticket_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        actor TEXT NOT NULL,
        note TEXT
    );

    CREATE INDEX idx_tickets_status ON tickets(status);
    CREATE INDEX idx_tickets_domain ON tickets(domain, status);
    CREATE INDEX idx_tickets_parent ON tickets(parent_id);
    CREATE INDEX idx_history_ticket ON ticket_history(ticket_id);
    ",
    // 2: agent runs
    "
    CREATE TABLE agent_runs (
        id TEXT PRIMARY KEY,
        agent TEXT NOT NULL,
        ticket_id TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
        workspace_path TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        status TEXT NOT NULL DEFAULT 'running',
        output TEXT
    );

    CREATE INDEX idx_runs_ticket ON agent_runs(ticket_id);
    CREATE INDEX idx_runs_status ON agent_runs(status);
    ",
    // 3: audit log
    "
    CREATE TABLE agent_audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        ticket_id TEXT NOT NULL,
        agent TEXT NOT NULL,
        event_type TEXT NOT NULL,
        event_data TEXT NOT NULL DEFAULT '{}',
        tokens_in INTEGER NOT NULL DEFAULT 0,
        tokens_out INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE INDEX idx_audit_run ON agent_audit_log(run_id);
    CREATE INDEX idx_audit_ticket ON agent_audit_log(ticket_id);
    ",
    // 4: workspace pool + merge queue + events
    "
    CREATE TABLE worktree_pool (
        ticket_id TEXT PRIMARY KEY,
        branch TEXT NOT NULL,
        path TEXT NOT NULL,
        agent TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        last_activity TEXT NOT NULL
    );

    CREATE TABLE merge_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticket_id TEXT NOT NULL,
        branch TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE TABLE worktree_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticket_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        detail TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX idx_merge_queue_status ON merge_queue(status);
    ",
    // 5: configuration
    "
    CREATE TABLE config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE agent_provider_config (
        role TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        system_prompt TEXT
    );
    ",
];

/// Durable, transactional record of the board: tickets, history, runs,
/// audit entries, pool entries, merge queue, and configuration.
pub struct BoardStore {
    conn: Connection,
}

impl BoardStore {
    /// Open (or create) the board database at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        // journal_mode responds with the resulting mode, so it has to be
        // read as a query ("memory" databases report memory, not wal).
        self.conn
            .query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        let applied: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = (idx + 1) as i64;
            if version <= applied {
                continue;
            }
            self.conn.execute_batch(sql)?;
            self.conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    // ── Ticket queries ────────────────────────────────────────────────

    pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", TICKET_SELECT),
                params![id],
                TicketRow::from_row,
            )
            .optional()?;
        match row {
            Some(r) => {
                let mut ticket = r.into_ticket()?;
                ticket.history = self.history_for(&ticket.id)?;
                Ok(Some(ticket))
            }
            None => Ok(None),
        }
    }

    fn require_ticket(&self, id: &str) -> Result<Ticket, StoreError> {
        self.get_ticket(id)?.ok_or_else(|| StoreError::TicketNotFound {
            id: id.to_string(),
        })
    }

    pub fn list_by_status(&self, status: &TicketStatus) -> Result<Vec<Ticket>, StoreError> {
        self.list_where(
            "WHERE status = ?1 ORDER BY priority ASC, created_at ASC",
            params![status.as_str()],
        )
    }

    pub fn list_by_domain(&self, domain: Domain) -> Result<Vec<Ticket>, StoreError> {
        self.list_where(
            "WHERE domain = ?1 ORDER BY priority ASC, created_at ASC",
            params![domain.as_str()],
        )
    }

    pub fn list_by_parent(&self, parent_id: &str) -> Result<Vec<Ticket>, StoreError> {
        self.list_where(
            "WHERE parent_id = ?1 ORDER BY parallel_group ASC, created_at ASC",
            params![parent_id],
        )
    }

    /// All READY tickets sorted by ascending priority, then creation time.
    pub fn list_ready(&self) -> Result<Vec<Ticket>, StoreError> {
        self.list_by_status(&TicketStatus::Ready)
    }

    pub fn list_all(&self) -> Result<Vec<Ticket>, StoreError> {
        self.list_where("ORDER BY created_at ASC", params![])
    }

    /// Any status with a multi-round refinement in flight.
    pub fn list_refining_rounds(&self) -> Result<Vec<Ticket>, StoreError> {
        self.list_where(
            "WHERE status LIKE 'refining_round_%' ORDER BY created_at ASC",
            params![],
        )
    }

    fn list_where(
        &self,
        suffix: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Ticket>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{} {}", TICKET_SELECT, suffix))?;
        let rows = stmt.query_map(args, TicketRow::from_row)?;
        let mut tickets = Vec::new();
        for row in rows {
            let mut ticket = row?.into_ticket()?;
            ticket.history = self.history_for(&ticket.id)?;
            tickets.push(ticket);
        }
        Ok(tickets)
    }

    pub fn counts_by_status(&self) -> Result<HashMap<String, i64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tickets GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Sum of IN_DEV + IN_QA + IN_UX + IN_SEC tickets.
    pub fn in_progress_count(&self) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM tickets WHERE status IN ('in_dev', 'in_qa', 'in_ux', 'in_sec')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Look a dependency up by id or exact title.
    pub fn resolve_dependency(&self, key: &str) -> Result<Option<Ticket>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1 OR title = ?1 LIMIT 1", TICKET_SELECT),
                params![key],
                TicketRow::from_row,
            )
            .optional()?;
        row.map(TicketRow::into_ticket).transpose()
    }

    /// True when every dependency (referenced by id or exact title) exists
    /// and is DONE. Unknown dependencies are conservatively unmet.
    pub fn dependencies_done(&self, ticket: &Ticket) -> Result<bool, StoreError> {
        for dep in &ticket.dependencies {
            match self.resolve_dependency(dep)? {
                Some(t) if t.status == TicketStatus::Done => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// First READY ticket in `domain` whose dependencies are all DONE and
    /// whose file patterns do not overlap any IN_DEV ticket.
    pub fn next_for_domain(&self, domain: Domain) -> Result<Option<Ticket>, StoreError> {
        let in_dev = self.list_by_status(&TicketStatus::InDev)?;
        let candidates = self.list_where(
            "WHERE status = 'ready' AND domain = ?1 ORDER BY priority ASC, created_at ASC",
            params![domain.as_str()],
        )?;
        for candidate in candidates {
            if !self.dependencies_done(&candidate)? {
                continue;
            }
            if in_dev.iter().any(|t| conflict::tickets_conflict(&candidate.files, &t.files)) {
                continue;
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    // ── Ticket mutations ──────────────────────────────────────────────

    /// Insert a ticket and its initial history entry in one transaction.
    pub fn create_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError> {
        if self.get_ticket(&ticket.id)?.is_some() {
            return Err(StoreError::DuplicateTicket {
                id: ticket.id.clone(),
            });
        }
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO tickets (id, title, description, domain, priority, ticket_type,
                files, dependencies, acceptance_criteria, technical_context, constraints,
                signoffs, bugs, status, assigned_agent, workspace_path, branch,
                parent_id, parallel_group, conversation, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                ticket.id,
                ticket.title,
                ticket.description,
                ticket.domain.as_str(),
                ticket.priority,
                ticket.ticket_type.as_str(),
                to_json(&ticket.files)?,
                to_json(&ticket.dependencies)?,
                to_json(&ticket.acceptance_criteria)?,
                ticket.technical_context,
                to_json(&ticket.constraints)?,
                to_json(&ticket.signoffs)?,
                to_json(&ticket.bugs)?,
                ticket.status.as_str(),
                ticket.assigned_agent,
                ticket.workspace_path,
                ticket.branch,
                ticket.parent_id,
                ticket.parallel_group,
                ticket.conversation.as_ref().map(to_json).transpose()?,
                ticket.created_at.to_rfc3339(),
                ticket.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO ticket_history (ticket_id, status, timestamp, actor, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ticket.id,
                ticket.status.as_str(),
                Utc::now().to_rfc3339(),
                "store",
                Option::<String>::None,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Full overwrite of the mutable ticket columns. History is untouched;
    /// use [`BoardStore::update_status`] for status changes.
    pub fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE tickets SET title = ?2, description = ?3, domain = ?4, priority = ?5,
                ticket_type = ?6, files = ?7, dependencies = ?8, acceptance_criteria = ?9,
                technical_context = ?10, constraints = ?11, signoffs = ?12, bugs = ?13,
                assigned_agent = ?14, workspace_path = ?15, branch = ?16, parent_id = ?17,
                parallel_group = ?18, conversation = ?19, updated_at = ?20
             WHERE id = ?1",
            params![
                ticket.id,
                ticket.title,
                ticket.description,
                ticket.domain.as_str(),
                ticket.priority,
                ticket.ticket_type.as_str(),
                to_json(&ticket.files)?,
                to_json(&ticket.dependencies)?,
                to_json(&ticket.acceptance_criteria)?,
                ticket.technical_context,
                to_json(&ticket.constraints)?,
                to_json(&ticket.signoffs)?,
                to_json(&ticket.bugs)?,
                ticket.assigned_agent,
                ticket.workspace_path,
                ticket.branch,
                ticket.parent_id,
                ticket.parallel_group,
                ticket.conversation.as_ref().map(to_json).transpose()?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::TicketNotFound {
                id: ticket.id.clone(),
            });
        }
        Ok(())
    }

    /// Atomically update the status column and append the paired history
    /// entry. Readers never observe one without the other.
    pub fn update_status(
        &mut self,
        id: &str,
        status: &TicketStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tickets SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now],
        )?;
        if changed == 0 {
            return Err(StoreError::TicketNotFound { id: id.to_string() });
        }
        tx.execute(
            "INSERT INTO ticket_history (ticket_id, status, timestamp, actor, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, status.as_str(), now, actor, note],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_signoff(&self, id: &str, stage: Stage, at: DateTime<Utc>) -> Result<(), StoreError> {
        let ticket = self.require_ticket(id)?;
        let mut signoffs = ticket.signoffs;
        signoffs.set(stage, Some(at));
        self.write_signoffs(id, &signoffs)
    }

    /// Rework: clear a downstream stage's signoff after its upstream re-ran.
    pub fn clear_signoff(&self, id: &str, stage: Stage) -> Result<(), StoreError> {
        let ticket = self.require_ticket(id)?;
        let mut signoffs = ticket.signoffs;
        signoffs.set(stage, None);
        self.write_signoffs(id, &signoffs)
    }

    fn write_signoffs(&self, id: &str, signoffs: &Signoffs) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tickets SET signoffs = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, to_json(signoffs)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn add_bug(&self, id: &str, bug: Bug) -> Result<(), StoreError> {
        let ticket = self.require_ticket(id)?;
        let mut bugs = ticket.bugs;
        bugs.push(bug);
        self.conn.execute(
            "UPDATE tickets SET bugs = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, to_json(&bugs)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn assign_agent(&self, id: &str, agent: Option<AgentRole>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tickets SET assigned_agent = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id,
                agent.map(|a| a.as_str().to_string()),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn set_workspace(
        &self,
        id: &str,
        path: Option<&str>,
        branch: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tickets SET workspace_path = ?2, branch = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, path, branch, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_conversation(
        &self,
        id: &str,
        conversation: &PrdConversation,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tickets SET conversation = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, to_json(conversation)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn history_for(&self, id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, timestamp, actor, note FROM ticket_history
             WHERE ticket_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (status, timestamp, actor, note) = row?;
            history.push(HistoryEntry {
                status: TicketStatus::parse(&status)
                    .map_err(|message| StoreError::CorruptRow {
                        entity: "ticket_history",
                        id: id.to_string(),
                        message,
                    })?,
                timestamp: parse_ts(&timestamp, "ticket_history", id)?,
                actor,
                note,
            });
        }
        Ok(history)
    }

    // ── Run lifecycle ─────────────────────────────────────────────────

    pub fn add_run(&self, run: &AgentRun) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO agent_runs (id, agent, ticket_id, workspace_path, started_at, ended_at, status, output)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id.to_string(),
                run.agent.as_str(),
                run.ticket_id,
                run.workspace_path,
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
                run.status.as_str(),
                run.output,
            ],
        )?;
        Ok(())
    }

    pub fn complete_run(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE agent_runs SET status = ?2, output = ?3, ended_at = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                output,
                Utc::now().to_rfc3339()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<AgentRun>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", RUN_SELECT),
                params![id.to_string()],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn active_runs(&self) -> Result<Vec<AgentRun>, StoreError> {
        self.runs_where("WHERE status = 'running' ORDER BY started_at ASC", params![])
    }

    pub fn active_runs_for_ticket(&self, ticket_id: &str) -> Result<Vec<AgentRun>, StoreError> {
        self.runs_where(
            "WHERE status = 'running' AND ticket_id = ?1 ORDER BY started_at ASC",
            params![ticket_id],
        )
    }

    /// Runs started in the last 24 hours, newest first.
    pub fn recent_runs(&self) -> Result<Vec<AgentRun>, StoreError> {
        let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
        self.runs_where(
            "WHERE started_at >= ?1 ORDER BY started_at DESC",
            params![cutoff],
        )
    }

    pub fn is_agent_running(&self, ticket_id: &str, agent: AgentRole) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_runs WHERE ticket_id = ?1 AND agent = ?2 AND status = 'running'",
            params![ticket_id, agent.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn runs_where(
        &self,
        suffix: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<AgentRun>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{} {}", RUN_SELECT, suffix))?;
        let rows = stmt.query_map(args, RunRow::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    /// Startup recovery: flip every `running` run to `failed` with the
    /// orphan sentinel. Returns how many were recovered.
    pub fn recover_orphan_runs(&self) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE agent_runs SET status = 'failed', output = ?1, ended_at = ?2 WHERE status = 'running'",
            params![ORPHAN_NOTE, Utc::now().to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Mark running runs older than `max_age` as failed.
    pub fn fail_stale_runs(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE agent_runs SET status = 'failed', output = 'exceeded maximum run duration', ended_at = ?2
             WHERE status = 'running' AND started_at < ?1",
            params![cutoff, Utc::now().to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Delete finished runs whose end time is older than `retention`.
    pub fn purge_finished_runs(&self, retention: Duration) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - retention).to_rfc3339();
        let changed = self.conn.execute(
            "DELETE FROM agent_runs WHERE status != 'running' AND ended_at IS NOT NULL AND ended_at < ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    // ── Audit log ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn append_audit(
        &self,
        run_id: Uuid,
        ticket_id: &str,
        agent: AgentRole,
        event_type: AuditEventType,
        event_data: &serde_json::Value,
        tokens_in: i64,
        tokens_out: i64,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO agent_audit_log (run_id, ticket_id, agent, event_type, event_data,
                tokens_in, tokens_out, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id.to_string(),
                ticket_id,
                agent.as_str(),
                event_type.as_str(),
                event_data.to_string(),
                tokens_in,
                tokens_out,
                duration_ms,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn audit_for_run(&self, run_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        self.audit_where("WHERE run_id = ?1 ORDER BY id ASC", params![run_id.to_string()])
    }

    pub fn audit_for_ticket(&self, ticket_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.audit_where("WHERE ticket_id = ?1 ORDER BY id ASC", params![ticket_id])
    }

    pub fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        self.audit_where("ORDER BY id DESC LIMIT ?1", params![limit])
    }

    fn audit_where(
        &self,
        suffix: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, run_id, ticket_id, agent, event_type, event_data,
                tokens_in, tokens_out, duration_ms, created_at
             FROM agent_audit_log {}",
            suffix
        ))?;
        let rows = stmt.query_map(args, |row| {
            Ok(AuditRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                ticket_id: row.get(2)?,
                agent: row.get(3)?,
                event_type: row.get(4)?,
                event_data: row.get(5)?,
                tokens_in: row.get(6)?,
                tokens_out: row.get(7)?,
                duration_ms: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Aggregated token counts and call totals across the audit log.
    pub fn usage_totals(&self) -> Result<UsageTotals, StoreError> {
        let totals = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0)
             FROM agent_audit_log WHERE event_type = 'response_received'",
            [],
            |row| {
                Ok(UsageTotals {
                    calls: row.get(0)?,
                    tokens_in: row.get(1)?,
                    tokens_out: row.get(2)?,
                })
            },
        )?;
        Ok(totals)
    }

    // ── Workspace pool & merge queue ──────────────────────────────────

    pub fn insert_pool_entry(&self, entry: &PoolEntry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO worktree_pool (ticket_id, branch, path, agent, status, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.ticket_id,
                entry.branch,
                entry.path,
                entry.agent.as_str(),
                entry.status.as_str(),
                entry.created_at.to_rfc3339(),
                entry.last_activity.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_pool_entry(&self, ticket_id: &str) -> Result<Option<PoolEntry>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT ticket_id, branch, path, agent, status, created_at, last_activity
                 FROM worktree_pool WHERE ticket_id = ?1",
                params![ticket_id],
                PoolRow::from_row,
            )
            .optional()?;
        row.map(PoolRow::into_entry).transpose()
    }

    pub fn list_pool_entries(&self) -> Result<Vec<PoolEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ticket_id, branch, path, agent, status, created_at, last_activity
             FROM worktree_pool ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], PoolRow::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    pub fn update_pool_status(
        &self,
        ticket_id: &str,
        status: PoolEntryStatus,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE worktree_pool SET status = ?2, last_activity = ?3 WHERE ticket_id = ?1",
            params![ticket_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn touch_pool_activity(&self, ticket_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE worktree_pool SET last_activity = ?2 WHERE ticket_id = ?1",
            params![ticket_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_pool_entry(&self, ticket_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM worktree_pool WHERE ticket_id = ?1",
            params![ticket_id],
        )?;
        Ok(())
    }

    /// Entries currently holding a worktree slot (active or merging).
    pub fn pool_slots_used(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM worktree_pool WHERE status IN ('active', 'merging')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn append_workspace_event(
        &self,
        ticket_id: &str,
        kind: &str,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO worktree_events (ticket_id, kind, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![ticket_id, kind, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Enqueue a merge job; a ticket may hold at most one non-terminal entry.
    pub fn enqueue_merge(&self, ticket_id: &str, branch: &str) -> Result<MergeEntry, StoreError> {
        let open: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM merge_queue WHERE ticket_id = ?1 AND status IN ('pending', 'in_progress')",
            params![ticket_id],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(StoreError::CorruptRow {
                entity: "merge_queue",
                id: ticket_id.to_string(),
                message: "ticket already has a non-terminal merge entry".to_string(),
            });
        }
        self.conn.execute(
            "INSERT INTO merge_queue (ticket_id, branch, status, attempts, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3)",
            params![ticket_id, branch, Utc::now().to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_merge_entry(id)?.ok_or(StoreError::CorruptRow {
            entity: "merge_queue",
            id: id.to_string(),
            message: "entry missing after insert".to_string(),
        })
    }

    pub fn get_merge_entry(&self, id: i64) -> Result<Option<MergeEntry>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", MERGE_SELECT),
                params![id],
                MergeRow::from_row,
            )
            .optional()?;
        row.map(MergeRow::into_entry).transpose()
    }

    /// Earliest pending entry (FIFO by created_at, then id).
    pub fn next_pending_merge(&self) -> Result<Option<MergeEntry>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1",
                    MERGE_SELECT
                ),
                [],
                MergeRow::from_row,
            )
            .optional()?;
        row.map(MergeRow::into_entry).transpose()
    }

    pub fn merge_entries_for_ticket(&self, ticket_id: &str) -> Result<Vec<MergeEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE ticket_id = ?1 ORDER BY id ASC", MERGE_SELECT))?;
        let rows = stmt.query_map(params![ticket_id], MergeRow::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    pub fn mark_merge_in_progress(&self, id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE merge_queue SET status = 'in_progress', attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn mark_merge_completed(&self, id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE merge_queue SET status = 'completed', last_error = NULL, completed_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a failed attempt. Returns to pending below the retry bound,
    /// otherwise terminal failed.
    pub fn mark_merge_failed(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<MergeStatus, StoreError> {
        let attempts: u32 = self.conn.query_row(
            "SELECT attempts FROM merge_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let next = if attempts >= max_attempts {
            MergeStatus::Failed
        } else {
            MergeStatus::Pending
        };
        self.conn.execute(
            "UPDATE merge_queue SET status = ?2, last_error = ?3,
                completed_at = CASE WHEN ?2 = 'failed' THEN ?4 ELSE completed_at END
             WHERE id = ?1",
            params![id, next.as_str(), error, Utc::now().to_rfc3339()],
        )?;
        Ok(next)
    }

    // ── Configuration ─────────────────────────────────────────────────

    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_role_config(
        &self,
        role: AgentRole,
        provider: &str,
        model: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO agent_provider_config (role, provider, model, system_prompt)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(role) DO UPDATE SET provider = ?2, model = ?3, system_prompt = ?4",
            params![role.as_str(), provider, model, system_prompt],
        )?;
        Ok(())
    }

    pub fn get_role_config(&self, role: AgentRole) -> Result<Option<RoleConfig>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT provider, model, system_prompt FROM agent_provider_config WHERE role = ?1",
                params![role.as_str()],
                |row| {
                    Ok(RoleConfig {
                        provider: row.get(0)?,
                        model: row.get(1)?,
                        system_prompt: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

/// Per-role provider/model selection stored on the board.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleConfig {
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub calls: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// Shared handle over the store. rusqlite connections are not `Sync`, so
/// async callers funnel through `spawn_blocking` with a short exclusive hold.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<BoardStore>>,
}

impl StoreHandle {
    pub fn new(store: BoardStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run `f` against the store on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut BoardStore) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut store = inner.lock().unwrap_or_else(|poison| poison.into_inner());
            f(&mut store)
        })
        .await
        .map_err(|e| StoreError::CorruptRow {
            entity: "store",
            id: "handle".to_string(),
            message: format!("store task panicked: {}", e),
        })?
    }

    /// Synchronous lock for brief reads from non-async contexts.
    pub fn lock_sync(&self) -> MutexGuard<'_, BoardStore> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const TICKET_SELECT: &str = "SELECT id, title, description, domain, priority, ticket_type,
    files, dependencies, acceptance_criteria, technical_context, constraints, signoffs,
    bugs, status, assigned_agent, workspace_path, branch, parent_id, parallel_group,
    conversation, created_at, updated_at FROM tickets";

const RUN_SELECT: &str = "SELECT id, agent, ticket_id, workspace_path, started_at, ended_at, status, output FROM agent_runs";

const MERGE_SELECT: &str = "SELECT id, ticket_id, branch, status, attempts, last_error, created_at, completed_at FROM merge_queue";

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::CorruptRow {
        entity: "json",
        id: String::new(),
        message: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(
    text: &str,
    entity: &'static str,
    id: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::CorruptRow {
        entity,
        id: id.to_string(),
        message: e.to_string(),
    })
}

fn parse_ts(text: &str, entity: &'static str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            entity,
            id: id.to_string(),
            message: format!("bad timestamp '{}': {}", text, e),
        })
}

/// Intermediate row for tickets before JSON/enum columns are decoded.
struct TicketRow {
    id: String,
    title: String,
    description: String,
    domain: String,
    priority: u8,
    ticket_type: String,
    files: String,
    dependencies: String,
    acceptance_criteria: String,
    technical_context: String,
    constraints: String,
    signoffs: String,
    bugs: String,
    status: String,
    assigned_agent: Option<String>,
    workspace_path: Option<String>,
    branch: Option<String>,
    parent_id: Option<String>,
    parallel_group: Option<i64>,
    conversation: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TicketRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            domain: row.get(3)?,
            priority: row.get(4)?,
            ticket_type: row.get(5)?,
            files: row.get(6)?,
            dependencies: row.get(7)?,
            acceptance_criteria: row.get(8)?,
            technical_context: row.get(9)?,
            constraints: row.get(10)?,
            signoffs: row.get(11)?,
            bugs: row.get(12)?,
            status: row.get(13)?,
            assigned_agent: row.get(14)?,
            workspace_path: row.get(15)?,
            branch: row.get(16)?,
            parent_id: row.get(17)?,
            parallel_group: row.get(18)?,
            conversation: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            entity: "tickets",
            id: self.id.clone(),
            message,
        };
        Ok(Ticket {
            domain: Domain::parse(&self.domain).map_err(&corrupt)?,
            ticket_type: TicketType::parse(&self.ticket_type).map_err(&corrupt)?,
            status: TicketStatus::parse(&self.status).map_err(&corrupt)?,
            files: from_json(&self.files, "tickets", &self.id)?,
            dependencies: from_json(&self.dependencies, "tickets", &self.id)?,
            acceptance_criteria: from_json(&self.acceptance_criteria, "tickets", &self.id)?,
            constraints: from_json(&self.constraints, "tickets", &self.id)?,
            signoffs: from_json(&self.signoffs, "tickets", &self.id)?,
            bugs: from_json(&self.bugs, "tickets", &self.id)?,
            conversation: self
                .conversation
                .as_deref()
                .map(|c| from_json(c, "tickets", &self.id))
                .transpose()?,
            created_at: parse_ts(&self.created_at, "tickets", &self.id)?,
            updated_at: parse_ts(&self.updated_at, "tickets", &self.id)?,
            history: Vec::new(),
            id: self.id,
            title: self.title,
            description: self.description,
            priority: self.priority,
            technical_context: self.technical_context,
            assigned_agent: self.assigned_agent,
            workspace_path: self.workspace_path,
            branch: self.branch,
            parent_id: self.parent_id,
            parallel_group: self.parallel_group,
        })
    }
}

struct RunRow {
    id: String,
    agent: String,
    ticket_id: String,
    workspace_path: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    status: String,
    output: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent: row.get(1)?,
            ticket_id: row.get(2)?,
            workspace_path: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            status: row.get(6)?,
            output: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<AgentRun, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            entity: "agent_runs",
            id: self.id.clone(),
            message,
        };
        Ok(AgentRun {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?,
            agent: AgentRole::parse(&self.agent).map_err(&corrupt)?,
            status: RunStatus::parse(&self.status).map_err(&corrupt)?,
            started_at: parse_ts(&self.started_at, "agent_runs", &self.id)?,
            ended_at: self
                .ended_at
                .as_deref()
                .map(|t| parse_ts(t, "agent_runs", &self.id))
                .transpose()?,
            ticket_id: self.ticket_id,
            workspace_path: self.workspace_path,
            output: self.output,
        })
    }
}

struct AuditRow {
    id: i64,
    run_id: String,
    ticket_id: String,
    agent: String,
    event_type: String,
    event_data: String,
    tokens_in: i64,
    tokens_out: i64,
    duration_ms: i64,
    created_at: String,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            entity: "agent_audit_log",
            id: self.id.to_string(),
            message,
        };
        Ok(AuditEntry {
            id: self.id,
            run_id: Uuid::parse_str(&self.run_id).map_err(|e| corrupt(e.to_string()))?,
            agent: AgentRole::parse(&self.agent).map_err(&corrupt)?,
            event_type: AuditEventType::parse(&self.event_type).map_err(&corrupt)?,
            event_data: serde_json::from_str(&self.event_data)
                .map_err(|e| corrupt(e.to_string()))?,
            created_at: parse_ts(&self.created_at, "agent_audit_log", &self.ticket_id)?,
            ticket_id: self.ticket_id,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            duration_ms: self.duration_ms,
        })
    }
}

struct PoolRow {
    ticket_id: String,
    branch: String,
    path: String,
    agent: String,
    status: String,
    created_at: String,
    last_activity: String,
}

impl PoolRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ticket_id: row.get(0)?,
            branch: row.get(1)?,
            path: row.get(2)?,
            agent: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            last_activity: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<PoolEntry, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            entity: "worktree_pool",
            id: self.ticket_id.clone(),
            message,
        };
        Ok(PoolEntry {
            agent: AgentRole::parse(&self.agent).map_err(&corrupt)?,
            status: PoolEntryStatus::parse(&self.status).map_err(&corrupt)?,
            created_at: parse_ts(&self.created_at, "worktree_pool", &self.ticket_id)?,
            last_activity: parse_ts(&self.last_activity, "worktree_pool", &self.ticket_id)?,
            ticket_id: self.ticket_id,
            branch: self.branch,
            path: self.path,
        })
    }
}

struct MergeRow {
    id: i64,
    ticket_id: String,
    branch: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl MergeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ticket_id: row.get(1)?,
            branch: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<MergeEntry, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            entity: "merge_queue",
            id: self.id.to_string(),
            message,
        };
        Ok(MergeEntry {
            id: self.id,
            status: MergeStatus::parse(&self.status).map_err(&corrupt)?,
            created_at: parse_ts(&self.created_at, "merge_queue", &self.ticket_id)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|t| parse_ts(t, "merge_queue", &self.ticket_id))
                .transpose()?,
            ticket_id: self.ticket_id,
            branch: self.branch,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BoardStore {
        BoardStore::open_in_memory().expect("in-memory store")
    }

    fn ready_ticket(id: &str, domain: Domain, files: &[&str]) -> Ticket {
        let mut t = Ticket::new(id, &format!("Ticket {}", id), domain);
        t.status = TicketStatus::Ready;
        t.files = files.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn migrations_apply_once_and_record_versions() {
        let s = store();
        let applied: i64 = s
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
    }

    #[test]
    fn create_ticket_records_initial_history() {
        let mut s = store();
        let t = ready_ticket("T-1", Domain::Backend, &["api/users.rs"]);
        s.create_ticket(&t).unwrap();
        let back = s.get_ticket("T-1").unwrap().unwrap();
        assert_eq!(back.status, TicketStatus::Ready);
        assert_eq!(back.history.len(), 1);
        assert_eq!(back.history[0].status, TicketStatus::Ready);
    }

    #[test]
    fn duplicate_ticket_rejected() {
        let mut s = store();
        let t = ready_ticket("T-1", Domain::Backend, &[]);
        s.create_ticket(&t).unwrap();
        let err = s.create_ticket(&t).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTicket { .. }));
    }

    #[test]
    fn update_status_appends_history_atomically() {
        let mut s = store();
        s.create_ticket(&ready_ticket("T-1", Domain::Backend, &[])).unwrap();
        s.update_status("T-1", &TicketStatus::InDev, "scheduler", Some("admitted"))
            .unwrap();
        let t = s.get_ticket("T-1").unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::InDev);
        assert_eq!(t.history.len(), 2);
        assert_eq!(t.history.last().unwrap().status, TicketStatus::InDev);
        assert_eq!(t.history.last().unwrap().note.as_deref(), Some("admitted"));
    }

    #[test]
    fn update_status_unknown_ticket_fails_without_history() {
        let mut s = store();
        let err = s
            .update_status("nope", &TicketStatus::InDev, "scheduler", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::TicketNotFound { .. }));
        let orphans: i64 = s
            .conn
            .query_row("SELECT COUNT(*) FROM ticket_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn list_ready_sorts_by_priority_then_creation() {
        let mut s = store();
        let mut low = ready_ticket("T-low", Domain::Backend, &[]);
        low.priority = 4;
        let mut high = ready_ticket("T-high", Domain::Backend, &[]);
        high.priority = 1;
        s.create_ticket(&low).unwrap();
        s.create_ticket(&high).unwrap();
        let ready = s.list_ready().unwrap();
        assert_eq!(ready[0].id, "T-high");
        assert_eq!(ready[1].id, "T-low");
    }

    #[test]
    fn dependencies_by_id_and_exact_title() {
        let mut s = store();
        let mut dep = ready_ticket("T-dep", Domain::Backend, &[]);
        dep.title = "Schema migration".to_string();
        dep.status = TicketStatus::Done;
        s.create_ticket(&dep).unwrap();

        let mut by_id = ready_ticket("T-a", Domain::Backend, &[]);
        by_id.dependencies = vec!["T-dep".to_string()];
        let mut by_title = ready_ticket("T-b", Domain::Backend, &[]);
        by_title.dependencies = vec!["Schema migration".to_string()];
        let mut unknown = ready_ticket("T-c", Domain::Backend, &[]);
        unknown.dependencies = vec!["T-ghost".to_string()];
        s.create_ticket(&by_id).unwrap();
        s.create_ticket(&by_title).unwrap();
        s.create_ticket(&unknown).unwrap();

        assert!(s.dependencies_done(&by_id).unwrap());
        assert!(s.dependencies_done(&by_title).unwrap());
        assert!(!s.dependencies_done(&unknown).unwrap());
    }

    #[test]
    fn next_for_domain_skips_conflicting_candidates() {
        let mut s = store();
        let mut busy = ready_ticket("T-busy", Domain::Backend, &["pkg/a/*"]);
        busy.status = TicketStatus::InDev;
        s.create_ticket(&busy).unwrap();
        s.create_ticket(&ready_ticket("T-clash", Domain::Backend, &["pkg/a/b.rs"]))
            .unwrap();
        let mut clean = ready_ticket("T-clean", Domain::Backend, &["pkg/z/c.rs"]);
        clean.priority = 4;
        s.create_ticket(&clean).unwrap();

        let next = s.next_for_domain(Domain::Backend).unwrap().unwrap();
        assert_eq!(next.id, "T-clean");
    }

    #[test]
    fn signoff_set_and_cleared() {
        let mut s = store();
        s.create_ticket(&ready_ticket("T-1", Domain::Backend, &[])).unwrap();
        s.add_signoff("T-1", Stage::Dev, Utc::now()).unwrap();
        assert!(s.get_ticket("T-1").unwrap().unwrap().signoffs.dev.is_some());
        s.clear_signoff("T-1", Stage::Dev).unwrap();
        assert!(s.get_ticket("T-1").unwrap().unwrap().signoffs.dev.is_none());
    }

    #[test]
    fn run_lifecycle_and_orphan_recovery() {
        let mut s = store();
        s.create_ticket(&ready_ticket("T-1", Domain::Backend, &[])).unwrap();
        let run = AgentRun {
            id: Uuid::new_v4(),
            agent: AgentRole::DevBackend,
            ticket_id: "T-1".to_string(),
            workspace_path: None,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            output: None,
        };
        s.add_run(&run).unwrap();
        assert!(s.is_agent_running("T-1", AgentRole::DevBackend).unwrap());
        assert_eq!(s.active_runs().unwrap().len(), 1);

        let recovered = s.recover_orphan_runs().unwrap();
        assert_eq!(recovered, 1);
        let back = s.get_run(run.id).unwrap().unwrap();
        assert_eq!(back.status, RunStatus::Failed);
        assert_eq!(back.output.as_deref(), Some(ORPHAN_NOTE));
        assert!(back.ended_at.is_some());
        assert!(!s.is_agent_running("T-1", AgentRole::DevBackend).unwrap());
    }

    #[test]
    fn stale_runs_failed_on_demand() {
        let mut s = store();
        s.create_ticket(&ready_ticket("T-1", Domain::Backend, &[])).unwrap();
        let run = AgentRun {
            id: Uuid::new_v4(),
            agent: AgentRole::Qa,
            ticket_id: "T-1".to_string(),
            workspace_path: None,
            started_at: Utc::now() - Duration::hours(3),
            ended_at: None,
            status: RunStatus::Running,
            output: None,
        };
        s.add_run(&run).unwrap();
        assert_eq!(s.fail_stale_runs(Duration::hours(1)).unwrap(), 1);
        assert_eq!(s.fail_stale_runs(Duration::hours(1)).unwrap(), 0);
    }

    #[test]
    fn audit_truncation_at_exact_cap() {
        let text = "a".repeat(AUDIT_PROMPT_CAP + 1);
        let truncated = truncate_audit_text(&text);
        assert_eq!(
            truncated.len(),
            AUDIT_PROMPT_CAP + TRUNCATION_MARKER.len()
        );
        assert!(truncated.ends_with(TRUNCATION_MARKER));

        let exact = "b".repeat(AUDIT_PROMPT_CAP);
        assert_eq!(truncate_audit_text(&exact), exact);
    }

    #[test]
    fn audit_entries_ordered_within_run() {
        let mut s = store();
        s.create_ticket(&ready_ticket("T-1", Domain::Backend, &[])).unwrap();
        let run_id = Uuid::new_v4();
        s.append_audit(
            run_id,
            "T-1",
            AgentRole::Qa,
            AuditEventType::PromptSent,
            &serde_json::json!({"prompt": "review this"}),
            0,
            0,
            0,
        )
        .unwrap();
        s.append_audit(
            run_id,
            "T-1",
            AgentRole::Qa,
            AuditEventType::ResponseReceived,
            &serde_json::json!({"text": "looks good"}),
            120,
            40,
            900,
        )
        .unwrap();
        let entries = s.audit_for_run(run_id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::PromptSent);
        assert_eq!(entries[1].event_type, AuditEventType::ResponseReceived);
        assert_eq!(entries[1].tokens_in, 120);

        let totals = s.usage_totals().unwrap();
        assert_eq!(totals.calls, 1);
        assert_eq!(totals.tokens_in, 120);
        assert_eq!(totals.tokens_out, 40);
    }

    #[test]
    fn merge_queue_fifo_and_single_open_entry() {
        let s = store();
        let first = s.enqueue_merge("T-1", "feat/T-1").unwrap();
        let _second = s.enqueue_merge("T-2", "feat/T-2").unwrap();
        assert!(s.enqueue_merge("T-1", "feat/T-1").is_err());

        let next = s.next_pending_merge().unwrap().unwrap();
        assert_eq!(next.id, first.id);

        s.mark_merge_in_progress(first.id).unwrap();
        assert!(s.enqueue_merge("T-1", "feat/T-1").is_err());
        s.mark_merge_completed(first.id).unwrap();
        let done = s.get_merge_entry(first.id).unwrap().unwrap();
        assert_eq!(done.status, MergeStatus::Completed);
        assert!(done.last_error.is_none());
        assert!(done.completed_at.is_some());

        // Terminal entry no longer blocks a fresh queue entry.
        assert!(s.enqueue_merge("T-1", "feat/T-1").is_ok());
    }

    #[test]
    fn merge_retry_bound_returns_to_pending_then_fails() {
        let s = store();
        let entry = s.enqueue_merge("T-1", "feat/T-1").unwrap();

        s.mark_merge_in_progress(entry.id).unwrap();
        let status = s.mark_merge_failed(entry.id, "network", 3).unwrap();
        assert_eq!(status, MergeStatus::Pending);

        s.mark_merge_in_progress(entry.id).unwrap();
        s.mark_merge_in_progress(entry.id).unwrap();
        let status = s.mark_merge_failed(entry.id, "network again", 3).unwrap();
        assert_eq!(status, MergeStatus::Failed);
        let back = s.get_merge_entry(entry.id).unwrap().unwrap();
        assert_eq!(back.attempts, 3);
        assert_eq!(back.last_error.as_deref(), Some("network again"));
        assert!(back.completed_at.is_some());
    }

    #[test]
    fn pool_entries_slot_accounting() {
        let s = store();
        let entry = PoolEntry {
            ticket_id: "T-1".to_string(),
            branch: "feat/T-1".to_string(),
            path: "/tmp/wt/T-1".to_string(),
            agent: AgentRole::DevBackend,
            status: PoolEntryStatus::Active,
            created_at: Utc::now(),
            last_activity: Utc::now(),
        };
        s.insert_pool_entry(&entry).unwrap();
        assert_eq!(s.pool_slots_used().unwrap(), 1);
        s.update_pool_status("T-1", PoolEntryStatus::Merging).unwrap();
        assert_eq!(s.pool_slots_used().unwrap(), 1);
        s.update_pool_status("T-1", PoolEntryStatus::CleanupPending)
            .unwrap();
        assert_eq!(s.pool_slots_used().unwrap(), 0);
        s.remove_pool_entry("T-1").unwrap();
        assert!(s.get_pool_entry("T-1").unwrap().is_none());
    }

    #[test]
    fn config_and_role_config_round_trip() {
        let s = store();
        s.set_config("max_parallel_agents", "5").unwrap();
        assert_eq!(
            s.get_config("max_parallel_agents").unwrap().as_deref(),
            Some("5")
        );
        s.set_config("max_parallel_agents", "2").unwrap();
        assert_eq!(
            s.get_config("max_parallel_agents").unwrap().as_deref(),
            Some("2")
        );

        s.set_role_config(AgentRole::Qa, "anthropic", "mid-tier", None)
            .unwrap();
        let cfg = s.get_role_config(AgentRole::Qa).unwrap().unwrap();
        assert_eq!(cfg.provider, "anthropic");
        assert_eq!(cfg.model, "mid-tier");
        assert!(s.get_role_config(AgentRole::Ux).unwrap().is_none());
    }

    #[tokio::test]
    async fn store_handle_serialises_async_callers() {
        let handle = StoreHandle::new(store());
        let mut t = ready_ticket("T-1", Domain::Backend, &[]);
        t.priority = 2;
        handle
            .call(move |s| s.create_ticket(&t))
            .await
            .unwrap();
        let fetched = handle
            .call(|s| s.get_ticket("T-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.priority, 2);
    }
}
