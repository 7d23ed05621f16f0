use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::catalog::SeatDefinition;
use crate::state_machine::{MachineCheckpoint, SeatAlert, SeatEvent, SeatSnapshot, SeatStatus, SeatUpdate};

/// Checkpoint scope written by the live pipeline; positions are frame indices.
pub const PIPELINE_CHECKPOINTS: &str = "pipeline";
/// Checkpoint scope written by record replay; positions count consumed records.
pub const REPLAY_CHECKPOINTS: &str = "replay";

/// Latest known status of one seat, from its most recent event.
#[derive(Clone, Debug, PartialEq)]
pub struct SeatStatusRow {
    pub seat_id: u32,
    pub status: SeatStatus,
    pub since_ms: i64,
}

pub trait SeatStore {
    fn insert_seat(&mut self, seat: &SeatDefinition) -> Result<()>;

    fn insert_seat_event(&mut self, event: &SeatEvent) -> Result<()>;

    fn insert_snapshot(&mut self, snapshot: &SeatSnapshot) -> Result<()>;

    /// Alerts are keyed by id; inserting an id twice keeps the first row.
    fn insert_alert(&mut self, alert: &SeatAlert) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn current_seat_status(&mut self) -> Result<Vec<SeatStatusRow>>;

    fn pending_alerts(&mut self) -> Result<Vec<SeatAlert>>;

    /// Returns false when no alert has that id.
    fn mark_alert_processed(&mut self, alert_id: &str) -> Result<bool>;

    /// Save machine state at `position` within `scope`. What a position
    /// means is up to the scope's writer.
    fn save_checkpoint(
        &mut self,
        scope: &str,
        position: u64,
        checkpoint: &MachineCheckpoint,
    ) -> Result<()>;

    fn latest_checkpoint(&mut self, scope: &str) -> Result<Option<(u64, MachineCheckpoint)>>;

    /// Write one frame's state-machine output in a single transaction.
    ///
    /// Every update contributes its snapshot; events and alerts are written
    /// when present. On failure the transaction is rolled back and the error
    /// returned.
    fn store_frame(&mut self, updates: &[SeatUpdate]) -> Result<()> {
        self.begin()?;
        let written = updates.iter().try_for_each(|u| {
            if let Some(event) = &u.event {
                self.insert_seat_event(event)?;
            }
            if let Some(alert) = &u.alert {
                self.insert_alert(alert)?;
            }
            self.insert_snapshot(&u.snapshot)
        });
        match written {
            Ok(()) => self.commit(),
            Err(e) => {
                if let Err(rb) = self.rollback() {
                    log::error!("rollback failed: {}", rb);
                }
                Err(e)
            }
        }
    }
}

pub struct SqliteSeatStore {
    conn: Connection,
}

impl SqliteSeatStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS seats (
              seat_id INTEGER PRIMARY KEY,
              roi_json TEXT NOT NULL,
              poly_json TEXT
            );

            CREATE TABLE IF NOT EXISTS seat_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              seat_id INTEGER NOT NULL,
              state TEXT NOT NULL,
              ts_ms INTEGER NOT NULL,
              duration_sec REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              ts_ms INTEGER NOT NULL,
              seat_id INTEGER NOT NULL,
              state TEXT NOT NULL,
              person_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
              alert_id TEXT PRIMARY KEY,
              seat_id INTEGER NOT NULL,
              alert_type TEXT NOT NULL,
              description TEXT NOT NULL,
              ts_ms INTEGER NOT NULL,
              anomaly_secs REAL NOT NULL,
              is_processed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              scope TEXT NOT NULL,
              position INTEGER NOT NULL,
              state_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_seat ON seat_events(seat_id, id);
            CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON snapshots(ts_ms);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_scope ON checkpoints(scope, id);
            "#,
        )?;
        Ok(())
    }
}

fn parse_status(label: &str) -> Result<SeatStatus> {
    SeatStatus::from_label(label).ok_or_else(|| anyhow!("unknown seat state '{}' in store", label))
}

impl SeatStore for SqliteSeatStore {
    fn insert_seat(&mut self, seat: &SeatDefinition) -> Result<()> {
        let roi_json = serde_json::to_string(&seat.rect)?;
        let poly_json = seat.polygon().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO seats(seat_id, roi_json, poly_json) VALUES (?1, ?2, ?3)",
            params![seat.seat_id, roi_json, poly_json],
        )?;
        Ok(())
    }

    fn insert_seat_event(&mut self, event: &SeatEvent) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO seat_events(seat_id, state, ts_ms, duration_sec)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.seat_id,
                event.new_status.label(),
                event.timestamp_ms,
                event.duration_sec
            ],
        )?;
        Ok(())
    }

    fn insert_snapshot(&mut self, snapshot: &SeatSnapshot) -> Result<()> {
        self.conn.execute(
            "INSERT INTO snapshots(ts_ms, seat_id, state, person_count) VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.timestamp_ms,
                snapshot.seat_id,
                snapshot.status.label(),
                snapshot.person_count
            ],
        )?;
        Ok(())
    }

    fn insert_alert(&mut self, alert: &SeatAlert) -> Result<()> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO alerts(alert_id, seat_id, alert_type, description, ts_ms, anomaly_secs, is_processed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                alert.alert_id,
                alert.seat_id,
                alert.alert_type,
                alert.description,
                alert.timestamp_ms,
                alert.anomaly_secs,
                alert.is_processed
            ],
        )?;
        if inserted == 0 {
            log::debug!("alert {} already stored", alert.alert_id);
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn current_seat_status(&mut self) -> Result<Vec<SeatStatusRow>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT e.seat_id, e.state, e.ts_ms FROM seat_events e
                JOIN (SELECT seat_id, MAX(id) AS id FROM seat_events GROUP BY seat_id) last
                  ON e.id = last.id
                ORDER BY e.seat_id ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let seat_id: u32 = row.get(0)?;
                let state: String = row.get(1)?;
                let since_ms: i64 = row.get(2)?;
                out.push((seat_id, state, since_ms));
            }
            out
        };

        rows.into_iter()
            .map(|(seat_id, state, since_ms)| {
                Ok(SeatStatusRow {
                    seat_id,
                    status: parse_status(&state)?,
                    since_ms,
                })
            })
            .collect()
    }

    fn pending_alerts(&mut self) -> Result<Vec<SeatAlert>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT alert_id, seat_id, alert_type, description, ts_ms, anomaly_secs
            FROM alerts WHERE is_processed = 0 ORDER BY ts_ms ASC, alert_id ASC
            "#,
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(SeatAlert {
                alert_id: row.get(0)?,
                seat_id: row.get(1)?,
                alert_type: row.get(2)?,
                description: row.get(3)?,
                timestamp_ms: row.get(4)?,
                anomaly_secs: row.get(5)?,
                is_processed: false,
            });
        }
        Ok(out)
    }

    fn mark_alert_processed(&mut self, alert_id: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE alerts SET is_processed = 1 WHERE alert_id = ?1",
            params![alert_id],
        )?;
        Ok(updated > 0)
    }

    fn save_checkpoint(
        &mut self,
        scope: &str,
        position: u64,
        checkpoint: &MachineCheckpoint,
    ) -> Result<()> {
        let state_json = serde_json::to_string(checkpoint)?;
        let position =
            i64::try_from(position).map_err(|_| anyhow!("checkpoint position exceeds i64 range"))?;
        self.conn.execute(
            "INSERT INTO checkpoints(scope, position, state_json) VALUES (?1, ?2, ?3)",
            params![scope, position, state_json],
        )?;
        Ok(())
    }

    fn latest_checkpoint(&mut self, scope: &str) -> Result<Option<(u64, MachineCheckpoint)>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT position, state_json FROM checkpoints WHERE scope = ?1 ORDER BY id DESC LIMIT 1",
                params![scope],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((position, state_json)) = row else {
            return Ok(None);
        };
        let checkpoint: MachineCheckpoint =
            serde_json::from_str(&state_json).context("corrupt checkpoint state")?;
        Ok(Some((position.max(0) as u64, checkpoint)))
    }
}

#[derive(Clone, Debug, Default)]
struct InMemoryTables {
    seats: Vec<SeatDefinition>,
    events: Vec<SeatEvent>,
    snapshots: Vec<SeatSnapshot>,
    alerts: Vec<SeatAlert>,
    checkpoints: Vec<(String, u64, MachineCheckpoint)>,
}

/// Store kept in process memory. Transactions snapshot the tables on
/// `begin` and restore them on `rollback`.
#[derive(Clone, Debug, Default)]
pub struct InMemorySeatStore {
    tables: InMemoryTables,
    saved: Option<InMemoryTables>,
}

impl InMemorySeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SeatEvent] {
        &self.tables.events
    }

    pub fn snapshots(&self) -> &[SeatSnapshot] {
        &self.tables.snapshots
    }

    pub fn alerts(&self) -> &[SeatAlert] {
        &self.tables.alerts
    }

    pub fn seats(&self) -> &[SeatDefinition] {
        &self.tables.seats
    }
}

impl SeatStore for InMemorySeatStore {
    fn insert_seat(&mut self, seat: &SeatDefinition) -> Result<()> {
        self.tables.seats.retain(|s| s.seat_id != seat.seat_id);
        self.tables.seats.push(seat.clone());
        Ok(())
    }

    fn insert_seat_event(&mut self, event: &SeatEvent) -> Result<()> {
        self.tables.events.push(event.clone());
        Ok(())
    }

    fn insert_snapshot(&mut self, snapshot: &SeatSnapshot) -> Result<()> {
        self.tables.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn insert_alert(&mut self, alert: &SeatAlert) -> Result<()> {
        if !self.tables.alerts.iter().any(|a| a.alert_id == alert.alert_id) {
            self.tables.alerts.push(alert.clone());
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Err(anyhow!("transaction already open"));
        }
        self.saved = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.saved
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("commit without an open transaction"))
    }

    fn rollback(&mut self) -> Result<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| anyhow!("rollback without an open transaction"))?;
        self.tables = saved;
        Ok(())
    }

    fn current_seat_status(&mut self) -> Result<Vec<SeatStatusRow>> {
        let mut latest = std::collections::BTreeMap::new();
        for event in &self.tables.events {
            latest.insert(
                event.seat_id,
                SeatStatusRow {
                    seat_id: event.seat_id,
                    status: event.new_status,
                    since_ms: event.timestamp_ms,
                },
            );
        }
        Ok(latest.into_values().collect())
    }

    fn pending_alerts(&mut self) -> Result<Vec<SeatAlert>> {
        let mut pending: Vec<SeatAlert> = self
            .tables
            .alerts
            .iter()
            .filter(|a| !a.is_processed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.alert_id.cmp(&b.alert_id))
        });
        Ok(pending)
    }

    fn mark_alert_processed(&mut self, alert_id: &str) -> Result<bool> {
        match self.tables.alerts.iter_mut().find(|a| a.alert_id == alert_id) {
            Some(alert) => {
                alert.is_processed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn save_checkpoint(
        &mut self,
        scope: &str,
        position: u64,
        checkpoint: &MachineCheckpoint,
    ) -> Result<()> {
        self.tables
            .checkpoints
            .push((scope.to_string(), position, checkpoint.clone()));
        Ok(())
    }

    fn latest_checkpoint(&mut self, scope: &str) -> Result<Option<(u64, MachineCheckpoint)>> {
        Ok(self
            .tables
            .checkpoints
            .iter()
            .rev()
            .find(|(s, _, _)| s == scope)
            .map(|(_, position, cp)| (*position, cp.clone())))
    }
}
