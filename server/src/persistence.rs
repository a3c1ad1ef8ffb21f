use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use miam_execution::verify_assignments;
use miam_types::{DrawerRecord, Phase};
use postgres::{Client, NoTls};
use rusqlite::{params, Connection, OptionalExtension};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use url::Url;

use crate::metrics::PersistenceMetrics;

enum PersistRequest {
    Record(DrawerRecord),
    Flush(oneshot::Sender<()>),
}

/// Where the drawer record lives.
#[derive(Clone, Debug)]
pub enum PersistenceBackendConfig {
    Sqlite(PathBuf),
    Postgres(String),
}

enum PersistenceBackend {
    Sqlite(Connection),
    Postgres(Client),
}

/// Column values of a `drawer_data` row.
struct StoredRow {
    participants: String,
    phase: String,
    deadline: Option<String>,
    assignments: String,
    updated_at: String,
}

impl StoredRow {
    fn encode(record: &DrawerRecord) -> anyhow::Result<Self> {
        Ok(Self {
            participants: serde_json::to_string(&record.participants)
                .context("encode participants")?,
            phase: record.phase.as_str().to_string(),
            deadline: record.deadline.map(|deadline| deadline.to_rfc3339()),
            assignments: serde_json::to_string(&record.assignments)
                .context("encode assignments")?,
            updated_at: record.updated_at.to_rfc3339(),
        })
    }

    fn decode(self) -> anyhow::Result<DrawerRecord> {
        let phase = self
            .phase
            .parse::<Phase>()
            .map_err(|err| anyhow::anyhow!("decode phase {:?}: {err}", self.phase))?;
        let deadline = self
            .deadline
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .context("decode deadline")?;
        Ok(DrawerRecord {
            participants: serde_json::from_str(&self.participants)
                .context("decode participants")?,
            phase,
            deadline,
            assignments: serde_json::from_str(&self.assignments)
                .context("decode assignments")?,
            updated_at: parse_timestamp(&self.updated_at).context("decode updated_at")?,
        })
    }
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// Durable storage for the drawer record.
///
/// The record is written by a dedicated thread. Queued snapshots are coalesced so
/// only the newest one reaches the database; a full queue makes callers wait.
pub struct DrawerStore {
    sender: mpsc::Sender<PersistRequest>,
    metrics: Arc<PersistenceMetrics>,
}

impl DrawerStore {
    /// Opens the backend, loads the stored record (creating one if the table is
    /// empty) and starts the writer thread.
    ///
    /// Blocks on database I/O; call it off the async runtime.
    pub fn load_and_start(
        backend: PersistenceBackendConfig,
        buffer_size: usize,
        metrics: Arc<PersistenceMetrics>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Self, DrawerRecord)> {
        let (row_id, record) = match &backend {
            PersistenceBackendConfig::Sqlite(path) => {
                let conn = Connection::open(path).context("open drawer persistence db")?;
                init_schema_sqlite(&conn)?;
                load_or_create_sqlite(&conn, now)?
            }
            PersistenceBackendConfig::Postgres(url) => {
                validate_postgres_url(url)?;
                let mut client =
                    Client::connect(url, NoTls).context("open drawer persistence postgres")?;
                init_schema_postgres(&mut client)?;
                load_or_create_postgres(&mut client, now)?
            }
        };
        check_loaded(&record);
        info!(
            row_id,
            participants = record.participants.len(),
            phase = record.phase.as_str(),
            "loaded drawer record"
        );

        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let worker_metrics = Arc::clone(&metrics);
        std::thread::Builder::new()
            .name("drawer-persistence".to_string())
            .spawn(move || persistence_worker(backend, row_id, receiver, worker_metrics))
            .context("spawn drawer persistence worker")?;

        Ok((Self { sender, metrics }, record))
    }

    /// Queues a snapshot for writing.
    pub async fn persist(&self, record: DrawerRecord) {
        // Counted before sending so the worker's decrement never runs first.
        self.metrics.inc_queue_depth();
        if let Err(err) = self.sender.send(PersistRequest::Record(record)).await {
            self.metrics.dec_queue_depth();
            self.metrics.inc_write_error();
            warn!("Drawer persistence channel closed: {err}");
        }
    }

    /// Waits until every snapshot queued before this call has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(PersistRequest::Flush(tx)).await.is_err() {
            warn!("Drawer persistence channel closed before flush");
            return;
        }
        let _ = rx.await;
    }
}

fn check_loaded(record: &DrawerRecord) {
    if record.phase != Phase::Drawn {
        return;
    }
    if let Err(err) = verify_assignments(&record.participants, &record.assignments) {
        warn!(
            error = %err,
            "stored assignments are inconsistent; an admin should redraw or reset"
        );
    }
}

fn validate_postgres_url(url: &str) -> anyhow::Result<()> {
    if allow_public_postgres() {
        return Ok(());
    }

    let parsed = Url::parse(url).context("parse postgres url")?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        bail!("postgres url must start with postgres:// or postgresql://");
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("postgres url missing host"))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) if is_private_ip(ip) => Ok(()),
        Ok(_) => bail!("postgres host is public; set DRAWER_PERSISTENCE_ALLOW_PUBLIC=1 to override"),
        Err(_) => bail!(
            "postgres host must be localhost or a private IP; set DRAWER_PERSISTENCE_ALLOW_PUBLIC=1 to override"
        ),
    }
}

fn allow_public_postgres() -> bool {
    matches!(
        std::env::var("DRAWER_PERSISTENCE_ALLOW_PUBLIC").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

fn init_schema_sqlite(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS drawer_data (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             participants TEXT NOT NULL,
             phase TEXT NOT NULL,
             deadline TEXT,
             assignments TEXT NOT NULL,
             updated_at TEXT NOT NULL
         );",
    )
    .context("init drawer persistence schema")?;
    Ok(())
}

fn load_or_create_sqlite(
    conn: &Connection,
    now: DateTime<Utc>,
) -> anyhow::Result<(i64, DrawerRecord)> {
    let existing = conn
        .query_row(
            "SELECT id, participants, phase, deadline, assignments, updated_at
             FROM drawer_data ORDER BY id ASC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    StoredRow {
                        participants: row.get(1)?,
                        phase: row.get(2)?,
                        deadline: row.get(3)?,
                        assignments: row.get(4)?,
                        updated_at: row.get(5)?,
                    },
                ))
            },
        )
        .optional()
        .context("query drawer record")?;
    if let Some((id, row)) = existing {
        return Ok((id, row.decode()?));
    }

    let record = DrawerRecord::new(now);
    let row = StoredRow::encode(&record)?;
    conn.execute(
        "INSERT INTO drawer_data (participants, phase, deadline, assignments, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            row.participants,
            row.phase,
            row.deadline,
            row.assignments,
            row.updated_at
        ],
    )
    .context("insert initial drawer record")?;
    Ok((conn.last_insert_rowid(), record))
}

fn write_sqlite(conn: &Connection, id: i64, record: &DrawerRecord) -> anyhow::Result<()> {
    let row = StoredRow::encode(record)?;
    conn.execute(
        "UPDATE drawer_data
         SET participants = ?, phase = ?, deadline = ?, assignments = ?, updated_at = ?
         WHERE id = ?",
        params![
            row.participants,
            row.phase,
            row.deadline,
            row.assignments,
            row.updated_at,
            id
        ],
    )
    .context("update drawer record")?;
    Ok(())
}

fn init_schema_postgres(client: &mut Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS drawer_data (
                 id BIGSERIAL PRIMARY KEY,
                 participants TEXT NOT NULL,
                 phase TEXT NOT NULL,
                 deadline TEXT,
                 assignments TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .context("init postgres drawer persistence schema")?;
    Ok(())
}

fn load_or_create_postgres(
    client: &mut Client,
    now: DateTime<Utc>,
) -> anyhow::Result<(i64, DrawerRecord)> {
    let existing = client
        .query_opt(
            "SELECT id, participants, phase, deadline, assignments, updated_at
             FROM drawer_data ORDER BY id ASC LIMIT 1",
            &[],
        )
        .context("query postgres drawer record")?;
    if let Some(row) = existing {
        let id: i64 = row.get(0);
        let stored = StoredRow {
            participants: row.get(1),
            phase: row.get(2),
            deadline: row.get(3),
            assignments: row.get(4),
            updated_at: row.get(5),
        };
        return Ok((id, stored.decode()?));
    }

    let record = DrawerRecord::new(now);
    let row = StoredRow::encode(&record)?;
    let inserted = client
        .query_one(
            "INSERT INTO drawer_data (participants, phase, deadline, assignments, updated_at)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
            &[
                &row.participants,
                &row.phase,
                &row.deadline,
                &row.assignments,
                &row.updated_at,
            ],
        )
        .context("insert initial postgres drawer record")?;
    Ok((inserted.get(0), record))
}

fn write_postgres(client: &mut Client, id: i64, record: &DrawerRecord) -> anyhow::Result<()> {
    let row = StoredRow::encode(record)?;
    client
        .execute(
            "UPDATE drawer_data
             SET participants = $1, phase = $2, deadline = $3, assignments = $4, updated_at = $5
             WHERE id = $6",
            &[
                &row.participants,
                &row.phase,
                &row.deadline,
                &row.assignments,
                &row.updated_at,
                &id,
            ],
        )
        .context("update postgres drawer record")?;
    Ok(())
}

impl PersistenceBackend {
    fn connect(config: &PersistenceBackendConfig) -> anyhow::Result<Self> {
        match config {
            PersistenceBackendConfig::Sqlite(path) => Connection::open(path)
                .map(Self::Sqlite)
                .context("open drawer persistence db"),
            PersistenceBackendConfig::Postgres(url) => Client::connect(url, NoTls)
                .map(Self::Postgres)
                .context("connect drawer persistence postgres"),
        }
    }

    fn write(&mut self, row_id: i64, record: &DrawerRecord) -> anyhow::Result<()> {
        match self {
            Self::Sqlite(conn) => write_sqlite(conn, row_id, record),
            Self::Postgres(client) => write_postgres(client, row_id, record),
        }
    }
}

/// Writes `record`, connecting first when `slot` is empty. A failed write
/// empties the slot so the next call reconnects.
fn write_with_reconnect(
    slot: &mut Option<PersistenceBackend>,
    config: &PersistenceBackendConfig,
    row_id: i64,
    record: &DrawerRecord,
) -> anyhow::Result<()> {
    let mut backend = match slot.take() {
        Some(backend) => backend,
        None => PersistenceBackend::connect(config)?,
    };
    backend.write(row_id, record)?;
    *slot = Some(backend);
    Ok(())
}

fn persistence_worker(
    config: PersistenceBackendConfig,
    row_id: i64,
    mut receiver: mpsc::Receiver<PersistRequest>,
    metrics: Arc<PersistenceMetrics>,
) {
    let mut backend = match PersistenceBackend::connect(&config) {
        Ok(backend) => Some(backend),
        Err(err) => {
            error!("Drawer persistence connect failed, retrying on next write: {err:#}");
            None
        }
    };

    while let Some(request) = receiver.blocking_recv() {
        let mut newest = None;
        let mut waiters = Vec::new();
        let mut next = Some(request);
        while let Some(request) = next.take() {
            match request {
                PersistRequest::Record(record) => {
                    metrics.dec_queue_depth();
                    if newest.replace(record).is_some() {
                        metrics.add_coalesced(1);
                    }
                }
                PersistRequest::Flush(waiter) => waiters.push(waiter),
            }
            next = receiver.try_recv().ok();
        }

        if let Some(record) = newest {
            match write_with_reconnect(&mut backend, &config, row_id, &record) {
                Ok(()) => metrics.inc_write(),
                Err(err) => {
                    metrics.inc_write_error();
                    error!("Drawer persistence write failed: {err:#}");
                }
            }
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}
