//! Durable record of decoded events.
//!
//! One table, `roll_state_data`, created if missing:
//!
//! | column            | type    | notes                                 |
//! |-------------------|---------|---------------------------------------|
//! | id                | INTEGER | primary key                           |
//! | device_id         | TEXT    |                                       |
//! | roll_state        | INTEGER |                                       |
//! | current_face      | INTEGER |                                       |
//! | timestamp         | TEXT    | RFC 3339, when the row was written    |
//! | received_at       | TEXT    | RFC 3339, when the frame arrived      |
//! | battery_level     | INTEGER | NULL when the revision lacks it       |
//! | is_charging       | INTEGER | NULL when the revision lacks it       |
//! | led_count         | INTEGER | NULL when the revision lacks it       |
//! | design_and_color  | INTEGER | NULL when the revision lacks it       |
//! | protocol_revision | INTEGER |                                       |
//!
//! The connection is owned by a single worker thread fed through a bounded
//! queue, so a slow disk never stalls fan-out.

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use rusqlite::{Connection, params};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::health::Health;
use crate::protocol::{DecodedEvent, Message};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Append-only sink for decoded events.
pub trait EventStore: Send + 'static {
    fn append(
        &mut self,
        event: &DecodedEvent,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS roll_state_data (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id         TEXT NOT NULL,
                roll_state        INTEGER NOT NULL,
                current_face      INTEGER NOT NULL,
                timestamp         TEXT NOT NULL,
                received_at       TEXT NOT NULL,
                battery_level     INTEGER,
                is_charging       INTEGER,
                led_count         INTEGER,
                design_and_color  INTEGER,
                protocol_revision INTEGER NOT NULL
            );",
        )?;
        Ok(SqliteStore { conn })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM roll_state_data", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl EventStore for SqliteStore {
    fn append(
        &mut self,
        event: &DecodedEvent,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Message::RollState(state) = &event.message;
        self.conn.execute(
            "INSERT INTO roll_state_data (
                device_id, roll_state, current_face, timestamp, received_at,
                battery_level, is_charging, led_count, design_and_color, protocol_revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.device_id,
                state.roll_state,
                state.current_face,
                recorded_at.to_rfc3339(),
                event.timestamp.to_rfc3339(),
                state.battery_level,
                state.is_charging,
                state.led_count,
                state.design_and_color,
                event.protocol_revision,
            ],
        )?;
        Ok(())
    }
}

/// Producer side of the persistence worker. Never blocks.
#[derive(Clone, Debug)]
pub struct PersistenceSink {
    tx: mpsc::Sender<DecodedEvent>,
    health: Arc<Health>,
}

impl PersistenceSink {
    pub fn submit(&self, event: DecodedEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Persistence queue full, dropping event from {}", event.device_id);
                self.health.record_persist_dropped();
            }
            Err(TrySendError::Closed(_)) => {
                self.health
                    .record_persist_failure("persistence worker stopped".into());
            }
        }
    }
}

/// Move `store` onto its own thread and return the queue feeding it.
pub fn spawn_persistence<S: EventStore>(
    mut store: S,
    capacity: usize,
    health: Arc<Health>,
) -> std::io::Result<(PersistenceSink, thread::JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<DecodedEvent>(capacity.max(1));
    let worker_health = Arc::clone(&health);
    let worker = thread::Builder::new()
        .name("pixels-store".into())
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                match store.append(&event, Utc::now()) {
                    Ok(()) => {
                        debug!("Data successfully inserted into database");
                        worker_health.record_persisted();
                    }
                    Err(err) => {
                        error!("Failed to insert data into database: {err}");
                        worker_health.record_persist_failure(err.to_string());
                    }
                }
            }
            debug!("Persistence worker exiting");
        })?;
    Ok((PersistenceSink { tx, health }, worker))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{RawFrame, decode};

    fn roll(face: u8) -> DecodedEvent {
        decode(&RawFrame::new("AA:BB:CC:DD:EE:FF", vec![3, 1, face])).unwrap()
    }

    #[test]
    fn test_append_writes_row_with_null_unsupported_fields() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.append(&roll(5), Utc::now()).unwrap();
        store.append(&roll(6), Utc::now()).unwrap();
        assert_eq!(store.count().unwrap(), 2);

        let (face, battery, charging, revision): (u8, Option<u8>, Option<bool>, u8) = store
            .conn
            .query_row(
                "SELECT current_face, battery_level, is_charging, protocol_revision
                 FROM roll_state_data ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();
        assert_eq!(face, 5);
        assert_eq!(battery, None);
        assert_eq!(charging, None);
        assert_eq!(revision, 1);
    }

    #[test]
    fn test_worker_persists_and_reports() {
        let health = Arc::new(Health::default());
        let (sink, worker) =
            spawn_persistence(SqliteStore::open_in_memory().unwrap(), 4, Arc::clone(&health))
                .unwrap();
        sink.submit(roll(1));
        sink.submit(roll(2));
        drop(sink);
        worker.join().unwrap();

        let report = health.report(crate::connection::ConnectionState::Idle, Vec::new());
        assert_eq!(report.persisted, 2);
        assert_eq!(report.persist_failures, 0);
    }

    struct SlowStore;

    impl EventStore for SlowStore {
        fn append(&mut self, _: &DecodedEvent, _: DateTime<Utc>) -> Result<(), StoreError> {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let health = Arc::new(Health::default());
        let (sink, _worker) = spawn_persistence(SlowStore, 1, Arc::clone(&health)).unwrap();
        for face in 0..10 {
            sink.submit(roll(face));
        }
        let report = health.report(crate::connection::ConnectionState::Idle, Vec::new());
        assert!(report.persist_dropped >= 8, "{report:?}");
    }
}
