use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::connection::ConnectionState;
use crate::hub::SubscriberReport;

/// Pipeline counters shared by the decode path, the hub and the store worker.
#[derive(Debug)]
pub struct Health {
    frames_decoded: AtomicU64,
    decode_errors: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    persist_dropped: AtomicU64,
    persistence_ok: AtomicBool,
    last_persist_error: Mutex<Option<String>>,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            frames_decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            persist_dropped: AtomicU64::new(0),
            persistence_ok: AtomicBool::new(true),
            last_persist_error: Mutex::new(None),
        }
    }
}

impl Health {
    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
        self.persistence_ok.store(true, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self, error: String) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
        self.persistence_ok.store(false, Ordering::Relaxed);
        *self.last_persist_error.lock() = Some(error);
    }

    pub fn record_persist_dropped(&self) {
        self.persist_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn persistence_ok(&self) -> bool {
        self.persistence_ok.load(Ordering::Relaxed)
    }

    pub fn report(
        &self,
        connection: ConnectionState,
        subscribers: Vec<SubscriberReport>,
    ) -> HealthReport {
        let persistence_ok = self.persistence_ok();
        HealthReport {
            status: if persistence_ok { "ok" } else { "degraded" },
            connection,
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors(),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            persist_dropped: self.persist_dropped.load(Ordering::Relaxed),
            persistence_ok,
            last_persist_error: self.last_persist_error.lock().clone(),
            subscribers,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connection: ConnectionState,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub persist_dropped: u64,
    pub persistence_ok: bool,
    pub last_persist_error: Option<String>,
    pub subscribers: Vec<SubscriberReport>,
}
