//! Append-only ledger of attestations.
//!
//! There is no update or delete operation here, and the `ledger_entries`
//! table carries triggers that abort any UPDATE or DELETE reaching it by
//! another path. Corrections are new entries.

pub mod db;

use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attestation::Attestation;
use crate::error::{ProvenanceError, Result};
use crate::manifest::Manifest;

pub use db::Database;

const ENTRY_COLUMNS: &str = "id, timestamp, sprint_id, manifest_hash, manifest_data, signature, \
                             public_key_fingerprint, version, created_at";

/// A stored attestation plus its identifier and the manifest it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    #[serde(flatten)]
    pub attestation: Attestation,
    /// Canonical JSON of the attested manifest.
    pub manifest_data: String,
    pub created_at: String,
}

impl LedgerEntry {
    pub fn manifest(&self) -> Result<Manifest> {
        Manifest::from_json_str(&self.manifest_data)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            attestation: Attestation {
                timestamp: row.get(1)?,
                sprint_id: row.get(2)?,
                manifest_hash: row.get(3)?,
                signature: row.get(5)?,
                public_key_fingerprint: row.get(6)?,
                version: row.get(7)?,
            },
            manifest_data: row.get(4)?,
            created_at: row.get(8)?,
        })
    }
}

/// Selection for [`LedgerStore::list`]. All bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFilter {
    pub sprint_id: Option<String>,
    pub manifest_hash: Option<String>,
    pub since: Option<f64>,
    pub until: Option<f64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl LedgerFilter {
    pub fn sprint(mut self, sprint_id: impl Into<String>) -> Self {
        self.sprint_id = Some(sprint_id.into());
        self
    }

    pub fn hash(mut self, manifest_hash: impl Into<String>) -> Self {
        self.manifest_hash = Some(manifest_hash.into());
        self
    }

    pub fn since(mut self, timestamp: f64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: f64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(ref sprint) = self.sprint_id {
            clauses.push("sprint_id = ?");
            params.push(Value::Text(sprint.clone()));
        }
        if let Some(ref hash) = self.manifest_hash {
            clauses.push("manifest_hash = ?");
            params.push(Value::Text(hash.clone()));
        }
        if let Some(since) = self.since {
            clauses.push("timestamp >= ?");
            params.push(Value::Real(since));
        }
        if let Some(until) = self.until {
            clauses.push("timestamp <= ?");
            params.push(Value::Real(until));
        }

        let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");
        params.push(Value::Integer(self.limit.map_or(-1, i64::from)));
        params.push(Value::Integer(i64::from(self.offset.unwrap_or(0))));
        (sql, params)
    }
}

pub struct LedgerStore {
    db: Arc<Database>,
}

impl LedgerStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persists a new entry and returns it with its assigned identifier.
    ///
    /// Identifier assignment and insertion happen in one write transaction,
    /// so concurrent appends never share or skip an identifier.
    pub fn append(&self, attestation: &Attestation, manifest: &Manifest) -> Result<LedgerEntry> {
        let manifest_data = manifest.to_canonical_string()?;
        let entry = self.db.write(|tx| {
            tx.execute(
                "INSERT INTO ledger_entries
                    (timestamp, sprint_id, manifest_hash, manifest_data, signature,
                     public_key_fingerprint, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attestation.timestamp,
                    attestation.sprint_id,
                    attestation.manifest_hash,
                    manifest_data,
                    attestation.signature,
                    attestation.public_key_fingerprint,
                    attestation.version,
                ],
            )?;
            let id = tx.last_insert_rowid();
            let entry = tx.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
                [id],
                LedgerEntry::from_row,
            )?;
            Ok(entry)
        })?;

        info!(
            "Ledger entry {} appended for sprint {} (hash {})",
            entry.id, entry.attestation.sprint_id, entry.attestation.manifest_hash
        );
        Ok(entry)
    }

    /// Entries matching `filter`, in insertion order.
    pub fn list(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let (sql, params) = filter.to_sql();
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), LedgerEntry::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn get_by_id(&self, id: i64) -> Result<LedgerEntry> {
        self.db
            .read(|conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
                        [id],
                        LedgerEntry::from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| ProvenanceError::NotFound(format!("ledger entry {id}")))
    }

    pub fn count(&self) -> Result<u64> {
        self.db.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}
