// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! In-memory collaborator implementations.
//!
//! These back the test suite and the demo server. The database accepts
//! canned statement results plus registered tables; the store and auth
//! provider are plain maps.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{
    AuthProvider, BackendError, DatabaseHandle, EmailMessage, Mailer, PublishedApi,
    PublishedApiStore, UserIdentity, WriteMode,
};
use crate::table::Table;

/// Published-API registry backed by a map keyed on endpoint path.
#[derive(Default)]
pub struct MemoryApiStore {
    apis: Mutex<HashMap<String, PublishedApi>>,
}

impl MemoryApiStore {
    pub fn new() -> MemoryApiStore {
        MemoryApiStore::default()
    }

    pub fn publish(&self, api: PublishedApi) {
        self.apis
            .lock()
            .unwrap()
            .insert(api.endpoint_path.clone(), api);
    }
}

#[async_trait]
impl PublishedApiStore for MemoryApiStore {
    async fn find_by_path(&self, path: &str) -> Option<PublishedApi> {
        self.apis.lock().unwrap().get(path).cloned()
    }
}

/// Token-table auth provider.
#[derive(Default)]
pub struct StaticAuthProvider {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticAuthProvider {
    pub fn new() -> StaticAuthProvider {
        StaticAuthProvider::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: UserIdentity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn identify(&self, bearer_token: Option<&str>) -> Option<UserIdentity> {
        self.tokens.get(bearer_token?).cloned()
    }
}

/// In-memory database with registered tables and canned query results.
///
/// `query` first looks for a canned result registered for the exact
/// statement text, then falls back to interpreting the `SELECT * FROM t
/// [LIMIT n]` shape that `table_reader` generates. Anything else is
/// rejected, which keeps test expectations honest.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<HashMap<String, Table>>,
    canned: Mutex<HashMap<String, Table>>,
    denied_reads: Mutex<HashSet<String>>,
    denied_writes: Mutex<HashSet<String>>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }

    fn qualified(schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_string(),
        }
    }

    pub fn register_table(&self, schema: Option<&str>, name: &str, table: Table) {
        self.tables
            .lock()
            .unwrap()
            .insert(Self::qualified(schema, name), table);
    }

    pub fn register_query(&self, sql: impl Into<String>, result: Table) {
        self.canned.lock().unwrap().insert(sql.into(), result);
    }

    pub fn deny_read(&self, schema: Option<&str>, name: &str) {
        self.denied_reads
            .lock()
            .unwrap()
            .insert(Self::qualified(schema, name));
    }

    pub fn deny_write(&self, schema: Option<&str>, name: &str) {
        self.denied_writes
            .lock()
            .unwrap()
            .insert(Self::qualified(schema, name));
    }

    pub fn stored_table(&self, schema: Option<&str>, name: &str) -> Option<Table> {
        self.tables
            .lock()
            .unwrap()
            .get(&Self::qualified(schema, name))
            .cloned()
    }
}

#[async_trait]
impl DatabaseHandle for MemoryDatabase {
    async fn can_read(
        &self,
        _user: Option<&UserIdentity>,
        schema: Option<&str>,
        table: &str,
    ) -> bool {
        !self
            .denied_reads
            .lock()
            .unwrap()
            .contains(&Self::qualified(schema, table))
    }

    async fn can_write(
        &self,
        _user: Option<&UserIdentity>,
        schema: Option<&str>,
        table: &str,
    ) -> bool {
        !self
            .denied_writes
            .lock()
            .unwrap()
            .contains(&Self::qualified(schema, table))
    }

    async fn query(&self, sql: &str, _params: &Map<String, Value>) -> Result<Table, BackendError> {
        if let Some(result) = self.canned.lock().unwrap().get(sql) {
            return Ok(result.clone());
        }

        let tokens: Vec<&str> = sql.split_whitespace().collect();
        let is_select_star = tokens.len() >= 4
            && tokens[0].eq_ignore_ascii_case("select")
            && tokens[1] == "*"
            && tokens[2].eq_ignore_ascii_case("from");
        if is_select_star {
            let name = tokens[3];
            let table = self
                .tables
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| BackendError::Query(format!("unknown table '{name}'")))?;
            // Honor a trailing LIMIT; anything fancier needs a canned result.
            if tokens.len() == 6 && tokens[4].eq_ignore_ascii_case("limit") {
                let limit: usize = tokens[5]
                    .parse()
                    .map_err(|_| BackendError::Query(format!("bad limit '{}'", tokens[5])))?;
                let rows: Vec<usize> = (0..table.row_count().min(limit)).collect();
                return Ok(table.take_rows(&rows));
            }
            if tokens.len() == 4 {
                return Ok(table);
            }
        }

        Err(BackendError::Query(format!(
            "memory database has no result registered for statement: {sql}"
        )))
    }

    async fn write_table(
        &self,
        schema: Option<&str>,
        table: &str,
        mode: WriteMode,
        data: &Table,
    ) -> Result<u64, BackendError> {
        let key = Self::qualified(schema, table);
        let mut tables = self.tables.lock().unwrap();
        match mode {
            WriteMode::Fail if tables.contains_key(&key) => {
                return Err(BackendError::Write(format!("table '{key}' already exists")))
            }
            WriteMode::Append => {
                if let Some(existing) = tables.get(&key) {
                    let mut rows = existing.to_json_records();
                    rows.extend(data.to_json_records());
                    tables.insert(key, Table::from_json_records(&rows));
                    return Ok(data.row_count() as u64);
                }
            }
            _ => {}
        }
        tables.insert(key, data.clone());
        Ok(data.row_count() as u64)
    }
}

/// Mailer that records every message it was asked to deliver.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl MemoryMailer {
    pub fn new() -> MemoryMailer {
        MemoryMailer::default()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), BackendError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CellValue;

    fn orders() -> Table {
        Table::from_rows(
            &["id".to_string()],
            vec![vec![CellValue::Integer(1)], vec![CellValue::Integer(2)]],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn select_star_and_limit_are_interpreted() {
        let db = MemoryDatabase::new();
        db.register_table(None, "orders", orders());

        let all = db.query("SELECT * FROM orders", &Map::new()).await.unwrap();
        assert_eq!(all.row_count(), 2);

        let one = db
            .query("SELECT * FROM orders LIMIT 1", &Map::new())
            .await
            .unwrap();
        assert_eq!(one.row_count(), 1);

        assert!(db.query("SELECT id FROM orders", &Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn canned_queries_take_precedence() {
        let db = MemoryDatabase::new();
        db.register_query("SELECT count(*) FROM t", orders());
        let result = db.query("SELECT count(*) FROM t", &Map::new()).await.unwrap();
        assert_eq!(result.row_count(), 2);
    }

    #[tokio::test]
    async fn write_modes_behave() {
        let db = MemoryDatabase::new();
        db.write_table(None, "t", WriteMode::Replace, &orders())
            .await
            .unwrap();
        db.write_table(None, "t", WriteMode::Append, &orders())
            .await
            .unwrap();
        assert_eq!(db.stored_table(None, "t").unwrap().row_count(), 4);
        assert!(db
            .write_table(None, "t", WriteMode::Fail, &orders())
            .await
            .is_err());
    }
}
