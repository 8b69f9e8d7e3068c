use std::fmt;

use async_trait::async_trait;
use rusqlite::{named_params, Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    User,
    Group,
}

impl MappingKind {
    fn table(self) -> &'static str {
        match self {
            MappingKind::User => "user_mapping_t",
            MappingKind::Group => "group_mapping_t",
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingKind::User => write!(f, "user"),
            MappingKind::Group => write!(f, "group"),
        }
    }
}

#[derive(Debug)]
pub enum MappingError {
    Sqlite,
    TransactionInvalidState,
}

/// Durable association of directory names to local names. Within each kind a
/// dn and a name can each appear at most once.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Record `dn -> name` only if neither is mapped yet. Returns whether the
    /// mapping was created.
    async fn insert_if_absent(
        &self,
        kind: MappingKind,
        dn: &str,
        name: &str,
    ) -> Result<bool, MappingError>;

    async fn find_by_dn(&self, kind: MappingKind, dn: &str) -> Result<Option<String>, MappingError>;

    async fn find_by_name(
        &self,
        kind: MappingKind,
        name: &str,
    ) -> Result<Option<String>, MappingError>;

    /// Remove every mapping of a kind. Returns the number removed.
    async fn clear(&self, kind: MappingKind) -> Result<usize, MappingError>;
}

pub struct Db {
    conn: Mutex<Connection>,
}

pub struct DbTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    committed: bool,
}

impl Db {
    /// Open the store at `path`. An empty path is an in-memory store.
    pub fn new(path: &str) -> Result<Self, MappingError> {
        let conn = Connection::open(path).map_err(|e| {
            error!(err = ?e, "rusqlite error");
            MappingError::Sqlite
        })?;

        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    pub async fn write(&self) -> Result<DbTxn<'_>, MappingError> {
        let conn = self.conn.lock().await;
        DbTxn::new(conn)
    }

    /// Open and migrate in one step.
    pub async fn open(path: &str) -> Result<Self, MappingError> {
        let db = Db::new(path)?;
        let dbtxn = db.write().await?;
        dbtxn.migrate()?;
        dbtxn.commit()?;
        Ok(db)
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Db {{}}")
    }
}

impl<'a> DbTxn<'a> {
    fn new(conn: MutexGuard<'a, Connection>) -> Result<Self, MappingError> {
        conn.execute("BEGIN TRANSACTION", []).map_err(|e| {
            error!(err = ?e, "unable to begin transaction");
            MappingError::Sqlite
        })?;
        Ok(DbTxn {
            committed: false,
            conn,
        })
    }

    /// This handles an error coming back from an sqlite event and dumps more information from it
    fn sqlite_error(&self, msg: &str, error: &rusqlite::Error) -> MappingError {
        error!(
            "sqlite {} error: {:?} db_path={:?}",
            msg,
            error,
            &self.conn.path()
        );
        MappingError::Sqlite
    }

    pub fn migrate(&self) -> Result<(), MappingError> {
        self.conn.set_prepared_statement_cache_capacity(16);

        for kind in [MappingKind::User, MappingKind::Group] {
            self.conn
                .execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                        dn TEXT PRIMARY KEY,
                        name TEXT NOT NULL UNIQUE
                    )
                    ",
                        kind.table()
                    ),
                    [],
                )
                .map_err(|e| self.sqlite_error("mapping table create", &e))?;
        }

        Ok(())
    }

    pub fn commit(mut self) -> Result<(), MappingError> {
        if self.committed {
            error!("Invalid state, SQL transaction was already committed!");
            return Err(MappingError::TransactionInvalidState);
        }
        self.committed = true;

        self.conn
            .execute("COMMIT TRANSACTION", [])
            .map(|_| ())
            .map_err(|e| self.sqlite_error("commit", &e))
    }

    pub fn insert_if_absent(
        &self,
        kind: MappingKind,
        dn: &str,
        name: &str,
    ) -> Result<bool, MappingError> {
        // The primary key and unique constraint make this a single conditional
        // insert on both columns.
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "INSERT OR IGNORE INTO {} (dn, name) VALUES (:dn, :name)",
                kind.table()
            ))
            .map_err(|e| self.sqlite_error("insert prepare", &e))?;

        stmt.execute(named_params! {
            ":dn": dn,
            ":name": name,
        })
        .map(|changed| changed == 1)
        .map_err(|e| self.sqlite_error("insert execute", &e))
    }

    pub fn find_by_dn(&self, kind: MappingKind, dn: &str) -> Result<Option<String>, MappingError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT name FROM {} WHERE dn = :dn", kind.table()))
            .map_err(|e| self.sqlite_error("select prepare", &e))?;

        stmt.query_row(named_params! { ":dn": dn }, |row| row.get(0))
            .optional()
            .map_err(|e| self.sqlite_error("select query", &e))
    }

    pub fn find_by_name(
        &self,
        kind: MappingKind,
        name: &str,
    ) -> Result<Option<String>, MappingError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT dn FROM {} WHERE name = :name", kind.table()))
            .map_err(|e| self.sqlite_error("select prepare", &e))?;

        stmt.query_row(named_params! { ":name": name }, |row| row.get(0))
            .optional()
            .map_err(|e| self.sqlite_error("select query", &e))
    }

    pub fn clear(&self, kind: MappingKind) -> Result<usize, MappingError> {
        self.conn
            .execute(&format!("DELETE FROM {}", kind.table()), [])
            .map_err(|e| self.sqlite_error("delete", &e))
    }
}

impl<'a> Drop for DbTxn<'a> {
    // Abort
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.conn.execute("ROLLBACK TRANSACTION", []) {
                error!(err = ?e, "unable to rollback transaction");
            }
        }
    }
}

#[async_trait]
impl MappingStore for Db {
    async fn insert_if_absent(
        &self,
        kind: MappingKind,
        dn: &str,
        name: &str,
    ) -> Result<bool, MappingError> {
        let dbtxn = self.write().await?;
        let inserted = dbtxn.insert_if_absent(kind, dn, name)?;
        dbtxn.commit()?;
        Ok(inserted)
    }

    async fn find_by_dn(&self, kind: MappingKind, dn: &str) -> Result<Option<String>, MappingError> {
        let dbtxn = self.write().await?;
        let name = dbtxn.find_by_dn(kind, dn)?;
        dbtxn.commit()?;
        Ok(name)
    }

    async fn find_by_name(
        &self,
        kind: MappingKind,
        name: &str,
    ) -> Result<Option<String>, MappingError> {
        let dbtxn = self.write().await?;
        let dn = dbtxn.find_by_name(kind, name)?;
        dbtxn.commit()?;
        Ok(dn)
    }

    async fn clear(&self, kind: MappingKind) -> Result<usize, MappingError> {
        let dbtxn = self.write().await?;
        let removed = dbtxn.clear(kind)?;
        dbtxn.commit()?;
        info!(%kind, removed, "cleared mappings");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::{Db, MappingKind, MappingStore};

    #[tokio::test]
    async fn test_mapping_db_basic() {
        sketching::test_init();
        let db = Db::new("").expect("failed to create.");
        let dbtxn = db.write().await.expect("failed to begin");
        assert!(dbtxn.migrate().is_ok());
        assert!(dbtxn.commit().is_ok());

        let dn = "uid=alice,ou=people,dc=example,dc=com";
        assert_eq!(db.find_by_dn(MappingKind::User, dn).await.unwrap(), None);
        assert!(db
            .insert_if_absent(MappingKind::User, dn, "alice")
            .await
            .unwrap());
        assert_eq!(
            db.find_by_dn(MappingKind::User, dn).await.unwrap().as_deref(),
            Some("alice")
        );
        assert_eq!(
            db.find_by_name(MappingKind::User, "alice")
                .await
                .unwrap()
                .as_deref(),
            Some(dn)
        );

        // Neither the dn nor the name can be reused.
        assert!(!db
            .insert_if_absent(MappingKind::User, dn, "alice2")
            .await
            .unwrap());
        assert!(!db
            .insert_if_absent(MappingKind::User, "uid=other,dc=com", "alice")
            .await
            .unwrap());
        assert_eq!(
            db.find_by_dn(MappingKind::User, dn).await.unwrap().as_deref(),
            Some("alice")
        );

        // Kinds are separate namespaces.
        assert!(db
            .insert_if_absent(MappingKind::Group, "cn=alice,ou=groups,dc=com", "alice")
            .await
            .unwrap());

        assert_eq!(db.clear(MappingKind::User).await.unwrap(), 1);
        assert_eq!(db.find_by_name(MappingKind::User, "alice").await.unwrap(), None);
        assert!(db
            .find_by_name(MappingKind::Group, "alice")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_mapping_db_rollback() {
        sketching::test_init();
        let db = Db::open("").await.expect("failed to open");
        {
            let dbtxn = db.write().await.expect("failed to begin");
            assert!(dbtxn
                .insert_if_absent(MappingKind::Group, "cn=a,dc=com", "a")
                .unwrap());
            // Dropped without commit.
        }
        assert_eq!(db.find_by_dn(MappingKind::Group, "cn=a,dc=com").await.unwrap(), None);
    }
}
