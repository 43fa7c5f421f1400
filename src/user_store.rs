//! User store backed by an embedded `rusqlite` connection behind a
//! `Mutex` (connections aren't `Sync`): a simple single-process embedded
//! database over an async driver.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::models::{RegistrationData, RegistrationStep, Role, User};

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total_users: u64,
    pub by_role: HashMap<String, u64>,
    pub active_24h: u64,
    pub active_week: u64,
    pub active_month: u64,
    pub total_messages: u64,
}

pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(UserStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(UserStore { conn: Mutex::new(conn) })
    }

    /// Schema is created idempotently on startup.
    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                address TEXT PRIMARY KEY,
                phone TEXT,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                language TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                registration_step TEXT NOT NULL,
                registration_attempts INTEGER NOT NULL,
                registration_started_at TEXT,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_phone ON users(phone);
            CREATE TABLE IF NOT EXISTS user_interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                FOREIGN KEY(address) REFERENCES users(address) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_address ON user_interactions(address);
            CREATE INDEX IF NOT EXISTS idx_interactions_time ON user_interactions(occurred_at);
            CREATE TABLE IF NOT EXISTS conversation_states (
                address TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                FOREIGN KEY(address) REFERENCES users(address) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS external_integrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                provider TEXT NOT NULL,
                data TEXT NOT NULL,
                FOREIGN KEY(address) REFERENCES users(address) ON DELETE CASCADE
            );",
        )?;
        Ok(())
    }

    pub fn get_by_address(&self, address: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        row_to_user(conn.query_row("SELECT * FROM users WHERE address = ?1", params![address], row_mapper))
    }

    pub fn get_by_phone(&self, phone: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        row_to_user(conn.query_row("SELECT * FROM users WHERE phone = ?1", params![phone], row_mapper))
    }

    pub fn search(&self, term: &str, limit: u32) -> Result<Vec<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let like = format!("%{term}%");
        let mut stmt = conn.prepare(
            "SELECT * FROM users WHERE address LIKE ?1 OR phone LIKE ?1 OR display_name LIKE ?1 ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![like, limit], row_mapper)?;
        rows.collect::<Result<Vec<RawRow>, _>>()?.into_iter().map(|r| r.into_user()).collect()
    }

    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2")?;
        let rows = stmt.query_map(params![limit, offset], row_mapper)?;
        rows.collect::<Result<Vec<RawRow>, _>>()?.into_iter().map(|r| r.into_user()).collect()
    }

    /// Inserts a brand-new user. For re-registration of an existing address,
    /// use [`Self::upsert_preserving_identity`].
    pub fn create(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        insert_or_replace(&conn, user)
    }

    pub fn update(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        insert_or_replace(&conn, user)
    }

    pub fn delete(&self, address: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM users WHERE address = ?1", params![address])?;
        Ok(())
    }

    pub fn record_interaction(&self, address: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_interactions (address, occurred_at) VALUES (?1, ?2)",
            params![address, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Preserves `display_name` on re-registration unless the prior value
    /// equals the phone number, or the role would be downgraded from
    /// admin/employee.
    pub fn upsert_preserving_identity(&self, mut incoming: User) -> Result<User, StoreError> {
        let conn = self.conn.lock().unwrap();
        if let Some(existing) = row_to_user(conn.query_row("SELECT * FROM users WHERE address = ?1", params![incoming.address], row_mapper))? {
            let prior_is_phone_placeholder = existing.phone.as_deref() == Some(existing.display_name.as_str());
            if !prior_is_phone_placeholder {
                incoming.display_name = existing.display_name;
            }
            if matches!(existing.role, Role::Admin | Role::Employee) {
                incoming.role = existing.role.upgraded(incoming.role);
            }
            incoming.created_at = existing.created_at;
            incoming.message_count = existing.message_count;
        }
        insert_or_replace(&conn, &incoming)?;
        Ok(incoming)
    }

    pub fn stats(&self) -> Result<Stats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total_users: u64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        let total_messages: u64 = conn.query_row("SELECT COALESCE(SUM(message_count), 0) FROM users", [], |r| r.get(0))?;

        let mut by_role = HashMap::new();
        let mut stmt = conn.prepare("SELECT role, COUNT(*) FROM users GROUP BY role")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?;
        for row in rows {
            let (role, count) = row?;
            by_role.insert(role, count);
        }

        let active_since = |hours: i64| -> Result<u64, StoreError> {
            let cutoff = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
            Ok(conn.query_row(
                "SELECT COUNT(DISTINCT address) FROM user_interactions WHERE occurred_at > ?1",
                params![cutoff],
                |r| r.get(0),
            )?)
        };

        Ok(Stats {
            total_users,
            by_role,
            active_24h: active_since(24)?,
            active_week: active_since(24 * 7)?,
            active_month: active_since(24 * 30)?,
            total_messages,
        })
    }
}

struct RawRow {
    address: String,
    phone: Option<String>,
    display_name: String,
    role: String,
    language: String,
    active: bool,
    created_at: String,
    updated_at: String,
    last_activity_at: String,
    message_count: u64,
    registration_step: String,
    registration_attempts: u32,
    registration_started_at: Option<String>,
    metadata: String,
}

impl RawRow {
    fn into_user(self) -> Result<User, StoreError> {
        let role = Role::parse(&self.role).ok_or_else(|| StoreError::Unavailable(format!("corrupt role {}", self.role)))?;
        let step = match self.registration_step.as_str() {
            "none" => RegistrationStep::None,
            "awaiting_name" => RegistrationStep::AwaitingName,
            "completed" => RegistrationStep::Completed,
            other => return Err(StoreError::Unavailable(format!("corrupt registration step {other}"))),
        };
        Ok(User {
            address: self.address,
            phone: self.phone,
            display_name: self.display_name,
            role,
            language: self.language,
            active: self.active,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_activity_at: parse_ts(&self.last_activity_at)?,
            message_count: self.message_count,
            registration: RegistrationData {
                step,
                attempts: self.registration_attempts,
                started_at: self.registration_started_at.map(|s| parse_ts(&s)).transpose()?,
            },
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt timestamp: {e}")))
}

fn row_mapper(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        address: row.get("address")?,
        phone: row.get("phone")?,
        display_name: row.get("display_name")?,
        role: row.get("role")?,
        language: row.get("language")?,
        active: row.get::<_, i64>("active")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_activity_at: row.get("last_activity_at")?,
        message_count: row.get::<_, i64>("message_count")? as u64,
        registration_step: row.get("registration_step")?,
        registration_attempts: row.get::<_, i64>("registration_attempts")? as u32,
        registration_started_at: row.get("registration_started_at")?,
        metadata: row.get("metadata")?,
    })
}

fn row_to_user(result: Result<RawRow, rusqlite::Error>) -> Result<Option<User>, StoreError> {
    match result.optional()? {
        Some(raw) => Ok(Some(raw.into_user()?)),
        None => Ok(None),
    }
}

fn insert_or_replace(conn: &Connection, user: &User) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO users (address, phone, display_name, role, language, active, created_at, updated_at,
            last_activity_at, message_count, registration_step, registration_attempts, registration_started_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(address) DO UPDATE SET
            phone=excluded.phone, display_name=excluded.display_name, role=excluded.role,
            language=excluded.language, active=excluded.active, updated_at=excluded.updated_at,
            last_activity_at=excluded.last_activity_at, message_count=excluded.message_count,
            registration_step=excluded.registration_step, registration_attempts=excluded.registration_attempts,
            registration_started_at=excluded.registration_started_at, metadata=excluded.metadata",
        params![
            user.address,
            user.phone,
            user.display_name,
            user.role.as_str(),
            user.language,
            user.active as i64,
            user.created_at.to_rfc3339(),
            user.updated_at.to_rfc3339(),
            user.last_activity_at.to_rfc3339(),
            user.message_count as i64,
            match user.registration.step {
                RegistrationStep::None => "none",
                RegistrationStep::AwaitingName => "awaiting_name",
                RegistrationStep::Completed => "completed",
            },
            user.registration.attempts as i64,
            user.registration.started_at.map(|t| t.to_rfc3339()),
            serde_json::to_string(&user.metadata).unwrap_or_else(|_| "{}".to_string()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_roundtrip() {
        let store = UserStore::open_in_memory().unwrap();
        let user = User::new_customer("A@s.whatsapp.net", Some("5215551234".into()), "es");
        store.create(&user).unwrap();
        let fetched = store.get_by_address("A@s.whatsapp.net").unwrap().unwrap();
        assert_eq!(fetched.address, user.address);
        assert_eq!(fetched.role, Role::Customer);
    }

    #[test]
    fn preserves_display_name_unless_it_was_the_phone_placeholder() {
        let store = UserStore::open_in_memory().unwrap();
        let mut user = User::new_customer("A@s.whatsapp.net", Some("5215551234".into()), "es");
        user.display_name = "Juan Pérez".to_string();
        store.create(&user).unwrap();

        let reingested = User::new_customer("A@s.whatsapp.net", Some("5215551234".into()), "es");
        let result = store.upsert_preserving_identity(reingested).unwrap();
        assert_eq!(result.display_name, "Juan Pérez");
    }

    #[test]
    fn does_not_downgrade_admin_role_on_reingest() {
        let store = UserStore::open_in_memory().unwrap();
        let mut user = User::new_customer("A@s.whatsapp.net", Some("5215551234".into()), "es");
        user.role = Role::Admin;
        store.create(&user).unwrap();

        let reingested = User::new_customer("A@s.whatsapp.net", Some("5215551234".into()), "es");
        let result = store.upsert_preserving_identity(reingested).unwrap();
        assert_eq!(result.role, Role::Admin);
    }

    #[test]
    fn delete_cascades() {
        let store = UserStore::open_in_memory().unwrap();
        let user = User::new_customer("A@s.whatsapp.net", None, "es");
        store.create(&user).unwrap();
        store.record_interaction("A@s.whatsapp.net", Utc::now()).unwrap();
        store.delete("A@s.whatsapp.net").unwrap();
        assert!(store.get_by_address("A@s.whatsapp.net").unwrap().is_none());

        let remaining: u64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM user_interactions WHERE address = ?1", params!["A@s.whatsapp.net"], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn search_matches_display_name() {
        let store = UserStore::open_in_memory().unwrap();
        let mut user = User::new_customer("A@s.whatsapp.net", None, "es");
        user.display_name = "Juan Pérez".to_string();
        store.create(&user).unwrap();
        let found = store.search("Juan", 10).unwrap();
        assert_eq!(found.len(), 1);
    }
}
