//! Persistence for conversations, messages, users, purchase requests and
//! knowledge-base documents.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("User not found: {0}")]
    UserNotFound(i64),
    #[error("Request not found: {0}")]
    RequestNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation with a fresh id and default title
    pub fn create_conversation(&self) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let title = "New conversation";

        conn.execute(
            "INSERT INTO conversations (id, title, is_authenticated, user_id, created_at, updated_at)
             VALUES (?1, ?2, 0, NULL, ?3, ?3)",
            params![id, title, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id,
            title: title.to_string(),
            is_authenticated: false,
            user_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, is_authenticated, user_id, created_at, updated_at
             FROM conversations WHERE id = ?1",
        )?;

        stmt.query_row(params![id], row_to_conversation)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::ConversationNotFound(id.to_string())
                }
                e => DbError::Sqlite(e),
            })
    }

    /// Bind a conversation to an authenticated user and retitle it
    pub fn bind_conversation_user(
        &self,
        conversation_id: &str,
        user_id: i64,
        title: &str,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE conversations
             SET is_authenticated = 1, user_id = ?2, title = ?3, updated_at = ?4
             WHERE id = ?1",
            params![conversation_id, user_id, title, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a message, assigning the next per-conversation sequence id
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: Option<&Value>,
    ) -> DbResult<Message> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let tool_calls_json = tool_calls.map(Value::to_string);

        conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence_id, role, content, tool_calls, created_at)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?2),
                     ?3, ?4, ?5, ?6)",
            params![id, conversation_id, role.as_str(), content, tool_calls_json, now.to_rfc3339()],
        )?;

        let sequence_id: i64 = conn.query_row(
            "SELECT sequence_id FROM messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;

        conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id, now.to_rfc3339()],
        )?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sequence_id,
            role,
            content: content.to_string(),
            tool_calls: tool_calls.cloned(),
            created_at: now,
        })
    }

    /// All messages for a conversation, in sequence order
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, role, content, tool_calls, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== User Operations ====================

    /// Insert a user, returning the existing row when the email is taken
    pub fn ensure_user(&self, name: &str, email: &str, department: &str) -> DbResult<User> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO users (name, email, department, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email) DO NOTHING",
            params![name, email, department, now.to_rfc3339()],
        )?;

        let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE email = ?1"))?;
        Ok(stmt.query_row(params![email], row_to_user)?)
    }

    pub fn get_user(&self, id: i64) -> DbResult<User> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE id = ?1"))?;
        stmt.query_row(params![id], row_to_user)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::UserNotFound(id),
                e => DbError::Sqlite(e),
            })
    }

    /// Case-insensitive substring match on the user name
    pub fn find_user_by_name(&self, fragment: &str) -> DbResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{USER_SELECT} WHERE LOWER(name) LIKE '%' || LOWER(?1) || '%' ORDER BY id ASC LIMIT 1"
        ))?;
        Ok(stmt
            .query_row(params![fragment], row_to_user)
            .optional()?)
    }

    /// Store a fresh verification code with its expiry
    pub fn set_verification_code(
        &self,
        user_id: i64,
        code: u32,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE users SET otp = ?2, otp_expires_at = ?3 WHERE id = ?1",
            params![user_id, code, expires_at.to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(DbError::UserNotFound(user_id));
        }
        Ok(())
    }

    pub fn clear_verification_code(&self, user_id: i64) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET otp = NULL, otp_expires_at = NULL WHERE id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Find the user holding this code, if the code has not expired
    pub fn find_user_by_code(&self, code: u32, now: DateTime<Utc>) -> DbResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{USER_SELECT} WHERE otp = ?1 AND otp_expires_at > ?2 LIMIT 1"
        ))?;
        Ok(stmt
            .query_row(params![code, now.to_rfc3339()], row_to_user)
            .optional()?)
    }

    pub fn count_users(&self) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }

    // ==================== Purchase Request Operations ====================

    pub fn create_request(
        &self,
        item: &str,
        quantity: i64,
        estimated_price: f64,
        justification: Option<&str>,
        requested_by: i64,
    ) -> DbResult<ShoppingRequest> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO shopping_requests
                 (id, item, quantity, estimated_price, justification, status, requested_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?7)",
            params![id, item, quantity, estimated_price, justification, requested_by, now.to_rfc3339()],
        )?;

        Ok(ShoppingRequest {
            id,
            item: item.to_string(),
            quantity,
            estimated_price,
            justification: justification.map(String::from),
            status: RequestStatus::Pending,
            requested_by,
            product_name: None,
            product_url: None,
            product_price_cop: None,
            product_price_usd: None,
            search_results: None,
            created_at: now,
        })
    }

    /// Record the best catalog match found for a request
    pub fn set_request_product(
        &self,
        request_id: &str,
        product_name: &str,
        product_url: &str,
        price_cop: f64,
        price_usd: f64,
        search_results: &Value,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE shopping_requests
             SET product_name = ?2, product_url = ?3, product_price_cop = ?4,
                 product_price_usd = ?5, search_results = ?6
             WHERE id = ?1",
            params![
                request_id,
                product_name,
                product_url,
                price_cop,
                price_usd,
                search_results.to_string()
            ],
        )?;
        if updated == 0 {
            return Err(DbError::RequestNotFound(request_id.to_string()));
        }
        Ok(())
    }

    /// Most recent requests for a user, optionally filtered by status
    pub fn list_requests(
        &self,
        user_id: i64,
        status: Option<RequestStatus>,
        limit: usize,
    ) -> DbResult<Vec<ShoppingRequest>> {
        let conn = self.conn.lock().unwrap();
        let base = "SELECT id, item, quantity, estimated_price, justification, status,
                           requested_by, product_name, product_url, product_price_cop,
                           product_price_usd, search_results, created_at
                    FROM shopping_requests WHERE requested_by = ?1";

        let rows = if let Some(status) = status {
            let mut stmt = conn.prepare(&format!(
                "{base} AND status = ?2 ORDER BY created_at DESC LIMIT ?3"
            ))?;
            let mapped =
                stmt.query_map(params![user_id, status.as_str(), limit], row_to_request)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt =
                conn.prepare(&format!("{base} ORDER BY created_at DESC LIMIT ?2"))?;
            let mapped = stmt.query_map(params![user_id, limit], row_to_request)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    // ==================== Document Operations ====================

    pub fn count_documents(&self) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?)
    }

    pub fn insert_document(&self, title: &str, path: &str, content: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents (id, title, path, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET title = excluded.title, content = excluded.content",
            params![
                Uuid::new_v4().to_string(),
                title,
                path,
                content,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn all_documents(&self) -> DbResult<Vec<Document>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, path, content, created_at FROM documents ORDER BY title ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Document {
                id: row.get(0)?,
                title: row.get(1)?,
                path: row.get(2)?,
                content: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

const USER_SELECT: &str =
    "SELECT id, name, email, department, otp, otp_expires_at, created_at FROM users";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        department: row.get(3)?,
        otp: row.get(4)?,
        otp_expires_at: row
            .get::<_, Option<String>>(5)?
            .map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        is_authenticated: row.get(2)?,
        user_id: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(3)?;
    let tool_calls: Option<String> = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        role: MessageRole::parse(&role_str).unwrap_or(MessageRole::User),
        content: row.get(4)?,
        tool_calls: tool_calls.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShoppingRequest> {
    let status_str: String = row.get(5)?;
    let search_results: Option<String> = row.get(11)?;
    Ok(ShoppingRequest {
        id: row.get(0)?,
        item: row.get(1)?,
        quantity: row.get(2)?,
        estimated_price: row.get(3)?,
        justification: row.get(4)?,
        status: RequestStatus::parse(&status_str).unwrap_or(RequestStatus::Pending),
        requested_by: row.get(6)?,
        product_name: row.get(7)?,
        product_url: row.get(8)?,
        product_price_cop: row.get(9)?,
        product_price_usd: row.get(10)?,
        search_results: search_results.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
