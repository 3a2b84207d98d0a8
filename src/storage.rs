use crate::models::{ChatWindow, Message, ModelConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::path::Path;
use uuid::Uuid;

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Chat Windows Table
CREATE TABLE IF NOT EXISTS windows (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (millis)
    last_updated_at INTEGER NOT NULL, -- Unix Timestamp (millis)
    model_config_id TEXT NOT NULL
);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    window_id TEXT NOT NULL,
    role TEXT NOT NULL, -- 'user' or 'assistant'
    content TEXT NOT NULL,
    status TEXT NOT NULL,
    attachments TEXT NOT NULL, -- JSON document
    file_references TEXT NOT NULL, -- JSON document
    error TEXT, -- Optional JSON document
    created_at INTEGER NOT NULL, -- Unix Timestamp (millis)
    FOREIGN KEY (window_id) REFERENCES windows(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_window_id ON messages(window_id);

-- Model Configurations Table
CREATE TABLE IF NOT EXISTS model_configs (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    name TEXT NOT NULL UNIQUE,
    provider TEXT NOT NULL, -- e.g., 'gemini'
    api_url TEXT NOT NULL,
    api_key_ref TEXT, -- e.g., 'keyring', 'env:MY_API_KEY', or null
    provider_options TEXT -- JSON blob for provider-specific settings
);

-- Application Settings Table (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Local persistence collaborator. Attachments, file references and errors
/// are stored as opaque JSON documents.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save_window(&self, window: &ChatWindow) -> Result<()>;
    async fn list_windows(&self) -> Result<Vec<ChatWindow>>;
    async fn delete_window(&self, window_id: Uuid) -> Result<()>;
    /// Inserts or replaces a message by id.
    async fn save_message(&self, message: &Message) -> Result<()>;
    async fn load_messages(&self, window_id: Uuid) -> Result<Vec<Message>>;
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(anyhow::anyhow!("Expected a string variant, got {}", other)),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .with_context(|| format!("Unknown stored value '{}'", text))
}

fn timestamp(millis: i64, field: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).with_context(|| format!("Invalid {} timestamp", field))
}

fn window_from_row(row: &SqliteRow) -> Result<ChatWindow> {
    Ok(ChatWindow {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse window ID")?,
        title: row.try_get("title")?,
        created_at: timestamp(row.try_get("created_at")?, "created_at")?,
        last_updated_at: timestamp(row.try_get("last_updated_at")?, "last_updated_at")?,
        model_config_id: Uuid::parse_str(row.try_get("model_config_id")?)
            .context("Failed to parse model_config_id")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let error: Option<String> = row.try_get("error")?;
    Ok(Message {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse message ID")?,
        window_id: Uuid::parse_str(row.try_get("window_id")?)
            .context("Failed to parse window ID for message")?,
        role: enum_from_text(row.try_get("role")?)?,
        content: row.try_get("content")?,
        status: enum_from_text(row.try_get("status")?)?,
        attachments: serde_json::from_str(row.try_get("attachments")?)
            .context("Failed to parse stored attachments")?,
        file_references: serde_json::from_str(row.try_get("file_references")?)
            .context("Failed to parse stored file references")?,
        error: error
            .map(|e| serde_json::from_str(&e))
            .transpose()
            .context("Failed to parse stored error")?,
        created_at: timestamp(row.try_get("created_at")?, "message")?,
    })
}

fn model_config_from_row(row: &SqliteRow) -> Result<ModelConfig> {
    Ok(ModelConfig {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse model config ID")?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        api_url: row.try_get("api_url")?,
        api_key_ref: row.try_get("api_key_ref")?,
        provider_options: row.try_get("provider_options")?,
    })
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database at `db_path` and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection keeps one shared schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    /// Creates a new chat window bound to the first available model config.
    pub async fn create_window(&self, title: &str) -> Result<ChatWindow> {
        let model = self
            .first_model_config()
            .await?
            .context("No model configurations found. Please configure at least one model.")?;
        let window = ChatWindow {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: Utc::now(),
            last_updated_at: Utc::now(),
            model_config_id: model.id,
        };
        self.save_window(&window).await?;
        log::info!("Created chat window {}", window.id);
        Ok(window)
    }

    pub async fn list_model_configs(&self) -> Result<Vec<ModelConfig>> {
        let rows = sqlx::query(
            "SELECT id, name, provider, api_url, api_key_ref, provider_options FROM model_configs ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch model configs")?;
        rows.iter().map(model_config_from_row).collect()
    }

    pub async fn get_model_config(&self, id: Uuid) -> Result<Option<ModelConfig>> {
        let row = sqlx::query(
            "SELECT id, name, provider, api_url, api_key_ref, provider_options FROM model_configs WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch model config")?;
        row.as_ref().map(model_config_from_row).transpose()
    }

    pub async fn first_model_config(&self) -> Result<Option<ModelConfig>> {
        let row = sqlx::query(
            "SELECT id, name, provider, api_url, api_key_ref, provider_options FROM model_configs LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query for first model config")?;
        row.as_ref().map(model_config_from_row).transpose()
    }

    pub async fn add_model_config(&self, config: &ModelConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_configs (id, name, provider, api_url, api_key_ref, provider_options)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(config.id.to_string())
        .bind(&config.name)
        .bind(&config.provider)
        .bind(&config.api_url)
        .bind(&config.api_key_ref)
        .bind(&config.provider_options)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert model config '{}'", config.name))?;
        Ok(())
    }

    /// Points a model config at a different API key source (`env:VAR` or `keyring`).
    pub async fn set_api_key_ref(&self, model_config_id: Uuid, api_key_ref: &str) -> Result<()> {
        let result = sqlx::query("UPDATE model_configs SET api_key_ref = ? WHERE id = ?")
            .bind(api_key_ref)
            .bind(model_config_id.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update API key ref for model config {}", model_config_id))?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Model config {} not found", model_config_id);
        }
        Ok(())
    }

    /// Adds a default Gemini model config if no configs exist.
    pub async fn add_default_model_config_if_none(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM model_configs")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count model configs")?;

        if count == 0 {
            log::info!("No model configs found, adding a default Gemini config.");
            let config = ModelConfig {
                id: Uuid::new_v4(),
                name: "Default Gemini".to_string(),
                provider: "gemini".to_string(),
                api_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                api_key_ref: Some("env:GEMINI_API_KEY".to_string()),
                provider_options: Some("{\"model\": \"gemini-2.0-flash\"}".to_string()),
            };
            self.add_model_config(&config).await?;
            log::info!("Default model config added with ID: {}", config.id);
        } else {
            log::debug!("Found {} existing model configs, skipping default.", count);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for StorageManager {
    async fn save_window(&self, window: &ChatWindow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO windows (id, title, created_at, last_updated_at, model_config_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                last_updated_at = excluded.last_updated_at,
                model_config_id = excluded.model_config_id
            "#,
        )
        .bind(window.id.to_string())
        .bind(&window.title)
        .bind(window.created_at.timestamp_millis())
        .bind(window.last_updated_at.timestamp_millis())
        .bind(window.model_config_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save chat window")?;
        Ok(())
    }

    /// Fetches all windows, most recently updated first.
    async fn list_windows(&self) -> Result<Vec<ChatWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, created_at, last_updated_at, model_config_id
            FROM windows
            ORDER BY last_updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat windows from database")?;

        let windows = rows.iter().map(window_from_row).collect::<Result<Vec<_>>>()?;
        log::info!("Fetched {} chat windows", windows.len());
        Ok(windows)
    }

    /// Deletes a window; its messages go with it through `ON DELETE CASCADE`.
    async fn delete_window(&self, window_id: Uuid) -> Result<()> {
        log::warn!("Deleting chat window with ID: {}", window_id);
        let result = sqlx::query("DELETE FROM windows WHERE id = ?")
            .bind(window_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete chat window from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent chat window: {}", window_id);
        }
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        log::debug!("Saving message ID: {} to window: {}", message.id, message.window_id);

        let error = message
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize message error")?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, window_id, role, content, status, attachments, file_references, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                status = excluded.status,
                attachments = excluded.attachments,
                file_references = excluded.file_references,
                error = excluded.error
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.window_id.to_string())
        .bind(enum_to_text(&message.role)?)
        .bind(&message.content)
        .bind(enum_to_text(&message.status)?)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(serde_json::to_string(&message.file_references)?)
        .bind(error)
        .bind(message.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save message into database")?;

        // Also update the window's last_updated_at timestamp
        sqlx::query("UPDATE windows SET last_updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(message.window_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update window timestamp")?;
        Ok(())
    }

    /// Fetches all messages for a window in the order they were written.
    async fn load_messages(&self, window_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, window_id, role, content, status, attachments, file_references, error, created_at
            FROM messages
            WHERE window_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(window_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages from database")?;

        let messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        log::info!("Fetched {} messages for window {}", messages.len(), window_id);
        Ok(messages)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read setting '{}'", key))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write setting '{}'", key))?;
        Ok(())
    }
}
