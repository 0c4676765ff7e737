//! Persistence layer for RingPing.
//!
//! One SQLite database (through libsql) holds the ringtone records plus the
//! anonymous users and their sessions. The structs in this module double as
//! the JSON payloads returned by the API.

use std::{collections::HashSet, fmt, path::Path, str::FromStr};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container/codec the downloader is asked to extract audio into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    M4a,
    Opus,
    Wav,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 4] = [Self::Mp3, Self::M4a, Self::Opus, Self::Wav];

    /// Value for `--audio-format`, which is also the file extension yt-dlp
    /// produces.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Opus => "opus",
            Self::Wav => "wav",
        }
    }

    pub fn extension(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| anyhow!("unknown audio format {value:?}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    #[default]
    Standard,
    High,
}

impl AudioQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Standard => "standard",
            Self::High => "high",
        }
    }

    /// Value for `--audio-quality`.
    pub fn bitrate(self) -> &'static str {
        match self {
            Self::Low => "128K",
            Self::Standard => "192K",
            Self::High => "320K",
        }
    }
}

impl FromStr for AudioQuality {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            _ => Err(anyhow!("unknown audio quality {value:?}")),
        }
    }
}

/// Row stored in the `ringtones` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingtoneRecord {
    pub id: String,
    pub user_id: String,
    pub file_name: String,
    pub source_url: String,
    pub start_time: f64,
    pub end_time: f64,
    pub format: AudioFormat,
    pub quality: AudioQuality,
    pub download_url: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Current UTC time in the fixed-width form stored in every timestamp column,
/// so that string ordering matches chronological ordering.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

// No unique index on (user_id, file_name): name resolution is a read-then-write
// check. Two concurrent creates with the same name lose at most one build,
// since publishing the file refuses to replace an existing one.
async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ringtones (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            source_url TEXT NOT NULL,
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            format TEXT NOT NULL,
            quality TEXT NOT NULL,
            download_url TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_ringtones_user ON ringtones(user_id, created_at);
        "#,
    )
    .await?;
    Ok(())
}

/// Cloneable handle around the libsql connection. Every clone shares the same
/// underlying connection.
#[derive(Clone)]
pub struct RingtoneStore {
    conn: Connection,
}

impl RingtoneStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Creates a user row for an anonymous sign-in and returns its id.
    pub async fn create_user(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO users (id, created_at) VALUES (?1, ?2)",
                params![id.as_str(), now_timestamp()],
            )
            .await
            .context("inserting user")?;
        Ok(id)
    }

    pub async fn create_session(&self, user_id: &str) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![token.as_str(), user_id, now_timestamp()],
            )
            .await
            .context("inserting session")?;
        Ok(token)
    }

    /// Resolves a session token to the owning user id.
    pub async fn session_user(&self, token: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT user_id FROM sessions WHERE token = ?1",
                params![token],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, token: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .await
            .context("deleting session")?;
        Ok(())
    }

    pub async fn insert_ringtone(&self, record: &RingtoneRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO ringtones (
                    id, user_id, file_name, source_url, start_time, end_time,
                    format, quality, download_url, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    record.id.as_str(),
                    record.user_id.as_str(),
                    record.file_name.as_str(),
                    record.source_url.as_str(),
                    record.start_time,
                    record.end_time,
                    record.format.as_str(),
                    record.quality.as_str(),
                    record.download_url.as_str(),
                    record.created_at.as_str(),
                    record.updated_at.as_str(),
                ],
            )
            .await
            .with_context(|| format!("inserting ringtone {}", record.id))?;
        Ok(())
    }

    pub async fn get_ringtone(&self, id: &str) -> Result<Option<RingtoneRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, user_id, file_name, source_url, start_time, end_time,
                       format, quality, download_url, created_at, updated_at
                FROM ringtones
                WHERE id = ?1
                "#,
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_ringtone(&row)?)),
            None => Ok(None),
        }
    }

    /// Every ringtone owned by `user_id`, newest first.
    pub async fn list_ringtones(&self, user_id: &str) -> Result<Vec<RingtoneRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, user_id, file_name, source_url, start_time, end_time,
                       format, quality, download_url, created_at, updated_at
                FROM ringtones
                WHERE user_id = ?1
                ORDER BY created_at DESC, rowid DESC
                "#,
                params![user_id],
            )
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_ringtone(&row)?);
        }
        Ok(records)
    }

    /// Display names already taken by `user_id`, optionally ignoring one
    /// record (the one being renamed).
    pub async fn file_names_for_user(
        &self,
        user_id: &str,
        exclude_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, file_name FROM ringtones WHERE user_id = ?1",
                params![user_id],
            )
            .await?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            if exclude_id == Some(id.as_str()) {
                continue;
            }
            names.push(row.get(1)?);
        }
        Ok(names)
    }

    pub async fn rename_ringtone(
        &self,
        id: &str,
        file_name: &str,
        download_url: &str,
    ) -> Result<Option<RingtoneRecord>> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE ringtones
                SET file_name = ?2, download_url = ?3, updated_at = ?4
                WHERE id = ?1
                "#,
                params![id, file_name, download_url, now_timestamp()],
            )
            .await
            .with_context(|| format!("renaming ringtone {id}"))?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_ringtone(id).await
    }

    /// Returns whether a row was removed.
    pub async fn delete_ringtone(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM ringtones WHERE id = ?1", params![id])
            .await
            .with_context(|| format!("deleting ringtone {id}"))?;
        Ok(changed > 0)
    }

    /// Every download URL currently referenced by a row.
    pub async fn all_download_urls(&self) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT download_url FROM ringtones", params![])
            .await?;
        let mut urls = HashSet::new();
        while let Some(row) = rows.next().await? {
            urls.insert(row.get(0)?);
        }
        Ok(urls)
    }
}

/// Column order must match the SELECT statements above.
fn row_to_ringtone(row: &Row) -> Result<RingtoneRecord> {
    let format: String = row.get(6)?;
    let quality: String = row.get(7)?;
    Ok(RingtoneRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_name: row.get(2)?,
        source_url: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        format: format.parse().context("parsing stored audio format")?,
        quality: quality.parse().context("parsing stored audio quality")?,
        download_url: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) async fn create_store() -> Result<(tempfile::TempDir, RingtoneStore)> {
        let temp = tempdir()?;
        let store = RingtoneStore::open(&temp.path().join("db").join("ringping.db")).await?;
        Ok((temp, store))
    }

    pub(crate) fn sample_ringtone(id: &str, user_id: &str, file_name: &str) -> RingtoneRecord {
        let now = now_timestamp();
        RingtoneRecord {
            id: id.into(),
            user_id: user_id.into(),
            file_name: file_name.into(),
            source_url: "https://valid.example/watch?v=abc".into(),
            start_time: 10.0,
            end_time: 40.0,
            format: AudioFormat::Mp3,
            quality: AudioQuality::Standard,
            download_url: format!("/downloads/{user_id}/{file_name}.mp3"),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() -> Result<()> {
        let (_temp, store) = create_store().await?;
        let record = sample_ringtone("r1", "u1", "My Clip");
        store.insert_ringtone(&record).await?;

        let fetched = store.get_ringtone("r1").await?.expect("record exists");
        assert_eq!(fetched, record);
        assert!(store.get_ringtone("ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_is_scoped_to_owner_and_newest_first() -> Result<()> {
        let (_temp, store) = create_store().await?;
        let mut old = sample_ringtone("old", "u1", "Old");
        old.created_at = "2024-01-01T00:00:00.000000Z".into();
        let mut new = sample_ringtone("new", "u1", "New");
        new.created_at = "2024-06-01T00:00:00.000000Z".into();
        store.insert_ringtone(&old).await?;
        store.insert_ringtone(&new).await?;
        store
            .insert_ringtone(&sample_ringtone("other", "u2", "Other"))
            .await?;

        let listed = store.list_ringtones("u1").await?;
        let ids: Vec<_> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["new", "old"]);
        Ok(())
    }

    #[tokio::test]
    async fn file_names_can_exclude_a_record() -> Result<()> {
        let (_temp, store) = create_store().await?;
        store.insert_ringtone(&sample_ringtone("a", "u1", "Alpha")).await?;
        store.insert_ringtone(&sample_ringtone("b", "u1", "Beta")).await?;

        let mut all = store.file_names_for_user("u1", None).await?;
        all.sort();
        assert_eq!(all, ["Alpha", "Beta"]);
        assert_eq!(store.file_names_for_user("u1", Some("a")).await?, ["Beta"]);
        assert!(store.file_names_for_user("u2", None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rename_updates_name_and_url() -> Result<()> {
        let (_temp, store) = create_store().await?;
        store.insert_ringtone(&sample_ringtone("a", "u1", "Alpha")).await?;

        let renamed = store
            .rename_ringtone("a", "Gamma", "/downloads/u1/Gamma.mp3")
            .await?
            .expect("renamed");
        assert_eq!(renamed.file_name, "Gamma");
        assert_eq!(renamed.download_url, "/downloads/u1/Gamma.mp3");
        assert!(store.rename_ringtone("ghost", "x", "/x").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_whether_row_existed() -> Result<()> {
        let (_temp, store) = create_store().await?;
        store.insert_ringtone(&sample_ringtone("a", "u1", "Alpha")).await?;
        assert!(store.delete_ringtone("a").await?);
        assert!(!store.delete_ringtone("a").await?);
        assert!(store.all_download_urls().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sessions_resolve_to_users() -> Result<()> {
        let (_temp, store) = create_store().await?;
        let user = store.create_user().await?;
        let token = store.create_session(&user).await?;

        assert_eq!(store.session_user(&token).await?.as_deref(), Some(user.as_str()));
        store.delete_session(&token).await?;
        assert!(store.session_user(&token).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn session_requires_existing_user() -> Result<()> {
        let (_temp, store) = create_store().await?;
        assert!(store.create_session("nobody").await.is_err());
        Ok(())
    }

    #[test]
    fn format_and_quality_parse_case_insensitively() {
        assert_eq!("MP3".parse::<AudioFormat>().unwrap(), AudioFormat::Mp3);
        assert_eq!("opus".parse::<AudioFormat>().unwrap(), AudioFormat::Opus);
        assert!("flac".parse::<AudioFormat>().is_err());
        assert_eq!("High".parse::<AudioQuality>().unwrap(), AudioQuality::High);
        assert_eq!(AudioQuality::default().bitrate(), "192K");
    }
}
