//! Listing, renaming and deleting a caller's ringtones, plus the naming and
//! layout helpers shared with the builder.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    builder::BuildStage,
    store::{AudioFormat, RingtoneRecord, RingtoneStore},
    validation::{MAX_FILE_NAME_CHARS, ValidationErrors, validate_file_name},
};

/// Separates a display name from the build id in temporary file names.
pub const PARTIAL_MARKER: &str = ".part-";
const UUID_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum RingtoneError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    /// Tool or persistence failure while building. The source is for the
    /// server log only.
    #[error("failed to create ringtone")]
    Build {
        stage: BuildStage,
        #[source]
        source: anyhow::Error,
    },
    #[error("ringtone not found")]
    NotFound,
    #[error("ringtone belongs to another user")]
    Forbidden,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Public URL under which the file is served.
pub fn download_url(user_id: &str, file_name: &str, format: AudioFormat) -> String {
    format!("/downloads/{user_id}/{file_name}.{}", format.extension())
}

pub fn user_dir(downloads_root: &Path, user_id: &str) -> PathBuf {
    downloads_root.join(user_id)
}

pub fn file_path(
    downloads_root: &Path,
    user_id: &str,
    file_name: &str,
    format: AudioFormat,
) -> PathBuf {
    user_dir(downloads_root, user_id).join(format!("{file_name}.{}", format.extension()))
}

/// Returns `requested` if no existing name matches it case-insensitively,
/// otherwise the first free `"{base} N"` for N = 1, 2, ... The base is cut
/// short when needed so the result stays within [`MAX_FILE_NAME_CHARS`].
pub fn resolve_unique_name(requested: &str, existing: &[String]) -> String {
    let taken: HashSet<String> = existing.iter().map(|name| name.to_lowercase()).collect();
    if !taken.contains(&requested.to_lowercase()) {
        return requested.to_string();
    }
    let mut counter: u64 = 1;
    loop {
        let suffix = format!(" {counter}");
        let keep = MAX_FILE_NAME_CHARS.saturating_sub(suffix.chars().count());
        let base: String = requested.chars().take(keep).collect();
        let candidate = format!("{}{suffix}", base.trim_end());
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        counter += 1;
    }
}

/// Stem of everything one build writes before its output is final:
/// `"{file_name}.part-{build_id}"`.
pub fn partial_stem(file_name: &str, build_id: &Uuid) -> String {
    format!("{file_name}{PARTIAL_MARKER}{build_id}")
}

/// True when `name` carries a build temporary marker, `.part-<uuid>` followed
/// by `.` or the end of the name.
pub fn is_partial_name(name: &str) -> bool {
    name.match_indices(PARTIAL_MARKER).any(|(index, _)| {
        let rest = &name[index + PARTIAL_MARKER.len()..];
        let Some(id) = rest.get(..UUID_LEN) else {
            return false;
        };
        Uuid::try_parse(id).is_ok() && matches!(rest[UUID_LEN..].chars().next(), None | Some('.'))
    })
}

#[derive(Clone)]
pub struct RingtoneLibrary {
    store: RingtoneStore,
    downloads_root: PathBuf,
}

impl RingtoneLibrary {
    pub fn new(store: RingtoneStore, downloads_root: PathBuf) -> Self {
        Self {
            store,
            downloads_root,
        }
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<RingtoneRecord>, RingtoneError> {
        Ok(self.store.list_ringtones(user_id).await?)
    }

    /// Loads a record and checks that `user_id` owns it.
    async fn owned(&self, user_id: &str, id: &str) -> Result<RingtoneRecord, RingtoneError> {
        let record = self
            .store
            .get_ringtone(id)
            .await?
            .ok_or(RingtoneError::NotFound)?;
        if record.user_id != user_id {
            return Err(RingtoneError::Forbidden);
        }
        Ok(record)
    }

    /// Changes the display name, moving the backing file along so the
    /// download URL keeps pointing at it.
    pub async fn rename(
        &self,
        user_id: &str,
        id: &str,
        requested: &str,
    ) -> Result<RingtoneRecord, RingtoneError> {
        let requested = validate_file_name(requested)?;
        let record = self.owned(user_id, id).await?;
        if requested == record.file_name {
            return Ok(record);
        }

        let existing = self.store.file_names_for_user(user_id, Some(id)).await?;
        let file_name = resolve_unique_name(&requested, &existing);
        let url = download_url(user_id, &file_name, record.format);

        let old_path = file_path(&self.downloads_root, user_id, &record.file_name, record.format);
        let new_path = file_path(&self.downloads_root, user_id, &file_name, record.format);
        let moved = match tokio::fs::rename(&old_path, &new_path).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(ringtone_id = id, path = %old_path.display(), "backing file missing during rename");
                false
            }
            Err(err) => {
                return Err(RingtoneError::Internal(anyhow::Error::new(err).context(format!(
                    "moving {} to {}",
                    old_path.display(),
                    new_path.display()
                ))));
            }
        };

        let updated = match self.store.rename_ringtone(id, &file_name, &url).await {
            Ok(Some(updated)) => updated,
            Ok(None) => return Err(RingtoneError::NotFound),
            Err(err) => {
                if moved && let Err(undo) = tokio::fs::rename(&new_path, &old_path).await {
                    warn!(ringtone_id = id, error = %undo, "could not move file back after failed rename");
                }
                return Err(err.into());
            }
        };
        info!(ringtone_id = id, user_id, file_name = %updated.file_name, "ringtone renamed");
        Ok(updated)
    }

    /// Removes the row, then tries to remove the file. The database decides
    /// what the user sees, so a file that cannot be removed is only logged.
    pub async fn delete(&self, user_id: &str, id: &str) -> Result<(), RingtoneError> {
        let record = self.owned(user_id, id).await?;
        if !self.store.delete_ringtone(id).await? {
            return Err(RingtoneError::NotFound);
        }

        let path = file_path(&self.downloads_root, user_id, &record.file_name, record.format);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(ringtone_id = id, path = %path.display(), "backing file already gone");
            }
            Err(err) => {
                warn!(ringtone_id = id, path = %path.display(), error = %err, "could not remove backing file");
            }
        }
        info!(ringtone_id = id, user_id, "ringtone deleted");
        Ok(())
    }
}

/// Best-effort removal of files a build wrote.
pub(crate) async fn remove_partial_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed partial output"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial output"),
        }
    }
}

/// Removes every file in `dir` whose name starts with `stem`. This also
/// catches what yt-dlp leaves while extracting audio, such as
/// `<stem>.webm.part` or `<stem>.temp.m4a`.
pub(crate) async fn remove_stem_files(dir: &Path, stem: &str) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "could not list build directory");
            return;
        }
    };
    let mut matched = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                if entry.file_name().to_string_lossy().starts_with(stem) {
                    matched.push(entry.path());
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "could not list build directory");
                break;
            }
        }
    }
    remove_partial_files(&matched).await;
}
