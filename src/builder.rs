//! Turns a validated clip request into an audio file plus a database row.
//!
//! The build walks through [`BuildStage`]s in order. The tools only ever
//! write files named after the build's temporary stem
//! (`"{file_name}.part-{ringtone_id}"`); the finished clip is linked to its
//! public name last. Any failure removes every file under that stem before
//! the generic error goes back to the caller. The tool diagnostics stay in
//! the server log.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::{
    ringtones::{
        RingtoneError, download_url, file_path, partial_stem, remove_partial_files,
        remove_stem_files, resolve_unique_name, user_dir,
    },
    store::{AudioFormat, AudioQuality, RingtoneRecord, RingtoneStore, now_timestamp},
    tools::{Downloader, SectionDownload, ToolError, Transcoder},
    validation::{ClipRequest, ValidClip, validate_clip},
};

/// Body of a create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRingtone {
    pub url: String,
    pub start_seconds: f64,
    pub duration_seconds: f64,
    pub file_name: String,
    #[serde(default)]
    pub video_duration: Option<f64>,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default)]
    pub quality: AudioQuality,
}

impl CreateRingtone {
    fn clip_request(&self) -> ClipRequest<'_> {
        ClipRequest {
            url: &self.url,
            start_seconds: self.start_seconds,
            duration_seconds: self.duration_seconds,
            file_name: &self.file_name,
            video_duration: self.video_duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Validating,
    Resolving,
    Downloading,
    Trimming,
    Persisting,
    Done,
}

impl BuildStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Trimming => "trimming",
            Self::Persisting => "persisting",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for the optional ffmpeg pass that cuts the clip exactly after
/// yt-dlp fetched a slightly wider window.
#[derive(Debug, Clone, Copy)]
pub struct PreciseTrim {
    pub buffer_secs: f64,
}

#[derive(Clone)]
pub struct RingtoneBuilder {
    store: RingtoneStore,
    downloader: Downloader,
    transcoder: Transcoder,
    downloads_root: PathBuf,
    precise_trim: Option<PreciseTrim>,
}

/// Where a single build writes. Everything except `target` lives under
/// `dir/stem*`.
struct OutputPlan {
    dir: PathBuf,
    stem: String,
    download: PathBuf,
    cut: Option<PathBuf>,
    target: PathBuf,
    window_start: f64,
    window_end: f64,
}

impl OutputPlan {
    /// The file that becomes `target` once every tool succeeded.
    fn finished(&self) -> &Path {
        self.cut.as_deref().unwrap_or(&self.download)
    }
}

impl RingtoneBuilder {
    pub fn new(
        store: RingtoneStore,
        downloader: Downloader,
        transcoder: Transcoder,
        downloads_root: PathBuf,
        precise_trim: Option<PreciseTrim>,
    ) -> Self {
        Self {
            store,
            downloader,
            transcoder,
            downloads_root,
            precise_trim,
        }
    }

    pub async fn create(
        &self,
        user_id: &str,
        request: &CreateRingtone,
    ) -> Result<RingtoneRecord, RingtoneError> {
        let ringtone_id = Uuid::new_v4();
        let span = info_span!("create_ringtone", user_id, ringtone_id = %ringtone_id);
        self.run(user_id, &ringtone_id, request).instrument(span).await
    }

    async fn run(
        &self,
        user_id: &str,
        ringtone_id: &Uuid,
        request: &CreateRingtone,
    ) -> Result<RingtoneRecord, RingtoneError> {
        enter(BuildStage::Validating);
        let clip = validate_clip(&request.clip_request())?;

        enter(BuildStage::Resolving);
        let existing = self
            .store
            .file_names_for_user(user_id, None)
            .await
            .map_err(|source| failed(BuildStage::Resolving, source))?;
        let file_name = resolve_unique_name(&clip.file_name, &existing);

        let plan = self.plan(user_id, ringtone_id, &file_name, &clip, request.format);
        if let Err(err) = self.produce(&clip, &plan, request).await {
            remove_stem_files(&plan.dir, &plan.stem).await;
            return Err(err);
        }

        let now = now_timestamp();
        let record = RingtoneRecord {
            id: ringtone_id.to_string(),
            user_id: user_id.to_string(),
            download_url: download_url(user_id, &file_name, request.format),
            file_name,
            source_url: clip.url.to_string(),
            start_time: clip.start_seconds,
            end_time: clip.end_seconds,
            format: request.format,
            quality: request.quality,
            created_at: now.clone(),
            updated_at: now,
        };
        if let Err(source) = self.store.insert_ringtone(&record).await {
            remove_partial_files(std::slice::from_ref(&plan.target)).await;
            return Err(failed(BuildStage::Persisting, source));
        }

        enter(BuildStage::Done);
        info!(file_name = %record.file_name, download_url = %record.download_url, "ringtone created");
        Ok(record)
    }

    fn plan(
        &self,
        user_id: &str,
        ringtone_id: &Uuid,
        file_name: &str,
        clip: &ValidClip,
        format: AudioFormat,
    ) -> OutputPlan {
        let dir = user_dir(&self.downloads_root, user_id);
        let stem = partial_stem(file_name, ringtone_id);
        let ext = format.extension();
        let download = dir.join(format!("{stem}.{ext}"));
        let target = file_path(&self.downloads_root, user_id, file_name, format);
        let (cut, window_start, window_end) = match self.precise_trim {
            None => (None, clip.start_seconds, clip.end_seconds),
            Some(trim) => (
                Some(dir.join(format!("{stem}.cut.{ext}"))),
                (clip.start_seconds - trim.buffer_secs).max(0.0),
                clip.end_seconds + trim.buffer_secs,
            ),
        };
        OutputPlan {
            dir,
            stem,
            download,
            cut,
            target,
            window_start,
            window_end,
        }
    }

    /// Downloading, the optional trim and publishing under the final name.
    /// On error, cleanup of the temporary stem is left to the caller.
    async fn produce(
        &self,
        clip: &ValidClip,
        plan: &OutputPlan,
        request: &CreateRingtone,
    ) -> Result<(), RingtoneError> {
        enter(BuildStage::Downloading);
        tokio::fs::create_dir_all(&plan.dir)
            .await
            .map_err(|err| failed(BuildStage::Downloading, err))?;
        self.downloader
            .download_section(&SectionDownload {
                url: &clip.url,
                start_seconds: plan.window_start,
                end_seconds: plan.window_end,
                format: request.format,
                quality: request.quality,
                output_stem: &plan.dir.join(&plan.stem),
            })
            .await
            .map_err(|err| failed(BuildStage::Downloading, err))?;
        ensure_non_empty(Downloader::NAME, &plan.download)
            .await
            .map_err(|err| failed(BuildStage::Downloading, err))?;

        if let Some(cut) = &plan.cut {
            enter(BuildStage::Trimming);
            let offset = clip.start_seconds - plan.window_start;
            self.transcoder
                .trim(&plan.download, cut, offset, clip.duration_seconds())
                .await
                .map_err(|err| failed(BuildStage::Trimming, err))?;
            ensure_non_empty(Transcoder::NAME, cut)
                .await
                .map_err(|err| failed(BuildStage::Trimming, err))?;
        }

        enter(BuildStage::Persisting);
        // Linking fails when the public name is already taken, so a
        // concurrent create with the same name never overwrites this file.
        tokio::fs::hard_link(plan.finished(), &plan.target)
            .await
            .map_err(|err| failed(BuildStage::Persisting, err))?;
        remove_stem_files(&plan.dir, &plan.stem).await;
        Ok(())
    }
}

fn enter(stage: BuildStage) {
    info!(stage = stage.as_str(), "build stage");
}

fn failed(stage: BuildStage, source: impl Into<anyhow::Error>) -> RingtoneError {
    let source = source.into();
    error!(stage = stage.as_str(), error = %format!("{source:#}"), "ringtone build failed");
    RingtoneError::Build { stage, source }
}

async fn ensure_non_empty(tool: &'static str, path: &Path) -> Result<(), ToolError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(()),
        _ => Err(ToolError::EmptyOutput {
            tool,
            path: path.to_path_buf(),
        }),
    }
}
