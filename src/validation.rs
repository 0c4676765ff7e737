//! Input checks for ringtone requests.
//!
//! Every check runs before any subprocess or filesystem work and reports all
//! offending fields at once.

use std::fmt;

use serde::Serialize;
use url::Url;

use crate::ringtones::is_partial_name;

pub const MIN_DURATION_SECONDS: f64 = 5.0;
pub const MAX_DURATION_SECONDS: f64 = 60.0;
pub const MAX_FILE_NAME_CHARS: usize = 50;
pub const FORBIDDEN_FILE_NAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.iter().any(|error| error.field == field)
    }

    fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid input: ")?;
        for (index, error) in self.fields.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", error.field, error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Raw creation parameters as submitted by the client.
#[derive(Debug, Clone)]
pub struct ClipRequest<'a> {
    pub url: &'a str,
    pub start_seconds: f64,
    pub duration_seconds: f64,
    pub file_name: &'a str,
    pub video_duration: Option<f64>,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidClip {
    pub url: Url,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub file_name: String,
}

impl ValidClip {
    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

pub fn validate_clip(request: &ClipRequest<'_>) -> Result<ValidClip, ValidationErrors> {
    let mut errors = ValidationErrors::default();

    let url = match parse_source_url(request.url) {
        Ok(url) => Some(url),
        Err(message) => {
            errors.push("url", message);
            None
        }
    };

    if !request.start_seconds.is_finite() || request.start_seconds < 0.0 {
        errors.push("startSeconds", "must be zero or greater");
    }

    let duration = request.duration_seconds;
    if !duration.is_finite() || !(MIN_DURATION_SECONDS..=MAX_DURATION_SECONDS).contains(&duration)
    {
        errors.push(
            "durationSeconds",
            format!(
                "must be between {MIN_DURATION_SECONDS} and {MAX_DURATION_SECONDS} seconds"
            ),
        );
    }

    let end_seconds = request.start_seconds + duration;
    if errors.is_empty()
        && let Some(video_duration) = request.video_duration
        && video_duration.is_finite()
        && video_duration > 0.0
        && end_seconds > video_duration
    {
        errors.push(
            "durationSeconds",
            format!("clip ends at {end_seconds}s but the video is only {video_duration}s long"),
        );
    }

    let file_name = match check_file_name(request.file_name) {
        Ok(name) => Some(name),
        Err(message) => {
            errors.push("fileName", message);
            None
        }
    };

    match (url, file_name) {
        (Some(url), Some(file_name)) => errors.into_result(ValidClip {
            url,
            start_seconds: request.start_seconds,
            end_seconds,
            file_name,
        }),
        _ => Err(errors),
    }
}

pub fn validate_url(raw: &str) -> Result<Url, ValidationErrors> {
    parse_source_url(raw).map_err(|message| {
        let mut errors = ValidationErrors::default();
        errors.push("url", message);
        errors
    })
}

/// Returns the trimmed name on success.
pub fn validate_file_name(raw: &str) -> Result<String, ValidationErrors> {
    check_file_name(raw).map_err(|message| {
        let mut errors = ValidationErrors::default();
        errors.push("fileName", message);
        errors
    })
}

fn parse_source_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|err| format!("not a valid absolute URL ({err})"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err("must use http or https".into());
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("must include a host".into());
    }
    Ok(url)
}

fn check_file_name(raw: &str) -> Result<String, String> {
    let name = raw.trim();
    let length = name.chars().count();
    if length == 0 {
        return Err("must not be empty".into());
    }
    if length > MAX_FILE_NAME_CHARS {
        return Err(format!("must be at most {MAX_FILE_NAME_CHARS} characters"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| FORBIDDEN_FILE_NAME_CHARS.contains(c) || c.is_control())
    {
        return Err(format!("must not contain {bad:?}"));
    }
    if is_partial_name(name) {
        return Err("must not look like a temporary build file".into());
    }
    Ok(name.to_string())
}
