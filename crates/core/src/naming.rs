//! Filesystem naming rules for channel folders and recording files.
//!
//! Channel folders live at `<base_path>/<folder_name>` and every recording
//! of that channel is written inside it, so both the folder slug and the
//! operator-supplied filenames must be safe path components.

use crate::error::CoreError;

/// Fallback folder name used when a channel name contains no usable
/// characters.
pub const DEFAULT_FOLDER_NAME: &str = "channel";

/// Extension of raw transport-stream captures.
pub const TS_EXTENSION: &str = "ts";

/// Extension of rewrapped recordings.
pub const MP4_EXTENSION: &str = "mp4";

/// Longest filename accepted for a recording or rewrap output.
const MAX_FILENAME_LEN: usize = 200;

/// Derive a filesystem-safe folder slug from a channel name.
///
/// Lower-cases the name, collapses every run of characters outside
/// `[a-z0-9]` into a single hyphen and trims leading/trailing hyphens.
/// Falls back to [`DEFAULT_FOLDER_NAME`] when nothing is left.
///
/// # Examples
///
/// ```
/// use srtcast_core::naming::folder_name;
///
/// assert_eq!(folder_name("Sports Feed 1"), "sports-feed-1");
/// assert_eq!(folder_name("!!!"), "channel");
/// ```
pub fn folder_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    if slug.is_empty() {
        DEFAULT_FOLDER_NAME.to_string()
    } else {
        slug
    }
}

/// Validate an operator-supplied recording filename and make sure it ends
/// in `.ts`.
pub fn recording_filename(raw: &str) -> Result<String, CoreError> {
    let name = validate_filename(raw)?;
    Ok(with_extension(name, TS_EXTENSION))
}

/// Validate a rewrap output filename and make sure it ends in `.mp4`.
pub fn rewrap_filename(raw: &str) -> Result<String, CoreError> {
    let name = validate_filename(raw)?;
    Ok(with_extension(name, MP4_EXTENSION))
}

/// Append `.{ext}` unless the name already carries it (case-insensitive).
pub fn with_extension(name: &str, ext: &str) -> String {
    let suffix = format!(".{ext}");
    if name.to_ascii_lowercase().ends_with(&suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

fn validate_filename(raw: &str) -> Result<&str, CoreError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(CoreError::Validation("Filename must not be empty".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(CoreError::Validation(format!(
            "Filename must be at most {MAX_FILENAME_LEN} characters"
        )));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(CoreError::Validation(format!(
            "Filename '{name}' must be a single path component"
        )));
    }
    Ok(name)
}
