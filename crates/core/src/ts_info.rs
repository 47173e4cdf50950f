//! Transport-stream structure as discovered by a probe.
//!
//! The prober runs `ffprobe -print_format json -show_format -show_programs
//! -show_streams` against a channel's SRT source. This module holds the
//! serde shapes of that output and the mapping onto the [`TsInfo`] value
//! persisted in `channels.ts_info`.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Structured probe result stored on a channel. Bitrates are kbps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmt_pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr_pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bitrate: Option<i64>,
    #[serde(default)]
    pub video: Vec<VideoStream>,
    #[serde(default)]
    pub audio: Vec<AudioStream>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStream {
    pub pid: u16,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStream {
    pub pid: u16,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
}

impl TsInfo {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty() && self.service_name.is_none()
    }
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output.
#[derive(Debug, Default, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub programs: Vec<FfprobeProgram>,
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: Option<FfprobeFormat>,
}

/// An MPEG-TS program (service).
#[derive(Debug, Deserialize)]
pub struct FfprobeProgram {
    pub program_id: Option<i64>,
    pub pmt_pid: Option<i64>,
    pub pcr_pid: Option<i64>,
    pub tags: Option<FfprobeProgramTags>,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeProgramTags {
    pub service_name: Option<String>,
    pub service_provider: Option<String>,
}

/// A single elementary stream.
#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub index: i32,
    /// Transport-stream PID as a hex string, e.g. `"0x100"`.
    pub id: Option<String>,
    pub codec_name: Option<String>,
    pub codec_type: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    /// Bits per second, as a decimal string.
    pub bit_rate: Option<String>,
    pub tags: Option<FfprobeStreamTags>,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeStreamTags {
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub bit_rate: Option<String>,
    pub format_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Parse raw ffprobe stdout into a [`TsInfo`].
pub fn parse_ffprobe_json(stdout: &str) -> Result<TsInfo, CoreError> {
    let output: FfprobeOutput = serde_json::from_str(stdout)
        .map_err(|e| CoreError::Validation(format!("Failed to parse probe output: {e}")))?;
    Ok(TsInfo::from(output))
}

impl From<FfprobeOutput> for TsInfo {
    fn from(output: FfprobeOutput) -> Self {
        let mut info = TsInfo::default();

        // The first program carries the service; single-program streams are
        // the norm for contribution feeds.
        if let Some(program) = output.programs.first() {
            info.pmt_pid = program.pmt_pid.and_then(to_pid);
            info.pcr_pid = program.pcr_pid.and_then(to_pid);
            if let Some(tags) = &program.tags {
                info.service_name = tags.service_name.clone().filter(|s| !s.is_empty());
                info.provider = tags.service_provider.clone().filter(|s| !s.is_empty());
            }
        }

        info.total_bitrate = output
            .format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(bps_to_kbps);

        for stream in &output.streams {
            let Some(pid) = stream.id.as_deref().and_then(parse_pid) else {
                continue;
            };
            let codec = stream
                .codec_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let bitrate = stream.bit_rate.as_deref().and_then(bps_to_kbps);

            match stream.codec_type.as_deref() {
                Some("video") => info.video.push(VideoStream {
                    pid,
                    codec,
                    resolution: match (stream.width, stream.height) {
                        (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{w}x{h}")),
                        _ => None,
                    },
                    bitrate,
                }),
                Some("audio") => info.audio.push(AudioStream {
                    pid,
                    codec,
                    language: stream
                        .tags
                        .as_ref()
                        .and_then(|t| t.language.clone())
                        .filter(|l| !l.is_empty() && l != "und"),
                    bitrate,
                }),
                _ => {}
            }
        }

        info.video.sort_by_key(|v| v.pid);
        info.audio.sort_by_key(|a| a.pid);
        info
    }
}

/// Parse a PID written as `0x1ff` or as a plain decimal number.
pub fn parse_pid(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    let value = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok()?,
        None => raw.parse().ok()?,
    };
    // PIDs are 13-bit.
    (value <= 0x1FFF).then_some(value)
}

fn to_pid(value: i64) -> Option<u16> {
    u16::try_from(value).ok().filter(|v| *v <= 0x1FFF)
}

fn bps_to_kbps(raw: &str) -> Option<i64> {
    let bps: f64 = raw.trim().parse().ok()?;
    (bps > 0.0).then(|| (bps / 1000.0).round() as i64)
}
