use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::diagnostics::{self, Node};
use crate::error::ProbeError;
use crate::presets;
use crate::progress::hms_to_seconds;

// there's always a space before the size and either a space or a comma after
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" (\d+)x(\d+)[ ,]").unwrap());

const TAG_KEYS: [&str; 5] = ["title", "artist", "album", "track", "genre"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrmFlags {
    pub audio: bool,
    pub video: bool,
}

/// What could be read off one input file's inspect output. Every field is
/// best-effort; absent fields simply stay unset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaInfo {
    /// Container format, plus any brand aliases the format declares.
    pub container: Vec<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub drm: DrmFlags,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct MediaFile {
    pub path: PathBuf,
    pub info: MediaInfo,
}

impl MediaFile {
    /// Inspects `path` with the encoder. Runs a process and parses its
    /// output on every call; callers that need the result twice keep it.
    pub fn open(path: &Path) -> Result<MediaFile, ProbeError> {
        Ok(MediaFile {
            path: path.to_path_buf(),
            info: probe_file(path)?,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

pub fn probe_file(path: &Path) -> Result<MediaInfo, ProbeError> {
    let output = inspect_output(path)?;
    extract_info(&diagnostics::parse_output(&output))
}

fn inspect_output(path: &Path) -> Result<String, ProbeError> {
    let command = presets::ffmpeg_path();
    // Inspect mode exits non-zero because no output file is given; the
    // diagnostics it wrote are the product, so the status is ignored.
    let output = Command::new(&command)
        .arg("-i")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ProbeError::Exec { command, source })?;
    debug!(status = ?output.status.code(), "inspected {}", path.display());

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

pub(crate) fn extract_info(root: &Node) -> Result<MediaInfo, ProbeError> {
    let input0 = root.get_by_key("Input #0").ok_or(ProbeError::NoInputStream)?;
    let mut info = MediaInfo::default();

    // "Input #0, matroska,webm, from 'clip.webm':" -- field two names the
    // container, itself comma-separated when the demuxer has aliases.
    if let Some(container) = input0.line.splitn(3, ", ").nth(1) {
        info.container = container.split(',').map(String::from).collect();
    }

    if let Some(metadata) = input0.get_by_key("Metadata") {
        extract_metadata(metadata, &mut info);
    }

    if let Some(duration) = input0.get_by_key("Duration:") {
        extract_duration(duration, &mut info);
        for stream in &duration.children {
            extract_stream(stream, &mut info);
        }
    }

    Ok(info)
}

fn extract_metadata(metadata: &Node, info: &mut MediaInfo) {
    for key in TAG_KEYS {
        if let Some(value) = metadata_value(metadata, key) {
            info.tags.insert(String::from(key), value);
        }
    }

    let major_brand = metadata_value(metadata, "major_brand");
    if let Some(major) = &major_brand {
        if !(info.container.len() == 1 && info.container[0] == *major) {
            info.container.push(major.clone());
        }
    }

    // compatible_brands is an undivided run of four-character brand names
    if let Some(brands) = metadata_value(metadata, "compatible_brands") {
        let major = major_brand.as_deref().unwrap_or("");
        for part in brands.as_bytes().chunks(4) {
            let part = String::from_utf8_lossy(part);
            if part != major {
                info.container.push(part.into_owned());
            }
        }
    }
}

// The encoder pads metadata keys to a column, so "major_brand     : isom"
// keys carry trailing spaces.
fn metadata_value(metadata: &Node, key: &str) -> Option<String> {
    metadata.children.iter().find_map(|node| {
        (node.key.trim_end() == key).then(|| String::from(node.value.trim()))
    })
}

fn extract_duration(duration: &Node, info: &mut MediaInfo) {
    let Some((_, rest)) = duration.line.split_once(':') else {
        return;
    };
    let stamp = rest.split(", ").next().unwrap_or(rest).trim();
    let parts: Vec<f64> = stamp.split(':').filter_map(|p| p.parse().ok()).collect();
    if let [hours, minutes, seconds] = parts[..] {
        info.duration = Some(hms_to_seconds(hours, minutes, seconds));
    }
}

fn extract_stream(stream: &Node, info: &mut MediaInfo) {
    if stream.line.contains("Video:") {
        let Some(data) = stream_data(&stream.line) else {
            return;
        };
        let (codec, drm) = split_codec(data);
        info.video_codec = Some(codec);
        info.drm.video |= drm;
        if let Some(caps) = SIZE_RE.captures(data) {
            info.width = caps[1].parse().ok();
            info.height = caps[2].parse().ok();
        }
    } else if stream.line.contains("Audio:") {
        let Some(data) = stream_data(&stream.line) else {
            return;
        };
        let (codec, drm) = split_codec(data);
        info.audio_codec = Some(codec);
        info.drm.audio |= drm;
    }
}

// "Stream #0:0(und): Video: h264 (avc1 / ...), yuv420p, 640x480 ..." -- the
// part after the second ": " describes the stream.
fn stream_data(line: &str) -> Option<&str> {
    line.splitn(3, ": ").nth(2)
}

// The codec is the first comma-separated field; a trailing qualifier that
// mentions drm marks a protected stream.
fn split_codec(data: &str) -> (String, bool) {
    let codec = data.split(", ").next().unwrap_or(data);
    match codec.split_once(' ') {
        Some((name, qualifier)) => (String::from(name), qualifier.contains("drm")),
        None => (String::from(codec), false),
    }
}
