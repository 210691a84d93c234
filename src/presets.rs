use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::probe::MediaFile;
use crate::progress::{self, StatusUpdate};

static NON_WORD_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());

static FFMPEG_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| which::which("ffmpeg").unwrap_or_else(|_| PathBuf::from("ffmpeg")));

pub fn ffmpeg_path() -> PathBuf {
    FFMPEG_PATH.clone()
}

pub fn identifier_for(name: &str) -> String {
    NON_WORD_CHARS.replace_all(name, "").to_lowercase()
}

/// One target format or device: how to invoke the encoder for it, how to
/// name its output, and how to read the encoder's chatter while it runs.
pub trait Preset: Send + Sync {
    fn name(&self) -> &str;
    fn identifier(&self) -> &str;
    fn extension(&self) -> &str;

    fn executable(&self) -> PathBuf;

    /// Complete argv tail for one conversion, input through output.
    fn arguments(&self, input: &MediaFile, output: &Path) -> Vec<OsString>;

    fn output_filename(&self, input: &MediaFile) -> String {
        let stem = input
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}.{}.{}", stem, self.identifier(), self.extension())
    }

    fn process_status_line(&self, line: &str) -> Option<StatusUpdate> {
        progress::process_status_line(line)
    }

    /// Promotes the staged file to the final output. The default is an
    /// atomic rename; formats that need post-processing override this.
    fn finalize(&self, temp: &Path, output: &Path) -> io::Result<()> {
        fs::rename(temp, output)
    }

    fn output_size_guess(&self, _input: &MediaFile) -> Option<u64> {
        None
    }
}

/// Whether the preset's encoder can actually be launched.
pub fn encoder_available(preset: &dyn Preset) -> bool {
    Command::new(preset.executable())
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

pub struct FfmpegPreset {
    name: &'static str,
    identifier: String,
    extension: &'static str,
    parameters: &'static [&'static str],
    target_size: Option<(u32, u32)>,
    bitrate: Option<u64>,
    faststart: bool,
}

impl FfmpegPreset {
    fn new(name: &'static str, extension: &'static str, parameters: &'static [&'static str]) -> Self {
        FfmpegPreset {
            name,
            identifier: identifier_for(name),
            extension,
            parameters,
            target_size: None,
            bitrate: None,
            faststart: false,
        }
    }

    fn size(mut self, width: u32, height: u32) -> Self {
        self.target_size = Some((width, height));
        self
    }

    fn bitrate(mut self, bits_per_second: u64) -> Self {
        self.bitrate = Some(bits_per_second);
        self
    }

    fn faststart(mut self) -> Self {
        self.faststart = true;
        self
    }
}

impl Preset for FfmpegPreset {
    fn name(&self) -> &str {
        self.name
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn extension(&self) -> &str {
        self.extension
    }

    fn executable(&self) -> PathBuf {
        ffmpeg_path()
    }

    fn arguments(&self, input: &MediaFile, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            OsString::from("-i"),
            input.path.clone().into_os_string(),
            OsString::from("-strict"),
            OsString::from("experimental"),
        ];
        for parameter in self.parameters {
            args.push(OsString::from(parameter));
        }
        if let Some(target) = self.target_size {
            let (width, height) = rescale((input.info.width, input.info.height), target);
            args.push(OsString::from("-s"));
            args.push(OsString::from(format!("{}x{}", width, height)));
        }
        args.push(output.as_os_str().to_os_string());
        args
    }

    fn finalize(&self, temp: &Path, output: &Path) -> io::Result<()> {
        if !self.faststart {
            return fs::rename(temp, output);
        }

        // Copy-mode remux so the index lands at the front of the file,
        // where progressive readers need it.
        debug!("remuxing {} -> {}", temp.display(), output.display());
        let status = Command::new(ffmpeg_path())
            .arg("-y")
            .arg("-i")
            .arg(temp)
            .args(["-c", "copy", "-movflags", "faststart"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            let _ = fs::remove_file(output);
            return Err(io::Error::other(format!("remux exited with {}", status)));
        }
        fs::remove_file(temp)
    }

    fn output_size_guess(&self, input: &MediaFile) -> Option<u64> {
        let bitrate = self.bitrate?;
        let duration = input.info.duration?;
        Some((bitrate as f64 * duration / 8.0) as u64)
    }
}

/// Rounds down to the nearest even number, never below zero. Odd frame
/// dimensions upset several encoders.
pub fn round_even(num: f64) -> u32 {
    let num = num as i64;
    let val = num - num % 2;
    if val > 0 { val as u32 } else { 0 }
}

/// Largest size that fits `target` while keeping the source aspect ratio.
/// Never upsizes, and both dimensions come out even.
pub fn rescale(source: (Option<u32>, Option<u32>), target: (u32, u32)) -> (u32, u32) {
    let (Some(source_width), Some(source_height)) = source else {
        return target;
    };
    if source_width == 0 || source_height == 0 {
        return target;
    }
    if source_width <= target.0 && source_height <= target.1 {
        return (source_width, source_height);
    }
    let width_ratio = f64::from(source_width) / f64::from(target.0);
    let height_ratio = f64::from(source_height) / f64::from(target.1);
    let ratio = width_ratio.max(height_ratio);
    (
        round_even(f64::from(source_width) / ratio),
        round_even(f64::from(source_height) / ratio),
    )
}

const WEBM_PARAMS: &[&str] = &[
    "-f", "webm", "-vcodec", "libvpx", "-g", "120", "-lag-in-frames", "16", "-deadline", "good",
    "-cpu-used", "0", "-vprofile", "0", "-qmax", "51", "-qmin", "11", "-slices", "4", "-b:v", "2M",
    "-acodec", "libvorbis", "-ab", "112k", "-ar", "44100",
];

const WEBM_SD_PARAMS: &[&str] = &[
    "-f", "webm", "-vcodec", "libvpx", "-g", "120", "-lag-in-frames", "16", "-deadline", "good",
    "-cpu-used", "0", "-vprofile", "0", "-qmax", "53", "-qmin", "0", "-b:v", "768k", "-acodec",
    "libvorbis", "-ab", "112k", "-ar", "44100",
];

const MP4_PARAMS: &[&str] = &[
    "-acodec", "aac", "-ab", "96k", "-vcodec", "libx264", "-preset", "slow", "-f", "mp4", "-crf",
    "22",
];

const MP3_PARAMS: &[&str] = &["-f", "mp3", "-ac", "2"];

const OGG_VORBIS_PARAMS: &[&str] = &["-f", "ogg", "-vn", "-acodec", "libvorbis", "-aq", "60"];

const OGG_THEORA_PARAMS: &[&str] = &[
    "-f", "ogg", "-vcodec", "libtheora", "-acodec", "libvorbis", "-aq", "60",
];

// H.264 baseline profile that every supported handheld decodes.
const DEVICE_PARAMS: &[&str] = &[
    "-acodec", "aac", "-ac", "2", "-ab", "160k", "-vcodec", "libx264", "-preset", "slow",
    "-profile:v", "baseline", "-level", "30", "-maxrate", "10000000", "-bufsize", "10000000",
    "-vb", "1200k", "-f", "mp4", "-threads", "0",
];

/// The presets this build knows about, assembled once at startup.
pub struct PresetCatalog {
    presets: Vec<Arc<dyn Preset>>,
}

impl PresetCatalog {
    pub fn standard() -> Self {
        let mut catalog = PresetCatalog { presets: vec![] };

        catalog.add(FfmpegPreset::new("MP4", "mp4", MP4_PARAMS).faststart());
        catalog.add(FfmpegPreset::new("MP3", "mp3", MP3_PARAMS));
        catalog.add(FfmpegPreset::new("Ogg Vorbis", "ogg", OGG_VORBIS_PARAMS));
        catalog.add(FfmpegPreset::new("Ogg Theora", "ogv", OGG_THEORA_PARAMS));
        catalog.add(
            FfmpegPreset::new("WebM HD", "webm", WEBM_PARAMS)
                .size(1280, 720)
                .bitrate(2_112_000),
        );
        catalog.add(
            FfmpegPreset::new("WebM SD", "webm", WEBM_SD_PARAMS)
                .size(854, 480)
                .bitrate(880_000),
        );

        for (name, width, height) in [
            ("iPhone", 640, 480),
            ("iPhone 4+", 960, 640),
            ("iPhone 5", 1920, 1080),
            ("iPad", 1024, 768),
            ("Apple TV", 1280, 720),
            ("Apple Universal", 1280, 720),
            ("Nexus One", 800, 400),
            ("Droid", 854, 480),
            ("Galaxy Tab", 1024, 800),
            ("Xoom", 1280, 800),
        ] {
            catalog.add(
                FfmpegPreset::new(name, "mp4", DEVICE_PARAMS)
                    .size(width, height)
                    .bitrate(1_360_000)
                    .faststart(),
            );
        }

        catalog
    }

    pub fn add(&mut self, preset: FfmpegPreset) {
        self.presets.push(Arc::new(preset));
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn Preset>> {
        self.presets
            .iter()
            .find(|preset| preset.identifier() == identifier)
            .cloned()
    }

    pub fn all(&self) -> &[Arc<dyn Preset>] {
        &self.presets
    }
}
