use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\W*Duration: (\d\d):(\d\d):(\d\d)\.(\d\d)(, start:.*)?(, bitrate:.*)?").unwrap()
});
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:frame=.* fps=.* q=.* )?size=.* time=(.*) bitrate=(.*)").unwrap()
});
static LAST_PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^frame=.* fps=.* q=.* Lsize=.* time=(.*) bitrate=(.*)").unwrap()
});

/// What one line of encoder output meant for the job that produced it.
///
/// The built-in classifier fills in exactly one aspect per line; presets
/// that speak a richer protocol (a JSON line per update, say) may combine
/// several, which is why this is a record and not a one-of.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    pub finished: bool,
    pub error: Option<String>,
    pub duration: Option<f64>,
    pub progress: Option<f64>,
    pub eta: Option<f64>,
}

impl StatusUpdate {
    pub fn duration(seconds: f64) -> Self {
        StatusUpdate {
            duration: Some(seconds),
            ..StatusUpdate::default()
        }
    }

    pub fn progress(seconds: f64) -> Self {
        StatusUpdate {
            progress: Some(seconds),
            ..StatusUpdate::default()
        }
    }

    pub fn finished() -> Self {
        StatusUpdate {
            finished: true,
            ..StatusUpdate::default()
        }
    }

    pub fn error(message: &str) -> Self {
        StatusUpdate {
            finished: true,
            error: Some(String::from(message)),
            ..StatusUpdate::default()
        }
    }
}

pub fn hms_to_seconds(hours: f64, minutes: f64, seconds: f64) -> f64 {
    hours * 3600.0 + minutes * 60.0 + seconds
}

/// Classifies one diagnostic line, or returns `None` for lines that carry
/// no job state.
///
/// The error check runs first: encoder error text can superficially look
/// like the loosely-matched progress patterns below it.
pub fn process_status_line(line: &str) -> Option<StatusUpdate> {
    if let Some(error) = check_for_errors(line) {
        return Some(StatusUpdate::error(error));
    }

    if let Some(caps) = DURATION_RE.captures(line) {
        let (hours, minutes) = (field(&caps, 1)?, field(&caps, 2)?);
        let seconds = field(&caps, 3)? + field(&caps, 4)? / 100.0;
        return Some(StatusUpdate::duration(hms_to_seconds(hours, minutes, seconds)));
    }

    if let Some(caps) = PROGRESS_RE.captures(line) {
        return parse_timestamp(caps.get(1)?.as_str()).map(StatusUpdate::progress);
    }

    if LAST_PROGRESS_RE.is_match(line) {
        return Some(StatusUpdate::finished());
    }

    None
}

fn check_for_errors(line: &str) -> Option<&str> {
    if line.starts_with("Unknown") {
        return Some(line);
    }
    if line.starts_with("Error") && !line.starts_with("Error while decoding stream") {
        return Some(line);
    }
    None
}

fn field(caps: &regex::Captures, index: usize) -> Option<f64> {
    caps.get(index)?.as_str().parse().ok()
}

// `HH:MM:SS[.cc]` or a bare seconds float.
fn parse_timestamp(t: &str) -> Option<f64> {
    if t.contains(':') {
        let mut parts = t.splitn(3, ':');
        let hours: f64 = parts.next()?.parse().ok()?;
        let minutes: f64 = parts.next()?.parse().ok()?;
        let seconds: f64 = parts.next()?.parse().ok()?;
        Some(hms_to_seconds(hours, minutes, seconds))
    } else {
        t.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_duration_line() {
        let update = process_status_line(
            "  Duration: 00:01:02.34, start: 0.000000, bitrate: 300 kb/s",
        )
        .unwrap();
        assert!(close(update.duration.unwrap(), 62.34));
        assert!(!update.finished);

        let update = process_status_line("Duration: 10:20:30.40").unwrap();
        assert!(close(update.duration.unwrap(), 37230.40));
    }

    #[test]
    fn test_duration_exact_to_centisecond() {
        for (line, centis) in [
            ("Duration: 00:00:05.00, bitrate: 1 kb/s", 500_i64),
            ("Duration: 00:00:01.07, bitrate: 1 kb/s", 107),
            ("Duration: 00:44:28.80, start: 0.0", 266880),
            ("Duration: 01:00:00.01", 360001),
        ] {
            let update = process_status_line(line).unwrap();
            let seconds = update.duration.unwrap();
            assert_eq!((seconds * 100.0).round() as i64, centis, "{}", line);
        }
    }

    #[test]
    fn test_progress_line() {
        let update = process_status_line(
            "frame=   82 fps= 41 q=28.0 size=     227kB time=00:00:03.28 bitrate= 565.1kbits/s",
        )
        .unwrap();
        assert!(close(update.progress.unwrap(), 3.28));
        assert!(!update.finished);
    }

    #[test]
    fn test_progress_line_bare_seconds() {
        let update =
            process_status_line("size=     227kB time=3.28 bitrate= 565.1kbits/s").unwrap();
        assert!(close(update.progress.unwrap(), 3.28));
    }

    #[test]
    fn test_last_progress_line() {
        let update = process_status_line(
            "frame=  125 fps= 40 q=-1.0 Lsize=     400kB time=00:00:05.00 bitrate= 655.4kbits/s dup=1 drop=0",
        )
        .unwrap();
        assert!(update.finished);
        assert_eq!(update.error, None);
        // the terminal line must not read as an ordinary progress update
        assert_eq!(update.progress, None);
    }

    #[test]
    fn test_error_lines() {
        let update = process_status_line("Unknown encoder 'libx264'").unwrap();
        assert!(update.finished);
        assert_eq!(update.error.as_deref(), Some("Unknown encoder 'libx264'"));

        let update = process_status_line("Error while opening encoder").unwrap();
        assert!(update.finished);
        assert_eq!(update.error.as_deref(), Some("Error while opening encoder"));
    }

    #[test]
    fn test_benign_decode_warning_ignored() {
        assert_eq!(
            process_status_line("Error while decoding stream #0:0"),
            None
        );
    }

    #[test]
    fn test_error_check_precedes_progress() {
        // error text shaped enough like a progress line to fool the loose patterns
        let update =
            process_status_line("Error: size=0 time=0.0 bitrate=0 unable to write").unwrap();
        assert!(update.finished);
        assert!(update.error.is_some());
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        assert_eq!(process_status_line(""), None);
        assert_eq!(process_status_line("Press [q] to stop, [?] for help"), None);
        assert_eq!(
            process_status_line("Stream mapping: Stream #0:0 -> #0:0 (vp8 -> libx264)"),
            None
        );
    }

    #[test]
    fn test_protocol_sequence() {
        let mut updates = vec![];
        updates.push(
            process_status_line("  Duration: 00:00:05.00, start: 0.000000, bitrate: 1006 kb/s")
                .unwrap(),
        );
        for x in 0..5 {
            let line = format!(
                "frame=   {x}0 fps= 25 q=28.0 size=     {x}0kB time=00:00:0{x}.00 bitrate= 400.0kbits/s"
            );
            updates.push(process_status_line(&line).unwrap());
        }
        updates.push(
            process_status_line(
                "frame=  125 fps= 25 q=-1.0 Lsize=     250kB time=00:00:05.00 bitrate= 400.0kbits/s",
            )
            .unwrap(),
        );

        assert_eq!(updates[0], StatusUpdate::duration(5.0));
        for x in 0..5 {
            assert_eq!(updates[x + 1], StatusUpdate::progress(x as f64));
        }
        assert_eq!(updates[6], StatusUpdate::finished());
    }

    #[test]
    fn test_json_protocol_deserializes() {
        let update: StatusUpdate = serde_json::from_str(
            r#"{"filename": "a.webm", "duration": 5.0, "progress": 2.0, "eta": 3.0}"#,
        )
        .unwrap();
        assert_eq!(update.duration, Some(5.0));
        assert_eq!(update.progress, Some(2.0));
        assert_eq!(update.eta, Some(3.0));
        assert!(!update.finished);

        let update: StatusUpdate =
            serde_json::from_str(r#"{"finished": true, "error": "test error"}"#).unwrap();
        assert!(update.finished);
        assert_eq!(update.error.as_deref(), Some("test error"));
    }
}
