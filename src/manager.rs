use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::conversion::Conversion;
use crate::presets::Preset;
use crate::probe::MediaFile;

/// Conversions with changes since the last drain. Job threads add from
/// wherever they run; only `check_notifications` empties it.
#[derive(Default)]
pub struct NotifyQueue {
    pending: Mutex<Vec<Arc<Conversion>>>,
}

impl NotifyQueue {
    // One entry per conversion per drain, however many times it changed.
    pub(crate) fn add(&self, conversion: Arc<Conversion>) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.iter().any(|c| c.id() == conversion.id()) {
            pending.push(conversion);
        }
    }

    fn take_all(&self) -> Vec<Arc<Conversion>> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

/// Admission control over conversions: at most `simultaneous` run at once,
/// the rest wait their turn in submission order.
///
/// Construct it, `start_conversion` for each requested job, and call
/// `check_notifications` on a timer from one coordinating thread; that
/// drain is where listeners fire and where waiting jobs get admitted.
pub struct ConversionManager {
    notify_queue: Arc<NotifyQueue>,
    in_progress: Vec<Arc<Conversion>>,
    waiting: VecDeque<Arc<Conversion>>,
    simultaneous: Option<usize>,
    running: bool,
}

impl ConversionManager {
    pub fn new(simultaneous: Option<usize>) -> Self {
        ConversionManager {
            notify_queue: Arc::new(NotifyQueue::default()),
            in_progress: vec![],
            waiting: VecDeque::new(),
            simultaneous,
            running: false,
        }
    }

    pub fn start_conversion(
        &mut self,
        file: MediaFile,
        preset: Arc<dyn Preset>,
        output_dir: Option<&Path>,
    ) -> Arc<Conversion> {
        let conversion = Conversion::new(file, preset, output_dir, Arc::clone(&self.notify_queue));
        if self.has_capacity() {
            self.in_progress.push(Arc::clone(&conversion));
            conversion.run();
        } else {
            debug!(id = conversion.id(), "queued behind {} waiting", self.waiting.len());
            self.waiting.push_back(Arc::clone(&conversion));
        }
        self.running = true;
        conversion
    }

    /// Drains pending change notifications: retires finished jobs, admits
    /// waiting ones, and invokes listeners. Call this periodically from
    /// the coordinating thread; job threads never call it.
    pub fn check_notifications(&mut self) {
        if !self.running {
            return;
        }

        for conversion in self.notify_queue.take_all() {
            if conversion.status().is_terminal() {
                self.conversion_finished(conversion.id());
            }
            conversion.notify_listeners();
        }

        if self.in_progress.is_empty() && self.waiting.is_empty() {
            self.running = false;
        }
    }

    fn conversion_finished(&mut self, id: u64) {
        self.in_progress.retain(|c| c.id() != id);
        while self.has_capacity() {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            self.in_progress.push(Arc::clone(&next));
            next.run();
        }
    }

    fn has_capacity(&self) -> bool {
        match self.simultaneous {
            Some(limit) => self.in_progress.len() < limit,
            None => true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn in_progress(&self) -> &[Arc<Conversion>] {
        &self.in_progress
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Stops every conversion this manager still holds, running or queued.
    pub fn stop_all(&mut self) {
        for conversion in self.in_progress.iter().chain(self.waiting.iter()) {
            conversion.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::ConversionStatus;
    use crate::probe::MediaInfo;
    use crate::progress::StatusUpdate;
    use std::ffi::OsString;
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    const QUICK_ENCODER: &str = r#"
sleep 0.3
echo '{"duration": 1.0, "progress": 0.5}'
sleep 0.3
printf converted > "$2"
echo '{"finished": true}'
"#;

    // Two updates in one burst, to observe drain coalescing.
    const BURSTY_ENCODER: &str = r#"
echo '{"duration": 10.0, "progress": 1.0}'
echo '{"duration": 10.0, "progress": 2.0}'
sleep 1
printf converted > "$2"
echo '{"finished": true}'
"#;

    struct ScriptPreset {
        script: PathBuf,
    }

    impl ScriptPreset {
        fn new(dir: &Path, body: &str) -> ScriptPreset {
            let script = dir.join("encoder.sh");
            fs::write(&script, body).unwrap();
            ScriptPreset { script }
        }
    }

    impl Preset for ScriptPreset {
        fn name(&self) -> &str {
            "Script"
        }

        fn identifier(&self) -> &str {
            "script"
        }

        fn extension(&self) -> &str {
            "out"
        }

        fn executable(&self) -> PathBuf {
            PathBuf::from("/bin/sh")
        }

        fn arguments(&self, input: &MediaFile, output: &Path) -> Vec<OsString> {
            vec![
                self.script.clone().into_os_string(),
                input.path.clone().into_os_string(),
                output.as_os_str().to_os_string(),
            ]
        }

        fn process_status_line(&self, line: &str) -> Option<StatusUpdate> {
            serde_json::from_str(line).ok()
        }
    }

    fn media_file(dir: &Path, name: &str) -> MediaFile {
        let path = dir.join(name);
        fs::write(&path, b"source").unwrap();
        MediaFile {
            path,
            info: MediaInfo::default(),
        }
    }

    fn spin(manager: &mut ConversionManager, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline && manager.is_running() {
            manager.check_notifications();
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_initial() {
        let manager = ConversionManager::new(None);
        assert!(!manager.is_running());
        assert!(manager.in_progress().is_empty());
        assert_eq!(manager.waiting_count(), 0);
    }

    #[test]
    fn test_multiple_simultaneous_conversions() {
        let dir = tempfile::tempdir().unwrap();
        let preset: Arc<dyn Preset> = Arc::new(ScriptPreset::new(dir.path(), QUICK_ENCODER));
        let mut manager = ConversionManager::new(None);

        let first = manager.start_conversion(media_file(dir.path(), "a.webm"), Arc::clone(&preset), None);
        let second = manager.start_conversion(media_file(dir.path(), "b.webm"), Arc::clone(&preset), None);
        assert_eq!(manager.in_progress().len(), 2);
        assert_eq!(manager.waiting_count(), 0);

        spin(&mut manager, Duration::from_secs(10));
        assert_eq!(first.status(), ConversionStatus::Finished);
        assert_eq!(second.status(), ConversionStatus::Finished);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_limit_simultaneous_conversions() {
        let dir = tempfile::tempdir().unwrap();
        let preset: Arc<dyn Preset> = Arc::new(ScriptPreset::new(dir.path(), QUICK_ENCODER));
        let mut manager = ConversionManager::new(Some(1));

        let first = manager.start_conversion(media_file(dir.path(), "a.webm"), Arc::clone(&preset), None);
        let second = manager.start_conversion(media_file(dir.path(), "b.webm"), Arc::clone(&preset), None);
        let third = manager.start_conversion(media_file(dir.path(), "c.webm"), Arc::clone(&preset), None);
        assert_eq!(manager.in_progress().len(), 1);
        assert_eq!(manager.waiting_count(), 2);

        // record the order jobs first report converting
        let started: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(vec![]));
        for conversion in [&first, &second, &third] {
            let sink = Arc::clone(&started);
            let id = conversion.id();
            conversion.listen(Box::new(move |c| {
                if c.state().status == ConversionStatus::Converting {
                    let mut started = sink.lock().unwrap();
                    if !started.contains(&id) {
                        started.push(id);
                    }
                }
            }));
        }

        spin(&mut manager, Duration::from_secs(20));
        assert_eq!(first.status(), ConversionStatus::Finished);
        assert_eq!(second.status(), ConversionStatus::Finished);
        assert_eq!(third.status(), ConversionStatus::Finished);

        // strict submission order, one at a time
        let started = started.lock().unwrap();
        assert_eq!(*started, vec![first.id(), second.id(), third.id()]);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let preset: Arc<dyn Preset> = Arc::new(ScriptPreset::new(dir.path(), QUICK_ENCODER));
        let mut manager = ConversionManager::new(Some(2));

        for name in ["a.webm", "b.webm", "c.webm", "d.webm", "e.webm"] {
            manager.start_conversion(media_file(dir.path(), name), Arc::clone(&preset), None);
        }

        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline && manager.is_running() {
            assert!(manager.in_progress().len() <= 2);
            manager.check_notifications();
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!manager.is_running());
        assert_eq!(manager.waiting_count(), 0);
    }

    #[test]
    fn test_notifications_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let preset: Arc<dyn Preset> = Arc::new(ScriptPreset::new(dir.path(), BURSTY_ENCODER));
        let mut manager = ConversionManager::new(None);

        let conversion =
            manager.start_conversion(media_file(dir.path(), "a.webm"), Arc::clone(&preset), None);
        let calls = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&calls);
        conversion.listen(Box::new(move |c| {
            sink.lock().unwrap().push(c.state().progress);
        }));

        // let both updates land before the first drain
        thread::sleep(Duration::from_millis(500));
        manager.check_notifications();
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0], Some(2.0));
        }

        spin(&mut manager, Duration::from_secs(10));
        assert_eq!(conversion.status(), ConversionStatus::Finished);
    }
}
