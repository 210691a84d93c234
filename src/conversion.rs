use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::manager::NotifyQueue;
use crate::presets::Preset;
use crate::probe::MediaFile;
use crate::progress::StatusUpdate;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionStatus {
    Initialized,
    Converting,
    Staging,
    Finished,
    Failed,
    Canceled,
}

impl ConversionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConversionStatus::Finished | ConversionStatus::Failed | ConversionStatus::Canceled
        )
    }
}

pub type Listener = Box<dyn Fn(&Conversion) + Send + Sync>;

#[derive(Debug)]
struct Inner {
    status: ConversionStatus,
    error: Option<String>,
    duration: Option<f64>,
    progress: Option<f64>,
    progress_percent: Option<f64>,
    eta: Option<f64>,
    started_at: Option<Instant>,
}

/// One coherent read of a job's mutable fields, taken under its lock.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionState {
    pub status: ConversionStatus,
    pub error: Option<String>,
    pub duration: Option<f64>,
    pub progress: Option<f64>,
    pub progress_percent: Option<f64>,
    pub eta: Option<f64>,
}

/// One conversion job: spawns the encoder, follows its diagnostic stream,
/// and promotes the staged file when the encoder is done.
///
/// The job's own reader thread is the only writer of these fields; anyone
/// may read them between notifications, and `stop()` may be called from
/// anywhere at any time.
pub struct Conversion {
    id: u64,
    file: MediaFile,
    preset: Arc<dyn Preset>,
    output: PathBuf,
    inner: Mutex<Inner>,
    lines: Mutex<Vec<String>>,
    temp_output: Mutex<Option<PathBuf>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    cancel_requested: AtomicBool,
    child: Mutex<Option<Child>>,
    notify: Arc<NotifyQueue>,
    // handle to this conversion's own Arc, for posting itself to `notify`
    weak_self: Weak<Conversion>,
}

impl Conversion {
    pub(crate) fn new(
        file: MediaFile,
        preset: Arc<dyn Preset>,
        output_dir: Option<&Path>,
        notify: Arc<NotifyQueue>,
    ) -> Arc<Conversion> {
        let output_dir = match output_dir {
            Some(dir) => dir.to_path_buf(),
            None => file
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let output = output_dir.join(preset.output_filename(&file));
        Arc::new_cyclic(|weak_self| Conversion {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            file,
            preset,
            output,
            inner: Mutex::new(Inner {
                status: ConversionStatus::Initialized,
                error: None,
                duration: None,
                progress: None,
                progress_percent: None,
                eta: None,
                started_at: None,
            }),
            lines: Mutex::new(vec![]),
            temp_output: Mutex::new(None),
            listeners: Mutex::new(vec![]),
            next_listener_id: AtomicU64::new(1),
            cancel_requested: AtomicBool::new(false),
            child: Mutex::new(None),
            notify,
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file(&self) -> &MediaFile {
        &self.file
    }

    pub fn preset(&self) -> &Arc<dyn Preset> {
        &self.preset
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn status(&self) -> ConversionStatus {
        self.inner.lock().unwrap().status
    }

    pub fn state(&self) -> ConversionState {
        let inner = self.inner.lock().unwrap();
        ConversionState {
            status: inner.status,
            error: inner.error.clone(),
            duration: inner.duration,
            progress: inner.progress,
            progress_percent: inner.progress_percent,
            eta: inner.eta,
        }
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    pub fn duration(&self) -> Option<f64> {
        self.inner.lock().unwrap().duration
    }

    pub fn progress(&self) -> Option<f64> {
        self.inner.lock().unwrap().progress
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.inner.lock().unwrap().progress_percent
    }

    pub fn eta(&self) -> Option<f64> {
        self.inner.lock().unwrap().eta
    }

    /// Everything the encoder printed so far, for a full-log display.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn temp_output(&self) -> Option<PathBuf> {
        self.temp_output.lock().unwrap().clone()
    }

    pub fn listen(&self, listener: Listener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn unlisten(&self, listener_id: u64) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != listener_id);
    }

    pub(crate) fn notify_listeners(&self) {
        let listeners = self.listeners.lock().unwrap();
        for (_, listener) in listeners.iter() {
            listener(self);
        }
    }

    /// Kills the encoder and records the stop. Safe from any thread, a
    /// no-op once the job is terminal; the reader thread still carries the
    /// job through its normal teardown to the `Canceled` state.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status.is_terminal() {
                return;
            }
            inner.error = Some(String::from("manually stopped"));
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.kill_child();
    }

    fn kill_child(&self) {
        if let Some(child) = self.child.lock().unwrap().as_mut() {
            if let Err(err) = child.kill() {
                debug!(id = self.id, "error killing encoder: {}", err);
            }
        }
    }

    pub(crate) fn run(&self) {
        let Some(conversion) = self.weak_self.upgrade() else {
            return;
        };
        thread::spawn(move || conversion.run_to_completion());
    }

    fn run_to_completion(&self) {
        if self.cancel_requested.load(Ordering::SeqCst) {
            // stopped before the encoder ever started
            self.finalize(None);
            return;
        }

        let temp_output = match self.allocate_temp_output() {
            Ok(path) => {
                *self.temp_output.lock().unwrap() = Some(path.clone());
                Some(path)
            }
            Err(err) => {
                self.record_error(format!(
                    "unable to stage output for {:?}: {}",
                    self.output, err
                ));
                None
            }
        };

        if let Some(temp) = &temp_output {
            self.convert(temp);
        }
        self.finalize(temp_output.as_deref());
    }

    // A unique name next to the final output, so the promoting rename
    // stays on one volume. The encoder insists on creating the file
    // itself, so the placeholder is removed again immediately.
    fn allocate_temp_output(&self) -> io::Result<PathBuf> {
        let dir = match self.output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let placeholder = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(".partial")
            .tempfile_in(dir)?;
        let path = placeholder.into_temp_path().keep().map_err(|err| err.error)?;
        fs::remove_file(&path)?;
        Ok(path)
    }

    fn convert(&self, temp_output: &Path) {
        let executable = self.preset.executable();
        let mut command = Command::new(&executable);
        command
            .args(self.preset.arguments(&self.file, temp_output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(id = self.id, "spawning {:?}", command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    self.record_error(format!("{:?} does not exist", executable));
                } else {
                    self.record_error(err.to_string());
                }
                return;
            }
        };

        // The encoder interleaves diagnostics across both streams; a pump
        // per stream feeds them through one channel, line by line.
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, tx.clone());
        }
        drop(tx);

        *self.child.lock().unwrap() = Some(child);
        if self.cancel_requested.load(Ordering::SeqCst) {
            // stop() raced the spawn
            self.kill_child();
        }

        self.process_output(rx);

        if let Some(mut child) = self.child.lock().unwrap().take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    debug!(id = self.id, "encoder exited with {}", status);
                }
                Err(err) => warn!(id = self.id, "error waiting for encoder: {}", err),
                _ => {}
            }
        }
    }

    fn process_output(&self, lines: Receiver<String>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = ConversionStatus::Converting;
            inner.started_at = Some(Instant::now());
        }

        for line in lines {
            trace!(id = self.id, line = line.as_str(), "encoder output");
            self.lines.lock().unwrap().push(line.clone());
            let Some(update) = self.preset.process_status_line(&line) else {
                continue;
            };
            if self.apply_update(update) {
                break;
            }
        }
    }

    // Returns true once the stream said the job is over.
    fn apply_update(&self, update: StatusUpdate) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if update.finished {
            inner.error = update.error;
            return true;
        }

        let mut updated = false;
        if let Some(duration) = update.duration {
            inner.duration = Some(duration);
            if inner.progress.is_none() {
                inner.progress = Some(0.0);
            }
            updated = true;
        }
        if let Some(progress) = update.progress {
            inner.progress = Some(match inner.duration {
                // encoders overshoot the duration by a frame's rounding
                Some(duration) => progress.min(duration),
                None => progress,
            });
            updated = true;
        }
        if let Some(eta) = update.eta {
            inner.eta = Some(eta);
            updated = true;
        }

        if updated {
            let percent = match inner.duration {
                Some(duration) if duration > 0.0 => {
                    inner.progress.unwrap_or(0.0) / duration
                }
                _ => 0.0,
            };
            inner.progress_percent = Some(percent);
            if update.eta.is_none() {
                inner.eta = Some(derive_eta(percent, inner.started_at));
            }
            drop(inner);
            self.changed();
        }

        false
    }

    fn record_error(&self, message: String) {
        warn!(id = self.id, "conversion error: {}", message);
        self.inner.lock().unwrap().error = Some(message);
    }

    fn finalize(&self, temp_output: Option<&Path>) {
        let error = {
            let mut inner = self.inner.lock().unwrap();
            inner.progress = inner.duration;
            inner.progress_percent = Some(1.0);
            inner.eta = Some(0.0);
            inner.error.clone()
        };

        if error.is_none() {
            self.inner.lock().unwrap().status = ConversionStatus::Staging;
            self.changed();
            let promoted = match temp_output {
                Some(temp) => self.preset.finalize(temp, &self.output),
                None => Err(io::Error::other("no staged output file")),
            };
            match promoted {
                Ok(()) => {
                    debug!(id = self.id, "finished {}", self.output.display());
                    self.inner.lock().unwrap().status = ConversionStatus::Finished;
                }
                Err(err) => {
                    warn!(
                        id = self.id,
                        "error promoting {:?} to {:?}: {}", temp_output, self.output, err
                    );
                    if let Some(temp) = temp_output {
                        let _ = fs::remove_file(temp);
                    }
                    let mut inner = self.inner.lock().unwrap();
                    inner.error = Some(err.to_string());
                    inner.status = ConversionStatus::Failed;
                }
            }
        } else {
            // the encoder may never have created the file; ignore
            if let Some(temp) = temp_output {
                let _ = fs::remove_file(temp);
            }
            let mut inner = self.inner.lock().unwrap();
            inner.status = if self.cancel_requested.load(Ordering::SeqCst) {
                ConversionStatus::Canceled
            } else {
                ConversionStatus::Failed
            };
        }

        self.changed();
    }

    fn changed(&self) {
        if let Some(conversion) = self.weak_self.upgrade() {
            self.notify.add(conversion);
        }
    }
}

// The stream supplies an eta of its own or we extrapolate one from how
// long the completed share took.
fn derive_eta(percent: f64, started_at: Option<Instant>) -> f64 {
    if percent <= 0.0 || percent >= 1.0 {
        return 0.0;
    }
    let Some(started_at) = started_at else {
        return 0.0;
    };
    let progress_points = percent * 100.0;
    let elapsed = started_at.elapsed().as_secs_f64();
    let time_per_point = elapsed / progress_points;
    time_per_point * (100.0 - progress_points)
}

// Splits on carriage returns as well as newlines: the encoder redraws its
// stats line with bare \r while it runs.
fn spawn_line_pump<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let consumed = {
                let chunk = match reader.fill_buf() {
                    Ok([]) => break,
                    Ok(chunk) => chunk,
                    Err(_) => break,
                };
                for &byte in chunk {
                    if byte == b'\n' || byte == b'\r' {
                        if !pending.is_empty() {
                            let line = String::from_utf8_lossy(&pending).into_owned();
                            pending.clear();
                            if tx.send(line).is_err() {
                                return;
                            }
                        }
                    } else {
                        pending.push(byte);
                    }
                }
                chunk.len()
            };
            reader.consume(consumed);
        }
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
    });
}
