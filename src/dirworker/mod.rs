use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::decoders::{self, Decoder, DecodingState};
use crate::image::{
    is_jpeg_extension, is_raw_extension, is_tiff_extension, FileStat, Image,
};
use crate::model::ImageModel;
use crate::pool::{DecodePool, Priority, StateFuture};

mod error;

pub use error::{DirWorkerError, DirWorkerErrorCode, DirWorkerResult};

/// Quiet period after a filesystem notification before the directory is
/// reconciled against the model.
const RECONCILE_DEBOUNCE: Duration = Duration::from_secs(1);

enum WorkerMsg {
    ChangeDir { dir: PathBuf, future: StateFuture },
    DirChanged(PathBuf),
    ReconcileRequest,
    Shutdown,
}

struct WorkerShared {
    discovery: Mutex<Option<StateFuture>>,
}

/// Background thread discovering directories, pairing RAW files with their
/// developed siblings, feeding the model and keeping it reconciled with
/// filesystem changes.
pub struct DirectoryWorker {
    tx: Sender<WorkerMsg>,
    shared: Arc<WorkerShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DirectoryWorker {
    pub fn new(model: ImageModel, pool: Arc<DecodePool>) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(WorkerShared {
            discovery: Mutex::new(None),
        });
        let worker_tx = tx.clone();
        let thread = std::thread::Builder::new()
            .name("directory-worker".to_string())
            .spawn(move || {
                let mut worker = Worker {
                    model,
                    pool,
                    tx: worker_tx,
                    current_dir: None,
                    known: HashMap::new(),
                    watcher: None,
                    reconcile_due: None,
                };
                worker.run(rx);
            })
            .expect("failed to spawn the directory worker thread");
        Self {
            tx,
            shared,
            thread: Some(thread),
        }
    }

    /// Switches the worker to `dir`. A discovery still in flight is
    /// cancelled and awaited first; the returned future resolves FullImage
    /// on success, Cancelled, or Error with a captured message.
    pub fn change_dir(&self, dir: &Path) -> StateFuture {
        {
            let mut discovery = match self.shared.discovery.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(previous) = discovery.take() {
                if !previous.is_finished() {
                    previous.cancel();
                    previous.wait();
                }
            }
            let future = StateFuture::new();
            *discovery = Some(future.clone());
            let _ = self.tx.send(WorkerMsg::ChangeDir {
                dir: dir.to_path_buf(),
                future: future.clone(),
            });
            future
        }
    }

    /// Schedules a reconcile of the active directory as if a watch event
    /// had fired (a view's explicit refresh).
    pub fn request_reconcile(&self) {
        let _ = self.tx.send(WorkerMsg::ReconcileRequest);
    }
}

impl Drop for DirectoryWorker {
    fn drop(&mut self) {
        if let Some(previous) = match self.shared.discovery.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
        .take()
        {
            previous.cancel();
        }
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Filename split into stem and lowercased suffix; pairing groups by stem.
fn split_stem_suffix(name: &Path) -> (OsString, String) {
    let stem = name
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| name.as_os_str().to_os_string());
    let suffix = name
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    (stem, suffix)
}

fn sibling_flags(own_suffix: &str, group: &[String]) -> (bool, bool, bool) {
    let mut jpeg = false;
    let mut tiff = false;
    let mut raw = false;
    let mut own_seen = false;
    for suffix in group {
        if !own_seen && suffix == own_suffix {
            // the file is not its own sibling; skip one occurrence
            own_seen = true;
            continue;
        }
        jpeg |= is_jpeg_extension(suffix);
        tiff |= is_tiff_extension(suffix);
        raw |= is_raw_extension(suffix);
    }
    (jpeg, tiff, raw)
}

struct Worker {
    model: ImageModel,
    pool: Arc<DecodePool>,
    tx: Sender<WorkerMsg>,
    current_dir: Option<PathBuf>,
    /// Everything the model currently knows about, keyed by path. Kept
    /// here so reconciliation never has to iterate the model under its
    /// lock.
    known: HashMap<PathBuf, Arc<Image>>,
    watcher: Option<RecommendedWatcher>,
    reconcile_due: Option<Instant>,
}

impl Worker {
    fn run(&mut self, rx: Receiver<WorkerMsg>) {
        loop {
            let timeout = self
                .reconcile_due
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(500));
            match rx.recv_timeout(timeout) {
                Ok(WorkerMsg::ChangeDir { dir, future }) => {
                    self.reconcile_due = None;
                    self.discover(dir, &future);
                }
                Ok(WorkerMsg::DirChanged(path)) => {
                    if Some(path.as_path()) == self.current_dir.as_deref() {
                        self.reconcile_due = Some(Instant::now() + RECONCILE_DEBOUNCE);
                    }
                }
                Ok(WorkerMsg::ReconcileRequest) => {
                    if self.current_dir.is_some() {
                        self.reconcile_due = Some(Instant::now() + RECONCILE_DEBOUNCE);
                    }
                }
                Ok(WorkerMsg::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.reconcile_due.map(|d| Instant::now() >= d).unwrap_or(false) {
                        self.reconcile_due = None;
                        self.reconcile();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.watcher = None;
    }

    fn discover(&mut self, dir: PathBuf, future: &StateFuture) {
        future.mark_started();
        self.watcher = None;
        self.current_dir = Some(dir.clone());
        self.known.clear();

        let result = self.discover_impl(&dir, future);
        match result {
            Ok(readable) => {
                info!(
                    dir = %dir.display(),
                    images = readable,
                    "directory successfully loaded"
                );
                future.finish(DecodingState::FullImage);
            }
            Err(e) if e.is_cancellation() => {
                future.finish(DecodingState::Cancelled);
            }
            Err(e) => {
                future.set_progress(100, &e.to_string());
                future.finish(DecodingState::Error);
            }
        }
    }

    fn poll_cancel(future: &StateFuture) -> Result<(), DiscoveryAbort> {
        if future.is_cancel_requested() {
            Err(DiscoveryAbort::Cancelled)
        } else {
            Ok(())
        }
    }

    fn discover_impl(&mut self, dir: &Path, future: &StateFuture) -> Result<u32, DiscoveryAbort> {
        Self::poll_cancel(future)?;
        future.set_progress(0, "Clearing model");
        self.model.clear(&self.pool);

        future.set_progress(0, "Looking up directory");
        if !dir.is_dir() {
            return Err(DiscoveryAbort::Failed(DirWorkerError::new(
                DirWorkerErrorCode::DirectoryMissing,
                "Directory does not exist",
            )));
        }
        let entries = std::fs::read_dir(dir).map_err(|e| {
            DiscoveryAbort::Failed(DirWorkerError::new(
                DirWorkerErrorCode::DirectoryUnreadable,
                format!("Cannot read directory: {e}"),
            ))
        })?;

        // group by stem so RAW+JPEG+TIFF families land next to each other
        let mut groups: HashMap<OsString, Vec<(PathBuf, FileStat, String)>> = HashMap::new();
        let mut total = 0usize;
        for entry in entries {
            Self::poll_cancel(future)?;
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let (stem, suffix) = split_stem_suffix(&path);
            groups
                .entry(stem)
                .or_default()
                .push((path, FileStat::of(&meta), suffix));
            total += 1;
        }

        self.start_watching(dir);

        let msg = format!("Loading {total} directory entries");
        future.set_progress(0, &msg);
        let mut readable: u32 = 0;
        let mut processed = 0usize;
        for (_, group) in groups {
            let suffixes: Vec<String> = group.iter().map(|(_, _, s)| s.clone()).collect();
            for (path, stat, suffix) in group {
                Self::poll_cancel(future)?;
                if self.add_file(path, stat, &suffix, &suffixes) {
                    readable += 1;
                }
                processed += 1;
                if total > 0 {
                    future.set_progress((processed * 100 / total).min(100) as u8, &msg);
                }
            }
        }

        future.set_progress(
            100,
            &format!(
                "Directory successfully loaded; discovered {readable} readable images of a total of {total} entries"
            ),
        );
        Ok(readable)
    }

    /// Creates the Image (and decoder when a backend accepts the file) and
    /// hands both to the model. Returns whether a decoder was attached.
    fn add_file(&mut self, path: PathBuf, stat: FileStat, suffix: &str, group: &[String]) -> bool {
        let image = Image::new(path.clone(), stat);
        let (jpeg, tiff, raw) = sibling_flags(suffix, group);
        image.set_siblings(jpeg, tiff, raw);
        self.known.insert(path, image.clone());

        let decoder = decoders::create_decoder(&image);
        let Some(decoder) = decoder else {
            image.lookup_icon_from_file_type();
            self.model.welcome_image(image, None, None);
            return false;
        };

        let (section_field, _, image_field, _) = self.model.sort_config();
        let watcher = if section_field.needs_metadata() || image_field.needs_metadata() {
            // placement depends on EXIF: load it before the insert
            if let Err(e) = self.sync_metadata_decode(&decoder) {
                debug!(path = %image.path().display(), "metadata decode failed: {e}");
            }
            None
        } else {
            Some(decoder.decode_async(
                &self.pool,
                DecodingState::Metadata,
                Priority::Background,
                None,
                None,
            ))
        };
        self.model.welcome_image(image, Some(decoder), watcher);
        true
    }

    fn sync_metadata_decode(&self, decoder: &Arc<Decoder>) -> crate::decoders::DecodeResult<()> {
        decoder.open()?;
        decoder.decode(DecodingState::Metadata, None, None);
        decoder.close()
    }

    fn start_watching(&mut self, dir: &Path) {
        let tx = self.tx.clone();
        let watched = dir.to_path_buf();
        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                match event.kind {
                    EventKind::Create(_)
                    | EventKind::Modify(_)
                    | EventKind::Remove(_)
                    | EventKind::Any
                    | EventKind::Other => {
                        let _ = tx.send(WorkerMsg::DirChanged(watched.clone()));
                    }
                    _ => {}
                }
            }
        });
        match watcher {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                    warn!(
                        "{}",
                        DirWorkerError::new(
                            DirWorkerErrorCode::WatchPath,
                            format!("Failed to watch path {}: {e}", dir.display()),
                        )
                    );
                } else {
                    self.watcher = Some(watcher);
                }
            }
            Err(e) => warn!(
                "{}",
                DirWorkerError::new(
                    DirWorkerErrorCode::WatcherCreate,
                    format!("Failed to create watcher: {e}"),
                )
            ),
        }
    }

    /// Debounced watch follow-up: drop entries whose stat says they are
    /// gone, add newly present ones, and refresh sibling flags of the
    /// affected stem families.
    fn reconcile(&mut self) {
        let Some(dir) = self.current_dir.clone() else {
            return;
        };
        debug!(dir = %dir.display(), "reconciling directory");

        let mut touched_stems: Vec<OsString> = Vec::new();

        let known_paths: Vec<PathBuf> = self.known.keys().cloned().collect();
        for path in known_paths {
            // stat fresh; cached existence is outdated after deletions
            if std::fs::symlink_metadata(&path).is_err() {
                self.model.remove_image(&self.pool, &path);
                self.known.remove(&path);
                touched_stems.push(split_stem_suffix(&path).0);
            }
        }

        let mut new_entries: Vec<(PathBuf, FileStat)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if self.known.contains_key(&path) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                new_entries.push((path, FileStat::of(&meta)));
            }
        }

        for (path, stat) in new_entries {
            let (stem, suffix) = split_stem_suffix(&path);
            let group = self.group_suffixes(&stem, Some(suffix.clone()));
            self.add_file(path, stat, &suffix, &group);
            touched_stems.push(stem);
        }

        touched_stems.sort();
        touched_stems.dedup();
        for stem in touched_stems {
            self.refresh_sibling_flags(&stem);
        }
    }

    fn group_suffixes(&self, stem: &OsString, extra: Option<String>) -> Vec<String> {
        let mut suffixes: Vec<String> = self
            .known
            .keys()
            .filter(|p| &split_stem_suffix(p).0 == stem)
            .map(|p| split_stem_suffix(p).1)
            .collect();
        if let Some(extra) = extra {
            suffixes.push(extra);
        }
        suffixes
    }

    fn refresh_sibling_flags(&self, stem: &OsString) {
        let members: Vec<(Arc<Image>, String)> = self
            .known
            .iter()
            .filter(|(p, _)| &split_stem_suffix(p).0 == stem)
            .map(|(p, img)| (img.clone(), split_stem_suffix(p).1))
            .collect();
        let suffixes: Vec<String> = members.iter().map(|(_, s)| s.clone()).collect();
        for (image, suffix) in members {
            let (jpeg, tiff, raw) = sibling_flags(&suffix, &suffixes);
            let changed = image.has_jpeg_sibling() != jpeg
                || image.has_tiff_sibling() != tiff
                || image.has_raw_sibling() != raw;
            if changed {
                image.set_siblings(jpeg, tiff, raw);
                self.model.notify_image_flags_changed(image.id());
            }
        }
    }
}

enum DiscoveryAbort {
    Cancelled,
    Failed(DirWorkerError),
}

impl DiscoveryAbort {
    fn is_cancellation(&self) -> bool {
        matches!(self, DiscoveryAbort::Cancelled)
    }
}

impl std::fmt::Display for DiscoveryAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryAbort::Cancelled => write!(f, "cancelled"),
            DiscoveryAbort::Failed(e) => write!(f, "Exception occurred while loading the directory: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_and_suffixes_split_case_insensitively() {
        let (stem, suffix) = split_stem_suffix(Path::new("/d/IMG_0042.CR2"));
        assert_eq!(stem, OsString::from("IMG_0042"));
        assert_eq!(suffix, "cr2");

        let (stem, suffix) = split_stem_suffix(Path::new("/d/noext"));
        assert_eq!(stem, OsString::from("noext"));
        assert_eq!(suffix, "");
    }

    #[test]
    fn sibling_flags_skip_the_file_itself() {
        let group = vec!["cr2".to_string(), "jpg".to_string()];
        assert_eq!(sibling_flags("cr2", &group), (true, false, false));
        assert_eq!(sibling_flags("jpg", &group), (false, false, true));

        // a lone jpg is not its own sibling
        let solo = vec!["jpg".to_string()];
        assert_eq!(sibling_flags("jpg", &solo), (false, false, false));

        // but twin jpgs (jpg + jpeg) pair up
        let twins = vec!["jpg".to_string(), "jpeg".to_string()];
        assert_eq!(sibling_flags("jpg", &twins), (true, false, false));
    }
}
