//! Bounded-concurrency extraction of archive entries.
//!
//! A job runs one coordinator thread and `n` worker threads. The coordinator
//! owns the selection queue and all counters; workers receive entry ids over
//! a channel, write the file and report back. Each completion lets the
//! coordinator dispatch one more entry unless the job was cancelled, so at
//! most `n` entries are in flight.

use std::collections::VecDeque;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use sysinfo::Disks;
use tracing::{debug, info, trace, warn};

use crate::archive::{Archive, ExtractionClaim};
use crate::entry::EntryId;
use crate::{Error, Result};

/// Shared cancellation flag of one job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Default number of undelivered events held for a job.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What to extract and where.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Output directory.
    pub target: PathBuf,
    /// Archive path prefix stripped from every output path.
    pub root: String,
    /// Decode compressed entries; raw bytes are written otherwise.
    pub decompress: bool,
    pub selection: Vec<EntryId>,
    /// Entries whose path matches are dropped from the selection.
    pub ignore: Option<glob::Pattern>,
    /// Worker count; host parallelism when `None`.
    pub workers: Option<usize>,
    pub check_disk_space: bool,
    /// Token to share with the caller; a fresh one when `None`.
    pub token: Option<CancellationToken>,
    /// Events queued for the caller before newer ones are dropped.
    pub event_capacity: usize,
}

impl ExtractionRequest {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            root: "/".to_string(),
            decompress: true,
            selection: Vec::new(),
            ignore: None,
            workers: None,
            check_disk_space: true,
            token: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    pub fn select(mut self, ids: impl IntoIterator<Item = EntryId>) -> Self {
        self.selection.extend(ids);
        self
    }

    pub fn ignore(mut self, pattern: glob::Pattern) -> Self {
        self.ignore = Some(pattern);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn check_disk_space(mut self, check: bool) -> Self {
        self.check_disk_space = check;
        self
    }

    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// Final state of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExtractionReport {
    /// Entries selected after filtering.
    pub total: usize,
    pub dispatched: usize,
    /// Completed entries, successful or not.
    pub processed: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
    /// One line per failure.
    pub log: Vec<String>,
}

impl ExtractionReport {
    pub fn succeeded(&self) -> usize {
        self.processed - self.failed
    }
}

/// Progress notifications of a job, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionEvent {
    Started { total: usize, workers: usize },
    Progress { processed: usize, failed: usize, total: usize, path: String },
    Failed { path: String, error: String },
    Stopping { dispatched: usize, processed: usize },
    Finished(ExtractionReport),
}

/// Handle to a running extraction.
pub struct ExtractionJob {
    token: CancellationToken,
    events: Receiver<ExtractionEvent>,
    coordinator: JoinHandle<ExtractionReport>,
}

impl ExtractionJob {
    /// Stop dispatching; entries already handed to workers still complete.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Event stream of the job. The queue is bounded and the job never waits
    /// on it; events arriving while it is full are dropped. The report from
    /// [`wait`](Self::wait) is always complete.
    pub fn events(&self) -> &Receiver<ExtractionEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.coordinator.is_finished()
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<ExtractionReport> {
        self.coordinator
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("extraction coordinator panicked")))
    }
}

impl std::fmt::Debug for ExtractionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionJob")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct WorkItem {
    id: EntryId,
}

struct Completion {
    id: EntryId,
    path: String,
    result: Result<PathBuf>,
}

/// Settings shared by all workers of a job.
struct JobContext {
    target: PathBuf,
    root: String,
    decompress: bool,
}

impl Archive {
    /// Start extracting `request.selection` in the background.
    ///
    /// Fails immediately when another job runs on this archive or the target
    /// disk lacks space for the selection.
    pub fn extract(self: &Arc<Self>, request: ExtractionRequest) -> Result<ExtractionJob> {
        let claim = self
            .begin_extraction()
            .ok_or_else(|| Error::ExtractionInProgress(self.path().to_path_buf()))?;

        let mut selection = request.selection;
        if let Some(pattern) = &request.ignore {
            let before = selection.len();
            selection.retain(|id| match self.entry(*id) {
                Some(entry) => !pattern.matches(entry.path()),
                None => true,
            });
            debug!(ignored = before - selection.len(), pattern = %pattern, "applied ignore pattern");
        }

        if request.check_disk_space {
            let required: u64 = selection
                .iter()
                .filter_map(|id| self.entry(*id))
                .map(|e| e.content_size(request.decompress))
                .sum();
            admit(required, available_space(&request.target))?;
        }

        let workers = worker_count(request.workers);
        let token = request.token.unwrap_or_default();
        let (event_tx, event_rx) = bounded(request.event_capacity.max(1));
        let context = JobContext {
            target: request.target,
            root: request.root,
            decompress: request.decompress,
        };

        let job_token = token.clone();
        let coordinator = thread::Builder::new()
            .name("mnf-extract".to_string())
            .spawn(move || run_job(claim, context, selection, workers, job_token, event_tx))?;

        Ok(ExtractionJob {
            token,
            events: event_rx,
            coordinator,
        })
    }
}

fn emit(events: &Sender<ExtractionEvent>, event: ExtractionEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        trace!(?event, "event queue full, dropping");
    }
}

fn run_job(
    claim: ExtractionClaim,
    context: JobContext,
    selection: Vec<EntryId>,
    workers: usize,
    token: CancellationToken,
    events: Sender<ExtractionEvent>,
) -> ExtractionReport {
    let start = Instant::now();
    let archive = Arc::clone(claim.archive());
    let context = Arc::new(context);
    let total = selection.len();
    let mut queue: VecDeque<EntryId> = selection.into();

    let (work_tx, work_rx) = unbounded::<WorkItem>();
    let (done_tx, done_rx) = unbounded::<Completion>();
    let pool: Vec<JoinHandle<()>> = (0..workers)
        .map(|_| {
            let archive = Arc::clone(&archive);
            let context = Arc::clone(&context);
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                for item in work_rx.iter() {
                    let path = archive
                        .entry(item.id)
                        .map(|e| e.path().to_string())
                        .unwrap_or_else(|| format!("<entry {}>", item.id));
                    let result = extract_one(&archive, &context, item.id);
                    if done_tx
                        .send(Completion {
                            id: item.id,
                            path,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
        })
        .collect();
    drop(done_tx);

    let mut report = ExtractionReport {
        total,
        ..Default::default()
    };
    let mut pending = 0usize;
    let mut stopping = false;

    let dispatch = |queue: &mut VecDeque<EntryId>, pending: &mut usize, report: &mut ExtractionReport| {
        match queue.pop_front() {
            Some(id) if work_tx.send(WorkItem { id }).is_ok() => {
                *pending += 1;
                report.dispatched += 1;
                true
            }
            _ => false,
        }
    };

    for _ in 0..workers {
        if token.is_cancelled() || !dispatch(&mut queue, &mut pending, &mut report) {
            break;
        }
    }

    info!(archive = %archive.path().display(), total, workers, "extraction started");
    emit(&events, ExtractionEvent::Started { total, workers });
    if token.is_cancelled() {
        stopping = true;
        emit(
            &events,
            ExtractionEvent::Stopping {
                dispatched: report.dispatched,
                processed: report.processed,
            },
        );
    }

    while pending > 0 {
        let Ok(done) = done_rx.recv() else {
            warn!("extraction workers exited early");
            break;
        };
        pending -= 1;
        report.processed += 1;

        if let Err(e) = &done.result {
            report.failed += 1;
            let line = format!("{}: {}", done.path, e);
            warn!(entry = done.id, "extraction failed: {}", line);
            report.log.push(line);
            emit(
                &events,
                ExtractionEvent::Failed {
                    path: done.path.clone(),
                    error: e.to_string(),
                },
            );
        }

        emit(
            &events,
            ExtractionEvent::Progress {
                processed: report.processed,
                failed: report.failed,
                total,
                path: done.path,
            },
        );

        if token.is_cancelled() {
            if !stopping {
                stopping = true;
                emit(
                    &events,
                    ExtractionEvent::Stopping {
                        dispatched: report.dispatched,
                        processed: report.processed,
                    },
                );
            }
        } else {
            dispatch(&mut queue, &mut pending, &mut report);
        }
    }

    drop(dispatch);
    drop(work_tx);
    for handle in pool {
        handle.join().ok();
    }

    report.cancelled = token.is_cancelled() && report.dispatched < total;
    report.elapsed = start.elapsed();
    info!(
        processed = report.processed,
        failed = report.failed,
        cancelled = report.cancelled,
        elapsed = ?report.elapsed,
        "extraction finished"
    );

    drop(claim);
    emit(&events, ExtractionEvent::Finished(report.clone()));
    report
}

fn extract_one(archive: &Archive, context: &JobContext, id: EntryId) -> Result<PathBuf> {
    let entry = archive
        .entry(id)
        .filter(|e| archive.is_live(e.id))
        .ok_or_else(|| Error::EntryNotFound(format!("live entry {}", id)))?;

    let relative = entry.relative_path(&context.root).ok_or_else(|| Error::RootMismatch {
        path: entry.path().to_string(),
        root: context.root.clone(),
    })?;
    let output = output_path(&context.target, relative)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = archive.content(entry, context.decompress)?;
    fs::write(&output, &data)?;

    Ok(output)
}

/// Join an archive-relative path onto `target`, refusing to leave it.
fn output_path(target: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::Format(format!(
            "refusing to write outside the target: {}",
            relative.display()
        )));
    }
    Ok(target.join(relative))
}

fn worker_count(requested: Option<usize>) -> usize {
    requested
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
        .max(1)
}

/// Disk-space admission; unknown free space is admitted.
pub fn admit(required: u64, available: Option<u64>) -> Result<()> {
    match available {
        Some(available) if available < required => {
            Err(Error::InsufficientDiskSpace { required, available })
        }
        _ => Ok(()),
    }
}

/// Free space of the disk holding `target`, if it can be determined.
pub fn available_space(target: &Path) -> Option<u64> {
    // the target may not exist yet
    let existing = target.ancestors().find(|p| p.exists())?;
    let existing = existing.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| existing.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveOptions;
    use crate::codec::{ContentDecompressor, DecompressRequest, ZstdDecompressor};
    use crate::container::CarrierStrategy;
    use crate::error::CodecError;
    use crate::testutil::{BuiltArchive, EntrySpec, IndexBuilder, TableBuilder};

    fn archive_with_files(count: u32) -> (BuiltArchive, Arc<Archive>) {
        let mut table = TableBuilder::new();
        for i in 0..count {
            table = table.row(100 + i, &format!("/data/dir{}/file{}.bin", i % 3, i));
        }
        table = table.row(999, "/other/outside.bin");

        let mut builder = IndexBuilder::new("game.mnf").entry(EntrySpec::stored(0, &table.build()));
        for i in 0..count {
            let content = format!("content of file {}", i).repeat(i as usize + 1);
            builder = if i % 2 == 0 {
                builder.entry(EntrySpec::stored(100 + i, content.as_bytes()))
            } else {
                builder.entry(EntrySpec::zstd(100 + i, content.as_bytes()))
            };
        }
        builder = builder.entry(EntrySpec::stored(999, b"outside"));

        let built = builder.write();
        let archive = Arc::new(Archive::open(&built.index).unwrap());
        (built, archive)
    }

    fn selection(archive: &Archive, root: &str) -> Vec<EntryId> {
        archive.entries_in_folder(root).iter().map(|e| e.id).collect()
    }

    fn read_tree(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files: Vec<(PathBuf, Vec<u8>)> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_worker_counts_give_identical_output() {
        let n = 7;
        let (_built, archive) = archive_with_files(n);
        let ids = selection(&archive, "/data");
        assert_eq!(ids.len(), n as usize);

        let mut trees = Vec::new();
        for workers in [1, n as usize, 2 * n as usize] {
            let out = tempfile::tempdir().unwrap();
            let request = ExtractionRequest::new(out.path())
                .root("/data")
                .select(ids.clone())
                .workers(workers)
                .check_disk_space(false);

            let report = archive.extract(request).unwrap().wait().unwrap();
            assert_eq!(report.processed, n as usize);
            assert_eq!(report.failed, 0);
            assert!(!report.cancelled);
            trees.push(read_tree(out.path()));
        }

        assert_eq!(trees[0].len(), n as usize);
        assert!(trees[0].iter().any(|(p, _)| p == Path::new("dir0/file0.bin")));
        assert_eq!(trees[0], trees[1]);
        assert_eq!(trees[1], trees[2]);
    }

    #[test]
    fn test_undrained_events_do_not_stall_the_job() {
        let (_built, archive) = archive_with_files(7);
        let ids = selection(&archive, "/data");
        let out = tempfile::tempdir().unwrap();

        let job = archive
            .extract(
                ExtractionRequest::new(out.path())
                    .root("/data")
                    .select(ids)
                    .workers(2)
                    .event_capacity(2)
                    .check_disk_space(false),
            )
            .unwrap();
        let events = job.events().clone();
        let report = job.wait().unwrap();

        assert_eq!(report.processed, 7);
        assert_eq!(read_tree(out.path()).len(), 7);
        let queued: Vec<ExtractionEvent> = events.try_iter().collect();
        assert_eq!(queued.len(), 2);
        assert!(matches!(queued[0], ExtractionEvent::Started { total: 7, .. }));
    }

    #[test]
    fn test_extracted_content_is_decoded() {
        let (_built, archive) = archive_with_files(2);
        let out = tempfile::tempdir().unwrap();
        let id = archive.find("/data/dir1/file1.bin").unwrap().id;

        let report = archive
            .extract(ExtractionRequest::new(out.path()).select([id]).check_disk_space(false))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.succeeded(), 1);

        let written = fs::read(out.path().join("data/dir1/file1.bin")).unwrap();
        assert_eq!(written, "content of file 1".repeat(2).into_bytes());
    }

    #[test]
    fn test_root_mismatch_fails_single_file() {
        let (_built, archive) = archive_with_files(3);
        let mut ids = selection(&archive, "/data");
        ids.push(archive.find("/other/outside.bin").unwrap().id);

        let out = tempfile::tempdir().unwrap();
        let job = archive
            .extract(
                ExtractionRequest::new(out.path())
                    .root("/data")
                    .select(ids)
                    .workers(2)
                    .check_disk_space(false),
            )
            .unwrap();
        let events = job.events().clone();
        let report = job.wait().unwrap();

        assert_eq!(report.processed, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.log.len(), 1);
        assert!(report.log[0].contains("/other/outside.bin"));
        assert_eq!(read_tree(out.path()).len(), 3);

        let events: Vec<ExtractionEvent> = events.try_iter().collect();
        assert!(matches!(events.first(), Some(ExtractionEvent::Started { total: 4, workers: 2 })));
        assert!(matches!(events.last(), Some(ExtractionEvent::Finished(r)) if r == &report));
        assert_eq!(
            events.iter().filter(|e| matches!(e, ExtractionEvent::Failed { .. })).count(),
            1
        );
    }

    /// Archive whose compressed entries block until the gate is opened.
    fn gated_archive(count: u32) -> (BuiltArchive, Arc<Archive>, Sender<()>) {
        let mut table = TableBuilder::new();
        let mut builder = IndexBuilder::new("custom.mnf");
        for i in 0..count {
            table = table.row(i + 1, &format!("/gated/file{}.bin", i));
            builder = builder.entry(EntrySpec::zstd(i + 1, format!("gated {}", i).as_bytes()));
        }
        let built = builder.entry(EntrySpec::stored(0xABCD, &table.build())).write();

        let (gate_tx, gate_rx) = unbounded::<()>();
        let codec = move |req: &DecompressRequest<'_>| -> std::result::Result<Vec<u8>, CodecError> {
            gate_rx.recv()?;
            ZstdDecompressor.decompress(req)
        };
        let options = ArchiveOptions::default()
            .with_carrier(CarrierStrategy::FileId(0xABCD))
            .with_decompressor(Arc::new(codec));
        let archive = Arc::new(Archive::open_with(&built.index, options).unwrap());
        (built, archive, gate_tx)
    }

    #[test]
    fn test_cancelled_token_dispatches_nothing() {
        let (_built, archive) = archive_with_files(5);
        let ids = selection(&archive, "/data");
        let out = tempfile::tempdir().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let job = archive
            .extract(
                ExtractionRequest::new(out.path())
                    .root("/data")
                    .select(ids)
                    .token(token)
                    .check_disk_space(false),
            )
            .unwrap();
        let events = job.events().clone();
        let report = job.wait().unwrap();

        assert_eq!(report.dispatched, 0);
        assert_eq!(report.processed, 0);
        assert!(report.cancelled);
        assert!(read_tree(out.path()).is_empty());
        assert!(events
            .try_iter()
            .any(|e| matches!(e, ExtractionEvent::Stopping { dispatched: 0, .. })));
    }

    #[test]
    fn test_stop_lets_in_flight_work_finish() {
        let (_built, archive, gate) = gated_archive(5);
        let ids: Vec<EntryId> = archive.entries_in_folder("/gated").iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 5);
        let out = tempfile::tempdir().unwrap();

        let job = archive
            .extract(
                ExtractionRequest::new(out.path())
                    .root("/gated")
                    .select(ids)
                    .workers(1)
                    .check_disk_space(false),
            )
            .unwrap();

        // the initial batch is dispatched before Started is sent
        let started = job.events().recv().unwrap();
        assert!(matches!(started, ExtractionEvent::Started { total: 5, workers: 1 }));
        job.stop();
        for _ in 0..5 {
            gate.send(()).unwrap();
        }
        let report = job.wait().unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
        assert!(report.cancelled);
        assert_eq!(read_tree(out.path()).len(), 1);
    }

    #[test]
    fn test_one_job_per_archive() {
        let (_built, archive, gate) = gated_archive(2);
        let ids: Vec<EntryId> = archive.entries_in_folder("/gated").iter().map(|e| e.id).collect();
        let out = tempfile::tempdir().unwrap();

        let job = archive
            .extract(
                ExtractionRequest::new(out.path())
                    .root("/gated")
                    .select(ids.clone())
                    .workers(1)
                    .check_disk_space(false),
            )
            .unwrap();
        assert!(archive.is_extracting());

        let second = archive.extract(ExtractionRequest::new(out.path()).select(ids.clone()));
        assert!(matches!(second, Err(Error::ExtractionInProgress(_))));

        for _ in 0..2 {
            gate.send(()).unwrap();
        }
        let report = job.wait().unwrap();
        assert_eq!(report.processed, 2);
        assert!(!archive.is_extracting());
    }

    #[test]
    fn test_ignore_pattern_filters_selection() {
        let (_built, archive) = archive_with_files(6);
        let ids = selection(&archive, "/data");
        let out = tempfile::tempdir().unwrap();

        let report = archive
            .extract(
                ExtractionRequest::new(out.path())
                    .root("/data")
                    .select(ids)
                    .ignore(glob::Pattern::new("/data/dir0/*").unwrap())
                    .check_disk_space(false),
            )
            .unwrap()
            .wait()
            .unwrap();

        assert_eq!(report.total, 4);
        assert!(!out.path().join("dir0").exists());
    }

    #[test]
    fn test_admit() {
        assert!(admit(10, None).is_ok());
        assert!(admit(10, Some(10)).is_ok());
        assert!(matches!(
            admit(11, Some(10)),
            Err(Error::InsufficientDiskSpace {
                required: 11,
                available: 10
            })
        ));
    }

    #[test]
    fn test_output_path_stays_inside_target() {
        let target = Path::new("/out");
        assert_eq!(output_path(target, "a/b.txt").unwrap(), PathBuf::from("/out/a/b.txt"));
        assert!(output_path(target, "../escape.txt").is_err());
        assert!(output_path(target, "").is_err());
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(Some(0)), 1);
        assert_eq!(worker_count(Some(3)), 3);
        assert!(worker_count(None) >= 1);
    }
}
