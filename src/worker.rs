//! A small two-tier worker pool for downloading manifest and media segments.
//!
//! One control worker serializes manifest-level work; N fetch workers download media segments in
//! parallel. Jobs travel over two rendezvous channels, so enqueueing a segment blocks until a
//! worker is free (natural backpressure). Closing the pool closes the control channel; the
//! control worker then closes the segment channel behind itself and every worker drains and
//! exits before `close` returns.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backoff::{retry_notify, ExponentialBackoff};
use fs_err as fs;
use std::io::Write;
use tracing::{debug, info, warn};
use url::Url;

use crate::{ContentType, MpdGrabError};

/// The HTTP client the workers download with: reqwest in blocking mode, since each worker is a
/// plain thread.
pub type HttpClient = reqwest::blocking::Client;

const MANIFEST_ACCEPT: &str = "application/dash+xml,video/vnd.mpeg.dash.mpd";

/// One segment to download. All jobs of a track share the `done` sender; the orchestrator drains
/// the paired receiver to wait for the whole track, so `done` plays the role of a per-track
/// wait-group that can also carry the failure.
pub struct SegmentJob {
    pub class: ContentType,
    pub url: Url,
    pub path: PathBuf,
    pub pos: usize,
    pub total: usize,
    pub done: Sender<SegmentOutcome>,
}

/// The terminal state of one segment job.
pub struct SegmentOutcome {
    pub pos: usize,
    pub path: PathBuf,
    pub error: Option<MpdGrabError>,
}

enum ControlJob {
    Manifest {
        url: String,
        path: PathBuf,
        reply: Sender<Result<PathBuf, MpdGrabError>>,
    },
    Segments(Vec<SegmentJob>),
}

/// The pool handle held by the orchestrator. Dropping it without calling [`WorkerPool::close`]
/// detaches the workers; `close` is the graceful path.
pub struct WorkerPool {
    control_tx: SyncSender<ControlJob>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start one control worker and `worker_count` fetch workers. The configuration is fixed for
    /// the lifetime of the pool.
    pub fn launch(client: HttpClient, worker_count: usize) -> WorkerPool {
        let (control_tx, control_rx) = mpsc::sync_channel::<ControlJob>(0);
        let (segment_tx, segment_rx) = mpsc::sync_channel::<SegmentJob>(0);
        let segment_rx = Arc::new(Mutex::new(segment_rx));

        let mut handles = Vec::with_capacity(worker_count + 1);
        let control_client = client.clone();
        let control = thread::Builder::new()
            .name("mpdgrab-control".to_string())
            .spawn(move || control_worker(control_rx, segment_tx, control_client))
            .expect("spawning control worker");
        handles.push(control);

        for id in 1..=worker_count {
            let rx = Arc::clone(&segment_rx);
            let client = client.clone();
            let h = thread::Builder::new()
                .name(format!("mpdgrab-fetch-{id}"))
                .spawn(move || fetch_worker(id, rx, client))
                .expect("spawning fetch worker");
            handles.push(h);
        }
        WorkerPool { control_tx, handles }
    }

    /// Download the manifest at `url` to `path` through the control worker, blocking until it is
    /// on disk.
    pub fn fetch_manifest(&self, url: &str, path: &Path) -> Result<PathBuf, MpdGrabError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.control_tx
            .send(ControlJob::Manifest {
                url: url.to_string(),
                path: path.to_path_buf(),
                reply: reply_tx,
            })
            .map_err(|_| MpdGrabError::ManifestFetch("worker pool is closed".to_string()))?;
        reply_rx.recv()
            .map_err(|_| MpdGrabError::ManifestFetch("control worker went away".to_string()))?
    }

    /// Hand a batch of segment jobs to the pool. The control worker feeds them one by one into
    /// the segment channel; completion is reported through each job's `done` sender.
    pub fn dispatch(&self, jobs: Vec<SegmentJob>) -> Result<(), MpdGrabError> {
        self.control_tx
            .send(ControlJob::Segments(jobs))
            .map_err(|_| MpdGrabError::SegmentFetch("worker pool is closed".to_string()))
    }

    /// Close the control channel and wait for every worker to drain and exit. In-flight segment
    /// jobs complete before the pool terminates.
    pub fn close(self) {
        drop(self.control_tx);
        for h in self.handles {
            if h.join().is_err() {
                warn!("a download worker panicked");
            }
        }
    }
}

fn control_worker(
    control_rx: Receiver<ControlJob>,
    segment_tx: SyncSender<SegmentJob>,
    client: HttpClient,
) {
    debug!("control worker is ready");
    while let Ok(job) = control_rx.recv() {
        match job {
            ControlJob::Manifest { url, path, reply } => {
                let res = download_file(&client, &url, &path, MANIFEST_ACCEPT)
                    .map(|()| path)
                    .map_err(|e| match e {
                        MpdGrabError::SegmentFetch(msg) => MpdGrabError::ManifestFetch(msg),
                        other => other,
                    });
                let _ = reply.send(res);
            },
            ControlJob::Segments(jobs) => {
                for job in jobs {
                    if segment_tx.send(job).is_err() {
                        // fetch workers are gone, nothing left to feed
                        return;
                    }
                }
            },
        }
    }
    // dropping segment_tx here closes the segment channel and releases the fetch workers
    debug!("control worker is out");
}

fn fetch_worker(id: usize, segment_rx: Arc<Mutex<Receiver<SegmentJob>>>, client: HttpClient) {
    debug!("fetch worker {id} is ready");
    loop {
        let job = match segment_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(job) = job else { break };
        let error = download_file(&client, job.url.as_str(), &job.path, accept_header(job.class))
            .err();
        if let Some(e) = &error {
            warn!("segment {}/{} from {} failed: {e}", job.pos + 1, job.total, job.url);
        } else {
            debug!("segment {}/{} -> {}", job.pos + 1, job.total, job.path.display());
        }
        let outcome = SegmentOutcome { pos: job.pos, path: job.path, error };
        // the orchestrator may have abandoned the track already
        let _ = job.done.send(outcome);
    }
    debug!("fetch worker {id} is out");
}

// A strict Accept of "audio/*" alone gets .m4s requests rejected by some misconfigured CDNs, so
// every class keeps a catch-all fallback.
fn accept_header(class: ContentType) -> &'static str {
    match class {
        ContentType::Audio => "audio/*;q=0.9,*/*;q=0.5",
        ContentType::Video => "video/*;q=0.9,*/*;q=0.5",
        ContentType::Text => "text/*;q=0.9,*/*;q=0.5",
        ContentType::Unknown => "*/*",
    }
}

// Timeouts, connection resets and throttling-style statuses (408, 429, 503, 504) are worth a
// retry; any other failure is final.
fn transient_error(e: &reqwest::Error) -> bool {
    e.is_timeout()
        || e.is_connect()
        || matches!(e.status().map(|s| s.as_u16()), Some(408 | 429 | 503 | 504))
}

fn categorize_reqwest_error(e: reqwest::Error) -> backoff::Error<reqwest::Error> {
    if transient_error(&e) {
        backoff::Error::retry_after(e, Duration::from_secs(5))
    } else {
        backoff::Error::permanent(e)
    }
}

fn notify_transient<E: std::fmt::Debug>(err: E, dur: Duration) {
    info!("transient error after {dur:?}: {err:?}");
}

/// Download `url` to `path`. If a file already exists at `path` the network is skipped entirely,
/// which makes interrupted runs cheap to repeat. A response body that cannot be written fully
/// removes the partial file so a later run doesn't pick it up.
pub fn download_file(
    client: &HttpClient,
    url: &str,
    path: &Path,
    accept: &str,
) -> Result<(), MpdGrabError> {
    if path.exists() {
        debug!("file already exists at {}, skipping download", path.display());
        return Ok(());
    }
    let fetch = || {
        let resp = client.get(url)
            .header("Accept", accept)
            .send()
            .map_err(categorize_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(categorize_reqwest_error(
                resp.error_for_status().expect_err("status checked above")));
        }
        resp.bytes().map_err(categorize_reqwest_error)
    };
    let backoff = ExponentialBackoff {
        max_elapsed_time: Some(Duration::new(60, 0)),
        ..Default::default()
    };
    let body = retry_notify(backoff, fetch, notify_transient).map_err(|e| {
        let e = match e {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => err,
        };
        match e.status() {
            Some(status) => MpdGrabError::SegmentFetch(format!("bad status: {status}")),
            None => MpdGrabError::SegmentFetch(e.to_string()),
        }
    })?;
    let mut out = fs::File::create(path)
        .map_err(|e| MpdGrabError::Io(e, format!("creating {}", path.display())))?;
    if let Err(e) = out.write_all(&body) {
        drop(out);
        let _ = fs::remove_file(path);
        return Err(MpdGrabError::Io(e, format!("writing {}", path.display())));
    }
    Ok(())
}
