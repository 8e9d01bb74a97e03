//! Per-(media, preset) transcoding state machine.
//!
//! A [`QualityBackend`] owns the segment status map for one variant of one
//! media file, the encoder processes currently producing segments, and the
//! playheads of the clients watching it. Client requests move playheads; a
//! debounced recalculation then attaches each client to a running encoder
//! where possible, starts new encoders where not, and kills encoders nobody
//! needs. Encoders report produced segments on stdout and are steered ahead
//! one segment at a time while any attached client is under its buffer
//! target.
//!
//! Segment status is a single byte per segment: `EMPTY`, `DONE`, or the id
//! of the encoder currently producing it. Ids rotate through `2..=253`;
//! `1` and `254` stay reserved. The rotation avoids immediately reusing an
//! id whose stale byte may still linger in the map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::av::encoder::{EncodeJob, EncoderLauncher};
use crate::av::process::Subprocess;
use crate::debounce::Debounce;
use crate::error::{Error, Result};
use crate::media::presets::Preset;
use crate::media::MediaKind;

/// Segment not produced, no encoder working on it.
const EMPTY: u8 = 0;
/// Segment fully written to disk.
const DONE: u8 = 255;
/// First usable encoder id; ids 1 and 254 are reserved.
const MIN_ENCODER_ID: u8 = 2;
/// Number of usable encoder ids (2..=253).
const ENCODER_ID_SPAN: u16 = 252;
/// Upper bound on segments per encoder run.
const MAX_RUN_SEGMENTS: usize = 512;
/// Grace period before a deregistered client record is dropped; long enough
/// for any in-flight request holding the record to observe the marker.
const CLIENT_REAP_DELAY: Duration = Duration::from_secs(1);

type SegmentOutcome = std::result::Result<PathBuf, String>;

struct EncoderHead {
    /// Segment index the encoder is currently producing.
    head: usize,
    /// One past the last segment of this run.
    end: usize,
    process: Arc<Subprocess>,
}

struct ClientRecord {
    /// Last requested segment index; `None` until the first request.
    head: Option<usize>,
    /// Encoder id this client rode on at the last recalculation.
    encoder: Option<u8>,
    deleted: bool,
}

struct BackendState {
    /// One byte per segment: `EMPTY`, `DONE`, or a live encoder id.
    status: Vec<u8>,
    encoders: HashMap<u8, EncoderHead>,
    clients: HashMap<String, ClientRecord>,
    /// One-shot completion signals per segment index.
    waiters: HashMap<usize, Vec<oneshot::Sender<SegmentOutcome>>>,
    /// Rotating cursor for encoder id allocation.
    last_id: u8,
    closed: bool,
}

impl std::fmt::Debug for QualityBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityBackend").finish_non_exhaustive()
    }
}

/// The per-variant state machine.
pub struct QualityBackend {
    source: PathBuf,
    out_dir: PathBuf,
    preset: &'static Preset,
    kind: MediaKind,
    dimensions: Option<(u32, u32)>,
    breakpoints: Arc<Vec<f64>>,
    min_buffer: f64,
    max_buffer: f64,
    launcher: Arc<dyn EncoderLauncher>,
    state: Mutex<BackendState>,
    recalc: Debounce,
}

#[allow(clippy::too_many_arguments)]
impl QualityBackend {
    pub fn new(
        source: PathBuf,
        out_dir: PathBuf,
        preset: &'static Preset,
        kind: MediaKind,
        dimensions: Option<(u32, u32)>,
        breakpoints: Arc<Vec<f64>>,
        min_buffer: f64,
        max_buffer: f64,
        launcher: Arc<dyn EncoderLauncher>,
    ) -> Arc<Self> {
        let segments = breakpoints.len().saturating_sub(1);
        Arc::new_cyclic(|weak: &Weak<QualityBackend>| {
            let weak = weak.clone();
            let recalc = Debounce::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(backend) = weak.upgrade() {
                        backend.recalculate();
                    }
                }
                .boxed()
            });

            QualityBackend {
                source,
                out_dir,
                preset,
                kind,
                dimensions,
                breakpoints,
                min_buffer,
                max_buffer,
                launcher,
                state: Mutex::new(BackendState {
                    status: vec![EMPTY; segments],
                    encoders: HashMap::new(),
                    clients: HashMap::new(),
                    waiters: HashMap::new(),
                    last_id: 0,
                    closed: false,
                }),
                recalc,
            }
        })
    }

    /// Number of segments in the plan.
    pub fn segment_count(&self) -> usize {
        self.breakpoints.len() - 1
    }

    /// The preset this backend transcodes to.
    pub fn preset(&self) -> &'static Preset {
        self.preset
    }

    /// Number of live encoder processes.
    pub fn encoder_count(&self) -> usize {
        self.state.lock().encoders.len()
    }

    /// Whether segment `index` is fully produced on disk.
    pub fn segment_done(&self, index: usize) -> bool {
        self.state.lock().status.get(index).copied() == Some(DONE)
    }

    /// Whether a client record (live or pending deletion) exists.
    pub fn has_client(&self, client_id: &str) -> bool {
        self.state.lock().clients.contains_key(client_id)
    }

    /// Deliver segment `index` (0-based) for `client_id`.
    ///
    /// Moves the client's playhead, schedules a recalculation, and resolves
    /// with the on-disk segment path once the segment is produced.
    pub async fn serve_segment(self: &Arc<Self>, client_id: &str, index: usize) -> Result<PathBuf> {
        enum Pending {
            Ready(PathBuf),
            Wait(oneshot::Receiver<SegmentOutcome>),
        }

        let pending = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(Error::Encoder("backend destroyed".into()));
            }

            let record = st
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientRecord {
                    head: None,
                    encoder: None,
                    deleted: false,
                });
            if record.deleted {
                return Err(Error::Conflict(format!(
                    "client {client_id} was deregistered"
                )));
            }

            let segments = self.segment_count();
            if index >= segments {
                return Err(Error::Internal(format!(
                    "segment index {index} out of range 0..{segments}"
                )));
            }
            record.head = Some(index);

            if st.status[index] == DONE {
                Pending::Ready(self.segment_path(index))
            } else {
                let (tx, rx) = oneshot::channel();
                st.waiters.entry(index).or_default().push(tx);
                Pending::Wait(rx)
            }
        };

        self.trigger_recalculate();

        match pending {
            Pending::Ready(path) => Ok(path),
            // Dropping the future (request cancelled) drops the receiver,
            // which detaches the listener; the encoder keeps running for
            // other clients.
            Pending::Wait(rx) => match rx.await {
                Ok(Ok(path)) => Ok(path),
                Ok(Err(message)) => Err(Error::Encoder(message)),
                Err(_) => Err(Error::Encoder("segment abandoned".into())),
            },
        }
    }

    /// Mark a client deregistered. The record survives a short grace period
    /// so racing requests observe the marker and get a conflict.
    pub fn remove_client(self: &Arc<Self>, client_id: &str) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            let record = st
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientRecord {
                    head: None,
                    encoder: None,
                    deleted: false,
                });
            record.deleted = true;
            record.encoder = None;
        }

        self.trigger_recalculate();

        let backend = Arc::clone(self);
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CLIENT_REAP_DELAY).await;
            let mut st = backend.state.lock();
            if st.clients.get(&client_id).map(|r| r.deleted) == Some(true) {
                st.clients.remove(&client_id);
            }
        });
    }

    /// Tear the backend down: fail every pending waiter and kill every
    /// encoder. The owning media descriptor removes the output directory.
    pub async fn destroy(&self) {
        let processes = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;

            for (_, senders) in st.waiters.drain() {
                for tx in senders {
                    let _ = tx.send(Err("Encoder being evicted".to_string()));
                }
            }
            st.clients.clear();
            st.encoders
                .values()
                .map(|h| h.process.clone())
                .collect::<Vec<_>>()
        };

        for process in processes {
            process.kill().await;
        }
    }

    fn trigger_recalculate(&self) {
        let _ = self.recalc.call();
    }

    fn segment_path(&self, index: usize) -> PathBuf {
        self.out_dir
            .join(EncodeJob::segment_file_name(self.preset, index))
    }

    /// Re-derive the encoder/client assignment from current state.
    ///
    /// Runs under the state lock with no suspension points; kills are handed
    /// to background tasks. Only ever invoked through the debounce wrapper,
    /// which is what makes the read-everything-then-write approach sound.
    fn recalculate(self: &Arc<Self>) {
        let mut to_kill: Vec<Arc<Subprocess>> = Vec::new();

        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            let segments = self.segment_count();

            // Index live encoders by head position. Two encoders sharing a
            // head should not happen; keep the older id, kill the other.
            let mut by_head: HashMap<usize, u8> = HashMap::new();
            let mut ids: Vec<u8> = st.encoders.keys().copied().collect();
            ids.sort_unstable();
            for eid in ids {
                let head = st.encoders[&eid].head;
                if let Some(&kept) = by_head.get(&head) {
                    tracing::error!(
                        head,
                        kept,
                        duplicate = eid,
                        "two encoders share a head; killing the newer one"
                    );
                    to_kill.push(st.encoders[&eid].process.clone());
                } else {
                    by_head.insert(head, eid);
                }
            }

            let st = &mut *st;
            for record in st.clients.values_mut() {
                record.encoder = None;
            }

            let mut attach_counts: HashMap<u8, usize> = HashMap::new();
            let mut unresolved: Vec<(usize, String)> = Vec::new();

            for (client_id, record) in st.clients.iter_mut() {
                if record.deleted {
                    continue;
                }
                let Some(playhead) = record.head else { continue };

                // First segment inside the minimum-buffer window that is not
                // yet produced; a client with none is fully buffered.
                let mut first_to_encode = None;
                let mut i = playhead;
                while i < segments
                    && self.breakpoints[i] - self.breakpoints[playhead] < self.min_buffer
                {
                    if st.status[i] != DONE {
                        first_to_encode = Some(i);
                        break;
                    }
                    i += 1;
                }
                let Some(first) = first_to_encode else { continue };

                // An encoder whose head is at or one behind the wanted
                // segment will deliver it next; ride along.
                let existing = by_head
                    .get(&first)
                    .or_else(|| first.checked_sub(1).and_then(|prev| by_head.get(&prev)));
                if let Some(&eid) = existing {
                    record.encoder = Some(eid);
                    *attach_counts.entry(eid).or_default() += 1;
                } else {
                    unresolved.push((first, client_id.clone()));
                }
            }

            // Encoders nobody rides on die.
            for (eid, entry) in st.encoders.iter() {
                if attach_counts.get(eid).copied().unwrap_or(0) == 0 {
                    to_kill.push(entry.process.clone());
                }
            }

            // Start encoders for the rest, nearest segment first, letting a
            // run of adjacent clients share one fresh encoder.
            unresolved.sort_by_key(|(first, _)| *first);
            let mut last_started: Option<(usize, u8)> = None;
            for (first, client_id) in unresolved {
                if let Some((start, eid)) = last_started {
                    if first == start || first == start + 1 {
                        if let Some(record) = st.clients.get_mut(&client_id) {
                            record.encoder = Some(eid);
                        }
                        continue;
                    }
                }
                match self.start_encoder(st, first) {
                    Ok(eid) => {
                        last_started = Some((first, eid));
                        if let Some(record) = st.clients.get_mut(&client_id) {
                            record.encoder = Some(eid);
                        }
                    }
                    Err(e) => {
                        tracing::error!(segment = first, "failed to start encoder: {e}");
                        notify_waiters(st, first, Err(format!("failed to start encoder: {e}")));
                    }
                }
            }
        }

        for process in to_kill {
            tokio::spawn(async move {
                process.kill().await;
            });
        }
    }

    /// Spawn an encoder producing segments from `start`.
    ///
    /// The run extends up to [`MAX_RUN_SEGMENTS`] ahead but never into
    /// territory some other encoder has touched.
    fn start_encoder(self: &Arc<Self>, st: &mut BackendState, start: usize) -> Result<u8> {
        let segments = self.segment_count();
        if st.status[start] != EMPTY {
            return Err(Error::Internal(format!(
                "segment {start} is not free (status {})",
                st.status[start]
            )));
        }

        let mut end = (start + MAX_RUN_SEGMENTS).min(segments);
        if let Some(stop) = (start + 1..end).find(|&i| st.status[i] != EMPTY) {
            end = stop;
        }

        let eid = next_encoder_id(st)
            .ok_or_else(|| Error::Internal("no free encoder id".into()))?;

        let job = EncodeJob {
            source: &self.source,
            out_dir: &self.out_dir,
            preset: self.preset,
            kind: self.kind,
            dimensions: self.dimensions,
            breakpoints: &self.breakpoints,
            start,
            end,
        };
        let process = self.launcher.launch(&job)?;

        st.status[start] = eid;
        st.encoders.insert(
            eid,
            EncoderHead {
                head: start,
                end,
                process: process.clone(),
            },
        );
        tracing::debug!(
            preset = self.preset.name,
            eid,
            start,
            end,
            pid = process.pid(),
            "encoder started"
        );
        self.spawn_monitor(eid, process);
        Ok(eid)
    }

    fn spawn_monitor(self: &Arc<Self>, eid: u8, process: Arc<Subprocess>) {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(mut lines) = process.take_lines() {
                while let Some(line) = lines.recv().await {
                    backend.handle_encoder_line(eid, &line);
                }
            }
            let code = process.exit_code().await;
            backend.handle_encoder_exit(eid, code, &process);
        });
    }

    /// One line of segmenter output: a finished segment file name.
    fn handle_encoder_line(self: &Arc<Self>, eid: u8, line: &str) {
        let Some(index) = self.parse_segment_line(line) else {
            tracing::debug!(line, "ignoring unrecognized segmenter output");
            return;
        };

        let mut to_kill: Option<Arc<Subprocess>> = None;
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            let segments = self.segment_count();
            if index >= segments {
                tracing::warn!(eid, index, "segmenter reported an out-of-range segment");
                return;
            }
            let (head, end, process) = match st.encoders.get(&eid) {
                Some(entry) => (entry.head, entry.end, entry.process.clone()),
                None => return,
            };

            if index != head {
                // Observed at breakpoint edges: ffmpeg occasionally lands on
                // a neighboring index. Accept the reported segment.
                tracing::warn!(eid, expected = head, produced = index, "segment index drift");
                if st.status[head] == eid {
                    st.status[head] = EMPTY;
                }
            }

            st.status[index] = DONE;
            let path = self.segment_path(index);
            notify_waiters(&mut st, index, Ok(path));

            if index + 1 >= end {
                // Run complete; ffmpeg exits on its own.
            } else if st.status[index + 1] != EMPTY {
                // Another encoder already covers the road ahead.
                to_kill = Some(process);
            } else {
                let st = &mut *st;
                let next_start = self.breakpoints[index + 1];
                let keep = st.clients.values().any(|c| {
                    !c.deleted
                        && c.encoder == Some(eid)
                        && c.head
                            .map_or(false, |p| next_start - self.breakpoints[p] < self.max_buffer)
                });
                if keep {
                    st.status[index + 1] = eid;
                    if let Some(entry) = st.encoders.get_mut(&eid) {
                        entry.head = index + 1;
                    }
                } else {
                    // Every attached client is buffered out; stop burning CPU.
                    to_kill = Some(process);
                }
            }
        }

        if let Some(process) = to_kill {
            tokio::spawn(async move {
                process.kill().await;
            });
        }
    }

    fn handle_encoder_exit(self: &Arc<Self>, eid: u8, code: i32, process: &Subprocess) {
        {
            let mut st = self.state.lock();
            if let Some(entry) = st.encoders.remove(&eid) {
                if st.status[entry.head] == eid {
                    st.status[entry.head] = EMPTY;
                }
                // Waiters on segments this run owned but never produced get
                // an error; segments another encoder covers are spared.
                for index in entry.head..entry.end {
                    if st.status[index] == EMPTY {
                        notify_waiters(
                            &mut st,
                            index,
                            Err(format!("encoder exited with code {code}")),
                        );
                    }
                }
            }
            if st.closed {
                return;
            }
            // 255 is ffmpeg's exit code when told to quit.
            if code != 0 && code != 255 {
                tracing::warn!(
                    eid,
                    code,
                    pid = process.pid(),
                    kill_requested = process.kill_requested(),
                    "encoder exited abnormally"
                );
            }
        }

        self.trigger_recalculate();
    }

    fn parse_segment_line(&self, line: &str) -> Option<usize> {
        let name = Path::new(line.trim()).file_name()?.to_str()?;
        let rest = name
            .strip_prefix(self.preset.name)?
            .strip_prefix('-')?
            .strip_suffix(".ts")?;
        rest.parse::<usize>().ok()
    }
}

/// Fire and clear all waiters for one segment index.
fn notify_waiters(st: &mut BackendState, index: usize, outcome: SegmentOutcome) {
    if let Some(senders) = st.waiters.remove(&index) {
        for tx in senders {
            let _ = tx.send(outcome.clone());
        }
    }
}

/// Pick a free encoder id in `2..=253`.
///
/// The scan starts just past the previously assigned id and skips any value
/// present in the status map or assigned to a live encoder, so a stale byte
/// from a dying encoder is never confused with a fresh one.
fn next_encoder_id(st: &mut BackendState) -> Option<u8> {
    let base = st.last_id as u16 % ENCODER_ID_SPAN;
    for offset in 0..ENCODER_ID_SPAN {
        let id = ((base + offset) % ENCODER_ID_SPAN) as u8 + MIN_ENCODER_ID;
        if !st.encoders.contains_key(&id) && !st.status.contains(&id) {
            st.last_id = id;
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::presets::find_video_preset;
    use std::time::Duration;

    /// Launcher that spawns a shell script echoing segment file names the
    /// way ffmpeg's segment muxer reports them on `-segment_list pipe:1`.
    struct ScriptLauncher {
        /// `(start, end)` of every launched run.
        jobs: Mutex<Vec<(usize, usize)>>,
        /// When set, processes exit with this code before emitting anything.
        fail_code: Mutex<Option<i32>>,
        /// When set, processes emit nothing and linger until killed.
        hang: Mutex<bool>,
        /// Delay between emitted segments.
        pace: Duration,
    }

    impl ScriptLauncher {
        fn new(pace: Duration) -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
                fail_code: Mutex::new(None),
                hang: Mutex::new(false),
                pace,
            })
        }

        fn jobs(&self) -> Vec<(usize, usize)> {
            self.jobs.lock().clone()
        }
    }

    impl EncoderLauncher for ScriptLauncher {
        fn launch(&self, job: &EncodeJob<'_>) -> Result<Arc<Subprocess>> {
            self.jobs.lock().push((job.start, job.end));

            let mut script = String::new();
            if let Some(code) = *self.fail_code.lock() {
                script.push_str(&format!("exit {code}"));
            } else if *self.hang.lock() {
                script.push_str("sleep 30");
            } else {
                for i in job.start..job.end {
                    script.push_str(&format!(
                        "echo {}; sleep {:.3}; ",
                        EncodeJob::segment_file_name(job.preset, i),
                        self.pace.as_secs_f64(),
                    ));
                }
                // Linger like a finished-but-unreaped encoder until killed.
                script.push_str("sleep 30");
            }

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(script);
            Subprocess::spawn(cmd, Duration::from_secs(60))
        }
    }

    fn test_backend(
        segments: usize,
        min_buffer: f64,
        max_buffer: f64,
        launcher: Arc<ScriptLauncher>,
    ) -> Arc<QualityBackend> {
        // Uniform one-second segments keep the buffer math readable.
        let breakpoints: Vec<f64> = (0..=segments).map(|i| i as f64).collect();
        QualityBackend::new(
            PathBuf::from("/media/test.mkv"),
            std::env::temp_dir().join("reelcast-backend-test"),
            find_video_preset("720p").unwrap(),
            MediaKind::Video,
            Some((1920, 1080)),
            Arc::new(breakpoints),
            min_buffer,
            max_buffer,
            launcher,
        )
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn warm_start_serves_segment_zero() {
        let launcher = ScriptLauncher::new(Duration::from_millis(10));
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        let path = backend.serve_segment("alice", 0).await.expect("segment 0");
        assert!(path.ends_with("720p-00000.ts"), "got {path:?}");
        assert!(backend.segment_done(0));
        assert_eq!(launcher.jobs(), vec![(0, 10)]);

        backend.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn near_clients_share_one_encoder() {
        let launcher = ScriptLauncher::new(Duration::from_millis(30));
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        let (a, b) = tokio::join!(
            backend.serve_segment("alice", 0),
            backend.serve_segment("bob", 1),
        );
        a.expect("segment 0");
        b.expect("segment 1");

        assert_eq!(launcher.jobs().len(), 1, "both clients ride one encoder");
        assert_eq!(backend.encoder_count(), 1);

        backend.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encoder_stops_once_clients_are_buffered() {
        let launcher = ScriptLauncher::new(Duration::from_millis(10));
        let backend = test_backend(20, 2.0, 4.0, launcher.clone());

        backend.serve_segment("alice", 0).await.expect("segment 0");

        // The encoder may run up to the max-buffer horizon past the
        // playhead (4 one-second segments) but must then stop.
        wait_until("encoder to stop", || backend.encoder_count() == 0).await;
        assert!(backend.segment_done(0));
        assert!(!backend.segment_done(10));

        backend.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encoder_death_fails_the_waiting_request() {
        let launcher = ScriptLauncher::new(Duration::from_millis(10));
        *launcher.fail_code.lock() = Some(7);
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        let err = backend
            .serve_segment("alice", 0)
            .await
            .expect_err("encoder died");
        assert!(matches!(err, Error::Encoder(_)));
        assert!(err.to_string().contains("exited"), "got: {err}");
        assert!(!backend.segment_done(0));

        // A later request starts a fresh encoder and succeeds. An encoder
        // spawned just before the launcher recovered may still error one
        // more waiter, so retry briefly.
        *launcher.fail_code.lock() = None;
        let mut served = None;
        for _ in 0..20 {
            match backend.serve_segment("alice", 0).await {
                Ok(path) => {
                    served = Some(path);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let path = served.expect("segment served after encoder recovery");
        assert!(path.ends_with("720p-00000.ts"));
        assert!(launcher.jobs().len() >= 2);

        backend.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removed_client_conflicts_and_encoder_dies() {
        let launcher = ScriptLauncher::new(Duration::from_millis(30));
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        backend.serve_segment("alice", 0).await.expect("segment 0");
        backend.remove_client("alice");

        let err = backend
            .serve_segment("alice", 1)
            .await
            .expect_err("deregistered");
        assert!(matches!(err, Error::Conflict(_)));

        wait_until("encoder to die", || backend.encoder_count() == 0).await;
        wait_until("client record to be reaped", || !backend.has_client("alice")).await;

        backend.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_before_first_request_plants_a_stub() {
        let launcher = ScriptLauncher::new(Duration::from_millis(10));
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        backend.remove_client("ghost");
        let err = backend
            .serve_segment("ghost", 0)
            .await
            .expect_err("pre-deleted stub");
        assert!(matches!(err, Error::Conflict(_)));

        backend.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroy_fails_pending_waiters() {
        let launcher = ScriptLauncher::new(Duration::from_millis(10));
        // Encoders that never produce anything keep waiters pending.
        *launcher.hang.lock() = true;
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.serve_segment("alice", 9).await })
        };
        wait_until("client to register", || backend.has_client("alice")).await;

        backend.destroy().await;
        let result = waiter.await.expect("task");
        match result {
            Err(Error::Encoder(message)) => assert!(message.contains("evicted")),
            other => panic!("expected eviction error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_range_index_is_rejected() {
        let launcher = ScriptLauncher::new(Duration::from_millis(10));
        let backend = test_backend(10, 2.5, 5.0, launcher.clone());

        let err = backend
            .serve_segment("alice", 10)
            .await
            .expect_err("out of range");
        assert!(matches!(err, Error::Internal(_)));

        backend.destroy().await;
    }

    #[test]
    fn encoder_ids_rotate_and_skip_taken_values() {
        let mut st = BackendState {
            status: vec![EMPTY; 16],
            encoders: HashMap::new(),
            clients: HashMap::new(),
            waiters: HashMap::new(),
            last_id: 0,
            closed: false,
        };

        let first = next_encoder_id(&mut st).unwrap();
        assert_eq!(first, MIN_ENCODER_ID);

        // A stale status byte and the cursor both steer allocation away.
        st.status[3] = 4;
        let second = next_encoder_id(&mut st).unwrap();
        assert_ne!(second, first);
        assert_ne!(second, 4);
    }

    #[test]
    fn encoder_id_allocation_fails_when_exhausted() {
        let mut st = BackendState {
            status: (0..252).map(|i| i as u8 + MIN_ENCODER_ID).collect(),
            encoders: HashMap::new(),
            clients: HashMap::new(),
            waiters: HashMap::new(),
            last_id: 0,
            closed: false,
        };
        assert_eq!(next_encoder_id(&mut st), None);
    }
}
