//! The concurrent hashing pipeline.
//!
//! A fixed set of worker threads drains an unbounded job channel; each
//! worker owns one reusable read buffer and polls the shutdown signal
//! before every read. The first job error is parked in a shared slot
//! and surfaced when the pool is drained; later submissions fail fast.
//! A separate monitor thread tallies start/finish events so that jobs
//! which neither finish nor fail within the drain timeout get reported
//! instead of hanging the workflow silently.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{unbounded, Receiver, Sender};

use dcfh_datastore::digest::DigestKind;
use dcfh_datastore::index_file::EntryRef;
use dcfh_tools::ShutdownSignal;

use crate::error::WorkflowError;

/// How long the monitor waits for outstanding jobs after the upstream
/// stages signalled "no more jobs".
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum HashJobKind {
    /// Hash the file contents.
    File,
    /// Hash the symlink target path string, not the target contents.
    Symlink,
}

pub struct HashJob {
    pub job_id: u64,
    pub abs_path: PathBuf,
    pub entry: EntryRef,
    pub kind: HashJobKind,
}

enum HashEvent {
    Start { job_id: u64, path: PathBuf },
    Finish { job_id: u64 },
    NoMoreJobs,
}

pub struct HashPool {
    jobs: Sender<HashJob>,
    workers: Vec<JoinHandle<()>>,
    events_tx: Sender<HashEvent>,
    monitor: JoinHandle<()>,
    first_error: Arc<Mutex<Option<Error>>>,
    next_job_id: AtomicU64,
}

impl HashPool {
    pub fn new(
        workers: usize,
        buffer_size: usize,
        hash_kind: &'static DigestKind,
        shutdown: ShutdownSignal,
    ) -> Result<Self, Error> {
        let (jobs_tx, jobs_rx) = unbounded::<HashJob>();
        let (events_tx, events_rx) = unbounded();
        let first_error = Arc::new(Mutex::new(None));

        let monitor = std::thread::Builder::new()
            .name("hash monitor".to_string())
            .spawn(move || monitor_loop(events_rx))?;

        let mut handles = Vec::new();
        for n in 0..workers {
            let jobs_rx = jobs_rx.clone();
            let events = events_tx.clone();
            let shutdown = shutdown.clone();
            let first_error = Arc::clone(&first_error);

            let handle = std::thread::Builder::new()
                .name(format!("hash worker ({})", n))
                .spawn(move || {
                    let mut buffer = vec![0u8; buffer_size];
                    // the queue disconnects once the pool is drained or
                    // dropped, ending the worker
                    while let Ok(job) = jobs_rx.recv() {
                        let result = hash_one(&mut buffer, hash_kind, &shutdown, &job);
                        let _ = events.send(HashEvent::Finish { job_id: job.job_id });
                        if let Err(err) = result {
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(
                                    err.context(format!("hashing {:?} failed", job.abs_path)),
                                );
                            }
                        }
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            jobs: jobs_tx,
            workers: handles,
            events_tx,
            monitor,
            first_error,
            next_job_id: AtomicU64::new(1),
        })
    }

    /// Queue a hash job for an appended entry. The job owns the entry's
    /// hash field until it completes. Fails fast once a worker reported
    /// an error; the error itself surfaces from [`HashPool::finish`].
    pub fn submit(&self, abs_path: PathBuf, entry: EntryRef, kind: HashJobKind) -> Result<(), Error> {
        if self.first_error.lock().unwrap().is_some() {
            bail!("hash pool failed - not accepting new jobs");
        }
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let _ = self.events_tx.send(HashEvent::Start {
            job_id,
            path: abs_path.clone(),
        });
        if self
            .jobs
            .send(HashJob {
                job_id,
                abs_path,
                entry,
                kind,
            })
            .is_err()
        {
            bail!("hash job queue closed");
        }
        Ok(())
    }

    /// Signal "no more jobs", let the workers drain the queue and wait
    /// for them and for the monitor (which reports jobs stuck past the
    /// drain timeout). Returns the first job error, if any.
    pub fn finish(self) -> Result<(), Error> {
        let HashPool {
            jobs,
            workers,
            events_tx,
            monitor,
            first_error,
            next_job_id: _,
        } = self;

        let _ = events_tx.send(HashEvent::NoMoreJobs);
        drop(jobs);

        let mut panicked = Vec::new();
        for (n, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                panicked.push(format!("hash worker ({}) panicked", n));
            }
        }

        drop(events_tx);
        if monitor.join().is_err() {
            log::error!("hash monitor thread panicked");
        }

        if let Some(err) = first_error.lock().unwrap().take() {
            return Err(err);
        }
        if !panicked.is_empty() {
            bail!("{}", panicked.join("\n"));
        }
        Ok(())
    }
}

fn monitor_loop(events_rx: Receiver<HashEvent>) {
    let mut outstanding: HashMap<u64, PathBuf> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let event = match deadline {
            Some(deadline) => match events_rx.recv_deadline(deadline) {
                Ok(event) => event,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    for (job_id, path) in &outstanding {
                        log::warn!(
                            "hash job {} ({:?}) still pending after drain timeout",
                            job_id,
                            path
                        );
                    }
                    return;
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            },
            None => match events_rx.recv() {
                Ok(event) => event,
                Err(_) => return,
            },
        };

        match event {
            HashEvent::Start { job_id, path } => {
                outstanding.insert(job_id, path);
            }
            HashEvent::Finish { job_id } => {
                outstanding.remove(&job_id);
                if deadline.is_some() && outstanding.is_empty() {
                    return;
                }
            }
            HashEvent::NoMoreJobs => {
                if outstanding.is_empty() {
                    return;
                }
                deadline = Some(Instant::now() + DRAIN_TIMEOUT);
            }
        }
    }
}

/// Hash one job and write the digest into the entry.
fn hash_one(
    buffer: &mut [u8],
    kind: &'static DigestKind,
    shutdown: &ShutdownSignal,
    job: &HashJob,
) -> Result<(), Error> {
    let mut hasher = kind.create()?;

    match job.kind {
        HashJobKind::Symlink => {
            let target = nix::fcntl::readlink(&job.abs_path)
                .map_err(|err| format_err!("readlink failed - {}", err))?;
            hasher.update(target.as_os_str().as_bytes())?;
        }
        HashJobKind::File => {
            let mut file = std::fs::File::open(&job.abs_path)?;
            loop {
                if shutdown.is_fired() {
                    bail!(WorkflowError::Interrupted);
                }
                let count = file.read(buffer)?;
                if count == 0 {
                    break;
                }
                hasher.update(&buffer[..count])?;
            }
        }
    }

    let digest = hasher.finish()?;
    job.entry.write_hash(kind.type_id, &digest);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use dcfh_datastore::digest::digest_by_name;
    use dcfh_datastore::entry::EntryMeta;
    use dcfh_datastore::index_file::ScanIndexWriter;
    use dcfh_datastore::wall_time;

    fn dummy_meta() -> EntryMeta {
        EntryMeta {
            ctime: wall_time::pack(1_600_000_000, 0),
            mtime: wall_time::pack(1_600_000_000, 0),
            dev: 1,
            ino: 2,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: 1,
        }
    }

    #[test]
    fn hashes_files_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"A").unwrap();
        let link_path = dir.path().join("link");
        std::os::unix::fs::symlink("a.txt", &link_path).unwrap();

        let kind = digest_by_name("sha256").unwrap();
        let mut writer =
            ScanIndexWriter::create(&dir.path().join("scan-1-1.idx"), kind).unwrap();
        let file_ref = writer.append_new("a.txt", &dummy_meta()).unwrap();
        let link_ref = writer.append_new("link", &dummy_meta()).unwrap();

        let pool = HashPool::new(2, 4096, kind, ShutdownSignal::new()).unwrap();
        pool.submit(file_path, file_ref.clone(), HashJobKind::File)
            .unwrap();
        pool.submit(link_path, link_ref.clone(), HashJobKind::Symlink)
            .unwrap();
        pool.finish().unwrap();

        let entry = file_ref.resolve();
        assert_eq!(entry.hash_type, kind.type_id);
        assert_eq!(
            hex::encode(entry.hash_slice().unwrap()),
            "559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd"
        );
        drop(entry);

        let link_entry = link_ref.resolve();
        let expected = kind.digest(b"a.txt").unwrap();
        assert_eq!(link_entry.hash_slice().unwrap(), &expected[..]);
    }

    #[test]
    fn fired_shutdown_interrupts_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("big");
        std::fs::write(&file_path, vec![0u8; 1 << 20]).unwrap();

        let kind = digest_by_name("sha256").unwrap();
        let mut writer =
            ScanIndexWriter::create(&dir.path().join("scan-1-2.idx"), kind).unwrap();
        let entry_ref = writer.append_new("big", &dummy_meta()).unwrap();

        let shutdown = ShutdownSignal::new();
        shutdown.fire();
        let pool = HashPool::new(1, 4096, kind, shutdown).unwrap();
        pool.submit(file_path, entry_ref.clone(), HashJobKind::File)
            .unwrap();
        assert!(pool.finish().is_err());

        // the hash field stays untouched on interruption
        assert_eq!(entry_ref.resolve().hash_type, 0);
    }

    #[test]
    fn worker_error_fails_later_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let kind = digest_by_name("sha256").unwrap();
        let mut writer =
            ScanIndexWriter::create(&dir.path().join("scan-1-3.idx"), kind).unwrap();
        let entry_ref = writer.append_new("gone", &dummy_meta()).unwrap();

        let pool = HashPool::new(1, 4096, kind, ShutdownSignal::new()).unwrap();
        pool.submit(
            dir.path().join("does-not-exist"),
            entry_ref.clone(),
            HashJobKind::File,
        )
        .unwrap();

        // the failure lands in the error slot; eventually submissions
        // start failing fast, and finish reports the original error
        loop {
            std::thread::sleep(Duration::from_millis(10));
            if pool
                .submit(
                    dir.path().join("also-missing"),
                    entry_ref.clone(),
                    HashJobKind::File,
                )
                .is_err()
            {
                break;
            }
        }
        let err = pool.finish().unwrap_err();
        assert!(err.to_string().contains("does-not-exist") || err.to_string().contains("failed"));
    }
}
