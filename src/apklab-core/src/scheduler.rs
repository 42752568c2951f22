//! Concurrent job execution.
//!
//! A fixed pool of worker threads pulls jobs off a channel; each job runs
//! to completion on one worker, so a blocking tool invocation in one job
//! never stalls another. Every job gets its own [`CancelToken`]; cancelling
//! an in-flight job kills its running tool's process group and the
//! pipeline goes straight to workspace release.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::artifacts::Artifact;
use crate::error::{Error, PipelineError, Result};
use crate::execution::CancelToken;
use crate::job::Job;
use crate::orchestrator::{Orchestrator, Work};

/// Final job record plus what the pipeline produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: std::result::Result<Artifact, PipelineError>,
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobTicket {
    job_id: String,
    reply: Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Block until the job finishes. None if its worker died.
    pub fn wait(self) -> Option<JobOutcome> {
        self.reply.recv().ok()
    }
}

struct Queued {
    job: Job,
    work: Work,
    cancel: CancelToken,
    reply: Sender<JobOutcome>,
}

type TokenMap = Arc<Mutex<HashMap<String, CancelToken>>>;

pub struct Scheduler {
    sender: Option<Sender<Queued>>,
    workers: Vec<JoinHandle<()>>,
    tokens: TokenMap,
}

impl Scheduler {
    /// Start `workers` worker threads (at least one).
    pub fn new(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Queued>();
        let receiver = Arc::new(Mutex::new(receiver));
        let tokens: TokenMap = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..workers.max(1))
            .map(|index| {
                let orchestrator = Arc::clone(&orchestrator);
                let receiver = Arc::clone(&receiver);
                let tokens = Arc::clone(&tokens);
                std::thread::Builder::new()
                    .name(format!("apklab-worker-{}", index))
                    .spawn(move || worker_loop(index, orchestrator, receiver, tokens))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to start worker thread: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Scheduler started with {} workers", workers.len());

        Self {
            sender: Some(sender),
            workers,
            tokens,
        }
    }

    /// Queue `job`. Fails if a job with the same id is already queued or running.
    pub fn submit(&self, job: Job, work: Work) -> Result<JobTicket> {
        let sender = match (&self.sender, self.workers.is_empty()) {
            (Some(sender), false) => sender,
            _ => return Err(Error::Allocation("scheduler has no running workers".to_string())),
        };

        let cancel = CancelToken::new();
        {
            let mut tokens = self
                .tokens
                .lock()
                .map_err(|_| Error::Allocation("scheduler registry poisoned".to_string()))?;
            if tokens.contains_key(&job.id) {
                return Err(Error::Allocation(format!("job {} is already scheduled", job.id)));
            }
            tokens.insert(job.id.clone(), cancel.clone());
        }

        let job_id = job.id.clone();
        let (reply, receiver) = mpsc::channel();
        sender
            .send(Queued {
                job,
                work,
                cancel,
                reply,
            })
            .map_err(|_| {
                if let Ok(mut tokens) = self.tokens.lock() {
                    tokens.remove(&job_id);
                }
                Error::Allocation("scheduler is shutting down".to_string())
            })?;

        info!("job={} Queued", job_id);
        Ok(JobTicket {
            job_id,
            reply: receiver,
        })
    }

    /// Request cancellation. Returns false if the job is unknown or already finished.
    pub fn cancel(&self, job_id: &str) -> bool {
        let token = self.tokens.lock().ok().and_then(|t| t.get(job_id).cloned());
        match token {
            Some(token) => {
                info!("job={} Cancellation requested", job_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Stop accepting jobs, let queued ones finish, join the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Removes a job's cancel token when dropped, also when the pipeline panics.
struct Registration {
    tokens: TokenMap,
    job_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut tokens = match self.tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens.remove(&self.job_id);
    }
}

fn worker_loop(index: usize, orchestrator: Arc<Orchestrator>, receiver: Arc<Mutex<Receiver<Queued>>>, tokens: TokenMap) {
    loop {
        let next = match receiver.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(queued) = next else {
            break;
        };

        let Queued {
            mut job,
            work,
            cancel,
            reply,
        } = queued;

        debug!("job={} worker={} Picked up", job.id, index);
        // Dropped before `reply`, so a waiter never sees the job still registered
        let registration = Registration {
            tokens: Arc::clone(&tokens),
            job_id: job.id.clone(),
        };
        let result = orchestrator.run(&mut job, &work, &cancel);
        drop(registration);

        // Receiver may have been dropped; the job still ran
        let _ = reply.send(JobOutcome { job, result });
    }

    debug!("worker={} Exiting", index);
}
