//! Runs command jobs, potentially in parallel.
//! Unaware of the build graph; just closure execution and shell dispatch.

use crate::process;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A unit of work submitted to the queue.  Completion is signaled by the
/// closure itself (it owns a channel back to the engine), so the queue only
/// has to run it.
pub type QueueJob = Box<dyn FnOnce() + Send>;

/// Tool-specific work run inside a job, returning whether it succeeded.
pub type JobFn = Box<dyn FnOnce(&mut JobContext) -> bool + Send>;

/// Launches external work for the engine.  `add_job` must eventually run
/// the job exactly once; jobs may run concurrently on worker threads.
pub trait ExecutionQueue: Send + Sync {
    fn add_job(&self, job: QueueJob);

    /// Run a shell command, returning whether it exited successfully.
    /// Called from within job bodies, on the worker thread that runs them.
    fn execute_shell_command(&self, args: &str) -> bool;
}

/// The context a job body runs against: shell dispatch plus collection of
/// dependencies discovered and errors raised while executing.
pub struct JobContext {
    queue: Arc<dyn ExecutionQueue>,
    pub(crate) discovered: Vec<String>,
    pub(crate) errors: Vec<(String, String)>,
}

impl JobContext {
    pub fn new(queue: Arc<dyn ExecutionQueue>) -> JobContext {
        JobContext {
            queue,
            discovered: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn execute_shell_command(&mut self, args: &str) -> bool {
        self.queue.execute_shell_command(args)
    }

    /// Report a dependency edge found while executing, e.g. a path read out
    /// of a compiler-written deps file.
    pub fn discovered_dependency(&mut self, path: &str) {
        self.discovered.push(path.to_string());
    }

    /// Report an error against a file; routed to the host delegate when the
    /// job's completion is processed.
    pub fn error(&mut self, filename: &str, message: String) {
        self.errors.push((filename.to_string(), message));
    }
}

/// The default queue: a fixed set of worker lanes pulling jobs off a shared
/// channel.
pub struct LaneQueue {
    sender: Mutex<Option<Sender<QueueJob>>>,
    lanes: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl LaneQueue {
    pub fn new(parallelism: usize) -> LaneQueue {
        let (sender, receiver) = channel::<QueueJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut lanes = Vec::with_capacity(parallelism);
        for _ in 0..parallelism.max(1) {
            let receiver = receiver.clone();
            lanes.push(std::thread::spawn(move || lane_loop(receiver)));
        }
        LaneQueue {
            sender: Mutex::new(Some(sender)),
            lanes: Mutex::new(lanes),
        }
    }
}

fn lane_loop(receiver: Arc<Mutex<Receiver<QueueJob>>>) {
    loop {
        // Hold the lock only to receive; the job itself runs unlocked.
        let job = match receiver.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        job();
    }
}

impl ExecutionQueue for LaneQueue {
    fn add_job(&self, job: QueueJob) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            // Send fails only once the lanes have shut down.
            let _ = sender.send(job);
        }
    }

    fn execute_shell_command(&self, args: &str) -> bool {
        process::run_shell_command(args)
    }
}

impl Drop for LaneQueue {
    fn drop(&mut self) {
        // Closing the channel ends each lane's receive loop.
        self.sender.lock().unwrap().take();
        for lane in self.lanes.lock().unwrap().drain(..) {
            let _ = lane.join();
        }
    }
}
