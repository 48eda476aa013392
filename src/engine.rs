//! The keyed dependency engine.
//!
//! The engine is single-threaded: it interns keys, maps each to a rule,
//! and drives the task protocol (`start`, `provide_value`,
//! `inputs_available`, completion) sequentially.  Command execution itself
//! happens on the execution queue's worker threads; workers hand their
//! completions back over a channel, which serializes them into the engine
//! loop.
//!
//! Incremental recomputation: every completed key records the keys it
//! depended on plus two timestamps, the build it was last brought up to
//! date in (`built_at`) and the build its value last changed in
//! (`computed_at`).  A stored result is reused when its rule's validity
//! predicate accepts it and no recorded dependency has a newer
//! `computed_at` than its `built_at`; re-running a task that produces an
//! identical value keeps the old `computed_at`, cutting invalidation off
//! early.

use crate::db::{Db, StoredResult};
use crate::densemap::{self, DenseMap};
use crate::graph::BuildDescription;
use crate::key::BuildKey;
use crate::queue::{ExecutionQueue, JobContext, QueueJob};
use crate::system::{Delegate, Token};
use crate::tasks::{self, Rule, TaskVariant};
use crate::trace;
use crate::value::BuildValue;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;

/// Work a command task hands to the queue: runs tool-specific work against
/// a job context and yields the command's value plus a failure flag.
pub type CommandJob = Box<dyn FnOnce(&mut JobContext) -> (BuildValue, bool) + Send>;

/// The effects one task callback may have: requesting inputs, completing
/// with a value, or handing work to the execution queue.  Collected here
/// and applied by the engine once the callback returns.
pub struct TaskContext<'a> {
    delegate: &'a dyn Delegate,
    main_filename: &'a str,
    requests: Vec<(BuildKey, usize)>,
    result: Option<BuildValue>,
    job: Option<CommandJob>,
}

impl<'a> TaskContext<'a> {
    fn new(delegate: &'a dyn Delegate, main_filename: &'a str) -> TaskContext<'a> {
        TaskContext {
            delegate,
            main_filename,
            requests: Vec::new(),
            result: None,
            job: None,
        }
    }

    /// Request the value of another key; it arrives later through
    /// `provide_value` with the same input id.  Only valid during `start`.
    pub fn needs_input(&mut self, key: BuildKey, input_id: usize) {
        self.requests.push((key, input_id));
    }

    /// Complete the task with its value.
    pub fn complete(&mut self, value: BuildValue) {
        debug_assert!(self.result.is_none(), "task completed twice");
        self.result = Some(value);
    }

    /// Hand the task's work to the execution queue; the job's return value
    /// completes the task.
    pub fn enqueue_command_job(&mut self, job: CommandJob) {
        debug_assert!(self.job.is_none(), "task enqueued twice");
        self.job = Some(job);
    }

    pub fn delegate(&self) -> &dyn Delegate {
        self.delegate
    }

    /// Report a build diagnostic against the main build file.
    pub fn error(&mut self, message: &str) {
        self.delegate.error(self.main_filename, Token::none(), message);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KeyIdx(u32);
impl densemap::Index for KeyIdx {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for KeyIdx {
    fn from(u: usize) -> KeyIdx {
        KeyIdx(u as u32)
    }
}

/// Someone to notify when a key completes: either an input of a running
/// task, or a paused dependency scan.
struct Waiter {
    idx: KeyIdx,
    /// The input id of the requesting task, or None for a scan.
    input_id: Option<usize>,
}

struct RunningTask {
    task: TaskVariant,
    /// Requested inputs not yet provided.
    pending: usize,
    /// Every key this task requested, in request order.
    requested: Vec<KeyIdx>,
    /// Dependencies reported by the job while executing.
    discovered: Vec<KeyIdx>,
    prior: Option<StoredResult>,
    job_running: bool,
}

enum CellState {
    /// A stored value passed the validity check; its recorded dependencies
    /// are being demanded one by one to see whether any is newer.
    Scanning {
        prior: StoredResult,
        next_dep: usize,
    },
    Running(RunningTask),
    Complete {
        value: BuildValue,
        computed_at: u64,
    },
}

struct Cell {
    key: BuildKey,
    rule: Rule,
    state: CellState,
    waiters: Vec<Waiter>,
}

enum Event {
    Scan(KeyIdx),
    Start(KeyIdx),
    Provide {
        idx: KeyIdx,
        input_id: usize,
        dep: KeyIdx,
    },
    InputsAvailable(KeyIdx),
}

/// A job completion, sent from a worker thread.
struct FinishedJob {
    idx: KeyIdx,
    value: BuildValue,
    failed: bool,
    discovered: Vec<String>,
    errors: Vec<(String, String)>,
    tid: usize,
    span: (Instant, Instant),
}

/// Tracks faked "thread ids": integers assigned to in-flight jobs to track
/// parallelism in perf trace output.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                self.slots.push(true);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Engine<'a> {
    delegate: &'a dyn Delegate,
    desc: &'a mut BuildDescription,
    db: Option<&'a mut Db>,
    queue: Arc<dyn ExecutionQueue>,
    main_filename: &'a str,
    /// The current build iteration, used to stamp results.
    epoch: u64,
    ids: HashMap<BuildKey, KeyIdx>,
    cells: DenseMap<KeyIdx, Cell>,
    ready: VecDeque<Event>,
    finished_send: Sender<FinishedJob>,
    finished_recv: Receiver<FinishedJob>,
    in_flight: usize,
    tids: ThreadIds,
}

impl<'a> Engine<'a> {
    pub fn new(
        delegate: &'a dyn Delegate,
        desc: &'a mut BuildDescription,
        db: Option<&'a mut Db>,
        queue: Arc<dyn ExecutionQueue>,
        main_filename: &'a str,
    ) -> Engine<'a> {
        let epoch = db.as_ref().map(|db| db.epoch).unwrap_or(1);
        let (finished_send, finished_recv) = channel();
        Engine {
            delegate,
            desc,
            db,
            queue,
            main_filename,
            epoch,
            ids: HashMap::new(),
            cells: DenseMap::new(),
            ready: VecDeque::new(),
            finished_send,
            finished_recv,
            in_flight: 0,
            tids: ThreadIds::default(),
        }
    }

    /// Bring `root` up to date, running the engine until every demanded key
    /// has a value or the build can make no more progress.
    pub fn build(&mut self, root: BuildKey) -> anyhow::Result<()> {
        self.demand(root);
        loop {
            while let Some(event) = self.ready.pop_front() {
                self.process(event)?;
            }
            if self.in_flight > 0 {
                // Wait for external work.  May block for a long time.
                let fin = self
                    .finished_recv
                    .recv()
                    .expect("job completion channel closed");
                self.finish_job(fin)?;
                continue;
            }
            if self
                .cells
                .values()
                .all(|cell| matches!(cell.state, CellState::Complete { .. }))
            {
                break;
            }
            // No events, no running jobs, incomplete keys: the remaining
            // tasks are all waiting on one another.
            self.report_cycle();
            break;
        }
        // Each engine run is its own build iteration.
        if let Some(db) = self.db.as_mut() {
            db.epoch = self.epoch + 1;
        }
        Ok(())
    }

    /// Intern a key and decide how its value will materialize: a clean
    /// stored result scans its dependencies, anything else runs its task.
    fn demand(&mut self, key: BuildKey) -> KeyIdx {
        if let Some(&idx) = self.ids.get(&key) {
            return idx;
        }
        let rule = tasks::lookup_rule(self.desc, &key);
        let prior = self
            .db
            .as_ref()
            .and_then(|db| db.lookup(&key))
            .cloned();

        let idx = self.cells.next_id();
        self.ids.insert(key.clone(), idx);

        let state = match prior {
            Some(prior) if tasks::is_result_valid(self.desc, &rule.kind, &prior.value) => {
                self.ready.push_back(Event::Scan(idx));
                CellState::Scanning { prior, next_dep: 0 }
            }
            prior => {
                self.ready.push_back(Event::Start(idx));
                CellState::Running(RunningTask {
                    task: tasks::create_task(&rule.kind),
                    pending: 0,
                    requested: Vec::new(),
                    discovered: Vec::new(),
                    prior,
                    job_running: false,
                })
            }
        };
        self.cells.push(Cell {
            key,
            rule,
            state,
            waiters: Vec::new(),
        });
        idx
    }

    fn process(&mut self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Scan(idx) => self.process_scan(idx),
            Event::Start(idx) => self.process_start(idx),
            Event::Provide { idx, input_id, dep } => self.process_provide(idx, input_id, dep),
            Event::InputsAvailable(idx) => self.process_inputs_available(idx),
        }
    }

    /// Walk a stored result's dependencies.  Any dependency whose value
    /// changed after this result was built invalidates it; otherwise the
    /// stored value is reused without running the task.
    fn process_scan(&mut self, idx: KeyIdx) -> anyhow::Result<()> {
        loop {
            let next = {
                let cell = self.cells.get(idx);
                let CellState::Scanning { prior, next_dep } = &cell.state else {
                    return Ok(());
                };
                prior.deps.get(*next_dep).map(|k| (k.clone(), prior.built_at))
            };
            let Some((dep_key, built_at)) = next else {
                // Scan clean: reuse the stored result.
                let cell = self.cells.get_mut(idx);
                let state = std::mem::replace(
                    &mut cell.state,
                    CellState::Complete {
                        value: BuildValue::Invalid,
                        computed_at: 0,
                    },
                );
                let CellState::Scanning { prior, .. } = state else {
                    unreachable!()
                };
                cell.state = CellState::Complete {
                    value: prior.value,
                    computed_at: prior.computed_at,
                };
                self.notify_waiters(idx);
                return Ok(());
            };

            let dep = self.demand(dep_key);
            let dep_newer = match &self.cells.get(dep).state {
                CellState::Complete { computed_at, .. } => Some(*computed_at > built_at),
                _ => None,
            };
            match dep_newer {
                Some(true) => {
                    self.invalidate_scan(idx);
                    return Ok(());
                }
                Some(false) => {
                    let cell = self.cells.get_mut(idx);
                    let CellState::Scanning { next_dep, .. } = &mut cell.state else {
                        unreachable!()
                    };
                    *next_dep += 1;
                }
                None => {
                    // Pause until the dependency completes; the scan
                    // resumes at the same dependency.
                    self.cells.get_mut(dep).waiters.push(Waiter {
                        idx,
                        input_id: None,
                    });
                    return Ok(());
                }
            }
        }
    }

    /// A scanned dependency turned out newer: fall back to running the
    /// task, keeping the prior result for the early cutoff comparison.
    fn invalidate_scan(&mut self, idx: KeyIdx) {
        let cell = self.cells.get_mut(idx);
        let state = std::mem::replace(
            &mut cell.state,
            CellState::Complete {
                value: BuildValue::Invalid,
                computed_at: 0,
            },
        );
        let CellState::Scanning { prior, .. } = state else {
            unreachable!()
        };
        cell.state = CellState::Running(RunningTask {
            task: tasks::create_task(&cell.rule.kind),
            pending: 0,
            requested: Vec::new(),
            discovered: Vec::new(),
            prior: Some(prior),
            job_running: false,
        });
        self.ready.push_back(Event::Start(idx));
    }

    fn process_start(&mut self, idx: KeyIdx) -> anyhow::Result<()> {
        let mut ctx = TaskContext::new(self.delegate, self.main_filename);
        {
            let cell = self.cells.get_mut(idx);
            let CellState::Running(running) = &mut cell.state else {
                return Ok(());
            };
            running.task.start(&mut ctx, self.desc);
            if let Some(prior) = &running.prior {
                let value = prior.value.clone();
                running.task.provide_prior_value(&mut ctx, self.desc, &value);
            }
        }
        debug_assert!(ctx.result.is_none() && ctx.job.is_none());

        let requests = std::mem::take(&mut ctx.requests);
        let total = requests.len();
        let mut immediate = Vec::new();
        for (key, input_id) in requests {
            let dep = self.demand(key);
            {
                let cell = self.cells.get_mut(idx);
                let CellState::Running(running) = &mut cell.state else {
                    unreachable!()
                };
                running.requested.push(dep);
            }
            if matches!(self.cells.get(dep).state, CellState::Complete { .. }) {
                immediate.push((input_id, dep));
            } else {
                self.cells.get_mut(dep).waiters.push(Waiter {
                    idx,
                    input_id: Some(input_id),
                });
            }
        }
        {
            let cell = self.cells.get_mut(idx);
            let CellState::Running(running) = &mut cell.state else {
                unreachable!()
            };
            running.pending = total;
        }
        if total == 0 {
            self.ready.push_back(Event::InputsAvailable(idx));
        } else {
            for (input_id, dep) in immediate {
                self.ready.push_back(Event::Provide { idx, input_id, dep });
            }
        }
        Ok(())
    }

    fn process_provide(&mut self, idx: KeyIdx, input_id: usize, dep: KeyIdx) -> anyhow::Result<()> {
        let value = {
            let CellState::Complete { value, .. } = &self.cells.get(dep).state else {
                unreachable!("provided value from incomplete dependency")
            };
            value.clone()
        };
        let mut ctx = TaskContext::new(self.delegate, self.main_filename);
        let now_available = {
            let cell = self.cells.get_mut(idx);
            let CellState::Running(running) = &mut cell.state else {
                return Ok(());
            };
            running.task.provide_value(&mut ctx, self.desc, input_id, &value);
            running.pending -= 1;
            running.pending == 0
        };
        debug_assert!(ctx.requests.is_empty() && ctx.result.is_none() && ctx.job.is_none());
        if now_available {
            self.ready.push_back(Event::InputsAvailable(idx));
        }
        Ok(())
    }

    fn process_inputs_available(&mut self, idx: KeyIdx) -> anyhow::Result<()> {
        let mut ctx = TaskContext::new(self.delegate, self.main_filename);
        {
            let cell = self.cells.get_mut(idx);
            let CellState::Running(running) = &mut cell.state else {
                return Ok(());
            };
            running.task.inputs_available(&mut ctx, self.desc);
        }
        if let Some(value) = ctx.result.take() {
            self.complete_cell(idx, value)?;
        } else if let Some(job) = ctx.job.take() {
            self.submit_job(idx, job);
        } else {
            debug_assert!(false, "task neither completed nor enqueued work");
        }
        Ok(())
    }

    fn submit_job(&mut self, idx: KeyIdx, job: CommandJob) {
        {
            let cell = self.cells.get_mut(idx);
            let CellState::Running(running) = &mut cell.state else {
                unreachable!()
            };
            running.job_running = true;
        }
        let tid = self.tids.claim();
        let queue = self.queue.clone();
        let send = self.finished_send.clone();
        self.in_flight += 1;
        let wrapped: QueueJob = Box::new(move || {
            let mut jctx = JobContext::new(queue);
            let start = Instant::now();
            let (value, failed) = job(&mut jctx);
            let fin = FinishedJob {
                idx,
                value,
                failed,
                discovered: jctx.discovered,
                errors: jctx.errors,
                tid,
                span: (start, Instant::now()),
            };
            // The send only fails if the engine is gone, e.g. shutdown.
            let _ = send.send(fin);
        });
        self.queue.add_job(wrapped);
    }

    fn finish_job(&mut self, fin: FinishedJob) -> anyhow::Result<()> {
        self.in_flight -= 1;
        self.tids.release(fin.tid);
        trace::complete(self.cells.get(fin.idx).key.name(), fin.tid + 1, fin.span);

        for (filename, message) in &fin.errors {
            self.delegate.error(filename, Token::none(), message);
        }
        if fin.failed {
            self.delegate.had_command_failure();
        }

        // Dependencies discovered during execution join the recorded deps,
        // extending the next build's scan; demand them so their own values
        // land in the database.
        let discovered: Vec<KeyIdx> = fin
            .discovered
            .iter()
            .map(|path| self.demand(BuildKey::node(path.as_str())))
            .collect();
        {
            let cell = self.cells.get_mut(fin.idx);
            let CellState::Running(running) = &mut cell.state else {
                unreachable!()
            };
            for dep in discovered {
                if !running.requested.contains(&dep) && !running.discovered.contains(&dep) {
                    running.discovered.push(dep);
                }
            }
        }
        self.complete_cell(fin.idx, fin.value)
    }

    fn complete_cell(&mut self, idx: KeyIdx, value: BuildValue) -> anyhow::Result<()> {
        debug_assert!(!value.is_invalid());
        let (key, deps, computed_at) = {
            let cell = self.cells.get_mut(idx);
            let state = std::mem::replace(
                &mut cell.state,
                CellState::Complete {
                    value: BuildValue::Invalid,
                    computed_at: 0,
                },
            );
            let CellState::Running(running) = state else {
                unreachable!("completing a cell that is not running")
            };
            // A recomputed-but-identical value keeps its old timestamp so
            // dependents stay clean.
            let computed_at = match &running.prior {
                Some(prior) if prior.value == value => prior.computed_at,
                _ => self.epoch,
            };
            let mut deps = running.requested;
            deps.extend(running.discovered);
            cell.state = CellState::Complete {
                value: value.clone(),
                computed_at,
            };
            (cell.key.clone(), deps, computed_at)
        };

        if let Some(db) = self.db.as_mut() {
            let deps = deps
                .into_iter()
                .map(|dep| self.cells.get(dep).key.clone())
                .collect();
            db.write(
                &key,
                StoredResult {
                    value,
                    deps,
                    built_at: self.epoch,
                    computed_at,
                },
            )?;
        }

        self.notify_waiters(idx);
        Ok(())
    }

    fn notify_waiters(&mut self, idx: KeyIdx) {
        let waiters = std::mem::take(&mut self.cells.get_mut(idx).waiters);
        for waiter in waiters {
            match waiter.input_id {
                None => self.ready.push_back(Event::Scan(waiter.idx)),
                Some(input_id) => self.ready.push_back(Event::Provide {
                    idx: waiter.idx,
                    input_id,
                    dep: idx,
                }),
            }
        }
    }

    /// The build stalled: every incomplete key is waiting on another one.
    /// Find one cycle in the wait-for graph and report it.
    fn report_cycle(&mut self) {
        let mut stack = Vec::new();
        let mut visited = vec![false; self.cells.len()];
        for (idx, cell) in self.cells.iter() {
            if matches!(cell.state, CellState::Complete { .. }) {
                continue;
            }
            if let Some(cycle) = self.find_cycle(idx, &mut stack, &mut visited) {
                self.cycle_detected(&cycle);
                return;
            }
        }
        // A stall with no detectable cycle still cannot make progress;
        // report it the same way rather than hanging.
        self.cycle_detected(&[]);
    }

    fn find_cycle(
        &self,
        idx: KeyIdx,
        stack: &mut Vec<KeyIdx>,
        visited: &mut [bool],
    ) -> Option<Vec<KeyIdx>> {
        if let Some(pos) = stack.iter().position(|&i| i == idx) {
            return Some(stack[pos..].to_vec());
        }
        if visited[densemap::Index::index(&idx)] {
            return None;
        }
        visited[densemap::Index::index(&idx)] = true;
        stack.push(idx);
        for dep in self.waiting_on(idx) {
            if let Some(cycle) = self.find_cycle(dep, stack, visited) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    /// The keys a cell is currently blocked on.
    fn waiting_on(&self, idx: KeyIdx) -> Vec<KeyIdx> {
        let cell = self.cells.get(idx);
        match &cell.state {
            CellState::Scanning { prior, next_dep } => prior
                .deps
                .get(*next_dep)
                .and_then(|key| self.ids.get(key))
                .copied()
                .into_iter()
                .collect(),
            CellState::Running(running) if !running.job_running => running
                .requested
                .iter()
                .filter(|&&dep| !matches!(self.cells.get(dep).state, CellState::Complete { .. }))
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn cycle_detected(&self, _cycle: &[KeyIdx]) {
        self.delegate
            .error(self.main_filename, Token::none(), "cycle detected while building");
    }
}
