//! The build engine: rules keyed by opaque byte strings, tasks that compute
//! their values, and the dependency scanner that decides the minimum set of
//! rules to re-run on each build.
//!
//! The engine runs single-threaded on the caller's thread ("the driver");
//! task bodies may hand work to the execution queue's lanes and report
//! completion back through the engine's inbox.  All graph state is owned by
//! the driver and indexed by dense ids rather than linked by pointers.

use crate::db::BuildDb;
use crate::queue::{ExecutionQueue, Job, JobContext};
use crate::trace::Trace;
use anyhow::bail;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

/// A rule identity: an opaque, immutable byte string.  Equality is exact
/// bytewise comparison; the engine never interprets the contents.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Key {
        Key(bytes.into())
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key(s.as_bytes().to_vec())
    }
}
impl From<String> for Key {
    fn from(s: String) -> Key {
        Key(s.into_bytes())
    }
}
impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Key {
        Key(b.to_vec())
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// An opaque value produced by a rule.  The engine copies it into the
/// database verbatim; only clients interpret it.
pub type Value = Vec<u8>;

/// The persisted outcome of running a rule, along with the stamps the
/// scanner compares.  `built_at` is the iteration the value last actually
/// changed; `computed_at` is the iteration the result was last confirmed,
/// with or without recomputation.  `computed_at >= built_at` always holds,
/// and `computed_at == 0` means the rule has never been built.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleResult {
    pub value: Value,
    pub dependencies: Vec<Key>,
    pub built_at: u64,
    pub computed_at: u64,
}

/// Status transitions reported through a rule's status callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleStatus {
    Scanning,
    Complete,
}

pub type Action = Box<dyn FnMut() -> Box<dyn Task>>;

/// The registration for a single key: how to compute it, and optionally how
/// to check a cached value and observe status changes.
pub struct Rule {
    pub key: Key,
    /// Produces a fresh task each time the rule must execute.
    pub action: Action,
    /// Decides whether a cached value is still acceptable without re-running.
    /// Absent means cached results are valid whenever the inputs are.
    pub is_valid: Option<Box<dyn FnMut(&Value) -> bool>>,
    pub update_status: Option<Box<dyn FnMut(RuleStatus)>>,
}

impl Rule {
    pub fn new(key: impl Into<Key>, action: impl FnMut() -> Box<dyn Task> + 'static) -> Rule {
        Rule {
            key: key.into(),
            action: Box::new(action),
            is_valid: None,
            update_status: None,
        }
    }

    pub fn with_validity(mut self, f: impl FnMut(&Value) -> bool + 'static) -> Rule {
        self.is_valid = Some(Box::new(f));
        self
    }

    pub fn with_status(mut self, f: impl FnMut(RuleStatus) + 'static) -> Rule {
        self.update_status = Some(Box::new(f));
        self
    }
}

/// One execution of a rule.  The engine drives the task through a fixed
/// protocol: `prior_value` (if a cached value exists), then `start`, then
/// one `provide_value` per requested input in request order, then
/// `inputs_available`, after which the task must eventually complete by
/// calling `TaskContext::complete`, either directly or from a job spawned
/// on the execution queue.
pub trait Task {
    /// Receives the previous cached value, before `start`.
    fn prior_value(&mut self, _value: &Value) {}

    /// Request inputs via `TaskContext::needs_input`.  Requesting none means
    /// the task proceeds straight to `inputs_available`.
    fn start(&mut self, _engine: &mut TaskContext) {}

    /// Receives one input value.  The `id` is the one passed to
    /// `needs_input`; values arrive in request order regardless of the
    /// order in which inputs finished.  Requesting further inputs from here
    /// is allowed.
    fn provide_value(&mut self, _engine: &mut TaskContext, _id: usize, _value: &Value) {}

    /// All requested inputs have been provided.
    fn inputs_available(&mut self, engine: &mut TaskContext);
}

/// Client hooks the engine consults during a build.  Shared across threads;
/// `is_cancelled` in particular is polled from queue lanes.
pub trait Delegate: Send + Sync {
    /// Called once for a key that has no registered rule; returning a rule
    /// registers it as if it had been added up front.
    fn lookup_rule(&self, _key: &Key) -> Option<Rule> {
        None
    }

    /// Called with the keys forming a dependency cycle, in dependency order,
    /// before the build fails.
    fn cycle_detected(&self, _cycle: &[Key]) {}

    /// Reports a build error before it surfaces from `build`.
    fn error(&self, _message: &str) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    /// Advisory notification that a client-level command failed.
    fn had_command_failure(&self) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct RuleId(usize);
impl RuleId {
    fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub(crate) usize);
impl TaskId {
    fn index(&self) -> usize {
        self.0
    }
}

/// Rule states over the course of one build.  `Complete` is only current if
/// the result's `computed_at` matches the build iteration; stale marks are
/// lazily treated as `Incomplete` rather than reset eagerly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RuleState {
    Incomplete,
    Scanning,
    NeedsToRun,
    DoesNotNeedToRun,
    InProgressWaiting,
    InProgressComputing,
    Complete,
}

/// A request to scan one recorded dependency of a rule, resumable when the
/// dependency itself finishes scanning or running.
struct ScanRequest {
    rule: RuleId,
    input_index: usize,
    /// Cached resolution of the dependency key, filled on first processing.
    input: Option<RuleId>,
}

/// A request for the value of a key, either on behalf of a task input or
/// anonymously (the build root, and discovered dependencies being brought
/// up to date).
struct InputRequest {
    task: Option<TaskId>,
    key: Key,
    input: Option<RuleId>,
    /// Task-chosen input id, echoed back in `provide_value`.
    id: usize,
    /// Ordinal of this request within its task, for in-order delivery.
    seq: usize,
}

/// Bookkeeping attached to a rule only while it is being scanned.
#[derive(Default)]
struct ScanRecord {
    paused_input_requests: Vec<InputRequest>,
    deferred_scans: Vec<ScanRequest>,
}

struct RuleInfo {
    rule: Rule,
    state: RuleState,
    result: RuleResult,
    scan: Option<ScanRecord>,
    task: Option<TaskId>,
}

struct TaskInfo {
    /// Taken out of the slot while a task callback runs.
    task: Option<Box<dyn Task>>,
    for_rule: RuleId,
    /// Requested inputs not yet provided.
    wait_count: usize,
    requests_made: usize,
    /// Finished inputs buffered for in-order delivery, indexed by request
    /// ordinal; entries hold the task's input id and the input's rule.
    ready: Vec<Option<(usize, RuleId)>>,
    next_deliver: usize,
    requested_by: Vec<InputRequest>,
    deferred_scans: Vec<ScanRequest>,
    discovered: Vec<Key>,
    /// How many discovered keys already have anonymous requests issued.
    discovered_requested: usize,
    needs_scan_again: bool,
}

impl TaskInfo {
    fn new(task: Box<dyn Task>, for_rule: RuleId) -> TaskInfo {
        TaskInfo {
            task: Some(task),
            for_rule,
            wait_count: 0,
            requests_made: 0,
            ready: Vec::new(),
            next_deliver: 0,
            requested_by: Vec::new(),
            deferred_scans: Vec::new(),
            discovered: Vec::new(),
            discovered_requested: 0,
            needs_scan_again: false,
        }
    }
}

/// Messages posted to the driver's inbox from task callbacks and queue lanes.
pub(crate) enum EngineMessage {
    TaskComplete {
        task: TaskId,
        value: Value,
    },
    TaskDiscovered {
        task: TaskId,
        key: Key,
    },
    /// A job was dropped unexecuted because the build was cancelled.
    TaskCancelled {
        task: TaskId,
    },
    JobPanicked {
        payload: Box<dyn std::any::Any + Send>,
    },
}

/// The engine handle passed into task callbacks on the driver.
pub struct TaskContext<'a> {
    engine: &'a mut BuildEngine,
    task: TaskId,
}

impl TaskContext<'_> {
    /// Declare a dependency on `key`; its value will arrive via
    /// `provide_value` with the given `id`.  Only legal from `start` and
    /// `provide_value`.
    pub fn needs_input(&mut self, key: impl Into<Key>, id: usize) {
        self.engine.task_needs_input(self.task, key.into(), id);
    }

    /// Report a dependency found while computing, e.g. parsed out of tool
    /// output.  Only legal from `inputs_available` onward.
    pub fn discovered_dependency(&mut self, key: impl Into<Key>) {
        self.engine.task_discovered_dependency(self.task, key.into());
    }

    /// Complete the task with its output value.
    pub fn complete(&mut self, value: Value) {
        self.engine.task_complete(self.task, value);
    }

    /// Run `job` on an execution queue lane.  The job receives a context
    /// through which it reports completion and discovered dependencies.
    pub fn spawn(&mut self, job: impl FnOnce(&mut JobContext) + Send + 'static) {
        self.engine.queue.spawn(Job {
            task: self.task,
            f: Box::new(job),
        });
    }
}

pub struct BuildEngine {
    delegate: Arc<dyn Delegate>,
    rules: Vec<RuleInfo>,
    key_map: HashMap<Key, RuleId>,
    /// Live tasks for the current build; slots are freed on completion.
    tasks: Vec<Option<TaskInfo>>,
    db: Option<Box<dyn BuildDb>>,
    trace: Option<Trace>,
    queue: ExecutionQueue,

    /// Incremented once per top-level build; stamps results.
    iteration: u64,

    scan_queue: VecDeque<ScanRequest>,
    input_queue: VecDeque<InputRequest>,
    ready_tasks: VecDeque<TaskId>,
    /// Tasks past `inputs_available` that have not yet completed.
    outstanding: usize,

    inbox: mpsc::Receiver<EngineMessage>,
    inbox_send: mpsc::Sender<EngineMessage>,

    /// Mirror of the delegate's cancellation state, polled by queue lanes.
    cancel_flag: Arc<AtomicBool>,
    cancelled: bool,
    cycled: bool,
    poisoned: bool,
}

impl BuildEngine {
    pub fn new(delegate: Arc<dyn Delegate>) -> BuildEngine {
        Self::with_lanes(delegate, crate::queue::default_lane_count())
    }

    /// One lane; jobs run in strict enqueue order.
    pub fn serial(delegate: Arc<dyn Delegate>) -> BuildEngine {
        Self::with_lanes(delegate, 1)
    }

    pub fn with_lanes(delegate: Arc<dyn Delegate>, lanes: usize) -> BuildEngine {
        let (inbox_send, inbox) = mpsc::channel();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let queue = ExecutionQueue::new(lanes, inbox_send.clone(), cancel_flag.clone());
        BuildEngine {
            delegate,
            rules: Vec::new(),
            key_map: HashMap::new(),
            tasks: Vec::new(),
            db: None,
            trace: None,
            queue,
            iteration: 0,
            scan_queue: VecDeque::new(),
            input_queue: VecDeque::new(),
            ready_tasks: VecDeque::new(),
            outstanding: 0,
            inbox,
            inbox_send,
            cancel_flag,
            cancelled: false,
            cycled: false,
            poisoned: false,
        }
    }

    /// Register a rule.  Registering the same key twice is a usage error.
    pub fn add_rule(&mut self, rule: Rule) {
        if self.key_map.contains_key(&rule.key) {
            panic!("attempt to register duplicate rule {:?}", rule.key);
        }
        self.insert_rule(rule);
    }

    /// Attach a result database.  Must happen before any rules are
    /// registered and before the first build; the engine resumes from the
    /// database's iteration counter.
    pub fn attach_db(&mut self, db: Box<dyn BuildDb>) {
        assert!(self.db.is_none(), "database already attached");
        assert!(
            self.iteration == 0 && self.rules.is_empty(),
            "attach_db must precede rule registration and builds"
        );
        self.iteration = db.current_iteration();
        self.db = Some(db);
    }

    /// Write a JSON log of engine events to `path` for this engine's
    /// remaining lifetime.
    pub fn enable_tracing(&mut self, path: &str) -> anyhow::Result<()> {
        self.trace = Some(Trace::open(path)?);
        Ok(())
    }

    pub fn current_iteration(&self) -> u64 {
        self.iteration
    }

    /// Bring `key` up to date and return its value, re-running only rules
    /// whose inputs changed since they last ran.
    pub fn build(&mut self, key: impl Into<Key>) -> anyhow::Result<Value> {
        if self.poisoned {
            bail!("build engine poisoned by an earlier failure");
        }
        let key = key.into();

        self.cancelled = false;
        self.cancel_flag.store(false, Ordering::SeqCst);
        if let Some(db) = &mut self.db {
            db.build_started()?;
        }
        self.iteration += 1;
        if let Some(t) = &mut self.trace {
            t.build_started(self.iteration);
        }

        self.input_queue.push_back(InputRequest {
            task: None,
            key: key.clone(),
            input: None,
            id: 0,
            seq: 0,
        });

        // Assume the worst until the build exits in a controlled way; a
        // panic escaping from a task leaves the engine unusable.
        self.poisoned = true;
        match self.run_to_completion(&key) {
            Ok(value) => {
                self.poisoned = false;
                Ok(value)
            }
            Err(err) => {
                if !self.cycled {
                    self.abort_build();
                    self.poisoned = false;
                }
                self.delegate.error(&format!("{}", err));
                Err(err)
            }
        }
    }

    /// Dump the current rule graph in Graphviz DOT format.
    pub fn dump_graph(&self, path: &str) -> anyhow::Result<()> {
        use std::io::Write;
        let mut w = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(w, "digraph corebuild {{")?;
        writeln!(w, "rankdir=\"LR\"")?;
        writeln!(w, "node [fontsize=10, shape=box, height=0.25]")?;
        writeln!(w, "edge [fontsize=10]")?;

        let mut infos: Vec<&RuleInfo> = self.rules.iter().collect();
        infos.sort_by(|a, b| a.rule.key.cmp(&b.rule.key));
        for info in infos {
            writeln!(w, "{:?}", info.rule.key)?;
            for dep in &info.result.dependencies {
                writeln!(w, "{:?} -> {:?}", info.rule.key, dep)?;
            }
        }
        writeln!(w, "}}")?;
        w.flush()?;
        Ok(())
    }

    fn rule(&self, id: RuleId) -> &RuleInfo {
        &self.rules[id.index()]
    }
    fn rule_mut(&mut self, id: RuleId) -> &mut RuleInfo {
        &mut self.rules[id.index()]
    }
    fn task_info(&mut self, id: TaskId) -> &mut TaskInfo {
        self.tasks[id.index()]
            .as_mut()
            .expect("reference to retired task")
    }

    fn insert_rule(&mut self, rule: Rule) -> RuleId {
        let id = RuleId(self.rules.len());
        let mut result = RuleResult::default();
        if let Some(db) = &self.db {
            if let Some(stored) = db.lookup_rule_result(&rule.key) {
                result = stored;
            }
        }
        self.key_map.insert(rule.key.clone(), id);
        self.rules.push(RuleInfo {
            rule,
            state: RuleState::Incomplete,
            result,
            scan: None,
            task: None,
        });
        id
    }

    fn rule_id_for_key(&mut self, key: &Key) -> anyhow::Result<RuleId> {
        if let Some(&id) = self.key_map.get(key) {
            return Ok(id);
        }
        match self.delegate.lookup_rule(key) {
            Some(rule) => {
                assert!(
                    rule.key == *key,
                    "delegate returned rule {:?} for key {:?}",
                    rule.key,
                    key
                );
                Ok(self.insert_rule(rule))
            }
            None => bail!("no rule to build key {:?}", key),
        }
    }

    fn notify_status(&mut self, id: RuleId, status: RuleStatus) {
        let info = self.rule_mut(id);
        if let Some(f) = info.rule.update_status.as_mut() {
            f(status);
        }
    }

    /// Mark a rule up to date for this iteration.
    fn mark_complete(&mut self, id: RuleId) {
        let iteration = self.iteration;
        let info = self.rule_mut(id);
        info.state = RuleState::Complete;
        info.result.computed_at = iteration;
        self.notify_status(id, RuleStatus::Complete);
    }

    fn is_complete(&self, id: RuleId) -> bool {
        let info = self.rule(id);
        info.state == RuleState::Complete && info.result.computed_at == self.iteration
    }

    /// Begin (or report the state of) scanning a rule.  Returns true when
    /// the rule has a scan verdict; false means the caller must wait for an
    /// in-flight scan.
    fn scan_rule(&mut self, id: RuleId) -> bool {
        match self.rule(id).state {
            RuleState::Scanning => return false,
            RuleState::NeedsToRun
            | RuleState::DoesNotNeedToRun
            | RuleState::InProgressWaiting
            | RuleState::InProgressComputing => return true,
            RuleState::Complete if self.is_complete(id) => return true,
            // A stale Complete mark from a prior iteration rescans.
            RuleState::Complete | RuleState::Incomplete => {}
        }

        if let Some(t) = &mut self.trace {
            t.rule_scan_start(self.iteration, &self.rules[id.index()].rule.key);
        }
        self.notify_status(id, RuleStatus::Scanning);

        let info = self.rule_mut(id);
        if info.result.computed_at == 0 {
            // Never built.
            info.state = RuleState::NeedsToRun;
            self.trace_scan_end(id, "never-built");
            return true;
        }
        let invalid = match info.rule.is_valid.as_mut() {
            Some(valid) => !valid(&info.result.value),
            None => false,
        };
        if invalid {
            let info = self.rule_mut(id);
            info.state = RuleState::NeedsToRun;
            self.trace_scan_end(id, "invalid-value");
            return true;
        }
        let info = self.rule_mut(id);
        if info.result.dependencies.is_empty() {
            info.state = RuleState::DoesNotNeedToRun;
            self.trace_scan_end(id, "up-to-date");
            return true;
        }

        // The verdict depends on the recorded inputs; scan them iteratively
        // off an explicit queue so arbitrarily deep graphs cannot overflow
        // the stack.
        info.state = RuleState::Scanning;
        info.scan = Some(ScanRecord::default());
        self.scan_queue.push_back(ScanRequest {
            rule: id,
            input_index: 0,
            input: None,
        });
        false
    }

    fn trace_scan_end(&mut self, id: RuleId, outcome: &str) {
        if let Some(t) = &mut self.trace {
            t.rule_scan_end(self.iteration, &self.rules[id.index()].rule.key, outcome);
        }
    }

    /// Walk one rule's recorded dependencies, deferring when an input is
    /// still being scanned or run.
    fn process_scan_request(&mut self, mut req: ScanRequest) -> anyhow::Result<()> {
        debug_assert!(self.rule(req.rule).state == RuleState::Scanning);
        loop {
            let input = match req.input {
                Some(input) => input,
                None => {
                    let key = self.rule(req.rule).result.dependencies[req.input_index].clone();
                    self.rule_id_for_key(&key)?
                }
            };
            req.input = Some(input);

            if !self.scan_rule(input) {
                // Resumed when the input's own scan finishes.
                self.rule_mut(input)
                    .scan
                    .as_mut()
                    .unwrap()
                    .deferred_scans
                    .push(req);
                return Ok(());
            }
            if !self.demand_rule(input)? {
                // Resumed when the input's task completes.
                let tid = self.rule(input).task.expect("in-progress rule without task");
                self.task_info(tid).deferred_scans.push(req);
                return Ok(());
            }

            // The input's value changed after this rule last confirmed its
            // result, so the result is out of date.
            if self.rule(req.rule).result.computed_at < self.rule(input).result.built_at {
                self.finish_scan(req.rule, RuleState::NeedsToRun, "input-rebuilt");
                return Ok(());
            }

            req.input_index += 1;
            req.input = None;
            if req.input_index == self.rule(req.rule).result.dependencies.len() {
                self.finish_scan(req.rule, RuleState::DoesNotNeedToRun, "up-to-date");
                return Ok(());
            }
        }
    }

    fn finish_scan(&mut self, id: RuleId, new_state: RuleState, outcome: &str) {
        let record = self.rule_mut(id).scan.take().expect("scan without record");
        for req in record.deferred_scans {
            self.scan_queue.push_back(req);
        }
        for req in record.paused_input_requests {
            self.input_queue.push_back(req);
        }
        self.rule_mut(id).state = new_state;
        self.trace_scan_end(id, outcome);
    }

    /// Request construction of a scanned rule's value.  Returns true when
    /// the value is already available this iteration.
    fn demand_rule(&mut self, id: RuleId) -> anyhow::Result<bool> {
        match self.rule(id).state {
            RuleState::Complete if self.is_complete(id) => Ok(true),
            RuleState::InProgressWaiting | RuleState::InProgressComputing => Ok(false),
            RuleState::DoesNotNeedToRun => {
                self.mark_complete(id);
                Ok(true)
            }
            RuleState::NeedsToRun => {
                self.start_task(id);
                Ok(false)
            }
            state => panic!("demanded rule in unscanned state {:?}", state),
        }
    }

    fn start_task(&mut self, id: RuleId) {
        let mut task = {
            let info = self.rule_mut(id);
            (info.rule.action)()
        };
        let tid = TaskId(self.tasks.len());
        if let Some(t) = &mut self.trace {
            t.task_created(self.iteration, &self.rules[id.index()].rule.key, tid.0);
        }

        let info = self.rule_mut(id);
        info.state = RuleState::InProgressWaiting;
        info.task = Some(tid);
        let prior = if info.result.computed_at != 0 {
            Some(info.result.value.clone())
        } else {
            None
        };
        // The dependency list is rebuilt from this run's requests.
        info.result.dependencies.clear();

        if let Some(value) = &prior {
            task.prior_value(value);
        }
        self.tasks.push(Some(TaskInfo::new(task, id)));
        self.with_task(tid, |task, ctx| task.start(ctx));

        if self.task_info(tid).wait_count == 0 {
            self.ready_tasks.push_back(tid);
        }
    }

    /// Run a task callback with the task temporarily taken out of its slot,
    /// so the callback can borrow the engine through a `TaskContext`.
    fn with_task(&mut self, tid: TaskId, f: impl FnOnce(&mut dyn Task, &mut TaskContext)) {
        let mut task = self
            .task_info(tid)
            .task
            .take()
            .expect("task callback re-entered");
        let mut ctx = TaskContext { engine: self, task: tid };
        f(task.as_mut(), &mut ctx);
        if let Some(info) = self.tasks[tid.index()].as_mut() {
            info.task = Some(task);
        }
    }

    fn task_needs_input(&mut self, tid: TaskId, key: Key, id: usize) {
        let rid = self.task_info(tid).for_rule;
        if self.rule(rid).state != RuleState::InProgressWaiting {
            panic!(
                "rule {:?} requested an input outside start/provide_value",
                self.rule(rid).rule.key
            );
        }
        if let Some(t) = &mut self.trace {
            t.input_requested(self.iteration, &self.rules[rid.index()].rule.key, &key);
        }
        let info = self.task_info(tid);
        let seq = info.requests_made;
        info.requests_made += 1;
        info.ready.push(None);
        info.wait_count += 1;
        self.input_queue.push_back(InputRequest {
            task: Some(tid),
            key,
            input: None,
            id,
            seq,
        });
    }

    fn task_discovered_dependency(&mut self, tid: TaskId, key: Key) {
        let rid = self.task_info(tid).for_rule;
        if self.rule(rid).state != RuleState::InProgressComputing {
            panic!(
                "rule {:?} reported a discovered dependency before inputs_available",
                self.rule(rid).rule.key
            );
        }
        // A discovered key already rebuilt this iteration invalidates the
        // result this task is computing; rescan its inputs before it is
        // allowed to settle.
        if let Some(&dep) = self.key_map.get(&key) {
            if self.rule(dep).result.built_at == self.iteration {
                self.task_info(tid).needs_scan_again = true;
            }
        }
        self.task_info(tid).discovered.push(key);
    }

    fn task_complete(&mut self, tid: TaskId, value: Value) {
        let rid = self.task_info(tid).for_rule;
        if self.rule(rid).state != RuleState::InProgressComputing {
            panic!(
                "rule {:?} completed before inputs_available",
                self.rule(rid).rule.key
            );
        }
        // Completions are funneled through the inbox, including driver-side
        // ones, so they are processed in a single FIFO order.
        let _ = self.inbox_send.send(EngineMessage::TaskComplete { task: tid, value });
    }

    /// Issue anonymous input requests bringing discovered dependencies up to
    /// date within this build.
    fn request_discovered(&mut self, tid: TaskId) {
        let info = self.task_info(tid);
        let pending: Vec<Key> = info.discovered[info.discovered_requested..].to_vec();
        info.discovered_requested = info.discovered.len();
        for key in pending {
            self.input_queue.push_back(InputRequest {
                task: None,
                key,
                input: None,
                id: 0,
                seq: 0,
            });
        }
    }

    fn process_input_request(
        &mut self,
        mut req: InputRequest,
        finished: &mut VecDeque<InputRequest>,
    ) -> anyhow::Result<()> {
        let input = match req.input {
            Some(input) => input,
            None => self.rule_id_for_key(&req.key)?,
        };
        req.input = Some(input);

        if !self.scan_rule(input) {
            self.rule_mut(input)
                .scan
                .as_mut()
                .unwrap()
                .paused_input_requests
                .push(req);
            return Ok(());
        }
        let available = self.demand_rule(input)?;
        if req.task.is_none() {
            return Ok(());
        }
        if available {
            finished.push_back(req);
        } else {
            let tid = self.rule(input).task.expect("in-progress rule without task");
            self.task_info(tid).requested_by.push(req);
        }
        Ok(())
    }

    /// Buffer a finished input and deliver any now-consecutive values in
    /// request order.
    fn process_finished_input(&mut self, req: InputRequest) {
        let tid = req.task.expect("anonymous request finished");
        let input = req.input.expect("unresolved finished input");
        let info = self.task_info(tid);
        debug_assert!(info.ready[req.seq].is_none());
        info.ready[req.seq] = Some((req.id, input));

        loop {
            let info = self.task_info(tid);
            let next = info.next_deliver;
            let (id, input) = match info.ready.get(next) {
                Some(&Some(pair)) => pair,
                _ => break,
            };
            info.next_deliver += 1;

            let rid = info.for_rule;
            let key = self.rule(input).rule.key.clone();
            self.rule_mut(rid).result.dependencies.push(key);
            debug_assert!(self.is_complete(input));
            let value = self.rule(input).result.value.clone();
            if let Some(t) = &mut self.trace {
                t.input_supplied(self.iteration, tid.0, id);
            }
            self.with_task(tid, |task, ctx| task.provide_value(ctx, id, &value));

            let info = self.task_info(tid);
            info.wait_count -= 1;
            if info.wait_count == 0 {
                self.ready_tasks.push_back(tid);
            }
        }
    }

    fn process_ready_task(&mut self, tid: TaskId) {
        let rid = self.task_info(tid).for_rule;
        debug_assert!(self.rule(rid).state == RuleState::InProgressWaiting);
        self.rule_mut(rid).state = RuleState::InProgressComputing;
        self.outstanding += 1;
        self.with_task(tid, |task, ctx| task.inputs_available(ctx));

        // Dependencies discovered just now that were rebuilt this iteration
        // must be rescanned before the build can settle; start them at once
        // rather than waiting for the task's completion.
        if let Some(info) = self.tasks[tid.index()].as_ref() {
            if info.needs_scan_again {
                self.request_discovered(tid);
            }
        }
    }

    fn process_message(
        &mut self,
        msg: EngineMessage,
        finished: &mut VecDeque<InputRequest>,
    ) -> anyhow::Result<()> {
        match msg {
            EngineMessage::TaskComplete { task, value } => self.finish_task(task, value, finished),
            EngineMessage::TaskDiscovered { task, key } => {
                if self.tasks[task.index()].is_some() {
                    self.task_discovered_dependency(task, key);
                }
                Ok(())
            }
            EngineMessage::TaskCancelled { task } => {
                if self.tasks[task.index()].take().is_some() {
                    self.outstanding -= 1;
                }
                Ok(())
            }
            EngineMessage::JobPanicked { payload } => {
                // The engine stays poisoned; re-raise on the driver.
                std::panic::resume_unwind(payload);
            }
        }
    }

    fn finish_task(
        &mut self,
        tid: TaskId,
        value: Value,
        finished: &mut VecDeque<InputRequest>,
    ) -> anyhow::Result<()> {
        if self.cancelled {
            // Late completion of a task that was already running when the
            // build was cancelled; its result is discarded.
            if self.tasks[tid.index()].take().is_some() {
                self.outstanding -= 1;
            }
            return Ok(());
        }

        let info = self.tasks[tid.index()]
            .take()
            .expect("completion for unknown task");
        let rid = info.for_rule;
        assert!(
            self.rule(rid).state == RuleState::InProgressComputing,
            "completion for rule {:?} in invalid state",
            self.rule(rid).rule.key
        );
        self.rule_mut(rid).task = None;

        // An unchanged value keeps its original built_at stamp, which is
        // what lets dependents skip when a re-run produced identical bytes.
        let iteration = self.iteration;
        let changed = {
            let result = &mut self.rule_mut(rid).result;
            if value != result.value || result.computed_at == 0 {
                result.value = value;
                result.built_at = iteration;
                true
            } else {
                false
            }
        };

        // Declared inputs were recorded as they were provided; discovered
        // dependencies follow, in report order.
        for key in &info.discovered {
            let key = key.clone();
            self.rule_mut(rid).result.dependencies.push(key);
        }

        self.mark_complete(rid);
        if let Some(t) = &mut self.trace {
            t.task_completed(self.iteration, &self.rules[rid.index()].rule.key, changed);
        }

        if let Some(db) = &mut self.db {
            let key = self.rules[rid.index()].rule.key.clone();
            db.set_rule_result(&key, &self.rules[rid.index()].result)?;
        }

        // Discovered dependencies must themselves be brought up to date so
        // the next scan of this rule sees current stamps.
        for key in info.discovered[info.discovered_requested..].iter().cloned() {
            self.input_queue.push_back(InputRequest {
                task: None,
                key,
                input: None,
                id: 0,
                seq: 0,
            });
        }

        for req in info.deferred_scans {
            self.scan_queue.push_back(req);
        }
        for req in info.requested_by {
            finished.push_back(req);
        }

        self.outstanding -= 1;
        Ok(())
    }

    /// The driver loop: process work queues until quiescent, blocking on the
    /// inbox while tasks are in flight.
    fn run_to_completion(&mut self, root: &Key) -> anyhow::Result<Value> {
        let mut finished: VecDeque<InputRequest> = VecDeque::new();

        loop {
            let mut did_work = false;

            if !self.cancelled && self.delegate.is_cancelled() {
                self.cancelled = true;
                self.cancel_flag.store(true, Ordering::SeqCst);
                if let Some(t) = &mut self.trace {
                    t.cancelled(self.iteration);
                }
            }
            if self.cancelled {
                // No new work; only drain completions of what is in flight.
                self.scan_queue.clear();
                self.input_queue.clear();
                self.ready_tasks.clear();
                finished.clear();
            }

            while let Some(req) = self.scan_queue.pop_front() {
                did_work = true;
                self.process_scan_request(req)?;
            }
            while let Some(req) = self.input_queue.pop_front() {
                did_work = true;
                self.process_input_request(req, &mut finished)?;
            }
            while let Some(req) = finished.pop_front() {
                did_work = true;
                self.process_finished_input(req);
            }
            while let Some(tid) = self.ready_tasks.pop_front() {
                did_work = true;
                self.process_ready_task(tid);
            }
            while let Ok(msg) = self.inbox.try_recv() {
                did_work = true;
                self.process_message(msg, &mut finished)?;
            }

            if !did_work && self.outstanding > 0 {
                let msg = self.inbox.recv().expect("engine inbox disconnected");
                self.process_message(msg, &mut finished)?;
                did_work = true;
            }

            if !did_work {
                break;
            }
        }

        if self.cancelled {
            bail!("build cancelled");
        }

        // Quiescence with live tasks or unfinished scans means nothing can
        // make progress: a dependency cycle.
        if self.tasks.iter().any(|t| t.is_some())
            || self.rules.iter().any(|r| r.state == RuleState::Scanning)
        {
            return Err(self.report_cycle());
        }

        if let Some(db) = &mut self.db {
            db.set_current_iteration(self.iteration);
            db.build_complete()?;
        }
        if let Some(t) = &mut self.trace {
            t.build_ended(self.iteration);
        }
        self.tasks.clear();

        let id = *self.key_map.get(root).expect("root rule disappeared");
        assert!(self.is_complete(id), "build finished with incomplete root");
        Ok(self.rule(id).result.value.clone())
    }

    /// Reconstruct the waits-for graph from the stuck tasks and scans, find
    /// the cycle, and report it.
    fn report_cycle(&mut self) -> anyhow::Error {
        self.cycled = true;

        // Successor edges point from a rule to the rules waiting on it.
        let mut graph: HashMap<RuleId, Vec<RuleId>> = HashMap::new();
        for slot in &self.tasks {
            let info = match slot {
                Some(info) => info,
                None => continue,
            };
            let succs = graph.entry(info.for_rule).or_default();
            for req in &info.requested_by {
                let waiter = req.task.expect("anonymous request recorded as waiter");
                succs.push(self.tasks[waiter.index()].as_ref().unwrap().for_rule);
            }
            for req in &info.deferred_scans {
                succs.push(req.rule);
            }
        }
        for (index, info) in self.rules.iter().enumerate() {
            let record = match &info.scan {
                Some(record) => record,
                None => continue,
            };
            let succs = graph.entry(RuleId(index)).or_default();
            for req in &record.paused_input_requests {
                if let Some(tid) = req.task {
                    succs.push(self.tasks[tid.index()].as_ref().unwrap().for_rule);
                }
            }
            for req in &record.deferred_scans {
                succs.push(req.rule);
            }
        }

        // Deterministic starting order so the reported cycle is stable.
        let mut roots: Vec<RuleId> = graph.keys().copied().collect();
        roots.sort_by(|a, b| self.rule(*a).rule.key.cmp(&self.rule(*b).rule.key));

        let mut cycle: Vec<RuleId> = Vec::new();
        'search: for root in roots {
            // Iterative DFS carrying the current path.
            let mut path: Vec<RuleId> = vec![root];
            let mut succ_index: Vec<usize> = vec![0];
            while let Some(&node) = path.last() {
                let i = *succ_index.last().unwrap();
                let succs = graph.get(&node).map(|v| v.as_slice()).unwrap_or(&[]);
                if i == succs.len() {
                    path.pop();
                    succ_index.pop();
                    continue;
                }
                *succ_index.last_mut().unwrap() += 1;
                let next = succs[i];
                if let Some(pos) = path.iter().position(|&n| n == next) {
                    cycle = path[pos..].to_vec();
                    cycle.push(next);
                    break 'search;
                }
                path.push(next);
                succ_index.push(0);
            }
        }
        assert!(!cycle.is_empty(), "deadlocked build with no cycle");

        // The successor graph runs opposite to the dependency direction.
        cycle.reverse();
        let keys: Vec<Key> = cycle.iter().map(|&id| self.rule(id).rule.key.clone()).collect();
        if let Some(t) = &mut self.trace {
            t.cycle(self.iteration, keys.len());
        }
        self.delegate.cycle_detected(&keys);

        let path = keys
            .iter()
            .map(|k| format!("{:?}", k))
            .collect::<Vec<_>>()
            .join(" -> ");
        anyhow::anyhow!("cycle detected while building: {}", path)
    }

    /// Discard the in-flight state of a failed or cancelled build, leaving
    /// the engine usable.  Results already confirmed this iteration are
    /// kept in memory but nothing is persisted.
    fn abort_build(&mut self) {
        // Keep already-queued jobs from starting, wait out the in-flight
        // ones, then drop whatever they reported.
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.queue.wait_idle();
        while self.inbox.try_recv().is_ok() {}
        self.cancel_flag.store(false, Ordering::SeqCst);

        self.scan_queue.clear();
        self.input_queue.clear();
        self.ready_tasks.clear();
        self.tasks.clear();
        self.outstanding = 0;
        for info in &mut self.rules {
            match info.state {
                RuleState::Complete | RuleState::Incomplete => {}
                _ => {
                    info.state = RuleState::Incomplete;
                    info.scan = None;
                    info.task = None;
                }
            }
        }
    }
}
