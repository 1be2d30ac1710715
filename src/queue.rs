//! Worker lanes that run task bodies in parallel.
//! Unaware of the rule graph; just FIFO job execution with cooperative
//! cancellation, reporting back to the engine through its inbox.

use crate::engine::{EngineMessage, Key, TaskId, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Default lane count.  The +2 over the processor count keeps lanes busy
/// when some jobs stall on I/O.
pub fn default_lane_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1);
    cpus + 2
}

/// A unit of work enqueued by a task from `inputs_available`.
pub(crate) struct Job {
    pub(crate) task: TaskId,
    pub(crate) f: Box<dyn FnOnce(&mut JobContext) + Send>,
}

/// Handed to a job while it runs on a lane; the job's channel back to the
/// engine.
pub struct JobContext {
    task: TaskId,
    sender: Sender<EngineMessage>,
}

impl JobContext {
    /// Report a dependency discovered while computing, e.g. parsed from
    /// tool output.
    pub fn discovered_dependency(&mut self, key: impl Into<Key>) {
        let _ = self.sender.send(EngineMessage::TaskDiscovered {
            task: self.task,
            key: key.into(),
        });
    }

    /// Complete the job's task with its output value.
    pub fn complete(&mut self, value: Value) {
        let _ = self.sender.send(EngineMessage::TaskComplete {
            task: self.task,
            value,
        });
    }
}

struct State {
    jobs: VecDeque<Job>,
    running: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when work arrives or shutdown begins.
    work: Condvar,
    /// Signalled when a lane finishes a job or the queue is drained.
    idle: Condvar,
}

pub struct ExecutionQueue {
    shared: Arc<Shared>,
    lanes: Vec<JoinHandle<()>>,
    sender: Sender<EngineMessage>,
    cancel: Arc<AtomicBool>,
    lane_count: usize,
}

impl ExecutionQueue {
    pub(crate) fn new(
        lanes: usize,
        sender: Sender<EngineMessage>,
        cancel: Arc<AtomicBool>,
    ) -> ExecutionQueue {
        assert!(lanes > 0, "queue needs at least one lane");
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                running: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });
        let handles = (0..lanes)
            .map(|n| {
                let shared = shared.clone();
                let sender = sender.clone();
                let cancel = cancel.clone();
                std::thread::Builder::new()
                    .name(format!("lane-{}", n))
                    .spawn(move || run_lane(&shared, &sender, &cancel))
                    .expect("spawn lane")
            })
            .collect();
        ExecutionQueue {
            shared,
            lanes: handles,
            sender,
            cancel,
            lane_count: lanes,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    pub(crate) fn spawn(&self, job: Job) {
        if self.cancel.load(Ordering::SeqCst) {
            // Cancelled builds schedule no new work.
            let _ = self.sender.send(EngineMessage::TaskCancelled { task: job.task });
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.jobs.push_back(job);
        self.shared.work.notify_one();
    }

    /// Block until no job is queued or running.  With the cancellation flag
    /// set, queued jobs are dropped rather than waited for; their tasks are
    /// reported as cancelled.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                for job in state.jobs.drain(..) {
                    let _ = self.sender.send(EngineMessage::TaskCancelled { task: job.task });
                }
            }
            if state.jobs.is_empty() && state.running == 0 {
                return;
            }
            state = self.shared.idle.wait(state).unwrap();
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        for lane in self.lanes.drain(..) {
            let _ = lane.join();
        }
    }
}

fn run_lane(shared: &Shared, sender: &Sender<EngineMessage>, cancel: &AtomicBool) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if cancel.load(Ordering::SeqCst) && !state.jobs.is_empty() {
                    for job in state.jobs.drain(..) {
                        let _ = sender.send(EngineMessage::TaskCancelled { task: job.task });
                    }
                    shared.idle.notify_all();
                }
                if let Some(job) = state.jobs.pop_front() {
                    state.running += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared.work.wait(state).unwrap();
            }
        };

        let mut ctx = JobContext {
            task: job.task,
            sender: sender.clone(),
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            (job.f)(&mut ctx);
        }));
        if let Err(payload) = result {
            let _ = sender.send(EngineMessage::JobPanicked { payload });
        }

        let mut state = shared.state.lock().unwrap();
        state.running -= 1;
        shared.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn test_queue(lanes: usize) -> (ExecutionQueue, mpsc::Receiver<EngineMessage>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        (ExecutionQueue::new(lanes, tx, cancel.clone()), rx, cancel)
    }

    fn completion_value(msg: EngineMessage) -> (usize, Value) {
        match msg {
            EngineMessage::TaskComplete { task, value } => (task.0, value),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn serial_jobs_run_in_order() {
        let (queue, rx, _) = test_queue(1);
        for n in 0..8usize {
            queue.spawn(Job {
                task: TaskId(n),
                f: Box::new(move |ctx| ctx.complete(vec![n as u8])),
            });
        }
        for n in 0..8usize {
            let (task, value) = completion_value(rx.recv().unwrap());
            assert_eq!(task, n);
            assert_eq!(value, vec![n as u8]);
        }
    }

    #[test]
    fn parallel_jobs_all_complete() {
        let (queue, rx, _) = test_queue(4);
        for n in 0..32usize {
            queue.spawn(Job {
                task: TaskId(n),
                f: Box::new(move |ctx| ctx.complete(vec![n as u8])),
            });
        }
        let mut seen = [false; 32];
        for _ in 0..32 {
            let (task, _) = completion_value(rx.recv().unwrap());
            seen[task] = true;
        }
        assert!(seen.iter().all(|&s| s));
        queue.wait_idle();
    }

    #[test]
    fn cancellation_drops_queued_jobs() {
        let (queue, rx, cancel) = test_queue(1);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let gate = gate.clone();
            queue.spawn(Job {
                task: TaskId(0),
                f: Box::new(move |ctx| {
                    let _unused = gate.lock().unwrap();
                    ctx.complete(vec![]);
                }),
            });
        }
        // Give the lane time to pick up the blocking job, then queue more.
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.spawn(Job {
            task: TaskId(1),
            f: Box::new(|ctx| ctx.complete(vec![])),
        });
        cancel.store(true, Ordering::SeqCst);
        drop(held);
        queue.wait_idle();

        let mut completed = Vec::new();
        let mut cancelled = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                EngineMessage::TaskComplete { task, .. } => completed.push(task.0),
                EngineMessage::TaskCancelled { task } => cancelled.push(task.0),
                _ => panic!("unexpected message"),
            }
        }
        assert_eq!(completed, vec![0]);
        assert_eq!(cancelled, vec![1]);
    }

    #[test]
    fn job_panic_is_forwarded() {
        let (queue, rx, _) = test_queue(2);
        queue.spawn(Job {
            task: TaskId(0),
            f: Box::new(|_ctx| panic!("boom")),
        });
        match rx.recv().unwrap() {
            EngineMessage::JobPanicked { payload } => {
                assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
            }
            _ => panic!("expected panic message"),
        }
    }
}
