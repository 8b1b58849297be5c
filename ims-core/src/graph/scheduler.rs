use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::graph::GraphCore;
use crate::node::NodeState;

/// Wait between scheduler passes when no node has data.
pub const RUN_WAIT_TIMEOUT: Duration = Duration::from_millis(6);
/// How long `stop` waits for the worker to acknowledge.
pub const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

struct SchedulerShared {
    core: Arc<Mutex<GraphCore>>,
    registered: Mutex<Vec<usize>>,
    terminate: AtomicBool,
    main_gate: Mutex<()>,
    main_cond: Condvar,
    exit_gate: Mutex<bool>,
    exit_cond: Condvar,
}

impl SchedulerShared {
    /// One cooperative pass: every registered source gets a turn, then the
    /// non-source node with the deepest queue runs until nothing makes
    /// progress or termination is requested.
    fn run_registered_nodes(&self) {
        let registered = self.registered.lock().unwrap().clone();
        let mut core = self.core.lock().unwrap();

        for &idx in &registered {
            if self.terminate.load(Ordering::Acquire) {
                return;
            }
            let node = &core.nodes[idx];
            if node.is_source() && !node.is_runtime() && node.state() == NodeState::Running {
                core.run_node(idx);
            }
        }

        let mut stalled: VecDeque<usize> = VecDeque::new();
        loop {
            if self.terminate.load(Ordering::Acquire) {
                return;
            }

            let mut selected = None;
            let mut max_count = 0usize;
            for &idx in &registered {
                let node = &core.nodes[idx];
                if node.is_source() || node.is_runtime() || stalled.contains(&idx) {
                    continue;
                }
                let count = node.data_count();
                if count > 0 && count > max_count {
                    selected = Some(idx);
                    max_count = count;
                }
            }

            let Some(idx) = selected else {
                break;
            };

            if core.nodes[idx].state() == NodeState::Running {
                core.run_node(idx);
            }

            // a node that kept its backlog is waiting on something other
            // than the scheduler; skip it for the rest of this pass
            if core.nodes[idx].data_count() >= max_count {
                stalled.push_back(idx);
            }
        }
    }

    fn run(&self) {
        log::debug!("scheduler worker enter");

        while !self.terminate.load(Ordering::Acquire) {
            self.run_registered_nodes();

            if self.terminate.load(Ordering::Acquire) {
                break;
            }

            let guard = self.main_gate.lock().unwrap();
            let _ = self
                .main_cond
                .wait_timeout(guard, RUN_WAIT_TIMEOUT / 2)
                .unwrap();
        }

        let mut exited = self.exit_gate.lock().unwrap();
        *exited = true;
        self.exit_cond.notify_all();
        log::debug!("scheduler worker exit");
    }
}

/// Drives the non-runtime nodes of one graph on a single worker thread.
pub struct StreamScheduler {
    shared: Arc<SchedulerShared>,
    worker: Option<thread::JoinHandle<()>>,
    started: bool,
    start_pending: bool,
}

impl StreamScheduler {
    pub fn new(core: Arc<Mutex<GraphCore>>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                core,
                registered: Mutex::new(vec![]),
                terminate: AtomicBool::new(false),
                main_gate: Mutex::new(()),
                main_cond: Condvar::new(),
                exit_gate: Mutex::new(false),
                exit_cond: Condvar::new(),
            }),
            worker: None,
            started: false,
            start_pending: false,
        }
    }

    pub fn register_node(&mut self, idx: usize) {
        self.shared.registered.lock().unwrap().push(idx);
        if self.start_pending {
            log::debug!("pending scheduler start on register");
            self.start();
        }
    }

    pub fn deregister_node(&mut self, idx: usize) {
        let empty = {
            let mut registered = self.shared.registered.lock().unwrap();
            registered.retain(|&i| i != idx);
            registered.is_empty()
        };
        if empty && self.started {
            log::debug!("last node deregistered, scheduler to pending state");
            self.stop();
            self.start_pending = true;
        }
    }

    /// Idempotent; with no registered nodes the start is recorded as
    /// pending and happens on the next registration.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        if self.shared.registered.lock().unwrap().is_empty() {
            self.start_pending = true;
            return;
        }

        self.start_pending = false;
        self.shared.terminate.store(false, Ordering::Release);
        *self.shared.exit_gate.lock().unwrap() = false;

        let shared = self.shared.clone();
        self.worker = Some(thread::spawn(move || shared.run()));
        self.started = true;
    }

    /// Requests termination and waits up to a second for the worker to
    /// acknowledge. A worker stuck past the deadline is abandoned; its
    /// resources are reclaimed on its natural exit.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.shared.terminate.store(true, Ordering::Release);
        self.awake();

        let acknowledged = {
            let guard = self.shared.exit_gate.lock().unwrap();
            let (exited, _res) = self
                .shared
                .exit_cond
                .wait_timeout_while(guard, STOP_WAIT_TIMEOUT, |exited| !*exited)
                .unwrap();
            *exited
        };

        if let Some(worker) = self.worker.take() {
            if acknowledged {
                let _ = worker.join();
            } else {
                log::error!("scheduler worker did not stop in time, detaching");
            }
        }
        self.started = false;
    }

    pub fn awake(&self) {
        self.shared.main_cond.notify_all();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
