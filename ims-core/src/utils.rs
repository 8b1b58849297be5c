use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Milliseconds since the engine first asked for the time. Wraps like the
/// 32-bit tick counters the wire formats use.
pub fn now_ms() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u32
}

struct TimerShared {
    stop: AtomicBool,
    gate: Mutex<()>,
    cond: Condvar,
}

/// A repeating timer on its own thread. The callback runs on that thread;
/// `stop` wakes it and joins, so no callback runs after `stop` returns.
pub struct RepeatingTimer {
    shared: Arc<TimerShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl RepeatingTimer {
    pub fn start<F>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            stop: AtomicBool::new(false),
            gate: Mutex::new(()),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::spawn(move || {
            let mut next = Instant::now() + period;
            loop {
                {
                    let guard = worker_shared.gate.lock().unwrap();
                    let now = Instant::now();
                    if next > now {
                        let (_guard, _res) = worker_shared
                            .cond
                            .wait_timeout(guard, next - now)
                            .unwrap();
                    }
                }
                if worker_shared.stop.load(Ordering::Acquire) {
                    break;
                }
                if Instant::now() >= next {
                    callback();
                    next += period;
                }
            }
        });

        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
