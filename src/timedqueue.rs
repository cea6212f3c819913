//! Timed dispatch queue: a priority queue of deadline-ordered actions,
//! drained by a background worker thread (spec §4.6).
//!
//! No teacher file runs a deadline-ordered scheduler, but `AudioHandle`
//! (`imbolc-core::audio::handle`) establishes the idiom this borrows: own a
//! `JoinHandle`, wake the worker with a condvar rather than polling, and
//! join it from `Drop`. We swap `AudioHandle`'s command channel for a
//! `BinaryHeap` keyed by `(deadline, sequence)` since, unlike a command
//! queue, a timed queue needs re-ordering as new, earlier-firing tasks
//! arrive out of submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bundler::Bundler;
use crate::error::{OscError, Result};

/// A unit of work to run once its deadline is reached.
pub enum TimedTask {
    SendBundle {
        bundle: Bundler,
        peer: Option<String>,
    },
    Callback {
        run: Box<dyn FnOnce() + Send + 'static>,
        spawn: bool,
    },
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: TimedTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Scheduled {}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // on a tie, the lowest sequence number) sorts first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    closed: bool,
}

/// A deadline-ordered dispatch queue with a dedicated worker thread.
pub struct TimedQueue {
    state: Arc<(Mutex<State>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl TimedQueue {
    pub fn new() -> Self {
        let state = Arc::new((
            Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            Condvar::new(),
        ));
        let worker_state = state.clone();
        let worker = thread::spawn(move || Self::run(worker_state));
        TimedQueue {
            state,
            worker: Some(worker),
        }
    }

    /// Schedule `task` to run `delay` from now.
    pub fn put(&self, delay: Duration, task: TimedTask) -> Result<()> {
        let (mutex, cv) = &*self.state;
        let mut state = mutex.lock().unwrap();
        if state.closed {
            return Err(OscError::Shutdown);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let wakes_sooner = state
            .heap
            .peek()
            .map(|top| Instant::now() + delay < top.deadline)
            .unwrap_or(true);
        state.heap.push(Scheduled {
            deadline: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        if wakes_sooner {
            cv.notify_all();
        }
        Ok(())
    }

    pub fn put_bundle(&self, delay: Duration, bundle: Bundler, peer: Option<&str>) -> Result<()> {
        self.put(
            delay,
            TimedTask::SendBundle {
                bundle,
                peer: peer.map(|s| s.to_string()),
            },
        )
    }

    pub fn put_callback<F>(&self, delay: Duration, spawn: bool, run: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.put(
            delay,
            TimedTask::Callback {
                run: Box::new(run),
                spawn,
            },
        )
    }

    pub fn pending(&self) -> usize {
        self.state.0.lock().unwrap().heap.len()
    }

    pub fn close(&self) {
        let (mutex, cv) = &*self.state;
        mutex.lock().unwrap().closed = true;
        cv.notify_all();
    }

    /// Runs until the heap is drained of everything already due, then
    /// either sleeps for more (open) or cancels the rest and returns
    /// (closed) — see `close`'s contract: due tasks finish, future-dated
    /// ones are cancelled rather than waited for.
    fn run(state: Arc<(Mutex<State>, Condvar)>) {
        let (mutex, cv) = &*state;
        loop {
            let mut guard = mutex.lock().unwrap();
            loop {
                if guard.closed {
                    match guard.heap.peek() {
                        Some(top) if top.deadline <= Instant::now() => break,
                        _ => {
                            guard.heap.clear();
                            return;
                        }
                    }
                }
                match guard.heap.peek() {
                    None => {
                        guard = cv.wait(guard).unwrap();
                    }
                    Some(top) => {
                        let now = Instant::now();
                        if top.deadline <= now {
                            break;
                        }
                        let (g, _) = cv.wait_timeout(guard, top.deadline - now).unwrap();
                        guard = g;
                    }
                }
            }
            let Scheduled { task, .. } = guard.heap.pop().unwrap();
            drop(guard);
            Self::execute(task);
        }
    }

    fn execute(task: TimedTask) {
        match task {
            TimedTask::SendBundle { bundle, peer } => {
                if let Err(e) = bundle.send(peer.as_deref()) {
                    log::warn!(target: "osc::timedqueue", "deferred bundle send failed: {e}");
                }
            }
            TimedTask::Callback { run, spawn } => {
                if spawn {
                    thread::spawn(run);
                } else {
                    run();
                }
            }
        }
    }
}

impl Default for TimedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimedQueue {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn s5_tasks_fire_in_deadline_order() {
        let q = TimedQueue::new();
        let (tx, rx) = mpsc::channel::<u32>();
        let delays = [40, 10, 30, 20, 0];
        for (i, ms) in delays.iter().enumerate() {
            let tx = tx.clone();
            let label = i as u32;
            q.put_callback(Duration::from_millis(*ms), false, move || {
                tx.send(label).unwrap();
            })
            .unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..delays.len() {
            order.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        // label 4 (0ms) first, then 1 (10ms), 3 (20ms), 2 (30ms), 0 (40ms)
        assert_eq!(order, vec![4, 1, 3, 2, 0]);
    }

    #[test]
    fn put_after_close_is_rejected() {
        let q = TimedQueue::new();
        q.close();
        let err = q
            .put_callback(Duration::from_millis(1), false, || {})
            .unwrap_err();
        assert_eq!(err, OscError::Shutdown);
    }

    #[test]
    fn close_finishes_due_tasks_but_cancels_future_ones() {
        let q = TimedQueue::new();
        let (tx, rx) = mpsc::channel::<&'static str>();
        // Already due by the time close() runs.
        q.put_callback(Duration::from_millis(0), false, {
            let tx = tx.clone();
            move || tx.send("due").unwrap()
        })
        .unwrap();
        // Far enough out that close() must cancel it rather than wait.
        q.put_callback(Duration::from_secs(5), false, move || {
            tx.send("future").unwrap()
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(q);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "due");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
