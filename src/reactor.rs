// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The event-dispatch engine.
//!
//! Generalizes the single-purpose TCP I/O thread pattern (mio `Poll` +
//! command channel + `Waker`) into a shared reactor that any number of
//! transports register against: a pool of worker threads each running its
//! own poll loop, plus a dedicated timer thread providing both a
//! general-purpose timer list and a re-slotting heartbeat ("mm") timer.
//!
//! Handlers are registered once and dispatched to by worker index
//! (`handler_id % workers.len()`), matching the fixed worker-affinity model
//! transports expect: all events for a given connection land on the same
//! thread, so a handler never needs its own internal locking against
//! concurrent reactor callbacks.

use crate::reliability::SeqNumGenerator;
use mio::{Events, Poll, Token, Waker};
use std::collections::BinaryHeap;
use std::io;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifies a handler registered with a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Identifies a scheduled timer. Carries the generation it was scheduled
/// with so a cancelled-then-refired timer can be told apart from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a registered handler wants to be told about.
pub trait EventHandler: Send + Sync {
    /// The socket became readable.
    fn on_readable(&self) {}
    /// The socket became writable.
    fn on_writable(&self) {}
}

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    deadline: Instant,
    id: u64,
    generation: u64,
    period: Option<Duration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    generations: std::collections::HashMap<u64, u64>,
    callbacks: std::collections::HashMap<u64, TimerCallback>,
    /// Re-slot requests for a timer whose callback is currently executing on
    /// the timer thread (so it isn't sitting in `callbacks` to reinsert
    /// directly). Consulted once that callback returns.
    pending_reslot: std::collections::HashMap<u64, (Instant, Duration)>,
    next_id: SeqNumGenerator,
    shutdown: bool,
}

struct TimerThread {
    state: Arc<Mutex<TimerState>>,
    cv: Arc<Condvar>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    fn new() -> Self {
        let state = Arc::new(Mutex::new(TimerState {
            heap: BinaryHeap::new(),
            generations: std::collections::HashMap::new(),
            callbacks: std::collections::HashMap::new(),
            pending_reslot: std::collections::HashMap::new(),
            next_id: SeqNumGenerator::new(),
            shutdown: false,
        }));
        let cv = Arc::new(Condvar::new());

        let thread_state = state.clone();
        let thread_cv = cv.clone();
        let handle = thread::Builder::new()
            .name("reactor-timer".into())
            .spawn(move || Self::run(thread_state, thread_cv))
            .expect("failed to spawn timer thread");

        Self {
            state,
            cv,
            handle: Some(handle),
        }
    }

    fn run(state: Arc<Mutex<TimerState>>, cv: Arc<Condvar>) {
        loop {
            let mut guard = state.lock().unwrap();
            if guard.shutdown {
                return;
            }

            let now = Instant::now();
            let wait_until = match guard.heap.peek() {
                Some(top) if top.deadline <= now => None,
                Some(top) => Some(top.deadline),
                None => None,
            };

            if let Some(deadline) = wait_until {
                let (g, _) = cv.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
            } else if guard.heap.is_empty() {
                let (g, _) = cv.wait_timeout(guard, Duration::from_secs(1)).unwrap();
                guard = g;
                continue;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(top) = guard.heap.peek() {
                if top.deadline > now {
                    break;
                }
                due.push(guard.heap.pop().unwrap());
            }
            drop(guard);

            for entry in due {
                let mut guard = state.lock().unwrap();
                let live = guard.generations.get(&entry.id) == Some(&entry.generation);
                // Take the callback out of the map so it can run with the
                // lock released -- a long-running timer body must not block
                // an unrelated cancel_timer() call.
                let mut callback = if live {
                    guard.callbacks.remove(&entry.id)
                } else {
                    None
                };
                drop(guard);

                if let Some(cb) = callback.as_mut() {
                    cb();
                }

                let mut guard = state.lock().unwrap();
                if let Some(cb) = callback {
                    // A reslot() issued while this callback was running stashes
                    // its new deadline/period here rather than in the heap,
                    // since the entry being fired had already been removed
                    // from `callbacks`. Honor it in preference to the stale
                    // generation check below.
                    if let Some((deadline, period)) = guard.pending_reslot.remove(&entry.id) {
                        let generation = guard.generations.get(&entry.id).copied().unwrap_or(entry.generation);
                        guard.callbacks.insert(entry.id, cb);
                        guard.heap.push(TimerEntry {
                            deadline,
                            id: entry.id,
                            generation,
                            period: Some(period),
                        });
                    } else {
                        let still_live = guard.generations.get(&entry.id) == Some(&entry.generation);
                        if still_live {
                            if let Some(period) = entry.period {
                                guard.callbacks.insert(entry.id, cb);
                                guard.heap.push(TimerEntry {
                                    deadline: Instant::now() + period,
                                    id: entry.id,
                                    generation: entry.generation,
                                    period: Some(period),
                                });
                            } else {
                                guard.generations.remove(&entry.id);
                            }
                        }
                    }
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, period: Option<Duration>, callback: impl FnMut() + Send + 'static) -> TimerId {
        let mut guard = self.state.lock().unwrap();
        let id = guard.next_id.next();
        let generation = guard.generations.get(&id).copied().unwrap_or(0) + 1;
        guard.generations.insert(id, generation);
        guard.callbacks.insert(id, Box::new(callback));
        guard.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            generation,
            period,
        });
        drop(guard);
        self.cv.notify_one();
        TimerId(id)
    }

    fn cancel(&self, timer: TimerId) {
        let mut guard = self.state.lock().unwrap();
        if let Some(gen) = guard.generations.get_mut(&timer.0) {
            *gen += 1; // tombstone: any in-flight TimerEntry now has a stale generation
        }
        guard.callbacks.remove(&timer.0);
        guard.pending_reslot.remove(&timer.0);
    }

    /// Re-phase a live periodic timer: bump its generation (invalidating any
    /// heap entry already queued for it), drop that heap entry, and queue a
    /// fresh one at `deadline` with the new `period`. If the timer's callback
    /// is mid-flight on the timer thread (so it isn't sitting in `callbacks`
    /// right now), the request is stashed in `pending_reslot` and honored
    /// once that callback returns instead of being silently dropped.
    fn reslot(&self, id: u64, deadline: Instant, period: Duration) {
        let mut guard = self.state.lock().unwrap();
        let generation = guard.generations.get(&id).copied().unwrap_or(0) + 1;
        guard.generations.insert(id, generation);

        let heap = std::mem::take(&mut guard.heap);
        guard.heap = heap.into_iter().filter(|e| e.id != id).collect();

        match guard.callbacks.remove(&id) {
            Some(cb) => {
                guard.callbacks.insert(id, cb);
                guard.heap.push(TimerEntry {
                    deadline,
                    id,
                    generation,
                    period: Some(period),
                });
            }
            None => {
                guard.pending_reslot.insert(id, (deadline, period));
            }
        }
        drop(guard);
        self.cv.notify_one();
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        {
            let mut guard = self.state.lock().unwrap();
            guard.shutdown = true;
        }
        self.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum WorkerCommand {
    Register {
        source: Box<dyn mio::event::Source + Send>,
        token: Token,
        interest: mio::Interest,
    },
    Deregister {
        source: Box<dyn mio::event::Source + Send>,
    },
    Shutdown,
}

struct Worker {
    waker: Arc<Waker>,
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        handlers: Arc<Mutex<std::collections::HashMap<u64, Arc<dyn EventHandler>>>>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX))?);
        let (tx, rx) = channel();

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || Self::run(poll, rx, handlers))
            .expect("failed to spawn reactor worker");

        Ok(Self {
            waker,
            commands: tx,
            handle: Some(handle),
        })
    }

    fn run(
        mut poll: Poll,
        commands: Receiver<WorkerCommand>,
        handlers: Arc<Mutex<std::collections::HashMap<u64, Arc<dyn EventHandler>>>>,
    ) {
        let mut events = Events::with_capacity(128);
        let mut pending: Vec<Box<dyn mio::event::Source + Send>> = Vec::new();
        loop {
            if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(100))) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                crate::error!("reactor worker poll failed: {}", e);
                continue;
            }

            for event in &events {
                if event.token() == Token(usize::MAX) {
                    continue; // waker: just used to fall through and drain commands
                }
                let id = event.token().0 as u64;
                let handler = handlers.lock().unwrap().get(&id).cloned();
                if let Some(handler) = handler {
                    if event.is_readable() {
                        handler.on_readable();
                    }
                    if event.is_writable() {
                        handler.on_writable();
                    }
                }
            }

            loop {
                match commands.try_recv() {
                    Ok(WorkerCommand::Register {
                        mut source,
                        token,
                        interest,
                    }) => {
                        if let Err(e) = poll.registry().register(source.as_mut(), token, interest) {
                            crate::error!("reactor: failed to register source: {}", e);
                        } else {
                            pending.push(source);
                        }
                    }
                    Ok(WorkerCommand::Deregister { mut source }) => {
                        let _ = poll.registry().deregister(source.as_mut());
                    }
                    Ok(WorkerCommand::Shutdown) => return,
                    Err(_) => break,
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The shared, general-purpose event-dispatch engine.
///
/// Owns a pool of worker threads (I/O multiplexing) and one timer thread
/// (general timers plus re-slotting heartbeats). Transports register their
/// raw socket sources and an [`EventHandler`] and never see `mio` directly.
pub struct Reactor {
    workers: Vec<Worker>,
    timers: TimerThread,
    handlers: Arc<Mutex<std::collections::HashMap<u64, Arc<dyn EventHandler>>>>,
    next_handler_id: SeqNumGenerator,
    /// Raw timer ids of every live heartbeat, in registration order. Index
    /// into this vec is the `k` used by the `S·k/N` re-phase formula.
    heartbeats: Mutex<Vec<u64>>,
    heartbeat_interval: Mutex<Duration>,
}

impl Reactor {
    /// Create a reactor with `worker_count` I/O threads (minimum 1).
    pub fn new(worker_count: usize) -> Self {
        let handlers: Arc<Mutex<std::collections::HashMap<u64, Arc<dyn EventHandler>>>> =
            Arc::new(Mutex::new(std::collections::HashMap::new()));
        let worker_count = worker_count.max(1);
        let workers = (0..worker_count)
            .map(|i| {
                Worker::spawn(format!("reactor-io-{i}"), handlers.clone())
                    .expect("failed to start reactor worker")
            })
            .collect();

        crate::debug!("reactor started with {} workers", worker_count);

        Self {
            workers,
            timers: TimerThread::new(),
            handlers,
            next_handler_id: SeqNumGenerator::new(),
            heartbeats: Mutex::new(Vec::new()),
            heartbeat_interval: Mutex::new(Duration::from_secs(20)),
        }
    }

    fn worker_for(&self, id: u64) -> &Worker {
        &self.workers[(id as usize) % self.workers.len()]
    }

    /// Register a handler and its I/O source. The handler is pinned to one
    /// worker thread for the rest of its lifetime. The source is handed off
    /// to that worker's own `Poll` registry over its command channel, since
    /// only the owning thread may register against its registry.
    pub fn add_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        source: impl mio::event::Source + Send + 'static,
        interest: mio::Interest,
    ) -> io::Result<HandlerId> {
        let id = self.next_handler_id.next();
        self.handlers.lock().unwrap().insert(id, handler);

        let worker = self.worker_for(id);
        worker
            .commands
            .send(WorkerCommand::Register {
                source: Box::new(source),
                token: Token(id as usize),
                interest,
            })
            .map_err(|_| io::Error::other("reactor worker channel closed"))?;
        worker.waker.wake()?;
        Ok(HandlerId(id))
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, id: HandlerId) {
        self.handlers.lock().unwrap().remove(&id.0);
    }

    /// Schedule a one-shot or periodic general-purpose timer.
    pub fn schedule_timer(
        &self,
        delay: Duration,
        period: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.timers.schedule(delay, period, callback)
    }

    /// Register a heartbeat timer. Heartbeats share one interval across the
    /// whole population; a newly registered one takes the next index `k` of
    /// the now-`N`-strong population and fires first after `interval·k/N`
    /// seconds, so a burst of registrations doesn't all fire on top of each
    /// other. `update_heartbeat_timers` later re-derives every member's phase
    /// the same way whenever the interval (or population) changes.
    pub fn schedule_heartbeat(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let mut heartbeats = self.heartbeats.lock().unwrap();
        *self.heartbeat_interval.lock().unwrap() = interval;
        let k = heartbeats.len();
        let n = k + 1;
        let first_delay = interval.mul_f64(k as f64 / n as f64);
        let id = self.timers.schedule(first_delay, Some(interval), callback);
        heartbeats.push(id.0);
        id
    }

    /// Re-phase every live heartbeat timer so their next firings are spread
    /// uniformly across `new_interval`: timer `k` of `N` fires next after
    /// `new_interval·k/N`, then every `new_interval` after that. This is not
    /// an optimization to skip under load -- a population left un-re-slotted
    /// after an interval change thunders together on the old phase.
    pub fn update_heartbeat_timers(&self, new_interval: Duration) {
        let heartbeats = self.heartbeats.lock().unwrap();
        *self.heartbeat_interval.lock().unwrap() = new_interval;
        let n = heartbeats.len();
        if n == 0 {
            return;
        }
        let now = Instant::now();
        for (k, &raw_id) in heartbeats.iter().enumerate() {
            let delay = new_interval.mul_f64(k as f64 / n as f64);
            self.timers.reslot(raw_id, now + delay, new_interval);
        }
    }

    /// Cancel a heartbeat timer and drop it from the re-phasing population.
    pub fn cancel_heartbeat(&self, id: TimerId) {
        self.timers.cancel(id);
        self.heartbeats.lock().unwrap().retain(|&raw| raw != id.0);
    }

    /// Cancel a timer. Uses the generation+tombstone pattern: an in-flight
    /// fire racing with this call observes a stale generation and is a
    /// silent no-op.
    pub fn cancel_timer(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Stop all workers and the timer thread. Blocks until they've joined.
    pub fn stop(self) {
        // Drop order: workers first (they may still be firing handler
        // callbacks that use timers), then the timer thread.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn timer_fires_and_cancels() {
        let reactor = Reactor::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = reactor.schedule_timer(Duration::from_millis(20), None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let fired2 = Arc::new(AtomicUsize::new(0));
        let f2 = fired2.clone();
        let id2 = reactor.schedule_timer(Duration::from_millis(50), None, move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        reactor.cancel_timer(id2);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired2.load(Ordering::SeqCst), 0);
        let _ = id;
    }

    #[test]
    fn heartbeat_registrations_start_out_of_phase() {
        let reactor = Reactor::new(1);
        let fires: Arc<StdMutex<Vec<(usize, Instant)>>> = Arc::new(StdMutex::new(Vec::new()));
        let start = Instant::now();

        for k in 0..3usize {
            let fires = fires.clone();
            reactor.schedule_heartbeat(Duration::from_millis(90), move || {
                fires.lock().unwrap().push((k, Instant::now()));
            });
        }

        thread::sleep(Duration::from_millis(40));
        let first_pass = fires.lock().unwrap().clone();
        // With N=3 and S=90ms, timer 0 fires immediately (k/N=0), timer 1 not
        // before ~30ms, timer 2 not before ~60ms -- so within the first 40ms
        // only timers phased early have fired.
        assert!(first_pass.iter().any(|(k, _)| *k == 0));
        assert!(first_pass.len() < 3);
        let _ = start;
    }

    #[test]
    fn update_heartbeat_timers_respreads_the_population() {
        let reactor = Reactor::new(1);
        let fires: Arc<StdMutex<Vec<(usize, Instant)>>> = Arc::new(StdMutex::new(Vec::new()));

        for k in 0..4usize {
            let fires = fires.clone();
            reactor.schedule_heartbeat(Duration::from_millis(500), move || {
                fires.lock().unwrap().push((k, Instant::now()));
            });
        }

        // Before any of the 500ms-period timers would naturally fire, shrink
        // the interval; every member should re-phase off the new interval
        // rather than keep waiting out the stale one.
        let reslot_at = Instant::now();
        reactor.update_heartbeat_timers(Duration::from_millis(40));

        thread::sleep(Duration::from_millis(140));
        let fired = fires.lock().unwrap();
        assert!(
            fired.len() >= 3,
            "expected most of the population to have fired under the new interval, got {:?}",
            *fired
        );
        for (k, at) in fired.iter() {
            let expected_phase = Duration::from_millis(40).mul_f64(*k as f64 / 4.0);
            // First firing per timer should land near its re-phased slot,
            // not near the old 500ms deadline.
            assert!(
                at.duration_since(reslot_at) < Duration::from_millis(500),
                "timer {k} fired at stale phase"
            );
        }
    }
}
