//! Message dispatch on top of a socket server.
//!
//! A [`Thread`] owns one [`SocketServer`] and alternates between draining its
//! [`MessageQueue`] and blocking in [`SocketServer::wait`]. Messages can be
//! posted from any thread; every post wakes the server so a blocked loop
//! picks the message up promptly.
//!
//! The queue never owns a handler. It keeps a weak reference, and a message
//! whose handler has been dropped by the time it is dispatched is discarded.
//!
//! Cancellation with [`MessageQueue::clear`] removes messages that have not
//! been dequeued yet. A message the loop already took off the queue may still
//! run after `clear` returns on another thread.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::Waker;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ThreadError;
use crate::event::{saturating_deadline, Timeout};
use crate::server::SocketServer;

/// Receiver of posted messages.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);
}

/// A unit of posted work.
pub struct Message {
    pub id: u32,
    pub data: Option<Box<dyn Any + Send>>,
    pub posted_at: Instant,
}

impl Message {
    /// Take the payload if it is a `T`.
    pub fn take_data<T: Any>(&mut self) -> Option<T> {
        let data = self.data.take()?;
        match data.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                self.data = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("data", &self.data.is_some())
            .finish()
    }
}

struct Envelope {
    handler: Weak<dyn MessageHandler>,
    message: Message,
}

impl Envelope {
    fn is_for(&self, handler: *const (), id: Option<u32>) -> bool {
        self.handler.as_ptr() as *const () == handler && id.map_or(true, |id| id == self.message.id)
    }
}

struct Delayed {
    deadline: Instant,
    seq: u64,
    envelope: Envelope,
}

// BinaryHeap is a max-heap; invert so the earliest deadline pops first and
// messages with the same deadline keep their post order.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    delayed: BinaryHeap<Delayed>,
    next_seq: u64,
    quitting: bool,
    stopped: bool,
    waker: Option<Waker>,
}

/// Thread safe message queue of a [`Thread`].
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct MessageQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a message to `handler` and wake the owning thread.
    ///
    /// Fails with [`ThreadError::Stopped`] once the owning thread is gone.
    pub fn post<H>(
        &self,
        handler: &Arc<H>,
        id: u32,
        data: Option<Box<dyn Any + Send>>,
    ) -> Result<(), ThreadError>
    where
        H: MessageHandler + 'static,
    {
        self.enqueue(handler, id, data, None)
    }

    /// Post a message that is dispatched no earlier than `delay` from now.
    pub fn post_delayed<H>(
        &self,
        delay: Duration,
        handler: &Arc<H>,
        id: u32,
        data: Option<Box<dyn Any + Send>>,
    ) -> Result<(), ThreadError>
    where
        H: MessageHandler + 'static,
    {
        self.enqueue(handler, id, data, Some(delay))
    }

    fn enqueue<H>(
        &self,
        handler: &Arc<H>,
        id: u32,
        data: Option<Box<dyn Any + Send>>,
        delay: Option<Duration>,
    ) -> Result<(), ThreadError>
    where
        H: MessageHandler + 'static,
    {
        let handler = Arc::downgrade(handler);
        let handler: Weak<dyn MessageHandler> = handler;
        let now = Instant::now();
        let envelope = Envelope {
            handler,
            message: Message {
                id,
                data,
                posted_at: now,
            },
        };

        let waker = {
            let mut state = self.lock();
            if state.stopped {
                warn!("Post of message {} after thread teardown", id);
                return Err(ThreadError::Stopped);
            }
            match delay {
                None => state.ready.push_back(envelope),
                Some(delay) => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.delayed.push(Delayed {
                        deadline: saturating_deadline(now, delay),
                        seq,
                        envelope,
                    });
                }
            }
            state.waker.clone()
        };

        trace!("Posted message {} (delay {:?})", id, delay);

        // Wake outside the lock; the loop re-checks the queue after waking.
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Remove pending messages for `handler`, all of them or only those with
    /// a matching `id`. Returns the number removed.
    pub fn clear<H>(&self, handler: &Arc<H>, id: Option<u32>) -> usize
    where
        H: MessageHandler + 'static,
    {
        let target = Arc::as_ptr(handler) as *const ();
        let mut state = self.lock();

        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|e| !e.is_for(target, id));
        state.delayed.retain(|d| !d.envelope.is_for(target, id));
        let removed = before - (state.ready.len() + state.delayed.len());

        if removed > 0 {
            trace!("Cleared {} messages", removed);
        }
        removed
    }

    /// Remove every pending message.
    pub fn clear_all(&self) -> usize {
        let mut state = self.lock();
        let n = state.ready.len() + state.delayed.len();
        state.ready.clear();
        state.delayed.clear();
        n
    }

    /// Ask the owning loop to return. Wakes it if blocked.
    pub fn quit(&self) {
        let waker = {
            let mut state = self.lock();
            state.quitting = true;
            state.waker.clone()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.lock().quitting
    }

    /// Undo a [`quit`](Self::quit) so the loop can be run again.
    pub fn restart(&self) {
        self.lock().quitting = false;
    }

    /// Number of pending messages, delayed ones included.
    pub fn size(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    fn attach(&self, waker: Waker) {
        let mut state = self.lock();
        state.stopped = false;
        state.waker = Some(waker);
    }

    /// Refuse further posts and drop whatever is queued.
    fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.waker = None;
        let dropped = state.ready.len() + state.delayed.len();
        state.ready.clear();
        state.delayed.clear();
        if dropped > 0 {
            debug!("Dropped {} undelivered messages", dropped);
        }
    }

    /// Move delayed messages due at `now` to the ready queue and return how
    /// many messages are ready.
    fn promote(&self, now: Instant) -> usize {
        let mut state = self.lock();
        loop {
            let due = state.delayed.peek().map_or(false, |d| d.deadline <= now);
            if !due {
                break;
            }
            if let Some(d) = state.delayed.pop() {
                state.ready.push_back(d.envelope);
            }
        }
        state.ready.len()
    }

    fn pop_ready(&self) -> Option<Envelope> {
        let mut state = self.lock();
        if state.quitting {
            return None;
        }
        state.ready.pop_front()
    }

    fn has_ready(&self) -> bool {
        !self.lock().ready.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().delayed.peek().map(|d| d.deadline)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MessageQueue")
            .field("ready", &state.ready.len())
            .field("delayed", &state.delayed.len())
            .field("quitting", &state.quitting)
            .finish()
    }
}

/// An event loop over one socket server.
pub struct Thread {
    server: Box<dyn SocketServer>,
    queue: MessageQueue,
}

impl Thread {
    pub fn new(server: Box<dyn SocketServer>) -> Self {
        Self::with_queue(server, MessageQueue::new())
    }

    fn with_queue(server: Box<dyn SocketServer>, queue: MessageQueue) -> Self {
        queue.attach(server.waker());
        Thread { server, queue }
    }

    /// Run a loop on a new OS thread.
    ///
    /// The socket server is created on the new thread by `make_server`, so
    /// servers that are not `Send` can be used.
    pub fn spawn<F>(name: &str, make_server: F) -> Result<ThreadHandle, ThreadError>
    where
        F: FnOnce() -> Box<dyn SocketServer> + Send + 'static,
    {
        let queue = MessageQueue::new();
        let loop_queue = queue.clone();
        let thread_name = name.to_string();

        let join = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let thread = Thread::with_queue(make_server(), loop_queue);
                debug!("Thread {} running", thread_name);
                thread.run();
                debug!("Thread {} stopped", thread_name);
            })?;

        Ok(ThreadHandle {
            name: name.to_string(),
            queue,
            join: Some(join),
        })
    }

    pub fn socket_server(&self) -> &dyn SocketServer {
        &*self.server
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn post<H>(
        &self,
        handler: &Arc<H>,
        id: u32,
        data: Option<Box<dyn Any + Send>>,
    ) -> Result<(), ThreadError>
    where
        H: MessageHandler + 'static,
    {
        self.queue.post(handler, id, data)
    }

    /// Dispatch messages and wait on the socket server until `timeout`
    /// elapses. Returns false if the queue was asked to quit.
    ///
    /// `Timeout::After(Duration::ZERO)` dispatches what is ready and returns.
    pub fn process_messages(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline(Instant::now());

        loop {
            if self.queue.is_quitting() {
                return false;
            }

            self.dispatch_ready();

            if self.queue.is_quitting() {
                return false;
            }

            let now = Instant::now();
            let mut wait = match deadline {
                None => Timeout::Forever,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(now);
                    if remaining.is_zero() {
                        return true;
                    }
                    Timeout::After(remaining)
                }
            };

            if self.queue.has_ready() {
                continue;
            }
            if let Some(next) = self.queue.next_deadline() {
                wait = wait.min(next.saturating_duration_since(now));
            }

            if !self.server.wait(wait, true) {
                warn!("Socket server can no longer wait");
                return false;
            }
        }
    }

    /// Process messages until the queue is asked to quit.
    pub fn run(&self) {
        while self.process_messages(Timeout::Forever) {}
    }

    /// Dispatch the messages ready at entry. Messages posted by handlers
    /// wait for the next pass.
    fn dispatch_ready(&self) {
        let count = self.queue.promote(Instant::now());

        for _ in 0..count {
            let Some(envelope) = self.queue.pop_ready() else {
                break;
            };
            let id = envelope.message.id;
            match envelope.handler.upgrade() {
                Some(handler) => {
                    trace!("Dispatching message {}", id);
                    handler.on_message(envelope.message);
                }
                None => warn!("Handler of message {} is gone, dropping it", id),
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread").field("queue", &self.queue).finish()
    }
}

/// Handle to a loop started with [`Thread::spawn`].
///
/// Dropping the handle stops the loop and joins the OS thread.
pub struct ThreadHandle {
    name: String,
    queue: MessageQueue,
    join: Option<JoinHandle<()>>,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn post<H>(
        &self,
        handler: &Arc<H>,
        id: u32,
        data: Option<Box<dyn Any + Send>>,
    ) -> Result<(), ThreadError>
    where
        H: MessageHandler + 'static,
    {
        self.queue.post(handler, id, data)
    }

    /// Quit the loop and wait for the OS thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.queue.quit();
        if join.join().is_err() {
            warn!("Thread {} panicked", self.name);
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.name)
            .field("running", &self.join.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::NullSocketServer;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl MessageHandler for Recorder {
        fn on_message(&self, message: Message) {
            self.seen.lock().unwrap().push(message.id);
        }
    }

    #[test]
    fn fifo_dispatch() {
        let thread = Thread::new(Box::new(NullSocketServer::new()));
        let rec = Arc::new(Recorder::default());

        for id in 1..=5 {
            thread.post(&rec, id, None).unwrap();
        }
        assert_eq!(thread.queue().size(), 5);

        assert!(thread.process_messages(Timeout::millis(0)));
        assert_eq!(*rec.seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(thread.queue().size(), 0);
    }

    #[test]
    fn unbounded_delay_is_never_due() {
        let thread = Thread::new(Box::new(NullSocketServer::new()));
        let rec = Arc::new(Recorder::default());

        thread
            .queue()
            .post_delayed(Duration::MAX, &rec, 1, None)
            .unwrap();
        thread.post(&rec, 2, None).unwrap();
        assert_eq!(thread.queue().size(), 2);

        assert!(thread.process_messages(Timeout::millis(0)));
        assert_eq!(*rec.seen.lock().unwrap(), vec![2]);
        assert_eq!(thread.queue().size(), 1);
    }

    #[test]
    fn clear_by_id() {
        let thread = Thread::new(Box::new(NullSocketServer::new()));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        thread.post(&a, 1, None).unwrap();
        thread.post(&a, 2, None).unwrap();
        thread.post(&b, 1, None).unwrap();

        assert_eq!(thread.queue().clear(&a, Some(1)), 1);
        thread.process_messages(Timeout::millis(0));

        assert_eq!(*a.seen.lock().unwrap(), vec![2]);
        assert_eq!(*b.seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn dropped_handler_is_skipped() {
        let thread = Thread::new(Box::new(NullSocketServer::new()));
        let rec = Arc::new(Recorder::default());
        thread.post(&rec, 1, None).unwrap();
        drop(rec);

        assert!(thread.process_messages(Timeout::millis(0)));
        assert_eq!(thread.queue().size(), 0);
    }

    #[test]
    fn quit_and_restart() {
        let thread = Thread::new(Box::new(NullSocketServer::new()));
        thread.queue().quit();
        assert!(thread.queue().is_quitting());
        assert!(!thread.process_messages(Timeout::Forever));

        thread.queue().restart();
        assert!(thread.process_messages(Timeout::millis(0)));
    }

    #[test]
    fn payload_downcast() {
        let mut message = Message {
            id: 7,
            data: Some(Box::new(String::from("payload"))),
            posted_at: Instant::now(),
        };
        assert_eq!(message.take_data::<u32>(), None);
        assert_eq!(message.take_data::<String>().as_deref(), Some("payload"));
        assert!(message.data.is_none());
    }

    #[test]
    fn post_after_drop_is_an_error() {
        let thread = Thread::new(Box::new(NullSocketServer::new()));
        let queue = thread.queue().clone();
        drop(thread);

        let rec = Arc::new(Recorder::default());
        assert!(matches!(queue.post(&rec, 1, None), Err(ThreadError::Stopped)));
    }
}
