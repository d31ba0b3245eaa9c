//! Message dispatch across OS threads.

use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use rtcio::{
    Message, MessageHandler, MessageQueue, NullSocketServer, Thread, ThreadError, Timeout,
    VirtualSocketServer,
};

/// Forwards every message id, with the dispatching thread's name, to a
/// channel.
struct Forward {
    tx: Mutex<mpsc::Sender<(u32, Option<String>)>>,
}

impl Forward {
    fn new() -> (Arc<Self>, mpsc::Receiver<(u32, Option<String>)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Forward { tx: Mutex::new(tx) }), rx)
    }
}

impl MessageHandler for Forward {
    fn on_message(&self, message: Message) {
        let name = std::thread::current().name().map(str::to_string);
        let _ = self.tx.lock().unwrap().send((message.id, name));
    }
}

#[test]
fn messages_run_on_the_target_thread() {
    let _ = env_logger::builder().is_test(true).try_init();

    let thread = Thread::spawn("worker", || Box::new(NullSocketServer::new())).unwrap();
    assert_eq!(thread.name(), "worker");

    let (handler, rx) = Forward::new();
    for id in 0..3 {
        thread.post(&handler, id, None).unwrap();
    }

    for expected in 0..3 {
        let (id, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, expected);
        assert_eq!(name.as_deref(), Some("worker"));
    }

    thread.stop();
}

#[test]
fn delayed_messages_wait_their_turn() {
    let thread = Thread::spawn("delayed", || Box::new(VirtualSocketServer::new())).unwrap();
    let (handler, rx) = Forward::new();

    let start = Instant::now();
    thread
        .queue()
        .post_delayed(Duration::from_millis(100), &handler, 2, None)
        .unwrap();
    thread.post(&handler, 1, None).unwrap();

    let (first, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (second, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((first, second), (1, 2));
    assert!(start.elapsed() >= Duration::from_millis(90));
}

#[test]
fn clear_cancels_pending_messages() {
    let thread = Thread::new(Box::new(NullSocketServer::new()));
    let (handler, rx) = Forward::new();

    thread
        .queue()
        .post_delayed(Duration::from_secs(60), &handler, 1, None)
        .unwrap();
    thread.post(&handler, 2, None).unwrap();
    assert_eq!(thread.queue().size(), 2);

    assert_eq!(thread.queue().clear(&handler, None), 2);
    assert!(thread.process_messages(Timeout::millis(10)));
    assert!(rx.try_recv().is_err());
}

#[test]
fn post_after_stop_fails() {
    let thread = Thread::spawn("short", || Box::new(NullSocketServer::new())).unwrap();
    let queue: MessageQueue = thread.queue().clone();
    thread.stop();

    let (handler, _rx) = Forward::new();
    assert!(matches!(
        queue.post(&handler, 1, None),
        Err(ThreadError::Stopped)
    ));
}
