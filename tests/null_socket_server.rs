//! Blocking behaviour of the socket-less server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rtcio::{Message, MessageHandler, NullSocketServer, SocketServer, Thread, Timeout};

struct WakeServer {
    server: Arc<NullSocketServer>,
}

impl MessageHandler for WakeServer {
    fn on_message(&self, _message: Message) {
        self.server.wake_up();
    }
}

#[test]
fn wait_and_set() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = Arc::new(NullSocketServer::new());
    let handler = Arc::new(WakeServer {
        server: server.clone(),
    });

    let thread = Thread::spawn("waker", || Box::new(NullSocketServer::new())).unwrap();
    thread.post(&handler, 0, None).unwrap();

    let start = Instant::now();
    assert!(server.wait(Timeout::Forever, true));
    assert!(start.elapsed() < Duration::from_secs(5));

    thread.stop();
}

#[test]
fn wait_times_out() {
    let server = NullSocketServer::new();

    let start = Instant::now();
    assert!(server.wait(Timeout::millis(200), true));
    // Timers may fire slightly early.
    assert!(start.elapsed() >= Duration::from_millis(180));
}

#[test]
fn wake_up_from_another_thread() {
    let server = NullSocketServer::new();
    let waker = server.waker();

    let t = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        waker.wake();
    });

    let start = Instant::now();
    assert!(server.wait(Timeout::millis(5_000), false));
    assert!(start.elapsed() < Duration::from_secs(5));
    t.join().unwrap();
}
