// Location: src/processing/stream.rs

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

/// Message carried by the fragment pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeMessage {
    Fragment(String),
    /// End-of-stream sentinel, sent once by the producer.
    End,
}

/// Cooperative cancellation flag shared by producer and consumer.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Create a bounded single-producer pipe. The consumer wakes every
/// `poll_interval` to check `stop`.
pub fn fragment_pipe(
    capacity: usize,
    poll_interval: Duration,
    stop: StopFlag,
) -> (FragmentSender, FragmentStream) {
    let (tx, rx) = bounded(capacity.max(1));
    debug!(capacity, ?poll_interval, "Opened fragment pipe");
    (
        FragmentSender {
            tx,
            stop: stop.clone(),
            ended: false,
            disconnected: Cell::new(false),
        },
        FragmentStream {
            rx,
            stop,
            poll_interval,
            finished: false,
        },
    )
}

/// Producer half, owned by the generation worker.
#[derive(Debug)]
pub struct FragmentSender {
    tx: Sender<PipeMessage>,
    stop: StopFlag,
    ended: bool,
    disconnected: Cell<bool>,
}

impl FragmentSender {
    /// Push a fragment. Returns `false` once the consumer is gone or the
    /// stream was ended.
    pub fn send(&self, fragment: impl Into<String>) -> bool {
        if self.ended || self.disconnected.get() {
            return false;
        }
        let delivered = self.tx.send(PipeMessage::Fragment(fragment.into())).is_ok();
        if !delivered {
            debug!("Fragment consumer went away");
            self.disconnected.set(true);
        }
        delivered
    }

    /// Enqueue the sentinel. Later calls are no-ops.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        // A dropped consumer has nothing left to notify.
        let _ = self.tx.send(PipeMessage::End);
        debug!("Fragment pipe ended");
    }

    /// Whether the consumer asked to stop or went away.
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_stopped() || self.disconnected.get()
    }
}

impl Drop for FragmentSender {
    fn drop(&mut self) {
        self.end();
    }
}

/// Consumer half. Iterates fragments in production order until the
/// sentinel, a disconnected producer or a stop request.
#[derive(Debug)]
pub struct FragmentStream {
    rx: Receiver<PipeMessage>,
    stop: StopFlag,
    poll_interval: Duration,
    finished: bool,
}

impl FragmentStream {
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }
}

impl Iterator for FragmentStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        loop {
            if self.stop.is_stopped() {
                debug!("Fragment stream stopped by request");
                self.finished = true;
                return None;
            }
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(PipeMessage::Fragment(text)) => return Some(text),
                Ok(PipeMessage::End) | Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pipe() -> (FragmentSender, FragmentStream) {
        fragment_pipe(16, Duration::from_millis(10), StopFlag::new())
    }

    #[test]
    fn test_fragments_arrive_in_order() {
        let (mut tx, rx) = pipe();
        let producer = thread::spawn(move || {
            for word in ["The ", "sky ", "is ", "blue"] {
                assert!(tx.send(word));
            }
            tx.end();
        });

        let text: String = rx.collect();
        producer.join().unwrap();
        assert_eq!(text, "The sky is blue");
    }

    #[test]
    fn test_sentinel_sent_once() {
        let (mut tx, mut rx) = pipe();
        tx.send("a");
        tx.end();
        tx.end();
        assert!(!tx.send("late"));
        drop(tx);

        assert_eq!(rx.next().as_deref(), Some("a"));
        assert_eq!(rx.next(), None);
        assert_eq!(rx.next(), None);
    }

    #[test]
    fn test_dropped_producer_ends_stream() {
        let (tx, rx) = pipe();
        tx.send("partial");
        drop(tx);
        assert_eq!(rx.collect::<Vec<_>>(), vec!["partial".to_string()]);
    }

    #[test]
    fn test_dropped_consumer_cancels_producer() {
        let (tx, rx) = pipe();
        drop(rx);
        assert!(!tx.send("nobody listening"));
        assert!(tx.is_cancelled());
    }

    #[test]
    fn test_stop_flag_ends_without_reading() {
        let stop = StopFlag::new();
        let (tx, mut rx) = fragment_pipe(4, Duration::from_millis(5), stop.clone());
        tx.send("unread");
        stop.stop();
        assert_eq!(rx.next(), None);
        assert!(tx.is_cancelled());
    }

    #[test]
    fn test_consumer_waits_across_poll_intervals() {
        let (mut tx, rx) = fragment_pipe(4, Duration::from_millis(1), StopFlag::new());
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tx.send("slow");
            tx.end();
        });
        assert_eq!(rx.collect::<Vec<_>>(), vec!["slow".to_string()]);
        producer.join().unwrap();
    }
}
