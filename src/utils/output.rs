/// Bounded collection of a game process's diagnostic stream
///
/// Only the most recent bytes are kept so a chatty or hostile game cannot
/// grow launcher memory; the tail is attached to failure reports.
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Default number of bytes retained from a stream.
pub const DEFAULT_TAIL_LIMIT: usize = 8 * 1024;

/// Integrity of a collected tail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailIntegrity {
    Complete,
    /// Older bytes were dropped to respect the limit.
    Truncated,
    /// The stream failed before EOF.
    ReadError,
}

#[derive(Debug)]
struct TailState {
    bytes: VecDeque<u8>,
    dropped: usize,
    read_error: bool,
}

/// Shared ring buffer fed by a collector thread
#[derive(Debug, Clone)]
pub struct OutputTail {
    limit: usize,
    state: Arc<Mutex<TailState>>,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Arc::new(Mutex::new(TailState {
                bytes: VecDeque::with_capacity(limit.min(4096)),
                dropped: 0,
                read_error: false,
            })),
        }
    }

    pub fn push(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for byte in data {
            if state.bytes.len() == self.limit {
                state.bytes.pop_front();
                state.dropped += 1;
            }
            state.bytes.push_back(*byte);
        }
    }

    /// Spawn a thread draining `stream` line by line into the tail.
    /// Each line is also passed to `on_line` (without its terminator).
    pub fn collect<R, F>(&self, name: String, stream: R, mut on_line: F) -> std::io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
        F: FnMut(&str) + Send + 'static,
    {
        let tail = self.clone();
        thread::Builder::new().name(name).spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        tail.push(&line);
                        let text = String::from_utf8_lossy(&line);
                        on_line(text.trim_end_matches(['\n', '\r']));
                    }
                    Err(_) => {
                        let mut state = tail.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.read_error = true;
                        break;
                    }
                }
            }
        })
    }

    pub fn integrity(&self) -> TailIntegrity {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.read_error {
            TailIntegrity::ReadError
        } else if state.dropped > 0 {
            TailIntegrity::Truncated
        } else {
            TailIntegrity::Complete
        }
    }

    /// Current tail as lossy UTF-8, trimmed of surrounding whitespace.
    pub fn snapshot(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (front, back) = state.bytes.as_slices();
        let mut bytes = Vec::with_capacity(front.len() + back.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_most_recent_bytes() {
        let tail = OutputTail::new(4);
        tail.push(b"abcdef");
        assert_eq!(tail.snapshot(), "cdef");
        assert_eq!(tail.integrity(), TailIntegrity::Truncated);
    }

    #[test]
    fn test_collect_forwards_lines() {
        let tail = OutputTail::new(DEFAULT_TAIL_LIMIT);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = tail
            .collect("tail-test".into(), &b"one\ntwo\r\nthree"[..], move |line| {
                sink.lock().unwrap().push(line.to_string())
            })
            .unwrap();
        handle.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(tail.integrity(), TailIntegrity::Complete);
        assert!(tail.snapshot().ends_with("three"));
    }
}
