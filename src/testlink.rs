//! A scripted in-memory link for unit tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::link::Link;

/// Serves a canned byte stream and records everything written to it.
/// An exhausted stream reads as an immediate timeout.
pub(crate) struct TestLink {
    pub incoming: VecDeque<u8>,
    pub sent: Vec<u8>,
}

impl TestLink {
    pub fn new(incoming: &[u8]) -> Self {
        TestLink {
            incoming: incoming.iter().copied().collect(),
            sent: Vec::new(),
        }
    }
}

impl Link for TestLink {
    fn open(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.incoming.pop_front() {
            Some(b) => {
                buf[0] = b;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.sent.extend_from_slice(data);
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(0)
    }

    fn label(&self) -> String {
        "test".into()
    }
}

pub(crate) fn from_hex(s: &str) -> Vec<u8> {
    s.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).unwrap())
        .collect()
}
