// Reply correlation table
//
// Every passthrough command gets a bridge tag "b<seq>". The device echoes it
// in its reply, which resolves the waiter registered under that tag. Replies
// are matched by tag, never by arrival order.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use super::BridgeError;
use crate::protocol::frame::SequenceCounter;
use crate::protocol::text::parse_reply;

/// Prefix of bridge-generated tags
pub const TAG_PREFIX: char = 'b';

pub type ReplyResult = Result<String, BridgeError>;

struct Waiter {
    client_id: String,
    tx: oneshot::Sender<ReplyResult>,
    /// First line of a two-line diagnostics dump
    partial: Option<String>,
}

#[derive(Default)]
pub struct PendingTable {
    seq: SequenceCounter,
    waiters: HashMap<String, Waiter>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a free tag and return it with the receiving end of its waiter.
    pub fn register(&mut self, client_id: &str) -> Option<(String, oneshot::Receiver<ReplyResult>)> {
        // At most 255 tags exist; skip those still in flight
        for _ in 0..u8::MAX {
            let tag = format!("{}{}", TAG_PREFIX, self.seq.next_seq());
            if self.waiters.contains_key(&tag) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            self.waiters.insert(
                tag.clone(),
                Waiter {
                    client_id: client_id.to_string(),
                    tx,
                    partial: None,
                },
            );
            return Some((tag, rx));
        }
        None
    }

    /// Offer a device line. Returns true when it belonged to a waiter.
    pub fn resolve_line(&mut self, line: &str) -> bool {
        let Some(reply) = parse_reply(line) else {
            return false;
        };
        let Some(waiter) = self.waiters.get_mut(reply.tag) else {
            return false;
        };
        // The state dump comes first; the counters line completes the reply
        if reply.body.starts_with("diag:") {
            waiter.partial = Some(reply.body.to_string());
            return true;
        }
        let body = match waiter.partial.take() {
            Some(first) => format!("{}\n{}", first, reply.body),
            None => reply.body.to_string(),
        };
        if let Some(waiter) = self.waiters.remove(reply.tag) {
            debug!("Reply {} for client request {}", reply.tag, waiter.client_id);
            let _ = waiter.tx.send(Ok(body));
        }
        true
    }

    /// Drop a waiter whose caller gave up. Returns whether it was still there.
    pub fn remove(&mut self, tag: &str) -> bool {
        self.waiters.remove(tag).is_some()
    }

    /// Resolve every waiter with a failure, e.g. when the device resets.
    pub fn fail_all(&mut self, err: impl Fn() -> BridgeError) -> usize {
        let n = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.tx.send(Err(err()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_match_by_tag() {
        let mut table = PendingTable::new();
        let (t1, mut r1) = table.register("a").unwrap();
        let (t2, mut r2) = table.register("b").unwrap();
        assert_eq!(t1, "b1");
        assert_eq!(t2, "b2");
        // Out of order
        assert!(table.resolve_line("{b2_false}"));
        assert!(table.resolve_line("{b1_ok}"));
        assert_eq!(r1.try_recv().unwrap().unwrap(), "ok");
        assert_eq!(r2.try_recv().unwrap().unwrap(), "false");
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsolicited_lines_ignored() {
        let mut table = PendingTable::new();
        let _waiter = table.register("a").unwrap();
        assert!(!table.resolve_line("R"));
        assert!(!table.resolve_line("{ok}"));
        assert!(!table.resolve_line("{b9_ok}"));
        assert!(!table.resolve_line("HW:uno-tb6612-v11 imu=0 batt=7800"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_diagnostics_two_lines() {
        let mut table = PendingTable::new();
        let (tag, mut rx) = table.register("d").unwrap();
        assert!(table.resolve_line(&format!("{{{}_diag:owner=I,l=0}}", tag)));
        assert!(rx.try_recv().is_err());
        assert!(table.resolve_line(&format!("{{{}_stats:rx=0,jd=0}}", tag)));
        let body = rx.try_recv().unwrap().unwrap();
        assert_eq!(body, "diag:owner=I,l=0\nstats:rx=0,jd=0");
    }

    #[test]
    fn test_remove_and_fail_all() {
        let mut table = PendingTable::new();
        let (tag, _rx) = table.register("a").unwrap();
        assert!(table.remove(&tag));
        assert!(!table.remove(&tag));
        let (_, mut rx) = table.register("b").unwrap();
        assert_eq!(table.fail_all(|| BridgeError::DeviceReset), 1);
        assert!(matches!(rx.try_recv().unwrap(), Err(BridgeError::DeviceReset)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_tags_skip_in_flight() {
        let mut table = PendingTable::new();
        let (first, _keep) = table.register("a").unwrap();
        for _ in 0..254 {
            let (tag, _) = table.register("x").unwrap();
            table.remove(&tag);
        }
        // Sequence wrapped back to 1, which is still pending
        let (tag, _) = table.register("y").unwrap();
        assert_ne!(tag, first);
        assert_eq!(tag, "b2");
    }
}
