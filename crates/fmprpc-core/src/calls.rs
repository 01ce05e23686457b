//! Outstanding client calls keyed by sequence number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rmpv::Value;
use tokio::sync::mpsc;

use crate::message::{CompressionType, SeqNumber};

/// Error and result fields of a `Response` frame, as received.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub error: Value,
    pub result: Value,
}

/// A call waiting for its response.
#[derive(Debug)]
pub struct Call {
    seq: SeqNumber,
    method: String,
    compression: CompressionType,
    result_tx: mpsc::Sender<CallResponse>,
}

impl Call {
    pub fn seq(&self) -> SeqNumber {
        self.seq
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Hands a response to the waiter without blocking. Returns false when
    /// the single slot is already taken or the waiter is gone.
    pub fn deliver(&self, response: CallResponse) -> bool {
        self.result_tx.try_send(response).is_ok()
    }
}

/// Thread-safe map of in-flight calls plus the sequence counter.
#[derive(Debug, Default)]
pub struct CallTable {
    next_seq: AtomicU64,
    calls: Mutex<HashMap<SeqNumber, Arc<Call>>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current counter value and advances it. Starts at 0.
    pub fn next_sequence(&self) -> SeqNumber {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a call with a fresh sequence number. The receiver is the
    /// call's one-slot result channel.
    pub fn new_call(
        &self,
        method: impl Into<String>,
        compression: CompressionType,
    ) -> (Arc<Call>, mpsc::Receiver<CallResponse>) {
        let (result_tx, result_rx) = mpsc::channel(1);
        let call = Arc::new(Call {
            seq: self.next_sequence(),
            method: method.into(),
            compression,
            result_tx,
        });
        (call, result_rx)
    }

    pub fn add(&self, call: Arc<Call>) {
        self.lock().insert(call.seq, call);
    }

    pub fn get(&self, seq: SeqNumber) -> Option<Arc<Call>> {
        self.lock().get(&seq).cloned()
    }

    pub fn remove(&self, seq: SeqNumber) -> Option<Arc<Call>> {
        self.lock().remove(&seq)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SeqNumber, Arc<Call>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a call from its table when dropped.
pub(crate) struct CallGuard<'a> {
    pub(crate) table: &'a CallTable,
    pub(crate) seq: SeqNumber,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequence_starts_at_zero() {
        let table = CallTable::new();
        assert_eq!(table.next_sequence(), 0);
        assert_eq!(table.next_sequence(), 1);
        let (call, _rx) = table.new_call("a.b", CompressionType::None);
        assert_eq!(call.seq(), 2);
    }

    #[test]
    fn test_get_after_remove_is_none() {
        let table = CallTable::new();
        let (call, _rx) = table.new_call("a.b", CompressionType::Gzip);
        let seq = call.seq();
        table.add(call);
        assert_eq!(table.get(seq).unwrap().method(), "a.b");
        assert!(table.remove(seq).is_some());
        assert!(table.get(seq).is_none());
        assert!(table.remove(seq).is_none());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let table = CallTable::new();
        let (call, _rx) = table.new_call("a.b", CompressionType::None);
        let seq = call.seq();
        table.add(call);
        {
            let _guard = CallGuard { table: &table, seq };
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_fills_single_slot() {
        let table = CallTable::new();
        let (call, mut rx) = table.new_call("a.b", CompressionType::None);
        let response = CallResponse {
            error: Value::Nil,
            result: Value::from(42),
        };
        assert!(call.deliver(response.clone()));
        assert!(!call.deliver(response.clone()));
        assert_eq!(rx.recv().await.unwrap(), response);
    }

    #[test]
    fn test_deliver_after_waiter_gone_does_not_block() {
        let table = CallTable::new();
        let (call, rx) = table.new_call("a.b", CompressionType::None);
        drop(rx);
        assert!(!call.deliver(CallResponse {
            error: Value::Nil,
            result: Value::Nil,
        }));
    }

    #[test]
    fn test_concurrent_new_call_unique() {
        let table = Arc::new(CallTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| {
                            let (call, _rx) = table.new_call("a.b", CompressionType::None);
                            let seq = call.seq();
                            table.add(call);
                            seq
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq));
            }
        }
        assert_eq!(seen.len(), 2000);
        for seq in &seen {
            assert!(table.remove(*seq).is_some());
            assert!(table.get(*seq).is_none());
        }
    }
}
