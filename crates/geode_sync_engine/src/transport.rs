//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use geode_sync_protocol::{BatchRequest, BatchResponse, FetchRequest, FetchResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport carries batches to the remote backend.
///
/// Calls block until the remote answers or the transport gives up. The
/// engine holds no entity lock while a call is outstanding.
pub trait SyncTransport: Send + Sync {
    /// Sends an ordered batch and returns the per-item results.
    fn send_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse>;

    /// Fetches the authoritative copy of one entity.
    fn fetch(&self, request: &FetchRequest) -> SyncResult<FetchResponse>;

    /// Checks if the transport can currently reach the remote.
    fn is_connected(&self) -> bool;
}

/// A mock transport for testing.
///
/// Answers with queued responses in order; once the queue is empty, every
/// item in a batch is rejected so a forgotten setup fails loudly.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    batch_responses: Mutex<VecDeque<SyncResult<BatchResponse>>>,
    fetch_response: Mutex<Option<FetchResponse>>,
    sent: Mutex<Vec<BatchRequest>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues the response to the next batch.
    pub fn push_batch_response(&self, response: BatchResponse) {
        self.batch_responses.lock().push_back(Ok(response));
    }

    /// Queues a failure for the next batch.
    pub fn push_batch_error(&self, error: SyncError) {
        self.batch_responses.lock().push_back(Err(error));
    }

    /// Sets the fetch response.
    pub fn set_fetch_response(&self, response: FetchResponse) {
        *self.fetch_response.lock() = Some(response);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns every batch sent so far.
    pub fn sent_batches(&self) -> Vec<BatchRequest> {
        self.sent.lock().clone()
    }
}

impl SyncTransport for MockTransport {
    fn send_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.sent.lock().push(request.clone());
        match self.batch_responses.lock().pop_front() {
            Some(result) => result,
            None => Err(SyncError::Protocol("no mock batch response queued".into())),
        }
    }

    fn fetch(&self, _request: &FetchRequest) -> SyncResult<FetchResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.fetch_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock fetch response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geode_sync_protocol::{ItemOutcome, ItemResult};

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        let result = transport.send_batch(&BatchRequest::new(Vec::new()));
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[test]
    fn mock_transport_answers_in_order() {
        let transport = MockTransport::new();
        transport.push_batch_error(SyncError::Timeout);
        transport.push_batch_response(BatchResponse::new(vec![ItemResult {
            op_id: 1,
            outcome: ItemOutcome::Accepted {
                remote_id: "r1".into(),
                version: 1,
            },
        }]));

        let batch = BatchRequest::new(Vec::new());
        assert!(matches!(transport.send_batch(&batch), Err(SyncError::Timeout)));
        assert_eq!(transport.send_batch(&batch).unwrap().results.len(), 1);
        assert!(transport.send_batch(&batch).is_err());
        assert_eq!(transport.sent_batches().len(), 3);
    }
}
