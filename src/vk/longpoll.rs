use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vk::api::VkApiError;
use crate::vk::update::Update;

/// Polling credentials handed out by the long-poll control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollServer {
    pub key: String,
    pub server: String,
    pub ts: u64,
}

/// Raw body of one `a_check` response, before the failure protocol is
/// applied: either `{ts, updates}` or `{failed, ts?}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPollResponse {
    pub failed: Option<i64>,
    pub ts: Option<u64>,
    #[serde(default)]
    pub updates: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum PollError {
    /// failed=4: the requested long-poll protocol version is not supported.
    #[error("long poll protocol version mismatch (failed=4)")]
    VersionMismatch,
    #[error("unexpected long poll failure code {0}")]
    UnexpectedFailure(i64),
    #[error("long poll failure code {code} arrived without a ts to resync to")]
    MissingCursor { code: i64 },
    #[error(transparent)]
    Api(#[from] VkApiError),
}

/// Capability to reach the remote long-poll endpoints. The production
/// implementation is [`crate::vk::api::VkApi`].
#[async_trait]
pub trait LongPollTransport: Send + Sync {
    /// Fetch a fresh `{key, server, ts}` triple from the control endpoint.
    async fn acquire(&self) -> Result<PollServer, PollError>;

    /// Issue one `a_check` request against the held server, waiting up to
    /// `wait` seconds for new events.
    async fn poll(&self, server: &PollServer, wait: u64) -> Result<RawPollResponse, PollError>;
}

/// One long-poll session against the remote event stream.
///
/// Transient desync (failure codes 1-3) is recovered inside `poll` and is
/// never visible to the caller; an error returned from `poll` is fatal to
/// the session.
pub struct LongPollSession {
    transport: Arc<dyn LongPollTransport>,
    server: PollServer,
    wait: u64,
}

impl LongPollSession {
    pub async fn connect(
        transport: Arc<dyn LongPollTransport>,
        wait: u64,
    ) -> Result<Self, PollError> {
        let server = transport.acquire().await?;
        info!("long poll session established at ts {}", server.ts);
        Ok(Self {
            transport,
            server,
            wait,
        })
    }

    /// Current cursor position.
    pub fn cursor(&self) -> u64 {
        self.server.ts
    }

    /// Block until the remote responds with a batch of updates (possibly
    /// empty, after the wait interval elapses). One logical call may issue
    /// several network requests while resyncing.
    pub async fn poll(&mut self) -> Result<Vec<Update>, PollError> {
        loop {
            let response = self.transport.poll(&self.server, self.wait).await?;
            match response.failed {
                None => {
                    if let Some(ts) = response.ts {
                        self.server.ts = ts;
                    }
                    return Ok(parse_updates(&response.updates));
                }
                // Cursor fell behind but the key is still valid: adopt the
                // returned ts and retry against the same server.
                Some(1) => {
                    let ts = response.ts.ok_or(PollError::MissingCursor { code: 1 })?;
                    debug!("long poll cursor resync to ts {}", ts);
                    self.server.ts = ts;
                }
                // Key expired (2) or state lost (3): the whole triple must
                // be renewed.
                Some(code @ (2 | 3)) => {
                    debug!("long poll key invalid (failed={}), re-acquiring server", code);
                    self.server = self.transport.acquire().await?;
                }
                Some(4) => return Err(PollError::VersionMismatch),
                Some(code) => return Err(PollError::UnexpectedFailure(code)),
            }
        }
    }
}

fn parse_updates(raw: &[Value]) -> Vec<Update> {
    let mut updates = Vec::with_capacity(raw.len());
    for value in raw {
        match Update::from_raw(value) {
            Some(update) => updates.push(update),
            None => warn!("skipping malformed update: {}", value),
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<RawPollResponse>>,
        acquires: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<RawPollResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                acquires: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LongPollTransport for ScriptedTransport {
        async fn acquire(&self) -> Result<PollServer, PollError> {
            let n = self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(PollServer {
                key: format!("key-{}", n),
                server: "im.example.com".to_string(),
                ts: 1,
            })
        }

        async fn poll(
            &self,
            _server: &PollServer,
            _wait: u64,
        ) -> Result<RawPollResponse, PollError> {
            let mut responses = self.responses.lock().await;
            Ok(responses.pop_front().expect("script exhausted"))
        }
    }

    fn response(json: Value) -> RawPollResponse {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn success_returns_updates_and_advances_cursor() {
        let transport = ScriptedTransport::new(vec![response(json!({
            "ts": 7,
            "updates": [[4, 1, 0, 2000000001, 0, "hi"]]
        }))]);
        let mut session = LongPollSession::connect(transport.clone(), 25).await.unwrap();

        let updates = session.poll().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].text, "hi");
        assert_eq!(session.cursor(), 7);
        assert_eq!(transport.acquires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resync_sequence_yields_one_observable_result() {
        // failed=1 adopts the returned ts, failed=2 forces a re-acquire,
        // and only the final success is visible to the caller.
        let transport = ScriptedTransport::new(vec![
            response(json!({"failed": 1, "ts": 5})),
            response(json!({"failed": 2})),
            response(json!({"ts": 9, "updates": [[4, 2, 0, 2000000001, 0, "after resync"]]})),
        ]);
        let mut session = LongPollSession::connect(transport.clone(), 25).await.unwrap();
        assert_eq!(transport.acquires.load(Ordering::SeqCst), 1);

        let updates = session.poll().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].text, "after resync");
        assert_eq!(session.cursor(), 9);
        // connect plus exactly one renewal after the failed=2 response
        assert_eq!(transport.acquires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn version_mismatch_is_fatal() {
        let transport = ScriptedTransport::new(vec![response(json!({"failed": 4}))]);
        let mut session = LongPollSession::connect(transport, 25).await.unwrap();

        match session.poll().await {
            Err(PollError::VersionMismatch) => {}
            other => panic!("expected VersionMismatch, got {:?}", other.map(|u| u.len())),
        }
    }

    #[tokio::test]
    async fn unknown_failure_code_is_fatal() {
        let transport = ScriptedTransport::new(vec![response(json!({"failed": 9}))]);
        let mut session = LongPollSession::connect(transport, 25).await.unwrap();

        match session.poll().await {
            Err(PollError::UnexpectedFailure(9)) => {}
            other => panic!("expected UnexpectedFailure(9), got {:?}", other.map(|u| u.len())),
        }
    }

    #[tokio::test]
    async fn malformed_updates_are_skipped() {
        let transport = ScriptedTransport::new(vec![response(json!({
            "ts": 3,
            "updates": [{"bogus": true}, [4, 1, 0, 2000000001, 0, "kept"]]
        }))]);
        let mut session = LongPollSession::connect(transport, 25).await.unwrap();

        let updates = session.poll().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].text, "kept");
    }
}
