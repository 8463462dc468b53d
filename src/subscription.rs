//! New-block subscriptions
//!
//! With a `ws_url` the client subscribes to `newHeads` over WebSocket and
//! fetches each announced block over HTTP. The socket is re-established
//! with capped exponential backoff whenever it drops, from a single task,
//! so at most one reconnect is ever pending. Without a `ws_url` the chain
//! head is polled once per block time instead.

use crate::error::RpcError;
use crate::retry::RetryPolicy;
use crate::rpc::{ChainClient, RpcClient};
use crate::types::{parse_hex_u64, BlockView};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Blocks buffered between the subscription task and its consumer.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// A live stream of new blocks. Dropping it ends the stream.
pub struct BlockSubscription {
    blocks: mpsc::Receiver<BlockView>,
    cancel: CancellationToken,
}

impl BlockSubscription {
    pub fn new(blocks: mpsc::Receiver<BlockView>, cancel: CancellationToken) -> Self {
        Self { blocks, cancel }
    }

    /// Next block, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<BlockView> {
        self.blocks.recv().await
    }

    /// Stop the background task. Already buffered blocks are still returned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start the background task that feeds a `BlockSubscription`.
pub(crate) fn spawn(client: RpcClient) -> BlockSubscription {
    let cancel = client.shutdown_token().child_token();
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let task_cancel = cancel.clone();
    match client.network().ws_url.clone() {
        Some(url) => {
            tokio::spawn(async move { run_websocket(&client, &url, tx, task_cancel).await });
        }
        None => {
            tokio::spawn(async move { run_polling(&client, tx, task_cancel).await });
        }
    }
    BlockSubscription::new(rx, cancel)
}

/// Backoff between reconnect attempts: 1s doubling to 30s.
fn reconnect_policy() -> RetryPolicy {
    RetryPolicy::new(u32::MAX)
        .with_initial_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
}

/// Why a WebSocket session ended without error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Subscription or client cancelled
    Cancelled,
    /// The consumer dropped its receiver
    ReceiverGone,
    /// The server closed the socket
    Closed { delivered: bool },
}

/// Keep one `newHeads` session open, reconnecting whenever it ends.
///
/// Sessions run one after another on this task, never concurrently.
async fn run_websocket<C: ChainClient + ?Sized>(
    client: &C,
    url: &str,
    tx: mpsc::Sender<BlockView>,
    cancel: CancellationToken,
) {
    let policy = reconnect_policy();
    let network = client.network().name.clone();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match run_session(client, url, &tx, &cancel).await {
            Ok(SessionEnd::Cancelled) | Ok(SessionEnd::ReceiverGone) => break,
            Ok(SessionEnd::Closed { delivered }) => {
                warn!("WebSocket for {} closed by server", network);
                if delivered {
                    attempt = 0;
                }
            }
            Err(RpcError::Cancelled) => break,
            Err(e) => warn!("WebSocket for {} failed: {}", network, e),
        }

        attempt = attempt.saturating_add(1);
        let delay = policy.delay_for_retry(attempt);
        info!("Reconnecting to {} in {:?} (attempt {})", network, delay, attempt);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Block subscription for {} stopped", network);
}

/// One connect-subscribe-stream session.
async fn run_session<C: ChainClient + ?Sized>(
    client: &C,
    url: &str,
    tx: &mpsc::Sender<BlockView>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, RpcError> {
    let (mut ws, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        connected = connect_async(url) => connected.map_err(|e| RpcError::Transport(e.to_string()))?,
    };

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["newHeads"]
    });
    ws.send(Message::Text(request.to_string()))
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;

    let mut delivered = false;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(SessionEnd::Cancelled);
            }
            frame = ws.next() => frame,
        };

        let text = match frame {
            None => return Ok(SessionEnd::Closed { delivered }),
            Some(Err(e)) => return Err(RpcError::Transport(e.to_string())),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed { delivered }),
            Some(Ok(_)) => continue,
        };

        match parse_ws_message(&text) {
            WsMessage::Subscribed(id) => {
                info!("Subscribed to new heads on {} ({})", client.network().name, id);
            }
            WsMessage::NewHead(number) => match client.block(number, true).await {
                Ok(block) => {
                    if tx.send(block).await.is_err() {
                        return Ok(SessionEnd::ReceiverGone);
                    }
                    delivered = true;
                }
                Err(RpcError::Cancelled) => return Ok(SessionEnd::Cancelled),
                Err(e) => warn!("Failed to fetch announced block {}: {}", number, e),
            },
            WsMessage::Error { code, message } => {
                return Err(RpcError::Rpc { code, message });
            }
            WsMessage::Other => {}
        }
    }
}

/// A decoded WebSocket frame.
#[derive(Debug, PartialEq, Eq)]
enum WsMessage {
    /// Subscription confirmation carrying the subscription id
    Subscribed(String),
    /// `eth_subscription` notification for a new head
    NewHead(u64),
    Error { code: i64, message: String },
    Other,
}

fn parse_ws_message(text: &str) -> WsMessage {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return WsMessage::Other;
    };

    if let Some(error) = value.get("error") {
        return WsMessage::Error {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        };
    }

    if value.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        return value
            .pointer("/params/result/number")
            .and_then(Value::as_str)
            .and_then(|n| parse_hex_u64(n).ok())
            .map(WsMessage::NewHead)
            .unwrap_or(WsMessage::Other);
    }

    match value.get("result").and_then(Value::as_str) {
        Some(id) if value.get("id").is_some() => WsMessage::Subscribed(id.to_string()),
        _ => WsMessage::Other,
    }
}

/// Poll the chain head once per block time, delivering every new block in order.
async fn run_polling<C: ChainClient + ?Sized>(
    client: &C,
    tx: mpsc::Sender<BlockView>,
    cancel: CancellationToken,
) {
    let network = client.network().name.clone();
    let interval = client.network().block_time();
    info!("Polling {} for new blocks every {:?}", network, interval);

    let mut next: Option<u64> = None;
    loop {
        match client.latest_block_number().await {
            Ok(latest) => {
                let from = next.unwrap_or(latest);
                for number in from..=latest {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match client.block(number, true).await {
                        Ok(block) => {
                            if tx.send(block).await.is_err() {
                                return;
                            }
                        }
                        Err(RpcError::Cancelled) => return,
                        Err(e) => warn!("Skipping block {} on {}: {}", number, network, e),
                    }
                }
                next = Some(from.max(latest + 1));
            }
            Err(RpcError::Cancelled) => return,
            Err(e) => warn!("Failed to poll head of {}: {}", network, e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct SessionCounts {
        opened: AtomicUsize,
        open: AtomicUsize,
        max_open: AtomicUsize,
    }

    /// Accept one subscriber, announce `head`, then hang up or hold the socket.
    async fn serve_heads(stream: TcpStream, head: u64, hang_up: bool, counts: Arc<SessionCounts>) {
        let mut ws = accept_async(stream).await.unwrap();
        let now = counts.open.fetch_add(1, Ordering::SeqCst) + 1;
        counts.max_open.fetch_max(now, Ordering::SeqCst);

        let _subscribe = ws.next().await;
        let ack = json!({ "jsonrpc": "2.0", "id": 1, "result": "0x1f" });
        ws.send(Message::Text(ack.to_string())).await.unwrap();
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x1f",
                "result": { "number": format!("0x{:x}", head) }
            }
        });
        ws.send(Message::Text(notification.to_string())).await.unwrap();

        if hang_up {
            let _ = ws.close(None).await;
        } else {
            while let Some(Ok(_)) = ws.next().await {}
        }
        counts.open.fetch_sub(1, Ordering::SeqCst);
    }

    async fn recv_block(rx: &mut mpsc::Receiver<BlockView>) -> u64 {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no block delivered in time")
            .expect("subscription ended")
            .number
    }

    #[tokio::test]
    async fn test_websocket_reconnects_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let counts = Arc::new(SessionCounts::default());

        let server_counts = counts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // First session announces block 1 and hangs up; later ones announce block 2
                let session = server_counts.opened.fetch_add(1, Ordering::SeqCst);
                let head = if session == 0 { 1 } else { 2 };
                tokio::spawn(serve_heads(stream, head, session == 0, server_counts.clone()));
            }
        });

        let chain = Arc::new(MockChain::new());
        chain.add_empty_blocks(1..=2);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let chain = chain.clone();
            let cancel = cancel.clone();
            async move { run_websocket(chain.as_ref(), &url, tx, cancel).await }
        });

        assert_eq!(recv_block(&mut rx).await, 1);
        assert_eq!(recv_block(&mut rx).await, 2);
        assert_eq!(counts.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counts.max_open.load(Ordering::SeqCst), 1);

        cancel.cancel();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("subscription task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_polling_delivers_new_blocks_in_order() {
        let chain = Arc::new(MockChain::new().with_block_time(Duration::from_millis(20)));
        chain.add_empty_blocks(1..=3);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let chain = chain.clone();
            let cancel = cancel.clone();
            async move { run_polling(chain.as_ref(), tx, cancel).await }
        });

        // Starts at the current head
        assert_eq!(recv_block(&mut rx).await, 3);

        chain.add_empty_blocks(4..=6);
        for expected in 4..=6 {
            assert_eq!(recv_block(&mut rx).await, expected);
        }

        cancel.cancel();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("polling task did not stop")
            .unwrap();
    }

    #[test]
    fn test_parse_new_head_notification() {
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9ce59a13059e417087c02d3236a0b1cc",
                "result": {
                    "number": "0x1b4",
                    "hash": "0xdc0818cf78f21a8e70579cb46a43643f78291264dda342ae31049421c82d21ae"
                }
            }
        }"#;
        assert_eq!(parse_ws_message(text), WsMessage::NewHead(436));
    }

    #[test]
    fn test_parse_subscription_ack() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":"0xcd0c3e8af590364c09d0fa6a1210faf5"}"#;
        assert_eq!(
            parse_ws_message(text),
            WsMessage::Subscribed("0xcd0c3e8af590364c09d0fa6a1210faf5".to_string())
        );
    }

    #[test]
    fn test_parse_error_and_noise() {
        let text = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"subscriptions not supported"}}"#;
        assert_eq!(
            parse_ws_message(text),
            WsMessage::Error {
                code: -32601,
                message: "subscriptions not supported".to_string()
            }
        );
        assert_eq!(parse_ws_message("not json"), WsMessage::Other);
        assert_eq!(
            parse_ws_message(r#"{"method":"eth_subscription","params":{"result":{}}}"#),
            WsMessage::Other
        );
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = reconnect_policy();
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(100), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_dropping_subscription_cancels_task() {
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let observer = cancel.clone();
        let subscription = BlockSubscription::new(rx, cancel);
        drop(subscription);
        assert!(observer.is_cancelled());
    }
}
