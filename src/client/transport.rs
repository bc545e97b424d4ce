//! WebSocket connection to a sync server.
//!
//! One socket carries every request and broadcast. Requests are matched to
//! replies by request id; DocOp broadcasts are routed to the channel
//! registered for their file edit session, tree broadcasts to every tree
//! subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::{
    ClientConfig, ClientError, ClientResult, CollaborationSession, CollaborationSessionHandle,
    DirectoryApi, DocOpApi, LocalDocument, RecoveryApi, SessionEvent,
};
use crate::sync::messages::{
    ClientToServerDocOp, GetDirectory, GetDirectoryResponse, GetFileContents,
    GetFileContentsResponse, Mutation, RecoverFromMissedDocOps, RecoverFromMissedDocOpsResponse,
    ServerToClientDocOp, ServerToClientDocOps, WorkspaceTreeUpdate, WorkspaceTreeUpdateBroadcast,
};
use crate::sync::protocol::{ClientMessage, ServerMessage, SyncProtocol, PROTOCOL_VERSION};
use crate::sync::{ClientId, FileEditSessionKey};

type TreeSubscriber = mpsc::UnboundedSender<Option<WorkspaceTreeUpdateBroadcast>>;

/// Dispatches decoded server messages
#[derive(Default)]
struct Router {
    pending: DashMap<u64, oneshot::Sender<ServerMessage>>,
    doc_ops: DashMap<FileEditSessionKey, mpsc::UnboundedSender<ServerToClientDocOp>>,
    /// Receivers opened with a file but not picked up yet
    unclaimed: DashMap<FileEditSessionKey, mpsc::UnboundedReceiver<ServerToClientDocOp>>,
    tree: Mutex<Vec<TreeSubscriber>>,
}

impl Router {
    fn route(&self, msg: ServerMessage) {
        if let Some(request_id) = msg.request_id() {
            // Broadcasts that follow an open must not race the subscription.
            if let ServerMessage::FileContents { message, .. } = &msg {
                self.open_channel(&message.file_edit_session_key);
            }
            match self.pending.remove(&request_id) {
                Some((_, reply)) => {
                    let _ = reply.send(msg);
                }
                None => debug!("Reply to unknown request {}", request_id),
            }
            return;
        }

        match msg {
            ServerMessage::DocOpBroadcast { message } => {
                let key = message.file_edit_session_key.clone();
                let delivered = self.doc_ops.get(&key).map(|tx| tx.send(message).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        self.doc_ops.remove(&key);
                    }
                    None => debug!("No session open for {}", key),
                }
            }
            ServerMessage::WorkspaceTreeBroadcast { message } => {
                self.tree
                    .lock()
                    .retain(|subscriber| subscriber.send(message.clone()).is_ok());
            }
            ServerMessage::Error { code, message, .. } => {
                warn!("Server error {:?}: {}", code, message);
            }
            ServerMessage::Goodbye { reason } => {
                info!(
                    "Server said goodbye: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
            }
            other => debug!("Ignoring unsolicited message {:?}", other),
        }
    }

    fn open_channel(&self, key: &str) {
        if self.doc_ops.contains_key(key) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.doc_ops.insert(key.to_string(), tx);
        self.unclaimed.insert(key.to_string(), rx);
    }

    fn subscribe(&self, key: &str) -> mpsc::UnboundedReceiver<ServerToClientDocOp> {
        if let Some((_, rx)) = self.unclaimed.remove(key) {
            return rx;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.doc_ops.insert(key.to_string(), tx);
        rx
    }

    fn unsubscribe(&self, key: &str) {
        self.doc_ops.remove(key);
        self.unclaimed.remove(key);
    }

    /// Fail every waiting request and end every subscription
    fn close(&self) {
        self.pending.clear();
        self.doc_ops.clear();
        self.unclaimed.clear();
        self.tree.lock().clear();
    }
}

/// A connected collaborator
pub struct SyncClient {
    client_id: ClientId,
    config: ClientConfig,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    router: Arc<Router>,
    next_request_id: AtomicU64,
    closing: Arc<Notify>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `url` and complete the handshake
    pub async fn connect(url: &str, client_name: &str, config: ClientConfig) -> ClientResult<Self> {
        let (socket, _) = connect_async(url).await.map_err(transport_error)?;
        let (mut sink, mut stream) = socket.split();

        let hello = SyncProtocol::encode_client(&ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: client_name.to_string(),
        })?;
        sink.send(Message::Binary(hello.to_vec()))
            .await
            .map_err(transport_error)?;

        let client_id = tokio::time::timeout(config.request_timeout, read_welcome(&mut stream))
            .await
            .map_err(|_| ClientError::Transport("handshake timed out".to_string()))??;
        info!("Connected to {} as {}", url, client_id);

        let router = Arc::new(Router::default());
        let closing = Arc::new(Notify::new());
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let writer_closing = closing.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let data = match SyncProtocol::encode_client(&msg) {
                            Ok(data) => data,
                            Err(e) => {
                                error!("Failed to encode message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                            warn!("Failed to send message: {}", e);
                            break;
                        }
                    }
                    _ = writer_closing.notified() => break,
                }
            }
            let _ = sink.close().await;
        });

        let reader_router = router.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncProtocol::decode_server(&data) {
                        Ok(msg) => reader_router.route(msg),
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                }
            }
            reader_router.close();
            info!("Disconnected from sync server");
        });

        Ok(Self {
            client_id,
            config,
            outgoing,
            router,
            next_request_id: AtomicU64::new(1),
            closing,
            reader,
            writer,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Receive DocOp broadcasts for one file edit session
    pub fn subscribe_doc_ops(&self, key: &str) -> mpsc::UnboundedReceiver<ServerToClientDocOp> {
        self.router.subscribe(key)
    }

    /// Receive workspace tree broadcasts. `None` means the payload was lost
    /// and the tree should be reloaded.
    pub fn subscribe_tree(&self) -> mpsc::UnboundedReceiver<Option<WorkspaceTreeUpdateBroadcast>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router.tree.lock().push(tx);
        rx
    }

    /// Open a file and join its edit session
    pub async fn get_file_contents(&self, path: &str) -> ClientResult<GetFileContentsResponse> {
        let request_id = self.next_request_id();
        let message = GetFileContents {
            path: path.to_string(),
        };
        match self
            .request(request_id, ClientMessage::GetFileContents { request_id, message })
            .await?
        {
            ServerMessage::FileContents { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    /// Open a file and start a collaboration session on it
    pub async fn open_file(
        self: &Arc<Self>,
        path: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> ClientResult<CollaborationSessionHandle> {
        let file = self.get_file_contents(path).await?;
        let incoming = self.subscribe_doc_ops(&file.file_edit_session_key);
        let document = LocalDocument::from_file_contents(self.client_id.clone(), &file);
        debug!(
            "Opened {} at revision {} as session {}",
            file.path, file.cc_revision, file.file_edit_session_key
        );
        Ok(CollaborationSession::new(self.clone(), document, &self.config).spawn(incoming, events))
    }

    /// Leave a file's edit session
    pub fn close_file(&self, key: &str) -> ClientResult<()> {
        self.router.unsubscribe(key);
        self.send(ClientMessage::CloseFile {
            file_edit_session_key: key.to_string(),
        })
    }

    /// Apply tree mutations on the server as this client
    pub async fn mutate_workspace_tree(
        &self,
        mutations: Vec<Mutation>,
    ) -> ClientResult<WorkspaceTreeUpdateBroadcast> {
        let request_id = self.next_request_id();
        let message = WorkspaceTreeUpdate {
            author_client_id: self.client_id.clone(),
            mutations,
        };
        match self
            .request(request_id, ClientMessage::MutateWorkspaceTree { request_id, message })
            .await?
        {
            ServerMessage::WorkspaceTreeUpdated { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    /// Say goodbye and close the socket once queued messages are written
    pub fn disconnect(&self) {
        let _ = self.send(ClientMessage::Goodbye { reason: None });
        self.closing.notify_one();
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, msg: ClientMessage) -> ClientResult<()> {
        self.outgoing.send(msg).map_err(|_| ClientError::Closed)
    }

    async fn request(&self, request_id: u64, msg: ClientMessage) -> ClientResult<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.router.pending.insert(request_id, tx);
        if let Err(e) = self.send(msg) {
            self.router.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ServerMessage::Error { code, message, .. })) => {
                Err(ClientError::from_server(code, message))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.router.pending.remove(&request_id);
                Err(ClientError::Transport(format!(
                    "request {} timed out after {:?}",
                    request_id, self.config.request_timeout
                )))
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl DocOpApi for SyncClient {
    async fn mutate_document(
        &self,
        message: ClientToServerDocOp,
    ) -> ClientResult<ServerToClientDocOps> {
        let request_id = self.next_request_id();
        match self
            .request(request_id, ClientMessage::MutateDocument { request_id, message })
            .await?
        {
            ServerMessage::DocOpsApplied { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl RecoveryApi for SyncClient {
    async fn recover_missed_doc_ops(
        &self,
        message: RecoverFromMissedDocOps,
    ) -> ClientResult<RecoverFromMissedDocOpsResponse> {
        let request_id = self.next_request_id();
        match self
            .request(request_id, ClientMessage::RecoverMissedDocOps { request_id, message })
            .await?
        {
            ServerMessage::RecoveryResponse { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl DirectoryApi for SyncClient {
    async fn get_directory(&self, message: GetDirectory) -> ClientResult<GetDirectoryResponse> {
        let request_id = self.next_request_id();
        match self
            .request(request_id, ClientMessage::GetDirectory { request_id, message })
            .await?
        {
            ServerMessage::Directory { message, .. } => Ok(message),
            other => Err(unexpected(other)),
        }
    }
}

async fn read_welcome<S>(stream: &mut S) -> ClientResult<ClientId>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame.map_err(transport_error)? {
            Message::Binary(data) => {
                return match SyncProtocol::decode_server(&data)? {
                    ServerMessage::Welcome { client_id, .. } => Ok(client_id),
                    ServerMessage::Error { code, message, .. } => {
                        Err(ClientError::from_server(code, message))
                    }
                    other => Err(unexpected(other)),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ClientError::Closed)
}

fn transport_error(err: WsError) -> ClientError {
    ClientError::Transport(err.to_string())
}

fn unexpected(msg: ServerMessage) -> ClientError {
    ClientError::UnexpectedReply(format!("{:?}", msg))
}
