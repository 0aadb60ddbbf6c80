//! Client side of the transfer protocol.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::session::{SessionDirection, TransferProgress, TransferSession};
use super::{configure_nodelay, configure_tcp_keepalive};
use crate::config::TransferConfig;
use crate::connection::{parse_host_address, PeerEndpoint};
use crate::error::{Error, Result};
use crate::file::{validate_file_name, FileCatalog, FileEntry};
use crate::history::{TransferDirection, TransferLogSink, TransferRecord};
use crate::protocol::{
    copy_exact, decode_file_list, read_line, with_timeout, write_line, Command, FileHeader,
    Reply, FILE_NOT_FOUND_REASON,
};

type Stream = BufReader<TcpStream>;

/// Client for a peer's transfer server.
///
/// Every operation opens its own connection. Clones share the cancellation
/// state, so [`cleanup`](Self::cleanup) on any clone cancels the operations of
/// all of them.
#[derive(Debug, Clone)]
pub struct TransferClient {
    addr: SocketAddr,
    config: TransferConfig,
    cancel: Arc<Mutex<CancellationToken>>,
    log_sink: Option<Arc<dyn TransferLogSink>>,
    progress: Arc<watch::Sender<TransferProgress>>,
}

impl TransferClient {
    /// Create a client for the server at `addr`.
    pub fn new(addr: SocketAddr, config: TransferConfig) -> Self {
        let (progress, _) = watch::channel(TransferProgress::default());
        Self {
            addr,
            config,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            log_sink: None,
            progress: Arc::new(progress),
        }
    }

    /// Create a client from `ip` or `ip:port`, using the configured port by default.
    ///
    /// The address is validated before any I/O happens.
    pub fn from_host(host: &str, config: TransferConfig) -> Result<Self> {
        let addr = parse_host_address(host, config.port)?;
        Ok(Self::new(addr, config))
    }

    /// Create a client for the endpoint resolved by the connection supervisor.
    pub fn for_endpoint(endpoint: &PeerEndpoint, config: TransferConfig) -> Result<Self> {
        Self::from_host(&endpoint.address, config)
    }

    /// Report completed transfers to `sink`.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn TransferLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Progress of the most recent operation.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Cancel every in-flight operation and close its socket.
    ///
    /// Cancelled operations fail with [`Error::Cancelled`]. The client stays
    /// usable; operations started afterwards are unaffected. Calling this
    /// twice is harmless.
    pub fn cleanup(&self) {
        let mut token = self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
        tracing::debug!(server = %self.addr, "Transfer client cleaned up");
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn cancellable<T, F>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let token = self.token();
        tokio::select! {
            () = token.cancelled() => Err(Error::Cancelled),
            result = operation => result,
        }
    }

    fn session(&self, direction: SessionDirection) -> TransferSession {
        TransferSession::new(direction, self.addr, Some(self.progress.clone()))
    }

    fn record(&self, file_name: &str, direction: TransferDirection, size: u64) {
        if let Some(sink) = &self.log_sink {
            sink.record(TransferRecord::new(file_name, direction, size));
        }
    }

    /// Fetch the names of every file the peer shares.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        self.cancellable(async {
            let mut session = self.session(SessionDirection::List);
            let result = self.list_files_inner().await;
            session.finish(&result);
            result
        })
        .await
    }

    async fn list_files_inner(&self) -> Result<Vec<String>> {
        let mut stream = self.connect().await?;
        self.send_command(&mut stream, &Command::ListFiles).await?;

        let line = self.read_reply_line(&mut stream).await?;
        if let Ok(Reply::Error(reason)) = Reply::parse(&line) {
            return Err(Error::RemoteError(reason));
        }

        let names = decode_file_list(&line)?;
        tracing::debug!(server = %self.addr, count = names.len(), "Received file list");
        Ok(names)
    }

    /// Download `name` from the peer into `catalog`.
    ///
    /// The file appears in the catalog only once every declared byte has
    /// arrived. A missing remote file fails with [`Error::FileNotFound`] and
    /// creates nothing locally.
    pub async fn download(&self, name: &str, catalog: &FileCatalog) -> Result<FileEntry> {
        validate_file_name(name)?;

        self.cancellable(async {
            let mut session = self.session(SessionDirection::Download);
            let result = self.download_inner(name, catalog, &mut session).await;
            session.finish(&result);
            result
        })
        .await
    }

    async fn download_inner(
        &self,
        name: &str,
        catalog: &FileCatalog,
        session: &mut TransferSession,
    ) -> Result<FileEntry> {
        let mut stream = self.connect().await?;
        self.send_command(&mut stream, &Command::GetFile(name.to_string()))
            .await?;

        let line = self.read_reply_line(&mut stream).await?;
        match Reply::parse(&line) {
            Ok(Reply::Ok) => {}
            Ok(Reply::Error(reason)) if reason == FILE_NOT_FOUND_REASON => {
                return Err(Error::FileNotFound(name.to_string()));
            }
            Ok(Reply::Error(reason)) => return Err(Error::RemoteError(reason)),
            _ => {
                return Err(Error::UnexpectedReply {
                    expected: Reply::Ok.to_string(),
                    actual: line,
                })
            }
        }

        let header = with_timeout(
            self.config.response_timeout,
            FileHeader::read(&mut stream),
        )
        .await?;
        if header.name != name {
            tracing::debug!(
                "Server sent '{}' for requested '{}', storing as requested",
                header.name,
                name
            );
        }

        let entry = receive_file(&mut stream, name, header.size, catalog, &self.config, session)
            .await?;

        tracing::info!(server = %self.addr, "Downloaded {} ({} bytes)", name, entry.size);
        self.record(name, TransferDirection::Received, entry.size);
        Ok(entry)
    }

    /// Upload a catalog entry to the peer.
    pub async fn upload(&self, entry: &FileEntry, catalog: &FileCatalog) -> Result<()> {
        self.cancellable(async {
            let mut session = self.session(SessionDirection::Upload);
            let result = self.upload_inner(entry, catalog, &mut session).await;
            session.finish(&result);
            result
        })
        .await
    }

    async fn upload_inner(
        &self,
        entry: &FileEntry,
        catalog: &FileCatalog,
        session: &mut TransferSession,
    ) -> Result<()> {
        let mut source = catalog.open_read(entry).await?;

        let mut stream = self.connect().await?;
        self.send_command(&mut stream, &Command::PutFile).await?;

        let line = self.read_reply_line(&mut stream).await?;
        match Reply::parse(&line) {
            Ok(Reply::Ready) => {}
            Ok(Reply::Error(reason)) => return Err(Error::RemoteError(reason)),
            _ => {
                return Err(Error::UnexpectedReply {
                    expected: Reply::Ready.to_string(),
                    actual: line,
                })
            }
        }

        with_timeout(
            self.config.response_timeout,
            FileHeader::new(&entry.name, entry.size).write(stream.get_mut()),
        )
        .await?;

        session.begin_transmit(&entry.name, entry.size);
        let sent = copy_exact(
            &mut source,
            stream.get_mut(),
            entry.size,
            self.config.chunk_size,
            self.config.response_timeout,
            |n| session.advance(n),
        )
        .await?;

        if sent != entry.size {
            // Local file shrank while sending; dropping the socket makes the server discard it
            return Err(Error::IncompleteTransfer {
                file: entry.name.clone(),
                expected: entry.size,
                received: sent,
            });
        }

        let line = self.read_reply_line(&mut stream).await?;
        match Reply::parse(&line) {
            Ok(Reply::Success) => {
                tracing::info!(server = %self.addr, "Uploaded {} ({} bytes)", entry.name, sent);
                self.record(&entry.name, TransferDirection::Sent, sent);
                Ok(())
            }
            Ok(Reply::Failed) => Err(Error::UploadRejected(entry.name.clone())),
            Ok(Reply::Error(reason)) => Err(Error::RemoteError(reason)),
            _ => Err(Error::UnexpectedReply {
                expected: Reply::Success.to_string(),
                actual: line,
            }),
        }
    }

    /// Register for files pushed by the server.
    ///
    /// Each pushed file is stored atomically in `catalog` and its name is
    /// yielded by the returned subscription.
    pub async fn subscribe_pushes(&self, catalog: Arc<FileCatalog>) -> Result<PushSubscription> {
        let mut stream = self
            .cancellable(async {
                let mut stream = self.connect().await?;
                self.send_command(&mut stream, &Command::ReadyForPush).await?;

                let line = self.read_reply_line(&mut stream).await?;
                match Reply::parse(&line) {
                    Ok(Reply::Ok) => Ok(stream),
                    Ok(Reply::Error(reason)) => Err(Error::RemoteError(reason)),
                    _ => Err(Error::UnexpectedReply {
                        expected: Reply::Ok.to_string(),
                        actual: line,
                    }),
                }
            })
            .await?;

        let cancel = self.token().child_token();
        let (tx, rx) = mpsc::channel(16);
        let client = self.clone();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = task_cancel.cancelled() => {
                    tracing::debug!(server = %client.addr, "Push subscription closed");
                }
                () = client.receive_pushes(&mut stream, &catalog, &tx) => {}
            }
        });

        tracing::info!(server = %self.addr, "Registered for server pushes");
        Ok(PushSubscription { rx, cancel })
    }

    async fn receive_pushes(
        &self,
        stream: &mut Stream,
        catalog: &FileCatalog,
        tx: &mpsc::Sender<Result<String>>,
    ) {
        loop {
            // Idle between pushes, so no deadline on the announcement line
            let line = match read_line(stream, self.config.max_line_length).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::debug!(server = %self.addr, "Server closed push channel");
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let result = match Reply::parse(&line) {
                Ok(Reply::ServerFile(name)) => self.receive_push(stream, &name, catalog).await,
                _ => Err(Error::UnexpectedReply {
                    expected: "SERVER_FILE:<name>".to_string(),
                    actual: line,
                }),
            };

            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                return;
            }
        }
    }

    async fn receive_push(
        &self,
        stream: &mut Stream,
        announced: &str,
        catalog: &FileCatalog,
    ) -> Result<String> {
        let mut session = self.session(SessionDirection::Download);
        let result = async {
            let header =
                with_timeout(self.config.response_timeout, FileHeader::read(stream)).await?;
            if header.name != announced {
                return Err(Error::ProtocolError(format!(
                    "pushed file header '{}' does not match announced '{}'",
                    header.name, announced
                )));
            }
            validate_file_name(&header.name)?;

            let entry = receive_file(
                stream,
                &header.name,
                header.size,
                catalog,
                &self.config,
                &mut session,
            )
            .await?;
            tracing::info!(server = %self.addr, "Received pushed file {}", entry.name);
            self.record(&entry.name, TransferDirection::Received, entry.size);
            Ok(entry.name)
        }
        .await;
        session.finish(&result);
        result
    }

    async fn connect(&self) -> Result<Stream> {
        let attempts = self.config.max_connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match timeout(self.config.connect_timeout, TcpStream::connect(self.addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = configure_tcp_keepalive(&stream) {
                        tracing::warn!("Failed to enable TCP keep-alive: {}", e);
                    }
                    configure_nodelay(&stream);
                    tracing::debug!(server = %self.addr, attempt, "Connected");
                    return Ok(BufReader::new(stream));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "timed out after {} seconds",
                        self.config.connect_timeout.as_secs()
                    );
                }
            }

            tracing::warn!(
                server = %self.addr,
                "Connection attempt {}/{} failed: {}",
                attempt,
                attempts,
                last_error
            );
            if attempt < attempts {
                sleep(self.config.retry_delay * attempt).await;
            }
        }

        Err(Error::ConnectFailed {
            addr: self.addr,
            attempts,
            reason: last_error,
        })
    }

    async fn send_command(&self, stream: &mut Stream, command: &Command) -> Result<()> {
        tracing::debug!(server = %self.addr, "Sending {}", command);
        with_timeout(
            self.config.response_timeout,
            write_line(stream.get_mut(), &command.to_string()),
        )
        .await
    }

    async fn read_reply_line(&self, stream: &mut Stream) -> Result<String> {
        with_timeout(
            self.config.response_timeout,
            read_line(stream, self.config.max_line_length),
        )
        .await?
        .ok_or(Error::ConnectionClosed)
    }
}

/// Stream `size` bytes from `stream` into an atomic write of `name`.
async fn receive_file(
    stream: &mut Stream,
    name: &str,
    size: u64,
    catalog: &FileCatalog,
    config: &TransferConfig,
    session: &mut TransferSession,
) -> Result<FileEntry> {
    let mut pending = catalog.open_write(name).await?;

    session.begin_transmit(name, size);
    let received = copy_exact(
        stream,
        &mut pending,
        size,
        config.chunk_size,
        config.response_timeout,
        |n| session.advance(n),
    )
    .await?;

    if received != size {
        if let Err(e) = pending.discard().await {
            tracing::warn!("Failed to discard partial {}: {}", name, e);
        }
        return Err(Error::IncompleteTransfer {
            file: name.to_string(),
            expected: size,
            received,
        });
    }

    pending.commit().await
}

/// Files pushed by the server, in arrival order.
///
/// The channel closes when the server stops, the connection fails, or the
/// subscription is closed or dropped.
#[derive(Debug)]
pub struct PushSubscription {
    rx: mpsc::Receiver<Result<String>>,
    cancel: CancellationToken,
}

impl PushSubscription {
    /// Wait for the next pushed file. `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    /// Close the push channel.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
