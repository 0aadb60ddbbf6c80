//! Server side of the transfer protocol.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::configure_nodelay;
use super::session::{SessionDirection, TransferSession};
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::file::{validate_file_name, FileCatalog, FileEntry};
use crate::history::{TransferDirection, TransferLogSink, TransferRecord};
use crate::protocol::{
    copy_exact, encode_file_list, read_line, with_timeout, write_line, Command, FileHeader,
    Reply, FILE_NOT_FOUND_REASON, UNKNOWN_COMMAND_REASON,
};

const LISTEN_BACKLOG: i32 = 50;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Notifications emitted by a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection was accepted
    ClientConnected {
        /// Remote address
        addr: SocketAddr,
    },
    /// An upload was stored in the catalog
    FileReceived {
        /// File name
        name: String,
        /// Size in bytes
        size: u64,
    },
}

/// Transfer server answering listings, downloads, uploads and push
/// registrations from the shared catalog.
///
/// Each accepted connection runs as its own task, so a slow transfer never
/// blocks other requests.
#[derive(Debug)]
pub struct TransferServer {
    shared: Arc<ServerShared>,
    running: Mutex<Option<RunningServer>>,
}

#[derive(Debug)]
struct ServerShared {
    catalog: Arc<FileCatalog>,
    config: TransferConfig,
    events: broadcast::Sender<ServerEvent>,
    ready_clients: StdMutex<HashMap<Uuid, ReadyClient>>,
    log_sink: StdMutex<Option<Arc<dyn TransferLogSink>>>,
}

#[derive(Debug, Clone)]
struct ReadyClient {
    addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

#[derive(Debug)]
struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl RunningServer {
    async fn stop(self) {
        self.shutdown.cancel();
        self.tracker.close();
        if let Err(e) = self.accept_task.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }
        self.tracker.wait().await;
    }
}

impl TransferServer {
    /// Create a stopped server over `catalog`.
    pub fn new(catalog: Arc<FileCatalog>, config: TransferConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(ServerShared {
                catalog,
                config,
                events,
                ready_clients: StdMutex::new(HashMap::new()),
                log_sink: StdMutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Report completed transfers to `sink`.
    #[must_use]
    pub fn with_log_sink(self, sink: Arc<dyn TransferLogSink>) -> Self {
        self.set_log_sink(sink);
        self
    }

    /// Replace the transfer log sink. Takes effect for transfers that
    /// complete afterwards, including on a running server.
    pub fn set_log_sink(&self, sink: Arc<dyn TransferLogSink>) {
        *self
            .shared
            .log_sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    /// Subscribe to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Bind the configured port and start accepting connections.
    ///
    /// A server that is already running is stopped first. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            tracing::info!("Restarting transfer server on {}", previous.local_addr);
            previous.stop().await;
            self.shared.clear_ready_clients();
        }

        let listener = bind_listener(&self.shared.config).await?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            shutdown.clone(),
            tracker.clone(),
        ));

        *running = Some(RunningServer {
            local_addr,
            shutdown,
            tracker,
            accept_task,
        });

        tracing::info!("Transfer server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting connections and close every open connection.
    ///
    /// Stopping a stopped server is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            tracing::debug!("Transfer server already stopped");
            return;
        };

        let addr = running.local_addr;
        running.stop().await;
        self.shared.clear_ready_clients();
        tracing::info!("Transfer server on {} stopped", addr);
    }

    /// Whether the server is accepting connections.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Number of clients registered for pushes.
    pub fn ready_client_count(&self) -> usize {
        self.shared.lock_ready_clients().len()
    }

    /// Send `name` from the catalog to every client registered for pushes.
    ///
    /// Clients whose connection fails are dropped from the ready set. Returns
    /// the number of clients that received the whole file.
    pub async fn push_file(&self, name: &str) -> Result<usize> {
        if !self.is_running().await {
            return Err(Error::ServerNotRunning);
        }

        let entry = self
            .shared
            .catalog
            .get_file(name)
            .await?
            .ok_or_else(|| Error::FileNotFound(name.to_string()))?;

        let clients: Vec<(Uuid, ReadyClient)> = self
            .shared
            .lock_ready_clients()
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();

        let mut served = 0;
        for (id, client) in clients {
            match self.shared.push_to(&client, &entry).await {
                Ok(()) => {
                    served += 1;
                    self.shared.record(&entry.name, TransferDirection::Sent, entry.size);
                }
                Err(e) => {
                    tracing::warn!("Push of {} to {} failed: {}", entry.name, client.addr, e);
                    self.shared.lock_ready_clients().remove(&id);
                }
            }
        }

        tracing::info!("Pushed {} to {} client(s)", entry.name, served);
        Ok(served)
    }
}

impl Drop for TransferServer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.shutdown.cancel();
            }
        }
    }
}

async fn bind_listener(config: &TransferConfig) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let attempts = config.bind_attempts.max(1);

    let mut attempt = 1;
    loop {
        match bind_reusable(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    "Bind to {} failed (attempt {}/{}): {}",
                    addr,
                    attempt,
                    attempts,
                    e
                );
                sleep(config.bind_retry_delay).await;
                attempt += 1;
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!("Connection from {}", addr);
                    let _ = shared.events.send(ServerEvent::ClientConnected { addr });

                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        tokio::select! {
                            () = shutdown.cancelled() => {}
                            result = shared.handle_connection(stream, addr) => {
                                if let Err(e) = result {
                                    tracing::warn!("Connection from {} failed: {}", addr, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Removes a ready client from the push set when its connection ends.
struct ReadyGuard<'a> {
    shared: &'a ServerShared,
    id: Uuid,
}

impl Drop for ReadyGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_ready_clients().remove(&self.id);
    }
}

impl ServerShared {
    fn lock_ready_clients(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ReadyClient>> {
        self.ready_clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn clear_ready_clients(&self) {
        self.lock_ready_clients().clear();
    }

    fn record(&self, file_name: &str, direction: TransferDirection, size: u64) {
        let sink = self
            .log_sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink.record(TransferRecord::new(file_name, direction, size));
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        configure_nodelay(&stream);
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let timeout = self.config.response_timeout;

        let line = match with_timeout(timeout, read_line(&mut reader, self.config.max_line_length))
            .await
        {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("{} closed without sending a command", addr);
                return Ok(());
            }
            Err(Error::ProtocolError(reason)) => {
                tracing::debug!("Unreadable command from {}: {}", addr, reason);
                return self.reply(&mut writer, &Reply::Error(UNKNOWN_COMMAND_REASON.into())).await;
            }
            Err(e) => return Err(e),
        };

        let Ok(command) = line.parse::<Command>() else {
            tracing::debug!("Unknown command from {}: {}", addr, line);
            return self
                .reply(&mut writer, &Reply::Error(UNKNOWN_COMMAND_REASON.into()))
                .await;
        };
        tracing::debug!("{} requested {}", addr, command);

        match command {
            Command::ListFiles => {
                let mut session = TransferSession::new(SessionDirection::List, addr, None);
                let result = self.serve_listing(&mut writer).await;
                session.finish(&result);
                result
            }
            Command::GetFile(name) => {
                let mut session = TransferSession::new(SessionDirection::Download, addr, None);
                let result = self.serve_download(&name, &mut writer, &mut session).await;
                session.finish(&result);
                result
            }
            Command::PutFile => {
                let mut session = TransferSession::new(SessionDirection::Upload, addr, None);
                let result = self
                    .receive_upload(&mut reader, &mut writer, &mut session)
                    .await;
                session.finish(&result);
                result.map(|_| ())
            }
            Command::ReadyForPush => self.hold_ready_client(reader, writer, addr).await,
        }
    }

    async fn reply(&self, writer: &mut OwnedWriteHalf, reply: &Reply) -> Result<()> {
        with_timeout(
            self.config.response_timeout,
            write_line(writer, &reply.to_string()),
        )
        .await
    }

    async fn serve_listing(&self, writer: &mut OwnedWriteHalf) -> Result<()> {
        let names = self.catalog.list_names().await?;
        let line = encode_file_list(&names)?;
        with_timeout(self.config.response_timeout, write_line(writer, &line)).await
    }

    async fn serve_download(
        &self,
        name: &str,
        writer: &mut OwnedWriteHalf,
        session: &mut TransferSession,
    ) -> Result<()> {
        let Some(entry) = self.catalog.get_file(name).await? else {
            tracing::info!("Requested file {} not found", name);
            return self
                .reply(writer, &Reply::Error(FILE_NOT_FOUND_REASON.into()))
                .await;
        };

        let mut source = match self.catalog.open_read(&entry).await {
            Ok(source) => source,
            Err(e) => {
                self.reply(writer, &Reply::Error(format!("Unable to read file: {e}")))
                    .await?;
                return Err(e);
            }
        };

        self.reply(writer, &Reply::Ok).await?;
        self.send_file(&entry, &mut source, writer, session).await?;

        self.record(&entry.name, TransferDirection::Sent, entry.size);
        Ok(())
    }

    async fn send_file(
        &self,
        entry: &FileEntry,
        source: &mut crate::file::ByteReader,
        writer: &mut OwnedWriteHalf,
        session: &mut TransferSession,
    ) -> Result<()> {
        with_timeout(
            self.config.response_timeout,
            FileHeader::new(&entry.name, entry.size).write(writer),
        )
        .await?;

        session.begin_transmit(&entry.name, entry.size);
        let sent = copy_exact(
            source,
            writer,
            entry.size,
            self.config.chunk_size,
            self.config.response_timeout,
            |n| session.advance(n),
        )
        .await?;

        if sent == entry.size {
            Ok(())
        } else {
            Err(Error::IncompleteTransfer {
                file: entry.name.clone(),
                expected: entry.size,
                received: sent,
            })
        }
    }

    async fn receive_upload(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        session: &mut TransferSession,
    ) -> Result<FileEntry> {
        self.reply(writer, &Reply::Ready).await?;

        let header = with_timeout(self.config.response_timeout, FileHeader::read(reader)).await?;

        let pending = match validate_file_name(&header.name) {
            Ok(()) => self.catalog.open_write(&header.name).await,
            Err(e) => Err(e),
        };
        let mut pending = match pending {
            Ok(pending) => pending,
            Err(e) => {
                let _ = self.reply(writer, &Reply::Failed).await;
                return Err(e);
            }
        };

        session.begin_transmit(&header.name, header.size);
        let copied = copy_exact(
            reader,
            &mut pending,
            header.size,
            self.config.chunk_size,
            self.config.response_timeout,
            |n| session.advance(n),
        )
        .await;

        let received = match copied {
            Ok(received) => received,
            Err(e) => {
                let _ = pending.discard().await;
                let _ = self.reply(writer, &Reply::Failed).await;
                return Err(e);
            }
        };

        if received != header.size {
            if let Err(e) = pending.discard().await {
                tracing::warn!("Failed to discard partial upload {}: {}", header.name, e);
            }
            let _ = self.reply(writer, &Reply::Failed).await;
            return Err(Error::IncompleteTransfer {
                file: header.name,
                expected: header.size,
                received,
            });
        }

        let entry = match pending.commit().await {
            Ok(entry) => entry,
            Err(e) => {
                let _ = self.reply(writer, &Reply::Failed).await;
                return Err(e);
            }
        };

        self.reply(writer, &Reply::Success).await?;
        tracing::info!("Received {} ({} bytes)", entry.name, entry.size);

        let _ = self.events.send(ServerEvent::FileReceived {
            name: entry.name.clone(),
            size: entry.size,
        });
        self.record(&entry.name, TransferDirection::Received, entry.size);
        Ok(entry)
    }

    async fn hold_ready_client(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        addr: SocketAddr,
    ) -> Result<()> {
        self.reply(&mut writer, &Reply::Ok).await?;

        let id = Uuid::new_v4();
        self.lock_ready_clients().insert(
            id,
            ReadyClient {
                addr,
                writer: Arc::new(Mutex::new(writer)),
            },
        );
        let _guard = ReadyGuard { shared: self, id };
        tracing::info!("{} registered for server transfers", addr);

        // The client never sends more; end of stream means it went away
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }

        tracing::debug!("{} left the push set", addr);
        Ok(())
    }

    async fn push_to(&self, client: &ReadyClient, entry: &FileEntry) -> Result<()> {
        let mut source = self.catalog.open_read(entry).await?;
        let mut writer = client.writer.lock().await;
        let mut session = TransferSession::new(SessionDirection::Download, client.addr, None);

        let result = async {
            with_timeout(
                self.config.response_timeout,
                write_line(&mut *writer, &Reply::ServerFile(entry.name.clone()).to_string()),
            )
            .await?;
            self.send_file(entry, &mut source, &mut writer, &mut session)
                .await
        }
        .await;

        session.finish(&result);
        result
    }
}
