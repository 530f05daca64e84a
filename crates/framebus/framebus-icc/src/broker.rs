//! Multi-client frame broadcast over a shared arena.
//!
//! The broker owns a Unix-domain listener, an [`Arena`] of refcounted
//! blocks and the [`ClientRegistry`]. Publishing a frame claims a block,
//! serializes the record into it and sends a `Block` message to every
//! client, taking one arena reference per recipient. Clients copy the record
//! out of their read-only mapping and answer with `Ack`, which drops that
//! reference. When a client goes away, whatever it still held is released.
//!
//! All registry mutation goes through one mutex, so `broadcast` from the
//! publishing thread and `disconnect` from the event loop never interleave.

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use framebus_frame::{FrameRecord, StreamFormat};
use tracing::{debug, info, warn};

use crate::IccError;
use crate::arena::{Arena, Block};
use crate::registry::{ClientId, ClientRegistry};
use crate::wire::{Message, PROTOCOL_VERSION};

/// A stuck client must not stall the publishing thread for longer than this.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub arena_path: PathBuf,
    pub format: StreamFormat,
    pub block_count: u32,
    /// Unacknowledged blocks a client may hold before it is skipped.
    pub max_pending: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/framebus.sock"),
            arena_path: PathBuf::from("/dev/shm/framebus-arena.shm"),
            format: StreamFormat::default(),
            block_count: 30,
            max_pending: 8,
        }
    }
}

/// What happened to one published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// No free block; the frame was discarded.
    Dropped,
    /// Written, but nobody was connected (or every client was saturated).
    NoClients,
    /// Handed to this many clients.
    Delivered(usize),
}

pub struct Broker {
    config: BrokerConfig,
    listener: UnixListener,
    arena: Arena,
    clients: Mutex<ClientRegistry>,
    running: Arc<AtomicBool>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

/// Stops a running [`Broker::run_event_loop`] from any thread.
#[derive(Clone)]
pub struct BrokerShutdown {
    running: Arc<AtomicBool>,
    wake: Arc<UnixStream>,
}

impl BrokerShutdown {
    pub fn trigger(&self) {
        self.running.store(false, Ordering::Release);
        let _ = (&*self.wake).write(&[1]);
    }
}

impl Broker {
    /// Binds the control socket and creates the arena.
    ///
    /// A socket file left behind by a previous broker is removed first; any
    /// other kind of file at `socket_path` is an error.
    pub fn bind(config: BrokerConfig) -> Result<Self, IccError> {
        let socket_path = config.socket_path.clone();
        let bind_err = |source| IccError::Bind {
            path: socket_path.clone(),
            source,
        };

        match fs::symlink_metadata(&socket_path) {
            Ok(meta) if meta.file_type().is_socket() => {
                fs::remove_file(&socket_path).map_err(bind_err)?;
                debug!(path = %socket_path.display(), "removed stale control socket");
            }
            Ok(_) => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let block_size = config.format.record_size().next_multiple_of(64);
        let arena = Arena::create(&config.arena_path, block_size, config.block_count)?;

        let listener = UnixListener::bind(&socket_path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        info!(
            socket = %socket_path.display(),
            arena = %config.arena_path.display(),
            block_size,
            blocks = config.block_count,
            "broker listening"
        );

        Ok(Self {
            config,
            listener,
            arena,
            clients: Mutex::new(ClientRegistry::new()),
            running: Arc::new(AtomicBool::new(true)),
            wake_rx,
            wake_tx,
        })
    }

    fn registry(&self) -> MutexGuard<'_, ClientRegistry> {
        self.clients.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wake_loop(&self) {
        let _ = (&self.wake_tx).write(&[1]);
    }

    pub fn shutdown_handle(&self) -> Result<BrokerShutdown, IccError> {
        Ok(BrokerShutdown {
            running: Arc::clone(&self.running),
            wake: Arc::new(self.wake_tx.try_clone()?),
        })
    }

    /// Accepts one pending connection and greets it. `Ok(None)` when no
    /// connection is waiting.
    pub fn accept(&self) -> Result<Option<ClientId>, IccError> {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;

        let hello = Message::Hello {
            version: PROTOCOL_VERSION,
            arena_path: self.config.arena_path.clone(),
            block_size: self.arena.block_size() as u64,
            block_count: self.arena.block_count(),
            format: self.config.format,
        };
        (&stream).write_all(&hello.encode())?;

        let mut reg = self.registry();
        let id = reg.insert(stream);
        info!(client = %id, connected = reg.len(), "client connected");
        drop(reg);
        self.wake_loop();
        Ok(Some(id))
    }

    /// Claims a block for a record of `size` bytes. `None` drops the frame.
    pub fn allocate(&self, size: usize) -> Option<Block> {
        self.arena.allocate(size)
    }

    pub fn write_block(&self, block: &mut Block, record: &FrameRecord) -> Result<(), IccError> {
        self.config.format.check_compatible(&record.stream_format()?)?;
        self.arena.write(block, record)
    }

    /// Sends `block` to every client with room for it, taking one reference
    /// per recipient. Clients whose socket write fails are disconnected.
    pub fn broadcast(&self, block: &Block) -> Result<usize, IccError> {
        let msg = Message::Block {
            block_id: block.id,
            offset: block.offset,
            len: block.len,
        }
        .encode();

        let mut reg = self.registry();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, entry) in reg.iter_mut() {
            if entry.pending.len() >= self.config.max_pending {
                debug!(
                    client = %id,
                    pending = entry.pending.len(),
                    "client saturated, skipping frame"
                );
                continue;
            }
            self.arena.retain(block.id)?;
            entry.pending.insert(block.id);
            match (&entry.stream).write_all(&msg) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client = %id, error = %e, "notify failed");
                    failed.push(id);
                }
            }
        }
        for id in &failed {
            self.disconnect_locked(&mut reg, *id);
        }
        drop(reg);
        if !failed.is_empty() {
            self.wake_loop();
        }
        Ok(delivered)
    }

    /// Drops the publisher's own reference. Returns `true` if that freed it.
    pub fn release(&self, block: Block) -> Result<bool, IccError> {
        Ok(self.arena.release(block.id)?)
    }

    /// Allocate, write, broadcast, release.
    pub fn publish(&self, record: &FrameRecord) -> Result<PublishOutcome, IccError> {
        let Some(mut block) = self.allocate(record.encoded_len()) else {
            debug!(frame = record.frame_number(), "arena exhausted, dropping frame");
            return Ok(PublishOutcome::Dropped);
        };
        let sent = self
            .write_block(&mut block, record)
            .and_then(|()| self.broadcast(&block));
        self.release(block)?;
        Ok(match sent? {
            0 => PublishOutcome::NoClients,
            n => PublishOutcome::Delivered(n),
        })
    }

    /// Returns `client`'s reference on `block_id`.
    ///
    /// Acknowledging a block the client does not hold is a protocol error;
    /// the client is disconnected, nobody else is affected.
    pub fn client_ack(&self, client: ClientId, block_id: u32) -> Result<(), IccError> {
        let mut reg = self.registry();
        self.ack_locked(&mut reg, client, block_id)
    }

    fn ack_locked(
        &self,
        reg: &mut ClientRegistry,
        client: ClientId,
        block_id: u32,
    ) -> Result<(), IccError> {
        let entry = reg.get_mut(client).ok_or(IccError::UnknownClient(client.0))?;
        if entry.pending.remove(&block_id) {
            self.arena.release(block_id)?;
            Ok(())
        } else {
            self.disconnect_locked(reg, client);
            Err(IccError::Protocol(format!(
                "{client} acknowledged block {block_id} it does not hold"
            )))
        }
    }

    /// Removes `client` and releases every block it still referenced.
    /// Returns how many references were released.
    pub fn disconnect(&self, client: ClientId) -> Result<usize, IccError> {
        let mut reg = self.registry();
        if reg.get_mut(client).is_none() {
            return Err(IccError::UnknownClient(client.0));
        }
        let released = self.disconnect_locked(&mut reg, client);
        drop(reg);
        self.wake_loop();
        Ok(released)
    }

    fn disconnect_locked(&self, reg: &mut ClientRegistry, client: ClientId) -> usize {
        let Some(entry) = reg.remove(client) else {
            return 0;
        };
        let mut released = 0;
        for block_id in entry.pending {
            match self.arena.release(block_id) {
                Ok(_) => released += 1,
                Err(e) => {
                    warn!(client = %client, block_id, error = %e, "release on disconnect failed")
                }
            }
        }
        info!(client = %client, released, connected = reg.len(), "client disconnected");
        released
    }

    /// Reads whatever `client` sent and handles each complete message.
    fn service_client(&self, client: ClientId) {
        let mut reg = self.registry();
        let Some(entry) = reg.get_mut(client) else {
            return;
        };
        let mut buf = [0u8; READ_CHUNK];
        let n = match (&entry.stream).read(&mut buf) {
            Ok(0) => {
                self.disconnect_locked(&mut reg, client);
                return;
            }
            Ok(n) => n,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                return;
            }
            Err(e) => {
                warn!(client = %client, error = %e, "read failed");
                self.disconnect_locked(&mut reg, client);
                return;
            }
        };
        entry.decoder.feed(&buf[..n]);

        loop {
            let Some(entry) = reg.get_mut(client) else {
                return;
            };
            match entry.decoder.next_message() {
                Ok(None) => return,
                Ok(Some(Message::Ack { block_id })) => {
                    if let Err(e) = self.ack_locked(&mut reg, client, block_id) {
                        warn!(client = %client, error = %e, "bad ack");
                        return;
                    }
                }
                Ok(Some(other)) => {
                    warn!(client = %client, message = ?other, "unexpected message from client");
                    self.disconnect_locked(&mut reg, client);
                    return;
                }
                Err(e) => {
                    warn!(client = %client, error = %e, "undecodable client stream");
                    self.disconnect_locked(&mut reg, client);
                    return;
                }
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.wake_rx).read(&mut buf), Ok(n) if n > 0) {}
    }

    /// Runs the accept/ack loop until [`BrokerShutdown::trigger`] is called.
    ///
    /// One `poll(2)` set covers the wake pipe, the listener and every client.
    /// For each client, readable data is handled before hangup or error, so
    /// acks that arrive together with a close are still honoured.
    pub fn run_event_loop(&self) -> Result<(), IccError> {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut ids: Vec<ClientId> = Vec::new();
        let pollfd = |fd: RawFd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        while self.running.load(Ordering::Acquire) {
            fds.clear();
            ids.clear();
            fds.push(pollfd(self.wake_rx.as_raw_fd()));
            fds.push(pollfd(self.listener.as_raw_fd()));
            for (id, entry) in self.registry().iter() {
                fds.push(pollfd(entry.stream.as_raw_fd()));
                ids.push(id);
            }

            // SAFETY: `fds` is a valid, exclusively borrowed pollfd array.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            if fds[0].revents != 0 {
                self.drain_wake();
            }
            if fds[1].revents & libc::POLLIN != 0 {
                loop {
                    match self.accept() {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }
            for (pfd, &id) in fds[2..].iter().zip(&ids) {
                if pfd.revents & libc::POLLIN != 0 {
                    self.service_client(id);
                }
                if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                    let mut reg = self.registry();
                    self.disconnect_locked(&mut reg, id);
                }
            }
        }
        debug!("broker event loop stopped");
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.registry().len()
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.config.socket_path);
        let _ = fs::remove_file(self.arena.path());
    }
}
