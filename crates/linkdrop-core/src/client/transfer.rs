//! File transfers.
//!
//! Push flow:
//! 1. The sender announces files with a send-request ([`Client::offer_files`])
//! 2. The receiver answers with a receive-request naming the accepted subset
//!    ([`Client::accept_files`]) and waits for inbound channels
//! 3. The sender negotiates the link (or reuses it) and opens one
//!    `file-transfer:{name}` channel per file, at most
//!    [`TransferConfig::max_concurrent`] at a time per peer
//!
//! Pull flow: [`Client::list_remote_files`] then [`Client::request_files`],
//! optionally authenticated with a share-path code.
//!
//! Sending pauses once the channel buffers `max_buffered` bytes and resumes
//! at `low_watermark`. Receiving writes straight into chunked storage and
//! fails the file if no chunk arrives within `idle_timeout`.
//!
//! [`TransferConfig::max_concurrent`]: super::config::TransferConfig::max_concurrent

use super::client::{Client, ClientInner, FileKey};
use super::events::{ClientEvent, Direction, TransferStatus};
use super::session::{PeerSession, SessionState};
use crate::error::{ClientError, Result};
use crate::link::{DataChannel, LinkError};
use crate::protocol::{
    self, ControlMessage, FileList, FileOffer, MessageType, channel_label, file_name_from_label,
};
use bytes::Bytes;
use linkdrop_files::{FileId, FileWriter, LocalFile, NewFile};
use linkdrop_registry::PublicId;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// An accepted file waiting for its channel
pub(crate) struct ExpectedFile {
    offer: FileOffer,
    timer: JoinHandle<()>,
}

impl ExpectedFile {
    /// Stop the open timer
    pub(crate) fn cancel(&self) {
        self.timer.abort();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Offering files
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Make files available to peers that list or request them.
    ///
    /// A file replaces any shared file of the same name.
    pub fn share_files(&self, files: impl IntoIterator<Item = LocalFile>) {
        for file in files {
            self.inner.shared.insert(file.name().to_string(), file);
        }
    }

    /// Withdraw a shared file; false if it was not shared
    pub fn unshare_file(&self, name: &str) -> bool {
        self.inner.shared.remove(name).is_some()
    }

    /// Currently offered, not yet sent files, by name
    pub fn shared_files(&self) -> Vec<FileOffer> {
        let mut files: Vec<FileOffer> = self
            .inner
            .shared
            .iter()
            .map(|f| FileOffer::from(f.value()))
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    /// Share `files` and announce them to `peer` with a send-request.
    ///
    /// # Errors
    ///
    /// Fails if `files` is empty or the client is shutting down.
    pub fn offer_files(&self, peer: &PublicId, files: Vec<LocalFile>) -> Result<()> {
        if files.is_empty() {
            return Err(ClientError::Invalid(Cow::Borrowed("no files to offer")));
        }
        let list = FileList {
            files: files.iter().map(FileOffer::from).collect(),
        };
        self.share_files(files);

        let request = ControlMessage::new(MessageType::SendRequest, peer.clone()).with_data(&list)?;
        self.inner.dispatcher.send(request)?;
        tracing::info!("Offered {} files to {}", list.files.len(), peer.short());
        Ok(())
    }

    /// Files `peer` offered or listed most recently
    pub fn remote_offers(&self, peer: &PublicId) -> Vec<FileOffer> {
        self.inner
            .remote_offers
            .get(peer)
            .map(|offers| offers.value().clone())
            .unwrap_or_default()
    }

    /// Ask `peer` for its offered files.
    ///
    /// `token` authenticates the request when `peer` does not trust us (a
    /// share-path code).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if `peer` does not answer; an
    /// unauthenticated request is never answered.
    pub async fn list_remote_files(
        &self,
        peer: &PublicId,
        token: Option<String>,
    ) -> Result<Vec<FileOffer>> {
        let request =
            ControlMessage::new(MessageType::ListRequest, peer.clone()).with_optional_auth(token);
        let expected = peer.clone();
        let reply = self
            .inner
            .dispatcher
            .request(
                request,
                MessageType::ListResponse,
                move |m| m.client_id == expected,
                self.inner.config.dispatch.response_timeout,
            )
            .await?;

        let FileList { files } = reply.payload()?;
        self.inner.remote_offers.insert(peer.clone(), files.clone());
        Ok(files)
    }

    pub(crate) async fn on_list_request(&self, message: ControlMessage) {
        let list = FileList {
            files: self.shared_files(),
        };
        let reply = ControlMessage::new(MessageType::ListResponse, message.client_id.clone())
            .with_data(&list)
            .and_then(|reply| self.inner.dispatcher.send(reply));
        if let Err(e) = reply {
            tracing::warn!("Failed to answer list request: {}", e);
        }
    }

    pub(crate) async fn on_send_request(&self, message: ControlMessage) {
        let remote = message.client_id.clone();
        let FileList { files } = match message.payload() {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Bad send request from {}: {}", remote.short(), e);
                return;
            }
        };
        tracing::info!("{} offered {} files", remote.short(), files.len());
        self.inner.remote_offers.insert(remote.clone(), files.clone());

        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        self.emit(ClientEvent::FilesOffered {
            peer: remote.clone(),
            files,
        });

        if self.inner.config.transfer.auto_accept && !names.is_empty() {
            if let Err(e) = self.accept_files(&remote, &names).await {
                tracing::warn!("Failed to accept files from {}: {}", remote.short(), e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Requesting files
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    /// Accept a subset of the files `peer` offered.
    ///
    /// # Errors
    ///
    /// See [`Client::request_files`].
    pub async fn accept_files(&self, peer: &PublicId, names: &[String]) -> Result<()> {
        self.request_files(peer, names, None, false).await
    }

    /// Send a receive-request for `names` and prepare to store them.
    ///
    /// Every name must be known from a prior offer or listing. `refresh`
    /// makes both sides discard their link before renegotiating. Each file
    /// fails with a timeout if its channel does not open within the
    /// configured open timeout; the timer keeps running while other files
    /// from `peer` are still arriving, since the sender queues them behind
    /// its per-peer cap.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Invalid`] if `names` is empty
    /// - [`ClientError::NotFound`] if a name was never offered by `peer`
    pub async fn request_files(
        &self,
        peer: &PublicId,
        names: &[String],
        token: Option<String>,
        refresh: bool,
    ) -> Result<()> {
        if names.is_empty() {
            return Err(ClientError::Invalid(Cow::Borrowed("no files requested")));
        }
        let offers = self.remote_offers(peer);
        let mut wanted = Vec::with_capacity(names.len());
        for name in names {
            let offer = offers.iter().find(|o| &o.name == name).cloned().ok_or_else(|| {
                ClientError::NotFound(Cow::Owned(format!(
                    "{} does not offer {name}",
                    peer.short()
                )))
            })?;
            wanted.push(offer);
        }

        if refresh {
            self.reset_session(peer).await;
        }
        self.ensure_session(peer)?;
        for offer in wanted {
            self.expect_file(peer, offer);
        }

        let request = ControlMessage::new(MessageType::ReceiveRequest, peer.clone())
            .with_optional_auth(token)
            .with_data(&protocol::ReceiveRequest {
                files: names.to_vec(),
                refresh_connection: refresh,
            })?;
        self.inner.dispatcher.send(request)?;
        tracing::debug!("Requested {} files from {}", names.len(), peer.short());
        Ok(())
    }

    fn expect_file(&self, peer: &PublicId, offer: FileOffer) {
        let key: FileKey = (peer.clone(), offer.name.clone());
        let timeout = self.inner.config.transfer.open_timeout;
        let weak = Arc::downgrade(&self.inner);
        let timer_key = key.clone();

        let timer = tokio::spawn(async move {
            let mut deadline = Instant::now() + timeout;
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(inner) = weak.upgrade() else { return };
                // Queued behind the sender's per-peer cap while other files move
                match busy_until(&inner, &timer_key.0, timeout) {
                    Some(next) => deadline = next,
                    None => break,
                }
            }
            let Some(inner) = weak.upgrade() else { return };
            if inner.expected.remove(&timer_key).is_some() {
                let (peer, file) = &timer_key;
                tracing::warn!("Channel for {} from {} never opened", file, peer.short());
                Client { inner }.emit_transfer(
                    peer,
                    file,
                    Direction::Receive,
                    TransferStatus::Failed {
                        reason: "transfer channel did not open in time".to_string(),
                        timed_out: true,
                    },
                );
            }
        });

        if let Some(previous) = self.inner.expected.insert(key, ExpectedFile { offer, timer }) {
            previous.cancel();
        }
    }

    /// Files currently moving, with their peer and direction
    pub fn active_transfers(&self) -> Vec<(PublicId, String, Direction)> {
        self.inner
            .active
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), *e.value()))
            .collect()
    }

    /// Accepted files whose channel has not opened yet
    pub fn pending_transfers(&self) -> usize {
        self.inner.expected.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sending
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    pub(crate) async fn on_receive_request(&self, message: ControlMessage) {
        let remote = message.client_id.clone();
        let request: protocol::ReceiveRequest = match message.payload() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Bad receive request from {}: {}", remote.short(), e);
                return;
            }
        };

        let mut files = Vec::with_capacity(request.files.len());
        for name in &request.files {
            match self.inner.shared.get(name).map(|f| f.value().clone()) {
                Some(file) => files.push(file),
                None => tracing::warn!("{} requested unknown file {}", remote.short(), name),
            }
        }
        if files.is_empty() {
            tracing::warn!("Nothing to send to {}", remote.short());
            return;
        }

        if request.refresh_connection {
            self.reset_session(&remote).await;
        }
        let session = match self.ensure_session(&remote) {
            Ok(session) => session,
            Err(e) => {
                self.fail_all(&remote, &files, &e);
                return;
            }
        };
        if session.state() == SessionState::NoConnection {
            if let Err(e) = self.negotiate(&session, false).await {
                self.fail_all(&remote, &files, &e);
                return;
            }
        }

        let client = self.clone();
        tokio::spawn(async move { client.serve(session, files).await });
    }

    fn fail_all(&self, remote: &PublicId, files: &[LocalFile], error: &ClientError) {
        tracing::warn!("Cannot send {} files to {}: {}", files.len(), remote.short(), error);
        for file in files {
            self.emit_transfer(
                remote,
                file.name(),
                Direction::Send,
                TransferStatus::Failed {
                    reason: error.to_string(),
                    timed_out: error.is_timeout(),
                },
            );
        }
    }

    fn transfer_slots(&self, peer: &PublicId) -> Arc<Semaphore> {
        let max = self.inner.config.transfer.max_concurrent;
        Arc::clone(
            &self
                .inner
                .limits
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(max))),
        )
    }

    async fn serve(&self, session: Arc<PeerSession>, files: Vec<LocalFile>) {
        let remote = session.remote().clone();
        let open_timeout = self.inner.config.transfer.open_timeout;
        if let Err(e) = session.wait_connected(open_timeout).await {
            self.fail_all(&remote, &files, &e);
            return;
        }

        let slots = self.transfer_slots(&remote);
        for file in files {
            // Slots are never closed
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                return;
            };
            let client = self.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let _permit = permit;
                client.send_one(&session, file).await;
            });
        }
    }

    async fn send_one(&self, session: &PeerSession, file: LocalFile) {
        let remote = session.remote();
        let key: FileKey = (remote.clone(), file.name().to_string());
        self.inner.active.insert(key.clone(), Direction::Send);

        match self.send_file(session, &file).await {
            Ok(()) => {
                self.inner.shared.remove(file.name());
                tracing::info!("Sent {} ({} bytes) to {}", file.name(), file.size(), remote.short());
                self.emit_transfer(
                    remote,
                    file.name(),
                    Direction::Send,
                    TransferStatus::Completed { file_id: None },
                );
            }
            Err(e) => {
                tracing::warn!("Sending {} to {} failed: {}", file.name(), remote.short(), e);
                self.emit_transfer(
                    remote,
                    file.name(),
                    Direction::Send,
                    TransferStatus::Failed {
                        reason: e.to_string(),
                        timed_out: e.is_timeout(),
                    },
                );
            }
        }
        self.inner.active.remove(&key);
    }

    async fn send_file(&self, session: &PeerSession, file: &LocalFile) -> Result<()> {
        let channel = session
            .link()
            .open_channel(&channel_label(file.name()))
            .await?;
        self.emit_transfer(session.remote(), file.name(), Direction::Send, TransferStatus::Opened);

        let result = self.pump(session.remote(), channel.as_ref(), file).await;
        if result.is_err() {
            channel.close().await;
        }
        result
    }

    async fn pump(&self, remote: &PublicId, channel: &dyn DataChannel, file: &LocalFile) -> Result<()> {
        let transfer = &self.inner.config.transfer;
        channel.set_buffered_amount_low_threshold(transfer.low_watermark);

        let mut source = file.open().await?;
        let mut chunk = vec![0u8; transfer.chunk_size];
        let mut sent = 0u64;
        loop {
            let n = read_chunk(&mut source, &mut chunk).await?;
            if n == 0 {
                break;
            }
            channel.send(Bytes::copy_from_slice(&chunk[..n])).await?;
            sent += n as u64;
            tracing::trace!("{}: {}/{} bytes to {}", file.name(), sent, file.size(), remote.short());
            self.emit_transfer(
                remote,
                file.name(),
                Direction::Send,
                TransferStatus::Progress {
                    bytes: sent,
                    total: file.size(),
                },
            );

            if channel.buffered_amount() >= transfer.max_buffered {
                channel.wait_buffered_low().await?;
            }
        }

        if sent != file.size() {
            return Err(ClientError::Io(format!(
                "{} changed size while sending ({} of {} bytes)",
                file.name(),
                sent,
                file.size()
            )));
        }

        // Close only once the receiver has consumed everything
        channel.set_buffered_amount_low_threshold(0);
        channel.wait_buffered_low().await?;
        channel.close().await;
        Ok(())
    }
}

/// Fill `buf` unless the source ends first; returns the bytes read
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// When an open timer for a file from `peer` should fire next, or `None` if
/// nothing from `peer` has arrived within `timeout`
fn busy_until(inner: &ClientInner, peer: &PublicId, timeout: Duration) -> Option<Instant> {
    let now = Instant::now();
    let receiving = inner
        .active
        .iter()
        .any(|e| e.key().0 == *peer && *e.value() == Direction::Receive);
    if receiving {
        return Some(now + timeout);
    }
    inner
        .received_at
        .get(peer)
        .map(|last| *last + timeout)
        .filter(|next| *next > now)
}

// ═══════════════════════════════════════════════════════════════════════════
// Receiving
// ═══════════════════════════════════════════════════════════════════════════

impl Client {
    pub(crate) async fn receive_file(&self, remote: PublicId, channel: Arc<dyn DataChannel>) {
        let Some(name) = file_name_from_label(channel.label()).map(str::to_string) else {
            tracing::warn!("No handler for channel {:?} from {}", channel.label(), remote.short());
            channel.close().await;
            return;
        };
        let key: FileKey = (remote.clone(), name.clone());
        let Some((_, expected)) = self.inner.expected.remove(&key) else {
            tracing::warn!("Unexpected file {} from {}", name, remote.short());
            channel.close().await;
            return;
        };
        let ExpectedFile { offer, timer } = expected;
        timer.abort();

        self.inner.received_at.insert(remote.clone(), Instant::now());
        self.emit_transfer(&remote, &name, Direction::Receive, TransferStatus::Opened);
        self.inner.active.insert(key.clone(), Direction::Receive);

        let result = self.store_stream(&remote, &offer, channel.as_ref()).await;
        self.inner.active.remove(&key);
        self.inner.received_at.insert(remote.clone(), Instant::now());

        match result {
            Ok(id) => {
                tracing::info!(
                    "Received {} ({} bytes) from {} as {}",
                    name,
                    offer.size,
                    remote.short(),
                    id
                );
                self.emit_transfer(
                    &remote,
                    &name,
                    Direction::Receive,
                    TransferStatus::Completed { file_id: Some(id) },
                );
            }
            Err(e) => {
                tracing::warn!("Receiving {} from {} failed: {}", name, remote.short(), e);
                self.emit_transfer(
                    &remote,
                    &name,
                    Direction::Receive,
                    TransferStatus::Failed {
                        reason: e.to_string(),
                        timed_out: e.is_timeout(),
                    },
                );
            }
        }
    }

    async fn store_stream(
        &self,
        remote: &PublicId,
        offer: &FileOffer,
        channel: &dyn DataChannel,
    ) -> Result<FileId> {
        let ids = self
            .inner
            .files
            .create_entries(vec![NewFile {
                name: offer.name.clone(),
                size: offer.size,
                mime_type: offer.mime_type.clone(),
                owner: remote.to_string(),
            }])
            .await?;
        let Some(&id) = ids.first() else {
            return Err(ClientError::Storage("store created no entry".to_string()));
        };
        let mut writer = FileWriter::new(
            Arc::clone(&self.inner.files),
            id,
            self.inner.config.storage.page_size,
        );

        let idle = self.inner.config.transfer.idle_timeout;
        let outcome = loop {
            let chunk = match tokio::time::timeout(idle, channel.recv()).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    break Err(ClientError::Timeout(Cow::Owned(format!(
                        "no data for {} ms",
                        idle.as_millis()
                    ))));
                }
            };
            let Some(data) = chunk else { break Ok(()) };
            self.inner.received_at.insert(remote.clone(), Instant::now());

            if let Err(e) = writer.write(&data).await {
                break Err(e.into());
            }
            if writer.bytes_written() > offer.size {
                break Err(ClientError::protocol("peer sent more bytes than announced"));
            }
            tracing::trace!("{}: {}/{} bytes", offer.name, writer.bytes_written(), offer.size);
            self.emit_transfer(
                remote,
                &offer.name,
                Direction::Receive,
                TransferStatus::Progress {
                    bytes: writer.bytes_written(),
                    total: offer.size,
                },
            );
        };

        let outcome = outcome.and_then(|()| {
            if writer.bytes_written() == offer.size {
                Ok(())
            } else {
                Err(ClientError::Link(LinkError::ChannelClosed))
            }
        });

        match outcome {
            Ok(()) => match writer.finish().await {
                Ok(_) => Ok(id),
                Err(e) => {
                    if let Err(delete) = self.inner.files.delete_entry(id).await {
                        tracing::warn!("Failed to discard uncommitted file {}: {}", id, delete);
                    }
                    Err(e.into())
                }
            },
            Err(e) => {
                channel.close().await;
                if let Err(abort) = writer.abort().await {
                    tracing::warn!("Failed to discard partial file {}: {}", id, abort);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{TestPeers, next_event};

    fn blob(name: &str, data: &'static [u8]) -> LocalFile {
        LocalFile::from_bytes(name, "text/plain", Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_read_chunk_fills_across_short_reads() {
        let mut source = (&b"abc"[..]).chain(&b"defgh"[..]);
        let mut buf = [0u8; 6];
        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 2);
        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offer_and_request_validate_input() {
        let net = TestPeers::new().await;
        let (a, b) = (net.client("alice").await, net.client("bob").await);

        let err = a.offer_files(b.public_id(), Vec::new()).unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));

        let err = a.request_files(b.public_id(), &[], None, false).await.unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));

        let err = a
            .request_files(b.public_id(), &["nope.txt".to_string()], None, false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(a.pending_transfers(), 0);
    }

    #[tokio::test]
    async fn test_share_replaces_by_name() {
        let net = TestPeers::new().await;
        let a = net.client("alice").await;

        a.share_files([blob("z.txt", b"1"), blob("a.txt", b"22")]);
        a.share_files([blob("a.txt", b"333")]);
        let shared = a.shared_files();
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].name, "a.txt");
        assert_eq!(shared[0].size, 3);

        assert!(a.unshare_file("z.txt"));
        assert!(!a.unshare_file("z.txt"));
        assert_eq!(a.shared_files().len(), 1);
    }

    #[tokio::test]
    async fn test_list_reports_shared_files() {
        let net = TestPeers::new().await;
        let (a, b) = (net.client("alice").await, net.client("bob").await);
        net.link(&a, &b).await;

        a.share_files([blob("notes.md", b"hello"), blob("b.txt", b"x")]);
        let files = b.list_remote_files(a.public_id(), None).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["b.txt", "notes.md"]);
        assert_eq!(b.remote_offers(a.public_id()), files);
    }

    #[tokio::test]
    async fn test_offer_waits_for_acceptance() {
        let net = TestPeers::new().await;
        let a = net.client("alice").await;
        let mut config = TestPeers::config("bob");
        config.transfer.auto_accept = false;
        let b = net.client_with(config).await;
        net.link(&a, &b).await;
        let mut b_events = b.subscribe();

        a.offer_files(b.public_id(), vec![blob("plan.txt", b"step one")])
            .unwrap();
        match next_event(&mut b_events).await {
            ClientEvent::FilesOffered { peer, files } => {
                assert_eq!(&peer, a.public_id());
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].name, "plan.txt");
                assert_eq!(files[0].size, 8);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(b.pending_transfers(), 0);
        assert!(b.active_transfers().is_empty());
        assert_eq!(a.shared_files().len(), 1);
    }
}
