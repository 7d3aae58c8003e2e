//! Module sockets: the hub-side endpoints modules send and receive through.

use crate::app::HubApp;
use crate::error::HubError;
use crate::file::{split_file, FileAssembler};
use crate::hub::{Inner, VxProto};
use crate::router::Router;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vxproto_types::{Action, Data, Msg, MsgType, Packet, Payload, Text};

/// A registered logical endpoint with its own mailbox.
///
/// Created with [`VxProto::new_module`] and registered with
/// [`VxProto::add_module`]. Packets for the module are consumed through
/// [`ModuleSocket::router`].
pub struct ModuleSocket {
    name: String,
    group_id: String,
    imc_token: String,
    tx: mpsc::Sender<Packet>,
    router: Router,
    closed: CancellationToken,
    files: Arc<FileAssembler>,
    app: Arc<dyn HubApp>,
    hub: Weak<Inner>,
}

impl std::fmt::Debug for ModuleSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSocket")
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("imc_token", &self.imc_token)
            .finish_non_exhaustive()
    }
}

impl ModuleSocket {
    pub(crate) fn new(
        name: String,
        group_id: String,
        imc_token: String,
        capacity: usize,
        files: Arc<FileAssembler>,
        app: Arc<dyn HubApp>,
        hub: Weak<Inner>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        Self {
            name,
            group_id,
            imc_token,
            tx,
            router: Router::new(rx, closed.clone()),
            closed,
            files,
            app,
            hub,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// In-process address of this module.
    pub fn imc_token(&self) -> &str {
        &self.imc_token
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether agent notifications for `group_id` concern this module.
    pub(crate) fn is_interested_in(&self, group_id: &str) -> bool {
        self.group_id.is_empty() || group_id.is_empty() || self.group_id == group_id
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn hub(&self) -> Result<VxProto, HubError> {
        self.hub.upgrade().map(VxProto::from_inner).ok_or(HubError::Closed)
    }

    /// Accepts a packet addressed to this module.
    ///
    /// Chunked files are reassembled first; only the completing chunk
    /// reaches the mailbox.
    pub async fn recv_packet(&self, packet: Packet) -> Result<(), HubError> {
        let Some(packet) = self.files.accept(packet).await? else {
            return Ok(());
        };
        self.deliver(packet).await;
        Ok(())
    }

    /// Queues a packet, waiting for mailbox space. Packets for a closed
    /// module go to the application's default receiver.
    pub(crate) async fn deliver(&self, packet: Packet) {
        if self.closed.is_cancelled() {
            self.app.default_receiver(packet);
            return;
        }
        tokio::select! {
            permit = self.tx.reserve() => match permit {
                Ok(permit) => permit.send(packet),
                Err(_) => self.app.default_receiver(packet),
            },
            _ = self.closed.cancelled() => self.app.default_receiver(packet),
        }
    }

    /// Offers a replayed packet without waiting for mailbox space.
    ///
    /// A full mailbox hands the packet back untouched so the caller can
    /// keep it deferred. Chunks are only reassembled once there is room,
    /// so a handed-back packet is still in its wire form.
    pub(crate) async fn offer(
        &self,
        packet: Packet,
        shutdown: &CancellationToken,
    ) -> Result<Option<Packet>, HubError> {
        if !self.closed.is_cancelled() && self.tx.capacity() == 0 {
            return Ok(Some(packet));
        }
        if let Some(packet) = self.files.accept(packet).await? {
            self.enqueue(packet, shutdown);
        }
        Ok(None)
    }

    /// Queues a notification without waiting.
    pub(crate) fn notify(&self, packet: Packet, shutdown: &CancellationToken) {
        self.enqueue(packet, shutdown);
    }

    /// Queues a packet without waiting.
    ///
    /// Delivery is at most once: if the mailbox is full a spill-over task
    /// waits for space until the hub shuts down, after which the packet is
    /// dropped without retry.
    fn enqueue(&self, packet: Packet, shutdown: &CancellationToken) {
        if self.closed.is_cancelled() {
            self.app.default_receiver(packet);
            return;
        }
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                tracing::debug!(module = %self.name, "mailbox full, spilling packet");
                let tx = self.tx.clone();
                let app = Arc::clone(&self.app);
                let shutdown = shutdown.clone();
                let closed = self.closed.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::debug!("hub closed, dropping spilled packet");
                        }
                        _ = closed.cancelled() => app.default_receiver(packet),
                        permit = tx.reserve() => match permit {
                            Ok(permit) => permit.send(packet),
                            Err(_) => app.default_receiver(packet),
                        },
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(packet)) => self.app.default_receiver(packet),
        }
    }

    fn packet_to(&self, dst: &str, payload: Payload) -> Packet {
        Packet::new(self.name.as_str(), dst, payload)
    }

    pub async fn send_data_to(&self, dst: &str, data: Vec<u8>) -> Result<(), HubError> {
        self.send_packet(self.packet_to(dst, Payload::Data(Data { data })))
            .await
    }

    pub async fn send_text_to(&self, dst: &str, name: &str, data: Vec<u8>) -> Result<(), HubError> {
        let payload = Payload::Text(Text {
            data,
            name: name.to_string(),
        });
        self.send_packet(self.packet_to(dst, payload)).await
    }

    pub async fn send_msg_to(&self, dst: &str, mtype: MsgType, data: Vec<u8>) -> Result<(), HubError> {
        self.send_packet(self.packet_to(dst, Payload::Msg(Msg { data, mtype })))
            .await
    }

    pub async fn send_action_to(&self, dst: &str, name: &str, data: Vec<u8>) -> Result<(), HubError> {
        let payload = Payload::Action(Action {
            data,
            name: name.to_string(),
        });
        self.send_packet(self.packet_to(dst, payload)).await
    }

    /// Sends a file in 100 KiB chunks.
    pub async fn send_file_to(&self, dst: &str, name: &str, data: &[u8]) -> Result<(), HubError> {
        self.send_chunks(dst, name, data, false).await
    }

    /// Sends an agent upgrade artifact in 100 KiB chunks. These are the only
    /// files an upgrade-only connection lets out.
    pub async fn send_upgrader_file_to(&self, dst: &str, name: &str, data: &[u8]) -> Result<(), HubError> {
        self.send_chunks(dst, name, data, true).await
    }

    /// Reads a file from disk and sends it in chunks, named after its file
    /// name.
    pub async fn send_file_from_path(&self, dst: &str, path: impl AsRef<Path>) -> Result<(), HubError> {
        let (name, data) = read_named(path.as_ref()).await?;
        self.send_chunks(dst, &name, &data, false).await
    }

    pub async fn send_upgrader_file_from_path(&self, dst: &str, path: impl AsRef<Path>) -> Result<(), HubError> {
        let (name, data) = read_named(path.as_ref()).await?;
        self.send_chunks(dst, &name, &data, true).await
    }

    async fn send_chunks(&self, dst: &str, name: &str, data: &[u8], upgrader: bool) -> Result<(), HubError> {
        for chunk in split_file(&self.name, dst, name, data, upgrader) {
            self.send_packet(chunk).await?;
        }
        Ok(())
    }
}

async fn read_named(path: &Path) -> Result<(String, Vec<u8>), HubError> {
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((name, data))
}
