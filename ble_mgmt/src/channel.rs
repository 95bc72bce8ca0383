//! Management channel trait plus a socket-backed implementation bound to
//! the control channel (`dev_id = DEV_NONE`, `channel = CHANNEL_CONTROL`).
//! Generalizes what the teacher drove through ad-hoc external-command
//! invocation into one typed, correlated command/event channel, mirroring
//! `ble_hci::engine`'s serialize-and-correlate shape but scoped to the
//! management wire dialect's own timeout and ring size.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ble_octets::Writer;
use ble_shared::{pubsub, Address, AddressType, Shutdown};
use ble_sock::hci::{Socket, SocketAddr, CHANNEL_CONTROL, DEV_NONE};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time;

use crate::error::{ManagementError, ManagementInternalError};
use crate::frame::{CommandFrame, EventFrame, INDEX_NONE};
use crate::opcodes;
use crate::types::{AutoConnectPolicy, DefaultConnParams, IdentityResolvingKey, LinkKey, LongTermKey, SecureConnectionsMode};

pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_millis(3_000);
pub const DEFAULT_EVENT_RING_SIZE: usize = 64;
const READ_BUF_SIZE: usize = 1024;

#[async_trait]
pub trait ManagementChannel: Send + Sync {
    async fn set_powered(&self, on: bool) -> Result<(), ManagementError>;
    async fn set_name(&self, name: &str, short_name: &str) -> Result<(), ManagementError>;
    async fn set_secure_connections(&self, mode: SecureConnectionsMode) -> Result<(), ManagementError>;
    async fn set_default_conn_params(&self, params: DefaultConnParams) -> Result<(), ManagementError>;
    async fn upload_long_term_keys(&self, keys: &[LongTermKey]) -> Result<(), ManagementError>;
    async fn upload_identity_resolving_keys(&self, keys: &[IdentityResolvingKey]) -> Result<(), ManagementError>;
    async fn upload_link_keys(&self, keys: &[LinkKey]) -> Result<(), ManagementError>;
    async fn add_device_to_whitelist(
        &self,
        address: Address,
        address_type: AddressType,
        policy: AutoConnectPolicy,
    ) -> Result<(), ManagementError>;
    async fn remove_device_from_whitelist(&self, address: Address, address_type: AddressType) -> Result<(), ManagementError>;
}

struct PendingCommand {
    opcode: u16,
    reply_tx: Option<oneshot::Sender<(u8, Vec<u8>)>>,
}

#[derive(Default)]
struct Correlation {
    pending: Mutex<Option<PendingCommand>>,
}

impl Correlation {
    fn start(&self, opcode: u16) -> oneshot::Receiver<(u8, Vec<u8>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.pending.lock().unwrap() = Some(PendingCommand {
            opcode,
            reply_tx: Some(reply_tx),
        });
        reply_rx
    }

    fn complete(&self, opcode: u16, status: u8, params: Vec<u8>) {
        let mut guard = self.pending.lock().unwrap();
        if matches!(&*guard, Some(p) if p.opcode == opcode) {
            if let Some(p) = guard.take() {
                if let Some(tx) = p.reply_tx {
                    let _ = tx.send((status, params));
                }
            }
        }
    }
}

/// Socket-backed [`ManagementChannel`]: opens the control channel, spawns a
/// reader task that correlates `CommandComplete`/`CommandStatus` against the
/// single in-flight command, and fans out unsolicited events to subscribers.
pub struct ManagementSocket {
    socket: Arc<Socket>,
    correlation: Arc<Correlation>,
    command_lock: AsyncMutex<()>,
    event_tx: mpsc::Sender<Arc<EventFrame>>,
    event_sub_tx: mpsc::Sender<pubsub::SubscriptionReq<Arc<EventFrame>>>,
    shutdown: Shutdown,
}

pub struct ManagementSocketHandle {
    _shutdown_complete_rx: mpsc::Receiver<()>,
}

impl ManagementSocket {
    pub async fn spawn() -> Result<(Arc<Self>, ManagementSocketHandle), ManagementError> {
        let socket = Socket::new()?;
        socket.bind(SocketAddr::with_channel(DEV_NONE, CHANNEL_CONTROL))?;
        let socket = Arc::new(socket);

        let (event_tx, event_rx) = mpsc::channel(DEFAULT_EVENT_RING_SIZE);
        let (event_sub_tx, event_sub_rx) = mpsc::channel(16);
        pubsub::spawn_fan_out(event_rx, event_sub_rx);

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let shutdown = Shutdown::new(close_tx, shutdown_complete_tx);

        let channel = Arc::new(Self {
            socket: socket.clone(),
            correlation: Arc::new(Correlation::default()),
            command_lock: AsyncMutex::new(()),
            event_tx,
            event_sub_tx,
            shutdown,
        });

        tokio::spawn(Self::reader_loop(channel.clone(), close_rx));

        Ok((channel, ManagementSocketHandle { _shutdown_complete_rx: shutdown_complete_rx }))
    }

    async fn reader_loop(channel: Arc<Self>, mut close_rx: mpsc::Receiver<()>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                _ = close_rx.recv() => {
                    tracing::info!("management channel close signal received, stopping reader");
                    return;
                }
                result = channel.socket.recv(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::error!("management socket closed, reader terminating");
                            return;
                        }
                        Ok(n) => match EventFrame::parse(&buf[..n]) {
                            Ok(evt) => channel.dispatch_event(evt).await,
                            Err(err) => tracing::warn!("malformed management frame: {}", err),
                        },
                        Err(err) => {
                            tracing::error!("management socket read failed, reader terminating: {}", err);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_event(&self, evt: EventFrame) {
        if let Some((opcode, status, params)) = evt.as_cmd_complete() {
            self.correlation.complete(opcode, status, params.to_vec());
            return;
        }
        if let Some((opcode, status)) = evt.as_cmd_status() {
            self.correlation.complete(opcode, status, Vec::new());
            return;
        }
        if self.event_tx.send(Arc::new(evt)).await.is_err() {
            tracing::debug!("management event ring has no active readers");
        }
    }

    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Arc<EventFrame>>, ManagementError> {
        let mut tx = self.event_sub_tx.clone();
        pubsub::subscribe(&mut tx)
            .await
            .map_err(|_| ManagementError::Internal(ManagementInternalError::QueueClosed))
    }

    pub fn shutdown(&self) {
        drop(self.shutdown.drop_guard());
    }

    async fn send_command(&self, opcode: u16, index: u16, params: Vec<u8>) -> Result<Vec<u8>, ManagementError> {
        let _guard = self.command_lock.lock().await;
        let reply_rx = self.correlation.start(opcode);
        let bytes = CommandFrame::new(opcode, index, params).to_bytes();
        self.socket.send(&bytes).await?;

        match time::timeout(DEFAULT_CMD_TIMEOUT, reply_rx).await {
            Ok(Ok((0, ret))) => Ok(ret),
            Ok(Ok((status, _))) => Err(ManagementError::CommandFailed(status, opcode)),
            Ok(Err(_)) => Err(ManagementError::Internal(ManagementInternalError::QueueClosed)),
            Err(_) => Err(ManagementError::CommandTimeout(DEFAULT_CMD_TIMEOUT)),
        }
    }
}

#[async_trait]
impl ManagementChannel for ManagementSocket {
    async fn set_powered(&self, on: bool) -> Result<(), ManagementError> {
        self.send_command(opcodes::SET_POWERED, INDEX_NONE, vec![on as u8]).await?;
        Ok(())
    }

    async fn set_name(&self, name: &str, short_name: &str) -> Result<(), ManagementError> {
        let mut params = Vec::with_capacity(260);
        let mut name_field = [0u8; 249];
        let n = name.as_bytes().len().min(248);
        name_field[..n].copy_from_slice(&name.as_bytes()[..n]);
        let mut short_field = [0u8; 11];
        let s = short_name.as_bytes().len().min(10);
        short_field[..s].copy_from_slice(&short_name.as_bytes()[..s]);
        params.extend_from_slice(&name_field);
        params.extend_from_slice(&short_field);
        self.send_command(opcodes::SET_LOCAL_NAME, INDEX_NONE, params).await?;
        Ok(())
    }

    async fn set_secure_connections(&self, mode: SecureConnectionsMode) -> Result<(), ManagementError> {
        self.send_command(opcodes::SET_SECURE_CONNECTIONS, INDEX_NONE, vec![mode.as_wire_value()])
            .await?;
        Ok(())
    }

    async fn set_default_conn_params(&self, params: DefaultConnParams) -> Result<(), ManagementError> {
        self.send_command(opcodes::SET_DEFAULT_CONN_PARAMS, INDEX_NONE, params.to_params())
            .await?;
        Ok(())
    }

    async fn upload_long_term_keys(&self, keys: &[LongTermKey]) -> Result<(), ManagementError> {
        let mut w = Writer::with_capacity(2 + keys.len() * 36);
        w.put_u16_le(keys.len() as u16);
        for key in keys {
            key.write_into(&mut w);
        }
        self.send_command(opcodes::LOAD_LONG_TERM_KEYS, INDEX_NONE, w.into_vec()).await?;
        Ok(())
    }

    async fn upload_identity_resolving_keys(&self, keys: &[IdentityResolvingKey]) -> Result<(), ManagementError> {
        let mut w = Writer::with_capacity(2 + keys.len() * 23);
        w.put_u16_le(keys.len() as u16);
        for key in keys {
            key.write_into(&mut w);
        }
        self.send_command(opcodes::LOAD_IDENTITY_RESOLVING_KEYS, INDEX_NONE, w.into_vec())
            .await?;
        Ok(())
    }

    async fn upload_link_keys(&self, keys: &[LinkKey]) -> Result<(), ManagementError> {
        let mut w = Writer::with_capacity(2 + keys.len() * 25);
        w.put_u16_le(keys.len() as u16);
        for key in keys {
            key.write_into(&mut w);
        }
        self.send_command(opcodes::LOAD_LINK_KEYS, INDEX_NONE, w.into_vec()).await?;
        Ok(())
    }

    async fn add_device_to_whitelist(
        &self,
        address: Address,
        address_type: AddressType,
        policy: AutoConnectPolicy,
    ) -> Result<(), ManagementError> {
        let mut w = Writer::with_capacity(8);
        w.put_address(address);
        w.put_u8(match address_type {
            AddressType::Public => 0x00,
            AddressType::RandomStatic | AddressType::RandomNonResolvable | AddressType::RandomResolvable => 0x01,
        });
        w.put_u8(policy.as_wire_value());
        self.send_command(opcodes::ADD_DEVICE, INDEX_NONE, w.into_vec()).await?;
        Ok(())
    }

    async fn remove_device_from_whitelist(&self, address: Address, address_type: AddressType) -> Result<(), ManagementError> {
        let mut w = Writer::with_capacity(7);
        w.put_address(address);
        w.put_u8(match address_type {
            AddressType::Public => 0x00,
            AddressType::RandomStatic | AddressType::RandomNonResolvable | AddressType::RandomResolvable => 0x01,
        });
        self.send_command(opcodes::REMOVE_DEVICE, INDEX_NONE, w.into_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_delivers_reply_to_matching_opcode_only() {
        let corr = Correlation::default();
        let mut reply_rx = corr.start(opcodes::SET_POWERED);
        corr.complete(opcodes::SET_LOCAL_NAME, 0x00, vec![]);
        assert!(reply_rx.try_recv().is_err());
        corr.complete(opcodes::SET_POWERED, 0x00, vec![0xAA]);
        assert_eq!(reply_rx.try_recv().unwrap(), (0x00, vec![0xAA]));
    }
}
