//! Internal broadcast-style fan-out used between background tasks (e.g. the
//! HCI engine handing asynchronous events to the Adapter/Device state
//! machines). Each subscriber gets its own unbounded channel and a clone of
//! every published item; a send failure just drops that subscriber.
//!
//! This is distinct from [`crate::listener::ListenerList`], which backs the
//! public callback-trait surface (`AdapterStatusListener`, `GattCharListener`)
//! and favors direct synchronous dispatch over channels.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Error, Debug)]
pub enum PubSubError {
    #[error("failed to subscribe to event stream")]
    SubscriptionFailed,
}

pub struct SubscriptionReq<T> {
    tx: mpsc::UnboundedSender<T>,
    ready_tx: oneshot::Sender<()>,
}

/// Spawns the fan-out task owning `subs`. Drop `msg_tx`/`sub_tx` to stop it.
pub fn spawn_fan_out<T>(mut msg_rx: mpsc::Receiver<T>, mut sub_rx: mpsc::Receiver<SubscriptionReq<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        struct Subscription<T> {
            tx: mpsc::UnboundedSender<T>,
        }
        let mut subs: Vec<Subscription<T>> = vec![];
        loop {
            tokio::select! {
                msg = msg_rx.recv(), if !subs.is_empty() => {
                    match msg {
                        Some(item) => {
                            subs.retain(|sub| sub.tx.send(item.clone()).is_ok());
                        }
                        None => break,
                    }
                },
                sub_req = sub_rx.recv() => {
                    match sub_req {
                        Some(SubscriptionReq { tx, ready_tx }) => {
                            let _ = ready_tx.send(());
                            subs.push(Subscription { tx });
                        }
                        None => break,
                    }
                },
            }
        }
    });
}

pub async fn subscribe<T>(
    sub_tx: &mut mpsc::Sender<SubscriptionReq<T>>,
) -> Result<mpsc::UnboundedReceiver<T>, PubSubError>
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    sub_tx
        .send(SubscriptionReq { tx, ready_tx })
        .await
        .map_err(|_| PubSubError::SubscriptionFailed)?;
    ready_rx.await.map_err(|_| PubSubError::SubscriptionFailed)?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_delivers_to_all_subscribers() {
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let (mut sub_tx, sub_rx) = mpsc::channel(8);
        spawn_fan_out::<u32>(msg_rx, sub_rx);

        let mut a = subscribe(&mut sub_tx).await.unwrap();
        let mut b = subscribe(&mut sub_tx).await.unwrap();

        msg_tx.send(7).await.unwrap();
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_break_fan_out() {
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let (mut sub_tx, sub_rx) = mpsc::channel(8);
        spawn_fan_out::<u32>(msg_rx, sub_rx);

        {
            let _dropped = subscribe(&mut sub_tx).await.unwrap();
        }
        let mut alive = subscribe(&mut sub_tx).await.unwrap();

        msg_tx.send(1).await.unwrap();
        assert_eq!(alive.recv().await, Some(1));
    }
}
