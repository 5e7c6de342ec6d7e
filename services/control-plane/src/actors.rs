//! Core actor primitives.
//!
//! Each logical agent in the control plane (one health supervisor per
//! app-version check) is an actor: it owns its state, processes one
//! message at a time from a bounded mailbox, and communicates only via
//! message passing. Nothing here is shared mutably across agents.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of an actor.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on
    /// failure.
    async fn handle(&mut self, msg: Self::Message) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self) {}
}

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

/// Handle for sending messages to an actor.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Wraps a raw mailbox sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self { tx }
    }

    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }
}

/// Spawns an actor with a fresh mailbox; returns its handle and a shutdown
/// sender.
pub fn spawn<A: Actor>(actor: A, mailbox: usize) -> (ActorHandle<A::Message>, watch::Sender<bool>) {
    let (tx, rx) = mpsc::channel(mailbox);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_actor(actor, rx, shutdown_rx));
    (ActorHandle::new(tx), shutdown_tx)
}

/// The actor loop: one message at a time until stop, crash, or shutdown.
///
/// Exposed so callers that need the mailbox sender inside the actor (e.g.
/// for self-scheduled ticks) can build the channel themselves.
pub async fn run_actor<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = actor.name().to_string();

    if let Err(e) = actor.on_start().await {
        error!(actor = %name, error = %e, "Actor failed to start");
        return;
    }
    debug!(actor = %name, "Actor started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(actor = %name, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => match actor.handle(msg).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(actor = %name, "Actor requested stop");
                            break;
                        }
                        Err(e) => {
                            error!(actor = %name, error = %e, "Actor error");
                            if matches!(e, ActorError::Permanent(_)) {
                                break;
                            }
                        }
                    },
                    None => {
                        debug!(actor = %name, "Actor mailbox closed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop().await;
    debug!(actor = %name, "Actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: u32,
        done: Option<tokio::sync::oneshot::Sender<u32>>,
    }

    #[derive(Debug)]
    enum CounterMessage {
        Add(u32),
        Finish,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&mut self, msg: CounterMessage) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Add(n) => {
                    self.count += n;
                    Ok(true)
                }
                CounterMessage::Finish => {
                    if let Some(done) = self.done.take() {
                        let _ = done.send(self.count);
                    }
                    Ok(false)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_actor_processes_messages_in_order() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let (handle, _shutdown) = spawn(
            Counter {
                count: 0,
                done: Some(done_tx),
            },
            16,
        );

        handle.send(CounterMessage::Add(1)).await.unwrap();
        handle.send(CounterMessage::Add(2)).await.unwrap();
        handle.send(CounterMessage::Finish).await.unwrap();

        assert_eq!(done_rx.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_send_to_stopped_actor_errors() {
        let (done_tx, _done_rx) = tokio::sync::oneshot::channel();
        let (handle, shutdown) = spawn(
            Counter {
                count: 0,
                done: Some(done_tx),
            },
            16,
        );

        shutdown.send(true).unwrap();
        // The mailbox closes once the loop exits.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            handle.send(CounterMessage::Add(1)).await,
            Err(ActorError::ActorStopped)
        ));
    }
}
