//! Tokio event loop for a [`Multiplexer`].
//!
//! ```text
//! transport task ──ServiceSink──► mpsc ──┐
//!                                        ├──► Driver::next ──► Multiplexer ──► Vec<MuxEvent>
//! reconnect timer (tokio::time) ─────────┘
//! ```
//!
//! The multiplexer stays single-threaded: the driver is the only task that
//! touches it, and every transport callback reaches it through the channel.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};

use crate::model::DocumentModel;
use crate::multiplexer::{MuxEvent, MuxState, Multiplexer};
use crate::protocol::ServiceMessage;
use crate::scheduler::{ReconnectCommand, Scheduler};
use crate::session::{SessionId, WaveService};

type Inbound<O, S> = (SessionId, ServiceMessage<O, S>);

/// Handle a transport uses to deliver callbacks to the driver.
#[derive(Debug)]
pub struct ServiceSink<O, S> {
    tx: mpsc::UnboundedSender<Inbound<O, S>>,
}

impl<O, S> Clone for ServiceSink<O, S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<O, S> ServiceSink<O, S> {
    /// Queue a callback for `session`. Returns false once the driver is gone.
    pub fn deliver(&self, session: SessionId, message: ServiceMessage<O, S>) -> bool {
        self.tx.send((session, message)).is_ok()
    }
}

/// Pumps transport callbacks and reconnect timers into a multiplexer.
pub struct Driver<O, S> {
    rx: mpsc::UnboundedReceiver<Inbound<O, S>>,
    sink: ServiceSink<O, S>,
    timer: Option<(ReconnectCommand, Pin<Box<Sleep>>)>,
}

impl<O, S> Default for Driver<O, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O, S> Driver<O, S> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            sink: ServiceSink { tx },
            timer: None,
        }
    }

    pub fn sink(&self) -> ServiceSink<O, S> {
        self.sink.clone()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.timer.is_some()
    }

    /// Wait for the next batch of multiplexer events.
    ///
    /// Returns `None` once the multiplexer is closed and every event has
    /// been handed out.
    pub async fn next<M, W, Sch>(&mut self, mux: &mut Multiplexer<M, W, Sch>) -> Option<Vec<MuxEvent<S>>>
    where
        M: DocumentModel<Operation = O, State = S>,
        W: WaveService<O, S>,
        Sch: Scheduler,
    {
        loop {
            let events = mux.drain_events();
            if !events.is_empty() {
                self.arm_timer(&events);
                return Some(events);
            }
            if mux.state() == MuxState::Closed {
                self.timer = None;
                return None;
            }

            let Self { rx, timer, .. } = &mut *self;
            tokio::select! {
                received = rx.recv() => match received {
                    Some((session, message)) => mux.handle(session, message),
                    None => return None,
                },
                () = wait_for(timer) => {
                    if let Some((command, _)) = timer.take() {
                        log::debug!("Reconnect timer fired for session {}", command.tag());
                        mux.execute(command);
                    }
                }
            }
        }
    }

    fn arm_timer(&mut self, events: &[MuxEvent<S>]) {
        for event in events {
            if let MuxEvent::ReconnectScheduled { command, delay } = event {
                self.timer = Some((*command, Box::pin(sleep(*delay))));
            }
        }
    }
}

async fn wait_for(timer: &mut Option<(ReconnectCommand, Pin<Box<Sleep>>)>) {
    match timer {
        Some((_, sleep)) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
