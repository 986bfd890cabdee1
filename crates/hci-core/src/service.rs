//! Async service wrapper around the engine.
//!
//! The engine itself is synchronous; this task owns everything that
//! waits: the transport link, the persistence store, and the two
//! timers. All stimuli are serialized through one channel and fed to
//! the engine in arrival order, so nothing in the protocol core needs
//! a lock.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, warn};

use hci_transport::{FramingError, HciLink, TransportError};

use crate::engine::{EngineState, HciConfig, HciEngine};
use crate::events::{Action, ApiRequest, EngineEvent, HciEvent};
use crate::store::{NvStore, NV_BLOCK_CONFIG, NV_CONFIG_SIZE};
use crate::types::HciStatus;

/// Failures binding the service to its transport.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Out-of-band completions the service reports to whoever enabled it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceNotice {
    EnableComplete(HciStatus),
    RestoreComplete(HciStatus),
}

/// Handle to a running HCI service task.
pub struct HciService {
    events: UnboundedSender<EngineEvent>,
    task: JoinHandle<()>,
}

impl HciService {
    /// Open the link, start the engine task, and kick off the bootstrap.
    /// Completion arrives as `ServiceNotice::EnableComplete` on the
    /// returned receiver.
    pub async fn start(
        cfg: HciConfig,
        link: Arc<dyn HciLink>,
        store: Arc<dyn NvStore>,
    ) -> Result<(Self, UnboundedReceiver<ServiceNotice>), ServiceError> {
        let params = link.open().await?;
        let engine = HciEngine::new(cfg, params.max_frame)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let runner = Runner {
            engine,
            link,
            store,
            conn_id: params.conn_id,
            events: event_rx,
            notices: notice_tx,
            rsp_timer: None,
            startup_timer: None,
        };
        let task = tokio::spawn(runner.run());
        Ok((
            Self {
                events: event_tx,
                task,
            },
            notice_rx,
        ))
    }

    /// Register an application and return its event stream. The first
    /// event is `Registered` with the assigned handle.
    pub fn register(&self, name: &str, connectivity_events: bool) -> UnboundedReceiver<HciEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(ApiRequest::RegisterApp {
            name: name.to_string(),
            connectivity_events,
            events: tx,
        });
        rx
    }

    /// Queue an API request.
    pub fn request(&self, req: ApiRequest) {
        if self.events.send(EngineEvent::Api(req)).is_err() {
            warn!("service task is gone; request dropped");
        }
    }

    /// Report the number of discoverable peer hosts.
    pub fn host_count(&self, count: u8) {
        let _ = self.events.send(EngineEvent::HostCount { count });
    }

    /// Report one peer host as ready.
    pub fn host_ready(&self, host: u8) {
        let _ = self.events.send(EngineEvent::HostReady { host });
    }

    /// The controller power-cycled; restore the session.
    pub fn power_cycle(&self) {
        let _ = self.events.send(EngineEvent::PowerCycle);
    }

    /// Disable the subsystem and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.events.send(EngineEvent::Disable);
        let _ = self.task.await;
    }
}

/// Wait on a timer slot; an unarmed slot never fires.
async fn armed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

struct Runner {
    engine: HciEngine,
    link: Arc<dyn HciLink>,
    store: Arc<dyn NvStore>,
    conn_id: u8,
    events: UnboundedReceiver<EngineEvent>,
    notices: UnboundedSender<ServiceNotice>,
    rsp_timer: Option<Pin<Box<Sleep>>>,
    startup_timer: Option<Pin<Box<Sleep>>>,
}

impl Runner {
    async fn run(mut self) {
        let data = match self.store.read(NV_BLOCK_CONFIG, NV_CONFIG_SIZE).await {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "persistence read failed; starting clean");
                None
            }
        };
        self.feed(EngineEvent::NvReadDone { data }).await;

        loop {
            if self.engine.state() == EngineState::Disabled {
                debug!("engine disabled; service task exiting");
                return;
            }
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.feed(event).await,
                    None => {
                        self.feed(EngineEvent::Disable).await;
                        return;
                    }
                },
                frame = self.link.recv() => match frame {
                    Ok(data) => self.feed(EngineEvent::Frame { data }).await,
                    Err(err) => {
                        warn!(%err, "link lost");
                        self.feed(EngineEvent::Disable).await;
                        return;
                    }
                },
                _ = armed(&mut self.rsp_timer) => {
                    self.rsp_timer = None;
                    self.feed(EngineEvent::RspTimeout).await;
                }
                _ = armed(&mut self.startup_timer) => {
                    self.startup_timer = None;
                    self.feed(EngineEvent::StartupTimeout).await;
                }
            }
        }
    }

    /// Feed one event and execute the resulting actions. Actions whose
    /// completion the engine wants to hear about are fed back in order.
    async fn feed(&mut self, event: EngineEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let actions = self.engine.handle_event(event);
            let awaits: Vec<bool> = (0..actions.len())
                .map(|i| frame_awaits_reply(&actions, i))
                .collect();
            let mut timed_out = false;
            for (i, action) in actions.into_iter().enumerate() {
                match action {
                    Action::SendFrame(frame) => {
                        if let Err(err) = self.link.send(self.conn_id, frame).await {
                            warn!(%err, "frame send failed");
                            // Only a frame that was waiting on an answer
                            // degrades to the timeout path; there a dead
                            // send and a silent peer look the same. A
                            // failed response or plain event stays
                            // best-effort.
                            if awaits[i] && !timed_out {
                                timed_out = true;
                                queue.push_back(EngineEvent::RspTimeout);
                            }
                        }
                    }
                    Action::StartRspTimer(after) => {
                        self.rsp_timer = Some(Box::pin(sleep(after)));
                    }
                    Action::StopRspTimer => self.rsp_timer = None,
                    Action::StartStartupTimer(after) => {
                        self.startup_timer = Some(Box::pin(sleep(after)));
                    }
                    Action::StopStartupTimer => self.startup_timer = None,
                    Action::NvWrite(blob) => {
                        let ok = match self.store.write(NV_BLOCK_CONFIG, blob).await {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(%err, "persistence write failed");
                                false
                            }
                        };
                        queue.push_back(EngineEvent::NvWriteDone { ok });
                    }
                    Action::CloseLink => {
                        if let Err(err) = self.link.close(self.conn_id).await {
                            debug!(%err, "link close failed");
                        }
                    }
                    Action::EnableComplete(status) => {
                        let _ = self.notices.send(ServiceNotice::EnableComplete(status));
                    }
                    Action::RestoreComplete(status) => {
                        let _ = self.notices.send(ServiceNotice::RestoreComplete(status));
                    }
                }
            }
        }
    }
}

/// Whether the frame at `frame_at` is waiting on a peer answer. A
/// command (and an event sent with a response window) is emitted with
/// the response timer armed after its frames in the same action batch;
/// responses and plain events are not.
fn frame_awaits_reply(actions: &[Action], frame_at: usize) -> bool {
    actions
        .iter()
        .skip(frame_at + 1)
        .any(|action| matches!(action, Action::StartRspTimer(_)))
}
