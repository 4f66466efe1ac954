#[cfg(test)]
mod task_test;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use util::sync::Mutex as SyncMutex;
use waitgroup::WaitGroup;

use crate::error::{Error, Result};
use crate::transport::{RtcpPackets, RtcpSession, RtpSource};

/// FnTimeGen supplies the current time; tests swap in a mock clock.
pub type FnTimeGen = Arc<dyn Fn() -> SystemTime + Sync + 'static + Send>;

pub(crate) fn system_time() -> FnTimeGen {
    Arc::new(SystemTime::now)
}

enum Envelope<E> {
    Event(E),
    Wake,
}

/// EventSender posts events into a task's inbox. It may be cloned and used from any thread.
pub struct EventSender<E> {
    tx: mpsc::UnboundedSender<Envelope<E>>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        EventSender {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSender<E> {
    /// post queues `event`; returns false once the task has stopped.
    pub fn post(&self, event: E) -> bool {
        self.tx.send(Envelope::Event(event)).is_ok()
    }

    /// wake makes the task re-evaluate its timers and flush pending output.
    pub fn wake(&self) -> bool {
        self.tx.send(Envelope::Wake).is_ok()
    }
}

/// Timer is a restartable one-shot timer driven by the time a handler is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    timeout: Duration,
    deadline: Option<SystemTime>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Self {
        Timer {
            timeout,
            deadline: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// restart arms the timer to fire `timeout` after `now`.
    pub fn restart(&mut self, now: SystemTime) {
        self.deadline = now.checked_add(self.timeout);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    /// fire reports whether the timer has expired at `now` and disarms it if so.
    pub fn fire(&mut self, now: SystemTime) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// earliest returns the soonest of a set of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<SystemTime>
where
    I: IntoIterator<Item = Option<SystemTime>>,
{
    deadlines.into_iter().flatten().min()
}

/// Outbox collects the network output a synchronous handler wants sent.
#[derive(Default)]
pub struct Outbox {
    pub feedback: RtcpPackets,
    /// payload types of keepalives to send
    pub keepalives: Vec<u8>,
}

impl Outbox {
    pub fn push_feedback<P>(&mut self, packet: P)
    where
        P: rtcp::packet::Packet + Send + Sync + 'static,
    {
        self.feedback.push(Box::new(packet));
    }

    pub fn is_empty(&self) -> bool {
        self.feedback.is_empty() && self.keepalives.is_empty()
    }

    pub fn take(&mut self) -> Outbox {
        std::mem::take(self)
    }
}

/// TaskHandler is the synchronous state machine a [`PlaybackTask`] drives.
pub trait TaskHandler: Send + 'static {
    type Event: Send + 'static;

    /// handle_event runs one posted event. `tx` may be used to post follow-up events.
    fn handle_event(&mut self, event: Self::Event, now: SystemTime, tx: &EventSender<Self::Event>);

    /// handle_timers runs every timer that has expired at `now`.
    fn handle_timers(&mut self, now: SystemTime);

    fn next_deadline(&self) -> Option<SystemTime>;

    fn take_outbox(&mut self) -> Outbox;
}

/// TaskIo is where a task sends the contents of handler outboxes.
#[derive(Clone, Default)]
pub struct TaskIo {
    pub rtp: Option<Arc<dyn RtpSource + Send + Sync>>,
    pub rtcp: Option<Arc<dyn RtcpSession + Send + Sync>>,
}

impl TaskIo {
    async fn flush(&self, outbox: Outbox) {
        if !outbox.feedback.is_empty() {
            if let Some(rtcp) = &self.rtcp {
                if let Err(err) = rtcp.write_feedback(&outbox.feedback).await {
                    log::warn!("failed sending rtcp feedback: {}", err);
                }
            }
        }
        for payload_type in outbox.keepalives {
            if let Some(rtp) = &self.rtp {
                if let Err(err) = rtp.send_keepalive(payload_type).await {
                    log::warn!("failed sending keepalive: {}", err);
                }
            }
        }
    }
}

/// PlaybackTask runs a handler as a single-threaded event loop on the tokio runtime.
///
/// Events posted through [`EventSender`] are handled one at a time, timers fire in between
/// events, and the handler outbox is flushed after every wakeup. The handler itself stays
/// reachable through [`PlaybackTask::with_handler`] for control calls.
pub struct PlaybackTask<H: TaskHandler> {
    handler: Arc<SyncMutex<H>>,
    tx: EventSender<H::Event>,
    close_tx: tokio::sync::Mutex<Option<mpsc::Sender<()>>>,
    wg: tokio::sync::Mutex<Option<WaitGroup>>,
}

impl<H: TaskHandler> PlaybackTask<H> {
    /// spawn starts the event loop. Must be called from within a tokio runtime.
    pub fn spawn(handler: H, io: TaskIo, now: FnTimeGen) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::channel(1);
        let handler = Arc::new(SyncMutex::new(handler));
        let sender = EventSender { tx };
        let wg = WaitGroup::new();

        let mut w = Some(wg.worker());
        let handler2 = Arc::clone(&handler);
        let sender2 = sender.clone();
        tokio::spawn(async move {
            let _d = w.take();
            if let Err(err) = Self::run(handler2, sender2, rx, close_rx, io, now).await {
                log::warn!("playback task exited with error: {}", err);
            }
        });

        PlaybackTask {
            handler,
            tx: sender,
            close_tx: tokio::sync::Mutex::new(Some(close_tx)),
            wg: tokio::sync::Mutex::new(Some(wg)),
        }
    }

    pub fn sender(&self) -> EventSender<H::Event> {
        self.tx.clone()
    }

    pub fn post(&self, event: H::Event) -> bool {
        self.tx.post(event)
    }

    /// with_handler runs `f` on the handler under its lock and wakes the loop so any output
    /// `f` produced is sent.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let result = {
            let mut handler = self.handler.lock();
            f(&mut handler)
        };
        self.tx.wake();
        result
    }

    async fn run(
        handler: Arc<SyncMutex<H>>,
        tx: EventSender<H::Event>,
        mut rx: mpsc::UnboundedReceiver<Envelope<H::Event>>,
        mut close_rx: mpsc::Receiver<()>,
        io: TaskIo,
        now: FnTimeGen,
    ) -> Result<()> {
        loop {
            let wait = {
                let handler = handler.lock();
                handler
                    .next_deadline()
                    .map(|deadline| deadline.duration_since(now()).unwrap_or_default())
            };

            tokio::select! {
                envelope = rx.recv() => {
                    match envelope {
                        Some(Envelope::Event(event)) => {
                            let mut handler = handler.lock();
                            let t = now();
                            handler.handle_timers(t);
                            handler.handle_event(event, t, &tx);
                        }
                        Some(Envelope::Wake) => {
                            handler.lock().handle_timers(now());
                        }
                        None => return Err(Error::ErrInvalidEventRx),
                    }
                }
                _ = sleep_for(wait) => {
                    handler.lock().handle_timers(now());
                }
                _ = close_rx.recv() => {
                    let outbox = handler.lock().take_outbox();
                    io.flush(outbox).await;
                    return Ok(());
                }
            }

            let outbox = handler.lock().take_outbox();
            if !outbox.is_empty() {
                io.flush(outbox).await;
            }
        }
    }

    /// close stops the event loop and waits for it to exit.
    pub async fn close(&self) -> Result<()> {
        {
            let mut close_tx = self.close_tx.lock().await;
            if close_tx.take().is_none() {
                return Err(Error::ErrTaskClosed);
            }
        }

        {
            let mut wait_group = self.wg.lock().await;
            if let Some(wg) = wait_group.take() {
                wg.wait().await;
            }
        }

        Ok(())
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}
