//! The single-threaded event loop.
//!
//! One pass of [`Mainloop::run_once`] runs, in order:
//! 1. readiness events, each dispatched to its endpoint or listener,
//! 2. due timeouts, earliest first,
//! 3. eviction of endpoints that died during the pass.
//!
//! Eviction is deferred so that closing a descriptor can never invalidate a
//! readiness batch still being walked. An evicted endpoint is removed from
//! the poller before its transport is dropped.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mavrelay_frame::{timestamp_now, DecodedFrame, MessageTable};
use mavrelay_transport::{TcpServer, Transport};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::endpoint::{Delivery, Endpoint, EndpointConfig, EndpointStats};
use crate::error::{DeadReason, Result, RouterError};
use crate::poller::{Event, Interest, Poller};
use crate::routing::{Broadcast, RoutingPolicy};
use crate::sink::LogSink;
use crate::timeout::{
    TimeoutAction, TimeoutCallback, TimeoutControl, TimeoutHandle, TimeoutRegistry,
    DEFAULT_TIMEOUT_CAPACITY,
};

/// Longest single wait, so a shutdown request is noticed even when no
/// descriptor or timeout wakes the loop.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Loop-wide settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Events taken from the poller per wait.
    pub max_events: usize,
    /// Concurrent timeouts allowed.
    pub timeout_capacity: usize,
    /// Log per-endpoint statistics at this interval.
    pub report_stats: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_events: 8,
            timeout_capacity: DEFAULT_TIMEOUT_CAPACITY,
            report_stats: None,
        }
    }
}

/// Identifies an endpoint owned by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    index: u32,
    generation: u32,
}

/// Identifies a listening socket owned by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

/// What a registered descriptor dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Endpoint(EndpointId),
    Listener(ListenerId),
}

/// Statistics for one endpoint, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub name: String,
    pub kind: &'static str,
    pub peer: Option<String>,
    #[serde(flatten)]
    pub stats: EndpointStats,
}

struct Listener {
    server: TcpServer,
    template: EndpointConfig,
    accepted: u64,
}

#[derive(Default)]
struct EndpointSlot {
    generation: u32,
    endpoint: Option<Endpoint>,
}

/// Everything the loop owns except the timeout registry.
///
/// Timeout callbacks receive `&mut Core`.
pub struct Core {
    poller: Poller,
    slots: Vec<EndpointSlot>,
    listeners: Vec<Listener>,
    registrations: HashMap<RawFd, Registration>,
    dying: Vec<EndpointId>,
    router: Box<dyn RoutingPolicy>,
    sink: Option<Box<dyn LogSink>>,
    table: Arc<dyn MessageTable>,
    shutdown: Arc<AtomicBool>,
    live: Vec<EndpointId>,
    targets: Vec<EndpointId>,
    frames: Vec<DecodedFrame>,
}

impl Core {
    fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.endpoint.as_mut())
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.endpoint.as_ref())
    }

    /// Ids of all endpoints currently owned by the loop.
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.endpoint.is_some())
            .map(|(index, slot)| EndpointId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.endpoint.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptors with a live registration.
    pub fn registered_fds(&self) -> Vec<RawFd> {
        self.registrations.keys().copied().collect()
    }

    pub fn report(&self) -> Vec<EndpointReport> {
        self.slots
            .iter()
            .filter_map(|slot| slot.endpoint.as_ref())
            .map(|endpoint| EndpointReport {
                name: endpoint.name().to_string(),
                kind: endpoint.kind().as_str(),
                peer: endpoint.transport().peer(),
                stats: endpoint.stats(),
            })
            .collect()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn table(&self) -> &Arc<dyn MessageTable> {
        &self.table
    }

    fn insert_endpoint(&mut self, endpoint: Endpoint) -> Result<EndpointId> {
        let fd = endpoint.as_raw_fd();
        let index = match self.slots.iter().position(|slot| slot.endpoint.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(EndpointSlot::default());
                self.slots.len() - 1
            }
        };
        let id = EndpointId {
            index: index as u32,
            generation: self.slots[index].generation,
        };

        self.poller
            .register(fd, Interest::READABLE)
            .map_err(|source| RouterError::Register { fd, source })?;
        self.registrations.insert(fd, Registration::Endpoint(id));

        info!(
            endpoint = %endpoint.name(),
            kind = %endpoint.kind(),
            fd,
            "endpoint added"
        );
        self.slots[index].endpoint = Some(endpoint);
        Ok(id)
    }

    fn dispatch(&mut self, event: Event) {
        let Some(&registration) = self.registrations.get(&event.fd) else {
            trace!(fd = event.fd, "event for unregistered fd ignored");
            return;
        };

        match registration {
            Registration::Listener(id) => self.accept(id),
            Registration::Endpoint(id) => {
                if event.readable {
                    self.handle_readable(id);
                }
                if event.writable {
                    self.handle_writable(id);
                }
                if event.hangup {
                    self.mark_dead(id, DeadReason::Hangup);
                }
            }
        }
    }

    fn handle_readable(&mut self, id: EndpointId) {
        let table = self.table.as_ref();
        let Some(endpoint) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.endpoint.as_mut())
        else {
            return;
        };
        if endpoint.is_dead() {
            return;
        }

        // Frames are collected first: forwarding needs the other endpoints.
        let mut frames = std::mem::take(&mut self.frames);
        let mut dead = None;
        for item in endpoint.read_incoming(table) {
            match item {
                Ok(frame) => frames.push(frame),
                Err(reason) => dead = Some(reason),
            }
        }

        for frame in frames.drain(..) {
            self.forward(id, &frame);
        }
        self.frames = frames;

        if let Some(reason) = dead {
            self.mark_dead(id, reason);
        }
    }

    fn handle_writable(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoint_mut(id) else {
            return;
        };
        if endpoint.is_dead() {
            return;
        }
        match endpoint.flush_pending() {
            Ok(written) => trace!(endpoint = %endpoint.name(), bytes = written, "flushed"),
            Err(reason) => {
                self.mark_dead(id, reason);
                return;
            }
        }
        self.sync_interest(id);
    }

    fn forward(&mut self, source: EndpointId, frame: &DecodedFrame) {
        if let Some(sink) = self.sink.as_mut() {
            sink.record(timestamp_now(), frame);
        }

        self.live.clear();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.endpoint.as_ref().is_some_and(|e| !e.is_dead()) {
                self.live.push(EndpointId {
                    index: index as u32,
                    generation: slot.generation,
                });
            }
        }
        self.targets.clear();
        self.router
            .route(source, frame, &self.live, &mut self.targets);

        for i in 0..self.targets.len() {
            let target = self.targets[i];
            let Some(endpoint) = self.endpoint_mut(target) else {
                continue;
            };
            endpoint.enqueue_frame(&frame.raw);
            if endpoint.is_dead() {
                self.schedule_eviction(target);
            } else {
                self.sync_interest(target);
            }
        }
    }

    /// Apply a backpressure transition to the poller.
    fn sync_interest(&mut self, id: EndpointId) {
        let Some(endpoint) = self.endpoint_mut(id) else {
            return;
        };
        let Some(interest) = endpoint.interest_change() else {
            return;
        };
        let fd = endpoint.as_raw_fd();
        if let Err(err) = self.poller.modify(fd, interest) {
            warn!(fd, error = %err, "failed to update interest");
            self.mark_dead(id, DeadReason::Io(err));
        }
    }

    fn accept(&mut self, id: ListenerId) {
        loop {
            let Some(listener) = self.listeners.get_mut(id.0) else {
                return;
            };
            let transport = match listener.server.accept() {
                Ok(Some(transport)) => transport,
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return;
                }
            };
            listener.accepted += 1;
            let mut config = listener.template.clone();
            config.name = format!("{}#{}", listener.template.name, listener.accepted);
            info!(
                endpoint = %config.name,
                peer = %transport.peer_addr(),
                "accepted tcp client"
            );

            let endpoint = Endpoint::new(config, Box::new(transport));
            if let Err(err) = self.insert_endpoint(endpoint) {
                warn!(error = %err, "failed to register accepted connection");
            }
        }
    }

    fn mark_dead(&mut self, id: EndpointId, reason: DeadReason) {
        if let Some(endpoint) = self.endpoint_mut(id) {
            endpoint.mark_dead(reason);
            self.schedule_eviction(id);
        }
    }

    fn schedule_eviction(&mut self, id: EndpointId) {
        if !self.dying.contains(&id) {
            self.dying.push(id);
        }
    }

    /// Close every endpoint that died during this pass.
    fn evict_dead(&mut self) {
        let dying = std::mem::take(&mut self.dying);
        for id in dying {
            let Some(slot) = self
                .slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation)
            else {
                continue;
            };
            let Some(endpoint) = slot.endpoint.as_mut() else {
                continue;
            };

            let fd = endpoint.as_raw_fd();
            if let Err(err) = self.poller.unregister(fd) {
                debug!(fd, error = %err, "unregister failed");
            }
            self.registrations.remove(&fd);

            let reason = endpoint.take_dead();
            let stats = endpoint.stats();
            info!(
                endpoint = %endpoint.name(),
                reason = %reason.as_ref().map(ToString::to_string).unwrap_or_default(),
                read_messages = stats.read.messages,
                write_messages = stats.write.messages,
                "endpoint closed"
            );

            // The registration is gone; only now may the descriptor close.
            slot.endpoint = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    fn flush_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush();
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("endpoints", &self.len())
            .field("registrations", &self.registrations.len())
            .field("dying", &self.dying.len())
            .finish()
    }
}

/// Owns every endpoint, listener and timeout, and drives them from one
/// thread.
pub struct Mainloop {
    core: Core,
    timeouts: TimeoutRegistry<Core>,
    events: Vec<Event>,
}

impl Mainloop {
    /// Create a loop that broadcasts every frame to all other endpoints.
    pub fn new(table: Arc<dyn MessageTable>, config: LoopConfig) -> Result<Self> {
        let poller = Poller::new(config.max_events).map_err(RouterError::PollerCreate)?;
        let mut mainloop = Self {
            core: Core {
                poller,
                slots: Vec::new(),
                listeners: Vec::new(),
                registrations: HashMap::new(),
                dying: Vec::new(),
                router: Box::new(Broadcast),
                sink: None,
                table,
                shutdown: Arc::new(AtomicBool::new(false)),
                live: Vec::new(),
                targets: Vec::new(),
                frames: Vec::new(),
            },
            timeouts: TimeoutRegistry::new(config.timeout_capacity),
            events: Vec::with_capacity(config.max_events),
        };

        if let Some(interval) = config.report_stats {
            mainloop.add_timeout(interval, Box::new(log_stats))?;
        }
        Ok(mainloop)
    }

    pub fn set_router(&mut self, router: Box<dyn RoutingPolicy>) {
        self.core.router = router;
    }

    pub fn set_sink(&mut self, sink: Box<dyn LogSink>) {
        self.core.sink = Some(sink);
    }

    /// Take ownership of a ready transport and start reading from it.
    pub fn add_endpoint(
        &mut self,
        config: EndpointConfig,
        transport: Box<dyn Transport>,
    ) -> Result<EndpointId> {
        self.core.insert_endpoint(Endpoint::new(config, transport))
    }

    /// Accept TCP clients on `server`; each becomes an endpoint configured
    /// from `template`.
    pub fn add_listener(&mut self, server: TcpServer, template: EndpointConfig) -> Result<ListenerId> {
        let fd = server.as_raw_fd();
        let id = ListenerId(self.core.listeners.len());
        self.core
            .poller
            .register(fd, Interest::READABLE)
            .map_err(|source| RouterError::Register { fd, source })?;
        self.core.registrations.insert(fd, Registration::Listener(id));
        info!(local = %server.local_addr(), name = %template.name, "tcp listener added");
        self.core.listeners.push(Listener {
            server,
            template,
            accepted: 0,
        });
        Ok(id)
    }

    /// Run `callback` every `interval` until it returns `Done` or is
    /// cancelled.
    pub fn add_timeout(
        &mut self,
        interval: Duration,
        callback: TimeoutCallback<Core>,
    ) -> Result<TimeoutHandle> {
        self.timeouts.schedule(Instant::now(), interval, callback)
    }

    pub fn cancel_timeout(&mut self, handle: TimeoutHandle) -> bool {
        self.timeouts.cancel(handle)
    }

    /// Flag that stops [`Mainloop::run`] after the current pass.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.core.shutdown)
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.core.endpoint(id)
    }

    /// Queue a locally built frame on one endpoint, outside the routing path.
    pub fn send_to(&mut self, id: EndpointId, frame: &[u8]) -> Option<Delivery> {
        let endpoint = self.core.endpoint_mut(id)?;
        let delivery = endpoint.enqueue_frame(frame);
        if endpoint.is_dead() {
            self.core.schedule_eviction(id);
        } else {
            self.core.sync_interest(id);
        }
        Some(delivery)
    }

    /// One wait-and-dispatch pass. Waits at most `max_wait` (or until the
    /// next timeout when that is sooner) and returns the number of
    /// readiness events handled.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<usize> {
        let now = Instant::now();
        let wait = match (self.timeouts.time_until_next(now), max_wait) {
            (Some(next), Some(max)) => Some(next.min(max)),
            (next, max) => next.or(max),
        };

        let n = self.core.poller.wait(&mut self.events, wait)?;
        for event in &self.events {
            self.core.dispatch(*event);
        }

        self.timeouts.run_due(Instant::now(), &mut self.core);
        self.core.evict_dead();
        Ok(n)
    }

    /// Run until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        info!(
            endpoints = self.core.len(),
            listeners = self.core.listeners.len(),
            "mainloop started"
        );
        while !self.core.shutdown.load(Ordering::SeqCst) {
            self.run_once(Some(MAX_IDLE_WAIT))?;
        }
        self.core.flush_sink();
        info!("mainloop stopped");
        Ok(())
    }
}

impl fmt::Debug for Mainloop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mainloop")
            .field("core", &self.core)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

fn log_stats(core: &mut Core, _: &mut TimeoutControl) -> TimeoutAction {
    for report in core.report() {
        info!(
            endpoint = %report.name,
            kind = report.kind,
            read_bytes = report.stats.read.bytes,
            read_messages = report.stats.read.messages,
            crc_errors = report.stats.read.crc_errors,
            write_bytes = report.stats.write.bytes,
            write_messages = report.stats.write.messages,
            dropped = report.stats.write.dropped,
            "endpoint stats"
        );
    }
    core.flush_sink();
    TimeoutAction::Rearm
}
