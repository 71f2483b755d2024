//! Packet factory lifecycle (component C6).
//!
//! A factory owns a registered filter set, an optional [`Container`] for
//! discovering sibling factories' filters, and mints [`AutoPacket`]s wired
//! against the current merged filter set on every call — the real
//! satisfaction graph depends on exactly which filters are registered
//! *right now*, so there is nothing to usefully cache about a packet's
//! wiring across calls. What a factory does bound is concurrency: an
//! optional outstanding-packet ceiling, implemented with the same
//! [`ObjectPool`] used elsewhere in this crate, configured here as a pool of
//! anonymous permits (`ObjectPool<()>`) rather than of packets themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::{debug, info};

use crate::container::Container;
use crate::error::EngineError;
use crate::filter::{FilterDescriptor, FilterId, InputKind};
use crate::packet::{Anchor, AutoPacket};
use crate::pool::ObjectPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Unstarted,
    Running,
    Stopped,
}

struct FactoryCore {
    filters: Mutex<Vec<Arc<FilterDescriptor>>>,
    container: Mutex<Option<Arc<dyn Container>>>,
    anchor: Mutex<Option<Anchor>>,
    prior: Mutex<Option<Weak<AutoPacket>>>,
}

/// Mints wired, lifecycle-managed [`AutoPacket`]s.
///
/// Call [`AutoPacketFactory::start`] before [`AutoPacketFactory::new_packet`]
/// will succeed; call [`AutoPacketFactory::stop`] to retire it. Stopping
/// does not recall packets already issued — it only prevents new ones.
pub struct AutoPacketFactory {
    run_state: Mutex<RunState>,
    run_cvar: Condvar,
    core: Arc<FactoryCore>,
    /// Tracks outstanding packets regardless of whether a concurrency limit
    /// is configured, so [`AutoPacketFactory::wait`] has something to run
    /// down. Unbounded unless [`AutoPacketFactory::with_outstanding_limit`]
    /// narrows it.
    permits: ObjectPool<()>,
    next_packet_id: AtomicU64,
}

impl std::fmt::Debug for AutoPacketFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoPacketFactory")
            .field("run_state", &*self.run_state.lock().expect("run_state lock poisoned"))
            .field("filter_count", &self.core.filters.lock().expect("filters lock poisoned").len())
            .finish()
    }
}

impl AutoPacketFactory {
    pub fn new() -> Arc<Self> {
        Self::with_container(None)
    }

    pub fn with_container(container: Option<Arc<dyn Container>>) -> Arc<Self> {
        let core = Arc::new(FactoryCore {
            filters: Mutex::new(Vec::new()),
            container: Mutex::new(container),
            anchor: Mutex::new(None),
            prior: Mutex::new(None),
        });
        Arc::new(AutoPacketFactory {
            run_state: Mutex::new(RunState::Unstarted),
            run_cvar: Condvar::new(),
            core,
            permits: ObjectPool::new(|_id| (), |_v| ()),
            next_packet_id: AtomicU64::new(1),
        })
    }

    /// Caps the number of packets concurrently alive from this factory.
    /// `new_packet` blocks once the limit is reached, until an earlier
    /// packet is dropped. Must be called before [`AutoPacketFactory::start`].
    pub fn with_outstanding_limit(mut self: Arc<Self>, limit: usize) -> Arc<Self> {
        let this = Arc::get_mut(&mut self)
            .expect("with_outstanding_limit must be called before the factory is shared");
        this.permits = ObjectPool::new(|_id| (), |_v| ()).with_limit(limit);
        self
    }

    fn run_state(&self) -> RunState {
        *self.run_state.lock().expect("run_state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Transitions `Unstarted -> Running`. Idempotent once running; returns
    /// [`EngineError::NotRunning`] if the factory was already stopped —
    /// factories do not restart.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.run_state.lock().expect("run_state lock poisoned");
        match *state {
            RunState::Running => return Ok(()),
            RunState::Stopped => return Err(EngineError::NotRunning),
            RunState::Unstarted => {}
        }
        *self.core.anchor.lock().expect("anchor lock poisoned") = Some(Arc::new(()));
        *state = RunState::Running;
        self.run_cvar.notify_all();
        info!("packet factory started");
        Ok(())
    }

    /// Transitions to `Stopped`. `graceful` is accepted for parity with the
    /// external interface (spec §6) but does not change behavior here:
    /// packets already issued keep running to completion on their own
    /// strong anchor clone regardless; only packets not yet constructed are
    /// affected, and they are rejected immediately rather than gracefully
    /// drained either way. Follows spec §4.8's ordering: first clear
    /// `autoFilters` to release any external references their closures
    /// hold, then cap the outstanding-packet pool at zero and evict its
    /// idle cache, and only then flip the lifecycle state.
    pub fn stop(&self, graceful: bool) {
        let _ = graceful;
        self.core.filters.lock().expect("filters lock poisoned").clear();
        self.permits.set_outstanding_limit(0);
        self.permits.clear_cached_entities();

        let mut state = self.run_state.lock().expect("run_state lock poisoned");
        *state = RunState::Stopped;
        *self.core.anchor.lock().expect("anchor lock poisoned") = None;
        self.run_cvar.notify_all();
        info!("packet factory stopped");
    }

    /// Blocks until the factory should stop (either [`AutoPacketFactory::stop`]
    /// has been called, or it never started and was abandoned), then runs
    /// down the outstanding-packet pool: blocks further until every packet
    /// issued before the stop has been released. Returns once the factory is
    /// fully quiesced; it never fails.
    pub fn wait(&self) -> Result<(), EngineError> {
        {
            let mut state = self.run_state.lock().expect("run_state lock poisoned");
            while *state != RunState::Stopped {
                state = self.run_cvar.wait(state).expect("run_state condvar poisoned");
            }
        }
        self.permits.rundown();
        Ok(())
    }

    pub fn set_container(&self, container: Arc<dyn Container>) {
        *self.core.container.lock().expect("container lock poisoned") = Some(container);
    }

    /// The filters registered directly on this factory (not including
    /// sibling factories reachable through its container).
    pub(crate) fn own_filters(&self) -> Vec<Arc<FilterDescriptor>> {
        self.core.filters.lock().expect("filters lock poisoned").clone()
    }

    /// Registers a new filter. Rejected if it would publish the same
    /// decoration type as an existing filter, local or sibling.
    pub fn add_subscriber(&self, descriptor: Arc<FilterDescriptor>) -> Result<(), EngineError> {
        let merged = self.merge_filters();
        check_no_output_clash(&merged, &descriptor)?;
        self.core.filters.lock().expect("filters lock poisoned").push(descriptor.clone());
        debug!(filter = descriptor.name(), "subscriber added");
        Ok(())
    }

    pub fn remove_subscriber(&self, id: FilterId) {
        self.core.filters.lock().expect("filters lock poisoned").retain(|f| f.id() != id);
    }

    fn merge_filters(&self) -> Vec<Arc<FilterDescriptor>> {
        let mut merged = self.own_filters();
        if let Some(container) = &*self.core.container.lock().expect("container lock poisoned") {
            for sibling in container.sibling_factories() {
                merged.extend(sibling.own_filters());
            }
        }
        merged.sort_by_key(|f| f.id());
        merged.dedup_by_key(|f| f.id());
        merged
    }

    /// Mints a fresh, initialized packet wired against the current filter
    /// set. Blocks if an outstanding limit is configured and already
    /// reached. Fails with [`EngineError::NotRunning`] if the factory has
    /// not been started (or has since been stopped).
    pub fn new_packet(self: &Arc<Self>) -> Result<Arc<AutoPacket>, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let permit = self.permits.acquire()?;

        let anchor = self
            .core
            .anchor
            .lock()
            .expect("anchor lock poisoned")
            .clone()
            .ok_or(EngineError::NotRunning)?;
        let filters = self.merge_filters();
        let prior = self.core.prior.lock().expect("prior lock poisoned").clone();
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);

        let packet = Arc::new(AutoPacket::new(
            id,
            filters,
            prior,
            Arc::downgrade(&anchor),
            permit,
        )?);
        packet.initialize()?;

        *self.core.prior.lock().expect("prior lock poisoned") = Some(Arc::downgrade(&packet));
        Ok(packet)
    }
}

fn check_no_output_clash(
    existing: &[Arc<FilterDescriptor>],
    candidate: &FilterDescriptor,
) -> Result<(), EngineError> {
    for input in candidate.inputs() {
        if !matches!(input.kind, InputKind::OutRef | InputKind::OutRefAutoReady) {
            continue;
        }
        for other in existing {
            let clashes = other.inputs().iter().any(|i| {
                matches!(i.kind, InputKind::OutRef | InputKind::OutRefAutoReady)
                    && i.type_key == input.type_key
            });
            if clashes {
                return Err(EngineError::duplicate_publisher(&input.type_key));
            }
        }
    }
    Ok(())
}
