//! The packet carrier (component C4): wiring, satisfaction
//! algorithms, and the public checkout/decorate contract.
//!
//! The central discipline repeated throughout this file: every routine that
//! mutates shared state takes the packet lock, builds a local queue of
//! filters that just became runnable, releases the lock, and only then
//! invokes them. A filter's invoker must never run while the lock is held,
//! or a filter that decorates the same packet from inside its own body
//! would deadlock re-entering satisfaction.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::disposition::{decrement_subscribers, DecorationDisposition};
use crate::error::EngineError;
use crate::filter::{FilterDescriptor, InputKind};
use crate::pool::PooledEntity;
use crate::sat_counter::SatCounter;
use crate::type_key::TypeKey;

/// An opaque owning handle whose liveness signals that the enclosing
/// container/scope is still running. Packets acquire a strong reference to
/// this during [`AutoPacket::initialize`] and release it in
/// [`AutoPacket::finalize`], breaking any cycle back to the container while
/// the packet is idle in its pool.
pub type Anchor = Arc<dyn Any + Send + Sync>;

struct PacketState {
    sat_counters: Vec<SatCounter>,
    decorations: HashMap<TypeKey, DecorationDisposition>,
}

/// A short-lived carrier for one unit of work's typed decorations.
pub struct AutoPacket {
    id: u64,
    state: Mutex<PacketState>,
    /// Number of sat_counters inherited from the factory's filter set at
    /// construction; entries beyond this index are per-packet recipients
    /// added via [`AutoPacket::add_recipient`] and torn down LIFO at
    /// `finalize`.
    subscriber_num: usize,
    /// Weak back-link to the previously issued packet. Informational only.
    prior: Option<Weak<AutoPacket>>,
    outstanding_remote: Weak<dyn Any + Send + Sync>,
    outstanding: Mutex<Option<Anchor>>,
    /// Held for this packet's entire lifetime; releases the slot back to the
    /// factory's outstanding-packet pool on drop, which is also what lets
    /// `AutoPacketFactory::wait` run that pool down to completion.
    _permit: PooledEntity<()>,
}

impl AutoPacket {
    /// Builds a new packet wired against `filters` (already stable-sorted
    /// and deduplicated by the caller — see [`crate::factory::AutoPacketFactory`],
    /// which merges filters from the container's sibling factories before
    /// calling this).
    pub(crate) fn new(
        id: u64,
        filters: Vec<Arc<FilterDescriptor>>,
        prior: Option<Weak<AutoPacket>>,
        outstanding_remote: Weak<dyn Any + Send + Sync>,
        permit: PooledEntity<()>,
    ) -> Result<Self, EngineError> {
        let mut sat_counters: Vec<SatCounter> = filters.into_iter().map(SatCounter::new).collect();
        let mut decorations: HashMap<TypeKey, DecorationDisposition> = HashMap::new();

        for (index, sc) in sat_counters.iter_mut().enumerate() {
            for input in sc.descriptor().inputs().to_vec() {
                let entry = decorations
                    .entry(input.type_key)
                    .or_insert_with(DecorationDisposition::new);
                match input.kind {
                    InputKind::Required => entry.register_subscriber(index, true),
                    InputKind::Optional => entry.register_subscriber(index, false),
                    InputKind::OutRef | InputKind::OutRefAutoReady => {
                        entry.register_publisher(index, &input.type_key)?;
                    }
                }
            }
        }

        let subscriber_num = sat_counters.len();
        for sc in &mut sat_counters {
            sc.reset();
        }
        for d in decorations.values_mut() {
            d.reset();
        }

        Ok(AutoPacket {
            id,
            state: Mutex::new(PacketState { sat_counters, decorations }),
            subscriber_num,
            prior,
            outstanding_remote,
            outstanding: Mutex::new(None),
            _permit: permit,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The previously issued packet, if the factory's prior packet is still
    /// alive. Informational only — no ordering is implied.
    pub fn prior(&self) -> Option<Arc<AutoPacket>> {
        self.prior.as_ref().and_then(Weak::upgrade)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PacketState> {
        self.state.lock().expect("autoflow packet lock poisoned")
    }

    // ── Satisfaction algorithms ───────────────────────────────────────────

    fn update_satisfaction(&self, key: &TypeKey) {
        let mut queue = Vec::new();
        {
            let mut state = self.lock();
            let Some(disposition) = state.decorations.get(key) else { return };
            let subs = disposition.subscribers.clone();
            decrement_subscribers(&subs, &mut state.sat_counters, false, &mut queue);
        }
        self.invoke_queue(&queue);
    }

    fn mark_unsatisfiable(&self, key: &TypeKey) {
        let mut queue = Vec::new();
        {
            let mut state = self.lock();
            let Some(disposition) = state.decorations.get(key) else { return };
            let subs = disposition.subscribers.clone();
            decrement_subscribers(&subs, &mut state.sat_counters, true, &mut queue);
        }
        self.invoke_queue(&queue);
    }

    fn pulse_satisfaction(&self, keys: &[TypeKey]) {
        let mut queue = Vec::new();
        {
            let mut state = self.lock();
            for key in keys.iter().rev() {
                let Some(disposition) = state.decorations.get(key) else { continue };
                for &(index, required) in disposition.subscribers.iter() {
                    if !required {
                        continue;
                    }
                    let counter = &mut state.sat_counters[index];
                    if counter.is_deferred() {
                        continue;
                    }
                    if counter.pulse_decrement() {
                        queue.push(index);
                    }
                }
            }
        }

        self.invoke_queue(&queue);

        let mut state = self.lock();
        for key in keys.iter().rev() {
            let Some(disposition) = state.decorations.get(key) else { continue };
            let required_indices: Vec<usize> = disposition
                .subscribers
                .iter()
                .filter(|(_, required)| *required)
                .map(|(index, _)| *index)
                .collect();
            for index in required_indices {
                state.sat_counters[index].undo_pulse_decrement();
            }
        }
    }

    fn complete_checkout(&self, key: &TypeKey, ready: bool) {
        {
            let mut state = self.lock();
            if let Some(disposition) = state.decorations.get_mut(key) {
                disposition.complete_checkout(ready);
            }
        }
        if ready {
            self.update_satisfaction(key);
        } else {
            self.mark_unsatisfiable(key);
        }
    }

    /// Invokes every queued filter outside the packet lock. This is the one
    /// place in the engine that calls into caller-provided code, and it
    /// must never be called while `self.state` is locked.
    fn invoke_queue(&self, queue: &[usize]) {
        if queue.is_empty() {
            return;
        }
        let descriptors: Vec<_> = {
            let state = self.lock();
            queue
                .iter()
                .map(|&index| state.sat_counters[index].descriptor().clone())
                .collect()
        };
        for descriptor in descriptors {
            trace!(packet = self.id, filter = descriptor.name(), "invoking filter");
            descriptor.invoke(self);
        }
    }

    // ── Public contract ───────────────────────────────────────────────────

    pub fn has<T: 'static>(&self) -> bool {
        let state = self.lock();
        state
            .decorations
            .get(&TypeKey::of::<T>())
            .map(|d| d.is_satisfied())
            .unwrap_or(false)
    }

    /// Non-authoritative hint: true iff a slot for `T` has a subscriber or a
    /// publisher registered. A bare map entry created by `checkout`/
    /// `decorate`/`decorate_immediate` on a type nobody wired does not count.
    pub fn has_subscribers<T: 'static>(&self) -> bool {
        let state = self.lock();
        state
            .decorations
            .get(&TypeKey::of::<T>())
            .is_some_and(|d| d.publisher.is_some() || !d.subscribers.is_empty())
    }

    /// Returns the decoration for `T`, cloning the shared handle, or
    /// [`EngineError::DecorationMissing`] if absent.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, EngineError> {
        let key = TypeKey::of::<T>();
        let state = self.lock();
        let disposition = state
            .decorations
            .get(&key)
            .filter(|d| d.is_satisfied())
            .ok_or_else(|| EngineError::decoration_missing(&key))?;
        let value = disposition
            .value
            .as_ref()
            .ok_or_else(|| EngineError::decoration_missing(&key))?;
        value
            .clone()
            .downcast::<T>()
            .map_err(|_| EngineError::decoration_missing(&key))
    }

    /// Checks out a fresh, default-constructed `T` for filling in.
    pub fn checkout<T: Send + Sync + Default + 'static>(
        &self,
    ) -> Result<PacketCheckout<'_, T>, EngineError> {
        self.checkout_with(T::default())
    }

    /// Checks out `value` as the slot for `T`.
    pub fn checkout_with<T: Send + Sync + 'static>(
        &self,
        value: T,
    ) -> Result<PacketCheckout<'_, T>, EngineError> {
        self.begin_checkout_boxed(Arc::new(value))
    }

    /// Checks out using a caller-supplied handle rather than a freshly
    /// constructed value. Mirrors the original `Checkout(shared_ptr<T>)`
    /// overload; an absent handle is rejected with
    /// [`EngineError::NullHandle`] instead of silently checking out nothing.
    pub fn checkout_handle<T: Send + Sync + 'static>(
        &self,
        handle: Option<Arc<T>>,
    ) -> Result<PacketCheckout<'_, T>, EngineError> {
        let key = TypeKey::of::<T>();
        let handle = handle.ok_or_else(|| EngineError::null_handle(&key))?;
        self.begin_checkout_boxed(handle)
    }

    fn begin_checkout_boxed<T: Send + Sync + 'static>(
        &self,
        value: Arc<T>,
    ) -> Result<PacketCheckout<'_, T>, EngineError> {
        let key = TypeKey::of::<T>();
        let boxed: Arc<dyn Any + Send + Sync> = value;
        {
            let mut state = self.lock();
            let disposition = state
                .decorations
                .entry(key.clone())
                .or_insert_with(DecorationDisposition::new);
            disposition.begin_checkout(&key, boxed)?;
        }
        Ok(PacketCheckout { packet: self, key, completed: false, _marker: std::marker::PhantomData })
    }

    /// Shorthand for `checkout_with(value).ready(true)`.
    pub fn decorate<T: Send + Sync + 'static>(&self, value: T) -> Result<(), EngineError> {
        self.checkout_with(value)?.ready(true);
        Ok(())
    }

    /// Starts a transient, scope-bounded decoration batch (the engine's
    /// `DecorateImmediate`). Values attached here satisfy non-deferred
    /// subscribers synchronously, for the dynamic extent of [`ImmediateBatch::pulse`]
    /// only; afterwards every slot involved unconditionally becomes
    /// unsatisfiable. Shared-ownership handles (`Arc<_>`) must not be used
    /// as immediate values — use [`AutoPacket::decorate`] instead.
    pub fn decorate_immediate(&self) -> ImmediateBatch<'_> {
        ImmediateBatch { packet: self, items: Vec::new() }
    }

    fn decorate_immediate_many(
        &self,
        items: Vec<(TypeKey, Arc<dyn Any + Send + Sync>)>,
    ) -> Result<(), EngineError> {
        let keys: Vec<TypeKey> = items.iter().map(|(k, _)| k.clone()).collect();
        {
            let mut state = self.lock();
            // Validate every slot before mutating any, so a rejected batch
            // leaves no slot half-initialized.
            for (key, _) in &items {
                if let Some(existing) = state.decorations.get(key) {
                    if existing.was_checked_out {
                        return Err(EngineError::already_checked_out(key));
                    }
                }
            }
            for (key, value) in items {
                let disposition = state
                    .decorations
                    .entry(key.clone())
                    .or_insert_with(DecorationDisposition::new);
                disposition.begin_immediate(&key, value)?;
            }
        }

        struct EndImmediate<'a> {
            packet: &'a AutoPacket,
            keys: Vec<TypeKey>,
        }
        impl<'a> Drop for EndImmediate<'a> {
            fn drop(&mut self) {
                {
                    let mut state = self.packet.lock();
                    for key in &self.keys {
                        if let Some(disposition) = state.decorations.get_mut(key) {
                            disposition.end_immediate();
                        }
                    }
                }
                for key in &self.keys {
                    self.packet.mark_unsatisfiable(key);
                }
            }
        }
        let _guard = EndImmediate { packet: self, keys: keys.clone() };

        self.pulse_satisfaction(&keys);
        Ok(())
    }

    /// Marks `T` as unsatisfiable without ever providing a value. Required
    /// subscribers of `T` will never run on this packet; optional
    /// subscribers are notified immediately.
    pub fn unsatisfiable<T: 'static>(&self) -> Result<(), EngineError> {
        let key = TypeKey::of::<T>();
        {
            let mut state = self.lock();
            let disposition = state
                .decorations
                .entry(key.clone())
                .or_insert_with(DecorationDisposition::new);
            disposition.mark_unsatisfiable(&key)?;
        }
        self.mark_unsatisfiable(&key);
        Ok(())
    }

    /// Appends a per-packet-only filter. If its required inputs are already
    /// satisfied at the time of addition the relevant counters are
    /// decremented immediately; if that makes it runnable, it is invoked
    /// before this call returns.
    pub fn add_recipient(&self, descriptor: Arc<FilterDescriptor>) -> Result<(), EngineError> {
        let mut ready = false;
        let index;
        {
            let mut state = self.lock();
            index = state.sat_counters.len();
            let mut counter = SatCounter::new(descriptor.clone());
            counter.reset();
            state.sat_counters.push(counter);

            for input in descriptor.inputs() {
                let disposition = state
                    .decorations
                    .entry(input.type_key.clone())
                    .or_insert_with(DecorationDisposition::new);
                match input.kind {
                    InputKind::Required => {
                        disposition.register_subscriber(index, true);
                        if disposition.is_satisfied() {
                            state.sat_counters[index].decrement(true);
                        }
                    }
                    InputKind::Optional => {
                        disposition.register_subscriber(index, false);
                        if disposition.is_satisfied() {
                            state.sat_counters[index].decrement(false);
                        }
                    }
                    InputKind::OutRef | InputKind::OutRefAutoReady => {
                        disposition.register_publisher(index, &input.type_key)?;
                    }
                }
            }

            if state.sat_counters[index].mark_called_if_ready() {
                ready = true;
            }
        }

        if ready {
            debug!(packet = self.id, filter = descriptor.name(), "recipient ready on add");
            descriptor.invoke(self);
        }
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        for sc in &mut state.sat_counters {
            sc.reset();
        }
        for d in state.decorations.values_mut() {
            d.reset();
        }
    }

    /// Called once when the packet is issued from the pool.
    pub(crate) fn initialize(&self) -> Result<(), EngineError> {
        let anchor = self.outstanding_remote.upgrade().ok_or(EngineError::ContainerExpired)?;
        *self.outstanding.lock().expect("anchor lock poisoned") = Some(anchor);

        let ready: Vec<usize> = {
            let mut state = self.lock();
            (0..state.sat_counters.len())
                .filter(|&i| state.sat_counters[i].mark_called_if_ready())
                .collect()
        };
        self.invoke_queue(&ready);

        self.update_satisfaction(&TypeKey::of::<AutoPacket>());
        Ok(())
    }

    /// Runs once, via [`Drop`], when the packet's last strong reference goes
    /// away: resolves remaining optionals, tears down per-packet recipients
    /// LIFO, and drops now-unused decoration slots.
    fn finalize(&self) {
        let mut queue = Vec::new();
        {
            let mut state = self.lock();
            let optional_subscribers: Vec<usize> = state
                .decorations
                .values()
                .flat_map(|d| d.subscribers.iter())
                .filter(|(_, required)| !required)
                .map(|(index, _)| *index)
                .collect();
            for index in optional_subscribers {
                if state.sat_counters[index].resolve() {
                    queue.push(index);
                }
            }
        }
        self.invoke_queue(&queue);

        {
            let mut state = self.lock();
            while state.sat_counters.len() > self.subscriber_num {
                let index = state.sat_counters.len() - 1;
                let descriptor = state.sat_counters[index].descriptor().clone();
                for input in descriptor.inputs() {
                    if let Some(disposition) = state.decorations.get_mut(&input.type_key) {
                        match input.kind {
                            InputKind::Required | InputKind::Optional => {
                                disposition.remove_subscriber_lifo(index);
                            }
                            InputKind::OutRef | InputKind::OutRefAutoReady => {
                                disposition.clear_publisher(index);
                            }
                        }
                    }
                }
                state.sat_counters.pop();
            }

            state.decorations.retain(|_, d| !d.subscribers.is_empty() || d.publisher.is_some());
        }

        *self.outstanding.lock().expect("anchor lock poisoned") = None;
        self.reset();
    }
}

impl Drop for AutoPacket {
    /// A packet's last strong reference going away is its end of life:
    /// resolve remaining optionals and tear down per-packet recipients
    /// before the decorations it holds are dropped.
    fn drop(&mut self) {
        self.finalize();
    }
}

/// RAII guard returned by [`AutoPacket::checkout`] / [`AutoPacket::checkout_with`].
/// Dropping without calling [`Self::ready`] is equivalent to `ready(false)`
/// (a forgotten checkout must not livelock downstream optionals).
pub struct PacketCheckout<'a, T> {
    packet: &'a AutoPacket,
    key: TypeKey,
    completed: bool,
    // The value itself already lives in the packet's disposition map; T is
    // carried only so the call site keeps its static type.
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T> PacketCheckout<'a, T> {
    pub fn ready(mut self, ready: bool) {
        self.completed = true;
        self.packet.complete_checkout(&self.key, ready);
    }
}

impl<'a, T> Drop for PacketCheckout<'a, T> {
    fn drop(&mut self) {
        if !self.completed {
            self.packet.complete_checkout(&self.key, false);
        }
    }
}

/// Builder for a `DecorateImmediate` pulse over one or more types.
pub struct ImmediateBatch<'a> {
    packet: &'a AutoPacket,
    items: Vec<(TypeKey, Arc<dyn Any + Send + Sync>)>,
}

impl<'a> ImmediateBatch<'a> {
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.items.push((TypeKey::of::<T>(), Arc::new(value)));
        self
    }

    /// Performs the satisfaction pulse, running non-deferred subscribers
    /// synchronously, then unconditionally retires every slot to
    /// unsatisfiable before returning.
    pub fn pulse(self) -> Result<(), EngineError> {
        self.packet.decorate_immediate_many(self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterInput;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn anchor() -> (Anchor, Weak<dyn Any + Send + Sync>) {
        let anchor: Anchor = Arc::new(());
        let weak = Arc::downgrade(&anchor);
        (anchor, weak)
    }

    fn test_permit() -> PooledEntity<()> {
        crate::pool::ObjectPool::new(|_id| (), |_v| ()).acquire().unwrap()
    }

    fn new_packet(filters: Vec<Arc<FilterDescriptor>>) -> (Anchor, AutoPacket) {
        let (anchor, weak) = anchor();
        let packet = AutoPacket::new(1, filters, None, weak, test_permit()).unwrap();
        (anchor, packet)
    }

    #[test]
    fn simple_chain_a_then_b() {
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_b = seen.clone();

        let a = FilterDescriptor::new(
            "A",
            vec![FilterInput::required(TypeKey::of::<i32>()), FilterInput::out_ref(TypeKey::of::<String>())],
            false,
            move |p| {
                let n: Arc<i32> = p.get::<i32>().unwrap();
                p.decorate::<String>(n.to_string()).unwrap();
            },
        );
        let b = FilterDescriptor::new(
            "B",
            vec![FilterInput::required(TypeKey::of::<String>())],
            false,
            move |p| {
                let s = p.get::<String>().unwrap();
                *seen_b.lock().unwrap() = (*s).clone();
            },
        );

        let (_anchor, packet) = new_packet(vec![a, b]);
        packet.initialize().unwrap();
        packet.decorate(7i32).unwrap();

        assert_eq!(*seen.lock().unwrap(), "7");
    }

    #[test]
    fn optional_resolves_at_finalize() {
        let ran = Arc::new(AtomicBool::new(false));
        let observed_bool = Arc::new(AtomicBool::new(true));
        let ran2 = ran.clone();
        let observed2 = observed_bool.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let c = FilterDescriptor::new(
            "C",
            vec![
                FilterInput::required(TypeKey::of::<i32>()),
                FilterInput::optional(TypeKey::of::<bool>()),
            ],
            false,
            move |p| {
                calls2.fetch_add(1, Ordering::SeqCst);
                ran2.store(true, Ordering::SeqCst);
                observed2.store(p.has::<bool>(), Ordering::SeqCst);
            },
        );

        let (_anchor, packet) = new_packet(vec![c]);
        packet.initialize().unwrap();
        packet.decorate(1i32).unwrap();
        packet.finalize();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "filter ran exactly once");
        assert!(ran.load(Ordering::SeqCst));
        assert!(!observed_bool.load(Ordering::SeqCst));
    }

    #[test]
    fn immediate_decoration_is_scope_bounded() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let d = FilterDescriptor::new(
            "D",
            vec![FilterInput::required(TypeKey::of::<i32>())],
            false,
            move |p| {
                let n = p.get::<i32>().unwrap();
                assert_eq!(*n, 5);
                count2.fetch_add(1, Ordering::SeqCst);
            },
        );

        let (_anchor, packet) = new_packet(vec![d]);
        packet.initialize().unwrap();
        packet.decorate_immediate().with(5i32).pulse().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!packet.has::<i32>());
    }

    #[test]
    fn unsatisfiable_propagates_to_optional_not_required() {
        let e_ran = Arc::new(AtomicBool::new(false));
        let f_ran = Arc::new(AtomicBool::new(false));
        let e_ran2 = e_ran.clone();
        let f_ran2 = f_ran.clone();

        let e = FilterDescriptor::new(
            "E",
            vec![FilterInput::required(TypeKey::of::<i32>())],
            false,
            move |_p| e_ran2.store(true, Ordering::SeqCst),
        );
        let f = FilterDescriptor::new(
            "F",
            vec![FilterInput::optional(TypeKey::of::<i32>())],
            false,
            move |_p| f_ran2.store(true, Ordering::SeqCst),
        );

        let (_anchor, packet) = new_packet(vec![e, f]);
        packet.initialize().unwrap();
        packet.unsatisfiable::<i32>().unwrap();

        assert!(f_ran.load(Ordering::SeqCst));
        assert!(!e_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn invoker_never_runs_twice() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let g = FilterDescriptor::new(
            "G",
            vec![FilterInput::required(TypeKey::of::<i32>())],
            false,
            move |_p| {
                calls2.fetch_add(1, Ordering::SeqCst);
            },
        );

        let (_anchor, packet) = new_packet(vec![g]);
        packet.initialize().unwrap();
        packet.decorate(1i32).unwrap();
        packet.finalize();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_required_input_filter_does_not_run_again_at_finalize() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let h = FilterDescriptor::new(
            "H",
            vec![FilterInput::optional(TypeKey::of::<bool>())],
            false,
            move |_p| {
                calls2.fetch_add(1, Ordering::SeqCst);
            },
        );

        let (_anchor, packet) = new_packet(vec![h]);
        packet.initialize().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "eagerly ready at initialize");
        packet.finalize();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "resolve() at finalize must not refire it");
    }

    #[test]
    fn zero_required_input_recipient_added_late_does_not_run_again_at_finalize() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let (_anchor, packet) = new_packet(vec![]);
        packet.initialize().unwrap();
        packet
            .add_recipient(FilterDescriptor::new(
                "late",
                vec![FilterInput::optional(TypeKey::of::<bool>())],
                false,
                move |_p| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                },
            ))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "eagerly ready on add");
        packet.finalize();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "resolve() at finalize must not refire it");
    }

    #[test]
    fn has_subscribers_ignores_bare_entries_from_unwired_decorate_calls() {
        let (_anchor, packet) = new_packet(vec![]);
        packet.initialize().unwrap();
        packet.decorate(5i32).unwrap();
        assert!(
            !packet.has_subscribers::<i32>(),
            "decorating a type nobody subscribes to must not count as having a subscriber"
        );
    }

    #[test]
    fn has_subscribers_is_true_for_a_wired_required_input() {
        let a = FilterDescriptor::new(
            "A",
            vec![FilterInput::required(TypeKey::of::<i32>())],
            false,
            |_p| {},
        );
        let (_anchor, packet) = new_packet(vec![a]);
        packet.initialize().unwrap();
        assert!(packet.has_subscribers::<i32>());
    }

    #[test]
    fn checkout_handle_rejects_an_empty_handle() {
        let (_anchor, packet) = new_packet(vec![]);
        packet.initialize().unwrap();
        let err = packet.checkout_handle::<i32>(None).unwrap_err();
        assert_eq!(err, EngineError::null_handle(&TypeKey::of::<i32>()));
        assert!(!packet.has::<i32>());
    }

    #[test]
    fn checkout_handle_accepts_a_caller_supplied_arc() {
        let a = FilterDescriptor::new(
            "A",
            vec![FilterInput::required(TypeKey::of::<i32>())],
            false,
            |_p| {},
        );
        let (_anchor, packet) = new_packet(vec![a]);
        packet.initialize().unwrap();
        packet.checkout_handle(Some(Arc::new(9i32))).unwrap().ready(true);
        assert_eq!(*packet.get::<i32>().unwrap(), 9);
    }

    #[test]
    fn finalize_round_trips_to_fresh_state() {
        let h = FilterDescriptor::new(
            "H",
            vec![FilterInput::required(TypeKey::of::<i32>())],
            false,
            |_p| {},
        );
        let (_anchor, packet) = new_packet(vec![h]);
        packet.initialize().unwrap();
        packet.decorate(1i32).unwrap();
        packet.finalize();

        assert!(!packet.has::<i32>());
        let state = packet.lock();
        assert!(state.decorations.is_empty() || state.decorations.values().all(|d| d.publisher.is_some()));
    }

    #[test]
    fn reentrant_decoration_from_inside_a_filter_does_not_deadlock() {
        let b_ran = Arc::new(AtomicBool::new(false));
        let b_ran2 = b_ran.clone();

        let a = FilterDescriptor::new(
            "A",
            vec![FilterInput::required(TypeKey::of::<i32>()), FilterInput::out_ref(TypeKey::of::<u64>())],
            false,
            |p| {
                let n = p.get::<i32>().unwrap();
                p.decorate::<u64>(*n as u64).unwrap();
            },
        );
        let b = FilterDescriptor::new(
            "B",
            vec![FilterInput::required(TypeKey::of::<u64>())],
            false,
            move |_p| b_ran2.store(true, Ordering::SeqCst),
        );

        let (_anchor, packet) = new_packet(vec![a, b]);
        packet.initialize().unwrap();
        packet.decorate(3i32).unwrap();

        assert!(b_ran.load(Ordering::SeqCst));
    }
}
