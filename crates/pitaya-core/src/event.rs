//! Lifecycle events and the handler registry.
//!
//! The dispatcher does not invoke anything. [`EventDispatcher::route`]
//! resolves, at the moment an event is emitted, which handlers should receive
//! it. The driver appends the resulting `(handler, event)` pairs to a single
//! ordered delivery queue, which gives two guarantees:
//!
//! - a handler sees events in the order the state machine emitted them
//! - a handler registered after an event was emitted never sees that event
//!
//! Handlers registered with [`EventDispatcher::add_route`] only receive
//! pushes on one route.

use std::{collections::BTreeMap, fmt};

use crate::error::HandlerError;

/// Upper bound on concurrently registered handlers per client.
pub const MAX_HANDLERS: usize = 1024;

/// Event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventKind {
    /// Session established
    Connected = 0,
    /// A connect attempt failed and a retry follows
    ConnectError = 1,
    /// Connecting gave up; the client is back in `Inited`
    ConnectFailed = 2,
    /// Caller-initiated disconnect completed
    Disconnect = 3,
    /// Server closed the session
    KickedByServer = 4,
    /// Transport dropped or heartbeats stopped
    UnexpectedDisconnect = 5,
    /// A reconnect attempt was scheduled
    ReconnectStarted = 6,
    /// Server push on a route
    UserDefinedPush = 7,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Connected,
        Self::ConnectError,
        Self::ConnectFailed,
        Self::Disconnect,
        Self::KickedByServer,
        Self::UnexpectedDisconnect,
        Self::ReconnectStarted,
        Self::UserDefinedPush,
    ];

    fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

/// Event delivered to handlers.
///
/// `primary`/`secondary` carry the kind-specific details, e.g.
/// `ConnectFailed` carries the reason in `primary` and no `secondary`;
/// `UserDefinedPush` carries the route and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event type
    pub kind: EventKind,
    /// First detail (reason, route)
    pub primary: Option<String>,
    /// Second detail (push body)
    pub secondary: Option<String>,
}

impl Event {
    /// Event without details.
    pub fn new(kind: EventKind) -> Self {
        Self { kind, primary: None, secondary: None }
    }

    /// Event with a single detail.
    pub fn with_reason(kind: EventKind, reason: impl Into<String>) -> Self {
        Self { kind, primary: Some(reason.into()), secondary: None }
    }

    /// Server push.
    pub fn push(route: impl Into<String>, body: &[u8]) -> Self {
        Self {
            kind: EventKind::UserDefinedPush,
            primary: Some(route.into()),
            secondary: Some(String::from_utf8_lossy(body).into_owned()),
        }
    }
}

/// Set of event kinds a handler is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventFilter(u16);

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl EventFilter {
    /// Every kind.
    pub fn all() -> Self {
        Self(EventKind::ALL.iter().fold(0, |acc, kind| acc | kind.bit()))
    }

    /// No kind.
    pub fn none() -> Self {
        Self(0)
    }

    /// Exactly the given kinds.
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        kinds.into_iter().fold(Self::none(), Self::with)
    }

    /// This filter plus `kind`.
    #[must_use]
    pub fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Whether `kind` passes the filter.
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl FromIterator<EventKind> for EventFilter {
    fn from_iter<T: IntoIterator<Item = EventKind>>(iter: T) -> Self {
        Self::only(iter)
    }
}

/// Registered handler id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl HandlerId {
    /// Sentinel never assigned to a handler.
    pub const INVALID: Self = Self(0);
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Registration<H> {
    filter: EventFilter,
    route: Option<String>,
    handler: H,
}

impl<H> Registration<H> {
    fn wants(&self, event: &Event) -> bool {
        self.filter.contains(event.kind)
            && self.route.as_deref().is_none_or(|route| event.primary.as_deref() == Some(route))
    }
}

/// Handler registry.
///
/// Generic over the handler representation so the driver decides how
/// delivery happens (callback slot, channel sender).
///
/// # Invariants
///
/// - Ids are unique for the lifetime of the dispatcher; removed ids are
///   never reissued
/// - Iteration order is registration order
#[derive(Debug)]
pub struct EventDispatcher<H> {
    handlers: BTreeMap<HandlerId, Registration<H>>,
    next_id: u32,
    capacity: usize,
}

impl<H> Default for EventDispatcher<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> EventDispatcher<H> {
    /// Empty registry with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_HANDLERS)
    }

    /// Empty registry holding at most `capacity` handlers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { handlers: BTreeMap::new(), next_id: 1, capacity }
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// - `HandlerError::Exhausted` if the table is full or ids ran out
    pub fn add(&mut self, filter: EventFilter, handler: H) -> Result<HandlerId, HandlerError> {
        self.insert(Registration { filter, route: None, handler })
    }

    /// Register a handler for pushes on `route` only.
    ///
    /// # Errors
    ///
    /// - `HandlerError::Exhausted` if the table is full or ids ran out
    pub fn add_route(
        &mut self,
        route: impl Into<String>,
        handler: H,
    ) -> Result<HandlerId, HandlerError> {
        self.insert(Registration {
            filter: EventFilter::only([EventKind::UserDefinedPush]),
            route: Some(route.into()),
            handler,
        })
    }

    /// Unregister every handler added with [`EventDispatcher::add_route`]
    /// for `route`, in registration order.
    pub fn remove_route(&mut self, route: &str) -> Vec<(HandlerId, H)> {
        let ids: Vec<HandlerId> = self
            .handlers
            .iter()
            .filter(|(_, r)| r.route.as_deref() == Some(route))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.handlers.remove(&id).map(|r| (id, r.handler)))
            .collect()
    }

    /// Unregister a handler, returning it.
    ///
    /// # Errors
    ///
    /// - `HandlerError::NotFound` if `id` is unknown or already removed
    pub fn remove(&mut self, id: HandlerId) -> Result<H, HandlerError> {
        self.handlers.remove(&id).map(|r| r.handler).ok_or(HandlerError::NotFound { id })
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Remove every handler.
    pub fn clear(&mut self) -> Vec<H> {
        std::mem::take(&mut self.handlers).into_values().map(|r| r.handler).collect()
    }

    fn insert(&mut self, registration: Registration<H>) -> Result<HandlerId, HandlerError> {
        if self.handlers.len() >= self.capacity || self.next_id == u32::MAX {
            return Err(HandlerError::Exhausted);
        }

        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.insert(id, registration);

        Ok(id)
    }
}

impl<H: Clone> EventDispatcher<H> {
    /// Handlers that should receive `event`, in registration order.
    pub fn route(&self, event: &Event) -> Vec<(HandlerId, H)> {
        self.handlers
            .iter()
            .filter(|(_, r)| r.wants(event))
            .map(|(id, r)| (*id, r.handler.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_never_invalid() {
        let mut dispatcher = EventDispatcher::new();
        let a = dispatcher.add(EventFilter::all(), "a").unwrap();
        let b = dispatcher.add(EventFilter::all(), "b").unwrap();

        assert_ne!(a, b);
        assert_ne!(a, HandlerId::INVALID);
        assert_ne!(b, HandlerId::INVALID);
    }

    #[test]
    fn remove_twice_reports_not_found() {
        let mut dispatcher = EventDispatcher::new();
        let id = dispatcher.add(EventFilter::all(), ()).unwrap();

        assert_eq!(dispatcher.remove(id), Ok(()));
        assert_eq!(dispatcher.remove(id), Err(HandlerError::NotFound { id }));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn removed_ids_are_not_reissued() {
        let mut dispatcher = EventDispatcher::new();
        let first = dispatcher.add(EventFilter::all(), ()).unwrap();
        dispatcher.remove(first).unwrap();
        let second = dispatcher.add(EventFilter::all(), ()).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn route_respects_filter_and_order() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add(EventFilter::only([EventKind::Disconnect]), "disconnect-only").unwrap();
        dispatcher.add(EventFilter::all(), "all").unwrap();
        dispatcher.add(EventFilter::only([EventKind::Connected]), "connected-only").unwrap();

        let routed: Vec<_> = dispatcher
            .route(&Event::new(EventKind::Connected))
            .into_iter()
            .map(|(_, h)| h)
            .collect();

        assert_eq!(routed, vec!["all", "connected-only"]);
    }

    #[test]
    fn route_handlers_only_see_their_pushes() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_route("room.news", "news").unwrap();
        dispatcher.add_route("room.chat", "chat").unwrap();
        dispatcher.add(EventFilter::all(), "all").unwrap();

        let routed =
            |event: &Event| dispatcher.route(event).into_iter().map(|(_, h)| h).collect::<Vec<_>>();

        assert_eq!(routed(&Event::push("room.news", b"{}")), vec!["news", "all"]);
        assert_eq!(routed(&Event::push("room.other", b"{}")), vec!["all"]);
        assert_eq!(routed(&Event::with_reason(EventKind::ConnectFailed, "room.news")), vec!["all"]);
    }

    #[test]
    fn remove_route_drops_every_handler_on_the_route() {
        let mut dispatcher = EventDispatcher::new();
        let first = dispatcher.add_route("room.news", 1).unwrap();
        let other = dispatcher.add_route("room.chat", 2).unwrap();
        let second = dispatcher.add_route("room.news", 3).unwrap();

        assert_eq!(dispatcher.remove_route("room.news"), vec![(first, 1), (second, 3)]);
        assert!(dispatcher.remove_route("room.news").is_empty());
        assert!(dispatcher.contains(other));
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut dispatcher = EventDispatcher::with_capacity(2);
        dispatcher.add(EventFilter::all(), ()).unwrap();
        dispatcher.add(EventFilter::all(), ()).unwrap();

        assert_eq!(dispatcher.add(EventFilter::all(), ()), Err(HandlerError::Exhausted));
    }

    #[test]
    fn filter_membership() {
        let filter: EventFilter = [EventKind::Connected, EventKind::ConnectFailed].into_iter().collect();

        assert!(filter.contains(EventKind::Connected));
        assert!(filter.contains(EventKind::ConnectFailed));
        assert!(!filter.contains(EventKind::Disconnect));
        assert!(EventFilter::all().contains(EventKind::UserDefinedPush));
        assert!(!EventFilter::none().contains(EventKind::Connected));
    }

    #[test]
    fn push_body_is_lossy_text() {
        let event = Event::push("onChat", b"hello");
        assert_eq!(event.primary.as_deref(), Some("onChat"));
        assert_eq!(event.secondary.as_deref(), Some("hello"));
    }
}
