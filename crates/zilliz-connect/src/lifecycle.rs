//! Connection lifecycle within pool custody.
//!
//! Every pooled connection moves through
//! `Created -> Idle -> Borrowed -> {Idle | Discarded}`. Replacement and
//! overflow connections go from `Created` straight to `Borrowed`.
//! `Discarded` is terminal: the connection is dropped and never re-enqueued.

use std::time::{Duration, Instant};

/// Connection state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opened and validated, not yet handed out or enqueued.
    Created,
    /// Waiting in the idle queue.
    Idle,
    /// Held by exactly one borrower.
    Borrowed,
    /// Failed a probe or had no room in the idle queue; dropped.
    Discarded,
}

impl ConnectionState {
    /// Check if the connection is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the connection is currently held by a borrower.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Borrowed)
    }

    /// Check if the connection has left pool custody for good.
    #[must_use]
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::Discarded)
    }

    /// Check whether moving to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Idle)
                | (Self::Created, Self::Borrowed)
                | (Self::Created, Self::Discarded)
                | (Self::Idle, Self::Borrowed)
                | (Self::Idle, Self::Discarded)
                | (Self::Borrowed, Self::Idle)
                | (Self::Borrowed, Self::Discarded)
        )
    }
}

/// Why a connection was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// Created while warming the pool up.
    Initial,
    /// Created to replace an idle connection that failed its probe.
    Replacement,
    /// Created because no idle connection showed up in time.
    Overflow,
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier within the pool.
    pub id: u64,
    /// Why the connection was created.
    pub origin: ConnectionOrigin,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or in.
    pub last_used_at: Instant,
    /// When the connection last passed a probe.
    pub last_checked_at: Option<Instant>,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
    /// Current state of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    /// Create metadata for a freshly validated connection.
    pub fn new(id: u64, origin: ConnectionOrigin) -> Self {
        let now = Instant::now();
        Self {
            id,
            origin,
            created_at: now,
            last_used_at: now,
            last_checked_at: Some(now),
            checkout_count: 0,
            state: ConnectionState::Created,
        }
    }

    /// Time since the connection was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check if the connection was created beyond the pool capacity.
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.origin == ConnectionOrigin::Overflow
    }

    /// Mark the connection as handed to a borrower.
    pub fn mark_checkout(&mut self) {
        self.transition(ConnectionState::Borrowed);
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
    }

    /// Mark the connection as back in the idle queue.
    pub fn mark_checkin(&mut self) {
        self.transition(ConnectionState::Idle);
        self.last_used_at = Instant::now();
    }

    /// Mark the connection as having passed a probe.
    pub fn mark_health_check(&mut self) {
        self.last_checked_at = Some(Instant::now());
    }

    /// Mark the connection as dropped from the pool.
    pub fn mark_discarded(&mut self) {
        self.transition(ConnectionState::Discarded);
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal connection transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}
