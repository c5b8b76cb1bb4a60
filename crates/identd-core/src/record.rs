//! Identity records and the values that address them.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Interface sentinel meaning "any interface".
///
/// Records stored under this interface are consulted only when the queried
/// interface has no partition of its own.
pub const WILDCARD_INTERFACE: &str = "0.0.0.0";

/// Multiplier used to fold a port pair into a single scalar key.
///
/// Must exceed the largest port (65535) so that distinct pairs never collide.
pub const KEY_BASE: u64 = 100_000;

// ============================================================================
// Port Pair
// ============================================================================

/// A (local port, remote port) pair as seen from this host.
///
/// Ordering is always local-then-remote, regardless of the order a wire
/// protocol sends them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub const fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }

    /// Folds the pair into a scalar key: `local * KEY_BASE + remote`.
    ///
    /// Injective over the full `u16` range of both components.
    #[must_use]
    pub fn key(&self) -> u64 {
        u64::from(self.local) * KEY_BASE + u64::from(self.remote)
    }

    /// Recovers the pair from a key produced by [`PortPair::key`].
    ///
    /// Returns `None` for keys no valid pair could have produced.
    pub fn from_key(key: u64) -> Option<Self> {
        let local = u16::try_from(key / KEY_BASE).ok()?;
        let remote = u16::try_from(key % KEY_BASE).ok()?;
        Some(Self { local, remote })
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.local, self.remote)
    }
}

// ============================================================================
// App ID
// ============================================================================

/// Opaque tag naming the controller application that created a record.
///
/// Controllers that never announce themselves share the default tag `"1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppId(String);

impl AppId {
    /// Tag used by control connections that have not sent `id`.
    pub const DEFAULT: &'static str = "1";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Identity Record
// ============================================================================

/// One registered ownership claim for a port pair on an interface.
///
/// Uniquely addressed by `(interface, ports)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub ports: PortPair,

    /// IP address literal, or [`WILDCARD_INTERFACE`].
    pub interface: String,

    /// Identity reported to ident queries.
    pub username: String,

    pub app_id: AppId,

    /// When the record was inserted. Reported in removal logs.
    pub registered_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn new(
        ports: PortPair,
        interface: impl Into<String>,
        username: impl Into<String>,
        app_id: AppId,
    ) -> Self {
        Self {
            ports,
            interface: interface.into(),
            username: username.into(),
            app_id,
            registered_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> u64 {
        self.ports.key()
    }

    pub fn local_port(&self) -> u16 {
        self.ports.local
    }

    pub fn remote_port(&self) -> u16 {
        self.ports.remote
    }

    /// Time since the record was inserted, as of `now`.
    ///
    /// Clamped at zero if the clock stepped backwards.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.registered_at).max(Duration::zero())
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }
}
