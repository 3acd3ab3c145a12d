// ============================================================================
// Transaction State
// ============================================================================
//
// The lifecycle enums shared by both the blocking and cooperative
// transaction facades, plus the per-transaction lock/attribution token.
//
// State transitions:
// ```text
// Pending ──prepare──> Active ──stage──> Staged ──commit──> Committed
//                         │                 │
//                         └─────────────────┴──rollback──> RolledBack
// ```
//
// ============================================================================

use std::fmt;

use uuid::Uuid;

/// Policy for when the state machine performs commit at scope exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Always commit at scope exit, even when a parent is present.
    Eager,
    /// Commit at scope exit unless a parent claims responsibility.
    Lazy,
    /// Never commit on a clean exit; roll back instead.
    Off,
}

/// READ_COMMITTED performs no locking and only short-circuits on an existing
/// record; SERIALIZABLE asks the store for an exclusive per-key lock for the
/// lifetime of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

/// Lifecycle state of a single transaction.
///
/// State advances monotonically; once [`TransactionState::Committed`] or
/// [`TransactionState::RolledBack`] is reached, further `commit`/`rollback`
/// calls are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Active,
    Staged,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Transaction is in one of the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, Self::Staged)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Staged => write!(f, "STAGED"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Per-transaction identity token presented to the result store for lock
/// ownership and read/write attribution. Freshly generated for the lifetime
/// of one transaction; never reused, even across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Holder(Uuid);

impl Holder {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Holder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
