//! Transaction identity, kinds and states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing transaction identity.
///
/// Assigned once by the transaction manager; the first id is 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Kind of a transaction.
///
/// Each kind is a fixed combination of the auto-commit, auto-rollback,
/// read-only and exclusivity flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Explicitly controlled, may write
    UserExclusive,
    /// Explicitly controlled, read-only
    UserReadonly,
    /// Wraps a single statement, may write
    UserImplicitExclusive,
    /// Wraps a single statement, read-only
    UserImplicitReadonly,
    /// Opened by background services, may write
    SystemExclusive,
    /// Opened by background services, read-only
    SystemReadonly,
}

impl TransactionType {
    /// Commits automatically once its execution succeeds
    pub fn auto_commit(&self) -> bool {
        matches!(
            self,
            Self::UserImplicitExclusive | Self::UserImplicitReadonly
        )
    }

    /// Rolls back automatically once its execution fails
    pub fn auto_rollback(&self) -> bool {
        self.auto_commit()
    }

    pub fn read_only(&self) -> bool {
        matches!(
            self,
            Self::UserReadonly | Self::UserImplicitReadonly | Self::SystemReadonly
        )
    }

    /// May acquire exclusive grants and write
    pub fn exclusive(&self) -> bool {
        !self.read_only()
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::SystemExclusive | Self::SystemReadonly)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserExclusive => "USER_EXCLUSIVE",
            Self::UserReadonly => "USER_READONLY",
            Self::UserImplicitExclusive => "USER_IMPLICIT_EXCLUSIVE",
            Self::UserImplicitReadonly => "USER_IMPLICIT_READONLY",
            Self::SystemExclusive => "SYSTEM_EXCLUSIVE",
            Self::SystemReadonly => "SYSTEM_READONLY",
        };
        f.write_str(s)
    }
}

/// State of a transaction
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Idle,
    Running,
    Error,
    Finalizing,
    Commit,
    Rollback,
}

impl TransactionStatus {
    pub fn can_execute(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }

    pub fn can_commit(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn can_rollback(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Finalizing => "FINALIZING",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_table() {
        use TransactionStatus::*;
        let table = [
            (Idle, true, true, true),
            (Running, true, false, false),
            (Error, false, false, true),
            (Finalizing, false, false, false),
            (Commit, false, false, false),
            (Rollback, false, false, false),
        ];
        for (state, execute, commit, rollback) in table {
            assert_eq!(state.can_execute(), execute, "{} execute", state);
            assert_eq!(state.can_commit(), commit, "{} commit", state);
            assert_eq!(state.can_rollback(), rollback, "{} rollback", state);
        }
    }

    #[test]
    fn test_kind_flags() {
        assert!(TransactionType::UserImplicitReadonly.auto_commit());
        assert!(TransactionType::UserImplicitReadonly.read_only());
        assert!(!TransactionType::UserExclusive.auto_commit());
        assert!(TransactionType::SystemExclusive.exclusive());
        assert!(TransactionType::SystemReadonly.is_system());
        assert!(!TransactionType::UserReadonly.is_system());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(TransactionId::new(7).to_string(), "tx-7");
        assert!(TransactionId::new(1) < TransactionId::new(2));
    }
}
