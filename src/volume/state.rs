//! Volume Status and Transition Table
//!
//! The table below is the single source of truth for which status changes
//! the volume manager may perform.

use serde::{Deserialize, Serialize};

/// Volume lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Attaching,
    Detaching,
    Deleting,
    Extending,
    Retyping,
    BackingUp,
    Restoring,
    Error,
    Deleted,
}

impl VolumeStatus {
    /// All statuses, in declaration order
    pub const ALL: [VolumeStatus; 12] = [
        VolumeStatus::Creating,
        VolumeStatus::Available,
        VolumeStatus::InUse,
        VolumeStatus::Attaching,
        VolumeStatus::Detaching,
        VolumeStatus::Deleting,
        VolumeStatus::Extending,
        VolumeStatus::Retyping,
        VolumeStatus::BackingUp,
        VolumeStatus::Restoring,
        VolumeStatus::Error,
        VolumeStatus::Deleted,
    ];

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: VolumeStatus) -> bool {
        use VolumeStatus::*;
        matches!(
            (self, next),
            (Creating, Available | Error)
                | (
                    Available,
                    Attaching | Deleting | Extending | Retyping | BackingUp | Restoring
                )
                | (InUse, Attaching | Detaching | BackingUp)
                | (Attaching, InUse | Available | Error)
                | (Detaching, Available | InUse | Error)
                | (Deleting, Deleted | Available | Error)
                | (Extending | Retyping | Restoring, Available | Error)
                | (BackingUp, Available | InUse | Error)
                | (Error, Deleting | Available | InUse | Deleted)
        )
    }

    /// An operation is in flight while the volume sits in this status
    pub fn is_transitional(self) -> bool {
        use VolumeStatus::*;
        matches!(
            self,
            Creating | Attaching | Detaching | Deleting | Extending | Retyping | BackingUp | Restoring
        )
    }

    /// No further transitions exist
    pub fn is_terminal(self) -> bool {
        self == VolumeStatus::Deleted
    }

    /// Stable states a failed operation can revert to
    pub fn is_stable(self) -> bool {
        matches!(self, VolumeStatus::Available | VolumeStatus::InUse)
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Extending => "extending",
            VolumeStatus::Retyping => "retyping",
            VolumeStatus::BackingUp => "backing-up",
            VolumeStatus::Restoring => "restoring",
            VolumeStatus::Error => "error",
            VolumeStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VolumeStatus::*;

    #[test]
    fn test_deleted_is_terminal() {
        for next in VolumeStatus::ALL {
            assert!(!Deleted.can_transition_to(next));
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(Creating.can_transition_to(Available));
        assert!(Available.can_transition_to(Attaching));
        assert!(Attaching.can_transition_to(InUse));
        assert!(InUse.can_transition_to(Detaching));
        assert!(Detaching.can_transition_to(Available));
        assert!(Available.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!Available.can_transition_to(InUse));
        assert!(!InUse.can_transition_to(Available));
        assert!(!InUse.can_transition_to(Deleting));
        assert!(!InUse.can_transition_to(Extending));
        assert!(!Creating.can_transition_to(Deleting));
        assert!(!Available.can_transition_to(Deleted));
        assert!(!Error.can_transition_to(Extending));
    }

    #[test]
    fn test_transitional_states_never_stable() {
        for s in VolumeStatus::ALL {
            assert!(!(s.is_transitional() && s.is_stable()), "{} both", s);
        }
    }

    #[test]
    fn test_display_matches_serde() {
        for s in VolumeStatus::ALL {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json.trim_matches('"'), s.to_string());
        }
    }
}
