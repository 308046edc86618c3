use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an OS instance.
///
/// ```text
/// Initial <-> Loading
/// Initial -> Booting -> Booted -> Ready -> Running
///            (Booting..Running) -> Failed | Hungup
///            (Booting..Running, Failed, Hungup) -> Shutdown -> Stopped -> Initial
/// ```
///
/// Booting, Booted and Ready may be skipped forward when the guest reports
/// several steps between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsStatus {
    Initial,
    /// A single-writer operation (allocate, load, kernel args) is in flight.
    Loading,
    /// Wake sequence issued, guest has not reported yet.
    Booting,
    Booted,
    Ready,
    Running,
    Shutdown,
    Stopped,
    /// Guest reported a panic.
    Failed,
    /// Guest heartbeat stalled.
    Hungup,
}

impl OsStatus {
    /// Position along the boot path, for `Booting..=Running`.
    fn boot_rank(self) -> Option<u8> {
        match self {
            OsStatus::Booting => Some(0),
            OsStatus::Booted => Some(1),
            OsStatus::Ready => Some(2),
            OsStatus::Running => Some(3),
            _ => None,
        }
    }

    /// Booting, Booted, Ready or Running.
    pub fn on_boot_path(self) -> bool {
        self.boot_rank().is_some()
    }

    /// Whether the guest has been started and not yet shut down.
    pub fn is_booted(self) -> bool {
        self.boot_rank().is_some() || self.is_terminal()
    }

    /// Failed and Hungup. Only shutdown leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, OsStatus::Failed | OsStatus::Hungup)
    }

    /// True if `self` is `target` or further along the boot path.
    pub fn has_reached(self, target: OsStatus) -> bool {
        if self == target {
            return true;
        }
        match (self.boot_rank(), target.boot_rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    pub fn can_transition_to(self, next: OsStatus) -> bool {
        use OsStatus::*;
        match (self, next) {
            (Initial, Loading) | (Loading, Initial) => true,
            (Initial, Booting) => true,
            // boot aborted before any IPI was sent
            (Booting, Initial) => true,
            (from, to) if from.boot_rank().is_some() && to.boot_rank().is_some() => {
                from.boot_rank() < to.boot_rank()
            }
            (from, Failed | Hungup) => from.boot_rank().is_some(),
            (from, Shutdown) => from.is_booted(),
            (Shutdown, Stopped) => true,
            (Stopped, Initial) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OsStatus::Initial => "initial",
            OsStatus::Loading => "loading",
            OsStatus::Booting => "booting",
            OsStatus::Booted => "booted",
            OsStatus::Ready => "ready",
            OsStatus::Running => "running",
            OsStatus::Shutdown => "shutdown",
            OsStatus::Stopped => "stopped",
            OsStatus::Failed => "failed",
            OsStatus::Hungup => "hungup",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::OsStatus::{self, *};

    const ALL: [OsStatus; 10] = [
        Initial, Loading, Booting, Booted, Ready, Running, Shutdown, Stopped, Failed, Hungup,
    ];

    #[test]
    fn test_transition_table() {
        let allowed = [
            (Initial, Loading),
            (Loading, Initial),
            (Initial, Booting),
            (Booting, Initial),
            (Booting, Booted),
            (Booting, Ready),
            (Booting, Running),
            (Booted, Ready),
            (Booted, Running),
            (Ready, Running),
            (Booting, Failed),
            (Booted, Failed),
            (Ready, Failed),
            (Running, Failed),
            (Booting, Hungup),
            (Booted, Hungup),
            (Ready, Hungup),
            (Running, Hungup),
            (Booting, Shutdown),
            (Booted, Shutdown),
            (Ready, Shutdown),
            (Running, Shutdown),
            (Failed, Shutdown),
            (Hungup, Shutdown),
            (Shutdown, Stopped),
            (Stopped, Initial),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_has_reached() {
        assert!(Running.has_reached(Ready));
        assert!(Booted.has_reached(Booted));
        assert!(!Booted.has_reached(Running));
        assert!(!Failed.has_reached(Running));
        assert!(Initial.has_reached(Initial));
        assert!(!Stopped.has_reached(Initial));
    }

    #[test]
    fn test_boot_path() {
        assert!(Booting.on_boot_path() && Running.on_boot_path());
        assert!(!Failed.on_boot_path());
        assert!(!Shutdown.on_boot_path());
    }

    #[test]
    fn test_display() {
        assert_eq!(Hungup.to_string(), "hungup");
    }
}
