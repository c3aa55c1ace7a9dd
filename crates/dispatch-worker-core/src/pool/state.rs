use core::fmt;

/// Lifecycle of a [`WorkerPoolManager`].
///
/// `New → Starting → Running → Stopping → Terminated`. Targets can only be
/// added or removed while `Starting`, `Running` or `Stopping`.
///
/// [`WorkerPoolManager`]: super::WorkerPoolManager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl State {
    /// Whether membership changes are accepted in this state.
    pub const fn accepts_targets(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}
