use std::os::fd::RawFd;

/// Error surface for waiter arming operations.
///
/// Invariant violations (arming a released waiter, double-arming the heap)
/// are program defects and panic instead; already-removed entries are benign
/// no-ops and never reach this type.
#[derive(thiserror::Error, Debug)]
pub enum WaiterError {
    /// The OS multiplexer rejected the registration. The waiter stays
    /// unarmed for the fd; any timeout it carries is untouched.
    #[error("multiplexer rejected fd {fd}: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: nix::Error,
    },

    /// A poll request was issued before a watched fd was assigned.
    #[error("no watched fd assigned")]
    NoFd,
}
