//! Contract with the remote-wake collaborator.
//!
//! The core only needs three questions answered about the machine that
//! exports the source tree; how it is woken (wake-on-LAN, a mount helper,
//! nothing at all) is somebody else's business.

use crate::errors::WolfsError;

pub trait Remote {
    /// Is the source reachable right now?
    fn is_online(&self) -> bool;

    /// Block until the source is reachable, or fail with
    /// [`WolfsError::Wakeup`] (which surfaces to the guest as `EIO`).
    fn make_available(&mut self) -> Result<(), WolfsError>;

    /// Is the source filesystem actually mounted where we expect it?
    fn is_mounted(&self) -> bool;
}

/// A source that lives on an always-reachable local path. The default for
/// plain directory-to-directory mirroring.
#[derive(Debug, Default)]
pub struct AlwaysOnline;

impl Remote for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn make_available(&mut self) -> Result<(), WolfsError> {
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Scripted remote for exercising offline behaviour.
    #[derive(Debug)]
    pub struct ScriptedRemote {
        pub online: bool,
        pub wakeable: bool,
    }

    impl ScriptedRemote {
        pub fn offline(wakeable: bool) -> Self {
            ScriptedRemote { online: false, wakeable }
        }
    }

    impl Remote for ScriptedRemote {
        fn is_online(&self) -> bool {
            self.online
        }

        fn make_available(&mut self) -> Result<(), WolfsError> {
            if self.wakeable {
                self.online = true;
                Ok(())
            } else {
                Err(WolfsError::Wakeup)
            }
        }

        fn is_mounted(&self) -> bool {
            self.online
        }
    }
}
