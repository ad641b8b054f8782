// vim: tw=80
//! Per-zone bookkeeping kept by a [`Channel`](crate::channel::Channel)

use crate::types::*;

/// Coarse state of a zone
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneState {
    /// Nothing has been written since the last reset
    Empty,
    /// Partially written, and this channel has been appending to it
    Open,
    /// Partially written, but not by this channel since it was discovered
    Closed,
    /// Written up to its capacity
    Full,
    /// Explicitly finished, no matter how much was written
    Finished,
}

/// Minimal description of one zone.
///
/// All addresses are logical.  The zone's state is not stored; it is always
/// derived by [`zone_state`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Zone {
    /// First block of the zone
    pub slba: LbaT,
    /// Write pointer
    pub wp: LbaT,
    /// Usable blocks
    pub zone_cap: LbaT,
    /// Set by a finish operation, cleared by a reset
    pub finished: bool,
    /// This channel has appended to the zone since it was discovered
    pub appended: bool,
}

impl Zone {
    /// One past the zone's last usable block
    pub fn end(&self) -> LbaT {
        self.slba + self.zone_cap
    }

    /// How many more blocks may be appended
    pub fn lbas_left(&self) -> LbaT {
        if self.finished {
            0
        } else {
            self.end().saturating_sub(self.wp)
        }
    }

    pub fn state(&self) -> ZoneState {
        zone_state(self)
    }
}

/// Derive a zone's state from its write pointer and flags.
pub fn zone_state(zone: &Zone) -> ZoneState {
    if zone.finished {
        ZoneState::Finished
    } else if zone.wp <= zone.slba {
        ZoneState::Empty
    } else if zone.wp >= zone.end() {
        ZoneState::Full
    } else if zone.appended {
        ZoneState::Open
    } else {
        ZoneState::Closed
    }
}

// LCOV_EXCL_STOP
