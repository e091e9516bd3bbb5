//! Free-running local oscillator.
//!
//! Always selectable as a last resort: it advertises this host's own clock
//! as a freerunning grandmaster and never raises protocol alarms.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::domain::grandmaster::{ClockClass, ClockIdentity, TimeSource};
use crate::domain::state::SyncState;
use crate::runtime::ThreadCtx;

use super::{ModuleCore, SyncError, SyncServicer};

#[derive(Debug, Default)]
pub struct FreerunServicer;

impl FreerunServicer {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stable identity for the local oscillator derived from the instance name.
fn local_clock_identity(name: &str) -> ClockIdentity {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    ClockIdentity::from_u64(hasher.finish())
}

impl SyncServicer for FreerunServicer {
    fn startup(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) -> Result<(), SyncError> {
        let gm = &mut core.status.grandmaster;
        gm.clock_id = local_clock_identity(&core.name);
        gm.remote = false;
        gm.clock_class = ClockClass::Freerunning;
        gm.time_source = TimeSource::InternalOscillator;
        gm.accuracy_ns = f64::INFINITY;
        gm.allan_variance = f64::INFINITY;
        gm.steps_removed = 0;
        core.status.state = SyncState::Master;
        Ok(())
    }

    fn tick(&mut self, core: &mut ModuleCore, _ctx: &mut ThreadCtx) {
        core.note_tick_success();
    }
}
