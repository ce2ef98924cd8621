// src/hardware/mod.rs - Simulated robot hardware and its state cache
pub mod executor;

pub use executor::SimulatedExecutor;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pipette_shared::state_update::AspiratedFluid;
use pipette_shared::{
    CacheInconsistencyError, HardwareStateCache, Mount, StateUpdate, TipGeometry, WellLocation,
};

/// What the hardware layer believes about one attached pipette.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwarePipette {
    pub pipette_id: String,
    pub pipette_name: String,
    pub mount: Mount,
    pub tip: Option<TipGeometry>,
    /// Microliters held in the attached tip.
    pub volume: f64,
    pub location: Option<WellLocation>,
}

#[derive(Debug, Default)]
struct HardwareState {
    homed: bool,
    pipettes: HashMap<String, HardwarePipette>,
}

/// In-memory stand-in for the robot's hardware API.
///
/// Like the real hardware layer it caches per-pipette context (tips,
/// volumes, position) between commands.
#[derive(Debug, Default)]
pub struct SimulatedHardware {
    state: Mutex<HardwareState>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_homed(&self) -> bool {
        self.lock().homed
    }

    pub fn set_homed(&self, homed: bool) {
        self.lock().homed = homed;
    }

    pub fn pipette(&self, pipette_id: &str) -> Option<HardwarePipette> {
        self.lock().pipettes.get(pipette_id).cloned()
    }

    pub fn pipette_on(&self, mount: Mount) -> Option<HardwarePipette> {
        self.lock().pipettes.values().find(|p| p.mount == mount).cloned()
    }

    pub fn has_tip(&self, pipette_id: &str) -> bool {
        self.pipette(pipette_id).is_some_and(|p| p.tip.is_some())
    }

    fn lock(&self) -> MutexGuard<'_, HardwareState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HardwareStateCache for SimulatedHardware {
    /// Applies every set field, or none of them if any is inconsistent.
    fn apply_state_update(&self, update: &StateUpdate) -> Result<(), CacheInconsistencyError> {
        let mut state = self.lock();

        if let Some(loaded) = &update.loaded_pipette {
            let occupant = state
                .pipettes
                .values()
                .find(|p| p.mount == loaded.mount && p.pipette_id != loaded.pipette_id);
            if let Some(occupant) = occupant {
                return Err(CacheInconsistencyError::MountOccupied {
                    mount: loaded.mount,
                    pipette_id: occupant.pipette_id.clone(),
                });
            }
        }
        let loading = update.loaded_pipette.as_ref().map(|l| l.pipette_id.as_str());
        let referenced = [
            update.pipette_location.as_ref().map(|u| u.pipette_id.as_str()),
            update.pipette_tip_state.as_ref().map(|u| u.pipette_id.as_str()),
            update.pipette_aspirated_fluid.as_ref().map(|u| u.pipette_id.as_str()),
        ];
        for pipette_id in referenced.into_iter().flatten() {
            if Some(pipette_id) != loading && !state.pipettes.contains_key(pipette_id) {
                return Err(CacheInconsistencyError::UnknownPipette(pipette_id.to_string()));
            }
        }

        if let Some(loaded) = &update.loaded_pipette {
            state.pipettes.insert(
                loaded.pipette_id.clone(),
                HardwarePipette {
                    pipette_id: loaded.pipette_id.clone(),
                    pipette_name: loaded.pipette_name.clone(),
                    mount: loaded.mount,
                    tip: None,
                    volume: 0.0,
                    location: None,
                },
            );
        }
        if let Some(u) = &update.pipette_location {
            if let Some(pipette) = state.pipettes.get_mut(&u.pipette_id) {
                pipette.location = u.location.clone();
            }
        }
        if let Some(u) = &update.pipette_tip_state {
            if let Some(pipette) = state.pipettes.get_mut(&u.pipette_id) {
                pipette.tip = u.tip;
                pipette.volume = 0.0;
            }
        }
        if let Some(u) = &update.pipette_aspirated_fluid {
            if let Some(pipette) = state.pipettes.get_mut(&u.pipette_id) {
                pipette.volume = match u.fluid {
                    AspiratedFluid::Aspirated(volume) => pipette.volume + volume,
                    AspiratedFluid::Dispensed(volume) => (pipette.volume - volume).max(0.0),
                    AspiratedFluid::Empty => 0.0,
                };
            }
        }
        Ok(())
    }
}
