//! Engine-side domain state: which pipettes are loaded, where they are and
//! what they hold. Only ever changed through [`StateUpdate`]s carried by
//! actions.

use std::collections::HashMap;

use pipette_shared::{
    ErrorRecoveryType, Mount, StateUpdate, TipGeometry, WellLocation,
    state_update::AspiratedFluid,
};
use serde::Serialize;

use crate::actions::Action;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedPipette {
    pub pipette_id: String,
    pub pipette_name: String,
    pub mount: Mount,
    pub attached_tip: Option<TipGeometry>,
    /// `None` when no tip is attached, since volume is only tracked per tip.
    pub aspirated_volume: Option<f64>,
    pub location: Option<WellLocation>,
}

#[derive(Debug, Clone, Default)]
pub struct PipetteState {
    pipettes: HashMap<String, LoadedPipette>,
}

impl PipetteState {
    pub(crate) fn handle_action(&mut self, action: &Action) {
        match action {
            Action::SucceedCommand(a) => self.apply(&a.state_update),
            Action::FailCommand(a) => {
                self.apply(&a.error.state_update);
                if a.recovery_type == ErrorRecoveryType::AssumeFalsePositiveAndContinue {
                    self.apply(&a.error.state_update_if_false_positive);
                }
            }
            Action::ResumeFromRecovery(a) => self.apply(&a.state_update),
            _ => {}
        }
    }

    fn apply(&mut self, update: &StateUpdate) {
        if let Some(loaded) = &update.loaded_pipette {
            self.pipettes.insert(
                loaded.pipette_id.clone(),
                LoadedPipette {
                    pipette_id: loaded.pipette_id.clone(),
                    pipette_name: loaded.pipette_name.clone(),
                    mount: loaded.mount,
                    attached_tip: None,
                    aspirated_volume: None,
                    location: None,
                },
            );
        }
        if let Some(location) = &update.pipette_location {
            if let Some(pipette) = self.pipette_mut(&location.pipette_id) {
                pipette.location = location.location.clone();
            }
        }
        if let Some(tip_state) = &update.pipette_tip_state {
            if let Some(pipette) = self.pipette_mut(&tip_state.pipette_id) {
                pipette.attached_tip = tip_state.tip;
                pipette.aspirated_volume = tip_state.tip.map(|_| 0.0);
            }
        }
        if let Some(fluid) = &update.pipette_aspirated_fluid {
            if let Some(pipette) = self.pipette_mut(&fluid.pipette_id) {
                // Volume is tracked per tip; without one there is nothing to hold it.
                let Some(current) = pipette.aspirated_volume else {
                    return;
                };
                pipette.aspirated_volume = Some(match fluid.fluid {
                    AspiratedFluid::Aspirated(volume) => current + volume,
                    AspiratedFluid::Dispensed(volume) => (current - volume).max(0.0),
                    AspiratedFluid::Empty => 0.0,
                });
            }
        }
    }

    fn pipette_mut(&mut self, pipette_id: &str) -> Option<&mut LoadedPipette> {
        let pipette = self.pipettes.get_mut(pipette_id);
        if pipette.is_none() {
            tracing::warn!(pipette_id, "state update refers to a pipette that was never loaded");
        }
        pipette
    }

    pub fn get(&self, pipette_id: &str) -> Option<&LoadedPipette> {
        self.pipettes.get(pipette_id)
    }

    pub fn get_by_mount(&self, mount: Mount) -> Option<&LoadedPipette> {
        self.pipettes.values().find(|pipette| pipette.mount == mount)
    }

    pub fn has_tip(&self, pipette_id: &str) -> bool {
        self.get(pipette_id).is_some_and(|pipette| pipette.attached_tip.is_some())
    }

    pub fn aspirated_volume(&self, pipette_id: &str) -> Option<f64> {
        self.get(pipette_id).and_then(|pipette| pipette.aspirated_volume)
    }

    pub fn all(&self) -> impl Iterator<Item = &LoadedPipette> {
        self.pipettes.values()
    }
}
