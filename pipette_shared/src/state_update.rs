//! Sparse patches of domain state.
//!
//! Every field is optional and `None` means "no change": a consumer applies
//! the fields that are set and leaves everything else alone. The engine's own
//! pipette state and the hardware-side cache both consume these.

use serde::{Deserialize, Serialize};

use crate::command::{Mount, WellLocation};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TipGeometry {
    /// Microliters.
    pub volume: f64,
    /// Millimeters.
    pub length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedPipetteUpdate {
    pub pipette_id: String,
    pub pipette_name: String,
    pub mount: Mount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipetteLocationUpdate {
    pub pipette_id: String,
    /// `None` means the location is no longer known.
    pub location: Option<WellLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipetteTipStateUpdate {
    pub pipette_id: String,
    /// `None` means no tip is attached.
    pub tip: Option<TipGeometry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "volume", rename_all = "camelCase")]
pub enum AspiratedFluid {
    Aspirated(f64),
    Dispensed(f64),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipetteAspiratedFluidUpdate {
    pub pipette_id: String,
    pub fluid: AspiratedFluid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_pipette: Option<LoadedPipetteUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipette_location: Option<PipetteLocationUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipette_tip_state: Option<PipetteTipStateUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipette_aspirated_fluid: Option<PipetteAspiratedFluidUpdate>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_pipette(mut self, pipette_id: impl Into<String>, pipette_name: impl Into<String>, mount: Mount) -> Self {
        self.loaded_pipette = Some(LoadedPipetteUpdate {
            pipette_id: pipette_id.into(),
            pipette_name: pipette_name.into(),
            mount,
        });
        self
    }

    pub fn set_pipette_location(mut self, pipette_id: impl Into<String>, location: WellLocation) -> Self {
        self.pipette_location = Some(PipetteLocationUpdate {
            pipette_id: pipette_id.into(),
            location: Some(location),
        });
        self
    }

    pub fn clear_pipette_location(mut self, pipette_id: impl Into<String>) -> Self {
        self.pipette_location = Some(PipetteLocationUpdate {
            pipette_id: pipette_id.into(),
            location: None,
        });
        self
    }

    pub fn update_tip(mut self, pipette_id: impl Into<String>, tip: TipGeometry) -> Self {
        self.pipette_tip_state = Some(PipetteTipStateUpdate {
            pipette_id: pipette_id.into(),
            tip: Some(tip),
        });
        self
    }

    pub fn clear_tip(mut self, pipette_id: impl Into<String>) -> Self {
        self.pipette_tip_state = Some(PipetteTipStateUpdate {
            pipette_id: pipette_id.into(),
            tip: None,
        });
        self
    }

    pub fn set_fluid(mut self, pipette_id: impl Into<String>, fluid: AspiratedFluid) -> Self {
        self.pipette_aspirated_fluid = Some(PipetteAspiratedFluidUpdate {
            pipette_id: pipette_id.into(),
            fluid,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.loaded_pipette.is_none()
            && self.pipette_location.is_none()
            && self.pipette_tip_state.is_none()
            && self.pipette_aspirated_fluid.is_none()
    }

    /// Combine two updates; fields set in `later` win.
    pub fn merge(self, later: StateUpdate) -> StateUpdate {
        StateUpdate {
            loaded_pipette: later.loaded_pipette.or(self.loaded_pipette),
            pipette_location: later.pipette_location.or(self.pipette_location),
            pipette_tip_state: later.pipette_tip_state.or(self.pipette_tip_state),
            pipette_aspirated_fluid: later.pipette_aspirated_fluid.or(self.pipette_aspirated_fluid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIP: TipGeometry = TipGeometry { volume: 300.0, length: 59.5 };

    #[test]
    fn test_default_is_empty() {
        assert!(StateUpdate::new().is_empty());
        assert!(!StateUpdate::new().clear_tip("p1").is_empty());
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let earlier = StateUpdate::new()
            .update_tip("p1", TIP)
            .set_fluid("p1", AspiratedFluid::Empty);
        let later = StateUpdate::new().clear_tip("p1");
        let merged = earlier.merge(later);
        assert_eq!(merged.pipette_tip_state.unwrap().tip, None);
        assert_eq!(merged.pipette_aspirated_fluid.unwrap().fluid, AspiratedFluid::Empty);
        assert!(merged.pipette_location.is_none());
    }

    #[test]
    fn test_unset_fields_are_not_serialized() {
        let json = serde_json::to_value(StateUpdate::new().clear_tip("p1")).unwrap();
        assert_eq!(json, serde_json::json!({ "pipetteTipState": { "pipetteId": "p1", "tip": null } }));
    }
}
