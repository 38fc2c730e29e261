//! Labware definitions and structured location descriptors.
//!
//! A [`Labware`] is defined once per run and receives a [`LabwareId`] at that
//! point. Every [`Location`] produced from it carries the labware identity,
//! its label, slot and parent module as explicit fields, so the tracker never
//! has to recover any of that by inspecting text.
//!
//! # Example
//!
//! ```
//! use welltrace_core::labware::Labware;
//!
//! let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
//! let a1 = plate.well("A1").expect("plate has A1");
//!
//! assert_eq!(a1.well_name(), Some("A1"));
//! assert_eq!(a1.to_string(), "A1 of plate (slot 2)");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a labware instance for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabwareId(pub Uuid);

impl LabwareId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LabwareId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LabwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a single well in the ledger: labware identity plus well name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WellKey {
    pub labware: LabwareId,
    pub well: String,
}

/// A deck coordinate offset inside or relative to a well, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A labware container loaded on the deck or on a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Labware {
    pub id: LabwareId,
    /// Definition name, e.g. `corning_96_wellplate_360ul_flat`.
    pub load_name: String,
    /// The name the protocol refers to this labware by, e.g. `tc_plate`.
    pub label: String,
    /// Deck slot the labware (or its parent module) occupies.
    pub slot: Option<String>,
    /// Name of the module the labware sits on, if any.
    pub module: Option<String>,
    wells: Vec<String>,
}

impl Labware {
    /// Creates a labware with an explicit list of well names.
    pub fn new(
        load_name: impl Into<String>,
        label: impl Into<String>,
        slot: Option<String>,
        wells: Vec<String>,
    ) -> Self {
        Self {
            id: LabwareId::new(),
            load_name: load_name.into(),
            label: label.into(),
            slot,
            module: None,
            wells,
        }
    }

    /// Creates a rectangular labware with wells named `A1`, `B1`, ... in
    /// column-major order, the order a robot iterates wells in.
    ///
    /// Rows beyond `Z` are not supported and are clamped to 26.
    pub fn grid(
        load_name: impl Into<String>,
        label: impl Into<String>,
        slot: impl Into<String>,
        rows: u8,
        columns: u8,
    ) -> Self {
        let rows = rows.min(26);
        let mut wells = Vec::with_capacity(rows as usize * columns as usize);
        for column in 1..=columns {
            for row in 0..rows {
                wells.push(format!("{}{}", (b'A' + row) as char, column));
            }
        }
        Self::new(load_name, label, Some(slot.into()), wells)
    }

    /// Marks this labware as loaded on the named module.
    pub fn on_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Well names in definition order.
    pub fn wells(&self) -> &[String] {
        &self.wells
    }

    /// Returns a location at the named well, or `None` if the labware has no
    /// such well.
    pub fn well(&self, name: &str) -> Option<Location> {
        self.wells
            .iter()
            .any(|w| w == name)
            .then(|| Location::well(self, name))
    }

    /// Returns the ledger key for the named well (existing or not).
    pub fn well_key(&self, name: &str) -> WellKey {
        WellKey {
            labware: self.id,
            well: name.to_string(),
        }
    }
}

/// Labware fields a location needs to describe itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabwareRef {
    pub id: LabwareId,
    pub label: String,
    pub load_name: String,
    pub slot: Option<String>,
    pub module: Option<String>,
}

impl From<&Labware> for LabwareRef {
    fn from(labware: &Labware) -> Self {
        Self {
            id: labware.id,
            label: labware.label.clone(),
            load_name: labware.load_name.clone(),
            slot: labware.slot.clone(),
            module: labware.module.clone(),
        }
    }
}

/// Where an instrument operation takes place.
///
/// Built once when the location is constructed. A location may lack a well
/// (a bare slot or a raw deck coordinate), in which case the ledger cannot
/// attribute volume to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub labware: Option<LabwareRef>,
    pub well: Option<String>,
    /// Slot for locations not tied to a labware.
    pub slot: Option<String>,
    pub point: Option<Point>,
}

impl Location {
    /// A location at the default position of a well.
    pub fn well(labware: &Labware, well: &str) -> Self {
        Self {
            labware: Some(LabwareRef::from(labware)),
            well: Some(well.to_string()),
            slot: None,
            point: None,
        }
    }

    /// A bare deck slot with no labware or well identity.
    pub fn slot(slot: impl Into<String>) -> Self {
        Self {
            labware: None,
            well: None,
            slot: Some(slot.into()),
            point: None,
        }
    }

    /// A raw deck coordinate with no labware or well identity.
    pub fn point(x: f64, y: f64, z: f64) -> Self {
        Self {
            labware: None,
            well: None,
            slot: None,
            point: Some(Point { x, y, z }),
        }
    }

    /// Same well, moved by a coordinate offset.
    pub fn with_offset(mut self, x: f64, y: f64, z: f64) -> Self {
        self.point = Some(Point { x, y, z });
        self
    }

    pub fn well_name(&self) -> Option<&str> {
        self.well.as_deref()
    }

    /// Ledger key of the well this location points into, if it has one.
    pub fn well_key(&self) -> Option<WellKey> {
        match (&self.labware, &self.well) {
            (Some(labware), Some(well)) => Some(WellKey {
                labware: labware.id,
                well: well.clone(),
            }),
            _ => None,
        }
    }

    /// Slot of the labware, or of the bare location.
    pub fn slot_name(&self) -> Option<&str> {
        self.labware
            .as_ref()
            .and_then(|l| l.slot.as_deref())
            .or(self.slot.as_deref())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(well) = &self.well {
            write!(f, "{}", well)?;
            if let Some(labware) = &self.labware {
                write!(f, " of {}", labware.label)?;
                match (&labware.module, &labware.slot) {
                    (Some(module), Some(slot)) => write!(f, " on {} (slot {})", module, slot)?,
                    (Some(module), None) => write!(f, " on {}", module)?,
                    (None, Some(slot)) => write!(f, " (slot {})", slot)?,
                    (None, None) => {}
                }
            }
            if let Some(p) = &self.point {
                write!(f, " at offset (x={}, y={}, z={})", p.x, p.y, p.z)?;
            }
            return Ok(());
        }
        match (&self.point, self.slot_name()) {
            (Some(p), _) => write!(f, "custom coordinates (x={}, y={}, z={})", p.x, p.y, p.z),
            (None, Some(slot)) => write!(f, "slot {}", slot),
            (None, None) => write!(f, "unknown location"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_names_wells_column_major() {
        let plate = Labware::grid("nest_12_reservoir_15ml", "reservoir", "5", 1, 12);
        assert_eq!(plate.wells().len(), 12);
        assert_eq!(plate.wells()[0], "A1");
        assert_eq!(plate.wells()[11], "A12");

        let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
        assert_eq!(plate.wells().len(), 96);
        assert_eq!(plate.wells()[1], "B1");
        assert_eq!(plate.wells()[8], "A2");
    }

    #[test]
    fn well_lookup_is_stable() {
        let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
        let first = plate.well("H1").unwrap().well_key().unwrap();
        let second = plate.well("H1").unwrap().well_key().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, plate.well_key("H1"));
    }

    #[test]
    fn missing_well_is_none() {
        let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
        assert!(plate.well("Z99").is_none());
    }

    #[test]
    fn same_well_name_on_different_labware_has_different_keys() {
        let a = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
        let b = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
        assert_ne!(a.well_key("A1"), b.well_key("A1"));
    }

    #[test]
    fn display_variants() {
        let tc = Labware::grid("4ti0960rig_96_wellplate_200ul", "tc_plate", "7", 8, 12)
            .on_module("thermocycler");
        assert_eq!(
            tc.well("B3").unwrap().to_string(),
            "B3 of tc_plate on thermocycler (slot 7)"
        );
        assert_eq!(Location::slot("12").to_string(), "slot 12");
        assert_eq!(
            Location::point(1.0, 2.5, 3.0).to_string(),
            "custom coordinates (x=1, y=2.5, z=3)"
        );
        let offset = tc.well("A1").unwrap().with_offset(0.0, 0.0, -1.0);
        assert!(offset.to_string().ends_with("at offset (x=0, y=0, z=-1)"));
        assert!(offset.well_key().is_some());
    }

    #[test]
    fn bare_locations_have_no_well_key() {
        assert!(Location::slot("12").well_key().is_none());
        assert!(Location::point(0.0, 0.0, 0.0).well_key().is_none());
    }
}
