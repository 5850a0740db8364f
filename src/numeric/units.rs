//! Unit adapters.
//!
//! Unit handling proper is delegated to an external provider; the core only
//! needs to ask "convert this array into units X". `ScaleUnits` is a small
//! table-driven provider covering linear scale families.

use crate::error::{FlowError, Result};
use crate::numeric::Array;
use std::collections::HashMap;

/// Converts arrays between unit tags.
pub trait UnitAdapter {
    /// Convert `array` into `to`. Arrays without a unit tag are returned
    /// retagged unchanged.
    fn convert(&self, array: &Array, to: &str) -> Result<Array>;
}

/// Linear unit families (`family`, scale relative to the family base).
#[derive(Debug, Clone)]
pub struct ScaleUnits {
    units: HashMap<String, (String, f64)>,
}

impl ScaleUnits {
    /// Empty table: only identical tags convert.
    pub fn empty() -> Self {
        Self {
            units: HashMap::new(),
        }
    }

    /// Length, time and mass families.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for (name, scale) in [
            ("m", 1.0),
            ("km", 1000.0),
            ("cm", 0.01),
            ("mm", 0.001),
            ("ft", 0.3048),
            ("in", 0.0254),
        ] {
            table.add("length", name, scale);
        }
        for (name, scale) in [("s", 1.0), ("ms", 0.001), ("min", 60.0), ("h", 3600.0)] {
            table.add("time", name, scale);
        }
        for (name, scale) in [("kg", 1.0), ("g", 0.001), ("lb", 0.453_592_37)] {
            table.add("mass", name, scale);
        }
        table
    }

    pub fn add(&mut self, family: &str, unit: &str, scale: f64) {
        self.units
            .insert(unit.to_string(), (family.to_string(), scale));
    }
}

impl Default for ScaleUnits {
    fn default() -> Self {
        Self::standard()
    }
}

impl UnitAdapter for ScaleUnits {
    fn convert(&self, array: &Array, to: &str) -> Result<Array> {
        let Some(from) = array.units() else {
            return Ok(array.clone().with_units(to));
        };
        if from == to {
            return Ok(array.clone());
        }
        let invalid = || FlowError::InvalidConversion {
            from: from.to_string(),
            to: to.to_string(),
        };
        let (from_family, from_scale) = self.units.get(from).ok_or_else(invalid)?;
        let (to_family, to_scale) = self.units.get(to).ok_or_else(invalid)?;
        if from_family != to_family {
            return Err(invalid());
        }
        let factor = from_scale / to_scale;
        Ok(array.map_float(|v| v * factor).with_units(to))
    }
}
