//! Geometry file loading.
//!
//! A geometry file is a `GeometryData` message written as YAML (or JSON,
//! by extension):
//!
//! ```yaml
//! field:
//!   field_length: 12000
//!   field_width: 9000
//!   goal_width: 1800
//!   goal_depth: 180
//!   boundary_width: 300
//! calib:
//!   - camera_id: 0
//!     focal_length: 390.0
//!     ...
//! ```

use crate::error::Result;
use crate::proto::{GeometryData, WrapperPacket};
use crate::records::read_document;
use std::path::Path;

/// Load a geometry file and wrap it as a geometry packet
pub fn load_geometry(path: impl AsRef<Path>) -> Result<WrapperPacket> {
    let path = path.as_ref();
    let geometry: GeometryData = read_document(path)?;
    log::debug!(
        "Loaded geometry from {} ({} camera calibrations)",
        path.display(),
        geometry.calib.len()
    );
    Ok(WrapperPacket::from_geometry(geometry))
}
