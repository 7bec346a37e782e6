//! Acquisition metadata attached to published arrays.
//!
//! Every [`DataArray`](crate::data::DataArray) carries a [`Metadata`] value
//! describing how it was acquired: where the scan center was, the physical
//! pixel size, rotation, timing, and modality-specific entries such as the
//! wavelength list of a spectrometer or the polarization analyzer position.
//!
//! Metadata is assembled from an overlay stack captured at scan start:
//! component defaults, then child-stream overrides, then per-scan values,
//! then per-pixel values, each layer merged on top of the previous with
//! [`Metadata::overlay`]. There is no global mutable metadata map.

use serde::{Deserialize, Serialize};

/// Canonical polarization analyzer positions, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarization {
    Horizontal,
    Vertical,
    PosDiag,
    NegDiag,
    RightCircular,
    LeftCircular,
}

impl Polarization {
    /// All six positions, in the order they are acquired.
    pub const ALL: [Polarization; 6] = [
        Polarization::Horizontal,
        Polarization::Vertical,
        Polarization::PosDiag,
        Polarization::NegDiag,
        Polarization::RightCircular,
        Polarization::LeftCircular,
    ];

    /// Canonical short name.
    pub fn name(self) -> &'static str {
        match self {
            Polarization::Horizontal => "horizontal",
            Polarization::Vertical => "vertical",
            Polarization::PosDiag => "posdiag",
            Polarization::NegDiag => "negdiag",
            Polarization::RightCircular => "rhc",
            Polarization::LeftCircular => "lhc",
        }
    }
}

/// RGB tint applied by the user to a detector channel.
pub type Tint = (u8, u8, u8);

/// Typed metadata bundle. All fields are optional; which ones are set
/// depends on the detector modality that produced the array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Scan center position, meters.
    pub pos: Option<(f64, f64)>,
    /// Pixel size, meters per pixel on each axis.
    pub pixel_size: Option<(f64, f64)>,
    /// Raster rotation about the ROI center, radians.
    pub rotation: Option<f64>,
    /// Acquisition start, seconds since the Unix epoch.
    pub acq_date: Option<f64>,
    /// Emitter dwell time per pixel, seconds.
    pub dwell_time: Option<f64>,
    /// Camera exposure time per pixel, seconds.
    pub exp_time: Option<f64>,
    /// Number of summed sub-exposures (>= 1).
    pub integration_count: Option<u32>,
    /// Detector baseline level, in sample units.
    pub baseline: Option<f64>,
    /// Wavelength of each C bin, meters.
    pub wavelength_list: Option<Vec<f64>>,
    /// Time of each T bin, seconds.
    pub time_list: Option<Vec<f64>>,
    /// Detector type tag.
    pub detector_type: Option<String>,
    /// Polarization analyzer position.
    pub pol_mode: Option<Polarization>,
    /// Excitation wavelength, meters.
    pub input_wavelength: Option<f64>,
    /// User display tint for this channel.
    pub user_tint: Option<Tint>,
    /// Probe current samples over the scan: (elapsed seconds, amperes).
    pub ebeam_current_time: Option<Vec<(f64, f64)>>,
    /// Dimension label string, e.g. "YX" or "CTZYX".
    pub dims: Option<String>,
}

impl Metadata {
    /// Merge `over` on top of `self`: any field set in `over` replaces the
    /// corresponding field of the base layer.
    pub fn overlay(&self, over: &Metadata) -> Metadata {
        macro_rules! pick {
            ($field:ident) => {
                over.$field.clone().or_else(|| self.$field.clone())
            };
        }
        Metadata {
            pos: pick!(pos),
            pixel_size: pick!(pixel_size),
            rotation: pick!(rotation),
            acq_date: pick!(acq_date),
            dwell_time: pick!(dwell_time),
            exp_time: pick!(exp_time),
            integration_count: pick!(integration_count),
            baseline: pick!(baseline),
            wavelength_list: pick!(wavelength_list),
            time_list: pick!(time_list),
            detector_type: pick!(detector_type),
            pol_mode: pick!(pol_mode),
            input_wavelength: pick!(input_wavelength),
            user_tint: pick!(user_tint),
            ebeam_current_time: pick!(ebeam_current_time),
            dims: pick!(dims),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_override() {
        let base = Metadata {
            pos: Some((1.0, 2.0)),
            dwell_time: Some(1e-6),
            ..Default::default()
        };
        let over = Metadata {
            pos: Some((3.0, 4.0)),
            rotation: Some(0.5),
            ..Default::default()
        };
        let merged = base.overlay(&over);
        assert_eq!(merged.pos, Some((3.0, 4.0)));
        assert_eq!(merged.rotation, Some(0.5));
        // untouched base field survives
        assert_eq!(merged.dwell_time, Some(1e-6));
    }

    #[test]
    fn test_polarization_order_and_names() {
        assert_eq!(Polarization::ALL.len(), 6);
        assert_eq!(Polarization::ALL[0].name(), "horizontal");
        assert_eq!(Polarization::ALL[4].name(), "rhc");
    }
}
