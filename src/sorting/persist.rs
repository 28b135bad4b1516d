// src/sorting/persist.rs
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sorting::box_unit::{BoxUnit, SortBox};
use crate::sorting::error::SortError;
use crate::sorting::geometry::{Point, Polygon};
use crate::sorting::palette::Rgb;
use crate::sorting::pca::PcaRange;
use crate::sorting::pca_unit::PcaUnit;

/// Saved state of one sorter: selection, PCA engine and both unit families.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SorterSnapshot {
    pub selected_unit: Option<u16>,
    pub selected_box: Option<usize>,
    pub pca: PcaNode,
    #[serde(default)]
    pub box_units: Vec<BoxUnitNode>,
    #[serde(default)]
    pub pca_units: Vec<PcaUnitNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaNode {
    pub num_channels: usize,
    pub waveform_length: usize,
    pub pc1_min: f32,
    pub pc2_min: f32,
    pub pc1_max: f32,
    pub pc2_max: f32,
    pub job_finished: bool,
    pub computed: bool,
    /// One entry per feature dimension; empty unless `computed`.
    #[serde(default)]
    pub dims: Vec<PcDim>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcDim {
    pub pc1: f32,
    pub pc2: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxUnitNode {
    pub unit_id: u16,
    pub color_r: u8,
    pub color_g: u8,
    pub color_b: u8,
    pub boxes: Vec<BoxNode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxNode {
    pub ch: usize,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaUnitNode {
    pub unit_id: u16,
    pub color_r: u8,
    pub color_g: u8,
    pub color_b: u8,
    pub polygon_offset_x: f32,
    pub polygon_offset_y: f32,
    pub points: Vec<PolygonPointNode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolygonPointNode {
    pub point_x: f32,
    pub point_y: f32,
}

impl PcaNode {
    pub fn range(&self) -> PcaRange {
        PcaRange {
            pc1_min: self.pc1_min,
            pc2_min: self.pc2_min,
            pc1_max: self.pc1_max,
            pc2_max: self.pc2_max,
        }
    }

    /// Splits the per-dimension pairs back into the two component vectors.
    pub fn components(&self) -> (Vec<f32>, Vec<f32>) {
        self.dims.iter().map(|d| (d.pc1, d.pc2)).unzip()
    }
}

impl From<&BoxUnit> for BoxUnitNode {
    fn from(unit: &BoxUnit) -> Self {
        let color = unit.color();
        Self {
            unit_id: unit.unit_id(),
            color_r: color.r,
            color_g: color.g,
            color_b: color.b,
            boxes: unit
                .boxes()
                .iter()
                .map(|b| BoxNode {
                    ch: b.channel,
                    x: b.x,
                    y: b.y,
                    w: b.w,
                    h: b.h,
                })
                .collect(),
        }
    }
}

impl BoxUnitNode {
    pub fn into_unit(self, local_id: u16) -> BoxUnit {
        let boxes = self
            .boxes
            .into_iter()
            .map(|b| SortBox::new(b.x, b.y, b.w, b.h, b.ch))
            .collect();
        BoxUnit::from_parts(
            self.unit_id,
            local_id,
            boxes,
            Rgb::new(self.color_r, self.color_g, self.color_b),
        )
    }
}

impl From<&PcaUnit> for PcaUnitNode {
    fn from(unit: &PcaUnit) -> Self {
        let color = unit.color();
        let polygon = unit.polygon();
        Self {
            unit_id: unit.unit_id(),
            color_r: color.r,
            color_g: color.g,
            color_b: color.b,
            polygon_offset_x: polygon.offset.x,
            polygon_offset_y: polygon.offset.y,
            points: polygon
                .points
                .iter()
                .map(|p| PolygonPointNode {
                    point_x: p.x,
                    point_y: p.y,
                })
                .collect(),
        }
    }
}

impl PcaUnitNode {
    pub fn into_unit(self, local_id: u16) -> PcaUnit {
        let points = self
            .points
            .into_iter()
            .map(|p| Point::new(p.point_x, p.point_y))
            .collect();
        let polygon = Polygon::with_offset(
            points,
            Point::new(self.polygon_offset_x, self.polygon_offset_y),
        );
        PcaUnit::from_parts(
            self.unit_id,
            local_id,
            polygon,
            Rgb::new(self.color_r, self.color_g, self.color_b),
        )
    }
}

impl SorterSnapshot {
    pub fn to_json(&self) -> Result<String, SortError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SortError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SortError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SortError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Largest unit id referenced by the snapshot, if any.
    pub fn max_unit_id(&self) -> Option<u16> {
        self.box_units
            .iter()
            .map(|u| u.unit_id)
            .chain(self.pca_units.iter().map(|u| u.unit_id))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_unit_node_keeps_fractional_geometry() {
        let mut unit = BoxUnit::with_box(SortBox::new(50.5, -20.25, 300.0, 40.0, 1), 3, 1);
        unit.add_box(SortBox::new(400.0, -60.0, 120.0, 10.5, 0));
        let node = BoxUnitNode::from(&unit);
        assert_eq!(node.boxes[0].x, 50.5);
        assert_eq!(node.boxes[0].y, -20.25);
        assert_eq!(node.boxes[1].h, 10.5);

        let back = node.into_unit(1);
        assert_eq!(back.unit_id(), 3);
        assert_eq!(back.color(), unit.color());
        assert_eq!(back.boxes(), unit.boxes());
    }

    #[test]
    fn pca_unit_node_keeps_offset() {
        let polygon = Polygon::with_offset(
            vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)],
            Point::new(2.0, -3.0),
        );
        let unit = PcaUnit::new(polygon.clone(), 7, 2);
        let back = PcaUnitNode::from(&unit).into_unit(2);
        assert_eq!(back.polygon(), &polygon);
        assert_eq!(back.unit_id(), 7);
    }

    #[test]
    fn missing_unit_lists_default_to_empty() {
        let text = r#"{
            "selected_unit": null,
            "selected_box": null,
            "pca": {
                "num_channels": 1, "waveform_length": 2,
                "pc1_min": -1.0, "pc2_min": -1.0, "pc1_max": 1.0, "pc2_max": 1.0,
                "job_finished": false, "computed": false
            }
        }"#;
        let snapshot = SorterSnapshot::from_json(text).unwrap();
        assert!(snapshot.box_units.is_empty());
        assert!(snapshot.pca.dims.is_empty());
        assert_eq!(snapshot.max_unit_id(), None);
        assert_eq!(snapshot.pca.range(), PcaRange::default());
    }

    #[test]
    fn components_unzip_in_order() {
        let node = PcaNode {
            num_channels: 1,
            waveform_length: 2,
            pc1_min: 0.0,
            pc2_min: 0.0,
            pc1_max: 0.0,
            pc2_max: 0.0,
            job_finished: true,
            computed: true,
            dims: vec![PcDim { pc1: 1.0, pc2: 2.0 }, PcDim { pc1: 3.0, pc2: 4.0 }],
        };
        assert_eq!(node.components(), (vec![1.0, 3.0], vec![2.0, 4.0]));
    }
}
