use crate::sorting::geometry::{Point, Polygon};
use crate::sorting::palette::{unit_color, Rgb};
use crate::sorting::spike::Spike;
use crate::sorting::stats::WaveformStats;

/// Unit defined by a polygon drawn in the (pc1, pc2) plane.
#[derive(Clone, Debug)]
pub struct PcaUnit {
    unit_id: u16,
    local_id: u16,
    polygon: Polygon,
    color: Rgb,
    stats: WaveformStats,
}

impl PcaUnit {
    pub fn new(polygon: Polygon, unit_id: u16, local_id: u16) -> Self {
        Self::from_parts(unit_id, local_id, polygon, unit_color(unit_id))
    }

    pub fn from_parts(unit_id: u16, local_id: u16, polygon: Polygon, color: Rgb) -> Self {
        Self {
            unit_id,
            local_id,
            polygon,
            color,
            stats: WaveformStats::new(),
        }
    }

    pub fn unit_id(&self) -> u16 {
        self.unit_id
    }

    pub fn local_id(&self) -> u16 {
        self.local_id
    }

    pub fn color(&self) -> Rgb {
        self.color
    }

    pub fn polygon(&self) -> &Polygon {
        &self.polygon
    }

    pub fn polygon_mut(&mut self) -> &mut Polygon {
        &mut self.polygon
    }

    pub fn reassign_id(&mut self, unit_id: u16) {
        self.unit_id = unit_id;
        self.color = unit_color(unit_id);
    }

    pub fn is_point_inside_polygon(&self, p: Point) -> bool {
        self.polygon.contains(p)
    }

    /// Uses the projection already stored on the spike; an unprojected spike
    /// sits at the origin.
    pub fn is_waveform_inside_polygon(&self, spike: &Spike) -> bool {
        self.polygon.contains(spike.projection())
    }

    pub fn update_waveform(&mut self, spike: &Spike) {
        self.stats.update(spike);
    }

    pub fn stats(&self) -> &WaveformStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut WaveformStats {
        &mut self.stats
    }

    pub fn resize_waveform(&mut self, new_length: usize) {
        self.stats.resize_waveform(new_length);
    }
}
