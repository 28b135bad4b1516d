use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::sorting::geometry::{segments_intersect, Point};
use crate::sorting::palette::{unit_color, Rgb};
use crate::sorting::spike::Spike;
use crate::sorting::stats::WaveformStats;

/// Horizontal spacing between automatically placed boxes (µs).
const DEFAULT_BOX_STEP_US: f32 = 350.0;
/// Vertical spacing between units' automatically placed boxes (µV).
const DEFAULT_UNIT_STEP_UV: f32 = 20.0;

/// Time x voltage rectangle on one channel. `y` is the top edge and the box
/// spans down to `y - h`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortBox {
    /// Left edge, µs from the start of the waveform.
    pub x: f32,
    /// Top edge, µV.
    pub y: f32,
    /// Width, µs.
    pub w: f32,
    /// Height measured downwards from `y`, µV.
    pub h: f32,
    pub channel: usize,
}

impl Default for SortBox {
    fn default() -> Self {
        Self::new(50.0, -20.0, 300.0, 40.0, 0)
    }
}

impl SortBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32, channel: usize) -> Self {
        Self { x, y, w, h, channel }
    }

    pub fn on_channel(channel: usize) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }

    fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x, self.y),
            Point::new(self.x + self.w, self.y),
            Point::new(self.x + self.w, self.y - self.h),
            Point::new(self.x, self.y - self.h),
        ]
    }

    /// True when the trace of `self.channel` crosses any edge of the box.
    /// Only the waveform segments inside `[x, x + w]` are examined.
    pub fn is_waveform_inside(&self, spike: &Spike) -> bool {
        if self.channel >= spike.channel().num_channels {
            return false;
        }
        let [top_left, top_right, bottom_right, bottom_left] = self.corners();
        let edges = [
            (top_left, bottom_left),
            (top_right, bottom_right),
            (top_left, top_right),
            (bottom_left, bottom_right),
        ];

        let bin_left = spike.microseconds_to_time_bin(self.x);
        let bin_right = spike.microseconds_to_time_bin(self.x + self.w);
        (bin_left..bin_right).any(|pt| {
            let a = Point::new(
                spike.time_bin_to_microseconds(pt),
                spike.bin_to_microvolts(pt, self.channel),
            );
            let b = Point::new(
                spike.time_bin_to_microseconds(pt + 1),
                spike.bin_to_microvolts(pt + 1, self.channel),
            );
            edges
                .iter()
                .any(|(e1, e2)| segments_intersect(a, b, *e1, *e2))
        })
    }
}

/// Unit defined by one or more boxes; a spike must hit every box.
#[derive(Clone, Debug)]
pub struct BoxUnit {
    unit_id: u16,
    local_id: u16,
    boxes: Vec<SortBox>,
    color: Rgb,
    active: bool,
    activated_at: Option<Instant>,
    stats: WaveformStats,
}

impl BoxUnit {
    /// New unit with the default box.
    pub fn new(unit_id: u16, local_id: u16) -> Self {
        Self::with_box(SortBox::default(), unit_id, local_id)
    }

    pub fn with_box(sort_box: SortBox, unit_id: u16, local_id: u16) -> Self {
        Self::from_parts(unit_id, local_id, vec![sort_box], unit_color(unit_id))
    }

    /// Rebuilds a unit exactly as described, e.g. from a saved snapshot.
    pub fn from_parts(unit_id: u16, local_id: u16, boxes: Vec<SortBox>, color: Rgb) -> Self {
        Self {
            unit_id,
            local_id,
            boxes,
            color,
            active: false,
            activated_at: None,
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

    /// Takes a new id and the palette color that goes with it.
    pub fn reassign_id(&mut self, unit_id: u16) {
        self.unit_id = unit_id;
        self.color = unit_color(unit_id);
    }

    /// Zero boxes never match.
    pub fn is_waveform_inside_all_boxes(&self, spike: &Spike) -> bool {
        !self.boxes.is_empty() && self.boxes.iter().all(|b| b.is_waveform_inside(spike))
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
        self.activated_at = Some(Instant::now());
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn toggle_active(&mut self) {
        if self.active {
            self.deactivate();
        } else {
            self.activate();
        }
    }

    /// Seconds since the last activation, 0 while inactive.
    pub fn seconds_active(&self) -> f64 {
        match (self.active, self.activated_at) {
            (true, Some(at)) => at.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn add_box(&mut self, sort_box: SortBox) {
        self.boxes.push(sort_box);
    }

    /// Places a default-sized box to the right of the existing ones, lowered by unit id.
    pub fn add_default_box(&mut self) {
        let x = 50.0 + DEFAULT_BOX_STEP_US * self.boxes.len() as f32;
        let y = -20.0 - f32::from(self.unit_id) * DEFAULT_UNIT_STEP_UV;
        self.boxes.push(SortBox::new(x, y, 300.0, 40.0, 0));
    }

    pub fn num_boxes(&self) -> usize {
        self.boxes.len()
    }

    pub fn boxes(&self) -> &[SortBox] {
        &self.boxes
    }

    pub fn box_at(&self, index: usize) -> Option<&SortBox> {
        self.boxes.get(index)
    }

    pub fn last_box(&self) -> Option<&SortBox> {
        self.boxes.last()
    }

    /// Replaces a box wholesale, channel included.
    pub fn modify_box(&mut self, index: usize, sort_box: SortBox) -> bool {
        match self.boxes.get_mut(index) {
            Some(slot) => {
                *slot = sort_box;
                true
            }
            None => false,
        }
    }

    /// Copies the geometry of `sort_box` but keeps the existing channel.
    pub fn set_box(&mut self, index: usize, sort_box: SortBox) -> bool {
        match self.boxes.get_mut(index) {
            Some(slot) => {
                *slot = SortBox {
                    channel: slot.channel,
                    ..sort_box
                };
                true
            }
            None => false,
        }
    }

    /// Ordered erase; later boxes shift down by one index.
    pub fn delete_box(&mut self, index: usize) -> bool {
        if index < self.boxes.len() {
            self.boxes.remove(index);
            true
        } else {
            false
        }
    }

    pub fn set_box_position(&mut self, index: usize, top_left: Point) -> bool {
        match self.boxes.get_mut(index) {
            Some(b) => {
                b.x = top_left.x;
                b.y = top_left.y;
                true
            }
            None => false,
        }
    }

    pub fn set_box_size(&mut self, index: usize, w: f32, h: f32) -> bool {
        match self.boxes.get_mut(index) {
            Some(b) => {
                b.w = w;
                b.h = h;
                true
            }
            None => false,
        }
    }

    pub fn move_box(&mut self, index: usize, dx: f32, dy: f32) -> bool {
        match self.boxes.get_mut(index) {
            Some(b) => {
                b.x += dx;
                b.y += dy;
                true
            }
            None => false,
        }
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
