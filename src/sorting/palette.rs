use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Grey used for spikes that no unit claimed.
    pub const UNSORTED: Rgb = Rgb::new(127, 127, 127);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

const UNIT_COLORS: [Rgb; 8] = [
    Rgb::new(255, 224, 93),
    Rgb::new(255, 178, 99),
    Rgb::new(255, 109, 161),
    Rgb::new(246, 102, 255),
    Rgb::new(175, 98, 255),
    Rgb::new(90, 241, 233),
    Rgb::new(109, 175, 136),
    Rgb::new(160, 237, 181),
];

pub const PALETTE_SIZE: usize = UNIT_COLORS.len();

/// Default display color of a unit. Unit ids start at 1.
pub fn unit_color(unit_id: u16) -> Rgb {
    let index = (usize::from(unit_id).max(1) - 1) % PALETTE_SIZE;
    UNIT_COLORS[index]
}
