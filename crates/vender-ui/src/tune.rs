//! Cream and sugar adjustment: the bar graph shown while tuning and the
//! rate applied to the stock spend.

/// Display glyphs for an empty, quarter, half and full cell.
pub const SCALE_ALPHA: [u8; 4] = [0x94, 0x95, 0x96, 0x97];

const SCALE_CELLS: usize = 6;
const RATE_STEP: f32 = 0.25;

/// Render `value` within `min..=max` as six cells of [`SCALE_ALPHA`].
pub fn format_scale(value: u8, min: u8, max: u8, alpha: &[u8; 4]) -> Vec<u8> {
    let mut cells = [0u8; SCALE_CELLS];
    if max > min && value > min {
        if value >= max {
            cells = [3; SCALE_CELLS];
        } else {
            let ratio = f32::from(value - min) / f32::from(max - min);
            let mut part = (ratio * (SCALE_CELLS * 4) as f32) as u8;
            for cell in &mut cells {
                if part == 0 {
                    break;
                }
                if part >= 4 {
                    *cell = 3;
                    part -= 4;
                } else {
                    *cell = part;
                    part = 0;
                }
            }
        }
    }
    cells.iter().map(|&c| alpha[usize::from(c)]).collect()
}

/// Spend multiplier for a tuning level. `center` is neutral (1.0), zero
/// disables the ingredient, each step away from center changes the rate
/// by a quarter.
pub fn scale_tune_rate(value: u8, max: u8, center: u8) -> f32 {
    let value = value.min(max);
    if value == center {
        return 1.0;
    }
    if value == 0 {
        return 0.0;
    }
    if value < center {
        1.0 - RATE_STEP * f32::from(center - value)
    } else {
        1.0 + RATE_STEP * f32::from(value - center)
    }
}
