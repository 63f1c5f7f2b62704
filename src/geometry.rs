use crate::error::{Error, Result};

pub type Vec3 = [f32; 3];

#[inline]
pub fn dist(a: &Vec3, b: &Vec3) -> f32 {
    norm(&[a[0] - b[0], a[1] - b[1], a[2] - b[2]])
}

#[inline]
pub fn norm(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// `a + (b - a) * t`
#[inline]
pub fn lerp(a: &Vec3, b: &Vec3, t: f32) -> Vec3 {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

const SIN_60: f64 = 0.866_025_403_784_438_6;
const TAN_60: f64 = 1.732_050_807_568_877_2;

/// Positions of the four microphones, in meters.
///
/// Mic 0 sits above the plane of mics 1-3. The array is centred on its centroid.
#[derive(Debug, Clone, PartialEq)]
pub struct MicArray {
    positions: [[f64; 3]; 4],
}

impl MicArray {
    /// Regular tetrahedron with edge length `spacing`.
    pub fn tetrahedron(spacing: f64) -> Self {
        let circumradius = spacing / (2.0 * SIN_60);
        let base_y = -spacing / (2.0 * TAN_60);
        let height = (spacing * spacing - circumradius * circumradius).max(0.0).sqrt();

        let mut positions = [
            [0.0, 0.0, height],
            [0.0, circumradius, 0.0],
            [spacing / 2.0, base_y, 0.0],
            [-spacing / 2.0, base_y, 0.0],
        ];
        let centroid_z = height / 4.0;
        for p in positions.iter_mut() {
            p[2] -= centroid_z;
        }
        Self { positions }
    }

    pub fn from_positions(positions: [[f64; 3]; 4]) -> Self {
        Self { positions }
    }

    pub fn positions(&self) -> &[[f64; 3]; 4] {
        &self.positions
    }

    /// Rejects coincident or non-finite microphone positions.
    pub fn validate(&self) -> Result<()> {
        for (i, a) in self.positions.iter().enumerate() {
            if a.iter().any(|c| !c.is_finite()) {
                return Err(Error::config(format!("mic {} has a non-finite position", i)));
            }
            for (j, b) in self.positions.iter().enumerate().skip(i + 1) {
                let d = distance(a, b);
                if d <= 1e-6 {
                    return Err(Error::config(format!(
                        "mics {} and {} are {:.2e} m apart; geometry is degenerate",
                        i, j, d
                    )));
                }
            }
        }
        Ok(())
    }

    /// Arrival time at each mic, in samples, for a source at `point`.
    pub fn arrival_delays(&self, point: &[f64; 3], samples_per_meter: f64) -> [f64; 4] {
        let mut delays = [0.0; 4];
        for (delay, mic) in delays.iter_mut().zip(self.positions.iter()) {
            *delay = distance(point, mic) * samples_per_meter;
        }
        delays
    }

    /// `(t0 - t1, t0 - t2, t0 - t3)` in samples.
    pub fn delay_signature(&self, point: &[f64; 3], samples_per_meter: f64) -> [f64; 3] {
        let t = self.arrival_delays(point, samples_per_meter);
        [t[0] - t[1], t[0] - t[2], t[0] - t[3]]
    }
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
