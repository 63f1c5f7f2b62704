use std::f64::consts::PI;

/// `n` quasi-uniform points on the unit sphere, laid out on a golden-angle spiral.
pub fn golden_spiral(n: usize) -> Vec<[f64; 3]> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![[0.0, 0.0, 1.0]];
    }

    let golden_angle = PI * (3.0 - 5.0f64.sqrt());
    let count = n as f64;
    (0..n)
        .map(|i| {
            let theta = i as f64 * golden_angle;
            let z = (1.0 - 1.0 / count) * (1.0 - (2 * i) as f64 / (count - 1.0));
            let r = (1.0 - z * z).max(0.0).sqrt();
            [r * theta.cos(), r * theta.sin(), z]
        })
        .collect()
}

/// Largest nearest-neighbour angle (radians) among `points`.
///
/// Quadratic in the point count; meant for sampled diagnostics only.
pub fn max_min_angle(points: &[[f64; 3]]) -> f64 {
    let mut worst = 0.0f64;
    for (i, a) in points.iter().enumerate() {
        let mut nearest = f64::MAX;
        for (j, b) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            let dot = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
            let len = (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
                * (b[0] * b[0] + b[1] * b[1] + b[2] * b[2]).sqrt();
            let angle = (dot / len).clamp(-1.0, 1.0).acos();
            nearest = nearest.min(angle);
        }
        if nearest != f64::MAX {
            worst = worst.max(nearest);
        }
    }
    worst
}
