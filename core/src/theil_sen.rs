//! Theil-Sen line fit over per-tone phases.
//!
//! The slope is the median of all pairwise slopes, which keeps a few
//! erased or wrapped tones from dragging the sampling-frequency estimate
//! around the way a least-squares fit would.

pub struct TheilSen {
    slope: f32,
    intercept: f32,
}

impl TheilSen {
    pub fn fit(x: &[f32], y: &[f32]) -> Self {
        debug_assert_eq!(x.len(), y.len());
        let mut slopes = Vec::with_capacity(x.len() * (x.len() - 1) / 2);
        for i in 0..x.len() {
            for j in i + 1..x.len() {
                let dx = x[j] - x[i];
                if dx != 0.0 {
                    slopes.push((y[j] - y[i]) / dx);
                }
            }
        }
        let slope = median(&mut slopes);
        let mut residuals: Vec<f32> = x.iter().zip(y.iter()).map(|(&xi, &yi)| yi - slope * xi).collect();
        let intercept = median(&mut residuals);
        Self { slope, intercept }
    }

    pub fn slope(&self) -> f32 {
        self.slope
    }

    pub fn eval(&self, x: f32) -> f32 {
        self.slope * x + self.intercept
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    *m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_a_clean_line() {
        let x: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let y: Vec<f32> = x.iter().map(|&xi| 0.02 * xi - 0.5).collect();
        let fit = TheilSen::fit(&x, &y);
        assert!((fit.slope() - 0.02).abs() < 1e-5);
        assert!((fit.eval(0.0) + 0.5).abs() < 1e-4);
    }

    #[test]
    fn ignores_outliers() {
        let x: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let mut y: Vec<f32> = x.iter().map(|&xi| 0.01 * xi + 0.1).collect();
        for i in (0..64).step_by(9) {
            y[i] = 3.0;
        }
        let fit = TheilSen::fit(&x, &y);
        assert!((fit.slope() - 0.01).abs() < 2e-3, "slope {}", fit.slope());
    }
}
