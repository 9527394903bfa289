//! Learned predictors (§4.4 Learned Group model, §4.5 Root RMI): a single
//! least-squares linear fit, and the two-stage RMI built from it.

/// `y = slope * x + intercept`, fit by ordinary least squares over
/// `(key, position)` training pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModel {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearModel {
    /// Fit to `points`, a slice of `(key, position)` pairs. Falls back to
    /// the identity-ish constant `intercept = mean(y)`, `slope = 0` when
    /// there are fewer than two distinct `x` values (a degenerate fit
    /// would otherwise divide by zero).
    pub fn fit(points: &[(f64, f64)]) -> Self {
        let n = points.len() as f64;
        if points.is_empty() {
            return Self::default();
        }
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let mut num = 0.0;
        let mut den = 0.0;
        for (x, y) in points {
            num += (x - mean_x) * (y - mean_y);
            den += (x - mean_x) * (x - mean_x);
        }
        if den.abs() < f64::EPSILON {
            return Self {
                slope: 0.0,
                intercept: mean_y,
            };
        }
        let slope = num / den;
        let intercept = mean_y - slope * mean_x;
        Self { slope, intercept }
    }

    #[inline]
    pub fn predict(&self, key: u64) -> f64 {
        self.slope * (key as f64) + self.intercept
    }

    /// Max absolute error of this model against `points`, rounded up —
    /// the error bound used to size exponential search windows.
    pub fn error_bound(&self, points: &[(f64, f64)]) -> usize {
        points
            .iter()
            .map(|(x, y)| (self.predict(*x as u64) - y).abs().ceil() as usize)
            .max()
            .unwrap_or(0)
    }
}

/// Two-stage Recursive Model Index (§4.5): one linear stage-1 fit routes
/// each key to a stage-2 submodel, which makes the final prediction.
#[derive(Debug, Clone)]
pub struct TwoStageRmi {
    stage1: LinearModel,
    stage2: Vec<LinearModel>,
}

/// Cap on adjust-loop iterations (§4.5 "default 10").
const DEFAULT_TRAIN_TIMES: usize = 10;

impl TwoStageRmi {
    /// `train(points, err_bound)`: fit stage-1 on all `points`, then run
    /// the adjust loop that grows or shrinks the stage-2 submodel count
    /// `M` until the average prediction error lands in
    /// `[err_bound/2, err_bound]`, oscillates, or `DEFAULT_TRAIN_TIMES` is
    /// exhausted.
    pub fn train(points: &[(u64, usize)], err_bound: usize) -> Self {
        if points.is_empty() {
            return Self {
                stage1: LinearModel::default(),
                stage2: vec![LinearModel::default()],
            };
        }
        let xy: Vec<(f64, f64)> = points.iter().map(|(k, i)| (*k as f64, *i as f64)).collect();
        let stage1 = LinearModel::fit(&xy);

        let n = points.len();
        let err_bound = err_bound.max(1);
        let mut m = (n / (err_bound * 4)).max(1);
        let mut prev_m: Option<usize> = None;
        let mut prev_prev_m: Option<usize> = None;

        let mut stage2 = Self::fit_stage2(&xy, &stage1, m);
        for _ in 0..DEFAULT_TRAIN_TIMES {
            let avg_err = Self::average_error(&xy, &stage1, &stage2, m);
            if avg_err <= err_bound as f64 && avg_err >= (err_bound as f64) / 2.0 {
                break;
            }
            if Some(m) == prev_prev_m {
                // oscillating between two values of M: stop per §4.5.
                break;
            }
            prev_prev_m = prev_m;
            prev_m = Some(m);
            if avg_err > err_bound as f64 {
                let growth = ((avg_err / err_bound as f64).ceil() as usize).max(2);
                m = (m * growth).min(n.max(1));
            } else {
                m = (m / 2).max(1);
            }
            stage2 = Self::fit_stage2(&xy, &stage1, m);
        }

        Self { stage1, stage2 }
    }

    fn fit_stage2(xy: &[(f64, f64)], stage1: &LinearModel, m: usize) -> Vec<LinearModel> {
        let mut buckets: Vec<Vec<(f64, f64)>> = vec![Vec::new(); m.max(1)];
        for (x, y) in xy {
            let idx = stage1.predict(*x as u64).clamp(0.0, (m.max(1) - 1) as f64) as usize;
            buckets[idx].push((*x, *y));
        }
        buckets.iter().map(|pts| LinearModel::fit(pts)).collect()
    }

    fn average_error(xy: &[(f64, f64)], stage1: &LinearModel, stage2: &[LinearModel], m: usize) -> f64 {
        if xy.is_empty() {
            return 0.0;
        }
        let total: f64 = xy
            .iter()
            .map(|(x, y)| {
                let idx = stage1.predict(*x as u64).clamp(0.0, (m.max(1) - 1) as f64) as usize;
                let pred = stage2[idx].predict(*x as u64);
                (pred - y).abs()
            })
            .sum();
        total / xy.len() as f64
    }

    /// Predict a final position, clamped to `[0, n)`.
    pub fn predict(&self, key: u64, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let m = self.stage2.len().max(1);
        let idx = self.stage1.predict(key).clamp(0.0, (m - 1) as f64) as usize;
        let raw = self.stage2[idx].predict(key);
        raw.clamp(0.0, (n - 1) as f64) as usize
    }
}
