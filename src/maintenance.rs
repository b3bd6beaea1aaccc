use log::info;
use ndarray::{Array2, Zip};
use serde::Serialize;

use crate::common::percentile;
use crate::model::GrowingNetwork;
use crate::params::Moments;

pub const SLEEP_DECAY: f32 = 0.9995;
pub const SIESTA_DECAY: f32 = 0.9999;
/// Weights above this percentile of |w| are reinforced.
pub const REINFORCE_PERCENTILE: f32 = 90.0;
pub const BIAS_CLIP: f32 = 2.0;

/// Outcome of one maintenance pass, summed over both weight matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MaintenanceReport {
    pub pruned: usize,
    pub reinforced: usize,
    /// Nonzero weights remaining after the pass.
    pub active: usize,
}

impl GrowingNetwork {
    /// Deep consolidation. Prunes the weakest `prune_fraction` (0..=1) of the
    /// nonzero weights in each matrix along with their Adam moments, scales the
    /// strongest tenth by `reinforce_factor`, decays everything by
    /// [`SLEEP_DECAY`] and clips both biases to `[-2, 2]`.
    pub fn sleep(&mut self, prune_fraction: f32, reinforce_factor: f32) -> MaintenanceReport {
        let report = self.consolidate(Some(prune_fraction), reinforce_factor, SLEEP_DECAY);
        info!(
            "sleep: pruned {}, reinforced {}, {} active weights",
            report.pruned, report.reinforced, report.active
        );
        report
    }

    /// Light consolidation: reinforcement and [`SIESTA_DECAY`] only, nothing is pruned.
    pub fn rest_lightly(&mut self, reinforce_factor: f32) -> MaintenanceReport {
        let report = self.consolidate(None, reinforce_factor, SIESTA_DECAY);
        info!(
            "siesta: reinforced {}, {} active weights",
            report.reinforced, report.active
        );
        report
    }

    fn consolidate(&mut self, prune_fraction: Option<f32>, reinforce_factor: f32, decay: f32) -> MaintenanceReport {
        let params = &mut self.params;
        let mut report = MaintenanceReport::default();
        for (weights, moments) in [
            (&mut params.w_embed, &mut params.adam_w_embed),
            (&mut params.w_out, &mut params.adam_w_out),
        ] {
            let matrix = consolidate_matrix(weights, moments, prune_fraction, reinforce_factor, decay);
            report.pruned += matrix.pruned;
            report.reinforced += matrix.reinforced;
            report.active += matrix.active;
        }
        params.b_hidden.mapv_inplace(|b| b.clamp(-BIAS_CLIP, BIAS_CLIP));
        params.b_out.mapv_inplace(|b| b.clamp(-BIAS_CLIP, BIAS_CLIP));
        params.assert_consistent();
        report
    }
}

fn count_nonzero(weights: &Array2<f32>) -> usize {
    weights.iter().filter(|w| **w != 0.0).count()
}

fn consolidate_matrix(
    weights: &mut Array2<f32>,
    moments: &mut Moments,
    prune_fraction: Option<f32>,
    reinforce_factor: f32,
    decay: f32,
) -> MaintenanceReport {
    let before = count_nonzero(weights);

    if let Some(fraction) = prune_fraction.filter(|p| *p > 0.0) {
        let magnitudes: Vec<f32> = weights.iter().filter(|w| **w != 0.0).map(|w| w.abs()).collect();
        let threshold = percentile(&magnitudes, fraction.clamp(0.0, 1.0) * 100.0);
        Zip::from(&mut *weights)
            .and(&mut moments.m)
            .and(&mut moments.v)
            .for_each(|w, m, v| {
                if w.abs() < threshold {
                    *w = 0.0;
                    *m = 0.0;
                    *v = 0.0;
                }
            });
    }
    let pruned = before - count_nonzero(weights);

    let magnitudes: Vec<f32> = weights.iter().map(|w| w.abs()).collect();
    let strong = percentile(&magnitudes, REINFORCE_PERCENTILE);
    let mut reinforced = 0;
    weights.mapv_inplace(|w| {
        if w.abs() > strong {
            reinforced += 1;
            w * reinforce_factor
        } else {
            w
        }
    });

    weights.mapv_inplace(|w| w * decay);

    MaintenanceReport {
        pruned,
        reinforced,
        active: count_nonzero(weights),
    }
}
