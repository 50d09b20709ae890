//! A simulated fitting engine.
//!
//! [`SimulatedEngine`] derives fits, samples and predictions from the
//! model's own prior means: the fitted value of every grid point is its
//! value prior's mean (or its constant), and posterior samples spread
//! uniformly around the fit by a configurable noise half-width. Good enough
//! to exercise the whole cascade in tests and examples without a real
//! optimizer.

use rand::Rng;

use rc_types::{
    AgeId, EngineError, FitEngine, FitKind, FitResultRow, PosteriorSampleRow, PredictSource,
    Prediction, PerturbTarget, SampleMethod, SeedQuantity, SeedTag, TableSet, TimeId, VarTable,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedEngine {
    noise: f64,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posterior samples are drawn uniformly within ±`noise` of the fit.
    pub fn with_noise(noise: f64) -> Self {
        Self { noise }
    }
}

fn err(command: &str, message: impl Into<String>) -> EngineError {
    EngineError::CommandFailed {
        command: command.to_string(),
        message: message.into(),
    }
}

/// The engine's flattened variable space: one entry per grid point of every
/// multiplier group smoothing and primary-rate parent smoothing, in table
/// order.
fn model_vars(tables: &TableSet) -> Vec<(SeedQuantity, AgeId, TimeId)> {
    let mut vars = Vec::new();
    for (multiplier_id, multiplier) in tables.multipliers.iter().enumerate() {
        if let Some(smooth_id) = multiplier.group_smooth_id {
            for grid in tables.grid_of(smooth_id) {
                vars.push((
                    SeedQuantity::Multiplier(multiplier_id),
                    grid.age_id,
                    grid.time_id,
                ));
            }
        }
    }
    for (rate_id, rate) in tables.rates.iter().enumerate() {
        if !rate.kind.is_primary() {
            continue;
        }
        if let Some(smooth_id) = rate.parent_smooth_id {
            for grid in tables.grid_of(smooth_id) {
                vars.push((SeedQuantity::Rate(rate_id), grid.age_id, grid.time_id));
            }
        }
    }
    vars
}

fn var_index(
    vars: &[(SeedQuantity, AgeId, TimeId)],
    tag: SeedTag,
) -> Result<usize, EngineError> {
    vars.iter()
        .position(|&(quantity, age_id, time_id)| {
            quantity == tag.quantity && age_id == tag.age_id && time_id == tag.time_id
        })
        .ok_or_else(|| err("predict", format!("no model variable for {tag}")))
}

/// Prior mean (or constant) of one grid point.
fn grid_value(
    tables: &TableSet,
    quantity: SeedQuantity,
    age_id: AgeId,
    time_id: TimeId,
) -> Result<f64, EngineError> {
    let smooth_id = match quantity {
        SeedQuantity::Multiplier(id) => tables
            .multipliers
            .get(id)
            .and_then(|row| row.group_smooth_id),
        SeedQuantity::Rate(id) => tables.rates.get(id).and_then(|row| row.parent_smooth_id),
    }
    .ok_or_else(|| err("fit", "no smoothing for model variable"))?;

    let grid = tables
        .grid_of(smooth_id)
        .find(|grid| grid.age_id == age_id && grid.time_id == time_id)
        .ok_or_else(|| err("fit", "model variable has no grid point"))?;
    if let Some(value) = grid.const_value {
        return Ok(value);
    }
    let prior_id = grid
        .value_prior
        .ok_or_else(|| err("fit", "grid point has neither prior nor constant"))?;
    tables
        .priors
        .get(prior_id)
        .map(|prior| prior.mean)
        .ok_or_else(|| err("fit", format!("dangling prior id {prior_id}")))
}

impl FitEngine for SimulatedEngine {
    fn init(&self, tables: &mut TableSet) -> Result<(), EngineError> {
        tables.clear_outputs();
        Ok(())
    }

    fn hold_out(
        &self,
        tables: &mut TableSet,
        integrand: &str,
        max_fit: usize,
        _balance: Option<&rc_types::BalanceSpec>,
    ) -> Result<(), EngineError> {
        let integrand_id = tables
            .integrands
            .iter()
            .position(|row| row.name == integrand)
            .ok_or_else(|| err("hold_out", format!("unknown integrand {integrand}")))?;
        let mut kept = 0usize;
        for row in tables
            .data
            .iter_mut()
            .filter(|row| row.integrand_id == integrand_id && !row.hold_out)
        {
            if kept < max_fit {
                kept += 1;
            } else {
                row.hold_out = true;
            }
        }
        Ok(())
    }

    fn bound_covariate_effect(
        &self,
        tables: &mut TableSet,
        bound: f64,
    ) -> Result<(), EngineError> {
        let prior_ids: Vec<usize> = tables
            .multipliers
            .iter()
            .filter_map(|row| row.group_smooth_id)
            .flat_map(|smooth_id| {
                tables
                    .grid_of(smooth_id)
                    .filter_map(|grid| grid.value_prior)
                    .collect::<Vec<_>>()
            })
            .collect();
        for prior_id in prior_ids {
            let prior = tables
                .priors
                .get_mut(prior_id)
                .ok_or_else(|| err("bound_covariate_effect", "dangling prior id"))?;
            prior.lower = Some(prior.lower.map_or(-bound, |lower| lower.max(-bound)));
            prior.upper = Some(prior.upper.map_or(bound, |upper| upper.min(bound)));
        }
        Ok(())
    }

    fn perturb(
        &self,
        _tables: &mut TableSet,
        _target: PerturbTarget,
        sigma: f64,
    ) -> Result<(), EngineError> {
        if sigma < 0.0 {
            return Err(err("perturb", format!("negative sigma {sigma}")));
        }
        Ok(())
    }

    fn fit(&self, tables: &mut TableSet, _kind: FitKind) -> Result<(), EngineError> {
        let vars = model_vars(tables);
        let results = vars
            .iter()
            .map(|&(quantity, age_id, time_id)| {
                grid_value(tables, quantity, age_id, time_id).map(|value| FitResultRow { value })
            })
            .collect::<Result<Vec<_>, _>>()?;
        tables.fit_results = results;
        Ok(())
    }

    fn set(
        &self,
        _tables: &mut TableSet,
        _target: VarTable,
        _source: VarTable,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn simulate(&self, _tables: &mut TableSet, _count: usize) -> Result<(), EngineError> {
        Ok(())
    }

    fn sample(
        &self,
        tables: &mut TableSet,
        _method: SampleMethod,
        _kind: FitKind,
        count: usize,
    ) -> Result<(), EngineError> {
        if tables.fit_results.is_empty() {
            return Err(err("sample", "no fit to sample around"));
        }
        let mut rng = rand::rng();
        tables.samples.clear();
        for sample_index in 0..count {
            for (var_id, fit) in tables.fit_results.iter().enumerate() {
                let offset = if self.noise > 0.0 {
                    (rng.random::<f64>() - 0.5) * 2.0 * self.noise
                } else {
                    0.0
                };
                tables.samples.push(PosteriorSampleRow {
                    sample_index,
                    var_id,
                    value: fit.value + offset,
                });
            }
        }
        Ok(())
    }

    fn predict(&self, tables: &mut TableSet, source: PredictSource) -> Result<(), EngineError> {
        let vars = model_vars(tables);
        let mut predictions = Vec::new();
        match source {
            PredictSource::FitResult => {
                if tables.fit_results.len() != vars.len() {
                    return Err(err("predict", "fit results out of step with the model"));
                }
                for (request_id, request) in tables.requests.iter().enumerate() {
                    let var_id = var_index(&vars, request.tag)?;
                    predictions.push(Prediction {
                        request_id,
                        sample_index: None,
                        value: tables.fit_results[var_id].value,
                    });
                }
            }
            PredictSource::Samples => {
                let sample_count = tables
                    .samples
                    .iter()
                    .map(|row| row.sample_index + 1)
                    .max()
                    .unwrap_or(0);
                for sample_index in 0..sample_count {
                    for (request_id, request) in tables.requests.iter().enumerate() {
                        let var_id = var_index(&vars, request.tag)?;
                        let value = tables
                            .samples
                            .iter()
                            .find(|row| row.sample_index == sample_index && row.var_id == var_id)
                            .map(|row| row.value)
                            .ok_or_else(|| err("predict", "missing sample row"))?;
                        predictions.push(Prediction {
                            request_id,
                            sample_index: Some(sample_index),
                            value,
                        });
                    }
                }
            }
        }
        tables.predictions = predictions;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed;
    use crate::testworld;

    #[test]
    fn fit_takes_prior_means() {
        let engine = SimulatedEngine::new();
        let mut tables = testworld::root_tables();

        engine.init(&mut tables).unwrap();
        engine.fit(&mut tables, FitKind::Both).unwrap();

        // 3 multiplier grid points + 2 rate grid points
        assert_eq!(tables.fit_results.len(), 5);
        assert_eq!(tables.fit_results[0].value, 0.1);
        assert_eq!(tables.fit_results[3].value, testworld::RATE_PRIOR_MEAN);
    }

    #[test]
    fn noiseless_samples_equal_the_fit() {
        let engine = SimulatedEngine::new();
        let mut tables = testworld::root_tables();
        engine.init(&mut tables).unwrap();
        engine.fit(&mut tables, FitKind::Both).unwrap();
        engine
            .sample(&mut tables, SampleMethod::Asymptotic, FitKind::Both, 3)
            .unwrap();

        assert_eq!(tables.samples.len(), 3 * tables.fit_results.len());
        for row in &tables.samples {
            assert_eq!(row.value, tables.fit_results[row.var_id].value);
        }
    }

    #[test]
    fn predictions_cover_every_request() {
        let engine = SimulatedEngine::new();
        let registry = testworld::registry();
        let mut tables = testworld::root_tables();
        engine.init(&mut tables).unwrap();
        engine.fit(&mut tables, FitKind::Both).unwrap();
        engine
            .sample(&mut tables, SampleMethod::Asymptotic, FitKind::Both, 2)
            .unwrap();
        seed::build_seed_requests(&mut tables, &registry).unwrap();

        engine.predict(&mut tables, PredictSource::FitResult).unwrap();
        assert_eq!(tables.predictions.len(), tables.requests.len());
        assert!(tables.predictions.iter().all(|p| p.sample_index.is_none()));

        engine.predict(&mut tables, PredictSource::Samples).unwrap();
        assert_eq!(tables.predictions.len(), 2 * tables.requests.len());
    }

    #[test]
    fn hold_out_keeps_the_first_max_fit_rows() {
        let engine = SimulatedEngine::new();
        let mut tables = testworld::root_tables();

        engine.hold_out(&mut tables, "incidence", 1, None).unwrap();
        let held_in = tables.data.iter().filter(|row| !row.hold_out).count();
        assert_eq!(held_in, 1);
    }
}
