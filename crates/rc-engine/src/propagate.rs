//! Prior propagation: turns a completed fit's posterior into fresh child
//! databases.
//!
//! The parent database holds three relocated seed tables: the request grid,
//! the predictions at the point estimate and the predictions at every
//! posterior sample. Each request's tag is the join key. Per child, a full
//! table set is assembled in memory and only then written, so a partially
//! built child database is never visible on disk; siblings already written
//! when a later child fails stay valid and standalone.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use rc_data::{AllNodeRegistry, FitDatabase};
use rc_types::{
    CascadeResult, ConsistencyError, CovariateRow, DensityId, LogKind, LookupError, NodeId,
    PriorId, SeedQuantity, SeedTag, SmoothGridRow, SmoothId, SmoothRow, TableSet,
    PARENT_NODE_OPTION,
};

/// One child database to materialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildTarget {
    pub node_id: NodeId,
    pub name: String,
    pub database: PathBuf,
}

/// Create one new database per child from the parent's posterior.
///
/// Children are independent of each other and are assembled in parallel;
/// the first failure aborts the batch.
pub fn create_child_databases(
    parent: &TableSet,
    registry: &AllNodeRegistry,
    children: &[ChildTarget],
) -> CascadeResult<Vec<PathBuf>> {
    if children.is_empty() {
        return Ok(Vec::new());
    }
    let stats = collect_seed_stats(parent)?;
    children
        .par_iter()
        .map(|child| {
            let tables = build_child_tables(parent, registry, &stats, child)?;
            FitDatabase::create(&child.database, tables)?;
            info!(
                "seeded child database for {} at {}",
                child.name,
                child.database.display()
            );
            Ok(child.database.clone())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Posterior statistics
// ---------------------------------------------------------------------------

struct SeedStats {
    point: HashMap<SeedTag, f64>,
    samples: HashMap<SeedTag, Vec<f64>>,
}

impl SeedStats {
    /// Point estimate and non-empty sample list for one key.
    fn seed(&self, tag: SeedTag) -> Result<(f64, &[f64]), ConsistencyError> {
        let missing = || ConsistencyError::MissingSeedKey {
            key: tag.to_string(),
        };
        let point = *self.point.get(&tag).ok_or_else(missing)?;
        let samples = self
            .samples
            .get(&tag)
            .filter(|samples| !samples.is_empty())
            .ok_or_else(missing)?;
        Ok((point, samples.as_slice()))
    }
}

fn collect_seed_stats(parent: &TableSet) -> CascadeResult<SeedStats> {
    let mut keys = Vec::with_capacity(parent.seed_requests.len());
    let mut unique = HashSet::new();
    for request in &parent.seed_requests {
        if !unique.insert(request.tag) {
            return Err(ConsistencyError::DuplicateSeedKey {
                key: request.tag.to_string(),
            }
            .into());
        }
        keys.push(request.tag);
    }

    let mut point = HashMap::new();
    for prediction in &parent.seed_predict_fit {
        let tag = *keys
            .get(prediction.request_id)
            .ok_or(LookupError::TableRow {
                table: "seed_request",
                id: prediction.request_id,
            })?;
        if point.insert(tag, prediction.value).is_some() {
            return Err(ConsistencyError::DuplicateSeedKey {
                key: tag.to_string(),
            }
            .into());
        }
    }

    // Sample order within a key follows row order, which the engine keeps
    // monotone in sample index.
    let mut samples: HashMap<SeedTag, Vec<f64>> = HashMap::new();
    for prediction in &parent.seed_predict_sample {
        let tag = *keys
            .get(prediction.request_id)
            .ok_or(LookupError::TableRow {
                table: "seed_request",
                id: prediction.request_id,
            })?;
        samples.entry(tag).or_default().push(prediction.value);
    }

    Ok(SeedStats { point, samples })
}

/// Sample standard deviation about the fitted point estimate, (n - 1)
/// denominator; 0 when there are fewer than two samples.
fn sample_std(center: f64, samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|value| (value - center) * (value - center))
        .sum();
    (sum_sq / (samples.len() - 1) as f64).sqrt()
}

// ---------------------------------------------------------------------------
// Child assembly
// ---------------------------------------------------------------------------

/// Clones smoothings from the parent into a child table set, giving every
/// new smoothing and prior a fresh unique name.
struct SmoothCloner<'a> {
    parent: &'a TableSet,
    gaussian_density: DensityId,
    fresh_index: usize,
}

impl<'a> SmoothCloner<'a> {
    fn fresh_name(&mut self, base: &str) -> String {
        self.fresh_index += 1;
        format!("{base}_{}", self.fresh_index)
    }

    /// The smoothing to clone, after checking it carries no grid-level
    /// std-scale prior.
    fn checked_smooth(&self, smooth_id: SmoothId) -> Result<&'a SmoothRow, ConsistencyError> {
        let smooth = self
            .parent
            .smooths
            .get(smooth_id)
            .ok_or_else(|| ConsistencyError::InvalidJobTable {
                message: format!("dangling smooth id {smooth_id}"),
            })?;
        if smooth.has_grid_scale_prior() {
            return Err(ConsistencyError::GridScalePrior {
                smoothing: smooth.name.clone(),
            });
        }
        Ok(smooth)
    }

    /// Clone `smooth_id` into `child`, rebuilding each value prior from the
    /// posterior: Gaussian, mean = point estimate, std = sample standard
    /// deviation for the (quantity, node, age, time) key. Difference priors
    /// are deep-copied unchanged in content.
    fn clone_seeded(
        &mut self,
        child: &mut TableSet,
        stats: &SeedStats,
        smooth_id: SmoothId,
        quantity: SeedQuantity,
        key_node: Option<NodeId>,
    ) -> CascadeResult<SmoothId> {
        let parent = self.parent;
        let base_name = self.checked_smooth(smooth_id)?.name.clone();
        let new_id = child.smooths.len();
        let name = self.fresh_name(&base_name);
        child.smooths.push(SmoothRow::new(&name));

        for grid in parent.grid_of(smooth_id) {
            let value_prior = match grid.value_prior {
                None => None,
                Some(prior_id) => {
                    let base = parent.prior(prior_id)?;
                    let tag = SeedTag {
                        quantity,
                        node_id: key_node,
                        age_id: grid.age_id,
                        time_id: grid.time_id,
                    };
                    let (mean, samples) = stats.seed(tag)?;
                    let mut prior = base.clone();
                    prior.name = self.fresh_name(&base.name);
                    prior.density_id = self.gaussian_density;
                    prior.mean = mean;
                    prior.std = Some(sample_std(mean, samples));
                    child.priors.push(prior);
                    Some(child.priors.len() - 1)
                }
            };
            let age_diff_prior = self.copy_prior(child, grid.age_diff_prior)?;
            let time_diff_prior = self.copy_prior(child, grid.time_diff_prior)?;
            child.smooth_grids.push(SmoothGridRow {
                smooth_id: new_id,
                age_id: grid.age_id,
                time_id: grid.time_id,
                value_prior,
                age_diff_prior,
                time_diff_prior,
                const_value: grid.const_value,
            });
        }
        Ok(new_id)
    }

    /// Clone `smooth_id` into `child` with every prior deep-copied
    /// unchanged in content. Used for smoothings that have no prediction
    /// keys (random effects, constraint grids).
    fn clone_verbatim(
        &mut self,
        child: &mut TableSet,
        smooth_id: SmoothId,
    ) -> CascadeResult<SmoothId> {
        let parent = self.parent;
        let base_name = self.checked_smooth(smooth_id)?.name.clone();
        let new_id = child.smooths.len();
        let name = self.fresh_name(&base_name);
        child.smooths.push(SmoothRow::new(&name));

        for grid in parent.grid_of(smooth_id) {
            let value_prior = self.copy_prior(child, grid.value_prior)?;
            let age_diff_prior = self.copy_prior(child, grid.age_diff_prior)?;
            let time_diff_prior = self.copy_prior(child, grid.time_diff_prior)?;
            child.smooth_grids.push(SmoothGridRow {
                smooth_id: new_id,
                age_id: grid.age_id,
                time_id: grid.time_id,
                value_prior,
                age_diff_prior,
                time_diff_prior,
                const_value: grid.const_value,
            });
        }
        Ok(new_id)
    }

    fn copy_prior(
        &mut self,
        child: &mut TableSet,
        prior_id: Option<PriorId>,
    ) -> CascadeResult<Option<PriorId>> {
        let Some(prior_id) = prior_id else {
            return Ok(None);
        };
        let base = self.parent.prior(prior_id)?;
        let mut prior = base.clone();
        prior.name = self.fresh_name(&base.name);
        child.priors.push(prior);
        Ok(Some(child.priors.len() - 1))
    }
}

fn build_child_tables(
    parent: &TableSet,
    registry: &AllNodeRegistry,
    stats: &SeedStats,
    child: &ChildTarget,
) -> CascadeResult<TableSet> {
    let fit_node_id = parent.parent_node_id()?;
    if parent.nodes.parent(child.node_id) != Some(fit_node_id) {
        return Err(ConsistencyError::NotAChild {
            node: child.name.clone(),
            parent: parent.parent_node_name()?.to_string(),
        }
        .into());
    }
    let gaussian_density = parent.gaussian_density_id()?;

    let mut tables = TableSet::new();

    // pass-through tables
    tables.ages = parent.ages.clone();
    tables.times = parent.times.clone();
    tables.densities = parent.densities.clone();
    tables.integrands = parent.integrands.clone();
    tables.nodes = parent.nodes.clone();
    tables.subgroups = parent.subgroups.clone();
    tables.weights = parent.weights.clone();
    tables.data = parent.data.clone();

    tables.options = parent.options.clone();
    tables.set_option(PARENT_NODE_OPTION, &child.name);

    tables.covariates = parent
        .covariates
        .iter()
        .map(|covariate| {
            let reference = registry
                .covariate_reference(child.node_id, &covariate.name)
                .ok_or_else(|| LookupError::CovariateReference {
                    node: child.name.clone(),
                    covariate: covariate.name.clone(),
                })?;
            Ok(CovariateRow {
                reference,
                ..covariate.clone()
            })
        })
        .collect::<CascadeResult<Vec<_>>>()?;

    // Smoothing tables start as the parent's; touched smoothings are cloned
    // fresh below and the multiplier/rate rows re-pointed at the clones.
    // Untouched smoothings keep the parent's original priors.
    tables.multipliers = parent.multipliers.clone();
    tables.rates = parent.rates.clone();
    tables.smooths = parent.smooths.clone();
    tables.smooth_grids = parent.smooth_grids.clone();
    tables.priors = parent.priors.clone();

    let mut cloner = SmoothCloner {
        parent,
        gaussian_density,
        fresh_index: 0,
    };

    for multiplier_id in 0..parent.multipliers.len() {
        let row = &parent.multipliers[multiplier_id];
        if row.subgroup_smooth_id.is_some() {
            return Err(ConsistencyError::SubgroupSmoothing {
                multiplier: multiplier_id,
            }
            .into());
        }
        if let Some(smooth_id) = row.group_smooth_id {
            let new_id = cloner.clone_seeded(
                &mut tables,
                stats,
                smooth_id,
                SeedQuantity::Multiplier(multiplier_id),
                None,
            )?;
            tables.multipliers[multiplier_id].group_smooth_id = Some(new_id);
        }
    }

    for rate_id in 0..parent.rates.len() {
        let row = &parent.rates[rate_id];
        if let Some(smooth_id) = row.parent_smooth_id {
            // Only primary rates have prediction keys; the background rate's
            // constraint grid is carried over as constants.
            let new_id = if row.kind.is_primary() {
                cloner.clone_seeded(
                    &mut tables,
                    stats,
                    smooth_id,
                    SeedQuantity::Rate(rate_id),
                    Some(child.node_id),
                )?
            } else {
                cloner.clone_verbatim(&mut tables, smooth_id)?
            };
            tables.rates[rate_id].parent_smooth_id = Some(new_id);
        }
        if let Some(smooth_id) = row.child_smooth_id {
            let new_id = cloner.clone_verbatim(&mut tables, smooth_id)?;
            tables.rates[rate_id].child_smooth_id = Some(new_id);
        }
    }

    tables.add_log(
        LogKind::Note,
        format!("seeded from fit of {}", parent.parent_node_name()?),
    );
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed;
    use crate::testworld;
    use rc_types::{CascadeError, DensityKind, Prediction, PriorRow, RateKind};
    use tempfile::tempdir;

    /// A parent whose every seed key has the given point estimate and
    /// posterior samples.
    fn seeded_parent(point: f64, samples: &[f64]) -> TableSet {
        let registry = testworld::registry();
        let mut tables = testworld::root_tables();
        seed::build_seed_requests(&mut tables, &registry).unwrap();
        tables.seed_requests = std::mem::take(&mut tables.requests);

        for request_id in 0..tables.seed_requests.len() {
            tables.seed_predict_fit.push(Prediction {
                request_id,
                sample_index: None,
                value: point,
            });
            for (sample_index, &value) in samples.iter().enumerate() {
                tables.seed_predict_sample.push(Prediction {
                    request_id,
                    sample_index: Some(sample_index),
                    value,
                });
            }
        }
        tables
    }

    fn child_a() -> ChildTarget {
        ChildTarget {
            node_id: 1,
            name: "child_a".to_string(),
            database: PathBuf::from("/unused"),
        }
    }

    fn incidence_value_priors(tables: &TableSet) -> Vec<&PriorRow> {
        let (_, rate) = tables.rate(RateKind::Incidence).unwrap();
        let smooth_id = rate.parent_smooth_id.unwrap();
        tables
            .grid_of(smooth_id)
            .map(|grid| tables.prior(grid.value_prior.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn numeric_example() {
        // Point estimate 0.02 with samples {0.018, 0.020, 0.022} gives a
        // Gaussian child prior with mean 0.020 and std 0.002.
        let parent = seeded_parent(0.02, &[0.018, 0.020, 0.022]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();
        let gaussian = child.gaussian_density_id().unwrap();

        for prior in incidence_value_priors(&child) {
            assert_eq!(prior.density_id, gaussian);
            assert_eq!(prior.mean, 0.02);
            assert!((prior.std.unwrap() - 0.002).abs() < 1e-12);
        }
    }

    #[test]
    fn degenerate_posterior_gives_zero_std() {
        let parent = seeded_parent(0.05, &[0.05, 0.05, 0.05]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();
        for prior in incidence_value_priors(&child) {
            assert_eq!(prior.mean, 0.05);
            assert_eq!(prior.std, Some(0.0));
        }
    }

    #[test]
    fn sample_std_matches_hand_computation() {
        assert!((sample_std(0.02, &[0.018, 0.020, 0.022]) - 0.002).abs() < 1e-12);
        assert_eq!(sample_std(1.0, &[1.0]), 0.0);
        assert_eq!(sample_std(1.0, &[]), 0.0);
    }

    #[test]
    fn difference_priors_are_deep_copied_unchanged() {
        let parent = seeded_parent(0.02, &[0.019, 0.021]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();
        let (_, rate) = child.rate(RateKind::Incidence).unwrap();
        let smooth_id = rate.parent_smooth_id.unwrap();
        let first = child.grid_of(smooth_id).next().unwrap();

        let dage = child.prior(first.age_diff_prior.unwrap()).unwrap();
        let original = &parent.priors[1];
        assert_ne!(dage.name, original.name);
        assert_eq!(dage.density_id, original.density_id);
        assert_eq!(dage.mean, original.mean);
        assert_eq!(dage.std, original.std);
    }

    #[test]
    fn new_prior_names_are_unique() {
        let parent = seeded_parent(0.02, &[0.019, 0.021]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();
        let mut names: Vec<&str> = child.priors.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn rewrites_parent_option_and_covariate_references() {
        let parent = seeded_parent(0.02, &[0.019, 0.021]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();
        assert_eq!(child.parent_node_name().unwrap(), "child_a");
        assert_eq!(child.covariates[0].reference, testworld::CHILD_A_INCOME);
        // everything else about the covariate row is untouched
        assert_eq!(child.covariates[0].name, "income");
    }

    #[test]
    fn missing_covariate_reference_fails() {
        let parent = seeded_parent(0.02, &[0.019, 0.021]);
        let mut registry_tables = testworld::registry_tables();
        registry_tables.covariate_references.clear();
        let registry = rc_data::AllNodeRegistry::from_tables(&registry_tables).unwrap();
        let stats = collect_seed_stats(&parent).unwrap();

        let result = build_child_tables(&parent, &registry, &stats, &child_a());
        assert!(matches!(result, Err(CascadeError::Lookup(_))));
    }

    #[test]
    fn grid_scale_prior_aborts_propagation() {
        let mut parent = seeded_parent(0.02, &[0.019, 0.021]);
        parent.smooths[0].value_scale_prior = Some(0);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let result = build_child_tables(&parent, &registry, &stats, &child_a());
        assert!(matches!(
            result,
            Err(CascadeError::Consistency(
                ConsistencyError::GridScalePrior { .. }
            ))
        ));
    }

    #[test]
    fn duplicate_point_prediction_is_fatal() {
        let mut parent = seeded_parent(0.02, &[0.019, 0.021]);
        parent.seed_predict_fit.push(Prediction {
            request_id: 0,
            sample_index: None,
            value: 0.03,
        });

        let result = collect_seed_stats(&parent);
        assert!(matches!(
            result,
            Err(CascadeError::Consistency(
                ConsistencyError::DuplicateSeedKey { .. }
            ))
        ));
    }

    #[test]
    fn duplicate_request_key_is_fatal() {
        let mut parent = seeded_parent(0.02, &[0.019, 0.021]);
        let duplicate = parent.seed_requests[0].clone();
        parent.seed_requests.push(duplicate);

        let result = collect_seed_stats(&parent);
        assert!(matches!(
            result,
            Err(CascadeError::Consistency(
                ConsistencyError::DuplicateSeedKey { .. }
            ))
        ));
    }

    #[test]
    fn missing_samples_are_fatal() {
        let mut parent = seeded_parent(0.02, &[0.019, 0.021]);
        parent.seed_predict_sample.clear();
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let result = build_child_tables(&parent, &registry, &stats, &child_a());
        assert!(matches!(
            result,
            Err(CascadeError::Consistency(
                ConsistencyError::MissingSeedKey { .. }
            ))
        ));
    }

    #[test]
    fn target_must_be_a_child_of_the_fit_node() {
        let parent = seeded_parent(0.02, &[0.019, 0.021]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let target = ChildTarget {
            node_id: 0,
            name: "world".to_string(),
            database: PathBuf::from("/unused"),
        };
        let result = build_child_tables(&parent, &registry, &stats, &target);
        assert!(matches!(
            result,
            Err(CascadeError::Consistency(ConsistencyError::NotAChild { .. }))
        ));
    }

    #[test]
    fn child_output_tables_start_empty() {
        let parent = seeded_parent(0.02, &[0.019, 0.021]);
        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();

        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();
        assert!(child.fit_results.is_empty());
        assert!(child.samples.is_empty());
        assert!(child.requests.is_empty());
        assert!(child.predictions.is_empty());
        assert!(child.seed_requests.is_empty());
        assert!(child.seed_predict_fit.is_empty());
        assert!(child.seed_predict_sample.is_empty());
        // pass-through tables are verbatim copies
        assert_eq!(child.ages, parent.ages);
        assert_eq!(child.times, parent.times);
        assert_eq!(child.data, parent.data);
        assert_eq!(child.nodes, parent.nodes);
    }

    #[test]
    fn random_effect_smoothing_is_cloned_verbatim() {
        let mut parent = seeded_parent(0.02, &[0.019, 0.021]);
        // a one-point random-effect grid with a Gaussian prior around zero
        parent.priors.push(PriorRow {
            name: "incidence_child_value".to_string(),
            density_id: 1,
            lower: None,
            upper: None,
            mean: 0.0,
            std: Some(0.3),
            eta: None,
            nu: None,
        });
        let effect_prior = parent.priors.len() - 1;
        parent.smooths.push(SmoothRow::new("incidence_child"));
        let effect_smooth = parent.smooths.len() - 1;
        parent.smooth_grids.push(SmoothGridRow {
            smooth_id: effect_smooth,
            age_id: 0,
            time_id: 0,
            value_prior: Some(effect_prior),
            age_diff_prior: None,
            time_diff_prior: None,
            const_value: None,
        });
        let (rate_id, _) = parent.rate(RateKind::Incidence).unwrap();
        parent.rates[rate_id].child_smooth_id = Some(effect_smooth);

        let registry = testworld::registry();
        let stats = collect_seed_stats(&parent).unwrap();
        let child = build_child_tables(&parent, &registry, &stats, &child_a()).unwrap();

        let cloned_smooth = child.rates[rate_id].child_smooth_id.unwrap();
        assert_ne!(cloned_smooth, effect_smooth);
        let grid = child.grid_of(cloned_smooth).next().unwrap();
        let prior = child.prior(grid.value_prior.unwrap()).unwrap();
        // content unchanged: still centered at zero with the original std,
        // not rebuilt from predictions
        assert_eq!(prior.mean, 0.0);
        assert_eq!(prior.std, Some(0.3));
        assert_eq!(
            child.densities[prior.density_id].kind,
            DensityKind::Gaussian
        );
        assert_ne!(prior.name, "incidence_child_value");
    }

    #[test]
    fn writes_one_database_per_child() {
        let dir = tempdir().unwrap();
        let parent = seeded_parent(0.02, &[0.018, 0.020, 0.022]);
        let registry = testworld::registry();

        let targets = vec![
            ChildTarget {
                node_id: 1,
                name: "child_a".to_string(),
                database: dir.path().join("child_a").join("fit.json"),
            },
            ChildTarget {
                node_id: 2,
                name: "child_b".to_string(),
                database: dir.path().join("child_b").join("fit.json"),
            },
        ];
        let written = create_child_databases(&parent, &registry, &targets).unwrap();
        assert_eq!(written.len(), 2);

        let child_b = FitDatabase::open(&targets[1].database).unwrap();
        assert_eq!(child_b.tables.parent_node_name().unwrap(), "child_b");
        assert_eq!(
            child_b.tables.covariates[0].reference,
            testworld::CHILD_B_INCOME
        );
    }

    #[test]
    fn empty_target_list_is_a_no_op() {
        let parent = TableSet::new();
        let registry = testworld::registry();
        let written = create_child_databases(&parent, &registry, &[]).unwrap();
        assert!(written.is_empty());
    }
}
