//! Seed-request grid builder.
//!
//! Enumerates exactly the prediction points a completed fit must be
//! evaluated at to seed its children: every grid point of every covariate
//! multiplier with a group smoothing (node-independent), and every grid
//! point of every primary rate with a parent smoothing, once per child of
//! the fit node. Quantities with a null smoothing are omitted entirely, so
//! their child priors stay whatever the parent carried.

use tracing::debug;

use rc_data::AllNodeRegistry;
use rc_types::{
    CascadeResult, LookupError, NodeId, PredictionRequest, SeedQuantity, SeedTag, TableSet,
};

/// Replace the database's prediction-request table with the full grid of
/// points needed to seed children. Returns the number of rows written.
///
/// The row count is deterministic: Σ multiplier grid points +
/// Σ rate grid points × child count.
pub fn build_seed_requests(
    tables: &mut TableSet,
    registry: &AllNodeRegistry,
) -> CascadeResult<usize> {
    let fit_node_id = tables.parent_node_id()?;
    let children = tables.nodes.children(fit_node_id);
    let n_covariates = tables.covariates.len();

    let mut requests: Vec<PredictionRequest> = Vec::new();

    // Multiplier effects are node-independent: one row per grid point,
    // never multiplied by child count.
    for (multiplier_id, multiplier) in tables.multipliers.iter().enumerate() {
        let Some(smooth_id) = multiplier.group_smooth_id else {
            continue;
        };
        let integrand_id =
            tables.integrand_id(&TableSet::multiplier_integrand_name(multiplier_id))?;
        for grid in tables.grid_of(smooth_id) {
            let age = tables.age(grid.age_id)?;
            let time = tables.time(grid.time_id)?;
            requests.push(PredictionRequest {
                integrand_id,
                node_id: None,
                subgroup_id: 0,
                weight_id: None,
                age_lower: age,
                age_upper: age,
                time_lower: time,
                time_upper: time,
                covariates: vec![None; n_covariates],
                tag: SeedTag {
                    quantity: SeedQuantity::Multiplier(multiplier_id),
                    node_id: None,
                    age_id: grid.age_id,
                    time_id: grid.time_id,
                },
            });
        }
    }

    // Rate predictions are per child and carry the child's own covariate
    // reference values.
    let needs_children = tables
        .rates
        .iter()
        .any(|rate| rate.kind.is_primary() && rate.parent_smooth_id.is_some());
    let child_covariates: Vec<Vec<Option<f64>>> = if needs_children {
        children
            .iter()
            .map(|&child| covariate_references(tables, registry, child))
            .collect::<CascadeResult<_>>()?
    } else {
        Vec::new()
    };

    for (rate_id, rate) in tables.rates.iter().enumerate() {
        if !rate.kind.is_primary() {
            continue;
        }
        let Some(smooth_id) = rate.parent_smooth_id else {
            continue;
        };
        let integrand_id = tables.integrand_id(rate.kind.integrand_name())?;
        for grid in tables.grid_of(smooth_id) {
            let age = tables.age(grid.age_id)?;
            let time = tables.time(grid.time_id)?;
            for (child_index, &child) in children.iter().enumerate() {
                requests.push(PredictionRequest {
                    integrand_id,
                    node_id: Some(child),
                    subgroup_id: 0,
                    weight_id: None,
                    age_lower: age,
                    age_upper: age,
                    time_lower: time,
                    time_upper: time,
                    covariates: child_covariates[child_index].clone(),
                    tag: SeedTag {
                        quantity: SeedQuantity::Rate(rate_id),
                        node_id: Some(child),
                        age_id: grid.age_id,
                        time_id: grid.time_id,
                    },
                });
            }
        }
    }

    debug!(
        "built {} seed requests for node {} ({} children)",
        requests.len(),
        tables.parent_node_name()?,
        children.len(),
    );
    tables.requests = requests;
    Ok(tables.requests.len())
}

/// The child's reference value for every covariate, in covariate-table
/// order. Every covariate must have one.
fn covariate_references(
    tables: &TableSet,
    registry: &AllNodeRegistry,
    child: NodeId,
) -> CascadeResult<Vec<Option<f64>>> {
    tables
        .covariates
        .iter()
        .map(|covariate| {
            let reference = registry
                .covariate_reference(child, &covariate.name)
                .ok_or_else(|| LookupError::CovariateReference {
                    node: tables.nodes.name(child).unwrap_or("?").to_string(),
                    covariate: covariate.name.clone(),
                })?;
            Ok(Some(reference))
        })
        .collect()
}
