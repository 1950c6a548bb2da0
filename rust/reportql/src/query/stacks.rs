//! Drill-down: re-aggregates every top-level bucket by the next stack dimension.

use super::{
    aggregate::{AggregatePlan, AggregationResult},
    dimensions, QueryContext, QueryEngine,
};
use crate::{
    error::{Result, ServiceError},
    filter::{BucketScope, FilterSpec},
    time::TimeBucket,
};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

pub(super) async fn attach(
    engine: &QueryEngine,
    ctx: &QueryContext,
    filter: &FilterSpec,
    plan: &AggregatePlan,
    results: Vec<AggregationResult>,
    depth: usize,
) -> Result<Vec<AggregationResult>> {
    let Some(stack) = filter.stacks.first().copied() else {
        return Ok(results);
    };
    let across = plan.dimension.descriptor.dimension;
    if !dimensions::stack_supported(ctx.domain, across, stack) {
        debug!(
            across = across.as_str(),
            stack = stack.as_str(),
            "stack not supported for across; returning flat results"
        );
        return Ok(results);
    }
    if depth >= engine.config().max_stack_depth {
        debug!(depth, "stack depth budget exhausted");
        return Ok(results);
    }

    // One semaphore per level: parents hold a permit while their children run.
    let permits = Arc::new(Semaphore::new(engine.config().stack_concurrency));
    let tasks = results
        .into_iter()
        .map(|bucket| {
            let scope = bucket_scope(plan, &bucket)?;
            let permits = Arc::clone(&permits);
            let next = filter.for_stack(stack, scope);
            Ok(async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|err| ServiceError::Internal(err.into()))?;
                let stacks = engine.aggregate_level(ctx, next, depth + 1).await?;
                Ok::<_, ServiceError>(AggregationResult {
                    stacks: Some(stacks),
                    ..bucket
                })
            })
        })
        .collect::<Result<Vec<_>>>()?;

    try_join_all(tasks).await
}

/// Restricts a sub-query to exactly the rows behind `bucket`.
fn bucket_scope(plan: &AggregatePlan, bucket: &AggregationResult) -> Result<BucketScope> {
    let dimension = plan.dimension.descriptor.dimension;
    if plan.dimension.is_time() {
        let epoch: i64 = bucket.key.parse().map_err(|_| {
            ServiceError::Internal(anyhow::anyhow!("bucket key {} is not an epoch", bucket.key))
        })?;
        let bucket = TimeBucket::from_epoch(plan.dimension.interval, epoch)?;
        return Ok(BucketScope {
            dimension,
            key: epoch.to_string(),
            additional_key: Some(bucket.label.clone()),
            range: Some(bucket.range()),
        });
    }

    Ok(BucketScope {
        dimension,
        key: bucket.key.clone(),
        additional_key: bucket.additional_key.clone(),
        range: None,
    })
}
