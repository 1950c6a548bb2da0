//! Pipeline hierarchy: expands seed runs through their downstream trigger graph.
//!
//! Each round asks for runs whose `UpstreamCause` trigger names a run in the current frontier.
//! The walker keeps every run it has seen, so cyclic or duplicated trigger rows cannot make it
//! revisit a node, and the closure is bounded by depth and node budgets.
//!
//! Trigger rows name their parent by job name and build number only, which repeat across CI
//! instances. A downstream run is matched against parents on its own job's instance; runs of
//! jobs without an instance share the nil id.

use super::{
    aggregate::AggregatePlan,
    binder::{profile_suffix, BindParam, CompiledQuery, ParamBinder},
    conditions::compile_conditions,
    dimensions,
    relation::{self, Join, Tenant},
};
use crate::{
    error::{Result, ServiceError},
    filter::{Calculation, Domain, FilterSpec},
    storage::{self, Row},
};
use std::collections::{HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRunNode {
    pub run_id: Uuid,
    pub top_job_id: Uuid,
    pub job_full_name: String,
    pub job_run_number: i64,
    pub instance_id: Uuid,
}

/// A run found through a trigger edge, before it is attributed to a top job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggeredRun {
    pub run_id: Uuid,
    pub job_full_name: String,
    pub job_run_number: i64,
    /// Shared with the parent it was matched against.
    pub instance_id: Uuid,
    pub parent_job_full_name: String,
    pub parent_run_number: i64,
}

#[derive(Debug)]
pub struct HierarchyWalker {
    visited: HashSet<Uuid>,
    frontier: Vec<PipelineRunNode>,
    closure: Vec<PipelineRunNode>,
    depth: usize,
    max_depth: usize,
    max_nodes: usize,
    truncated: bool,
}

impl HierarchyWalker {
    pub fn new(seeds: Vec<PipelineRunNode>, max_depth: usize, max_nodes: usize) -> Self {
        let mut walker = Self {
            visited: HashSet::new(),
            frontier: Vec::new(),
            closure: Vec::new(),
            depth: 0,
            max_depth,
            max_nodes,
            truncated: false,
        };
        walker.frontier = walker.admit(seeds);
        walker
    }

    pub fn frontier(&self) -> &[PipelineRunNode] {
        &self.frontier
    }

    pub fn is_done(&self) -> bool {
        self.frontier.is_empty() || self.truncated || self.depth >= self.max_depth
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Attributes `children` to the frontier run that triggered them and moves one level down.
    pub fn advance(&mut self, children: Vec<TriggeredRun>) {
        let parents: HashMap<(&str, i64, Uuid), Uuid> = self
            .frontier
            .iter()
            .map(|node| {
                (
                    (node.job_full_name.as_str(), node.job_run_number, node.instance_id),
                    node.top_job_id,
                )
            })
            .collect();

        let attributed: Vec<PipelineRunNode> = children
            .into_iter()
            .filter_map(|child| {
                let top_job_id = *parents.get(&(
                    child.parent_job_full_name.as_str(),
                    child.parent_run_number,
                    child.instance_id,
                ))?;
                Some(PipelineRunNode {
                    run_id: child.run_id,
                    top_job_id,
                    job_full_name: child.job_full_name,
                    job_run_number: child.job_run_number,
                    instance_id: child.instance_id,
                })
            })
            .collect();

        self.frontier = self.admit(attributed);
        self.depth += 1;
        if self.depth >= self.max_depth && !self.frontier.is_empty() {
            warn!(depth = self.depth, "hierarchy depth limit reached");
        }
    }

    pub fn into_closure(self) -> Vec<PipelineRunNode> {
        self.closure
    }

    fn admit(&mut self, nodes: Vec<PipelineRunNode>) -> Vec<PipelineRunNode> {
        let mut admitted = Vec::new();
        for node in nodes {
            if self.closure.len() >= self.max_nodes {
                if !self.truncated {
                    warn!(max_nodes = self.max_nodes, "hierarchy node budget exhausted");
                }
                self.truncated = true;
                break;
            }
            if self.visited.insert(node.run_id) {
                self.closure.push(node.clone());
                admitted.push(node);
            }
        }
        admitted
    }
}

const NO_INSTANCE: &str = "'00000000-0000-0000-0000-000000000000'::uuid";

pub fn seed_query(tenant: &Tenant, filter: &FilterSpec) -> Result<CompiledQuery> {
    let mut binder = ParamBinder::new();
    let mut selects = Vec::new();
    for (index, profile) in filter.profile_filters().iter().enumerate() {
        let suffix = profile_suffix(index);
        let conditions =
            compile_conditions(Domain::CicdJobRuns, tenant, profile, &mut binder, &suffix)?;
        selects.push(format!(
            "SELECT r.id AS run_id, j.id AS top_job_id, j.job_full_name, r.job_run_number, \
             COALESCE(j.cicd_instance_id, {NO_INSTANCE}) AS instance_id FROM {}{}",
            relation::base_from(Domain::CicdJobRuns, tenant, conditions.joins()),
            conditions.where_clause(),
        ));
    }
    binder.render(&selects.join(" UNION "))
}

pub fn children_query(tenant: &Tenant, frontier: &[PipelineRunNode]) -> Result<CompiledQuery> {
    let mut binder = ParamBinder::new();
    let names = binder.bind(
        "parent_names",
        BindParam::TextArray(frontier.iter().map(|n| n.job_full_name.clone()).collect()),
    )?;
    let numbers = binder.bind(
        "parent_numbers",
        BindParam::IntArray(frontier.iter().map(|n| n.job_run_number).collect()),
    )?;
    let instances = binder.bind(
        "parent_instances",
        BindParam::UuidArray(frontier.iter().map(|n| n.instance_id).collect()),
    )?;

    let sql = format!(
        "SELECT r.id AS run_id, j.job_full_name, r.job_run_number, f.instance_id, \
         t.trigger_id AS parent_job_full_name, t.job_run_number AS parent_run_number \
         FROM {} r JOIN {} j ON r.cicd_job_id = j.id \
         JOIN {} t ON t.cicd_job_run_id = r.id AND t.type = 'UpstreamCause' \
         JOIN unnest({names}::text[], {numbers}::bigint[], {instances}::uuid[]) AS f(job_full_name, job_run_number, instance_id) \
         ON f.job_full_name = t.trigger_id AND f.job_run_number = t.job_run_number \
         AND f.instance_id = COALESCE(j.cicd_instance_id, {NO_INSTANCE})",
        tenant.table("cicd_job_runs"),
        tenant.table("cicd_jobs"),
        tenant.table("cicd_job_run_triggers"),
    );
    binder.render(&sql)
}

pub fn parse_seeds(rows: &[Row]) -> Vec<PipelineRunNode> {
    rows.iter()
        .filter_map(|row| {
            Some(PipelineRunNode {
                run_id: storage::uuid(row, "run_id")?,
                top_job_id: storage::uuid(row, "top_job_id")?,
                job_full_name: storage::text(row, "job_full_name")?,
                job_run_number: storage::int(row, "job_run_number")?,
                instance_id: storage::uuid(row, "instance_id")?,
            })
        })
        .collect()
}

pub fn parse_children(rows: &[Row]) -> Vec<TriggeredRun> {
    rows.iter()
        .filter_map(|row| {
            Some(TriggeredRun {
                run_id: storage::uuid(row, "run_id")?,
                job_full_name: storage::text(row, "job_full_name")?,
                job_run_number: storage::int(row, "job_run_number")?,
                instance_id: storage::uuid(row, "instance_id")?,
                parent_job_full_name: storage::text(row, "parent_job_full_name")?,
                parent_run_number: storage::int(row, "parent_run_number")?,
            })
        })
        .collect()
}

/// Aggregates every run in the closure, grouping by its top job's attributes.
pub fn closure_query(
    tenant: &Tenant,
    filter: &FilterSpec,
    closure: &[PipelineRunNode],
    default_across_count: i64,
) -> Result<AggregatePlan> {
    let across = filter
        .across
        .ok_or_else(|| ServiceError::validation("across must be set for aggregation"))?;
    let calculation = filter.calculation();
    let dimension = dimensions::resolve(
        Domain::CicdJobRuns,
        across,
        filter.interval(),
        calculation,
        filter.sort.as_ref(),
    )?;

    let mut binder = ParamBinder::new();
    let run_ids = binder.bind(
        "run_ids",
        BindParam::UuidArray(closure.iter().map(|n| n.run_id).collect()),
    )?;
    let top_job_ids = binder.bind(
        "top_job_ids",
        BindParam::UuidArray(closure.iter().map(|n| n.top_job_id).collect()),
    )?;
    let across_count = filter.across_count.unwrap_or(default_across_count).max(1);
    let limit = binder.bind("across_count", BindParam::Int(across_count))?;

    let mut from = format!(
        "{} r JOIN (SELECT unnest({run_ids}) AS run_id, unnest({top_job_ids}) AS top_job_id) c ON c.run_id = r.id \
         JOIN {} j ON c.top_job_id = j.id LEFT OUTER JOIN {} i ON j.cicd_instance_id = i.id",
        tenant.table("cicd_job_runs"),
        tenant.table("cicd_jobs"),
        tenant.table("cicd_instances"),
    );
    let joins = dimension.descriptor.joins;
    if joins.contains(&Join::Stages) || joins.contains(&Join::Steps) {
        from.push_str(&format!(
            " JOIN {} s ON s.cicd_job_run_id = r.id",
            tenant.table("cicd_job_run_stages")
        ));
    }
    if joins.contains(&Join::Steps) {
        from.push_str(&format!(
            " JOIN {} st ON st.cicd_job_run_stage_id = s.id",
            tenant.table("cicd_job_run_stage_steps")
        ));
    }

    let (duration, aggregates) = match calculation {
        Calculation::Count => ("", "COUNT(DISTINCT a.id) AS ct"),
        Calculation::Duration => (
            "r.duration AS duration, ",
            "MIN(a.duration) AS mn, MAX(a.duration) AS mx, SUM(a.duration) AS sm, COUNT(DISTINCT a.id) AS ct, PERCENTILE_DISC(0.5) WITHIN GROUP (ORDER BY a.duration) AS md",
        ),
    };
    let guard = dimension
        .not_null_guard()
        .map(|guard| format!(" WHERE {guard}"))
        .unwrap_or_default();

    // One row per run and key, whatever the stage and step joins fan out.
    let sql = format!(
        "SELECT {}, {aggregates} FROM (SELECT DISTINCT r.id AS id, {duration}{} FROM {from}) a{guard} GROUP BY {} ORDER BY {} LIMIT {limit}",
        dimension.outer_select(),
        dimension.inner_select(),
        dimension.group_by(),
        dimension.order_by(calculation),
    );

    Ok(AggregatePlan {
        query: binder
            .render(&sql)?
            .ordered_by(dimension.output_order(calculation)),
        dimension,
        calculation,
    })
}
