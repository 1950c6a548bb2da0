//! Compiles a [`FilterSpec`] into parameterized WHERE predicates.
//!
//! Only column expressions from the tables below are ever interpolated; every value goes through
//! the [`ParamBinder`]. Absent criteria emit nothing.

use super::{
    binder::{BindParam, ParamBinder},
    dimensions::{self, ScopeMatch},
    relation::{self, Join, Tenant},
};
use crate::{
    error::{Result, ServiceError},
    filter::{BucketScope, Domain, FilterField, FilterSpec, PartialMatch},
    time,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    predicates: BTreeMap<&'static str, Vec<String>>,
    joins: BTreeSet<Join>,
}

impl ConditionSet {
    pub fn push(&mut self, alias: &'static str, predicate: impl Into<String>) {
        self.predicates
            .entry(alias)
            .or_default()
            .push(predicate.into());
    }

    pub fn require(&mut self, join: Join) {
        self.joins.insert(join);
    }

    pub fn joins(&self) -> &BTreeSet<Join> {
        &self.joins
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.values().all(Vec::is_empty)
    }

    pub fn predicates(&self) -> impl Iterator<Item = &str> {
        self.predicates
            .values()
            .flat_map(|fragments| fragments.iter().map(String::as_str))
    }

    pub fn for_alias(&self, alias: &str) -> &[String] {
        self.predicates
            .get(alias)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// ` WHERE a AND b`, or an empty string when nothing restricts the rows.
    pub fn where_clause(&self) -> String {
        let predicates: Vec<&str> = self.predicates().collect();
        if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Uuid,
    Int,
    TextArray,
    JsonArray,
    Bool,
}

#[derive(Debug, Clone, Copy)]
struct FieldColumn {
    alias: &'static str,
    expr: &'static str,
    kind: ColumnKind,
    join: Option<Join>,
}

const fn col(alias: &'static str, expr: &'static str, kind: ColumnKind) -> FieldColumn {
    FieldColumn {
        alias,
        expr,
        kind,
        join: None,
    }
}

const fn joined(alias: &'static str, expr: &'static str, join: Join) -> FieldColumn {
    FieldColumn {
        alias,
        expr,
        kind: ColumnKind::Text,
        join: Some(join),
    }
}

fn field_column(domain: Domain, field: FilterField) -> Option<FieldColumn> {
    use ColumnKind as K;
    use FilterField as F;

    let column = match (domain, field) {
        (Domain::CicdJobRuns, F::JobRunId) => col("r", "r.id", K::Uuid),
        (Domain::CicdJobRuns, F::CicdJobId) => col("j", "j.id", K::Uuid),
        (Domain::CicdJobRuns, F::JobStatus) => col("r", "r.status", K::Text),
        (Domain::CicdJobRuns, F::JobName) => col("j", "j.job_name", K::Text),
        (Domain::CicdJobRuns, F::ProjectName) => col("j", "j.project_name", K::Text),
        (Domain::CicdJobRuns, F::CicdUserId) => col("r", "r.cicd_user_id", K::Text),
        (Domain::CicdJobRuns, F::InstanceName) => col("i", "i.name", K::Text),
        (Domain::CicdJobRuns, F::InstanceId) => col("i", "i.id", K::Uuid),
        (Domain::CicdJobRuns, F::JobNormalizedFullName) => {
            col("j", "j.job_normalized_full_name", K::Text)
        }
        (Domain::CicdJobRuns, F::IntegrationId) => col("i", "i.integration_id", K::Int),
        (Domain::CicdJobRuns, F::Service) => col("r", "r.metadata->'service_ids'", K::JsonArray),
        (Domain::CicdJobRuns, F::Environment) => col("r", "r.metadata->'env_ids'", K::JsonArray),
        (Domain::CicdJobRuns, F::Infrastructure) => {
            col("r", "r.metadata->'infra_ids'", K::JsonArray)
        }
        (Domain::CicdJobRuns, F::DeploymentType) => {
            col("r", "r.metadata->'service_types'", K::JsonArray)
        }
        (Domain::CicdJobRuns, F::Tag) => col("r", "r.metadata->'tags'", K::JsonArray),
        (Domain::CicdJobRuns, F::Repository) => col("r", "r.metadata->>'repo_url'", K::Text),
        (Domain::CicdJobRuns, F::Branch) => col("r", "r.metadata->>'branch'", K::Text),
        (Domain::CicdJobRuns, F::Rollback) => {
            col("r", "(r.metadata->>'rollback')::boolean", K::Bool)
        }
        (Domain::CicdJobRuns, F::StageName) => joined("s", "s.name", Join::Stages),
        (Domain::CicdJobRuns, F::StepName) => joined("st", "st.display_name", Join::Steps),
        (Domain::CicdJobRuns, F::StepStatus) => joined("st", "st.result", Join::Steps),

        (Domain::ScmPullRequests, F::Project) => col("pr", "pr.project", K::Text),
        (Domain::ScmPullRequests, F::RepoId) => col("pr", "pr.repo_id", K::TextArray),
        (Domain::ScmPullRequests, F::Creator) => col("pr", "pr.creator_id", K::Uuid),
        (Domain::ScmPullRequests, F::State) => col("pr", "pr.state", K::Text),
        (Domain::ScmPullRequests, F::SourceBranch) => col("pr", "pr.source_branch", K::Text),
        (Domain::ScmPullRequests, F::TargetBranch) => col("pr", "pr.target_branch", K::Text),
        (Domain::ScmPullRequests, F::Label) => col("pr", "pr.labels", K::TextArray),
        (Domain::ScmPullRequests, F::IntegrationId) => col("pr", "pr.integration_id", K::Int),

        (Domain::ScmCommits, F::Project) => col("c", "c.project", K::Text),
        (Domain::ScmCommits, F::RepoId) => col("c", "c.repo_id", K::TextArray),
        (Domain::ScmCommits, F::Committer) => col("c", "c.committer_id", K::Uuid),
        (Domain::ScmCommits, F::CommitBranch) => col("c", "c.branch", K::Text),
        (Domain::ScmCommits, F::IntegrationId) => col("c", "c.integration_id", K::Int),
        _ => return None,
    };
    Some(column)
}

pub fn supports(domain: Domain, field: FilterField) -> bool {
    field_column(domain, field).is_some()
}

/// The column org-unit scoping resolves against, and the raw id field it overrides.
fn identity(domain: Domain) -> (FilterField, &'static str) {
    match domain {
        Domain::CicdJobRuns => (FilterField::CicdUserId, "r.cicd_user_id"),
        Domain::ScmPullRequests => (FilterField::Creator, "pr.creator_id::text"),
        Domain::ScmCommits => (FilterField::Committer, "c.committer_id::text"),
    }
}

/// Columns accepted by partial matching: `(alias, column, is_array)`.
fn partial_column(domain: Domain, key: &str) -> Option<(&'static str, &'static str, bool)> {
    let column = match (domain, key) {
        (Domain::CicdJobRuns, "job_normalized_full_name") => {
            ("j", "j.job_normalized_full_name", false)
        }
        (Domain::CicdJobRuns, "job_name") => ("j", "j.job_name", false),
        (Domain::CicdJobRuns, "project_name") => ("j", "j.project_name", false),
        (Domain::CicdJobRuns, "instance_name") => ("i", "i.name", false),
        (Domain::CicdJobRuns, "cicd_user_id") => ("r", "r.cicd_user_id", false),
        (Domain::CicdJobRuns, "job_status") => ("r", "r.status", false),
        (Domain::ScmPullRequests, "title") => ("pr", "pr.title", false),
        (Domain::ScmPullRequests, "source_branch") => ("pr", "pr.source_branch", false),
        (Domain::ScmPullRequests, "target_branch") => ("pr", "pr.target_branch", false),
        (Domain::ScmPullRequests, "project") => ("pr", "pr.project", false),
        (Domain::ScmPullRequests, "labels") => ("pr", "pr.labels", true),
        (Domain::ScmCommits, "message") => ("c", "c.message", false),
        (Domain::ScmCommits, "branch") => ("c", "c.branch", false),
        _ => return None,
    };
    Some(column)
}

pub fn compile_conditions(
    domain: Domain,
    tenant: &Tenant,
    filter: &FilterSpec,
    binder: &mut ParamBinder,
    suffix: &str,
) -> Result<ConditionSet> {
    let mut set = ConditionSet::default();
    let (identity_field, identity_column) = identity(domain);

    let ou_ids = filter
        .ou
        .as_ref()
        .map(|ou| ou.ou_ref_ids.as_slice())
        .unwrap_or_default();
    if !ou_ids.is_empty() {
        let p = binder.bind(
            format!("ou_ref_ids{suffix}"),
            BindParam::IntArray(ou_ids.to_vec()),
        )?;
        set.push(
            relation::alias(domain),
            format!(
                "{identity_column} IN (SELECT cloud_id FROM (SELECT DISTINCT cloud_id FROM {} WHERE ou_ref_id = ANY({p})) l)",
                tenant.table("ou_user_identities")
            ),
        );
    }

    for (field, values) in &filter.include {
        if values.is_empty() {
            continue;
        }
        if *field == identity_field && !ou_ids.is_empty() {
            debug!(field = field.as_str(), "org-unit scope overrides raw id list");
            continue;
        }
        let column = require_column(domain, *field)?;
        let name = format!("{}{suffix}", field.as_str());
        compile_list(&mut set, binder, column, *field, name, values, false)?;
    }

    for (field, values) in &filter.exclude {
        if values.is_empty() {
            continue;
        }
        let column = require_column(domain, *field)?;
        let name = format!("exclude_{}{suffix}", field.as_str());
        compile_list(&mut set, binder, column, *field, name, values, true)?;
    }

    for (field, range) in &filter.ranges {
        if range.is_empty() {
            continue;
        }
        let (column, is_time) = relation::range_column(domain, *field).ok_or_else(|| {
            ServiceError::validation(format!(
                "range on {} is not supported for {}",
                field.as_str(),
                domain.as_str()
            ))
        })?;
        let alias = alias_of(column, domain);
        for (bound, op, value) in [("start", ">=", range.from), ("end", "<=", range.to)] {
            let Some(value) = value else { continue };
            let param = if is_time {
                BindParam::Timestamptz(time::from_epoch(value)?)
            } else {
                BindParam::Int(value)
            };
            let p = binder.bind(format!("{}_{bound}{suffix}", field.as_str()), param)?;
            set.push(alias, format!("{column} {op} {p}"));
        }
    }

    compile_partial(domain, &mut set, binder, &filter.partial_match, suffix, false)?;
    compile_partial(
        domain,
        &mut set,
        binder,
        &filter.exclude_partial_match,
        suffix,
        true,
    )?;

    if !filter.qualified_job_names.is_empty() || !filter.job_run_params.is_empty() {
        if domain != Domain::CicdJobRuns {
            return Err(ServiceError::validation(format!(
                "job name and parameter filters are not supported for {}",
                domain.as_str()
            )));
        }
        compile_qualified_job_names(&mut set, binder, filter, suffix)?;
        compile_job_run_params(&mut set, binder, tenant, filter, suffix)?;
    }

    for (level, scope) in filter.scope.iter().enumerate() {
        compile_scope(domain, &mut set, binder, scope, level, suffix)?;
    }

    Ok(set)
}

fn require_column(domain: Domain, field: FilterField) -> Result<FieldColumn> {
    field_column(domain, field).ok_or_else(|| {
        ServiceError::validation(format!(
            "{} is not a supported filter for {}",
            field.as_str(),
            domain.as_str()
        ))
    })
}

fn compile_list(
    set: &mut ConditionSet,
    binder: &mut ParamBinder,
    column: FieldColumn,
    field: FilterField,
    name: String,
    values: &[String],
    exclude: bool,
) -> Result<()> {
    if let Some(join) = column.join {
        set.require(join);
    }
    let expr = column.expr;

    let predicate = match column.kind {
        ColumnKind::Text => {
            let p = binder.bind(name, BindParam::TextArray(values.to_vec()))?;
            if exclude {
                format!("{expr} <> ALL({p})")
            } else {
                format!("{expr} = ANY({p})")
            }
        }
        ColumnKind::Uuid => {
            let ids: Vec<Uuid> = parse_valid(field, values, |v| v.parse().ok());
            if ids.is_empty() {
                if exclude {
                    return Ok(());
                }
                set.push(column.alias, "1=0");
                return Ok(());
            }
            let p = binder.bind(name, BindParam::UuidArray(ids))?;
            if exclude {
                format!("{expr} <> ALL({p})")
            } else {
                format!("{expr} = ANY({p})")
            }
        }
        ColumnKind::Int => {
            let ids: Vec<i64> = parse_valid(field, values, |v| v.parse().ok());
            if ids.is_empty() {
                if exclude {
                    return Ok(());
                }
                set.push(column.alias, "1=0");
                return Ok(());
            }
            let p = binder.bind(name, BindParam::IntArray(ids))?;
            if exclude {
                format!("{expr} <> ALL({p})")
            } else {
                format!("{expr} = ANY({p})")
            }
        }
        ColumnKind::TextArray => {
            let p = binder.bind(name, BindParam::TextArray(values.to_vec()))?;
            if exclude {
                format!("NOT ({expr} && {p})")
            } else {
                format!("{expr} && {p}")
            }
        }
        ColumnKind::JsonArray => {
            let p = binder.bind(name, BindParam::TextArray(values.to_vec()))?;
            if exclude {
                format!("NOT jsonb_exists_any({expr}, {p})")
            } else {
                format!("jsonb_exists_any({expr}, {p})")
            }
        }
        ColumnKind::Bool => {
            let flags: BTreeSet<bool> = parse_valid::<bool>(field, values, |v| v.parse().ok())
                .into_iter()
                .collect();
            match (flags.len(), flags.iter().next()) {
                (1, Some(flag)) => {
                    let p = binder.bind(name, BindParam::Bool(*flag))?;
                    if exclude {
                        format!("{expr} IS DISTINCT FROM {p}")
                    } else {
                        format!("{expr} = {p}")
                    }
                }
                (0, _) if !exclude => "1=0".to_string(),
                (0, _) => return Ok(()),
                _ if exclude => format!("{expr} IS NULL"),
                _ => format!("{expr} IS NOT NULL"),
            }
        }
    };

    set.push(column.alias, predicate);
    Ok(())
}

fn parse_valid<T>(
    field: FilterField,
    values: &[String],
    parse: impl Fn(&str) -> Option<T>,
) -> Vec<T> {
    values
        .iter()
        .filter_map(|raw| {
            let parsed = parse(raw.trim());
            if parsed.is_none() {
                warn!(field = field.as_str(), value = %raw, "dropping malformed filter value");
            }
            parsed
        })
        .collect()
}

fn compile_partial(
    domain: Domain,
    set: &mut ConditionSet,
    binder: &mut ParamBinder,
    matches: &BTreeMap<String, PartialMatch>,
    suffix: &str,
    exclude: bool,
) -> Result<()> {
    for (key, spec) in matches {
        let Some((alias, column, is_array)) = partial_column(domain, key) else {
            debug!(key = %key, domain = domain.as_str(), "ignoring partial match on unlisted column");
            continue;
        };

        let ops = [
            ("begins", spec.begins.as_ref().map(|v| format!("{}%", escape_similar(v)))),
            ("ends", spec.ends.as_ref().map(|v| format!("%{}", escape_similar(v)))),
            ("contains", spec.contains.as_ref().map(|v| format!("%{}%", escape_similar(v)))),
            ("regex", spec.regex.clone()),
        ];

        for (op, pattern) in ops {
            let Some(pattern) = pattern else { continue };
            let name = if exclude {
                format!("{key}_NOT_{op}{suffix}")
            } else {
                format!("{key}_{op}{suffix}")
            };
            let p = binder.bind(name, BindParam::Text(pattern))?;
            let operator = if op == "regex" { "~" } else { "SIMILAR TO" };
            let predicate = if is_array {
                format!("exists (select 1 from unnest({column}) as k where k {operator} {p})")
            } else {
                format!("{column} {operator} {p}")
            };
            if exclude {
                set.push(alias, format!("NOT ({predicate})"));
            } else {
                set.push(alias, predicate);
            }
        }
    }
    Ok(())
}

/// Escapes SIMILAR TO metacharacters so user text only ever matches literally.
pub fn escape_similar(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(
            ch,
            '\\' | '%' | '_' | '|' | '*' | '+' | '?' | '{' | '}' | '(' | ')' | '[' | ']'
        ) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn compile_qualified_job_names(
    set: &mut ConditionSet,
    binder: &mut ParamBinder,
    filter: &FilterSpec,
    suffix: &str,
) -> Result<()> {
    let mut clauses = Vec::new();
    for (n, qualified) in filter.qualified_job_names.iter().enumerate() {
        if qualified.job_name.trim().is_empty() {
            warn!(index = n, "skipping qualified job name without a job name");
            continue;
        }
        let job = binder.bind(
            format!("job_name{n}{suffix}"),
            BindParam::Text(qualified.job_name.clone()),
        )?;
        let clause = match &qualified.instance_name {
            Some(instance) => {
                let instance = binder.bind(
                    format!("instance_name{n}{suffix}"),
                    BindParam::Text(instance.clone()),
                )?;
                format!("(i.name = {instance} AND j.job_name = {job})")
            }
            None => format!("(i.name IS NULL AND j.job_name = {job})"),
        };
        clauses.push(clause);
    }

    if !clauses.is_empty() {
        set.push("j", format!("({})", clauses.join(" OR ")));
    }
    Ok(())
}

fn compile_job_run_params(
    set: &mut ConditionSet,
    binder: &mut ParamBinder,
    tenant: &Tenant,
    filter: &FilterSpec,
    suffix: &str,
) -> Result<()> {
    let mut clauses = Vec::new();
    for (n, param) in filter.job_run_params.iter().enumerate() {
        if param.values.is_empty() {
            continue;
        }
        let name = binder.bind(format!("name{n}{suffix}"), BindParam::Text(param.name.clone()))?;
        let values = binder.bind(
            format!("values{n}{suffix}"),
            BindParam::TextArray(param.values.clone()),
        )?;
        clauses.push(format!("(p.name = {name} AND p.value = ANY({values}))"));
    }

    if !clauses.is_empty() {
        set.push(
            "r",
            format!(
                "r.id IN (SELECT p.cicd_job_run_id FROM {} p WHERE {})",
                tenant.table("cicd_job_run_params"),
                clauses.join(" OR ")
            ),
        );
    }
    Ok(())
}

fn compile_scope(
    domain: Domain,
    set: &mut ConditionSet,
    binder: &mut ParamBinder,
    scope: &BucketScope,
    level: usize,
    suffix: &str,
) -> Result<()> {
    let descriptor = dimensions::descriptor(domain, scope.dimension)?;
    for join in descriptor.joins {
        set.require(*join);
    }

    if let Some(time_column) = descriptor.time {
        let range = scope.range.ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!(
                "time scope on {} without a bucket range",
                scope.dimension.as_str()
            ))
        })?;
        let alias = alias_of(time_column.column, domain);
        let start = binder.bind(
            format!("scope{level}_start{suffix}"),
            BindParam::Timestamptz(range.start),
        )?;
        let end = binder.bind(
            format!("scope{level}_end{suffix}"),
            BindParam::Timestamptz(range.end),
        )?;
        set.push(alias, format!("{} >= {start}", time_column.column));
        set.push(alias, format!("{} < {end}", time_column.column));
        return Ok(());
    }

    let key = binder.bind(
        format!("scope{level}_key{suffix}"),
        BindParam::Text(scope.key.clone()),
    )?;
    let alias = alias_of(descriptor.key, domain);
    match descriptor.scope {
        ScopeMatch::Equals => {
            set.push(alias, format!("{} = {key}", descriptor.key));
            if let Some(additional) = descriptor.additional_key {
                let additional_alias = alias_of(additional, domain);
                match &scope.additional_key {
                    Some(value) => {
                        let p = binder.bind(
                            format!("scope{level}_additional_key{suffix}"),
                            BindParam::Text(value.clone()),
                        )?;
                        set.push(additional_alias, format!("{additional} = {p}"));
                    }
                    None => set.push(additional_alias, format!("{additional} IS NULL")),
                }
            }
        }
        ScopeMatch::JsonElement(column) => {
            set.push(alias_of(column, domain), format!("jsonb_exists({column}, {key})"));
        }
        ScopeMatch::ArrayElement(column) => {
            set.push(alias_of(column, domain), format!("{key} = ANY({column})"));
        }
    }
    Ok(())
}

/// Table alias of a `alias.column` expression, or the domain's base alias otherwise.
fn alias_of(expr: &'static str, domain: Domain) -> &'static str {
    match expr.split_once('.') {
        Some((alias, _)) if alias.chars().all(|c| c.is_ascii_alphanumeric()) => alias,
        _ => relation::alias(domain),
    }
}
