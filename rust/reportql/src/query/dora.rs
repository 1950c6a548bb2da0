//! DORA metrics: deployment frequency, change failure rate, lead time and time to recover.
//!
//! Merged pull requests are the primary event source. Direct-merge commits join through
//! `UNION ALL` when the profile carries commit-side patterns. Each event is classified by
//! regex into the four categories, then grouped through the dimension registry.

use super::{
    binder::{BindParam, CompiledQuery, ParamBinder},
    conditions::{compile_conditions, supports},
    dimensions::{self, ResolvedDimension},
    relation::{self, Tenant},
};
use crate::{
    error::{Result, ServiceError},
    filter::{Calculation, Dimension, Domain, FilterField, FilterSpec, Range, RangeField},
    storage::{self, Row},
    time::{self, TimeBucket, TimeRange},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DEFAULT_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoraField {
    SourceBranch,
    TargetBranch,
    Title,
    Labels,
    CommitBranch,
    CommitMessage,
}

impl DoraField {
    fn as_str(self) -> &'static str {
        match self {
            DoraField::SourceBranch => "source_branch",
            DoraField::TargetBranch => "target_branch",
            DoraField::Title => "title",
            DoraField::Labels => "labels",
            DoraField::CommitBranch => "commit_branch",
            DoraField::CommitMessage => "commit_message",
        }
    }

    /// `(column, is_array)` on the given event source, if the field lives there.
    fn column(self, domain: Domain) -> Option<(&'static str, bool)> {
        match (domain, self) {
            (Domain::ScmPullRequests, DoraField::SourceBranch) => Some(("pr.source_branch", false)),
            (Domain::ScmPullRequests, DoraField::TargetBranch) => Some(("pr.target_branch", false)),
            (Domain::ScmPullRequests, DoraField::Title) => Some(("pr.title", false)),
            (Domain::ScmPullRequests, DoraField::Labels) => Some(("pr.labels", true)),
            (Domain::ScmCommits, DoraField::CommitBranch) => Some(("c.branch", false)),
            (Domain::ScmCommits, DoraField::CommitMessage) => Some(("c.message", false)),
            _ => None,
        }
    }
}

pub type PatternSet = BTreeMap<DoraField, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoraProfile {
    #[serde(default)]
    pub hotfix: PatternSet,
    #[serde(default)]
    pub release: PatternSet,
    #[serde(default)]
    pub deploy: PatternSet,
    #[serde(default)]
    pub defect: PatternSet,
}

impl DoraProfile {
    fn categories(&self) -> [(&'static str, &PatternSet); 4] {
        [
            ("hotfix", &self.hotfix),
            ("release", &self.release),
            ("deploy", &self.deploy),
            ("defect", &self.defect),
        ]
    }

    fn has_commit_patterns(&self) -> bool {
        self.categories().iter().any(|(_, patterns)| {
            patterns.iter().any(|(field, values)| {
                field.column(Domain::ScmCommits).is_some() && !values.is_empty()
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Band {
    Elite,
    High,
    Medium,
    Low,
}

pub fn deployment_frequency_band(per_day: f64) -> Band {
    if per_day >= 1.0 {
        Band::Elite
    } else if per_day >= 1.0 / 7.0 {
        Band::High
    } else if per_day >= 1.0 / 30.0 {
        Band::Medium
    } else {
        Band::Low
    }
}

pub fn change_failure_rate_band(percent: f64) -> Band {
    if percent <= 15.0 {
        Band::Elite
    } else if percent <= 30.0 {
        Band::High
    } else if percent <= 45.0 {
        Band::Medium
    } else {
        Band::Low
    }
}

pub fn lead_time_band(seconds: f64) -> Band {
    banded(seconds, [86_400.0, 604_800.0, 2_419_200.0])
}

pub fn recovery_time_band(seconds: f64) -> Band {
    banded(seconds, [3_600.0, 86_400.0, 604_800.0])
}

fn banded(value: f64, [elite, high, medium]: [f64; 3]) -> Band {
    if value <= elite {
        Band::Elite
    } else if value <= high {
        Band::High
    } else if value <= medium {
        Band::Medium
    } else {
        Band::Low
    }
}

pub fn change_failure_rate(hotfixes: i64, releases: i64) -> f64 {
    let total = hotfixes + releases;
    if total <= 0 {
        0.0
    } else {
        hotfixes as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metric {
    pub value: f64,
    pub band: Band,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoraMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_key: Option<String>,
    pub deployments: i64,
    pub hotfixes: i64,
    pub releases: i64,
    pub deployment_frequency: Metric,
    pub change_failure_rate: Metric,
    pub lead_time_for_changes: Metric,
    pub mean_time_to_recover: Metric,
}

#[derive(Debug, Clone)]
pub struct DoraPlan {
    pub query: CompiledQuery,
    pub dimension: Option<ResolvedDimension>,
    pub window: TimeRange,
}

fn event_dimension(across: Dimension, domain: Domain) -> Result<Dimension> {
    match (across, domain) {
        (Dimension::Trend, Domain::ScmPullRequests) => Ok(Dimension::PrMerged),
        (Dimension::Trend | Dimension::Project | Dimension::RepoId | Dimension::Creator, _) => {
            Ok(across)
        }
        _ => Err(ServiceError::validation(format!(
            "{} is not a valid across value for DORA metrics",
            across.as_str()
        ))),
    }
}

fn resolve_window(filter: &FilterSpec, now: DateTime<Utc>) -> Result<TimeRange> {
    let range = filter
        .ranges
        .get(&RangeField::PrMergedAt)
        .copied()
        .unwrap_or_default();
    let end = match range.to {
        Some(to) => time::from_epoch(to)?,
        None => now,
    };
    let start = match range.from {
        Some(from) => time::from_epoch(from)?,
        None => end - Duration::days(DEFAULT_WINDOW_DAYS),
    };
    if start > end {
        return Err(ServiceError::validation("DORA window starts after it ends"));
    }
    Ok(TimeRange { start, end })
}

/// Narrows a pull-request filter to the criteria direct-merge commits understand.
fn commit_filter(filter: &FilterSpec, window: &Range) -> FilterSpec {
    let carry = |lists: &BTreeMap<FilterField, Vec<String>>| -> BTreeMap<FilterField, Vec<String>> {
        lists
            .iter()
            .filter_map(|(field, values)| {
                let field = match field {
                    FilterField::Creator => FilterField::Committer,
                    other => *other,
                };
                supports(Domain::ScmCommits, field).then(|| (field, values.clone()))
            })
            .collect()
    };

    FilterSpec {
        include: carry(&filter.include),
        exclude: carry(&filter.exclude),
        ranges: BTreeMap::from([(RangeField::CommittedAt, *window)]),
        ou: filter.ou.clone(),
        ..FilterSpec::default()
    }
}

fn classification(
    binder: &mut ParamBinder,
    domain: Domain,
    category: &str,
    patterns: &PatternSet,
    suffix: &str,
) -> Result<String> {
    let mut clauses = Vec::new();
    for (field, values) in patterns {
        let Some((column, is_array)) = field.column(domain) else {
            continue;
        };
        for (index, pattern) in values.iter().enumerate() {
            let p = binder.bind(
                format!("{category}_{}{index}{suffix}", field.as_str()),
                BindParam::Text(pattern.clone()),
            )?;
            clauses.push(if is_array {
                format!("exists (select 1 from unnest({column}) as k where k ~ {p})")
            } else {
                format!("{column} ~ {p}")
            });
        }
    }

    Ok(if clauses.is_empty() {
        "FALSE".to_string()
    } else {
        format!("({})", clauses.join(" OR "))
    })
}

pub fn compile(
    tenant: &Tenant,
    filter: &FilterSpec,
    profile: &DoraProfile,
    now: DateTime<Utc>,
) -> Result<DoraPlan> {
    for (category, patterns) in profile.categories() {
        if patterns.values().all(Vec::is_empty) {
            warn!(category, "DORA profile has no patterns for category; treating it as zero");
        }
    }
    if !filter.profiles.is_empty() || !filter.stacks.is_empty() {
        debug!("DORA metrics ignore filter profiles and stacks");
    }

    let window = resolve_window(filter, now)?;
    let window_range = Range {
        from: Some(window.start.timestamp()),
        to: Some(window.end.timestamp()),
    };

    let pr_dimension = filter
        .across
        .map(|across| {
            dimensions::resolve(
                Domain::ScmPullRequests,
                event_dimension(across, Domain::ScmPullRequests)?,
                filter.interval(),
                Calculation::Count,
                None,
            )
        })
        .transpose()?;

    let mut binder = ParamBinder::new();
    let mut sources = Vec::new();

    let mut pr_filter = FilterSpec {
        profiles: Vec::new(),
        scope: Vec::new(),
        ..filter.clone()
    };
    pr_filter.ranges.insert(RangeField::PrMergedAt, window_range);
    sources.push(event_select(
        &mut binder,
        tenant,
        Domain::ScmPullRequests,
        &pr_filter,
        profile,
        filter,
        "_prs",
    )?);

    if profile.has_commit_patterns() {
        let commit_filter = commit_filter(filter, &window_range);
        sources.push(event_select(
            &mut binder,
            tenant,
            Domain::ScmCommits,
            &commit_filter,
            profile,
            filter,
            "_commits",
        )?);
    }

    let metrics = "COUNT(DISTINCT a.id) FILTER (WHERE a.is_deploy) AS deployments, \
         COUNT(DISTINCT a.id) FILTER (WHERE a.is_hotfix) AS hotfixes, \
         COUNT(DISTINCT a.id) FILTER (WHERE a.is_release) AS releases, \
         AVG(a.lead_time) FILTER (WHERE a.is_release) AS lead_time, \
         AVG(a.lead_time) FILTER (WHERE a.is_defect) AS recovery_time";
    let events = sources.join(" UNION ALL ");

    let (sql, output_order) = match &pr_dimension {
        None => (format!("SELECT {metrics} FROM ({events}) a"), None),
        Some(dimension) => {
            let guard = dimension
                .not_null_guard()
                .map(|guard| format!(" WHERE {guard}"))
                .unwrap_or_default();
            let (order, output_order) = if dimension.is_time() {
                ("a.bucket ASC", "key ASC")
            } else {
                ("lower(a.key) ASC", "lower(key) ASC")
            };
            let sql = format!(
                "SELECT {}, {metrics} FROM ({events}) a{guard} GROUP BY {} ORDER BY {order}",
                dimension.outer_select(),
                dimension.group_by(),
            );
            (sql, Some(output_order))
        }
    };

    let query = binder.render(&sql)?;
    Ok(DoraPlan {
        query: match output_order {
            Some(order) => query.ordered_by(order),
            None => query,
        },
        dimension: pr_dimension,
        window,
    })
}

fn event_select(
    binder: &mut ParamBinder,
    tenant: &Tenant,
    domain: Domain,
    source_filter: &FilterSpec,
    profile: &DoraProfile,
    request: &FilterSpec,
    suffix: &str,
) -> Result<String> {
    let conditions = compile_conditions(domain, tenant, source_filter, binder, suffix)?;
    let (gate, lead_time) = match domain {
        Domain::ScmPullRequests => (
            "pr.merged",
            "GREATEST(EXTRACT(EPOCH FROM (pr.pr_merged_at - pr.first_commit_time)), 0)::double precision",
        ),
        _ => ("c.direct_merge", "NULL::double precision"),
    };

    let key = match request.across {
        Some(across) => {
            let dimension = dimensions::resolve(
                domain,
                event_dimension(across, domain)?,
                request.interval(),
                Calculation::Count,
                None,
            )?;
            format!(", {}", dimension.inner_select())
        }
        None => String::new(),
    };

    let mut flags = Vec::new();
    for (category, patterns) in profile.categories() {
        let predicate = classification(binder, domain, category, patterns, suffix)?;
        flags.push(format!("{predicate} AS is_{category}"));
    }

    let predicates: Vec<&str> = std::iter::once(gate).chain(conditions.predicates()).collect();
    Ok(format!(
        "SELECT {} AS id, {lead_time} AS lead_time{key}, {} FROM {} WHERE {}",
        relation::id_column(domain),
        flags.join(", "),
        relation::base_from(domain, tenant, conditions.joins()),
        predicates.join(" AND "),
    ))
}

impl DoraPlan {
    pub fn parse(&self, rows: &[Row]) -> Result<Vec<DoraMetrics>> {
        rows.iter().map(|row| self.parse_row(row)).collect()
    }

    fn parse_row(&self, row: &Row) -> Result<DoraMetrics> {
        let (key, additional_key, days) = match &self.dimension {
            None => (None, None, self.window.days()),
            Some(dimension) if dimension.is_time() => {
                let epoch = storage::int(row, "key").ok_or_else(|| {
                    ServiceError::Storage("time bucket row without an epoch key".to_string())
                })?;
                let bucket = TimeBucket::from_epoch(dimension.interval, epoch)?;
                let overlap = TimeRange {
                    start: bucket.start.max(self.window.start),
                    end: bucket.end.min(self.window.end),
                };
                (Some(epoch.to_string()), Some(bucket.label), overlap.days())
            }
            Some(_) => (
                storage::text(row, "key"),
                storage::text(row, "additional_key"),
                self.window.days(),
            ),
        };

        let deployments = storage::int(row, "deployments").unwrap_or(0);
        let hotfixes = storage::int(row, "hotfixes").unwrap_or(0);
        let releases = storage::int(row, "releases").unwrap_or(0);
        let frequency = deployments as f64 / days;
        let failure_rate = change_failure_rate(hotfixes, releases);
        let lead_time = storage::float(row, "lead_time").unwrap_or(0.0);
        let recovery = storage::float(row, "recovery_time").unwrap_or(0.0);

        Ok(DoraMetrics {
            key,
            additional_key,
            deployments,
            hotfixes,
            releases,
            deployment_frequency: Metric {
                value: frequency,
                band: deployment_frequency_band(frequency),
            },
            change_failure_rate: Metric {
                value: failure_rate,
                band: change_failure_rate_band(failure_rate),
            },
            lead_time_for_changes: Metric {
                value: lead_time,
                band: lead_time_band(lead_time),
            },
            mean_time_to_recover: Metric {
                value: recovery,
                band: recovery_time_band(recovery),
            },
        })
    }
}
