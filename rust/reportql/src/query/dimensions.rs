//! The `(domain, dimension)` registry and sort resolution for grouped queries.

use super::relation::Join;
use crate::{
    error::{Result, ServiceError},
    filter::{Calculation, Dimension, Domain, RangeField, SortOrder, SortSpec},
    time::Interval,
};

/// How a drill-down scope restricts rows to one parent bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMatch {
    /// `key = :value` (and the additional key, when the dimension has one).
    Equals,
    /// Membership in a JSON array column.
    JsonElement(&'static str),
    /// Membership in a text array column.
    ArrayElement(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeColumn {
    pub column: &'static str,
    pub range: RangeField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionDescriptor {
    pub dimension: Dimension,
    pub key: &'static str,
    pub additional_key: Option<&'static str>,
    pub scope: ScopeMatch,
    pub joins: &'static [Join],
    pub time: Option<TimeColumn>,
}

impl DimensionDescriptor {
    const fn column(dimension: Dimension, key: &'static str) -> Self {
        Self {
            dimension,
            key,
            additional_key: None,
            scope: ScopeMatch::Equals,
            joins: &[],
            time: None,
        }
    }

    const fn json(dimension: Dimension, key: &'static str, column: &'static str) -> Self {
        Self {
            scope: ScopeMatch::JsonElement(column),
            ..Self::column(dimension, key)
        }
    }

    const fn array(dimension: Dimension, key: &'static str, column: &'static str) -> Self {
        Self {
            scope: ScopeMatch::ArrayElement(column),
            ..Self::column(dimension, key)
        }
    }

    const fn joined(dimension: Dimension, key: &'static str, joins: &'static [Join]) -> Self {
        Self {
            joins,
            ..Self::column(dimension, key)
        }
    }

    const fn time(dimension: Dimension, column: &'static str, range: RangeField) -> Self {
        Self {
            time: Some(TimeColumn { column, range }),
            ..Self::column(dimension, column)
        }
    }

    pub fn is_time(&self) -> bool {
        self.time.is_some()
    }
}

static CICD_DIMENSIONS: &[DimensionDescriptor] = &[
    DimensionDescriptor::column(Dimension::JobStatus, "r.status"),
    DimensionDescriptor::column(Dimension::JobName, "j.job_name"),
    DimensionDescriptor::column(Dimension::ProjectName, "j.project_name"),
    DimensionDescriptor::column(Dimension::CicdUserId, "r.cicd_user_id"),
    DimensionDescriptor::column(Dimension::InstanceName, "i.name"),
    DimensionDescriptor {
        additional_key: Some("i.name"),
        ..DimensionDescriptor::column(Dimension::QualifiedJobName, "j.job_name")
    },
    DimensionDescriptor::column(
        Dimension::JobNormalizedFullName,
        "j.job_normalized_full_name",
    ),
    DimensionDescriptor::json(
        Dimension::Service,
        "jsonb_array_elements_text(r.metadata->'service_ids')",
        "r.metadata->'service_ids'",
    ),
    DimensionDescriptor::json(
        Dimension::Infrastructure,
        "jsonb_array_elements_text(r.metadata->'infra_ids')",
        "r.metadata->'infra_ids'",
    ),
    DimensionDescriptor::json(
        Dimension::Environment,
        "jsonb_array_elements_text(r.metadata->'env_ids')",
        "r.metadata->'env_ids'",
    ),
    DimensionDescriptor::json(
        Dimension::DeploymentType,
        "jsonb_array_elements_text(r.metadata->'service_types')",
        "r.metadata->'service_types'",
    ),
    DimensionDescriptor::json(
        Dimension::Tag,
        "jsonb_array_elements_text(r.metadata->'tags')",
        "r.metadata->'tags'",
    ),
    DimensionDescriptor::column(Dimension::Repository, "r.metadata->>'repo_url'"),
    DimensionDescriptor::column(Dimension::Branch, "r.metadata->>'branch'"),
    DimensionDescriptor::column(Dimension::Rollback, "r.metadata->>'rollback'"),
    DimensionDescriptor::joined(Dimension::StageName, "s.name", &[Join::Stages]),
    DimensionDescriptor::joined(Dimension::StepName, "st.display_name", &[Join::Steps]),
    DimensionDescriptor::joined(Dimension::StepStatus, "st.result", &[Join::Steps]),
    DimensionDescriptor::time(Dimension::Trend, "r.start_time", RangeField::StartTime),
    DimensionDescriptor::time(Dimension::JobEnd, "r.end_time", RangeField::EndTime),
];

static PULL_REQUEST_DIMENSIONS: &[DimensionDescriptor] = &[
    DimensionDescriptor::column(Dimension::Project, "pr.project"),
    DimensionDescriptor::array(Dimension::RepoId, "unnest(pr.repo_id)", "pr.repo_id"),
    DimensionDescriptor::column(Dimension::Creator, "pr.creator_id::text"),
    DimensionDescriptor::column(Dimension::State, "pr.state"),
    DimensionDescriptor::column(Dimension::SourceBranch, "pr.source_branch"),
    DimensionDescriptor::column(Dimension::TargetBranch, "pr.target_branch"),
    DimensionDescriptor::array(Dimension::Label, "unnest(pr.labels)", "pr.labels"),
    DimensionDescriptor::time(Dimension::Trend, "pr.pr_created_at", RangeField::PrCreatedAt),
    DimensionDescriptor::time(Dimension::PrMerged, "pr.pr_merged_at", RangeField::PrMergedAt),
];

static COMMIT_DIMENSIONS: &[DimensionDescriptor] = &[
    DimensionDescriptor::column(Dimension::Project, "c.project"),
    DimensionDescriptor::array(Dimension::RepoId, "unnest(c.repo_id)", "c.repo_id"),
    DimensionDescriptor::column(Dimension::Creator, "c.committer_id::text"),
    DimensionDescriptor::column(Dimension::Branch, "c.branch"),
    DimensionDescriptor::time(Dimension::Trend, "c.committed_at", RangeField::CommittedAt),
];

fn registry(domain: Domain) -> &'static [DimensionDescriptor] {
    match domain {
        Domain::CicdJobRuns => CICD_DIMENSIONS,
        Domain::ScmPullRequests => PULL_REQUEST_DIMENSIONS,
        Domain::ScmCommits => COMMIT_DIMENSIONS,
    }
}

pub fn descriptor(domain: Domain, dimension: Dimension) -> Result<&'static DimensionDescriptor> {
    registry(domain)
        .iter()
        .find(|d| d.dimension == dimension)
        .ok_or_else(|| {
            ServiceError::validation(format!(
                "{} is not a valid across value for {}",
                dimension.as_str(),
                domain.as_str()
            ))
        })
}

/// Stacks apply under any registered across, but only categorical dimensions can be stacked.
pub fn stack_supported(domain: Domain, across: Dimension, stack: Dimension) -> bool {
    if across == stack {
        return false;
    }
    let across_known = registry(domain).iter().any(|d| d.dimension == across);
    let stack_categorical = registry(domain)
        .iter()
        .any(|d| d.dimension == stack && !d.is_time());
    across_known && stack_categorical
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortTarget {
    Calculation,
    Key,
    Bucket,
}

/// A descriptor bound to a concrete interval and sort for one aggregation.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedDimension {
    pub descriptor: &'static DimensionDescriptor,
    pub interval: Interval,
    pub target: SortTarget,
    pub order: SortOrder,
}

pub fn resolve(
    domain: Domain,
    dimension: Dimension,
    interval: Interval,
    calculation: Calculation,
    sort: Option<&SortSpec>,
) -> Result<ResolvedDimension> {
    let descriptor = descriptor(domain, dimension)?;
    let own = if descriptor.is_time() {
        SortTarget::Bucket
    } else {
        SortTarget::Key
    };

    let (target, order) = match sort {
        None if descriptor.is_time() => (SortTarget::Bucket, SortOrder::Desc),
        None => (SortTarget::Calculation, SortOrder::Desc),
        Some(spec) if spec.key == calculation.as_str() => (SortTarget::Calculation, spec.order),
        Some(spec) if spec.key == dimension.as_str() => (own, spec.order),
        Some(spec) => {
            return Err(ServiceError::validation(format!(
                "Invalid sort field: {}",
                spec.key
            )))
        }
    };

    Ok(ResolvedDimension {
        descriptor,
        interval,
        target,
        order,
    })
}

impl ResolvedDimension {
    pub fn is_time(&self) -> bool {
        self.descriptor.is_time()
    }

    /// Columns projected by each profile's inner selection.
    pub fn inner_select(&self) -> String {
        match (self.descriptor.time, self.descriptor.additional_key) {
            (Some(time), _) => format!(
                "date_trunc('{}', {} AT TIME ZONE 'UTC') AS bucket",
                self.interval.unit(),
                time.column
            ),
            (None, Some(additional)) => format!(
                "{} AS key, {additional} AS additional_key",
                self.descriptor.key
            ),
            (None, None) => format!("{} AS key", self.descriptor.key),
        }
    }

    pub fn outer_select(&self) -> &'static str {
        match (self.is_time(), self.descriptor.additional_key.is_some()) {
            (true, _) => "EXTRACT(EPOCH FROM a.bucket)::bigint AS key",
            (false, true) => "a.key, a.additional_key",
            (false, false) => "a.key",
        }
    }

    pub fn group_by(&self) -> &'static str {
        match (self.is_time(), self.descriptor.additional_key.is_some()) {
            (true, _) => "a.bucket",
            (false, true) => "a.key, a.additional_key",
            (false, false) => "a.key",
        }
    }

    /// Null categorical keys carry no bucket to drill into and are dropped.
    pub fn not_null_guard(&self) -> Option<&'static str> {
        (!self.is_time()).then_some("a.key IS NOT NULL")
    }

    pub fn order_by(&self, calculation: Calculation) -> String {
        let own = if self.is_time() {
            "a.bucket"
        } else {
            "lower(a.key)"
        };
        self.ordering(calculation, own)
    }

    /// [`Self::order_by`] over the projected columns; epoch keys sort like their buckets.
    pub fn output_order(&self, calculation: Calculation) -> String {
        let own = if self.is_time() { "key" } else { "lower(key)" };
        self.ordering(calculation, own)
    }

    fn ordering(&self, calculation: Calculation, own: &str) -> String {
        let direction = self.order.sql();
        let nulls = self.order.nulls();
        match self.target {
            SortTarget::Calculation => {
                let column = match calculation {
                    Calculation::Count => "ct",
                    Calculation::Duration => "md",
                };
                format!("{column} {direction} {nulls}, {own} ASC")
            }
            SortTarget::Key | SortTarget::Bucket => format!("{own} {direction} {nulls}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sort(key: &str, order: SortOrder) -> SortSpec {
        SortSpec {
            key: key.to_string(),
            order,
        }
    }

    #[test]
    fn unknown_pair_is_a_validation_error() {
        let err = descriptor(Domain::ScmCommits, Dimension::JobStatus).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn every_domain_registers_a_trend() {
        for domain in [
            Domain::CicdJobRuns,
            Domain::ScmPullRequests,
            Domain::ScmCommits,
        ] {
            assert!(descriptor(domain, Dimension::Trend).unwrap().is_time());
        }
    }

    #[test]
    fn default_sort_for_categorical_is_calculation_desc() {
        let resolved = resolve(
            Domain::ScmPullRequests,
            Dimension::Project,
            Interval::Day,
            Calculation::Count,
            None,
        )
        .unwrap();
        assert_eq!(resolved.order_by(Calculation::Count), "ct DESC NULLS FIRST, lower(a.key) ASC");
        assert_eq!(
            resolved.output_order(Calculation::Count),
            "ct DESC NULLS FIRST, lower(key) ASC"
        );
        assert_eq!(resolved.not_null_guard(), Some("a.key IS NOT NULL"));
    }

    #[test]
    fn time_dimension_buckets_and_sorts_by_bucket() {
        let resolved = resolve(
            Domain::CicdJobRuns,
            Dimension::Trend,
            Interval::Week,
            Calculation::Count,
            Some(&sort("trend", SortOrder::Asc)),
        )
        .unwrap();
        assert_eq!(
            resolved.inner_select(),
            "date_trunc('week', r.start_time AT TIME ZONE 'UTC') AS bucket"
        );
        assert_eq!(resolved.group_by(), "a.bucket");
        assert_eq!(resolved.order_by(Calculation::Count), "a.bucket ASC NULLS LAST");
        assert_eq!(resolved.output_order(Calculation::Count), "key ASC NULLS LAST");
        assert_eq!(resolved.not_null_guard(), None);
    }

    #[test]
    fn nulls_placement_follows_direction_for_every_dimension() {
        for descriptor in CICD_DIMENSIONS {
            for (order, nulls) in [
                (SortOrder::Asc, "NULLS LAST"),
                (SortOrder::Desc, "NULLS FIRST"),
            ] {
                let resolved = resolve(
                    Domain::CicdJobRuns,
                    descriptor.dimension,
                    Interval::Day,
                    Calculation::Duration,
                    Some(&sort(descriptor.dimension.as_str(), order)),
                )
                .unwrap();
                let clause = resolved.order_by(Calculation::Duration);
                assert!(clause.contains(nulls), "{clause}");
                assert!(clause.contains(order.sql()), "{clause}");
            }
        }
    }

    #[test]
    fn sort_by_calculation_name() {
        let resolved = resolve(
            Domain::CicdJobRuns,
            Dimension::JobStatus,
            Interval::Day,
            Calculation::Duration,
            Some(&sort("duration", SortOrder::Asc)),
        )
        .unwrap();
        assert_eq!(
            resolved.order_by(Calculation::Duration),
            "md ASC NULLS LAST, lower(a.key) ASC"
        );
    }

    #[test]
    fn mismatched_sort_key_is_rejected() {
        let err = resolve(
            Domain::CicdJobRuns,
            Dimension::JobStatus,
            Interval::Day,
            Calculation::Count,
            Some(&sort("project_name", SortOrder::Asc)),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid request: Invalid sort field: project_name");
    }

    #[test]
    fn qualified_job_name_projects_its_instance() {
        let resolved = resolve(
            Domain::CicdJobRuns,
            Dimension::QualifiedJobName,
            Interval::Day,
            Calculation::Count,
            None,
        )
        .unwrap();
        assert_eq!(
            resolved.inner_select(),
            "j.job_name AS key, i.name AS additional_key"
        );
        assert_eq!(resolved.group_by(), "a.key, a.additional_key");
    }

    #[test]
    fn stacks_require_a_categorical_stack() {
        assert!(stack_supported(
            Domain::CicdJobRuns,
            Dimension::Trend,
            Dimension::JobStatus
        ));
        assert!(!stack_supported(
            Domain::CicdJobRuns,
            Dimension::JobStatus,
            Dimension::Trend
        ));
        assert!(!stack_supported(
            Domain::ScmCommits,
            Dimension::Project,
            Dimension::Label
        ));
        assert!(!stack_supported(
            Domain::ScmCommits,
            Dimension::Project,
            Dimension::Project
        ));
    }
}
