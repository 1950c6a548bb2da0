//! Structured per-domain filter criteria.
//!
//! A [`FilterSpec`] is deserialized once per request and never mutated; the drill-down engine
//! derives new specs from it instead of editing it in place.

use crate::time::{Interval, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    CicdJobRuns,
    ScmPullRequests,
    ScmCommits,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::CicdJobRuns => "cicd_job_runs",
            Domain::ScmPullRequests => "scm_pull_requests",
            Domain::ScmCommits => "scm_commits",
        }
    }
}

/// Grouping keys usable as across or stack values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    JobStatus,
    JobName,
    ProjectName,
    CicdUserId,
    InstanceName,
    QualifiedJobName,
    JobNormalizedFullName,
    Service,
    Environment,
    Infrastructure,
    DeploymentType,
    Repository,
    Branch,
    Tag,
    Rollback,
    StageName,
    StepName,
    StepStatus,
    Trend,
    JobEnd,
    Project,
    RepoId,
    Creator,
    State,
    SourceBranch,
    TargetBranch,
    Label,
    PrMerged,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::JobStatus => "job_status",
            Dimension::JobName => "job_name",
            Dimension::ProjectName => "project_name",
            Dimension::CicdUserId => "cicd_user_id",
            Dimension::InstanceName => "instance_name",
            Dimension::QualifiedJobName => "qualified_job_name",
            Dimension::JobNormalizedFullName => "job_normalized_full_name",
            Dimension::Service => "service",
            Dimension::Environment => "environment",
            Dimension::Infrastructure => "infrastructure",
            Dimension::DeploymentType => "deployment_type",
            Dimension::Repository => "repository",
            Dimension::Branch => "branch",
            Dimension::Tag => "tag",
            Dimension::Rollback => "rollback",
            Dimension::StageName => "stage_name",
            Dimension::StepName => "step_name",
            Dimension::StepStatus => "step_status",
            Dimension::Trend => "trend",
            Dimension::JobEnd => "job_end",
            Dimension::Project => "project",
            Dimension::RepoId => "repo_id",
            Dimension::Creator => "creator",
            Dimension::State => "state",
            Dimension::SourceBranch => "source_branch",
            Dimension::TargetBranch => "target_branch",
            Dimension::Label => "label",
            Dimension::PrMerged => "pr_merged",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    #[default]
    Count,
    Duration,
}

impl Calculation {
    pub fn as_str(self) -> &'static str {
        match self {
            Calculation::Count => "count",
            Calculation::Duration => "duration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    /// Ascending places NULLs last, descending places them first.
    pub fn nulls(self) -> &'static str {
        match self {
            SortOrder::Asc => "NULLS LAST",
            SortOrder::Desc => "NULLS FIRST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: String,
    #[serde(default = "default_sort_order")]
    pub order: SortOrder,
}

fn default_sort_order() -> SortOrder {
    SortOrder::Desc
}

/// Attributes usable in include/exclude lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    JobRunId,
    CicdJobId,
    JobStatus,
    JobName,
    ProjectName,
    CicdUserId,
    InstanceName,
    InstanceId,
    JobNormalizedFullName,
    IntegrationId,
    Service,
    Environment,
    Infrastructure,
    DeploymentType,
    Repository,
    Branch,
    Tag,
    Rollback,
    StageName,
    StepName,
    StepStatus,
    Project,
    RepoId,
    Creator,
    State,
    SourceBranch,
    TargetBranch,
    Label,
    Committer,
    CommitBranch,
}

impl FilterField {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterField::JobRunId => "job_run_id",
            FilterField::CicdJobId => "cicd_job_id",
            FilterField::JobStatus => "job_status",
            FilterField::JobName => "job_name",
            FilterField::ProjectName => "project_name",
            FilterField::CicdUserId => "cicd_user_id",
            FilterField::InstanceName => "instance_name",
            FilterField::InstanceId => "instance_id",
            FilterField::JobNormalizedFullName => "job_normalized_full_name",
            FilterField::IntegrationId => "integration_id",
            FilterField::Service => "service",
            FilterField::Environment => "environment",
            FilterField::Infrastructure => "infrastructure",
            FilterField::DeploymentType => "deployment_type",
            FilterField::Repository => "repository",
            FilterField::Branch => "branch",
            FilterField::Tag => "tag",
            FilterField::Rollback => "rollback",
            FilterField::StageName => "stage_name",
            FilterField::StepName => "step_name",
            FilterField::StepStatus => "step_status",
            FilterField::Project => "project",
            FilterField::RepoId => "repo_id",
            FilterField::Creator => "creator",
            FilterField::State => "state",
            FilterField::SourceBranch => "source_branch",
            FilterField::TargetBranch => "target_branch",
            FilterField::Label => "label",
            FilterField::Committer => "committer",
            FilterField::CommitBranch => "commit_branch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeField {
    StartTime,
    EndTime,
    Duration,
    JobRunNumber,
    PrCreatedAt,
    PrMergedAt,
    CommittedAt,
}

impl RangeField {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeField::StartTime => "start_time",
            RangeField::EndTime => "end_time",
            RangeField::Duration => "duration",
            RangeField::JobRunNumber => "job_run_number",
            RangeField::PrCreatedAt => "pr_created_at",
            RangeField::PrMergedAt => "pr_merged_at",
            RangeField::CommittedAt => "committed_at",
        }
    }
}

/// Inclusive numeric bounds; time fields carry epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

impl Range {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialMatch {
    #[serde(rename = "$begins", default, skip_serializing_if = "Option::is_none")]
    pub begins: Option<String>,
    #[serde(rename = "$ends", default, skip_serializing_if = "Option::is_none")]
    pub ends: Option<String>,
    #[serde(rename = "$contains", default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(rename = "$regex", default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuScope {
    #[serde(default)]
    pub ou_ref_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualifiedJobName {
    #[serde(default)]
    pub instance_name: Option<String>,
    pub job_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunParam {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// An independently evaluated overlay: merged over the base filter, compiled with its own
/// parameter suffix, and unioned with its siblings before grouping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterProfile {
    #[serde(default)]
    pub include: BTreeMap<FilterField, Vec<String>>,
    #[serde(default)]
    pub exclude: BTreeMap<FilterField, Vec<String>>,
    #[serde(default)]
    pub ranges: BTreeMap<RangeField, Range>,
    #[serde(default)]
    pub partial_match: BTreeMap<String, PartialMatch>,
    #[serde(default)]
    pub qualified_job_names: Vec<QualifiedJobName>,
    #[serde(default)]
    pub job_run_params: Vec<JobRunParam>,
}

/// Restricts a drill-down sub-query to one parent bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketScope {
    pub dimension: Dimension,
    pub key: String,
    pub additional_key: Option<String>,
    pub range: Option<TimeRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub across: Option<Dimension>,
    #[serde(default)]
    pub stacks: Vec<Dimension>,
    #[serde(default)]
    pub calculation: Option<Calculation>,
    #[serde(default)]
    pub interval: Option<Interval>,
    #[serde(default)]
    pub across_count: Option<i64>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub include: BTreeMap<FilterField, Vec<String>>,
    #[serde(default)]
    pub exclude: BTreeMap<FilterField, Vec<String>>,
    #[serde(default)]
    pub ranges: BTreeMap<RangeField, Range>,
    #[serde(default)]
    pub partial_match: BTreeMap<String, PartialMatch>,
    #[serde(default)]
    pub exclude_partial_match: BTreeMap<String, PartialMatch>,
    #[serde(default)]
    pub ou: Option<OuScope>,
    #[serde(default)]
    pub qualified_job_names: Vec<QualifiedJobName>,
    #[serde(default)]
    pub job_run_params: Vec<JobRunParam>,
    #[serde(default)]
    pub profiles: Vec<FilterProfile>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(skip)]
    pub scope: Vec<BucketScope>,
}

impl FilterSpec {
    pub fn calculation(&self) -> Calculation {
        self.calculation.unwrap_or_default()
    }

    pub fn interval(&self) -> Interval {
        self.interval.unwrap_or_default()
    }

    /// Expands into one filter per profile; without profiles the filter stands alone.
    pub fn profile_filters(&self) -> Vec<FilterSpec> {
        if self.profiles.is_empty() {
            return vec![self.clone()];
        }

        self.profiles
            .iter()
            .map(|profile| self.merge_profile(profile))
            .collect()
    }

    fn merge_profile(&self, profile: &FilterProfile) -> FilterSpec {
        let mut merged = self.clone();
        merged.profiles = Vec::new();
        merged.include.extend(profile.include.clone());
        merged.exclude.extend(profile.exclude.clone());
        merged.ranges.extend(profile.ranges.clone());
        merged
            .partial_match
            .extend(profile.partial_match.clone());
        if !profile.qualified_job_names.is_empty() {
            merged.qualified_job_names = profile.qualified_job_names.clone();
        }
        if !profile.job_run_params.is_empty() {
            merged.job_run_params = profile.job_run_params.clone();
        }
        merged
    }

    /// Derives the filter for one drill-down bucket: scoped to the bucket, grouped by `stack`.
    pub fn for_stack(&self, stack: Dimension, scope: BucketScope) -> FilterSpec {
        let mut next = self.clone();
        next.across = Some(stack);
        next.stacks = self.stacks.iter().skip(1).copied().collect();
        next.sort = Some(SortSpec {
            key: stack.as_str().to_string(),
            order: SortOrder::Asc,
        });
        next.across_count = None;
        next.scope.push(scope);
        next
    }
}
