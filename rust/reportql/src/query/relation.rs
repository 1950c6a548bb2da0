//! Base relations per domain and the tenant schema prefix applied to every table.

use crate::filter::{Domain, RangeField};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Opaque namespace prefix supplied by the caller; quoted but otherwise untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Tenant(Option<String>);

impl Tenant {
    pub fn new(schema: impl Into<String>) -> Self {
        let schema = schema.into();
        if schema.is_empty() {
            Self(None)
        } else {
            Self(Some(schema))
        }
    }

    pub fn table(&self, name: &str) -> String {
        match &self.0 {
            Some(schema) if !schema.is_empty() => {
                format!("\"{}\".{name}", schema.replace('"', "\"\""))
            }
            _ => name.to_string(),
        }
    }
}

/// Supplemental joins a predicate or dimension may pull into the CI/CD base relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Join {
    Stages,
    Steps,
}

pub fn alias(domain: Domain) -> &'static str {
    match domain {
        Domain::CicdJobRuns => "r",
        Domain::ScmPullRequests => "pr",
        Domain::ScmCommits => "c",
    }
}

pub fn id_column(domain: Domain) -> &'static str {
    match domain {
        Domain::CicdJobRuns => "r.id",
        Domain::ScmPullRequests => "pr.id",
        Domain::ScmCommits => "c.id",
    }
}

/// Per-row elapsed seconds used by the duration calculation.
pub fn duration_expr(domain: Domain) -> Option<&'static str> {
    match domain {
        Domain::CicdJobRuns => Some("r.duration"),
        Domain::ScmPullRequests => Some("EXTRACT(EPOCH FROM (pr.pr_merged_at - pr.pr_created_at))"),
        Domain::ScmCommits => None,
    }
}

/// Column and range key used when a list request does not name a usable sort.
pub fn default_sort_column(domain: Domain) -> &'static str {
    match domain {
        Domain::CicdJobRuns => "start_time",
        Domain::ScmPullRequests => "pr_created_at",
        Domain::ScmCommits => "committed_at",
    }
}

pub fn range_column(domain: Domain, field: RangeField) -> Option<(&'static str, bool)> {
    // (column, is_time)
    let column = match (domain, field) {
        (Domain::CicdJobRuns, RangeField::StartTime) => ("r.start_time", true),
        (Domain::CicdJobRuns, RangeField::EndTime) => ("r.end_time", true),
        (Domain::CicdJobRuns, RangeField::Duration) => ("r.duration", false),
        (Domain::CicdJobRuns, RangeField::JobRunNumber) => ("r.job_run_number", false),
        (Domain::ScmPullRequests, RangeField::PrCreatedAt) => ("pr.pr_created_at", true),
        (Domain::ScmPullRequests, RangeField::PrMergedAt) => ("pr.pr_merged_at", true),
        (Domain::ScmCommits, RangeField::CommittedAt) => ("c.committed_at", true),
        _ => return None,
    };
    Some(column)
}

/// Renders the FROM clause for `domain`, pulling in any supplemental joins.
pub fn base_from(domain: Domain, tenant: &Tenant, joins: &BTreeSet<Join>) -> String {
    match domain {
        Domain::CicdJobRuns => {
            let mut from = format!(
                "{} r JOIN {} j ON r.cicd_job_id = j.id LEFT OUTER JOIN {} i ON j.cicd_instance_id = i.id",
                tenant.table("cicd_job_runs"),
                tenant.table("cicd_jobs"),
                tenant.table("cicd_instances"),
            );
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
            from
        }
        Domain::ScmPullRequests => format!("{} pr", tenant.table("scm_pullrequests")),
        Domain::ScmCommits => format!("{} c", tenant.table("scm_commits")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_prefix_is_quoted() {
        assert_eq!(Tenant::new("acme").table("scm_commits"), "\"acme\".scm_commits");
        assert_eq!(Tenant::new("a\"b").table("x"), "\"a\"\"b\".x");
        assert_eq!(Tenant::default().table("x"), "x");
    }

    #[test]
    fn step_join_brings_its_stage() {
        let joins = BTreeSet::from([Join::Steps]);
        let from = base_from(Domain::CicdJobRuns, &Tenant::new("t"), &joins);
        assert!(from.contains("\"t\".cicd_job_run_stages s ON s.cicd_job_run_id = r.id"), "{from}");
        assert!(from.ends_with("st ON st.cicd_job_run_stage_id = s.id"), "{from}");
    }

    #[test]
    fn scm_bases_have_no_joins() {
        let from = base_from(Domain::ScmPullRequests, &Tenant::default(), &BTreeSet::new());
        assert_eq!(from, "scm_pullrequests pr");
    }
}
