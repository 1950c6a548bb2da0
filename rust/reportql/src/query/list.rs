//! Paged record listings over the same filter machinery as aggregations.

use super::{
    binder::{profile_suffix, BindParam, CompiledQuery, ParamBinder},
    conditions::compile_conditions,
    relation::{self, Tenant},
};
use crate::{
    error::Result,
    filter::{Domain, FilterSpec, SortOrder},
    pagination::PageWindow,
};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ListPlan {
    pub page: CompiledQuery,
    pub count: CompiledQuery,
    pub window: PageWindow,
}

fn columns(domain: Domain) -> &'static [(&'static str, &'static str)] {
    match domain {
        Domain::CicdJobRuns => &[
            ("id", "r.id"),
            ("status", "r.status"),
            ("start_time", "r.start_time"),
            ("end_time", "r.end_time"),
            ("duration", "r.duration"),
            ("job_run_number", "r.job_run_number"),
            ("cicd_user_id", "r.cicd_user_id"),
            ("job_name", "j.job_name"),
            ("project_name", "j.project_name"),
            ("job_full_name", "j.job_full_name"),
            ("job_normalized_full_name", "j.job_normalized_full_name"),
            ("instance_name", "i.name"),
        ],
        Domain::ScmPullRequests => &[
            ("id", "pr.id"),
            ("project", "pr.project"),
            ("repo_id", "pr.repo_id"),
            ("creator_id", "pr.creator_id"),
            ("state", "pr.state"),
            ("title", "pr.title"),
            ("source_branch", "pr.source_branch"),
            ("target_branch", "pr.target_branch"),
            ("labels", "pr.labels"),
            ("merged", "pr.merged"),
            ("pr_created_at", "pr.pr_created_at"),
            ("pr_merged_at", "pr.pr_merged_at"),
        ],
        Domain::ScmCommits => &[
            ("id", "c.id"),
            ("project", "c.project"),
            ("repo_id", "c.repo_id"),
            ("committer_id", "c.committer_id"),
            ("branch", "c.branch"),
            ("message", "c.message"),
            ("direct_merge", "c.direct_merge"),
            ("committed_at", "c.committed_at"),
        ],
    }
}

/// Resolves the list ordering. Unknown keys fall back to the domain default rather than failing.
fn sort_column(domain: Domain, filter: &FilterSpec) -> (&'static str, SortOrder) {
    let default = relation::default_sort_column(domain);
    let Some(sort) = &filter.sort else {
        return (default, SortOrder::Desc);
    };
    match columns(domain).iter().find(|(name, _)| *name == sort.key) {
        Some((name, _)) => (*name, sort.order),
        None => {
            warn!(
                key = %sort.key,
                fallback = default,
                domain = domain.as_str(),
                "unknown list sort key, using default"
            );
            (default, sort.order)
        }
    }
}

pub fn compile(
    domain: Domain,
    tenant: &Tenant,
    filter: &FilterSpec,
    window: PageWindow,
) -> Result<ListPlan> {
    let projection = columns(domain)
        .iter()
        .map(|(name, expr)| format!("{expr} AS {name}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut binder = ParamBinder::new();
    let mut selects = Vec::new();
    for (index, profile) in filter.profile_filters().iter().enumerate() {
        let suffix = profile_suffix(index);
        let conditions = compile_conditions(domain, tenant, profile, &mut binder, &suffix)?;
        selects.push(format!(
            "SELECT DISTINCT {projection} FROM {}{}",
            relation::base_from(domain, tenant, conditions.joins()),
            conditions.where_clause(),
        ));
    }
    let base = selects.join(" UNION ");

    let (column, order) = sort_column(domain, filter);
    let offset = binder.bind("offset", BindParam::Int(window.offset))?;
    let limit = binder.bind("limit", BindParam::Int(window.limit))?;

    let page_sql = format!(
        "SELECT * FROM ({base}) a ORDER BY a.{column} {} {}, a.id ASC OFFSET {offset} LIMIT {limit}",
        order.sql(),
        order.nulls(),
    );
    let count_sql = format!("SELECT COUNT(*) AS ct FROM ({base}) x");

    Ok(ListPlan {
        page: binder.render(&page_sql)?.ordered_by(format!(
            "{column} {} {}, id ASC",
            order.sql(),
            order.nulls()
        )),
        count: binder.render(&count_sql)?,
        window,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterField, SortSpec};
    use pretty_assertions::assert_eq;

    fn window() -> PageWindow {
        PageWindow {
            offset: 0,
            limit: 25,
        }
    }

    #[test]
    fn empty_filter_lists_everything_in_default_order() {
        let plan = compile(
            Domain::ScmCommits,
            &Tenant::default(),
            &FilterSpec::default(),
            window(),
        )
        .unwrap();
        assert!(plan.page.sql.starts_with("SELECT * FROM (SELECT DISTINCT c.id AS id"));
        assert!(
            plan.page
                .sql
                .ends_with("FROM scm_commits c) a ORDER BY a.committed_at DESC NULLS FIRST, a.id ASC OFFSET $1 LIMIT $2"),
            "{}",
            plan.page.sql
        );
        assert_eq!(plan.page.params, vec![BindParam::Int(0), BindParam::Int(25)]);
        assert!(plan.count.sql.starts_with("SELECT COUNT(*) AS ct FROM (SELECT DISTINCT"));
        assert!(plan.count.params.is_empty());
    }

    #[test]
    fn count_shares_filter_params_but_not_paging() {
        let mut filter = FilterSpec::default();
        filter
            .include
            .insert(FilterField::State, vec!["OPEN".into()]);
        filter.sort = Some(SortSpec {
            key: "title".into(),
            order: SortOrder::Asc,
        });
        let plan = compile(Domain::ScmPullRequests, &Tenant::new("t"), &filter, window()).unwrap();
        assert!(plan.page.sql.contains("ORDER BY a.title ASC NULLS LAST"));
        assert_eq!(plan.page.order.as_deref(), Some("title ASC NULLS LAST, id ASC"));
        assert_eq!(plan.count.order, None);
        assert!(plan.page.sql.contains("pr.state = ANY($1)"));
        assert_eq!(plan.page.params.len(), 3);
        assert_eq!(
            plan.count.params,
            vec![BindParam::TextArray(vec!["OPEN".into()])]
        );
    }

    // Unknown sort keys degrade to the default column instead of failing the request.
    #[test]
    fn unknown_sort_key_falls_back_to_default_column() {
        let filter = FilterSpec {
            sort: Some(SortSpec {
                key: "created_at".into(),
                order: SortOrder::Asc,
            }),
            ..FilterSpec::default()
        };
        let plan = compile(Domain::CicdJobRuns, &Tenant::default(), &filter, window()).unwrap();
        assert!(
            plan.page.sql.contains("ORDER BY a.start_time ASC NULLS LAST"),
            "{}",
            plan.page.sql
        );
    }
}
