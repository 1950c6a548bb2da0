//! Grouped aggregation over one or more filter profiles.

use super::{
    binder::{profile_suffix, BindParam, CompiledQuery, ParamBinder},
    conditions::compile_conditions,
    dimensions::{self, ResolvedDimension},
    relation::{self, Tenant},
};
use crate::{
    error::{Result, ServiceError},
    filter::{Calculation, Domain, FilterSpec, Range},
    storage::{self, Row},
    time::{default_trend_window, TimeBucket},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationResult {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_key: Option<String>,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacks: Option<Vec<AggregationResult>>,
}

#[derive(Debug, Clone)]
pub struct AggregatePlan {
    pub query: CompiledQuery,
    pub dimension: ResolvedDimension,
    pub calculation: Calculation,
}

pub fn compile(
    domain: Domain,
    tenant: &Tenant,
    filter: &FilterSpec,
    default_across_count: i64,
    now: DateTime<Utc>,
) -> Result<AggregatePlan> {
    let across = filter
        .across
        .ok_or_else(|| ServiceError::validation("across must be set for aggregation"))?;
    let calculation = filter.calculation();
    let duration = match calculation {
        Calculation::Count => None,
        Calculation::Duration => Some(relation::duration_expr(domain).ok_or_else(|| {
            ServiceError::validation(format!(
                "duration is not a supported calculation for {}",
                domain.as_str()
            ))
        })?),
    };

    let dimension = dimensions::resolve(
        domain,
        across,
        filter.interval(),
        calculation,
        filter.sort.as_ref(),
    )?;
    let across_count = filter.across_count.unwrap_or(default_across_count).max(1);

    let mut binder = ParamBinder::new();
    let mut selects = Vec::new();
    for (index, mut profile) in filter.profile_filters().into_iter().enumerate() {
        if let Some(time) = dimension.descriptor.time {
            let ranged = profile
                .ranges
                .get(&time.range)
                .is_some_and(|range| !range.is_empty());
            if !ranged && profile.scope.is_empty() {
                let window = default_trend_window(now, across_count);
                profile.ranges.insert(
                    time.range,
                    Range {
                        from: Some(window.start.timestamp()),
                        to: Some(window.end.timestamp()),
                    },
                );
            }
        }

        let suffix = profile_suffix(index);
        let mut conditions = compile_conditions(domain, tenant, &profile, &mut binder, &suffix)?;
        for join in dimension.descriptor.joins {
            conditions.require(*join);
        }

        let duration_select = duration
            .map(|expr| format!("{expr} AS duration, "))
            .unwrap_or_default();
        // Stage and step joins fan a run out; one row per run and key keeps sums honest.
        selects.push(format!(
            "SELECT DISTINCT {} AS id, {duration_select}{} FROM {}{}",
            relation::id_column(domain),
            dimension.inner_select(),
            relation::base_from(domain, tenant, conditions.joins()),
            conditions.where_clause(),
        ));
    }

    let aggregates = match calculation {
        Calculation::Count => "COUNT(DISTINCT a.id) AS ct".to_string(),
        Calculation::Duration => "MIN(a.duration) AS mn, MAX(a.duration) AS mx, SUM(a.duration) AS sm, COUNT(DISTINCT a.id) AS ct, PERCENTILE_DISC(0.5) WITHIN GROUP (ORDER BY a.duration) AS md".to_string(),
    };
    let guard = dimension
        .not_null_guard()
        .map(|guard| format!(" WHERE {guard}"))
        .unwrap_or_default();
    let limit = binder.bind("across_count", BindParam::Int(across_count))?;

    let sql = format!(
        "SELECT {}, {aggregates} FROM ({}) a{guard} GROUP BY {} ORDER BY {} LIMIT {limit}",
        dimension.outer_select(),
        selects.join(" UNION "),
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

impl AggregatePlan {
    pub fn parse(&self, rows: &[Row]) -> Result<Vec<AggregationResult>> {
        rows.iter().map(|row| self.parse_row(row)).collect()
    }

    fn parse_row(&self, row: &Row) -> Result<AggregationResult> {
        let (key, additional_key) = if self.dimension.is_time() {
            let epoch = storage::int(row, "key").ok_or_else(|| {
                ServiceError::Storage("time bucket row without an epoch key".to_string())
            })?;
            let bucket = TimeBucket::from_epoch(self.dimension.interval, epoch)?;
            (epoch.to_string(), Some(bucket.label))
        } else {
            (
                storage::text(row, "key").unwrap_or_default(),
                storage::text(row, "additional_key"),
            )
        };

        let duration = self.calculation == Calculation::Duration;
        let stat = |column: &str| {
            if duration {
                storage::float(row, column)
            } else {
                None
            }
        };

        Ok(AggregationResult {
            key,
            additional_key,
            count: storage::int(row, "ct").unwrap_or(0),
            min: stat("mn"),
            max: stat("mx"),
            median: stat("md"),
            sum: stat("sm"),
            stacks: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{
        Dimension, FilterField, FilterProfile, RangeField, SortOrder, SortSpec,
    };
    use crate::time::Interval;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn plan(domain: Domain, filter: &FilterSpec) -> AggregatePlan {
        compile(domain, &Tenant::new("acme"), filter, 90, now()).expect("aggregate should compile")
    }

    fn rows(values: serde_json::Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn across_is_required() {
        let err = compile(
            Domain::ScmPullRequests,
            &Tenant::default(),
            &FilterSpec::default(),
            90,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn project_count_groups_and_orders_by_count() {
        let filter = FilterSpec {
            across: Some(Dimension::Project),
            ..FilterSpec::default()
        };
        let plan = plan(Domain::ScmPullRequests, &filter);
        assert_eq!(
            plan.query.sql,
            "SELECT a.key, COUNT(DISTINCT a.id) AS ct FROM (SELECT DISTINCT pr.id AS id, pr.project AS key FROM \"acme\".scm_pullrequests pr) a WHERE a.key IS NOT NULL GROUP BY a.key ORDER BY ct DESC NULLS FIRST, lower(a.key) ASC LIMIT $1"
        );
        assert_eq!(plan.query.params, vec![BindParam::Int(90)]);
        assert_eq!(
            plan.query.order.as_deref(),
            Some("ct DESC NULLS FIRST, lower(key) ASC")
        );

        let results = plan
            .parse(&rows(json!([
                {"key": "A", "ct": 2},
                {"key": "B", "ct": 1}
            ])))
            .unwrap();
        assert_eq!(
            results
                .iter()
                .map(|r| (r.key.as_str(), r.count))
                .collect::<Vec<_>>(),
            vec![("A", 2), ("B", 1)]
        );
        assert_eq!(
            serde_json::to_value(&results[0]).unwrap(),
            json!({"key": "A", "count": 2})
        );
    }

    #[test]
    fn duration_calculation_projects_statistics() {
        let filter = FilterSpec {
            across: Some(Dimension::JobStatus),
            calculation: Some(Calculation::Duration),
            ..FilterSpec::default()
        };
        let plan = plan(Domain::CicdJobRuns, &filter);
        assert!(plan.query.sql.contains("r.duration AS duration"), "{}", plan.query.sql);
        assert!(
            plan.query
                .sql
                .contains("PERCENTILE_DISC(0.5) WITHIN GROUP (ORDER BY a.duration) AS md"),
            "{}",
            plan.query.sql
        );
        assert!(plan.query.sql.contains("ORDER BY md DESC NULLS FIRST"));

        let results = plan
            .parse(&rows(json!([
                {"key": "SUCCESS", "ct": 3, "mn": 10, "mx": 40, "sm": 75, "md": 25}
            ])))
            .unwrap();
        assert_eq!(results[0].median, Some(25.0));
        assert_eq!(results[0].sum, Some(75.0));
    }

    #[test]
    fn commits_reject_duration() {
        let filter = FilterSpec {
            across: Some(Dimension::Project),
            calculation: Some(Calculation::Duration),
            ..FilterSpec::default()
        };
        let err = compile(Domain::ScmCommits, &Tenant::default(), &filter, 90, now()).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn trend_applies_default_window_and_labels_buckets() {
        let filter = FilterSpec {
            across: Some(Dimension::Trend),
            interval: Some(Interval::Month),
            across_count: Some(30),
            ..FilterSpec::default()
        };
        let plan = plan(Domain::CicdJobRuns, &filter);
        let sql = &plan.query.sql;
        assert!(sql.starts_with("SELECT EXTRACT(EPOCH FROM a.bucket)::bigint AS key"), "{sql}");
        assert!(sql.contains("date_trunc('month', r.start_time AT TIME ZONE 'UTC') AS bucket"));
        assert!(sql.contains("WHERE r.start_time >= $1 AND r.start_time <= $2"), "{sql}");
        assert!(sql.ends_with("GROUP BY a.bucket ORDER BY a.bucket DESC NULLS FIRST LIMIT $3"));
        assert_eq!(
            plan.query.params[0],
            BindParam::Timestamptz(now() - chrono::Duration::days(30))
        );

        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap().timestamp();
        let results = plan.parse(&rows(json!([{"key": june, "ct": 4}]))).unwrap();
        assert_eq!(results[0].key, june.to_string());
        assert_eq!(results[0].additional_key.as_deref(), Some("6-2024"));
    }

    #[test]
    fn huge_across_count_keeps_the_window_representable() {
        let filter = FilterSpec {
            across: Some(Dimension::Trend),
            across_count: Some(200_000_000_000),
            ..FilterSpec::default()
        };
        let plan = plan(Domain::CicdJobRuns, &filter);
        assert_eq!(
            plan.query.params[0],
            BindParam::Timestamptz(DateTime::<Utc>::UNIX_EPOCH)
        );
        assert_eq!(plan.query.params[2], BindParam::Int(200_000_000_000));
    }

    #[test]
    fn step_joins_are_deduplicated_before_duration_stats() {
        let mut filter = FilterSpec {
            across: Some(Dimension::JobStatus),
            calculation: Some(Calculation::Duration),
            ..FilterSpec::default()
        };
        filter
            .include
            .insert(FilterField::StepStatus, vec!["failed".into()]);
        let plan = plan(Domain::CicdJobRuns, &filter);
        let sql = &plan.query.sql;
        assert!(
            sql.contains("FROM (SELECT DISTINCT r.id AS id, r.duration AS duration, r.status AS key FROM cicd_job_runs r"),
            "{sql}"
        );
        assert!(sql.contains("JOIN cicd_job_run_stage_steps st"), "{sql}");
        assert!(sql.contains("SUM(a.duration) AS sm"));
    }

    #[test]
    fn explicit_range_suppresses_default_window() {
        let mut filter = FilterSpec {
            across: Some(Dimension::Trend),
            sort: Some(SortSpec {
                key: "trend".into(),
                order: SortOrder::Asc,
            }),
            ..FilterSpec::default()
        };
        filter.ranges.insert(
            RangeField::PrCreatedAt,
            Range {
                from: Some(1_600_000_000),
                to: None,
            },
        );
        let plan = plan(Domain::ScmPullRequests, &filter);
        assert_eq!(plan.query.params.len(), 2);
        assert!(plan.query.sql.contains("ORDER BY a.bucket ASC NULLS LAST"));
    }

    #[test]
    fn profiles_union_with_distinct_suffixes() {
        let filter = FilterSpec {
            across: Some(Dimension::JobStatus),
            profiles: vec![
                FilterProfile {
                    include: BTreeMap::from([(FilterField::JobName, vec!["build".into()])]),
                    ..FilterProfile::default()
                },
                FilterProfile {
                    include: BTreeMap::from([(FilterField::StepStatus, vec!["failed".into()])]),
                    ..FilterProfile::default()
                },
            ],
            ..FilterSpec::default()
        };
        let plan = plan(Domain::CicdJobRuns, &filter);
        let sql = &plan.query.sql;
        assert_eq!(sql.matches(" UNION ").count(), 1, "{sql}");
        // Only the second profile needs the step join.
        assert_eq!(sql.matches("cicd_job_run_stage_steps st").count(), 1, "{sql}");
        assert!(sql.contains("j.job_name = ANY($1)"), "{sql}");
        assert!(sql.contains("st.result = ANY($2)"), "{sql}");
        assert_eq!(plan.query.params.len(), 3);
    }

    #[test]
    fn invalid_sort_field_is_reported() {
        let filter = FilterSpec {
            across: Some(Dimension::State),
            sort: Some(SortSpec {
                key: "created_at".into(),
                order: SortOrder::Desc,
            }),
            ..FilterSpec::default()
        };
        let err = compile(
            Domain::ScmPullRequests,
            &Tenant::default(),
            &filter,
            90,
            now(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid request: Invalid sort field: created_at");
    }
}
