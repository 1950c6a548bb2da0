mod aggregate;
mod binder;
mod conditions;
mod dimensions;
mod dora;
mod hierarchy;
mod list;
mod relation;
mod stacks;

pub use aggregate::AggregationResult;
pub use binder::{BindParam, CompiledQuery};
pub use dora::{Band, DoraField, DoraMetrics, DoraProfile, Metric};
pub use relation::Tenant;

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    filter::{Domain, FilterSpec},
    pagination::{paginate, Page, PageWindow},
    storage::{self, Row, Storage},
    time::TimeRange,
};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-request execution state shared by every statement the request issues.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub domain: Domain,
    pub tenant: Tenant,
    pub now: DateTime<Utc>,
    budget: Duration,
    deadline: Instant,
}

#[derive(Clone)]
pub struct QueryEngine {
    storage: Arc<dyn Storage>,
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(storage: Arc<dyn Storage>, config: Arc<AppConfig>) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn context(&self, domain: Domain, tenant: &Tenant, timeout_ms: Option<u64>) -> QueryContext {
        let budget = self.config.effective_timeout(timeout_ms);
        QueryContext {
            domain,
            tenant: tenant.clone(),
            now: Utc::now(),
            budget,
            deadline: Instant::now() + budget,
        }
    }

    /// Runs one statement against the request's remaining time budget.
    async fn fetch(&self, ctx: &QueryContext, query: &CompiledQuery) -> Result<Vec<Row>> {
        debug!(sql = %query.sql, params = query.params.len(), "executing report query");
        match tokio::time::timeout_at(ctx.deadline, self.storage.fetch(query)).await {
            Ok(rows) => rows,
            Err(_) => {
                warn!(
                    domain = ctx.domain.as_str(),
                    budget_ms = ctx.budget.as_millis() as u64,
                    "report query exceeded its time budget"
                );
                Err(ServiceError::Timeout(ctx.budget))
            }
        }
    }

    pub async fn aggregate(&self, request: ReportRequest) -> Result<AggregateResponse> {
        let ctx = self.context(request.domain, &request.tenant, request.timeout_ms);
        let results = self.aggregate_level(&ctx, request.filter, 0).await?;
        Ok(AggregateResponse { results })
    }

    /// One level of the drill-down tree. Boxed because stacks recurse back into it.
    pub(super) fn aggregate_level<'a>(
        &'a self,
        ctx: &'a QueryContext,
        filter: FilterSpec,
        depth: usize,
    ) -> BoxFuture<'a, Result<Vec<AggregationResult>>> {
        async move {
            let plan = aggregate::compile(
                ctx.domain,
                &ctx.tenant,
                &filter,
                self.config.default_across_count,
                ctx.now,
            )?;
            let rows = self.fetch(ctx, &plan.query).await?;
            let results = plan.parse(&rows)?;
            stacks::attach(self, ctx, &filter, &plan, results, depth).await
        }
        .boxed()
    }

    pub async fn list(&self, request: ReportRequest) -> Result<Page<Row>> {
        let ctx = self.context(request.domain, &request.tenant, request.timeout_ms);
        let window = self.page_window(&request.filter)?;
        let plan = list::compile(ctx.domain, &ctx.tenant, &request.filter, window)?;

        paginate(
            plan.window,
            |_| self.fetch(&ctx, &plan.page),
            || async {
                let rows = self.fetch(&ctx, &plan.count).await?;
                Ok(rows
                    .first()
                    .and_then(|row| storage::int(row, "ct"))
                    .unwrap_or(0))
            },
        )
        .await
    }

    pub async fn dora(&self, request: DoraRequest) -> Result<DoraResponse> {
        let ctx = self.context(Domain::ScmPullRequests, &request.tenant, request.timeout_ms);
        let plan = dora::compile(&ctx.tenant, &request.filter, &request.profile, ctx.now)?;
        let rows = self.fetch(&ctx, &plan.query).await?;
        let results = plan.parse(&rows)?;
        Ok(DoraResponse {
            window: plan.window,
            results,
        })
    }

    /// Expands the filtered runs through their downstream triggers and aggregates the closure
    /// under each run's top job.
    pub async fn hierarchy(&self, request: ReportRequest) -> Result<HierarchyResponse> {
        if request.domain != Domain::CicdJobRuns {
            return Err(ServiceError::validation(format!(
                "pipeline hierarchy is not available for {}",
                request.domain.as_str()
            )));
        }
        if request.filter.across.is_none() {
            return Err(ServiceError::validation("across must be set for aggregation"));
        }

        let ctx = self.context(request.domain, &request.tenant, request.timeout_ms);
        let seed_rows = self
            .fetch(&ctx, &hierarchy::seed_query(&ctx.tenant, &request.filter)?)
            .await?;
        let seeds = hierarchy::parse_seeds(&seed_rows);
        let seed_count = seeds.len();

        let mut walker = hierarchy::HierarchyWalker::new(
            seeds,
            self.config.hierarchy_max_depth,
            self.config.hierarchy_max_nodes,
        );
        while !walker.is_done() {
            let query = hierarchy::children_query(&ctx.tenant, walker.frontier())?;
            let rows = self.fetch(&ctx, &query).await?;
            walker.advance(hierarchy::parse_children(&rows));
        }

        let truncated = walker.truncated();
        let closure = walker.into_closure();
        info!(
            seeds = seed_count,
            runs = closure.len(),
            truncated,
            "pipeline hierarchy resolved"
        );
        if closure.is_empty() {
            return Ok(HierarchyResponse {
                results: Vec::new(),
                seeds: 0,
                runs: 0,
                truncated,
            });
        }

        let plan = hierarchy::closure_query(
            &ctx.tenant,
            &request.filter,
            &closure,
            self.config.default_across_count,
        )?;
        let rows = self.fetch(&ctx, &plan.query).await?;
        Ok(HierarchyResponse {
            results: plan.parse(&rows)?,
            seeds: seed_count,
            runs: closure.len(),
            truncated,
        })
    }

    /// Compiles without executing.
    pub fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        let TranslateRequest {
            request,
            mode,
            profile,
        } = request;
        let tenant = &request.tenant;
        let filter = &request.filter;

        let (query, count) = match mode {
            TranslateMode::Aggregate => {
                let plan = aggregate::compile(
                    request.domain,
                    tenant,
                    filter,
                    self.config.default_across_count,
                    Utc::now(),
                )?;
                (plan.query, None)
            }
            TranslateMode::List => {
                let plan = list::compile(request.domain, tenant, filter, self.page_window(filter)?)?;
                (plan.page, Some(plan.count))
            }
            TranslateMode::Dora => (dora::compile(tenant, filter, &profile, Utc::now())?.query, None),
            TranslateMode::Hierarchy => (hierarchy::seed_query(tenant, filter)?, None),
        };

        Ok(TranslateResponse {
            sql: query.sql,
            params: query.params,
            count,
        })
    }

    fn page_window(&self, filter: &FilterSpec) -> Result<PageWindow> {
        PageWindow::resolve(
            filter.page,
            filter.page_size,
            filter.cursor.as_deref(),
            self.config.default_page_size,
            self.config.max_page_size,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub tenant: Tenant,
    pub domain: Domain,
    #[serde(default)]
    pub filter: FilterSpec,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoraRequest {
    #[serde(default)]
    pub tenant: Tenant,
    #[serde(default)]
    pub filter: FilterSpec,
    #[serde(default)]
    pub profile: DoraProfile,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslateMode {
    #[default]
    Aggregate,
    List,
    Dora,
    Hierarchy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslateRequest {
    #[serde(flatten)]
    pub request: ReportRequest,
    #[serde(default)]
    pub mode: TranslateMode,
    #[serde(default)]
    pub profile: DoraProfile,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateResponse {
    pub results: Vec<AggregationResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoraResponse {
    pub window: TimeRange,
    pub results: Vec<DoraMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyResponse {
    pub results: Vec<AggregationResult>,
    pub seeds: usize,
    pub runs: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateResponse {
    pub sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub params: Vec<BindParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<CompiledQuery>,
}
