use tonic::{Request, Response, Status, Streaming};

use super::session::{Ingestor, Session, StreamKind};
use crate::proto::resource_usage_agent::resource_usage_agent_server::ResourceUsageAgent;
use crate::proto::resource_usage_agent::{ReportCpuTimeRequest, ReportCpuTimeResponse};
use crate::proto::tipb::top_sql_agent_server::TopSqlAgent;
use crate::proto::tipb::{CpuTimeRecord, EmptyResponse, PlanMeta, SqlMeta};

/// `tipb.TopSQLAgent` endpoint of one fleet member.
pub struct TiDbCollector {
    ingestor: Ingestor,
    port: u16,
}

impl TiDbCollector {
    pub fn new(ingestor: Ingestor, port: u16) -> Self {
        Self { ingestor, port }
    }

    fn session(&self, kind: StreamKind) -> Session {
        Session::new(self.ingestor.clone(), kind, self.port)
    }
}

#[tonic::async_trait]
impl TopSqlAgent for TiDbCollector {
    async fn report_cpu_time_records(
        &self,
        request: Request<Streaming<CpuTimeRecord>>,
    ) -> Result<Response<EmptyResponse>, Status> {
        self.session(StreamKind::CpuTimeRecords)
            .run(request.into_inner())
            .await?;
        Ok(Response::new(EmptyResponse {}))
    }

    async fn report_sql_meta(
        &self,
        request: Request<Streaming<SqlMeta>>,
    ) -> Result<Response<EmptyResponse>, Status> {
        self.session(StreamKind::SqlMeta)
            .run(request.into_inner())
            .await?;
        Ok(Response::new(EmptyResponse {}))
    }

    async fn report_plan_meta(
        &self,
        request: Request<Streaming<PlanMeta>>,
    ) -> Result<Response<EmptyResponse>, Status> {
        self.session(StreamKind::PlanMeta)
            .run(request.into_inner())
            .await?;
        Ok(Response::new(EmptyResponse {}))
    }
}

/// `resource_usage_agent.ResourceUsageAgent` endpoint of one fleet member.
pub struct TiKvCollector {
    ingestor: Ingestor,
    port: u16,
}

impl TiKvCollector {
    pub fn new(ingestor: Ingestor, port: u16) -> Self {
        Self { ingestor, port }
    }
}

#[tonic::async_trait]
impl ResourceUsageAgent for TiKvCollector {
    async fn report_cpu_time(
        &self,
        request: Request<Streaming<ReportCpuTimeRequest>>,
    ) -> Result<Response<ReportCpuTimeResponse>, Status> {
        Session::new(self.ingestor.clone(), StreamKind::CpuTime, self.port)
            .run(request.into_inner())
            .await?;
        Ok(Response::new(ReportCpuTimeResponse {}))
    }
}
