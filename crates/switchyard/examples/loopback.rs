//! Loopback demo - drive the full fabric without a real gateway.
//!
//! Usage: cargo run --example loopback
//!
//! Wires a Switchyard over the in-memory loopback gateway, registers a
//! sync echo handler and a progress-streaming report handler, submits one
//! of each, and prints every frame the "socket" received.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use switchyard::{
    Handler, HandlerError, LoopbackGateway, ProgressReporter, RequestContext, Switchyard,
};
use yardconf::SwitchyardConfig;
use yardproto::{ClientRequest, Connection};

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn process(
        &self,
        _ctx: &RequestContext,
        request: &ClientRequest,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!({ "echo": request.payload }))
    }
}

struct ReportHandler;

#[async_trait]
impl Handler for ReportHandler {
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn process(
        &self,
        _ctx: &RequestContext,
        _request: &ClientRequest,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!({ "url": "s3://reports/demo.pdf" }))
    }

    async fn process_with_progress(
        &self,
        ctx: &RequestContext,
        request: &ClientRequest,
        reporter: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        reporter.set_metadata("stage", "demo");
        for pct in [10.0, 40.0, 70.0, 95.0, 100.0] {
            reporter.report(pct, format!("rendering ({pct}%)"));
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        self.process(ctx, request).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let gateway = LoopbackGateway::new_shared();
    let fabric = Switchyard::new(SwitchyardConfig::default(), gateway.clone())?;
    fabric.handlers().register("echo", Arc::new(EchoHandler));
    fabric
        .handlers()
        .register("generate_report", Arc::new(ReportHandler));
    fabric.start();

    gateway.open("demo-conn");
    fabric
        .connect(Connection::new(
            "demo-conn",
            "demo-user",
            "loopback://demo",
            Duration::from_secs(3600),
        ))
        .await?;

    let echo = ClientRequest::new("echo")
        .with_id("echo-1")
        .with_payload(serde_json::json!({ "msg": "hello fabric" }));
    fabric.handle_frame("demo-conn", &echo.to_bytes()?).await;

    let report = ClientRequest::new("generate_report").with_id("report-1");
    fabric.handle_frame("demo-conn", &report.to_bytes()?).await;

    // Let the report run to completion
    tokio::time::sleep(Duration::from_secs(2)).await;

    println!("\nframes delivered to demo-conn:");
    for frame in gateway.delivered_frames("demo-conn") {
        println!("  {}", serde_json::to_string(&frame)?);
    }
    println!("\ndispatcher metrics: {:#?}", fabric.metrics());

    fabric.shutdown(Duration::from_secs(2)).await;
    Ok(())
}
