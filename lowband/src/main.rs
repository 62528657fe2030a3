use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use lowband_config::LowbandConfig;
use lowband_core::Pipeline;
use lowband_http::{RequestDescriptor, ReqwestTransport};
use tokio::task::JoinSet;
use tracing::{error, info};
use utils::init_tracing;

/// Fetch URLs through the bandwidth-aware proxy layer and print what it cost.
#[derive(Debug, Parser)]
#[command(name = "lowband", version)]
struct Args {
    /// Configuration file; defaults apply when it is missing.
    #[arg(short, long, env = "LOWBAND_CONFIG", default_value = "lowband.toml")]
    config: String,

    /// Session the requests belong to (sticky proxy and accounting).
    #[arg(short, long, default_value = "default")]
    session: String,

    /// URLs to fetch concurrently.
    #[arg(required = true)]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let cfg = LowbandConfig::from_file_or_default(&args.config);
    cfg.print();
    if cfg.proxy().pool().is_empty() {
        bail!("no egress proxies configured in [proxy.pool] of {}", args.config);
    }

    let transport = Arc::new(ReqwestTransport::new(cfg.transport().clone()));
    let pipeline = Arc::new(Pipeline::new(&cfg, transport));
    let _health = pipeline.rotator().start_health_checks(cfg.proxy().health());

    let mut tasks = JoinSet::new();
    for url in args.urls {
        let req = RequestDescriptor::get(&url).with_context(|| format!("invalid url '{url}'"))?;
        let pipeline = Arc::clone(&pipeline);
        let session = args.session.clone();
        tasks.spawn(async move { (url, pipeline.handle(&req, &session).await) });
    }

    while let Some(joined) = tasks.join_next().await {
        let (url, result) = joined?;
        match result {
            Ok(resp) => info!(
                target: "lowband",
                %url,
                status = resp.status.as_u16(),
                bytes = resp.body.len(),
                outcome = ?resp.outcome,
                proxy = resp.proxy_id.as_deref().unwrap_or("-"),
                "Done"
            ),
            Err(e) => error!(target: "lowband", %url, error = %e, "Failed"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    Ok(())
}
