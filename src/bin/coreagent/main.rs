use clap::Parser;

mod cli;
mod heartbeat;
mod server;

#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::CoreAgent::parse();
    let _guard = corebroker::utils::init_tracing("agent", args.verbosity.clone())?;

    let mut config = corebroker::config::load_config(args.config.as_ref())?.agent;
    args.apply(&mut config);

    server::run(config).await
}
