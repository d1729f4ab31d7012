use anyhow::Result;
use clap::Parser;
use log::debug;

use symmatch::Opts;
use symmatch::cli::SubCommandExtend;
use symmatch::config::SubCommand;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    let threads = opts.threads.unwrap_or_else(num_cpus::get);
    rayon::ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    debug!("使用 {threads} 个线程");

    match &opts.subcmd {
        SubCommand::Match(config) => config.run(&opts),
        SubCommand::Index(config) => config.run(&opts),
        SubCommand::Inspect(config) => config.run(&opts),
    }
}
