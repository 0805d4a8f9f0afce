#[macro_use]
extern crate log;

use std::process;

use owd_suite::{collector::Collector, configuration::*};

#[tokio::main]
async fn main() {
    env_logger::init();

    let conf = CollectorConfiguration::parse();
    info!("Configuration valid. Starting up...");

    let mut collector = match Collector::bind(conf.bind_addr(), conf.output_format).await {
        Ok(c) => c,
        Err(e) => {
            error!("Cannot bind to address {}: {}", conf.bind_addr(), e);
            process::exit(1);
        }
    };

    if let Some(dir) = &conf.output_dir {
        info!("Writing reports below {}", dir.display());
        collector = collector.with_output_dir(dir);
    }

    collector.run().await;
}
