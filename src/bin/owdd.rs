#[macro_use]
extern crate log;

use std::{process, sync::Arc};

use owd_suite::{
    configuration::*,
    estimator::DelayTable,
    prober::Prober,
    report::{ReportMode, Reporter},
    responder::Responder,
};
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        error!("Configuration is broken: {}", e);
        process::exit(2);
    }
    let (registry, collector) = match (conf.registry(), conf.collector_addr()) {
        (Ok(registry), Ok(collector)) => (Arc::new(registry), collector),
        (Err(e), _) | (_, Err(e)) => {
            error!("Configuration is broken: {}", e);
            process::exit(2);
        }
    };

    info!(
        "Configuration valid. Starting {} with {} peers...",
        conf.name,
        registry.len()
    );

    // Without a Responder no peer can measure towards this host.
    let responder = match Responder::bind(conf.responder_addr()).await {
        Ok(r) => r,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    tokio::spawn(responder.run());

    let table = Arc::new(DelayTable::new(registry.len()));
    let mut probers: Vec<JoinHandle<Option<f64>>> = Vec::with_capacity(registry.len());

    for peer in registry.iter() {
        let Some(slot) = table.claim(peer.index) else {
            error!("Delay slot {} for {} already in use", peer.index, peer.name);
            continue;
        };
        match Prober::connect(peer.clone(), conf.local_addr, slot, conf.prober_config()).await {
            Ok(prober) => probers.push(tokio::spawn(prober.run())),
            Err(e) => error!("Cannot start prober for {} ({}): {}", peer.name, peer.address, e),
        }
    }

    let reporter = match Reporter::new(
        conf.name.clone(),
        Arc::clone(&registry),
        Arc::clone(&table),
        collector,
        conf.report_interval(),
        conf.report_mode,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            error!("Cannot create report socket: {}", e);
            process::exit(1);
        }
    };

    reporter.run(probers).await;
    if conf.report_mode == ReportMode::Once {
        info!("Single report sent, exiting");
    }
}
