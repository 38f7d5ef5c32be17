use chapps::adapter::PolicyConfigAdapter;
use chapps::cache::CacheClient;
use chapps::config::{setup_logging, ConfigFile};
use chapps::handler::{policy_server, PolicyDispatcher, Servers};
use chapps::policy::{
    EmailPolicy, GreylistingPolicy, OutboundQuotaPolicy, SenderDomainAuthPolicy,
};
use chapps::request::encoding_for_label;
use chapps::spf::SpfEnforcementPolicy;
use clap::{command, Arg, ArgAction};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

fn clap_parser() -> clap::Command {
    command!()
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .env("CHAPPS_CONFIG")
                .help("Path to the chapps.ini configuration file"),
        )
        .arg(
            Arg::new("configcheck")
                .long("configcheck")
                .action(ArgAction::SetTrue)
                .help("Load and print the effective configuration, then exit"),
        )
        .arg(
            Arg::new("service")
                .short('s')
                .long("service")
                .value_parser([
                    "outbound-multi",
                    "inbound-multi",
                    "outbound-quota",
                    "greylisting",
                    "sender-domain-auth",
                    "spf",
                ])
                .default_value("outbound-multi")
                .help("Which policy service this process provides"),
        )
}

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let clap_results = clap_parser().get_matches();

    let config = ConfigFile::try_as_cowcell(clap_results.get_one::<String>("config"))?;
    let logger = setup_logging(config.read().await, &clap_results).await?;
    let config_reader = config.read().await;

    info!("Starting CHAPPS");
    info!("Config: {}", *config_reader);

    if clap_results.get_flag("configcheck") {
        println!("{}", config_reader.as_json_pretty()?);
        logger.flush();
        return Ok(());
    }

    let cache = Arc::new(CacheClient::connect(&config_reader.redis).await?);
    let adapter = Arc::new(PolicyConfigAdapter::connect(&config_reader.adapter).await?);
    let encoding = encoding_for_label(&config_reader.chapps.payload_encoding)?;

    let service = clap_results
        .get_one::<String>("service")
        .map(String::as_str)
        .unwrap_or("outbound-multi");
    let policies: Vec<Arc<dyn EmailPolicy>> = match service {
        "outbound-multi" => vec![
            Arc::new(SenderDomainAuthPolicy::new(
                &config_reader,
                cache.clone(),
                adapter.clone(),
            )),
            Arc::new(OutboundQuotaPolicy::new(
                &config_reader,
                cache.clone(),
                adapter.clone(),
            )),
        ],
        "outbound-quota" => vec![Arc::new(OutboundQuotaPolicy::new(
            &config_reader,
            cache.clone(),
            adapter.clone(),
        ))],
        "sender-domain-auth" => vec![Arc::new(SenderDomainAuthPolicy::new(
            &config_reader,
            cache.clone(),
            adapter.clone(),
        ))],
        "greylisting" => vec![Arc::new(GreylistingPolicy::new(
            &config_reader,
            cache.clone(),
            adapter.clone(),
        ))],
        "inbound-multi" => {
            let greylist = Arc::new(GreylistingPolicy::new(
                &config_reader,
                cache.clone(),
                adapter.clone(),
            ));
            let spf = Arc::new(SpfEnforcementPolicy::new(
                &config_reader,
                greylist.clone(),
                adapter.clone(),
            )?);
            vec![greylist, spf]
        }
        "spf" => {
            // the SPF engine carries a greylisting policy for its
            // greylist-action fall-through even when serving alone
            let greylist = Arc::new(GreylistingPolicy::new(
                &config_reader,
                cache.clone(),
                adapter.clone(),
            ));
            vec![Arc::new(SpfEnforcementPolicy::new(
                &config_reader,
                greylist,
                adapter.clone(),
            )?)]
        }
        other => {
            return Err(std::io::Error::other(format!(
                "Unknown service {other:?}"
            )))
        }
    };

    let dispatcher = Arc::new(PolicyDispatcher::new(policies, encoding)?);
    let backlog = config_reader.chapps.listener_backlog;
    info!(
        "CHAPPS {service} service listening on {}:{}",
        dispatcher.channel().listen_address,
        dispatcher.channel().listen_port
    );

    let servers =
        Servers::default().with_policyserver(tokio::spawn(policy_server(dispatcher, backlog)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("CHAPPS exiting on interrupt.");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if servers.all_finished() {
                    error!("Policy listener stopped unexpectedly, exiting.");
                    break;
                }
            }
        }
    }
    logger.flush();
    Ok(())
}
