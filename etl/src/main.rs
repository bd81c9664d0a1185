use clap::{Arg, ArgAction, Command, value_parser};
use etl::spatial;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let matches = Command::new("weather-etl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Joins restaurant records with weather observations by geohash")
        .subcommand_required(true)
        .subcommand(
            Command::new("etl")
                .about("Run the ETL pipeline")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .default_value("config/etl.toml")
                        .help("Sets a custom config file"),
                )
                .arg(
                    Arg::new("json-logs")
                        .long("json-logs")
                        .action(ArgAction::SetTrue)
                        .help("Emit logs as JSON lines"),
                ),
        )
        .subcommand(
            Command::new("geohash")
                .about("Print the geohash of a coordinate")
                .arg(
                    Arg::new("lat")
                        .long("lat")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("lng")
                        .long("lng")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("precision")
                        .long("precision")
                        .default_value("4")
                        .value_parser(value_parser!(usize)),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("etl", etl_matches)) => {
            init_logging(etl_matches.get_flag("json-logs"));
            let config_path = etl_matches
                .get_one::<String>("config")
                .map(|s| s.as_str())
                .unwrap_or("config/etl.toml");
            info!(config = config_path, "Starting ETL pipeline");

            match etl::run_etl_pipeline(config_path).await {
                Ok(report) => info!(
                    rows = report.write.rows,
                    partitions = report.write.partitions,
                    "ETL pipeline succeeded"
                ),
                Err(e) => {
                    error!(error = %e, "ETL pipeline failed");
                    eprintln!("ETL pipeline error: {}", e);
                    process::exit(1);
                }
            }
        }
        Some(("geohash", geo_matches)) => {
            let lat = geo_matches.get_one::<f64>("lat").copied();
            let lng = geo_matches.get_one::<f64>("lng").copied();
            let precision = geo_matches
                .get_one::<usize>("precision")
                .copied()
                .unwrap_or(spatial::DEFAULT_PRECISION);

            match spatial::encode(lat, lng, precision) {
                Ok(key) => println!("{}", key),
                Err(e) => {
                    eprintln!("Cannot encode geohash: {}", e);
                    process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("Please specify a valid subcommand");
            process::exit(1);
        }
    }
}
