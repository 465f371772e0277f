use anyhow::{Result, anyhow, bail};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use clap::{Arg, ArgAction, ArgGroup, Command, value_parser};
use housing_pipeline::config::Settings;
use housing_pipeline::credentials::CredentialSource;
use housing_pipeline::report::format_summary;
use housing_pipeline::store::{SummaryRecord, run_timestamp};
use housing_pipeline::{APP_NAME, PgSummaryStore, Pipeline, dataset, s3_event, set_up_logger};
use log::{debug, info};
use std::path::{Path, PathBuf};

#[derive(Debug)]
enum Source {
    S3 { bucket: String, key: String },
    File(PathBuf),
}

#[derive(Debug)]
struct Args {
    verbose: bool,
    region: Option<String>,
    source: Source,
    dry_run: bool,
}

fn parse_args() -> Result<Args> {
    let matches = Command::new(APP_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Summarizes a housing CSV and stores the per-category averages.")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose mode. Outputs DEBUG and higher log messages."),
        )
        .arg(
            Arg::new("region")
                .short('r')
                .long("region")
                .help("AWS region."),
        )
        .arg(
            Arg::new("bucket")
                .short('b')
                .long("bucket")
                .requires("key")
                .help("S3 bucket name."),
        )
        .arg(
            Arg::new("key")
                .short('k')
                .long("key")
                .requires("bucket")
                .help("S3 key name."),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_parser(value_parser!(PathBuf))
                .help("Local CSV file to process instead of an S3 object."),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .requires("file")
                .help("Print the summary without writing to the database."),
        )
        .group(
            ArgGroup::new("source")
                .args(["bucket", "file"])
                .required(true),
        )
        .get_matches();

    let source = match (
        matches.get_one::<PathBuf>("file"),
        matches.get_one::<String>("bucket"),
        matches.get_one::<String>("key"),
    ) {
        (Some(file), _, _) => Source::File(file.clone()),
        (None, Some(bucket), Some(key)) => Source::S3 {
            bucket: bucket.clone(),
            key: key.clone(),
        },
        _ => return Err(anyhow!("Either --file or --bucket and --key is required")),
    };

    Ok(Args {
        verbose: matches.get_flag("verbose"),
        region: matches.get_one::<String>("region").cloned(),
        source,
        dry_run: matches.get_flag("dry-run"),
    })
}

fn dry_run(path: &Path) -> Result<()> {
    let aggregation = dataset::open(path)?.aggregate()?;
    let processed_at = run_timestamp();

    let records = aggregation
        .candidates
        .iter()
        .map(|candidate| SummaryRecord::new(candidate, processed_at))
        .collect::<Vec<_>>();

    info!(
        "Dry run: {} categories from {} cleaned rows",
        records.len(),
        aggregation.cleaned_rows()
    );
    println!("{}", format_summary(&records));

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    set_up_logger(module_path!(), args.verbose)?;
    debug!("Args: {args:?}");

    if let (Source::File(path), true) = (&args.source, args.dry_run) {
        return dry_run(path);
    }

    let settings = Settings::from_env()?;

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &args.region {
        loader = loader.region(Region::new(region.clone()));
    }
    let aws_config = loader.load().await;

    let store = PgSummaryStore::new(
        CredentialSource::from_env(&aws_config),
        settings.connect_timeout,
    );
    let pipeline = Pipeline::new(
        aws_sdk_s3::Client::new(&aws_config),
        store,
        settings.transient_dir,
    );

    match args.source {
        Source::S3 { bucket, key } => {
            let event = s3_event(args.region.as_deref(), &bucket, &key);
            let result = pipeline.handle(serde_json::to_value(event)?).await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                bail!("Processing s3://{bucket}/{key} failed");
            }
        }
        Source::File(path) => match pipeline.process(&path).await {
            Ok(outcome) => println!("{}", format_summary(&outcome.latest)),
            Err(failure) => bail!(
                "Processing {} failed while {}: {}",
                path.display(),
                failure.stage,
                failure.error
            ),
        },
    }

    Ok(())
}
