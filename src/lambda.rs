use aws_config::BehaviorVersion;
use housing_pipeline::config::Settings;
use housing_pipeline::credentials::CredentialSource;
use housing_pipeline::{PgSummaryStore, Pipeline, set_up_logger};
use lambda_runtime::{LambdaEvent, service_fn};
use serde_json::Value;
use std::error::Error;

type LambdaError = Box<dyn Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    let settings = Settings::from_env()?;
    set_up_logger(module_path!(), settings.verbose)?;

    let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let store = PgSummaryStore::new(
        CredentialSource::from_env(&aws_config),
        settings.connect_timeout,
    );
    let pipeline = Pipeline::new(
        aws_sdk_s3::Client::new(&aws_config),
        store,
        settings.transient_dir,
    );

    let func = service_fn(|event| function(&pipeline, event));
    lambda_runtime::run(func).await?;
    Ok(())
}

async fn function(
    pipeline: &Pipeline<PgSummaryStore>,
    event: LambdaEvent<Value>,
) -> Result<Value, LambdaError> {
    let result = pipeline.handle(event.payload).await;

    Ok(serde_json::to_value(result)?)
}
