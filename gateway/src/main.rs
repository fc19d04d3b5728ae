#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

use codepair_gateway::config::Config;

#[actix_web::main]
async fn main() -> Result<(), std::io::Error> {
    env_logger::init();

    let config = Config::from_env();

    codepair_gateway::run(config).await
}
