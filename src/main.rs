#[tokio::main]
async fn main() -> wechat_relay::error::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("wechat_relay=info,hyper=warn"),
    )
    .init();
    log::info!("Starting wechat-relay");

    match wechat_relay::run().await {
        Ok(()) => {
            log::info!("Relay shut down successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Relay encountered an error: {}", e);
            Err(e)
        }
    }
}
