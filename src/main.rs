use ndclink::core::config::ClientConfig;
use ndclink::core::kernel::{ElapsedSource, HttpTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Reads NDC_API_KEY, NDC_MESSAGE_KEY, NDC_DEVICE_ID, NDC_SIGNATURE_URL
    #[cfg(feature = "env-file")]
    let config = ClientConfig::from_env_file("NDC")?;
    #[cfg(not(feature = "env-file"))]
    let config = ClientConfig::from_env("NDC")?;
    let transport = HttpTransport::builder(config).build()?;

    println!(
        "Proxies remaining: {}, tunnel active: {}",
        transport.proxies_remaining(),
        transport.has_tunnel()
    );

    match transport.elapsed_realtime().await {
        Ok(elapsed) => println!("Elapsed realtime: {} ms", elapsed),
        Err(e) => println!("Error fetching elapsed realtime: {}", e),
    }

    Ok(())
}
