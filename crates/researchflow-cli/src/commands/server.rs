//! `researchflow server` - Start the ResearchFlow HTTP backend server.

use researchflow_core::AppConfig;

pub async fn run(host: String, port: u16, config: AppConfig) -> Result<(), String> {
    let server_config = researchflow_server::ServerConfig {
        host: host.clone(),
        port,
        db_path: None,
    };

    println!("Starting ResearchFlow server on {}:{}...", host, port);

    let addr = researchflow_server::start_server(server_config, config).await?;
    println!("ResearchFlow server listening on http://{}", addr);

    // Keep the process running until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    Ok(())
}
