use anyhow::Result;

use roster_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("roster-daemon")?;
    roster_daemon::server::run().await
}
