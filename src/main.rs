use sparrow_trips::{RideConfig, RideContext, SparrowError, TripOperations};

#[tokio::main]
async fn main() -> Result<(), SparrowError> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = RideConfig::from_env()?;
    let user_id = std::env::var("SPARROW_USER_ID")
        .map_err(|_| SparrowError::configuration("SPARROW_USER_ID must be set"))?;

    let ctx = RideContext::new(config, user_id).await?;
    if ctx.trips.resume().await? {
        tracing::info!("Resumed trip {:?}", ctx.trips.snapshot().request_id);
    }

    let mut trips = ctx.trips.subscribe();
    ctx.start_sync().await;
    tracing::info!("Watching trips for user {}, ctrl-c to stop", ctx.user_id);

    loop {
        tokio::select! {
            changed = trips.changed() => {
                if changed.is_err() {
                    break;
                }
                let trip = trips.borrow_and_update().clone();
                tracing::info!(
                    "Trip {:?}: {} (driver {:?}, {}s left)",
                    trip.request_id,
                    trip.rider_label(),
                    trip.driver_name,
                    ctx.trips.remaining_time()
                );
                if trip.is_terminal() {
                    // The loop stops with the trip; start over to catch the next ride
                    ctx.start_sync().await;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ctx.teardown().await?;
    Ok(())
}
