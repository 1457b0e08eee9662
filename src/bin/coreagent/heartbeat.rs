use corebroker::client::ControllerClient;
use corebroker::core::agent::Registration;
use std::time::Duration;

/// Register with the controller, then re-register every `every` with the
/// full payload so a restarted controller relearns this agent.
pub async fn run(client: ControllerClient, registration: Registration, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut registered = false;

    loop {
        interval.tick().await;
        match client.register(&registration).await {
            Ok(()) => {
                if !registered {
                    tracing::info!(
                        "Registered {} with controller {}",
                        registration.vm_name,
                        client.base_url()
                    );
                }
                registered = true;
            }
            Err(e) => {
                if registered {
                    tracing::warn!("Heartbeat failed: {e}");
                } else {
                    tracing::warn!("Registration failed, retrying: {e}");
                }
                registered = false;
            }
        }
    }
}
