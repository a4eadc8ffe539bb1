use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS, SubscribeFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::service::control::ControlPlane;
use crate::service::rule_engine::RuleEngine;
use crate::service::status::StatusAggregator;
use crate::service::worker_pool::RawIngestMessage;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Queue the subscription without waiting on the request channel.
/// Callers are the event loop's only poller and must never block on a full queue.
fn subscribe_all(client: &AsyncClient, topics: &[String], qos: QoS) {
    if topics.is_empty() {
        warn!("No topics configured, nothing to subscribe to");
        return;
    }
    let filters = topics.iter().map(|t| SubscribeFilter::new(t.clone(), qos));
    match client.try_subscribe_many(filters) {
        Ok(()) => info!("Subscribed to {:?} ({:?})", topics, qos),
        Err(e) => error!("Could not queue subscription to {:?}, retrying on next reconnect: {:?}", topics, e),
    }
}

/// Wait out the reconnect backoff. Returns true when shutdown was signalled meanwhile.
async fn backoff(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => false,
        change = shutdown.changed() => change.is_err() || *shutdown.borrow(),
    }
}

/// 1. INGEST LOOP (local broker, QoS 0)
/// Hands every publish to the worker pool; never waits on the sink itself.
pub async fn run_ingest_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    sender: Sender<RawIngestMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    subscribe_all(&client, &topics, QoS::AtMostOnce);
    info!("Ingest loop started.");

    loop {
        tokio::select! {
            change = shutdown.changed() => {
                if change.is_err() || *shutdown.borrow() {
                    info!("Shutdown signal received in ingest loop.");
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = RawIngestMessage { topic: publish.topic, payload: publish.payload.to_vec() };
                    if let Err(e) = sender.send(msg).await {
                        error!("Worker pool channel closed: {:?}", e);
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Local broker connected. Resubscribing...");
                    subscribe_all(&client, &topics, QoS::AtMostOnce);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Local MQTT error: {:?}", e);
                    if backoff(&mut shutdown).await {
                        info!("Shutdown signal received in ingest loop.");
                        break;
                    }
                }
            }
        }
    }

    let _ = client.try_disconnect();
    info!("Ingest loop exited.");
    Ok(())
}

/// 2. CONTROL LOOP (remote broker, QoS 1)
/// Commands are applied one at a time, in arrival order.
pub async fn run_control_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    manage_topic: String,
    control: Arc<ControlPlane>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let topics = vec![manage_topic.clone()];
    subscribe_all(&client, &topics, QoS::AtLeastOnce);
    info!("Control loop started.");

    loop {
        tokio::select! {
            change = shutdown.changed() => {
                if change.is_err() || *shutdown.borrow() {
                    info!("Shutdown signal received in control loop.");
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == manage_topic {
                        control.handle_message(&publish.payload).await;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Remote broker connected. Resubscribing...");
                    subscribe_all(&client, &topics, QoS::AtLeastOnce);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Remote MQTT error: {:?}", e);
                    if backoff(&mut shutdown).await {
                        info!("Shutdown signal received in control loop.");
                        break;
                    }
                }
            }
        }
    }

    let _ = client.try_disconnect();
    info!("Control loop exited.");
    Ok(())
}

/// 3. SCHEDULER
/// Rule evaluation and status publishing share one task, so they never overlap.
pub async fn run_scheduler(
    engine: Arc<RuleEngine>,
    status: Arc<StatusAggregator>,
    rule_interval: Duration,
    status_interval: Duration,
) {
    let mut rule_tick = tokio::time::interval(rule_interval);
    rule_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut status_tick = tokio::time::interval(status_interval);
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(?rule_interval, ?status_interval, "Scheduler started.");

    loop {
        tokio::select! {
            biased;
            _ = rule_tick.tick() => {
                if let Err(e) = engine.run_cycle().await {
                    error!("Rule cycle aborted: {:?}", e);
                }
            }
            _ = status_tick.tick() => {
                if let Err(e) = status.publish().await {
                    error!("Status publish failed: {:?}", e);
                }
            }
        }
    }
}
