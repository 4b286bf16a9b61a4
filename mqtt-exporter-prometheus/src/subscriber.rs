//! MQTT subscriber feeding broker messages into the ingest coordinator.

use std::time::Duration;

use mqtt_exporter_common::config::MqttConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::ingest::SharedIngest;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 10;

/// Pause between a failed poll and the next (reconnecting) poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT subscriber that feeds messages to the ingest coordinator.
pub struct MqttSubscriber {
    ingest: SharedIngest,
    mqtt_config: MqttConfig,
    filters: Vec<String>,
}

impl MqttSubscriber {
    /// Create a subscriber for every filter the compiled rules need.
    pub fn new(ingest: SharedIngest, mqtt_config: MqttConfig) -> Self {
        let filters = ingest.rules().subscription_filters();
        Self {
            ingest,
            mqtt_config,
            filters,
        }
    }

    /// Topic filters sent to the broker on every connect.
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Client options derived from the broker configuration.
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.mqtt_config.client_id(),
            self.mqtt_config.host.clone(),
            self.mqtt_config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.mqtt_config.keep_alive_secs));
        options.set_max_packet_size(
            self.mqtt_config.max_packet_size,
            self.mqtt_config.max_packet_size,
        );

        if let (Some(user), Some(pass)) = (&self.mqtt_config.username, &self.mqtt_config.password)
        {
            options.set_credentials(user.clone(), pass.clone());
        }

        options
    }

    /// Subscription QoS.
    pub fn qos(&self) -> QoS {
        match self.mqtt_config.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Run the subscriber until the shutdown signal is received.
    ///
    /// Connection failures are retried forever; the event loop reconnects on
    /// the next poll and the filters are re-sent on every `ConnAck`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            host = %self.mqtt_config.host,
            port = self.mqtt_config.port,
            "Connecting to MQTT broker..."
        );

        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown sender dropped, stopping subscriber");
                        break;
                    }
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping subscriber");
                        break;
                    }
                }

                event = eventloop.poll() => {
                    match event {
                        Ok(event) => self.handle_event(&client, event).await,
                        Err(e) => {
                            warn!(error = %e, "MQTT connection error, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "Failed to queue MQTT disconnect");
        }
        drain(&mut eventloop).await;

        info!("Subscriber stopped");
        Ok(())
    }

    async fn handle_event(&self, client: &AsyncClient, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!(host = %self.mqtt_config.host, "Connected to MQTT broker");
                self.subscribe(client).await;
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!(pkid = ack.pkid, "Subscription acknowledged");
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Received message"
                );
                self.ingest.on_message(&publish.topic, &publish.payload);
            }
            _ => {}
        }
    }

    async fn subscribe(&self, client: &AsyncClient) {
        if self.filters.is_empty() {
            warn!("No topic filters to subscribe to");
            return;
        }

        let qos = self.qos();
        let filters = self
            .filters
            .iter()
            .map(|f| SubscribeFilter::new(f.clone(), qos));

        match client.subscribe_many(filters).await {
            Ok(()) => info!(filters = ?self.filters, qos = ?qos, "Subscribing to topics"),
            Err(e) => warn!(error = %e, "Failed to subscribe"),
        }
    }
}

/// Let the event loop flush the queued disconnect, bounded in time.
async fn drain(eventloop: &mut EventLoop) {
    let flush = async {
        while let Ok(event) = eventloop.poll().await {
            if let Event::Outgoing(rumqttc::Outgoing::Disconnect) = event {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_millis(500), flush).await;
}
