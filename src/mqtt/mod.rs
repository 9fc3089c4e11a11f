//! MQTT subscription dispatcher.
//!
//! Owns the broker connection, issues one subscription per configured rule
//! plus the `#` catch-all, and drives every inbound publish through the
//! pipeline. Per-message failures never leave the loop; connection-level
//! failures end the run with a [`FatalError`] carrying a suggested exit
//! code, and the caller decides fatality.

use crate::config::MqttConfig;
use crate::error::{FatalError, EXIT_BROKER, EXIT_CONFIG};
use crate::pipeline::Pipeline;
use crate::rule::TopicRouter;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode, Transport};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connection progress, for logging and suback accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Subscribing,
    Active,
}

pub struct Dispatcher {
    client: AsyncClient,
    eventloop: EventLoop,
    router: TopicRouter,
    pipeline: Pipeline,
    state: LinkState,
    pending_subacks: usize,
}

impl Dispatcher {
    /// Build the client from config. The actual connect happens on the
    /// first poll of the event loop in [`run`](Self::run).
    pub fn new(config: &MqttConfig, router: TopicRouter, pipeline: Pipeline) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }
        if config.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        Self {
            client,
            eventloop,
            router,
            pipeline,
            state: LinkState::Connecting,
            pending_subacks: 0,
        }
    }

    /// Process broker events until the connection fails.
    ///
    /// Messages are handled strictly in arrival order; all store calls run
    /// inline, which is fine at the expected message rates.
    pub async fn run(mut self) -> Result<(), FatalError> {
        info!("Connecting to MQTT broker");
        loop {
            let event = self.eventloop.poll().await.map_err(|e| {
                error!(error = %e, "MQTT connection error");
                FatalError::new(format!("MQTT error: {}", e), EXIT_BROKER)
            })?;

            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    info!("MQTT connection established");
                    self.subscribe_all().await?;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    self.handle_suback(&ack.return_codes)?;
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    let topic = publish.topic.clone();
                    if let Some(rule) = self.router.resolve(&topic).cloned() {
                        self.pipeline
                            .handle_rule_message(&rule, &topic, &publish.payload)
                            .await;
                    }
                    // Catch-all bookkeeping runs for every message,
                    // matched or not
                    self.pipeline
                        .handle_any_message(&topic, &publish.payload)
                        .await;
                }
                Event::Incoming(Packet::Disconnect) => {
                    warn!("Broker sent disconnect");
                    return Err(FatalError::new(
                        "MQTT error: broker closed the connection",
                        EXIT_BROKER,
                    ));
                }
                other => {
                    debug!(?other, "Ignoring event");
                }
            }
        }
    }

    /// Issue one subscription per rule pattern plus the catch-all. Called
    /// on every ConnAck so a transport-level reconnect restores the set.
    async fn subscribe_all(&mut self) -> Result<(), FatalError> {
        self.state = LinkState::Subscribing;
        self.pending_subacks = 0;

        let patterns: Vec<String> = self
            .router
            .rules()
            .iter()
            .map(|r| r.pattern.clone())
            .chain(std::iter::once("#".to_string()))
            .collect();

        for pattern in patterns {
            if let Err(e) = self.client.subscribe(&pattern, QoS::AtMostOnce).await {
                error!(pattern = %pattern, error = %e, "Failed to subscribe");
                return Err(FatalError::new(
                    format!("Failed to subscribe to {}", pattern),
                    EXIT_CONFIG,
                ));
            }
            info!(pattern = %pattern, "Subscription requested");
            self.pending_subacks += 1;
        }
        Ok(())
    }

    /// Account one SubAck. A rejection code means the broker refused a
    /// filter we cannot run without.
    fn handle_suback(&mut self, return_codes: &[SubscribeReasonCode]) -> Result<(), FatalError> {
        for code in return_codes {
            match code {
                SubscribeReasonCode::Success(qos) => {
                    debug!(?qos, "Subscription acknowledged");
                }
                SubscribeReasonCode::Failure => {
                    error!("Broker rejected subscription");
                    return Err(FatalError::new(
                        "Broker rejected subscription",
                        EXIT_CONFIG,
                    ));
                }
            }
            self.pending_subacks = self.pending_subacks.saturating_sub(1);
        }
        if self.state == LinkState::Subscribing && self.pending_subacks == 0 {
            self.state = LinkState::Active;
            info!("All subscriptions acknowledged, dispatcher active");
        }
        Ok(())
    }
}
