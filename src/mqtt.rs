use crate::prelude::*;
use crate::bridge::{SharedStatus, Status};

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, QoS};
use std::time::Duration;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    /// Topics are relative to the configured namespace.
    pub fn for_status(status: &Status) -> Result<Vec<Message>> {
        let link = if status.link_up { "up" } else { "down" };

        Ok(vec![
            Message {
                topic: "status".to_string(),
                retain: false,
                payload: serde_json::to_string(status)?,
            },
            Message {
                topic: "link".to_string(),
                retain: true,
                payload: link.to_string(),
            },
            Message {
                topic: "inverter".to_string(),
                retain: true,
                payload: status.inverter_serial.to_string(),
            },
        ])
    }
} // }}}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    status: SharedStatus,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, status: SharedStatus) -> Self {
        Self {
            config,
            channels,
            status,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("lux-dongle-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        Ok(())
    }

    // drives the connection; nothing is subscribed, so incoming is only acks
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(incoming)) => trace!("mqtt: {:?}", incoming),
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    // status -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.mqtt().status_interval_secs()));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let status = self
                        .status
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    for message in Message::for_status(&status)? {
                        self.publish(&client, message).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client
                        .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
        debug!("publishing: {} = {}", topic, message.payload);
        if let Err(err) = client
            .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload)
            .await
        {
            warn!("MQTT publish to {} failed: {:?}", topic, err);
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
