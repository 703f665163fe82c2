use crate::config::Config;
use crate::ingest::Ingestor;
use crate::telemetry::parse_mqtt_payload;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

pub async fn run_listener(config: Config, ingestor: Ingestor) -> Result<()> {
    let reading_filter = format!("{}/+/+/reading", config.mqtt_topic_prefix);
    let stats = ingestor.stats();
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        match client
            .subscribe(reading_filter.clone(), QoS::AtLeastOnce)
            .await
        {
            Ok(_) => {
                tracing::info!(topic=%reading_filter, "subscribed to sensor readings");
                stats.set_mqtt_connected(true);
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_mqtt_payload(
                        &config.mqtt_topic_prefix,
                        &publish.topic,
                        &mut payload,
                    ) {
                        Ok(Some(decoded)) => {
                            let device_id = decoded.reading.device_id.clone();
                            if let Err(err) = ingestor
                                .ingest(&device_id, &decoded.user_id, decoded.reading)
                                .await
                            {
                                tracing::warn!(error=%err, device=%device_id, "failed to ingest MQTT reading");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
