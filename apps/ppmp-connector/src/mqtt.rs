use crate::config::MqttSettings;
use crate::pipeline::IngestHandle;
use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, Transport};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Subscription stage: hands every publish on `<network>/+/ppmp` to the ingest
/// queue and does nothing else on this task.
pub async fn run_listener(
    settings: MqttSettings,
    ingest: IngestHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let topic_filter = settings.topic_filter();
    let transport = build_transport(&settings)?;
    let stats = ingest.stats();

    while !cancel.is_cancelled() {
        let mut mqttoptions =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        mqttoptions.set_keep_alive(settings.keepalive());
        if let Some(username) = &settings.username {
            mqttoptions.set_credentials(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            );
        }
        if let Some(transport) = transport.clone() {
            mqttoptions.set_transport(transport);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);
        if let Err(err) = client
            .subscribe(topic_filter.clone(), QoS::AtLeastOnce)
            .await
        {
            tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client.disconnect().await;
                    stats.set_mqtt_connected(false);
                    tracing::info!("MQTT listener stopping");
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        ingest.enqueue(publish.payload);
                    }
                    Ok(Event::Incoming(Incoming::SubAck(_))) => {
                        tracing::info!(topic=%topic_filter, host=%settings.host, "subscribed to PPMP feed");
                        stats.set_mqtt_connected(true);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        stats.set_mqtt_connected(false);
                        tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                        break;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }
    Ok(())
}

fn build_transport(settings: &MqttSettings) -> Result<Option<Transport>> {
    let Some(path) = settings.tls_cert.as_ref() else {
        return Ok(None);
    };
    let ca = std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS certificate {}", path.display()))?;
    Ok(Some(Transport::tls(ca, None, None)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings(tls_cert: Option<PathBuf>) -> MqttSettings {
        MqttSettings {
            network_name: "mh".into(),
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            tls_cert,
            client_id: "test".into(),
            keepalive_secs: 30,
        }
    }

    #[test]
    fn plain_transport_without_certificate() {
        let transport = build_transport(&settings(None)).unwrap();
        assert!(transport.is_none());
    }

    #[test]
    fn missing_certificate_is_an_error() {
        let Err(err) = build_transport(&settings(Some(PathBuf::from("/nonexistent/ca.pem")))) else {
            panic!("expected an unreadable certificate to fail");
        };
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn certificate_enables_tls() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"-----BEGIN CERTIFICATE-----\n").unwrap();
        let transport = build_transport(&settings(Some(file.path().to_path_buf()))).unwrap();
        assert!(matches!(transport, Some(Transport::Tls(_))));
    }
}
