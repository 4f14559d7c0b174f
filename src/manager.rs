use std::sync::Arc;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::connection::ConnectionMachine;
use crate::delivery::spawn_delivery;
use crate::hub::Hub;
use crate::messages::{ControlCommand, LinkEvent};
use crate::mqtt::{MqttClient, MqttPublisher};
use crate::radio::Radio;
use crate::scanner::Scanner;
use crate::webhook::WebhookSubscriber;
use crate::{pipeline, push, server};

/// Owns the long-lived pieces and wires them into tasks.
pub struct Manager<R: Radio> {
    config: AppConfig,
    radio: Arc<R>,
    hub: Arc<Hub>,
    mqtt: Option<(MqttClient, rumqttc::EventLoop)>,
}

async fn log_link_events(mut rx: broadcast::Receiver<LinkEvent>) {
    loop {
        match rx.recv().await {
            Ok(LinkEvent::Disconnected { peripheral, reason }) => {
                info!("Lost {} ({}): {reason}", peripheral.name, peripheral.id);
            }
            Ok(LinkEvent::GaveUp(reason)) => {
                warn!("Connection idle until the next scan request ({reason})");
            }
            Ok(event) => debug!("Link event: {event:?}"),
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Link event stream closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Link event observer lagged by {n}");
            }
        }
    }
}

impl<R: Radio> Manager<R> {
    pub fn new(
        config: AppConfig,
        radio: Arc<R>,
        hub: Arc<Hub>,
        mqtt: Option<(MqttClient, rumqttc::EventLoop)>,
    ) -> Self {
        Manager {
            config,
            radio,
            hub,
            mqtt,
        }
    }

    pub async fn run_loop(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = &self.config;

        let http = TcpListener::bind((config.bind_host(), config.http_port()))
            .await
            .with_context(|| format!("binding HTTP port {}", config.http_port()))?;
        let websocket = TcpListener::bind((config.bind_host(), config.websocket_port()))
            .await
            .with_context(|| format!("binding WebSocket port {}", config.websocket_port()))?;

        let (frames_tx, frames_rx) = mpsc::channel(config.frame_queue());
        tokio::spawn(pipeline::run(frames_rx, Arc::clone(&self.hub)));

        let (connection, _machine) = ConnectionMachine::spawn(
            Arc::clone(&self.radio),
            config.connection_settings(),
            frames_tx,
        );
        tokio::spawn(log_link_events(connection.subscribe_events()));

        let client = reqwest::Client::builder()
            .timeout(config.webhook_timeout())
            .build()
            .context("building HTTP client")?;
        for url in config.webhook_urls()? {
            info!("Forwarding events to {url}");
            spawn_delivery(
                &self.hub,
                WebhookSubscriber::new(client.clone(), url, config.webhook_attempts()),
            );
        }

        let (control_tx, control_rx) = broadcast::channel(10);
        let mut scanner = Scanner::new(control_rx, connection.clone(), config.name_filter());
        tokio::spawn(async move {
            if let Err(err) = scanner.run().await {
                error!("Scan controller stopped: {err}");
            }
        });

        let mut mqtt_client = None;
        if let Some((mqtt, mut eventloop)) = self.mqtt {
            spawn_delivery(&self.hub, MqttPublisher::new(mqtt.clone()));
            let events = mqtt.clone();
            let tx = control_tx.clone();
            // Handle incoming MQTT messages (remote scan start/stop)
            tokio::spawn(async move {
                events.event_loop(&mut eventloop, tx).await;
            });
            mqtt_client = Some(mqtt);
        }

        let state = server::AppState {
            hub: Arc::clone(&self.hub),
            connection: connection.clone(),
        };
        let http_server = tokio::spawn(server::serve(
            http,
            server::router(state),
            shutdown.clone(),
        ));
        let push_server = tokio::spawn(server::serve(
            websocket,
            push::router(Arc::clone(&self.hub)),
            shutdown.clone(),
        ));

        control_tx
            .send(ControlCommand::StartScan)
            .context("starting scan")?;

        shutdown.cancelled().await;
        info!("Shutting down");

        if let Err(err) = connection.stop().await {
            warn!("Connection machine already gone: {err}");
        }
        self.hub.close();

        for (name, task) in [("HTTP", http_server), ("WebSocket", push_server)] {
            match task.await {
                Ok(Ok(())) => debug!("{name} server stopped"),
                Ok(Err(err)) => error!("{name} server failed: {err}"),
                Err(err) => error!("{name} server task panicked: {err}"),
            }
        }
        if let Some(mqtt) = mqtt_client {
            if let Err(err) = mqtt.disconnect().await {
                warn!("Error disconnecting from MQTT: {err}");
            }
        }
        info!("Exiting manager event loop");

        Ok(())
    }
}
