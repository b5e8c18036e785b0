//! A live link to one robot: the dispatcher task, the telemetry poller and the
//! handles to talk to both.

use crate::codec::Command;
use crate::config::TelemetryConfig;
use crate::dispatcher::{
    CommandHandle, CommandOutcome, ConnectionStatus, DispatchError, DispatchSettings, Dispatcher,
    DispatcherHandle,
};
use crate::mode::LinkState;
use crate::telemetry::{Telemetry, TelemetryPipeline};
use crate::transport::{Transport, TransportError};
use tokio::task::JoinHandle;
use tracing::info;

pub struct Connection {
    dispatcher: DispatcherHandle,
    telemetry: Telemetry,
    dispatcher_task: Option<JoinHandle<()>>,
    telemetry_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Opens the transport and starts both background tasks. Must be called from
    /// inside a tokio runtime.
    pub async fn open<T: Transport>(
        transport_config: T::Config,
        settings: DispatchSettings,
        telemetry_config: &TelemetryConfig,
    ) -> Result<Self, TransportError> {
        let transport = T::open(&transport_config).await?;
        Ok(Self::with_transport(transport, transport_config, settings, telemetry_config))
    }

    /// Same as [`Connection::open`] for a transport that is already open.
    pub fn with_transport<T: Transport>(
        transport: T,
        transport_config: T::Config,
        settings: DispatchSettings,
        telemetry_config: &TelemetryConfig,
    ) -> Self {
        info!("Connecting over {}", transport.describe());
        let (dispatcher, handle) = Dispatcher::new(transport, transport_config, settings);
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let telemetry = Telemetry::new(telemetry_config.broadcast_capacity);
        for packet in &telemetry_config.packets {
            telemetry.watch(*packet);
        }
        let pipeline = TelemetryPipeline::new(
            telemetry.clone(),
            handle.clone(),
            telemetry_config.poll_interval(),
        );
        let telemetry_task = tokio::spawn(pipeline.run());

        Self {
            dispatcher: handle,
            telemetry,
            dispatcher_task: Some(dispatcher_task),
            telemetry_task: Some(telemetry_task),
        }
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn submit(&self, command: Command) -> CommandHandle {
        self.dispatcher.submit(command)
    }

    pub async fn execute(&self, command: Command) -> Result<CommandOutcome, DispatchError> {
        self.dispatcher.execute(command).await
    }

    pub fn link_state(&self) -> LinkState {
        self.dispatcher.link_state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.dispatcher.status()
    }

    pub async fn reconnect(&self) -> Result<(), DispatchError> {
        self.dispatcher.reconnect().await
    }

    /// Stops polling, lets the dispatcher fail whatever is still queued and waits
    /// for it to release the transport.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.telemetry_task.take() {
            task.abort();
        }
        self.dispatcher.shutdown();
        if let Some(task) = self.dispatcher_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.telemetry_task.take() {
            task.abort();
        }
        if self.dispatcher_task.is_some() {
            self.dispatcher.shutdown();
        }
    }
}
