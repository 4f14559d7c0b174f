use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::connection::{ConnectionError, ConnectionHandle};
use crate::messages::ControlCommand;
use crate::radio::NameFilter;

/// Applies remote scan requests to the connection machine.
pub struct Scanner {
    rx: broadcast::Receiver<ControlCommand>,
    connection: ConnectionHandle,
    filter: NameFilter,
}

impl Scanner {
    pub fn new(
        rx: broadcast::Receiver<ControlCommand>,
        connection: ConnectionHandle,
        filter: NameFilter,
    ) -> Self {
        Scanner {
            rx,
            connection,
            filter,
        }
    }

    /// Runs until every sender is dropped or the machine is gone.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.rx.recv().await {
                Ok(ControlCommand::StartScan) => {
                    info!("Received scan request for {:?}", self.filter.name);
                    self.connection.start(self.filter.clone()).await?;
                }
                Ok(ControlCommand::StopScan) => {
                    info!("Received stop request");
                    self.connection.stop().await?;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Receiver closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Scan controller lagged, {n} command(s) skipped");
                }
            }
        }
        Ok(())
    }
}
