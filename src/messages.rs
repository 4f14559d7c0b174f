use crate::connection::ConnectionState;
use crate::radio::PeripheralHandle;

/// Remote requests for the connection machine (MQTT control topics).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    StartScan,
    StopScan,
}

/// Lifecycle notifications emitted by the connection machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Transition {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected(PeripheralHandle),
    Disconnected {
        peripheral: PeripheralHandle,
        reason: String,
    },
    Failed(/* reason */ String),
    /// Retry budget exhausted; the machine is back to Idle.
    GaveUp(/* reason */ String),
}
