//! Serial listener: one read/answer loop on the port

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::handler::RequestHandler;
use super::serve::{serve_transport, LinePolicy};
use crate::config::{SerialParameters, SlaveConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::transport::{open_serial, SerialTransport};

pub(crate) fn open(config: &SlaveConfig) -> ModbusResult<SerialTransport> {
    let parameters: &SerialParameters = config
        .serial
        .as_ref()
        .ok_or_else(|| ModbusError::config("serial transport requires serial parameters"))?;
    open_serial(parameters, config.timeout())
}

pub(crate) fn spawn(
    transport: SerialTransport,
    handler: RequestHandler,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        serve_transport(transport, &handler, &cancel, LinePolicy::Line).await;
        info!("Serial listener stopped");
    })
}
