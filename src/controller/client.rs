use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::core::{ControllerConfig, Error, ModuleKind, Result, StatusCode};
use crate::firmware::{EventRecord, VersionRecord};
use crate::modules::system;
use crate::protocol::{CommandEnvelope, ControllerCodec, ResultEnvelope};

/// Controller over an async byte stream (serial adapter, socket, pipe)
pub struct AsyncController<S> {
    framed: Framed<S, ControllerCodec>,
    config: ControllerConfig,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncController<S> {
    pub fn new(stream: S, config: ControllerConfig) -> Self {
        AsyncController {
            framed: Framed::new(stream, ControllerCodec::new(config.max_buffer)),
            config,
        }
    }

    /// Drops results already buffered from calls that timed out
    fn discard_stale(&mut self) -> Result<usize> {
        let mut discarded = 0;
        while let Some(Some(result)) = self.framed.next().now_or_never() {
            let result = result?;
            warn!("discarding late {:?} result with {} bytes", result.status, result.data.len());
            discarded += 1;
        }
        Ok(discarded)
    }

    /// Sends `command` and waits up to `response_timeout` for its result
    pub async fn call(&mut self, command: CommandEnvelope) -> Result<ResultEnvelope> {
        let module_id = command.module_id;
        let command_id = command.command_id;
        self.discard_stale()?;
        self.framed.send(command).await?;

        match timeout(self.config.response_timeout, self.framed.next()).await {
            Ok(Some(result)) => {
                let result = result?;
                debug!("{} command {} -> {:?}", module_id, command_id, result.status);
                Ok(result)
            }
            Ok(None) => Err(Error::transport("link closed while waiting for a result")),
            Err(_) => {
                warn!("no result for {} command {}", module_id, command_id);
                Err(Error::timeout(format!(
                    "no result for {} command {} within {:?}",
                    module_id, command_id, self.config.response_timeout
                )))
            }
        }
    }

    async fn system(&mut self, command_id: u8, args: Vec<u8>) -> Result<ResultEnvelope> {
        let command = CommandEnvelope::to(ModuleKind::System, command_id).with_args(args);
        let result = self.call(command).await?;
        if result.status != StatusCode::Ok {
            return Err(Error::protocol(format!(
                "system command {} failed with {:?}",
                command_id, result.status
            )));
        }
        Ok(result)
    }

    pub async fn get_version(&mut self) -> Result<VersionRecord> {
        let result = self.system(system::cmd::GET_VERSION, Vec::new()).await?;
        VersionRecord::from_bytes(&result.data).ok_or_else(|| Error::protocol("malformed version record"))
    }

    pub async fn clear_interrupt(&mut self) -> Result<EventRecord> {
        let result = self.system(system::cmd::CLEAR_INTERRUPT, Vec::new()).await?;
        EventRecord::from_bytes(&result.data).ok_or_else(|| Error::protocol("malformed event record"))
    }

    pub async fn ping_back(&mut self, data: &[u8]) -> Result<bool> {
        if data.len() > u8::MAX as usize {
            return Err(Error::protocol(format!("ping of {} bytes exceeds 255", data.len())));
        }
        let mut args = Vec::with_capacity(data.len() + 1);
        args.push(data.len() as u8);
        args.extend_from_slice(data);
        let result = self.system(system::cmd::PING_BACK, args).await?;
        Ok(&result.data[..] == data)
    }

    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio_test::assert_ok;

    use crate::core::{FirmwareConfig, ModuleSet};
    use crate::firmware::{EventReason, Firmware};
    use crate::hal::SimulatedBoard;
    use crate::modules::pin;
    use crate::protocol::FirmwareCodec;
    use crate::transport::MemoryTransport;

    /// Serves firmware commands arriving on a duplex stream
    fn spawn_firmware(stream: DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (_, device) = MemoryTransport::pair();
            let mut firmware = Firmware::new(FirmwareConfig::default(), SimulatedBoard::new(20), device).unwrap();
            let mut framed = Framed::new(stream, FirmwareCodec::new(64));
            while let Some(command) = framed.next().await {
                let result = firmware.dispatch(&command.unwrap());
                firmware.service();
                framed.send(result).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn test_version_over_stream() {
        let (host, device) = tokio::io::duplex(256);
        let server = spawn_firmware(device);
        let mut controller = AsyncController::new(host, ControllerConfig::default());

        let version = assert_ok!(controller.get_version().await);
        assert_eq!(version, VersionRecord::current(ModuleSet::all()));
        assert!(assert_ok!(controller.ping_back(b"hello").await));

        drop(controller);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_over_stream() {
        let (host, device) = tokio::io::duplex(256);
        let _server = spawn_firmware(device);
        let mut controller = AsyncController::new(host, ControllerConfig::default());

        let result = controller
            .call(CommandEnvelope::to(ModuleKind::Pin, pin::cmd::DIGITAL_WRITE).with_args(vec![6, 1]))
            .await
            .unwrap();
        assert_eq!(result.status, StatusCode::Ok);

        let result = controller.call(CommandEnvelope::new(crate::core::ModuleId(12), 0)).await.unwrap();
        assert_eq!(result.status, StatusCode::UnknownModule);

        let record = controller.clear_interrupt().await.unwrap();
        assert_eq!(record.reason, EventReason::None);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (host, _device) = tokio::io::duplex(256);
        let config = ControllerConfig {
            response_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut controller = AsyncController::new(host, config);
        let err = controller.get_version().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped() {
        let (host, device) = tokio::io::duplex(256);
        let _server = tokio::spawn(async move {
            let (_, link) = MemoryTransport::pair();
            let mut firmware = Firmware::new(FirmwareConfig::default(), SimulatedBoard::new(20), link).unwrap();
            let mut framed = Framed::new(device, FirmwareCodec::new(64));
            let mut first = true;
            while let Some(command) = framed.next().await {
                if first {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    first = false;
                }
                let result = firmware.dispatch(&command.unwrap());
                framed.send(result).await.unwrap();
            }
        });
        let config = ControllerConfig {
            response_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut controller = AsyncController::new(host, config);

        let err = controller.get_version().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(assert_ok!(controller.ping_back(b"abc").await));
    }

    #[tokio::test]
    async fn test_closed_link() {
        let (host, device) = tokio::io::duplex(256);
        drop(device);
        let mut controller = AsyncController::new(host, ControllerConfig::default());
        assert!(controller.get_version().await.is_err());
    }
}
