//! Drives a simulated firmware from an async controller: version handshake,
//! a stepper move and a servo sweep, each finished through the event record,
//! then a greeting on a display panel.
//!
//! Run with `RUST_LOG=perilink=debug` for protocol traces.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use perilink::core::ModuleSet;
use perilink::hal::SimulatedBoard;
use perilink::modules::{display, servo, stepper, system};
use perilink::protocol::FirmwareCodec;
use perilink::transport::MemoryTransport;
use perilink::{
    AsyncController, CommandEnvelope, Compatibility, ControllerConfig, EventReason, Firmware, FirmwareConfig,
    ModuleKind, StatusCode, VersionRecord,
};
use tokio::io::DuplexStream;
use tokio::time::{interval, sleep};
use tokio_util::codec::Framed;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const TICK: Duration = Duration::from_millis(5);

/// Serves commands from the stream and ticks the modules on a fixed period
async fn serve(stream: DuplexStream) -> perilink::Result<()> {
    let (_, device) = MemoryTransport::pair();
    let mut firmware = Firmware::new(FirmwareConfig::default(), SimulatedBoard::new(20), device)?;
    let mut framed = Framed::new(stream, FirmwareCodec::new(firmware.config().max_buffer));
    let mut ticker = interval(TICK);

    loop {
        tokio::select! {
            command = framed.next() => match command {
                Some(command) => {
                    let result = firmware.dispatch(&command?);
                    framed.send(result).await?;
                }
                None => return Ok(()),
            },
            _ = ticker.tick() => {
                firmware.board_mut().advance(TICK.as_millis() as u64);
                firmware.service();
            }
        }
    }
}

async fn wait_for_event(controller: &mut AsyncController<DuplexStream>) -> perilink::Result<perilink::EventRecord> {
    loop {
        let record = controller.clear_interrupt().await?;
        if record.reason != EventReason::None {
            return Ok(record);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> perilink::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| perilink::Error::config(format!("Failed to install subscriber: {}", e)))?;

    let (host, device) = tokio::io::duplex(1024);
    let server = tokio::spawn(serve(device));
    let mut controller = AsyncController::new(host, ControllerConfig::default());

    let version = controller.get_version().await?;
    println!("Firmware protocol {}.{}.{}", version.major, version.minor, version.patch);
    println!("Modules: {:?}", version.modules.kinds().collect::<Vec<_>>());
    let expected = VersionRecord::current(ModuleSet::all());
    match version.compare(&expected) {
        Compatibility::Exact => println!("Version check: exact match"),
        other => println!("Version check: {:?}", other),
    }
    println!("Ping back: {}", controller.ping_back(b"perilink").await?);

    // Stepper: attach, tune, move 800 steps
    let attach = CommandEnvelope::to(ModuleKind::Stepper, stepper::cmd::ATTACH).with_args(vec![2, 3, 0xFF]);
    let unit = controller.call(attach).await?.data[0];
    controller
        .call(
            CommandEnvelope::to(ModuleKind::Stepper, stepper::cmd::SET_MAX_SPEED)
                .with_unit(unit)
                .with_args(2000f32.to_le_bytes().to_vec()),
        )
        .await?;
    controller
        .call(
            CommandEnvelope::to(ModuleKind::Stepper, stepper::cmd::SET_ACCELERATION)
                .with_unit(unit)
                .with_args(4000f32.to_le_bytes().to_vec()),
        )
        .await?;
    let start = CommandEnvelope::to(ModuleKind::Stepper, stepper::cmd::START)
        .with_unit(unit)
        .with_args(800i32.to_le_bytes().to_vec());
    let status = controller.call(start).await?.status;
    println!("\nStepper {} move to 800: {:?}", unit, status);
    let record = wait_for_event(&mut controller).await?;
    println!("Event: {:?} from {} unit {} at position {}", record.reason, record.module_id, record.unit, record.payload);

    // Servo: attach on pin 9, sweep to 120 degrees
    let mut args = vec![9];
    args.extend_from_slice(&544u16.to_le_bytes());
    args.extend_from_slice(&2400u16.to_le_bytes());
    let unit = controller
        .call(CommandEnvelope::to(ModuleKind::Servo, servo::cmd::ATTACH).with_args(args))
        .await?
        .data[0];
    let mut args = 120u16.to_le_bytes().to_vec();
    args.extend_from_slice(&240u16.to_le_bytes());
    let result = controller
        .call(CommandEnvelope::to(ModuleKind::Servo, servo::cmd::SWEEP).with_unit(unit).with_args(args))
        .await?;
    assert_eq!(result.status, StatusCode::Accepted);
    println!("\nServo {} sweeping to 120 degrees", unit);
    let record = wait_for_event(&mut controller).await?;
    println!("Event: {:?} from {} at {} degrees", record.reason, record.module_id, record.payload);

    // Display: panel on pins 10..12, one character per digit
    let attach = CommandEnvelope::to(ModuleKind::Display, display::cmd::ATTACH).with_args(vec![10, 11, 12]);
    let unit = controller.call(attach).await?.data[0];
    for (position, c) in b"HELLO".iter().enumerate() {
        let write = CommandEnvelope::to(ModuleKind::Display, display::cmd::DISPLAY_ASCII)
            .with_unit(unit)
            .with_args(vec![position as u8, *c]);
        let status = controller.call(write).await?.status;
        if status != StatusCode::Ok {
            println!("Display write {} failed: {:?}", position, status);
        }
    }
    println!("
Display {} shows HELLO", unit);

    let stats = controller
        .call(CommandEnvelope::to(ModuleKind::System, system::cmd::GET_STATS))
        .await?;
    let words: Vec<u32> = stats
        .data
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    println!("\nLink stats: received {}, rejected {}, dispatched {}", words[0], words[1], words[2]);

    drop(controller);
    server
        .await
        .map_err(|e| perilink::Error::invalid_state(format!("Firmware task failed: {}", e)))??;
    Ok(())
}
