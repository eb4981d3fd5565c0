//! Loopback diagnostic: runs a simulated device and a mirror actor
//! against it over real UDP, printing every state change as a JSON line.
//!
//! Useful for eyeballing the full pipeline (listener -> router -> actor
//! -> publisher) without field hardware:
//!
//! ```text
//! RUST_LOG=debug bacmirror mirror-loop --object-type analog-input --instance 3
//! ```

use bacmirror_core::{ObjectId, PropertyId, PropertyValue, StatusFlags};
use bacmirror_runtime::device::{AnalogInput, AnalogValue, BinaryInput, BinaryValue};
use bacmirror_runtime::testkit::{FrameCodec, SimulatedDevice};
use bacmirror_runtime::{
    ConnectionContext, DeviceActor, DeviceConfig, OperationalStatus, RuntimeConfig, StateChange,
    StatePublisher,
};
use bacmirror_tools::ObjectTypeArg;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "mirror-loop")]
struct Args {
    /// Mirrored object type.
    #[arg(long, value_enum, default_value = "analog-input")]
    object_type: ObjectTypeArg,
    /// Mirrored object instance.
    #[arg(long, default_value_t = 3)]
    instance: u32,
    /// Simulated device instance number.
    #[arg(long, default_value_t = 1000)]
    device_instance: u32,
    /// Heartbeat interval in milliseconds (0 disables checks).
    #[arg(long, default_value_t = 2000)]
    status_interval_ms: u64,
    /// Number of simulated value updates to emit before exiting.
    #[arg(long, default_value_t = 10)]
    updates: u32,
    /// Pause between simulated updates in milliseconds.
    #[arg(long, default_value_t = 1000)]
    update_period_ms: u64,
}

struct JsonPublisher;

impl StatePublisher for JsonPublisher {
    fn publish_state_change(&self, change: &StateChange) {
        println!(
            "{}",
            serde_json::json!({
                "event": "state-change",
                "object": change.object.to_string(),
                "property": change.property.to_string(),
                "value": change.value,
            })
        );
    }

    fn publish_operational_state_change(&self, status: &OperationalStatus) {
        println!(
            "{}",
            serde_json::json!({
                "event": "operational-state",
                "status": status.to_string(),
            })
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let simulator = SimulatedDevice::bind(args.device_instance, 42).await?;
    let object = ObjectId::new(args.object_type.into_object_type(), args.instance);
    simulator.set_property(
        object,
        PropertyId::ObjectName,
        PropertyValue::Text(format!("{object}")),
    );
    simulator.set_property(
        object,
        PropertyId::Description,
        PropertyValue::Text("loopback diagnostic point".to_string()),
    );
    simulator.set_property(object, PropertyId::Units, PropertyValue::Enumerated(62));
    simulator.set_property(object, PropertyId::PresentValue, PropertyValue::Real(20.0));
    simulator.set_property(
        object,
        PropertyId::StatusFlags,
        PropertyValue::Flags(StatusFlags::default()),
    );
    log::info!("simulated device on {}", simulator.addr());

    let config = RuntimeConfig {
        status_checks_interval: Duration::from_millis(args.status_interval_ms),
        ..RuntimeConfig::default()
    };
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let ctx = ConnectionContext::connect_on(config, Arc::new(FrameCodec), bind).await?;

    let device = DeviceConfig::new(simulator.addr(), vec![object]);
    let publisher = Arc::new(JsonPublisher);
    let actor = match args.object_type {
        ObjectTypeArg::AnalogInput => {
            DeviceActor::spawn(&ctx, device.clone(), AnalogInput::from_config(&device)?, publisher)?
        }
        ObjectTypeArg::AnalogValue => {
            DeviceActor::spawn(&ctx, device.clone(), AnalogValue::from_config(&device)?, publisher)?
        }
        ObjectTypeArg::BinaryInput => {
            DeviceActor::spawn(&ctx, device.clone(), BinaryInput::from_config(&device)?, publisher)?
        }
        ObjectTypeArg::BinaryValue => {
            DeviceActor::spawn(&ctx, device.clone(), BinaryValue::from_config(&device)?, publisher)?
        }
    };

    for update in 0..args.updates {
        sleep(Duration::from_millis(args.update_period_ms)).await;
        let value = match object.object_type {
            bacmirror_core::ObjectType::BinaryInput | bacmirror_core::ObjectType::BinaryValue => {
                PropertyValue::Boolean(update % 2 == 0)
            }
            _ => PropertyValue::Real(20.0 + f32::from(update as u16 % 100) / 10.0),
        };
        simulator.set_property(object, PropertyId::PresentValue, value);
        simulator.notify_cov(object).await?;
    }

    actor.stop().await;
    ctx.shutdown().await;
    simulator.stop();
    Ok(())
}
