//! Loopback - a host and a simulated device over an in-memory line.
//!
//! This example demonstrates:
//! - Starting two links on the ends of a `tokio::io::duplex` pipe
//! - Sending a named command and waiting for its ACK
//! - Answering on the device side with a command response
//! - Receiving the translated response on the host side
//!
//! ```text
//! cargo run --example loopback
//! ```

use pcom_link::registry::CommandInfo;
use pcom_link::translate::keys;
use pcom_link::{LinkBuilder, LogicalMessage, MessageKind, ServiceRegistry, Value};

const MOTOR: u16 = 0x0100;

fn registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register_item(MOTOR, "motor");
    registry.register_command(
        MOTOR,
        CommandInfo {
            id: 2,
            name: "move".into(),
            format: "i".into(),
            input_params: vec!["steps".into()],
            output_params: vec!["position".into()],
            output_format: "i".into(),
        },
    );
    registry.register_error_code(0x0101, "motor stalled");
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (host_end, device_end) = tokio::io::duplex(4096);

    let (host_read, host_write) = tokio::io::split(host_end);
    let (host, mut host_inbound) =
        LinkBuilder::new().registry(registry()).start(host_read, host_write);

    let (device_read, device_write) = tokio::io::split(device_end);
    let (device, mut device_inbound) =
        LinkBuilder::new().registry(registry()).start(device_read, device_write);

    // The simulated motor: every "move" reports where it ended up.
    let motor = tokio::spawn(async move {
        let mut position = 0i64;
        while let Some(order) = device_inbound.recv().await {
            if order.kind != MessageKind::Command {
                continue;
            }
            let steps = match order.get("steps").and_then(Value::as_i64) {
                Some(steps) => steps,
                None => continue,
            };
            position += steps;

            let Some(command) = order.name.clone() else {
                continue;
            };
            let kind = MessageKind::CommandResponse;
            let reply = LogicalMessage::new(kind, order.source, MOTOR, Some(command))
                .with_param(keys::RESULT, position);
            if let Err(e) = device.send(reply).await {
                eprintln!("device: reply failed: {e}");
            }
        }
    });

    for steps in [200, -50, 75] {
        let order = LogicalMessage::command(MOTOR, "ui", "move").with_param("steps", steps);
        let receipt = host.send(order).await?;
        println!("host: move {steps:>4} acknowledged as sequence {}", receipt.sequence);

        if let Some(response) = host_inbound.recv().await {
            println!(
                "host: {} -> {:?} ({:?})",
                response.name.as_ref().map(|n| n.to_string()).unwrap_or_default(),
                response.get(keys::RESULT),
                response.status,
            );
        }
    }

    host.close().await;
    motor.await?;
    Ok(())
}
