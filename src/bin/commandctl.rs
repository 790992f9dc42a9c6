//! commandctl - sends device commands to a running iot-middleware instance
//!
//! Usage:
//!   commandctl --server http://localhost:8080 qry-rfid-snapshot --device-id DEV1 --device-type V5008 --module-index 0
//!   commandctl --server http://localhost:8080 set-color --device-id DEV1 --device-type V5008 --module-index 0 --sensor-index 10 --color-code 1
//!   commandctl --server http://localhost:8080 clean-alarm --device-id DEV1 --device-type V5008 --module-index 0 --sensor-index 10
//!   commandctl --server http://localhost:8080 qry-dev-mod-info --device-id DEV1 --device-type V5008

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

/// commandctl - send a command intent to an iot-middleware instance
#[derive(Parser, Debug)]
#[command(name = "commandctl", about = "Send device commands to an iot-middleware instance")]
struct Args {
    /// Base URL of the running instance's REST API
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: CommandArgs,
}

#[derive(Subcommand, Debug)]
enum CommandArgs {
    /// Query the RFID snapshot for a module
    QryRfidSnapshot {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_type: String,
        #[arg(long)]
        module_index: u32,
    },
    /// Set the color of one or more U-slot indicators
    SetColor {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_type: String,
        #[arg(long)]
        module_index: u32,
        #[arg(long)]
        sensor_index: u32,
        #[arg(long)]
        color_code: u32,
    },
    /// Clear an alarm on a slot
    CleanAlarm {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_type: String,
        #[arg(long)]
        module_index: u32,
        #[arg(long)]
        sensor_index: u32,
    },
    /// Query both device info and module info for a device
    QryDevModInfo {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_type: String,
    },
    /// Query only device info
    QryDeviceInfo {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_type: String,
    },
    /// Query only module info
    QryModuleInfo {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        device_type: String,
    },
}

fn build_request(command: &CommandArgs) -> (String, String, Value) {
    match command {
        CommandArgs::QryRfidSnapshot { device_id, device_type, module_index } => (
            device_id.clone(),
            device_type.clone(),
            json!({ "messageType": "QRY_RFID_SNAPSHOT", "payload": { "moduleIndex": module_index } }),
        ),
        CommandArgs::SetColor { device_id, device_type, module_index, sensor_index, color_code } => (
            device_id.clone(),
            device_type.clone(),
            json!({
                "messageType": "SET_COLOR",
                "payload": { "moduleIndex": module_index, "sensorIndex": sensor_index, "colorCode": color_code }
            }),
        ),
        CommandArgs::CleanAlarm { device_id, device_type, module_index, sensor_index } => (
            device_id.clone(),
            device_type.clone(),
            json!({
                "messageType": "CLEAN_ALARM",
                "payload": { "moduleIndex": module_index, "sensorIndex": sensor_index }
            }),
        ),
        CommandArgs::QryDevModInfo { device_id, device_type } => (
            device_id.clone(),
            device_type.clone(),
            json!({ "messageType": "QRY_DEV_MOD_INFO", "payload": {} }),
        ),
        CommandArgs::QryDeviceInfo { device_id, device_type } => (
            device_id.clone(),
            device_type.clone(),
            json!({ "messageType": "QRY_DEVICE_INFO", "payload": {} }),
        ),
        CommandArgs::QryModuleInfo { device_id, device_type } => (
            device_id.clone(),
            device_type.clone(),
            json!({ "messageType": "QRY_MODULE_INFO", "payload": {} }),
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (device_id, device_type, mut body) = build_request(&args.command);
    body["deviceId"] = json!(device_id);
    body["deviceType"] = json!(device_type);

    let url = format!("{}/api/commands", args.server.trim_end_matches('/'));
    println!("Sending {} to {} ({})", body["messageType"], device_id, url);

    let client = reqwest::Client::new();
    let response = client.post(&url).json(&body).send().await?;

    let status = response.status();
    let text = response.text().await?;

    println!();
    println!("Response ({}):", status);
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{text}"),
    }

    if !status.is_success() {
        std::process::exit(1);
    }

    Ok(())
}
