use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::time;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publishes synthetic ESP32 telemetry to a local broker", long_about = None)]
struct Args {
    /// MQTT Broker Host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Number of simulated devices (esp32_01, esp32_02, ...)
    #[arg(long, default_value_t = 2)]
    devices: u32,

    /// Publish rounds per second; each round sends one device's full set of topics
    #[arg(long, default_value_t = 1)]
    rate: u64,

    /// Duration of run in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,
}

#[derive(Serialize)]
struct Dht11 {
    temperature: f64,
    humidity: f64,
}

#[derive(Serialize)]
struct Bmp280 {
    temperature: f64,
    pressure: f64,
    pressure_sea_level: f64,
}

#[derive(Serialize)]
struct Mq135 {
    adc_raw: u32,
    ppm: f64,
}

#[derive(Serialize)]
struct Ldr {
    ldr_raw: u32,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// One round of readings for a device, as `(topic, payload)` pairs.
fn device_round(device_id: &str, rng: &mut impl Rng) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let pressure = rng.gen_range(1005.0..1020.0);
    let adc_raw = rng.gen_range(80..900);

    let dht11 = Dht11 {
        temperature: round_to(rng.gen_range(18.0..32.0), 1),
        humidity: round_to(rng.gen_range(35.0..80.0), 1),
    };
    let bmp280 = Bmp280 {
        temperature: round_to(rng.gen_range(18.0..32.0), 2),
        pressure: round_to(pressure, 2),
        pressure_sea_level: round_to(pressure + 12.5, 2),
    };
    let mq135 = Mq135 { adc_raw, ppm: round_to(f64::from(adc_raw) * 1.8, 2) };
    let ldr = Ldr { ldr_raw: rng.gen_range(0..4096) };
    let gpio = if rng.gen_bool(0.5) { "ON" } else { "OFF" };

    Ok(vec![
        (format!("{device_id}/sensor/dht11"), serde_json::to_vec(&dht11)?),
        (format!("{device_id}/sensor/bmp280"), serde_json::to_vec(&bmp280)?),
        (format!("{device_id}/sensor/mq135"), serde_json::to_vec(&mq135)?),
        (format!("{device_id}/sensor/ldr"), serde_json::to_vec(&ldr)?),
        (format!("{device_id}/gpio/2/state"), gpio.as_bytes().to_vec()),
        (format!("{device_id}/status"), b"heartbeat".to_vec()),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.devices > 0, "--devices must be at least 1");
    anyhow::ensure!(args.rate > 0, "--rate must be at least 1");
    println!("Starting Device Simulator with config: {:?}", args);

    // 1. Setup MQTT Client
    let client_id = format!("device_simulator_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&args.username, &args.password) {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    // Spawn Event Loop in background to handle network traffic
    tokio::spawn(async move {
        while eventloop.poll().await.is_ok() {}
    });

    // 2. Publish Loop
    let start_time = std::time::Instant::now();
    let mut interval = time::interval(Duration::from_micros(1_000_000 / args.rate));
    let mut rounds: u64 = 0;
    let mut total_sent: u64 = 0;

    loop {
        interval.tick().await;

        if args.duration > 0 && start_time.elapsed().as_secs() >= args.duration {
            println!("Configured duration {}s elapsed. Stopping.", args.duration);
            break;
        }

        // Round-robin over devices
        let device_id = format!("esp32_{:02}", (rounds % u64::from(args.devices)) + 1);
        let messages = device_round(&device_id, &mut rand::thread_rng())?;

        for (topic, payload) in messages {
            match client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                Ok(()) => total_sent += 1,
                Err(e) => eprintln!("Failed to publish to {}: {:?}", topic, e),
            }
        }

        rounds += 1;
        if rounds % args.rate == 0 {
            println!("Sent {} messages...", total_sent);
        }
    }

    let _ = client.disconnect().await;
    println!("Simulation Complete. Total messages sent: {}", total_sent);
    Ok(())
}
