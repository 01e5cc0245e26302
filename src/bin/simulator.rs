use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use spo_ingestor::service::bridge::{TelemetryKind, Topics};
use std::time::Duration;
use tokio::time;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish synthetic DC/AC power telemetry", long_about = None)]
struct Args {
    /// MQTT Broker Host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Topic prefix shared with the backend
    #[arg(long, default_value = "spo/v1")]
    base: String,

    /// Number of simulated DC sensors
    #[arg(long, default_value_t = 1)]
    dc_devices: u32,

    /// Number of simulated AC sensors
    #[arg(long, default_value_t = 1)]
    ac_devices: u32,

    /// Messages per second (Total throughput target), at most one per microsecond
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..=MAX_RATE))]
    rate: u64,

    /// Duration of test in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Probability (0..1) that a reading is below the idle threshold
    #[arg(long, default_value_t = 0.5, value_parser = parse_ratio)]
    idle_ratio: f64,
}

const MAX_RATE: u64 = 1_000_000;

fn parse_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("{} is not a probability between 0 and 1", raw))
    }
}

#[derive(Serialize)]
struct DcPayload {
    v: f64,
    i: f64,
    p: f64,
}

#[derive(Serialize)]
struct AcPayload {
    v: f64,
    i: f64,
    p: f64,
    pf: f64,
    f: f64,
    e_wh: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("Starting simulator with config: {:?}", args);

    let total_devices = args
        .dc_devices
        .checked_add(args.ac_devices)
        .filter(|&n| n > 0)
        .ok_or_else(|| anyhow::anyhow!("need at least one and at most {} devices", u32::MAX))?;

    // 1. Setup MQTT Client
    let client_id = format!("spo_simulator_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    // Spawn Event Loop in background to handle network traffic
    tokio::spawn(async move {
        while eventloop.poll().await.is_ok() {
            // Just drain the event loop
        }
    });

    // 2. Load Generation Loop
    let topics = Topics::new(&args.base);
    let start_time = std::time::Instant::now();
    let mut interval = time::interval(Duration::from_micros(MAX_RATE / args.rate));
    let mut energy_wh = vec![0.0_f64; args.ac_devices as usize];
    let mut total_sent: u64 = 0;

    loop {
        interval.tick().await;

        if args.duration > 0 && start_time.elapsed().as_secs() >= args.duration {
            println!("Configured duration {}s elapsed. Stopping.", args.duration);
            break;
        }

        // Round-robin over DC sensors first, then AC sensors
        let index = (total_sent % total_devices as u64) as u32;
        let mut rng = rand::thread_rng();
        let idle = rng.gen_bool(args.idle_ratio);
        let power = if idle { rng.gen_range(0.5..8.0) } else { rng.gen_range(20.0..150.0) };

        let (topic, payload_json) = if index < args.dc_devices {
            let device_id = format!("dc-sim-{}", index + 1);
            let v = rng.gen_range(11.8..12.4);
            let payload = DcPayload { v, i: power / v, p: power };
            (topics.measure(TelemetryKind::Dc, &device_id), serde_json::to_vec(&payload)?)
        } else {
            let slot = (index - args.dc_devices) as usize;
            let device_id = format!("ac-sim-{}", slot + 1);
            let v = rng.gen_range(225.0..235.0);
            let pf = rng.gen_range(0.85..0.99);
            energy_wh[slot] += power / 3600.0 * total_devices as f64 / args.rate as f64;
            let payload = AcPayload {
                v,
                i: power / (v * pf),
                p: power,
                pf,
                f: rng.gen_range(49.9..50.1),
                e_wh: energy_wh[slot],
            };
            (topics.measure(TelemetryKind::Ac, &device_id), serde_json::to_vec(&payload)?)
        };

        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload_json).await {
            eprintln!("Failed to publish: {:?}", e);
        }

        total_sent += 1;
        if total_sent % args.rate == 0 {
            println!("Sent {} messages...", total_sent);
        }
    }

    println!("Simulation complete. Total messages sent: {}", total_sent);
    Ok(())
}
