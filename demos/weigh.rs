use chrono::NaiveDate;
use scalers::{
    BleScanner, ChannelSink, ConnectionParams, DeviceFamily, Gender, MemorySettings, Result,
    ScaleDevice, ScaleError, ScaleUser, SessionEnv, SinkEvent, TimeoutConfig, WeightUnit,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("⚖️ Scalers Weigh Example");
    info!("Searching for scales...");

    let user = ScaleUser {
        id: 1,
        name: "Alex".to_string(),
        birthday: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default(),
        height_cm: 175.0,
        gender: Gender::Female,
        activity_level: 3,
        initial_weight_kg: 70.0,
        unit: WeightUnit::Kilograms,
    };

    let scanner = BleScanner::new().await?;
    let params = ConnectionParams::default();
    let Some(device) = scanner.scan(&params).await?.into_iter().next() else {
        error!("❌ No supported scale found");
        return Err(ScaleError::DeviceNotFound);
    };
    if let Some(family) = DeviceFamily::detect(&device) {
        info!("✅ Using {} protocol for {}", family, device.name);
    }

    // pairing data is lost on exit; a real application persists its settings
    let (sink, mut events) = ChannelSink::channel();
    let env = SessionEnv::new(
        device.clone(),
        user,
        Arc::new(sink),
        Arc::new(MemorySettings::new()),
    );
    let scale = ScaleDevice::open(&scanner, &device, env, &params, TimeoutConfig::default()).await?;

    let run = tokio::spawn(scale.run());

    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Measurement(m) => {
                println!("\n⚖️ Measurement at {}", m.timestamp);
                println!("   Weight: {:6.2} kg", m.weight_kg);
                if let Some(fat) = m.fat {
                    println!("   Fat:    {fat:6.1} %");
                }
                if let Some(water) = m.water {
                    println!("   Water:  {water:6.1} %");
                }
                if let Some(muscle) = m.muscle {
                    println!("   Muscle: {muscle:6.1} %");
                }
            }
            SinkEvent::Info(code, arg) => info!("ℹ️ {} ({})", code, arg),
        }
    }

    match run.await {
        Ok(Ok(count)) => info!("Done, {} measurement(s)", count),
        Ok(Err(e)) => {
            error!("❌ Session failed: {}", e);
            return Err(e);
        }
        Err(e) => warn!("Session task ended abnormally: {}", e),
    }
    Ok(())
}
