//! A complete multidimensional acquisition against simulated hardware.
//!
//! Expands a plan of 2 positions x 3 time points x 2 channels x 3 slices,
//! runs it through the engine, and prints the metadata of the first image.
//!
//! # Running
//! ```bash
//! cargo run --example simulated_mda
//! ```

use std::sync::Arc;

use anyhow::Result;
use mda_engine::hardware::{devices, SimulatedAutofocus, SimulatedCore};
use mda_engine::sink::BufferSink;
use mda_engine::{AcquisitionEngine, AcquisitionSettings, ChannelSpec, NamedPosition};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mda_engine=debug".parse()?),
        )
        .init();

    println!("=== Simulated Multidimensional Acquisition ===\n");

    let core = Arc::new(SimulatedCore::new());
    core.set_current_position(devices::FOCUS, 50.0).await;
    let autofocus = Arc::new(SimulatedAutofocus::with_shift(Arc::clone(&core), 0.4));
    let sink = BufferSink::new();

    let mut settings = AcquisitionSettings::default();
    settings.positions = vec![
        NamedPosition::new("well-A1")
            .with_two_axis(devices::XY_STAGE, 100.0, 200.0)
            .with_single_axis(devices::FOCUS, 50.0),
        NamedPosition::new("well-A2")
            .with_two_axis(devices::XY_STAGE, 900.0, 200.0)
            .with_single_axis(devices::FOCUS, 52.0),
    ];
    settings.num_frames = 3;
    settings.interval_ms = 250.0;
    settings.channels = vec![
        ChannelSpec::new("DAPI", 20.0),
        ChannelSpec::new("FITC", 35.0),
    ];
    settings.slices_um = vec![-0.5, 0.0, 0.5];
    settings.keep_shutter_open_slices = true;
    settings.use_autofocus = true;
    settings.autofocus_skip_frames = 1;

    let engine = AcquisitionEngine::new(Arc::clone(&core) as _, Arc::new(sink.clone()))
        .with_autofocus(autofocus as _);

    println!("Starting the run...");
    let handle = engine.start(settings).await?;
    let summary = handle.wait().await?;

    println!(
        "\nRun {:?}: {} images published\n",
        summary.status, summary.images_published
    );

    let images = sink.images().await;
    if let Some(first) = images.first() {
        println!("Metadata of the first image:");
        let mut tags: Vec<(&str, &str)> = first.tags.iter().collect();
        tags.sort_unstable();
        for (key, value) in tags {
            println!("  {key} = {value}");
        }
    }

    println!("\nHardware commands issued: {}", core.recorded_calls().await.len());
    Ok(())
}
