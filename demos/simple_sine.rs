//! Simple demo: play a sine wave with configurable output device
//!
//! Run with: cargo run --example simple_sine --features cpal_sink
//!
//! Lists available devices and lets you pick one, then plays a 440Hz sine
//! whose frequency drifts slowly.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tapegraph::output::CpalDevice;
use tapegraph::stages::{FinalStage, Sine, SineMessage};
use tapegraph::{Engine, Stage, StageGraph, SwapBuffer};

fn main() {
    let _ = tracing_subscriber::fmt().try_init();

    let devices = CpalDevice::list_outputs();
    if devices.is_empty() {
        eprintln!("No audio output devices found!");
        return;
    }

    println!("Available audio output devices:");
    for (i, device) in devices.iter().enumerate() {
        println!("  [{}] {}", i, device);
    }

    print!("\nSelect device [0]: ");
    io::stdout().flush().unwrap();

    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();
    let choice: usize = input.trim().parse().unwrap_or(0);

    let device = devices.into_iter().nth(choice).unwrap_or_else(|| {
        println!("Invalid choice, using default device");
        CpalDevice::default_output().expect("No default device")
    });
    println!("\nUsing: {}", device);

    let ctx = device.render_context(64);
    let swap = Arc::new(SwapBuffer::new(ctx.block_len()));

    let mut sine = Sine::new(440.0).with_amplitude(0.25);
    let mut sine_ctl = sine.control();
    let mut out = FinalStage::new(swap.clone());
    sine.connect(&mut out);
    let sink = out.gid();

    let stages: Vec<Box<dyn Stage>> = vec![Box::new(sine), Box::new(out)];
    let graph = StageGraph::from_sink(ctx, stages, sink).expect("valid graph");
    let mut engine = Engine::new(graph, swap);
    engine.initialize().expect("graph initializes");
    engine.spawn_output(device.create_output(ctx.channels).expect("output opens"));

    println!("Playing 440Hz sine wave...");
    println!("Press Ctrl+C to stop\n");

    let blocks_per_second = ctx.sample_rate as f64 / ctx.frames_per_block as f64;
    let start = Instant::now();

    loop {
        let elapsed = start.elapsed().as_secs_f64();
        // stay a few blocks ahead of the device
        let target = (elapsed * blocks_per_second) as u64 + 8;

        if engine.time() < target {
            engine.process();
        } else {
            sleep(Duration::from_micros(500));
        }

        // Modulate frequency slowly
        let freq = 440.0 + 220.0 * (elapsed as f32 * 0.5 * std::f32::consts::PI).sin();
        let _ = sine_ctl.send(SineMessage::SetFrequency(freq));
    }
}
