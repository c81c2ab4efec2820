//! Record two seconds of a sine chord onto a tape, then loop it back while
//! sweeping the playback speed through reverse.
//!
//! Run with: cargo run --example tape_varispeed --features cpal_sink

use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tapegraph::output::CpalDevice;
use tapegraph::stages::{FinalStage, Mixer, Sine, TapeMessage, TapePlayback, TapeRecorder};
use tapegraph::{Engine, Stage, StageGraph, SwapBuffer, TapeBuffer};

fn main() {
    let _ = tracing_subscriber::fmt().try_init();

    let Some(device) = CpalDevice::default_output() else {
        eprintln!("No default output device");
        return;
    };
    let ctx = device.render_context(128);
    let swap = Arc::new(SwapBuffer::new(ctx.block_len()));
    let tape = TapeBuffer::with_capacity_seconds(&ctx, 2.0)
        .expect("two seconds hold a block")
        .shared();

    // record offline, as fast as the graph renders
    {
        let mut mixer = Mixer::new(3);
        let mut rec = TapeRecorder::new(tape.clone());
        let mut out = FinalStage::new(Arc::new(SwapBuffer::new(ctx.block_len())));
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        for freq in [220.0, 277.18, 329.63] {
            let mut sine = Sine::new(freq).with_amplitude(0.15);
            sine.connect(&mut mixer);
            stages.push(Box::new(sine));
        }
        mixer.connect(&mut rec);
        rec.connect(&mut out);
        let sink = out.gid();
        stages.extend([Box::new(mixer) as Box<dyn Stage>, Box::new(rec), Box::new(out)]);

        let graph = StageGraph::from_sink(ctx, stages, sink).expect("valid graph");
        graph.initialize().expect("graph initializes");
        let blocks = (2.0 * ctx.sample_rate as f64 / ctx.frames_per_block as f64) as u64;
        for t in 0..blocks {
            graph.render(t);
        }
    }
    println!("recorded {:.2}s", tape.read().size_in_seconds());

    let mut play = TapePlayback::new(&ctx, &tape);
    play.set_loop(true);
    let mut ctl = play.control();
    let mut out = FinalStage::new(swap.clone());
    play.connect(&mut out);
    let sink = out.gid();

    let stages: Vec<Box<dyn Stage>> = vec![Box::new(play), Box::new(out)];
    let mut engine = Engine::new(StageGraph::from_sink(ctx, stages, sink).expect("valid graph"), swap);
    engine.initialize().expect("graph initializes");
    engine.spawn_output(device.create_output(ctx.channels).expect("output opens"));

    let blocks_per_second = ctx.sample_rate as f64 / ctx.frames_per_block as f64;
    let start = Instant::now();
    let mut last_speed = 1.0;

    while start.elapsed() < Duration::from_secs(20) {
        let elapsed = start.elapsed().as_secs_f64();
        let target = (elapsed * blocks_per_second) as u64 + 8;
        if engine.time() < target {
            engine.process();
        } else {
            sleep(Duration::from_micros(500));
        }

        let speed = (elapsed as f32 * 0.3).cos();
        if (speed - last_speed).abs() > 0.01 {
            let _ = ctl.send(TapeMessage::SetSpeed(speed));
            last_speed = speed;
        }
    }
}
