//! Play a sine tone that steps through a few notes
//!
//! Run with: cargo run --example tone --features cpal_sink

use std::thread::sleep;
use std::time::Duration;

use strom::{channel, CpalSink, Engine, EngineConfig, EngineRunner, EngineState, SourceType};

fn main() {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::default();
    let mut sink = CpalSink::default_output(config.channels).expect("no audio output");
    println!("Output: {}Hz, {} ch", sink.sample_rate(), sink.device_channels());

    let (mut controller, endpoint) = channel(config.command_capacity);
    let runner = EngineRunner::spawn(Engine::new(config), endpoint).expect("engine thread");

    // start is deferred until init has finished
    controller.init(sink.sample_rate(), SourceType::Oscillator).unwrap();
    controller.start().unwrap();

    while controller.state() != EngineState::Running {
        for reply in controller.poll() {
            println!("{}: {}", reply.id, reply.body.message());
        }
        sleep(Duration::from_millis(5));
    }

    let consumer = controller
        .buffer()
        .and_then(|buffer| buffer.consumer())
        .expect("shared buffer");
    sink.attach(consumer).expect("attach ring");

    for frequency in [440.0, 330.0, 392.0, 523.25] {
        println!("Playing {}Hz", frequency);
        controller.set_frequency(frequency).unwrap();
        sleep(Duration::from_secs(1));
        for reply in controller.poll() {
            println!("{}: {}", reply.id, reply.body.message());
        }
    }

    controller.stop().unwrap();
    sleep(Duration::from_millis(100));
    println!("underrun quanta: {}", sink.underruns());

    runner.shutdown();
}
