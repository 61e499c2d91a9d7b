//! Mix audio files from the command line
//!
//! Run with: cargo run --example player --features cpal_sink -- a.wav b.flac

use std::thread::sleep;
use std::time::Duration;

use strom::{
    channel, AudioFile, CpalSink, Engine, EngineConfig, EngineRunner, EngineState, LoadReport,
    Response, SourceType,
};

fn main() {
    tracing_subscriber::fmt::init();

    let files: Vec<AudioFile> = std::env::args()
        .skip(1)
        .map(|path| {
            let bytes = std::fs::read(&path).unwrap_or_else(|e| panic!("{}: {}", path, e));
            AudioFile::new(path, bytes)
        })
        .collect();
    if files.is_empty() {
        eprintln!("usage: player <file> [file ...]");
        return;
    }

    let config = EngineConfig::default();
    let mut sink = CpalSink::default_output(config.channels).expect("no audio output");
    let sample_rate = sink.sample_rate();

    let (mut controller, endpoint) = channel(config.command_capacity);
    let runner = EngineRunner::spawn(Engine::new(config), endpoint).expect("engine thread");

    controller.init(sample_rate, SourceType::MultiTrackPlayer).unwrap();
    controller.load_audio_files(files).unwrap();
    controller.start().unwrap();

    let mut longest = 0;
    while controller.state() != EngineState::Running {
        for reply in controller.poll() {
            println!("{}: {}", reply.id, reply.body.message());
            if let Response::AudioFileReceived(Ok(LoadReport::Batch(summary))) = &reply.body {
                longest = summary
                    .outcomes
                    .iter()
                    .filter_map(|o| o.result.as_ref().ok())
                    .map(|info| info.frames)
                    .max()
                    .unwrap_or(0);
            }
        }
        sleep(Duration::from_millis(5));
    }

    let consumer = controller
        .buffer()
        .and_then(|buffer| buffer.consumer())
        .expect("shared buffer");
    sink.attach(consumer).expect("attach ring");

    let secs = longest as f64 / sample_rate as f64;
    println!("Playing {:.1}s", secs);
    sleep(Duration::from_secs_f64(secs + 0.25));

    // play it all once more from the top
    controller.reset().unwrap();
    sleep(Duration::from_secs_f64(secs + 0.25));

    controller.stop().unwrap();
    println!("underrun quanta: {}", sink.underruns());
    runner.shutdown();
}
