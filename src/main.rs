use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use clap::Parser;
use iq_digitizer::{
    analysis::{load_samples, write_complex, write_displacement, Track},
    args::{convert_filter, Args, Command},
    collector::{DatagramCollector, NotificationCollector},
    config::{Config, SinkMode},
    loopback,
    monitoring::summarize,
    sampler::HardwareSampler,
    transport::{DatagramSink, FileSink, NotificationSink},
    Error, Result,
};
use tracing::{error, info, warn};

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();
    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::Process {
        input,
        displacement,
        complex,
    } = &args.command
    {
        return process(input, displacement.as_deref(), complex.as_deref());
    }

    let config = args.overrides.resolve()?;
    config.validate()?;
    info!(
        "{} Hz, decimation {} ({:?}), {} s: {} samples",
        config.sample_rate,
        config.effective_decimation(),
        config.output_mode,
        config.duration,
        config.target()
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .map_err(|e| Error::Configuration(format!("installing interrupt handler: {e}")))?;

    match args.command {
        Command::Sample => sample(&config, &interrupted),
        Command::Collect => collect(&config, &interrupted),
        Command::Loopback => run_loopback(&config, &interrupted),
        Command::Process { .. } => Ok(()),
    }
}

fn sample(config: &Config, interrupted: &AtomicBool) -> Result<()> {
    let mut sampler = HardwareSampler::simulated(config);
    match config.sink {
        SinkMode::File => {
            let mut sink = FileSink::new(&config.output, config.buffer_capacity);
            sink.run(&mut sampler, config.target())?;
        }
        SinkMode::Datagram => {
            let mut sink = DatagramSink::bind(config.bind_address, config.credentials.as_ref())?;
            if sink.run(&mut sampler, config.target(), interrupted)?.is_none() {
                info!("Stopped before anyone asked for data");
            }
        }
        SinkMode::Notification => {
            return Err(Error::Configuration(
                "no radio stack attached, run the notification path with `loopback`".into(),
            ))
        }
    }
    Ok(())
}

fn collect(config: &Config, interrupted: &AtomicBool) -> Result<()> {
    if config.sink != SinkMode::Datagram {
        warn!("Collecting over the network regardless of sink {:?}", config.sink);
    }
    let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    let mut collector = DatagramCollector::connect(
        any,
        config.peer_address,
        config.target(),
        config.idle_timeout(),
        &config.output,
    )?;
    let report = collector.run_to_file(interrupted)?;
    info!(
        "Session ended ({:?}): {} samples saved to {:?}, {} malformed skipped",
        report.end, report.received, config.output, report.malformed
    );
    Ok(())
}

fn run_loopback(config: &Config, interrupted: &AtomicBool) -> Result<()> {
    let (peripheral, mut central) = loopback::pair("00:00:00:00:00:00");
    let stop = Arc::new(AtomicBool::new(false));
    let device = {
        let stop = stop.clone();
        let config = config.clone();
        thread::spawn(move || {
            let mut sampler = HardwareSampler::simulated(&config);
            NotificationSink::new(peripheral, &config.device_name).serve(&mut sampler, &stop)
        })
    };

    let mut collector = NotificationCollector::new(config);
    let result = collector.run(&mut central, interrupted);
    stop.store(true, Ordering::Relaxed);
    match device.join() {
        Ok(Ok(sent)) => info!("Device sent {} notifications", sent),
        Ok(Err(e)) => warn!("Device side failed: {}", e),
        Err(_) => error!("Device thread panicked"),
    }
    summarize(collector.reception().buffer());
    let end = result?;
    info!("Session ended: {:?}", end);
    Ok(())
}

fn process(input: &Path, displacement: Option<&Path>, complex: Option<&Path>) -> Result<()> {
    let samples = load_samples(input)?;
    let track = Track::from_samples(&samples);
    info!(
        "{} I/Q pairs, peak-to-peak displacement {:.3} mm",
        track.pairs.len(),
        track.excursion() * 1e3
    );
    let displacement = displacement
        .map(Path::to_path_buf)
        .unwrap_or_else(|| sibling(input, "displacement"));
    write_displacement(&displacement, &track.displacement)?;
    if let Some(path) = complex {
        write_complex(path, &track.pairs)?;
    }
    Ok(())
}

/// `iq.txt` -> `iq-<suffix>.txt` next to it
fn sibling(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map_or_else(|| "session".into(), |s| s.to_string_lossy());
    input.with_file_name(format!("{stem}-{suffix}.txt"))
}
