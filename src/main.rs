//! Command line entry point: parses a `.torrent` file, downloads it to a
//! directory, and exits.

use std::process;

use clap::{App, Arg};
use cratetorrent_leech::{Conf, Engine};

fn main() {
    let matches = App::new("cratetorrent-leech")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Downloads the single file described by a .torrent, then exits")
        .arg(
            Arg::with_name("file")
                .short("f")
                .long("file")
                .value_name("PATH")
                .help("Path to the .torrent metainfo file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("out")
                .short("o")
                .long("out")
                .value_name("DIR")
                .help("Directory the downloaded file is written into")
                .default_value(".")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Increases log verbosity, repeatable (-v, -vv, -vvv)")
                .multiple(true),
        )
        .get_matches();

    let verbosity = matches.occurrences_of("verbose");
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let torrent_path = matches.value_of("file").expect("required arg");
    let download_dir = matches.value_of("out").expect("has default");

    let metainfo = match cratetorrent_leech::metainfo::Metainfo::from_path(torrent_path) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    log::info!("Loaded torrent: {}", metainfo);

    let conf = Conf::new(download_dir);
    let engine = Engine::new(conf);

    let mut runtime = match tokio::runtime::Builder::new()
        .threaded_scheduler()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: could not start async runtime: {}", e);
            process::exit(1);
        }
    };

    match runtime.block_on(engine.run(metainfo)) {
        Ok(cratetorrent_leech::engine::DownloadOutcome::Completed) => {
            log::info!("Download complete");
            process::exit(0);
        }
        Ok(cratetorrent_leech::engine::DownloadOutcome::Interrupted) => {
            log::info!("Interrupted, exiting after cleanup");
            process::exit(130);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}
